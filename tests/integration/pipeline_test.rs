//! End-to-end pipeline tests against the in-memory execution source.

use chrono::NaiveDate;
use monthly_extract::db::{ColumnInfo, MockDatabaseClient, QueryResult, Value};
use monthly_extract::executor::ExecutorOptions;
use monthly_extract::period::{self, Locale};
use monthly_extract::pipeline::{FailureStage, Pipeline, RunStatus};
use monthly_extract::registry::QueryRegistry;
use monthly_extract::writer::ArtifactWriter;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const REGISTRY: &str = r#"
[[query]]
name = "Cupons Ativos"
sql = "SELECT COUNT(*) AS cupons_ativos FROM mobits_api_cupons"

[[query]]
name = "Vendas/Loja: Top 10"
sql = "SELECT loja, SUM(valor) AS total FROM vendas GROUP BY loja ORDER BY 2 DESC LIMIT 10"

[[query]]
name = "Sem Movimento"
sql = "SELECT loja FROM vendas WHERE valor < 0"
"#;

fn mock_source() -> MockDatabaseClient {
    MockDatabaseClient::new()
        .with_table(
            "SELECT COUNT(*) AS cupons_ativos FROM mobits_api_cupons",
            QueryResult::with_data(
                vec![ColumnInfo::new("cupons_ativos", "INT8")],
                vec![vec![Value::Int(412)]],
            ),
        )
        .with_table(
            "SELECT loja, SUM(valor) AS total FROM vendas GROUP BY loja ORDER BY 2 DESC LIMIT 10",
            QueryResult::with_data(
                vec![
                    ColumnInfo::new("loja", "TEXT"),
                    ColumnInfo::new("total", "NUMERIC"),
                ],
                vec![
                    vec![Value::from("Loja Centro"), Value::Float(98_120.5)],
                    vec![Value::from("Loja Norte"), Value::Float(71_004.0)],
                ],
            ),
        )
        .with_table(
            "SELECT loja FROM vendas WHERE valor < 0",
            QueryResult::empty_with_columns(vec![ColumnInfo::new("loja", "TEXT")]),
        )
}

fn is_xlsx(path: &Path) -> bool {
    fs::read(path)
        .map(|bytes| bytes.starts_with(b"PK"))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_run_writes_one_artifact_per_query() {
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::parse_toml(REGISTRY).unwrap();
    registry.ensure_read_only().unwrap();
    let reference = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
    let period = period::resolve(reference, 1, Locale::PtBr).unwrap();

    let mut pipeline = Pipeline::new(
        Arc::new(mock_source()),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::default(),
    );
    let summary = pipeline.run(&registry, &period).await.unwrap();

    assert_eq!(summary.status(), RunStatus::Success);
    let folder = root.path().join("junho'25");
    assert_eq!(summary.folder, folder);

    let mut files: Vec<String> = fs::read_dir(&folder)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            "Cupons Ativos_2025-06.xlsx",
            "Sem Movimento_2025-06.xlsx",
            "Vendas-Loja- Top 10_2025-06.xlsx",
        ]
    );
    for path in summary.artifacts.values() {
        assert!(is_xlsx(path), "not a workbook: {}", path.display());
    }
}

#[tokio::test]
async fn test_rerun_reuses_folder_and_overwrites_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::parse_toml(REGISTRY).unwrap();
    let period = period::resolve(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), 1, Locale::PtBr)
        .unwrap();

    let mut pipeline = Pipeline::new(
        Arc::new(mock_source()),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::new(2, None),
    );
    let first = pipeline.run(&registry, &period).await.unwrap();
    let second = pipeline.run(&registry, &period).await.unwrap();

    assert_eq!(first.folder, second.folder);
    assert_eq!(first.artifacts, second.artifacts);
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    assert_eq!(fs::read_dir(&second.folder).unwrap().count(), 3);
    assert!(second.folder.ends_with("dezembro'24"));
}

#[tokio::test]
async fn test_failed_query_still_yields_the_others() {
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::parse_toml(REGISTRY).unwrap();
    let period = period::resolve(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 1, Locale::En)
        .unwrap();
    let source = mock_source().with_failure(
        "SELECT loja FROM vendas WHERE valor < 0",
        "canceling statement due to statement timeout",
    );

    let mut pipeline = Pipeline::new(
        Arc::new(source),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::default(),
    );
    let summary = pipeline.run(&registry, &period).await.unwrap();

    assert_eq!(summary.status(), RunStatus::Partial);
    assert_eq!(summary.succeeded, vec!["Cupons Ativos", "Vendas/Loja: Top 10"]);
    assert_eq!(summary.failed["Sem Movimento"].stage, FailureStage::Execution);
    assert!(root.path().join("june'25").is_dir());
}

#[tokio::test]
async fn test_selected_subset_runs_alone() {
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::parse_toml(REGISTRY)
        .unwrap()
        .select(&["Cupons Ativos"])
        .unwrap();
    let period = period::resolve(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 1, Locale::PtBr)
        .unwrap();
    let source = Arc::new(mock_source());

    let mut pipeline = Pipeline::new(
        source.clone(),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::default(),
    );
    let summary = pipeline.run(&registry, &period).await.unwrap();

    assert_eq!(summary.succeeded, vec!["Cupons Ativos"]);
    assert_eq!(source.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_reported_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::parse_toml(REGISTRY).unwrap();
    let period = period::resolve(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 1, Locale::PtBr)
        .unwrap();
    let source = Arc::new(mock_source().with_delay(
        "SELECT COUNT(*) AS cupons_ativos FROM mobits_api_cupons",
        Duration::from_secs(3600),
    ));

    let mut pipeline = Pipeline::new(
        source.clone(),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::new(4, Some(Duration::from_secs(60))),
    );
    let summary = pipeline.run(&registry, &period).await.unwrap();

    let failure = &summary.failed["Cupons Ativos"];
    assert_eq!(failure.stage, FailureStage::Execution);
    assert!(failure.message.contains("timed out"));
    assert_eq!(source.call_count(), 3);
    assert_eq!(summary.artifacts.len(), 2);
}
