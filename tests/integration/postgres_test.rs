//! PostgreSQL execution source tests.
//!
//! Skipped unless DATABASE_URL points at a reachable database.

use chrono::NaiveDate;
use monthly_extract::config::{Config, ConnectionConfig};
use monthly_extract::db::{self, DatabaseClient, PostgresClient, Value};
use monthly_extract::error::ReportError;
use monthly_extract::executor::{execute_all, ExecutorOptions};
use monthly_extract::period::{self, Locale};
use monthly_extract::pipeline::{FailureStage, Pipeline, RunStatus};
use monthly_extract::registry::{QueryRegistry, QueryTask};
use monthly_extract::writer::ArtifactWriter;
use std::sync::Arc;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to create a test client.
async fn get_test_client() -> Option<PostgresClient> {
    let url = get_test_database_url()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    PostgresClient::connect(&config).await.ok()
}

#[tokio::test]
async fn test_concurrent_queries_share_the_pool() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let client = Arc::new(client);

    let queries = (0..8).map(|i| {
        let client = client.clone();
        async move { client.execute_query(&format!("SELECT {i}::int8 AS n")).await }
    });
    let results = futures::future::join_all(queries).await;

    for (i, result) in results.into_iter().enumerate() {
        let table = result.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int(i as i64)]]);
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_against_postgres() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let root = tempfile::tempdir().unwrap();
    let registry = QueryRegistry::new(vec![
        QueryTask::new(
            "Serie",
            "SELECT g AS n, g * 1.5 AS metade FROM generate_series(1, 20) AS g",
        ),
        QueryTask::new("Vazia", "SELECT g AS n FROM generate_series(1, 0) AS g"),
        QueryTask::new("Quebrada", "SELECT * FROM monthly_extract_missing_table"),
        QueryTask::new("Enderecos", "SELECT '192.168.0.1'::inet AS ip"),
    ])
    .unwrap();
    registry.ensure_read_only().unwrap();
    let period = period::resolve(NaiveDate::from_ymd_opt(2025, 7, 15).unwrap(), 1, Locale::PtBr)
        .unwrap();

    let source: Arc<dyn DatabaseClient> = Arc::new(client);
    let mut pipeline = Pipeline::new(
        source.clone(),
        ArtifactWriter::new(root.path()),
        ExecutorOptions::new(2, None),
    );
    let summary = pipeline.run(&registry, &period).await.unwrap();
    source.close().await.unwrap();

    assert_eq!(summary.status(), RunStatus::Partial);
    assert_eq!(summary.succeeded, vec!["Serie", "Vazia"]);
    assert_eq!(summary.failed["Quebrada"].stage, FailureStage::Execution);
    assert_eq!(summary.failed["Enderecos"].stage, FailureStage::Write);
    assert!(!root.path().join("junho'25").join("Enderecos_2025-06.xlsx").exists());
    assert!(summary.artifacts["Vazia"].is_file());
}

#[tokio::test]
async fn test_query_error_is_a_query_error() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let err = client
        .execute_query("SELECT * FROM monthly_extract_missing_table")
        .await
        .unwrap_err();
    assert!(matches!(err, ReportError::Query(_)));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_workers_beyond_configured_pool_wait_for_a_connection() {
    let Some(url) = get_test_database_url() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let mut config = Config::default();
    config.database = ConnectionConfig::from_connection_string(&url).unwrap();
    config.database.pool_size = 2;
    config.database.acquire_timeout_secs = 1;
    config.execution.max_workers = 4;
    config.finalize().unwrap();
    assert_eq!(config.database.pool_size, 4);

    let source = db::connect(&config.database).await.unwrap();
    let tasks: Vec<QueryTask> = (0..4)
        .map(|i| QueryTask::new(format!("q{i}"), format!("SELECT {i} AS n FROM pg_sleep(2)")))
        .collect();
    let options = ExecutorOptions::new(config.execution.max_workers, None);
    let outcomes = execute_all(&tasks, source.clone(), &options).await;
    source.close().await.unwrap();

    for outcome in outcomes.iter() {
        assert!(outcome.is_success(), "{}: {:?}", outcome.name, outcome.error());
    }
}
