//! monthly-extract - concurrent monthly metrics extraction.

use anyhow::{Context, Result};
use chrono::Local;
use monthly_extract::cli::{exit_code, Cli, Command, RunArgs, SourceArgs};
use monthly_extract::config::Config;
use monthly_extract::db::{self, DatabaseClient, MockDatabaseClient};
use monthly_extract::error::ReportError;
use monthly_extract::executor::ExecutorOptions;
use monthly_extract::logging;
use monthly_extract::period::{self, ReportingPeriod};
use monthly_extract::pipeline::Pipeline;
use monthly_extract::preflight::{self, PreflightReport};
use monthly_extract::registry::QueryRegistry;
use monthly_extract::writer::ArtifactWriter;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; the environment may already be set
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors exit 1, help and version exit 0
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<ReportError>() {
                Some(err) if err.is_fatal() => {
                    error!(category = err.category(), "{e:#}");
                    eprintln!("{}: {e:#}", err.category());
                }
                _ => {
                    error!("Unexpected failure: {e:#}");
                    eprintln!("Error: {e:#}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command() {
        Command::Run(args) => run_extraction(&args).await,
        Command::Check(args) => run_check(&args).await,
        Command::List(args) => list_queries(&args),
    }
}

/// Loads the config file, applies CLI overrides, then environment fallbacks.
fn load_config(
    source: &SourceArgs,
    apply: impl FnOnce(&mut Config) -> monthly_extract::error::Result<()>,
) -> Result<Config> {
    let path = source.config_path();
    let mut config = Config::load_from_file(&path)?;
    apply(&mut config)?;
    config.finalize()?;

    if let Some(log_file) = logging::init(config.logging.file.as_deref()) {
        info!("Logging to {}", log_file.display());
    }
    info!("Config: {}", path.display());
    Ok(config)
}

fn resolve_period(source: &SourceArgs, config: &Config) -> Result<ReportingPeriod> {
    let reference = source
        .reference
        .unwrap_or_else(|| Local::now().date_naive());
    let period = period::resolve(reference, config.export.month_offset, config.export.locale)?;
    Ok(period)
}

async fn open_source(
    config: &Config,
    mock_db: bool,
) -> monthly_extract::error::Result<Arc<dyn DatabaseClient>> {
    if mock_db {
        warn!("Using in-memory execution source; results are placeholders, not database data");
        return Ok(Arc::new(MockDatabaseClient::new()));
    }
    info!("Connecting to {}", config.database.display_string());
    db::connect(&config.database).await
}

fn load_registry(config: &Config, only: &[String]) -> Result<QueryRegistry> {
    let path = config.queries_path();
    let mut registry = QueryRegistry::load_from_file(&path)?;
    if !only.is_empty() {
        registry = registry.select(only)?;
    }
    if config.queries.enforce_read_only {
        registry.ensure_read_only()?;
    }
    info!("{} queries from {}", registry.len(), path.display());
    Ok(registry)
}

async fn run_extraction(args: &RunArgs) -> Result<ExitCode> {
    let config = load_config(&args.source, |config| args.apply(config))?;
    let period = resolve_period(&args.source, &config)?;
    let registry = load_registry(&config, &args.only)?;
    let root = config.export.require_root()?;

    let source = open_source(&config, args.source.mock_db)
        .await
        .context("Execution source unavailable")?;

    let options = ExecutorOptions::new(
        config.execution.max_workers,
        config.execution.task_timeout(),
    );
    let mut pipeline = Pipeline::new(source.clone(), ArtifactWriter::new(root), options);
    let result = pipeline.run(&registry, &period).await;

    if let Err(e) = source.close().await {
        warn!("Failed to close execution source: {e}");
    }
    let summary = result.context("Run aborted")?;

    if args.json {
        let mut value = serde_json::to_value(&summary)?;
        value["status"] = serde_json::to_value(summary.status())?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", summary.render_text());
    }

    Ok(exit_code(summary.status()))
}

async fn run_check(args: &SourceArgs) -> Result<ExitCode> {
    let config = load_config(args, |config| args.apply(config))?;
    let period = resolve_period(args, &config)?;
    let writer = ArtifactWriter::new(config.export.require_root()?);

    let mut report = PreflightReport::new(period, writer.period_dir(&period));
    report.push(preflight::check_output_folder(&writer, &period));

    let registry = QueryRegistry::load_from_file(&config.queries_path());
    report.push(preflight::check_registry(
        &registry,
        config.queries.enforce_read_only,
    ));

    let source = open_source(&config, args.mock_db).await;
    report.push(preflight::check_source(&source).await);
    if let Ok(source) = &source {
        if let Err(e) = source.close().await {
            warn!("Failed to close execution source: {e}");
        }
    }

    println!("{}", report.render_text());
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_queries(args: &SourceArgs) -> Result<ExitCode> {
    let config = load_config(args, |config| args.apply(config))?;
    let registry = QueryRegistry::load_from_file(&config.queries_path())?;

    for (id, (task, classification)) in registry.classify().into_iter().enumerate() {
        let marker = if classification.is_read_only() {
            ""
        } else {
            "  (rejected)"
        };
        println!(
            "{:>3}. {} [{}]{marker}",
            id + 1,
            task.name,
            classification.statement_type
        );
    }
    if registry.is_empty() {
        println!("No queries in {}", config.queries_path().display());
    }
    Ok(ExitCode::SUCCESS)
}
