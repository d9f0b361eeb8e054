mod cache;
mod compiler;
mod config;
mod discovery;
mod engine;
mod evaluator;
mod executor;
mod report;

use anyhow::Context;
use cache::FsArtifactCache;
use compiler::CommandCompiler;
use config::ConfigManager;
use executor::Orchestrator;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

pub const LOG_FORMAT_ENV: &str = "XVAL_LOG_FORMAT";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("xval worker booting...");

    let config_manager = ConfigManager::load_default().map_err(|e| {
        error!("Failed to load grader configuration: {:#}", e);
        error!("Set XVAL_CONFIG or provide config/grader.json");
        e
    })?;
    match config_manager.source() {
        Some(path) => info!(config = %path.display(), "Loaded grader configuration"),
        None => info!("Using built-in grader configuration"),
    }

    let config = config_manager.config().clone();
    let results_dir = config.layout.results_dir.clone();
    let bundle_dir = config.layout.cache_dir.join("bundles");

    let cache = FsArtifactCache::new(&bundle_dir)
        .with_context(|| format!("Failed to open bundle cache at {}", bundle_dir.display()))?;
    let compiler = CommandCompiler::new(config.compiler.clone());
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(compiler),
        Arc::new(cache),
        config_manager.max_parallel_jobs(),
    )?;

    orchestrator.reset_results().await?;

    let summary = tokio::select! {
        summary = orchestrator.grade() => summary?,
        _ = signal::ctrl_c() => {
            // in-flight children are killed on drop; their slots keep the provisional result
            warn!("Received shutdown signal; stopping before all jobs finished");
            std::process::exit(130);
        }
    };

    let (report, report_path) = report::write_report(&results_dir)?;
    report.log_summary();
    info!(
        jobs = summary.results.len(),
        cache_hits = summary.cache_hits,
        compiles = summary.compiles,
        elapsed_ms = summary.elapsed_ms,
        report = %report_path.display(),
        "Grading complete"
    );

    if summary.has_operator_errors() {
        for message in &summary.operator_errors {
            error!(error = %message, "Grader failure");
        }
        error!(
            count = summary.operator_errors.len(),
            "Grading finished with grader failures; check the runtime and compiler configuration"
        );
        std::process::exit(1);
    }

    Ok(())
}
