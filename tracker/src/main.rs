//! satwatch: track satellite passes with an Origin telescope
//!
//! Usage: `satwatch [config.json]`

mod config;

use anyhow::Context;
use config::TrackerConfig;
use satwatch_origin::{HealthMonitor, OriginClient};
use satwatch_sequencer::{
    FileTrajectorySource, OriginScopeOps, PassExecutor, PassScheduler, PassSession, PlanArtifacts, SharedClock,
    SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => TrackerConfig::load(&path)?,
        None => TrackerConfig::default(),
    };
    let _log_guard = init_logging(config.log_dir.as_deref());
    tracing::info!("satwatch {} starting", env!("CARGO_PKG_VERSION"));

    let source = FileTrajectorySource::load(&config.trajectories_path)
        .await
        .context("loading trajectories")?;
    let catalog = config.catalog_or(source.object_ids());
    tracing::info!("Catalog: {} object(s)", catalog.len());

    let client = OriginClient::websocket(config.origin.clone());
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.origin.host))?;

    let monitor = HealthMonitor::new(client.clone(), config.monitor.clone());
    let reporter = monitor.error_reporter();
    let report = monitor.check_once().await;
    if report.all_healthy() {
        tracing::info!("All subsystems healthy");
    } else {
        for subsystem in report.failing() {
            tracing::warn!(
                "Subsystem {} unhealthy: {}",
                subsystem.name,
                subsystem.last_error.as_deref().unwrap_or("no response")
            );
        }
    }
    let monitor_task = monitor.spawn();

    let clock: SharedClock = Arc::new(SystemClock);
    let ops = Arc::new(OriginScopeOps::new(client.clone())?);
    let executor = PassExecutor::new(ops, clock.clone(), config.executor.clone()).with_error_reporter(reporter);
    let scheduler = PassScheduler::new(Arc::new(source), config.scheduler.clone());
    let session = PassSession::new(scheduler, executor, clock)
        .with_artifacts(PlanArtifacts::new(&config.plan_path, &config.plan_trajectories_path));

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, stopping"),
            Err(e) => tracing::error!("Cannot listen for Ctrl-C: {}", e),
        }
        cancel.cancel();
    });

    session.run(&catalog).await;

    monitor_task.abort();
    client.disconnect().await;
    let stats = client.stats();
    tracing::info!(
        "Disconnected after {} connection(s), {} reconnection(s), {} error(s) logged",
        stats.successful_connections,
        stats.reconnections,
        stats.error_log.len()
    );
    Ok(())
}

/// Console logging, plus daily rolling files when a directory is given
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false);

    let file = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            "satwatch.log",
        ))),
        Err(e) => {
            eprintln!("Failed to create log directory {}: {}", dir.display(), e);
            None
        }
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            None
        }
    }
}
