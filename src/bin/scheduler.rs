//! splitsight scheduler binary
//!
//! Runs the recurring refresh scan and the refresh workers.

use splitsight::adapter::{AdapterFactory, PlaintextDecryptor};
use splitsight::clock::{BoundedClock, Clock};
use splitsight::config::{ComponentFactory, EngineConfig};
use splitsight::metadata::MetadataClient;
use splitsight::model::{Dashboard, DataSource, Experiment, MetricDefinition};
use splitsight::orchestrator::{SnapshotOrchestrator, SummaryStatistics};
use splitsight::scheduler::{LocalJobQueue, LogNotifier, RefreshScheduler};
use splitsight::telemetry::Telemetry;
use splitsight::tracker::QueryTracker;

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

/// splitsight refresh scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of refresh workers (overrides SPLITSIGHT_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Scan interval, e.g. "10 minutes" (overrides SPLITSIGHT_SCAN_INTERVAL)
    #[arg(long)]
    scan_interval: Option<String>,

    /// JSON file of experiments, metrics, data sources and dashboards to
    /// load into the metadata store at startup
    #[arg(long, env = "SPLITSIGHT_FIXTURES")]
    fixtures: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct Fixtures {
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    metrics: Vec<MetricDefinition>,
    #[serde(default)]
    datasources: Vec<DataSource>,
    #[serde(default)]
    dashboards: Vec<Dashboard>,
}

async fn load_fixtures(metadata: &dyn MetadataClient, path: &Path) -> splitsight::Result<()> {
    let raw = tokio::fs::read(path).await?;
    let fixtures: Fixtures = serde_json::from_slice(&raw)?;
    for datasource in &fixtures.datasources {
        metadata.put_datasource(datasource).await?;
    }
    for metric in &fixtures.metrics {
        metadata.put_metric(metric).await?;
    }
    for experiment in &fixtures.experiments {
        metadata.put_experiment(experiment).await?;
    }
    for dashboard in &fixtures.dashboards {
        metadata.put_dashboard(dashboard).await?;
    }
    info!(
        path = %path.display(),
        experiments = fixtures.experiments.len(),
        dashboards = fixtures.dashboards.len(),
        "Loaded fixtures"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init_for_component("splitsight-scheduler", &args.log_level)?;

    info!("Starting splitsight scheduler");

    let mut config = EngineConfig::from_env()?;
    if let Some(workers) = args.workers {
        config.queue.workers = workers;
    }
    if let Some(interval) = &args.scan_interval {
        config.scheduler.scan_interval = splitsight::scheduler::parse_interval(interval)?;
    }
    config.validate()?;

    let object_store = ComponentFactory::create_object_store().await?;
    let metadata = ComponentFactory::create_metadata_client(object_store).await?;
    if let Some(path) = &args.fixtures {
        load_fixtures(metadata.as_ref(), path).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(BoundedClock::new());
    let adapters = Arc::new(AdapterFactory::new(Arc::new(PlaintextDecryptor)));
    let tracker = Arc::new(QueryTracker::new(
        metadata.clone(),
        clock.clone(),
        config.tracker.clone(),
    )?);
    let orchestrator = Arc::new(SnapshotOrchestrator::new(
        metadata,
        adapters,
        tracker,
        Arc::new(SummaryStatistics),
        clock.clone(),
        config.orchestrator.clone(),
    )?);

    let queue = LocalJobQueue::new(config.queue.clone(), clock)?;
    let scheduler = Arc::new(RefreshScheduler::new(
        orchestrator,
        Arc::new(queue.clone()),
        Arc::new(LogNotifier),
        config.scheduler.clone(),
    )?);
    scheduler.install(&queue).await?;

    info!(
        workers = config.queue.workers,
        scan_interval = %humantime::format_duration(config.scheduler.scan_interval),
        liveness_threshold = %humantime::format_duration(config.tracker.liveness_threshold),
        "Scheduler ready"
    );

    let shutdown = queue.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });
    queue.run().await;

    info!("Scheduler shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
