//! FlowGuard Agent - network flow anomaly response
//!
//! Watches the flow exporter's CSV output, classifies every flow, tracks
//! offending sources and blocks them at the host firewall.

use anyhow::{Context, Result};
use guard_lib::{
    classifier::{ClassifierAdapter, FsModelStore},
    enforcement::EnforcementWorker,
    firewall::create_backend,
    health::HealthRegistry,
    ingest::{CsvFileSource, IngestLoop},
    observability::{GuardMetrics, StructuredLogger},
    pipeline::{ExpirySweeper, Pipeline},
    tracker::{OffenderTracker, SystemClock},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting flowguard-agent");

    let config = config::AgentConfig::load()?;
    info!(
        host = %config.host_name,
        flow_path = ?config.flow_path,
        backend = %config.backend,
        naughty_count = config.naughty_count,
        ban_duration_minutes = config.ban_duration_minutes,
        "Agent configured"
    );

    // Every component starts healthy; readiness waits for set_ready
    let health_registry = HealthRegistry::new();

    let metrics = GuardMetrics::new();
    let logger = StructuredLogger::new(&config.host_name);

    // Model: primary, then fallback, otherwise refuse to start
    let classifier = Arc::new(ClassifierAdapter::new_uninitialized());
    let store = FsModelStore::new(&config.model_dir);
    let model_version = load_model(&classifier, &store, &config, &logger)?;
    metrics.set_model_version(&model_version);

    let backend = create_backend(config.backend, &config.interface)
        .context("Failed to initialize firewall backend")?;
    let backend_name = backend.name();

    let tracker = Arc::new(OffenderTracker::new(
        config.tracker_config(),
        Arc::new(SystemClock),
    ));

    let (worker, enforcer) = EnforcementWorker::new(
        backend,
        tracker.clone(),
        config.enforcement_config(),
        metrics.clone(),
        logger.clone(),
    );
    let worker = worker.with_health(health_registry.clone());

    let pipeline = Arc::new(
        Pipeline::new(
            classifier,
            tracker,
            enforcer,
            metrics.clone(),
            logger.clone(),
            config.pipeline_config(),
        )
        .with_health(health_registry.clone()),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

    let ingest = IngestLoop::new(
        Box::new(CsvFileSource::new(&config.flow_path)),
        pipeline.clone(),
        config.poll_interval(),
    )
    .with_health(health_registry.clone());
    let ingest_handle = tokio::spawn(ingest.run(shutdown_tx.subscribe()));

    let sweeper = ExpirySweeper::new(pipeline.clone(), config.sweep_interval());
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        pipeline,
        config.host_name.clone(),
        backend_name,
    ));

    health_registry.set_ready(true).await;
    logger.log_startup(AGENT_VERSION, &model_version, backend_name);

    // Start health, metrics and status server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    if shutdown_tx.send(()).is_err() {
        warn!("No running tasks to notify of shutdown");
    }
    for (name, handle) in [("ingest", ingest_handle), ("sweeper", sweeper_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    // The worker drains outstanding firewall changes before returning
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Enforcement worker ended abnormally");
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Install the primary model, or the fallback if the primary is unusable
fn load_model(
    classifier: &ClassifierAdapter,
    store: &FsModelStore,
    config: &config::AgentConfig,
    logger: &StructuredLogger,
) -> Result<String> {
    let mut candidates = vec![(config.model_name.as_str(), false)];
    if let Some(fallback) = &config.fallback_model_name {
        candidates.push((fallback.as_str(), true));
    }

    for (name, fallback) in candidates {
        match classifier.load(store, name, None) {
            Ok(model) => {
                logger.log_model_loaded(name, &model.version, fallback);
                return Ok(model.version.clone());
            }
            Err(e) => logger.log_model_load_failed(name, &e.to_string()),
        }
    }

    anyhow::bail!("No usable model found in {:?}", store.model_dir())
}
