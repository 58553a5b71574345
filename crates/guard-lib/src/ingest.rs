//! Flow ingestion loop
//!
//! Polls a [`FlowSource`] on a fixed interval and hands every new flow table
//! to the pipeline. A failed poll or a refused batch is logged and the loop
//! carries on with the next tick.

use crate::health::{Component, HealthRegistry};
use crate::pipeline::Pipeline;
use crate::preprocess::FlowTable;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Producer of flow tables
///
/// Sources live inside an [`IngestLoop`] that is spawned onto the runtime,
/// so they must be shareable across threads.
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// Next unseen table, or `None` when nothing new is available yet
    async fn next_batch(&mut self) -> Result<Option<FlowTable>>;
}

/// Re-reads one CSV file whenever it changes on disk
pub struct CsvFileSource {
    path: PathBuf,
    /// Modification time and length of the last table read
    last_seen: Option<(SystemTime, u64)>,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FlowSource for CsvFileSource {
    async fn next_batch(&mut self) -> Result<Option<FlowTable>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "Flow file not present yet");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat flow file {:?}", self.path))
            }
        };

        let fingerprint = (
            metadata
                .modified()
                .with_context(|| format!("No modification time for {:?}", self.path))?,
            metadata.len(),
        );
        if self.last_seen == Some(fingerprint) {
            return Ok(None);
        }

        let path = self.path.clone();
        let table = tokio::task::spawn_blocking(move || FlowTable::from_csv_path(&path))
            .await
            .context("Flow file reader task failed")??;

        self.last_seen = Some(fingerprint);
        debug!(path = ?self.path, rows = table.len(), "Read flow table");
        Ok(Some(table))
    }
}

/// Feeds a flow source into the pipeline until shutdown
pub struct IngestLoop {
    source: Box<dyn FlowSource>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    health: Option<HealthRegistry>,
}

impl IngestLoop {
    pub fn new(source: Box<dyn FlowSource>, pipeline: Arc<Pipeline>, poll_interval: Duration) -> Self {
        Self {
            source,
            pipeline,
            poll_interval,
            health: None,
        }
    }

    /// Report ingest health to a registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Starting flow ingest loop"
        );

        let mut ticker = interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batches = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.poll().await {
                        batches += 1;
                    }
                }
                _ = shutdown.recv() => {
                    info!(batches, "Shutting down flow ingest loop");
                    break;
                }
            }
        }
    }

    /// One poll of the source. Returns true if a batch was processed.
    async fn poll(&mut self) -> bool {
        let table = match self.source.next_batch().await {
            Ok(Some(table)) => table,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to read flow source");
                self.set_health(Some(format!("flow source unreadable: {}", e))).await;
                return false;
            }
        };

        match self.pipeline.process_table(&table).await {
            Ok(report) => {
                debug!(
                    flows = report.flows,
                    attacks = report.attacks,
                    banned = report.banned.len(),
                    "Flow table processed"
                );
                self.set_health(None).await;
                true
            }
            Err(e) => {
                self.set_health(Some(format!("last batch refused: {}", e))).await;
                false
            }
        }
    }

    async fn set_health(&self, problem: Option<String>) {
        if let Some(health) = &self.health {
            match problem {
                None => health.set_healthy(Component::Ingest).await,
                Some(message) => health.set_degraded(Component::Ingest, message).await,
            }
        }
    }
}
