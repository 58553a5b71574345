//! Classification-to-enforcement pipeline
//!
//! Wires the preprocessor, the classifier adapter, the offender tracker and
//! the enforcement queue. A batch is preprocessed, scored in chunks on a
//! bounded pool of blocking tasks, then fed to the tracker in record order.
//! Decisions go to the enforcement queue and never wait on the firewall.

mod sweeper;


pub use sweeper::ExpirySweeper;

use crate::classifier::{score, BinaryClassifier, ClassifierAdapter};
use crate::enforcement::EnforcerHandle;
use crate::error::{ClassifyError, PipelineError};
use crate::health::{Component, HealthRegistry};
use crate::models::{Decision, FeatureVector, OffenderKey, Verdict};
use crate::observability::{GuardMetrics, StructuredLogger};
use crate::preprocess::{FlowTable, Preprocessor};
use crate::tracker::OffenderTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Configuration for batch scoring
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of chunks scored at once
    pub scoring_workers: usize,
    /// Flows per scoring chunk
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scoring_workers: 4,
            chunk_size: 1024,
        }
    }
}

/// Summary of one processed flow table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub flows: usize,
    pub attacks: usize,
    pub skipped: usize,
    /// Offenders banned while processing this batch
    pub banned: Vec<OffenderKey>,
    /// Decisions the enforcement queue refused
    pub enforcement_errors: usize,
}

pub struct Pipeline {
    preprocessor: Preprocessor,
    classifier: Arc<ClassifierAdapter>,
    tracker: Arc<OffenderTracker>,
    enforcer: EnforcerHandle,
    metrics: GuardMetrics,
    logger: StructuredLogger,
    config: PipelineConfig,
    health: Option<HealthRegistry>,
}

impl Pipeline {
    pub fn new(
        classifier: Arc<ClassifierAdapter>,
        tracker: Arc<OffenderTracker>,
        enforcer: EnforcerHandle,
        metrics: GuardMetrics,
        logger: StructuredLogger,
        config: PipelineConfig,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(),
            classifier,
            tracker,
            enforcer,
            metrics,
            logger,
            config,
            health: None,
        }
    }

    /// Report classifier health to a registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn tracker(&self) -> &Arc<OffenderTracker> {
        &self.tracker
    }

    pub fn classifier(&self) -> &Arc<ClassifierAdapter> {
        &self.classifier
    }

    pub fn enforcer(&self) -> &EnforcerHandle {
        &self.enforcer
    }

    /// Preprocess, score and track one flow table
    pub async fn process_table(&self, table: &FlowTable) -> Result<BatchReport, PipelineError> {
        let start = Instant::now();
        match self.score_and_track(table).await {
            Ok(report) => {
                let elapsed = start.elapsed();
                self.metrics.observe_scoring_latency(elapsed.as_secs_f64());
                self.logger
                    .log_batch(report.flows, report.attacks, report.skipped, elapsed.as_millis());
                if let Some(health) = &self.health {
                    health.set_healthy(Component::Classifier).await;
                }
                Ok(report)
            }
            Err(e) => {
                self.metrics.inc_batch_errors();
                self.logger.log_batch_refused(&e.to_string());
                if let (Some(health), PipelineError::Classify(_)) = (&self.health, &e) {
                    health
                        .set_unhealthy(Component::Classifier, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn score_and_track(&self, table: &FlowTable) -> Result<BatchReport, PipelineError> {
        let batch = self.preprocessor.preprocess(table)?;
        self.metrics.add_preprocess_errors(batch.skipped as u64);

        let mut report = BatchReport {
            flows: batch.len(),
            skipped: batch.skipped,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let model = self.classifier.current().ok_or(ClassifyError::Uninitialized)?;
        if batch.feature_width() != model.feature_width() {
            return Err(ClassifyError::WidthMismatch {
                expected: model.feature_width(),
                found: batch.feature_width(),
            }
            .into());
        }

        let verdicts = self.score_all(model, batch.features).await?;

        for (metadata, verdict) in batch.metadata.iter().zip(verdicts) {
            if verdict.is_attack() {
                report.attacks += 1;
            }
            let decision = self.tracker.record_flow(verdict, metadata);
            if let Decision::Ban(offender) = &decision {
                report.banned.push(offender.key);
            }
            if !self.dispatch(decision) {
                report.enforcement_errors += 1;
            }
        }

        self.metrics.add_flows_scored(
            (report.flows - report.attacks) as u64,
            report.attacks as u64,
        );
        let stats = self.tracker.stats();
        self.metrics.set_offender_counts(stats.tracked, stats.banned);
        Ok(report)
    }

    /// Score every vector, preserving input order
    async fn score_all(
        &self,
        model: Arc<dyn BinaryClassifier>,
        features: Vec<FeatureVector>,
    ) -> Result<Vec<Verdict>, PipelineError> {
        let chunk_size = self.config.chunk_size.max(1);
        let features = Arc::new(features);
        let chunk_count = (features.len() + chunk_size - 1) / chunk_size;
        let permits = Arc::new(Semaphore::new(self.config.scoring_workers.max(1)));
        let mut tasks = JoinSet::new();

        for index in 0..chunk_count {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
            let model = model.clone();
            let features = features.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let start = index * chunk_size;
                let end = (start + chunk_size).min(features.len());
                let verdicts: Result<Vec<Verdict>, ClassifyError> = features[start..end]
                    .iter()
                    .map(|fv| score(model.as_ref(), fv))
                    .collect();
                (index, verdicts)
            });
        }

        let mut chunks: Vec<Vec<Verdict>> = vec![Vec::new(); chunk_count];
        while let Some(joined) = tasks.join_next().await {
            let (index, verdicts) = joined.map_err(|e| PipelineError::Worker(e.to_string()))?;
            chunks[index] = verdicts?;
        }
        debug!(chunks = chunk_count, "Batch scored");
        Ok(chunks.into_iter().flatten().collect())
    }

    /// Lift every expired ban and queue its removal
    pub fn sweep_expired(&self) -> Vec<Decision> {
        let decisions = self.tracker.sweep_expired();
        for decision in &decisions {
            self.dispatch(decision.clone());
        }
        if !decisions.is_empty() {
            let stats = self.tracker.stats();
            self.metrics.set_offender_counts(stats.tracked, stats.banned);
        }
        decisions
    }

    /// Lift one ban by hand
    pub fn lift(&self, key: &OffenderKey) -> Decision {
        let decision = self.tracker.lift(key);
        self.dispatch(decision.clone());
        decision
    }

    /// Log, count and enqueue a decision. Returns false if the queue refused it.
    fn dispatch(&self, decision: Decision) -> bool {
        if !decision.is_action() {
            return true;
        }
        self.metrics.inc_decision(&decision);
        self.logger.log_decision(&decision);
        match self.enforcer.dispatch(decision) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Enforcement queue refused decision");
                false
            }
        }
    }
}
