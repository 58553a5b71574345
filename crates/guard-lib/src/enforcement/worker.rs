//! Enforcement worker loop

use super::{EnforcementAction, EnforcementConfig, EnforcerHandle, Ledger, Sequenced};
use crate::error::{FirewallError, TrackerInvariantError};
use crate::firewall::FirewallBackend;
use crate::health::{Component, HealthRegistry};
use crate::models::{Offender, OffenderKey};
use crate::observability::{GuardMetrics, StructuredLogger};
use crate::tracker::OffenderTracker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Applies enforcement actions against a firewall backend
pub struct EnforcementWorker {
    rx: mpsc::Receiver<Sequenced>,
    backend: Arc<dyn FirewallBackend>,
    tracker: Arc<OffenderTracker>,
    ledger: Arc<Ledger>,
    config: EnforcementConfig,
    metrics: GuardMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl EnforcementWorker {
    /// Create a worker and the handle used to feed it
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        tracker: Arc<OffenderTracker>,
        config: EnforcementConfig,
        metrics: GuardMetrics,
        logger: StructuredLogger,
    ) -> (Self, EnforcerHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let ledger = Arc::new(Ledger::default());

        let handle = EnforcerHandle {
            tx,
            ledger: ledger.clone(),
            metrics: metrics.clone(),
        };
        let worker = Self {
            rx,
            backend,
            tracker,
            ledger,
            config,
            metrics,
            logger,
            health: None,
        };
        (worker, handle)
    }

    /// Report firewall health to a registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until shutdown, then drain
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            backend = self.backend.name(),
            retry_interval_secs = self.config.retry_interval.as_secs_f64(),
            "Starting enforcement worker"
        );

        let mut retry = interval(self.config.retry_interval.max(Duration::from_millis(1)));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        retry.tick().await;

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => self.execute(item).await,
                    None => {
                        info!("All enforcement handles dropped");
                        break;
                    }
                },
                _ = retry.tick() => {
                    self.retry_parked().await;
                    self.reconcile().await;
                    self.update_health().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down enforcement worker");
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Run one backend call on the blocking pool
    async fn apply(&self, action: &EnforcementAction) -> Result<(), FirewallError> {
        let backend = self.backend.clone();
        let owned = action.clone();
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || match &owned {
            EnforcementAction::Install(offender) => backend.install_block(offender),
            EnforcementAction::Remove(offender) => backend.remove_block(offender),
        })
        .await
        .unwrap_or_else(|e| {
            Err(FirewallError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("firewall task failed: {}", e),
            )))
        });

        self.metrics.observe_firewall_call(
            action.operation(),
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn execute(&self, item: Sequenced) {
        let key = item.action.key();
        match self.apply(&item.action).await {
            Ok(()) => self.ledger.settle(&key, item.seq),
            Err(e @ FirewallError::UnsupportedDirection { .. }) => {
                error!(offender = %key, error = %e, "Backend cannot enforce this ban");
                self.ledger.settle(&key, item.seq);
            }
            Err(e) => {
                self.logger
                    .log_firewall_failure(item.action.operation(), &key, &e.to_string());
                self.ledger.park(item);
                self.update_health().await;
            }
        }
    }

    /// A parked action the tracker has since moved past
    fn is_stale(&self, action: &EnforcementAction) -> bool {
        match action {
            EnforcementAction::Install(offender) => !self.tracker.is_banned(&offender.key),
            EnforcementAction::Remove(offender) => self.tracker.is_banned(&offender.key),
        }
    }

    async fn retry_parked(&self) {
        let parked = self.ledger.take_parked();
        if parked.is_empty() {
            return;
        }
        debug!(actions = parked.len(), "Retrying parked enforcement actions");

        for item in parked {
            if self.is_stale(&item.action) {
                debug!(offender = %item.action.key(), operation = item.action.operation(), "Dropping stale action");
                self.ledger.settle(&item.action.key(), item.seq);
                continue;
            }
            self.execute(item).await;
        }
    }

    /// Heal disagreements between installed rules and tracked bans
    async fn reconcile(&self) {
        let backend = self.backend.clone();
        let active = match tokio::task::spawn_blocking(move || backend.active_blocks()).await {
            Ok(Ok(active)) => active,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not list firewall rules for reconciliation");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Reconciliation task failed");
                return;
            }
        };

        let banned: HashMap<OffenderKey, Offender> = self
            .tracker
            .banned_offenders()
            .into_iter()
            .map(|offender| (offender.key, offender))
            .collect();
        let blocked: HashSet<OffenderKey> = active.iter().map(|block| block.key).collect();

        for block in &active {
            if banned.contains_key(&block.key) || self.ledger.is_outstanding(&block.key) {
                continue;
            }
            self.report(&TrackerInvariantError::OrphanedRule(block.key));
            let item = self
                .ledger
                .stamp(EnforcementAction::Remove(block.to_offender()));
            self.execute(item).await;
        }

        for (key, offender) in banned {
            if blocked.contains(&key)
                || self.ledger.is_outstanding(&key)
                || !self.backend.supports(key.direction)
            {
                continue;
            }
            self.report(&TrackerInvariantError::MissingRule(key));
            let item = self.ledger.stamp(EnforcementAction::Install(offender));
            self.execute(item).await;
        }
    }

    fn report(&self, violation: &TrackerInvariantError) {
        self.logger.log_invariant_violation(violation);
        self.metrics.inc_invariant_violation(violation);
    }

    async fn update_health(&self) {
        let parked = self.ledger.parked_count();
        self.metrics.set_enforcement_pending(parked);

        if let Some(health) = &self.health {
            if parked == 0 {
                health.set_healthy(Component::Firewall).await;
            } else {
                health
                    .set_degraded(
                        Component::Firewall,
                        format!("{} enforcement actions pending retry", parked),
                    )
                    .await;
            }
        }
    }

    /// Apply what is still queued. The drain timeout only stops actions
    /// from starting: a backend call already running is awaited, and a
    /// failed one is rolled back before the tracker is adjusted.
    pub(super) async fn drain(&mut self) {
        self.rx.close();
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items.extend(self.ledger.take_parked());
        items.sort_by_key(|item| item.seq);

        if items.is_empty() {
            return;
        }
        info!(
            actions = items.len(),
            timeout_secs = self.config.drain_timeout.as_secs_f64(),
            "Draining enforcement queue"
        );

        let deadline = Instant::now() + self.config.drain_timeout;
        // Final outcome per key: None when applied, the action when abandoned
        let mut outcome: HashMap<OffenderKey, Option<EnforcementAction>> = HashMap::new();

        for item in items {
            let key = item.action.key();
            if Instant::now() >= deadline {
                outcome.insert(key, Some(item.action));
                continue;
            }

            match self.apply(&item.action).await {
                Ok(()) | Err(FirewallError::UnsupportedDirection { .. }) => {
                    self.ledger.settle(&key, item.seq);
                    outcome.insert(key, None);
                }
                Err(e) => {
                    warn!(offender = %key, error = %e, "Firewall call failed during drain");
                    self.roll_back(&item.action).await;
                    outcome.insert(key, Some(item.action));
                }
            }
        }

        for action in outcome.into_values().flatten() {
            self.abandon(action);
        }
        self.metrics.set_enforcement_pending(0);
    }

    /// Undo whatever part of a failed call reached the firewall
    async fn roll_back(&self, action: &EnforcementAction) {
        let undo = match action {
            EnforcementAction::Install(offender) => EnforcementAction::Remove(offender.clone()),
            EnforcementAction::Remove(offender) => EnforcementAction::Install(offender.clone()),
        };
        if let Err(e) = self.apply(&undo).await {
            error!(
                offender = %action.key(),
                operation = undo.operation(),
                error = %e,
                "Could not roll back partial firewall change"
            );
        }
    }

    fn abandon(&self, action: EnforcementAction) {
        let key = action.key();
        self.logger.log_enforcement_abandoned(action.operation(), &key);
        self.metrics.inc_enforcement_abandoned();
        self.ledger.settle(&key, u64::MAX);

        match action {
            // No rule is left in place
            EnforcementAction::Install(offender) => {
                self.tracker.revert_ban(&offender.key);
            }
            // The rule is still there
            EnforcementAction::Remove(offender) => {
                if let Err(e) = self.tracker.restore_ban(offender) {
                    self.report(&e);
                }
            }
        }
    }
}
