//! Asynchronous firewall enforcement
//!
//! Tracker decisions become [`EnforcementAction`]s submitted through an
//! [`EnforcerHandle`]. Submission never blocks: when the bounded queue is
//! full the action is parked in a per-key ledger and picked up by the
//! worker's retry tick. Only the newest action per offender is kept while
//! parked. The [`EnforcementWorker`] runs backend calls off the async
//! runtime, retries failures, reconciles the firewall against the tracker,
//! and drains on shutdown.

mod worker;


pub use worker::EnforcementWorker;

use crate::error::EnforceError;
use crate::models::{Decision, Offender, OffenderKey};
use crate::observability::GuardMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Configuration for the enforcement worker
#[derive(Debug, Clone)]
pub struct EnforcementConfig {
    /// Capacity of the action queue
    pub queue_capacity: usize,
    /// How often parked actions are retried and the firewall reconciled
    pub retry_interval: Duration,
    /// How long shutdown may spend applying outstanding actions
    pub drain_timeout: Duration,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retry_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Firewall change requested for one offender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementAction {
    Install(Offender),
    Remove(Offender),
}

impl EnforcementAction {
    pub fn offender(&self) -> &Offender {
        match self {
            EnforcementAction::Install(o) | EnforcementAction::Remove(o) => o,
        }
    }

    pub fn key(&self) -> OffenderKey {
        self.offender().key
    }

    pub fn operation(&self) -> &'static str {
        match self {
            EnforcementAction::Install(_) => "install",
            EnforcementAction::Remove(_) => "remove",
        }
    }

    /// Action carrying out a tracker decision
    pub fn from_decision(decision: Decision) -> Option<Self> {
        match decision {
            Decision::Ban(offender) => Some(EnforcementAction::Install(offender)),
            Decision::Unban(offender) => Some(EnforcementAction::Remove(offender)),
            Decision::NoAction => None,
        }
    }
}

/// An action stamped with its submission order
#[derive(Debug, Clone)]
pub(crate) struct Sequenced {
    pub seq: u64,
    pub action: EnforcementAction,
}

#[derive(Default)]
struct LedgerState {
    /// Newest submitted, not yet settled action per key
    outstanding: HashMap<OffenderKey, u64>,
    /// Actions waiting for the retry tick
    parked: HashMap<OffenderKey, Sequenced>,
}

/// Bookkeeping shared by the handle and the worker
#[derive(Default)]
pub(crate) struct Ledger {
    next_seq: AtomicU64,
    state: Mutex<LedgerState>,
}

impl Ledger {
    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stamp(&self, action: EnforcementAction) -> Sequenced {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.lock();
        state.outstanding.insert(action.key(), seq);
        Sequenced { seq, action }
    }

    pub(crate) fn is_parked(&self, key: &OffenderKey) -> bool {
        self.lock().parked.contains_key(key)
    }

    /// Park an action unless a newer one for the same key is already parked
    pub(crate) fn park(&self, item: Sequenced) {
        let mut state = self.lock();
        let key = item.action.key();
        let newer_parked = state
            .parked
            .get(&key)
            .map(|existing| existing.seq > item.seq)
            .unwrap_or(false);
        if !newer_parked {
            state.parked.insert(key, item);
        }
    }

    /// Take every parked action, oldest first
    pub(crate) fn take_parked(&self) -> Vec<Sequenced> {
        let mut items: Vec<Sequenced> = self.lock().parked.drain().map(|(_, v)| v).collect();
        items.sort_by_key(|item| item.seq);
        items
    }

    /// Record that an action reached a final outcome
    pub(crate) fn settle(&self, key: &OffenderKey, seq: u64) {
        let mut state = self.lock();
        if state.outstanding.get(key).map(|s| *s <= seq).unwrap_or(false) {
            state.outstanding.remove(key);
        }
        if state.parked.get(key).map(|p| p.seq <= seq).unwrap_or(false) {
            state.parked.remove(key);
        }
    }

    /// Whether an action for this key is queued, parked or in flight
    pub(crate) fn is_outstanding(&self, key: &OffenderKey) -> bool {
        self.lock().outstanding.contains_key(key)
    }

    pub(crate) fn parked_count(&self) -> usize {
        self.lock().parked.len()
    }

    pub(crate) fn outstanding_count(&self) -> usize {
        self.lock().outstanding.len()
    }
}

/// Cloneable submission side of the enforcement worker
#[derive(Clone)]
pub struct EnforcerHandle {
    pub(crate) tx: mpsc::Sender<Sequenced>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) metrics: GuardMetrics,
}

impl EnforcerHandle {
    /// Queue an action without blocking
    pub fn submit(&self, action: EnforcementAction) -> Result<(), EnforceError> {
        if self.tx.is_closed() {
            return Err(EnforceError::Closed);
        }

        let key = action.key();
        let item = self.ledger.stamp(action);

        // A parked action for this key must not overtake the new one
        if self.ledger.is_parked(&key) {
            self.ledger.park(item);
            self.metrics.set_enforcement_pending(self.ledger.parked_count());
            return Ok(());
        }

        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => {
                debug!(offender = %key, "Enforcement queue full, parking action");
                self.ledger.park(item);
                self.metrics.set_enforcement_pending(self.ledger.parked_count());
                Ok(())
            }
            Err(TrySendError::Closed(item)) => {
                self.ledger.settle(&key, item.seq);
                Err(EnforceError::Closed)
            }
        }
    }

    /// Submit the action for a tracker decision, if any
    pub fn dispatch(&self, decision: Decision) -> Result<(), EnforceError> {
        match EnforcementAction::from_decision(decision) {
            Some(action) => self.submit(action),
            None => Ok(()),
        }
    }

    /// Actions waiting for the retry tick
    pub fn parked(&self) -> usize {
        self.ledger.parked_count()
    }

    /// Offenders with an action not yet applied
    pub fn outstanding(&self) -> usize {
        self.ledger.outstanding_count()
    }
}
