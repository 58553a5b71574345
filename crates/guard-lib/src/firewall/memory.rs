//! In-process backend that records rules without touching the host

use super::{ActiveBlock, FirewallBackend};
use crate::error::FirewallError;
use crate::models::{Direction, Offender, OffenderKey, PortMapping};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
pub struct MemoryBackend {
    rules: Mutex<BTreeMap<OffenderKey, BTreeSet<PortMapping>>>,
    inbound_only: bool,
    /// Number of upcoming install/remove calls that fail
    failures: AtomicUsize,
    /// Number of upcoming installs that record their first mapping, then fail
    partial_failures: AtomicUsize,
    /// Time every install/remove call takes
    latency: Duration,
    install_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses outbound rules
    pub fn inbound_only() -> Self {
        Self {
            inbound_only: true,
            ..Self::default()
        }
    }

    /// Backend whose calls each block for `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Make the next `count` install/remove calls fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` installs fail after recording one mapping
    pub fn fail_partway_next(&self, count: usize) {
        self.partial_failures.store(count, Ordering::SeqCst);
    }

    pub fn rules(&self) -> BTreeMap<OffenderKey, BTreeSet<PortMapping>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn rule_count(&self) -> usize {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    pub fn is_blocked(&self, key: &OffenderKey) -> bool {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Insert a rule directly, as if installed by someone else
    pub fn insert_rule(&self, key: OffenderKey, mapping: PortMapping) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .insert(mapping);
    }

    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failure(operation: &str) -> FirewallError {
        FirewallError::CommandFailed {
            command: format!("memory {}", operation),
            exit_code: 1,
            stderr: "injected failure".to_string(),
        }
    }

    fn injected_failure(&self, operation: &str) -> Result<(), FirewallError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if Self::take(&self.failures) {
            return Err(Self::failure(operation));
        }
        Ok(())
    }
}

impl FirewallBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports(&self, direction: Direction) -> bool {
        !(self.inbound_only && direction == Direction::Outbound)
    }

    fn install_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports(offender.key.direction) {
            return Err(FirewallError::UnsupportedDirection {
                backend: self.name().to_string(),
                direction: offender.key.direction,
            });
        }
        self.injected_failure("install")?;

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let installed = rules.entry(offender.key).or_default();
        if Self::take(&self.partial_failures) {
            installed.extend(offender.port_mappings.iter().take(1).copied());
            return Err(Self::failure("install"));
        }
        installed.extend(offender.port_mappings.iter().copied());
        debug!(offender = %offender.key, "Block recorded");
        Ok(())
    }

    fn remove_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure("remove")?;

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mappings) = rules.get_mut(&offender.key) {
            for mapping in &offender.port_mappings {
                mappings.remove(mapping);
            }
            if mappings.is_empty() {
                rules.remove(&offender.key);
            }
        }
        Ok(())
    }

    fn active_blocks(&self) -> Result<Vec<ActiveBlock>, FirewallError> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, mappings)| ActiveBlock {
                key: *key,
                port_mappings: mappings.clone(),
            })
            .collect())
    }
}
