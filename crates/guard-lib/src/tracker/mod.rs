//! Offender tracking
//!
//! Correlates attack verdicts with their remote source and decides when a
//! source crosses the violation threshold. Each (address, direction) key
//! moves through UNTRACKED → TRACKED(n) → BANNED → UNTRACKED. Updates for
//! one key are serialized by the shard lock of the underlying map; keys do
//! not coordinate with each other.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::error::TrackerInvariantError;
use crate::models::{
    BanRecord, BanState, Decision, Direction, FlowMetadata, Offender, OffenderKey, PortMapping,
    Verdict,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default violation threshold
pub const DEFAULT_NAUGHTY_COUNT: u32 = 3;

/// Default ban window in minutes
pub const DEFAULT_BAN_DURATION_MINUTES: i64 = 60;

/// Configuration for the offender tracker
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// A source is banned once its violations exceed this count
    pub naughty_count: u32,
    /// Minutes a ban stays installed before it is lifted
    pub ban_duration_minutes: i64,
    /// Addresses of the protected host; flows from these are outbound
    pub local_addrs: HashSet<IpAddr>,
    /// Keep the violation history of a source after its ban expires
    pub retain_history: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            naughty_count: DEFAULT_NAUGHTY_COUNT,
            ban_duration_minutes: DEFAULT_BAN_DURATION_MINUTES,
            local_addrs: HashSet::new(),
            retain_history: false,
        }
    }
}

/// Tracks violation counts and bans per remote source
pub struct OffenderTracker {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    offenders: DashMap<OffenderKey, Offender>,
}

impl OffenderTracker {
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            offenders: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn now_minute(&self) -> i64 {
        self.clock.now_minute()
    }

    /// Resolve which remote address and direction a flow belongs to
    pub fn offender_key(&self, metadata: &FlowMetadata) -> OffenderKey {
        if self.config.local_addrs.contains(&metadata.src_ip) {
            OffenderKey::new(metadata.dst_ip, Direction::Outbound)
        } else {
            OffenderKey::new(metadata.src_ip, Direction::Inbound)
        }
    }

    /// Feed one classified flow. Benign verdicts never change state.
    pub fn record_flow(&self, verdict: Verdict, metadata: &FlowMetadata) -> Decision {
        if !verdict.is_attack() {
            return Decision::NoAction;
        }

        let key = self.offender_key(metadata);
        let mapping = PortMapping {
            protocol: metadata.protocol,
            port: metadata.dst_port,
        };

        let mut entry = self
            .offenders
            .entry(key)
            .or_insert_with(|| Offender::new(key));
        let offender = entry.value_mut();

        if offender.is_banned() {
            return Decision::NoAction;
        }

        offender.violations = offender.violations.saturating_add(1);
        offender.port_mappings.insert(mapping);

        if offender.violations > self.config.naughty_count {
            let now = self.clock.now_minute();
            offender.state = BanState::Banned { since_minute: now };
            info!(
                offender = %key,
                violations = offender.violations,
                ports = offender.port_mappings.len(),
                minute = now,
                "Offender crossed violation threshold"
            );
            Decision::Ban(offender.clone())
        } else {
            debug!(offender = %key, violations = offender.violations, "Violation recorded");
            Decision::NoAction
        }
    }

    /// Lift every ban whose window has elapsed
    pub fn sweep_expired(&self) -> Vec<Decision> {
        let now = self.clock.now_minute();
        let duration = self.config.ban_duration_minutes;
        let expired = |offender: &Offender| {
            offender
                .banned_since()
                .map(|since| now >= since + duration)
                .unwrap_or(false)
        };

        // Collect first; re-checked under the entry lock below
        let candidates: Vec<OffenderKey> = self
            .offenders
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut decisions = Vec::with_capacity(candidates.len());
        for key in candidates {
            if let Entry::Occupied(mut occupied) = self.offenders.entry(key) {
                if !expired(occupied.get()) {
                    continue;
                }
                let offender = occupied.get().clone();
                if self.config.retain_history {
                    occupied.get_mut().state = BanState::Tracked;
                } else {
                    occupied.remove();
                }
                info!(offender = %key, minute = now, "Ban expired");
                decisions.push(Decision::Unban(offender));
            }
        }
        decisions
    }

    /// Remove an offender entirely. A banned one yields an unban decision.
    pub fn lift(&self, key: &OffenderKey) -> Decision {
        match self.offenders.remove(key) {
            Some((_, offender)) if offender.is_banned() => {
                info!(offender = %key, "Ban lifted");
                Decision::Unban(offender)
            }
            _ => Decision::NoAction,
        }
    }

    /// Forget the violation history of a tracked (not banned) offender
    pub fn reset(&self, key: &OffenderKey) -> bool {
        self.offenders
            .remove_if(key, |_, offender| !offender.is_banned())
            .is_some()
    }

    /// Turn a ban back into tracking, keeping its count. Used when the
    /// rule for the ban was never installed.
    pub fn revert_ban(&self, key: &OffenderKey) -> bool {
        match self.offenders.get_mut(key) {
            Some(mut offender) if offender.is_banned() => {
                offender.state = BanState::Tracked;
                true
            }
            _ => false,
        }
    }

    /// Re-instate a ban whose rule is still installed
    pub fn restore_ban(&self, offender: Offender) -> Result<(), TrackerInvariantError> {
        if !offender.is_banned() {
            return Ok(());
        }
        match self.offenders.entry(offender.key) {
            Entry::Occupied(occupied) if occupied.get().is_banned() => {
                warn!(offender = %offender.key, "Restore requested for an active ban");
                Err(TrackerInvariantError::DoubleBan(offender.key))
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(offender);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(offender);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &OffenderKey) -> Option<Offender> {
        self.offenders.get(key).map(|entry| entry.value().clone())
    }

    pub fn is_banned(&self, key: &OffenderKey) -> bool {
        self.offenders
            .get(key)
            .map(|entry| entry.is_banned())
            .unwrap_or(false)
    }

    /// Snapshot of all offenders, sorted by key
    pub fn offenders(&self) -> Vec<Offender> {
        let mut all: Vec<Offender> = self.offenders.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|o| o.key);
        all
    }

    /// Snapshot of all active bans, sorted by key
    pub fn bans(&self) -> Vec<BanRecord> {
        let mut bans: Vec<BanRecord> = self
            .offenders
            .iter()
            .filter_map(|entry| {
                entry.banned_since().map(|since_minute| BanRecord {
                    key: *entry.key(),
                    since_minute,
                })
            })
            .collect();
        bans.sort_by_key(|b| b.key);
        bans
    }

    /// Banned offenders with their full state
    pub fn banned_offenders(&self) -> Vec<Offender> {
        self.offenders().into_iter().filter(Offender::is_banned).collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::default();
        for entry in self.offenders.iter() {
            if entry.is_banned() {
                stats.banned += 1;
            } else {
                stats.tracked += 1;
            }
        }
        stats
    }
}

/// Counts of offenders per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub tracked: usize,
    pub banned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    const LOCAL: &str = "192.168.1.10";

    fn tracker(naughty_count: u32, ban_minutes: i64) -> (OffenderTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = TrackerConfig {
            naughty_count,
            ban_duration_minutes: ban_minutes,
            local_addrs: [LOCAL.parse().unwrap()].into_iter().collect(),
            retain_history: false,
        };
        (OffenderTracker::new(config, clock.clone()), clock)
    }

    fn inbound(src: &str, protocol: Protocol, port: u16) -> FlowMetadata {
        FlowMetadata {
            src_ip: src.parse().unwrap(),
            dst_ip: LOCAL.parse().unwrap(),
            protocol,
            src_port: 50_000,
            dst_port: port,
        }
    }

    fn key(addr: &str) -> OffenderKey {
        OffenderKey::new(addr.parse().unwrap(), Direction::Inbound)
    }

    #[test]
    fn test_fourth_violation_bans_once() {
        let (tracker, _clock) = tracker(3, 60);
        let flow = inbound("10.0.0.1", Protocol::Tcp, 80);

        let decisions: Vec<Decision> = (0..4)
            .map(|_| tracker.record_flow(Verdict::Attack, &flow))
            .collect();

        assert!(decisions[..3].iter().all(|d| *d == Decision::NoAction));
        match &decisions[3] {
            Decision::Ban(offender) => {
                assert_eq!(offender.key, key("10.0.0.1"));
                assert_eq!(offender.violations, 4);
                assert_eq!(offender.banned_since(), Some(1_000));
                assert_eq!(
                    offender.port_mappings.iter().copied().collect::<Vec<_>>(),
                    vec![PortMapping { protocol: Protocol::Tcp, port: 80 }]
                );
            }
            other => panic!("expected ban, got {:?}", other),
        }

        // Already banned: no double ban, count frozen
        assert_eq!(tracker.record_flow(Verdict::Attack, &flow), Decision::NoAction);
        assert_eq!(tracker.get(&key("10.0.0.1")).unwrap().violations, 4);
    }

    #[test]
    fn test_counts_non_decreasing_while_tracked() {
        let (tracker, _clock) = tracker(10, 60);
        let flow = inbound("10.0.0.2", Protocol::Udp, 53);
        let mut last = 0;
        for i in 0..10 {
            let verdict = if i % 3 == 0 { Verdict::Benign } else { Verdict::Attack };
            tracker.record_flow(verdict, &flow);
            let count = tracker.get(&key("10.0.0.2")).map(|o| o.violations).unwrap_or(0);
            assert!(count >= last);
            last = count;
        }
    }

    #[test]
    fn test_benign_does_not_reset() {
        let (tracker, _clock) = tracker(3, 60);
        let flow = inbound("10.0.0.3", Protocol::Tcp, 22);
        tracker.record_flow(Verdict::Attack, &flow);
        tracker.record_flow(Verdict::Attack, &flow);

        assert_eq!(tracker.record_flow(Verdict::Benign, &flow), Decision::NoAction);
        assert_eq!(tracker.get(&key("10.0.0.3")).unwrap().violations, 2);
    }

    #[test]
    fn test_benign_does_not_create_offender() {
        let (tracker, _clock) = tracker(3, 60);
        tracker.record_flow(Verdict::Benign, &inbound("10.0.0.4", Protocol::Tcp, 80));
        assert!(tracker.offenders().is_empty());
    }

    #[test]
    fn test_ban_expires_exactly_at_window() {
        let (tracker, clock) = tracker(0, 30);
        let flow = inbound("10.0.0.5", Protocol::Tcp, 443);
        assert!(matches!(tracker.record_flow(Verdict::Attack, &flow), Decision::Ban(_)));

        clock.advance(29);
        assert!(tracker.sweep_expired().is_empty());
        assert!(tracker.is_banned(&key("10.0.0.5")));

        clock.advance(1);
        let decisions = tracker.sweep_expired();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(&decisions[0], Decision::Unban(o) if o.key == key("10.0.0.5")));
        assert!(tracker.get(&key("10.0.0.5")).is_none());

        // Exactly once
        assert!(tracker.sweep_expired().is_empty());
    }

    #[test]
    fn test_retain_history_after_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let config = TrackerConfig {
            naughty_count: 1,
            ban_duration_minutes: 5,
            retain_history: true,
            ..Default::default()
        };
        let tracker = OffenderTracker::new(config, clock.clone());
        let flow = inbound("10.0.0.6", Protocol::Tcp, 80);

        tracker.record_flow(Verdict::Attack, &flow);
        assert!(matches!(tracker.record_flow(Verdict::Attack, &flow), Decision::Ban(_)));
        clock.advance(5);
        assert_eq!(tracker.sweep_expired().len(), 1);

        let offender = tracker.get(&key("10.0.0.6")).unwrap();
        assert!(!offender.is_banned());
        assert_eq!(offender.violations, 2);

        // Re-offending source is banned again on its next violation
        assert!(matches!(tracker.record_flow(Verdict::Attack, &flow), Decision::Ban(_)));
    }

    #[test]
    fn test_direction_scoping() {
        let (tracker, _clock) = tracker(3, 60);
        let outbound = FlowMetadata {
            src_ip: LOCAL.parse().unwrap(),
            dst_ip: "10.0.0.7".parse().unwrap(),
            protocol: Protocol::Tcp,
            src_port: 40_000,
            dst_port: 25,
        };
        tracker.record_flow(Verdict::Attack, &outbound);
        tracker.record_flow(Verdict::Attack, &inbound("10.0.0.7", Protocol::Tcp, 25));

        let offenders = tracker.offenders();
        assert_eq!(offenders.len(), 2);
        assert_eq!(offenders[0].key.direction, Direction::Inbound);
        assert_eq!(offenders[1].key.direction, Direction::Outbound);
        assert!(offenders.iter().all(|o| o.violations == 1));
    }

    #[test]
    fn test_port_mappings_accumulate() {
        let (tracker, _clock) = tracker(2, 60);
        tracker.record_flow(Verdict::Attack, &inbound("10.0.0.8", Protocol::Tcp, 80));
        tracker.record_flow(Verdict::Attack, &inbound("10.0.0.8", Protocol::Tcp, 443));
        match tracker.record_flow(Verdict::Attack, &inbound("10.0.0.8", Protocol::Udp, 53)) {
            Decision::Ban(offender) => assert_eq!(offender.port_mappings.len(), 3),
            other => panic!("expected ban, got {:?}", other),
        }
    }

    #[test]
    fn test_lift_reset_revert_restore() {
        let (tracker, _clock) = tracker(0, 60);
        let flow = inbound("10.0.0.9", Protocol::Tcp, 80);
        let banned = match tracker.record_flow(Verdict::Attack, &flow) {
            Decision::Ban(offender) => offender,
            other => panic!("expected ban, got {:?}", other),
        };

        assert!(!tracker.reset(&banned.key));
        assert!(tracker.revert_ban(&banned.key));
        assert!(!tracker.is_banned(&banned.key));
        assert_eq!(tracker.get(&banned.key).unwrap().violations, 1);

        tracker.restore_ban(banned.clone()).unwrap();
        assert!(tracker.is_banned(&banned.key));
        assert_eq!(
            tracker.restore_ban(banned.clone()),
            Err(TrackerInvariantError::DoubleBan(banned.key))
        );

        assert!(matches!(tracker.lift(&banned.key), Decision::Unban(_)));
        assert!(tracker.get(&banned.key).is_none());
        assert_eq!(tracker.lift(&banned.key), Decision::NoAction);
    }

    #[test]
    fn test_concurrent_updates_same_key() {
        let (tracker, _clock) = tracker(u32::MAX - 1, 60);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let flow = inbound("10.0.0.10", Protocol::Tcp, 80);
                    for _ in 0..500 {
                        tracker.record_flow(Verdict::Attack, &flow);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.get(&key("10.0.0.10")).unwrap().violations, 4_000);
    }

    #[test]
    fn test_concurrent_threshold_bans_once() {
        let (tracker, _clock) = tracker(50, 60);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let flow = inbound("10.0.0.11", Protocol::Tcp, 80);
                    (0..100)
                        .filter(|_| matches!(tracker.record_flow(Verdict::Attack, &flow), Decision::Ban(_)))
                        .count()
                })
            })
            .collect();
        let bans: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(bans, 1);
        assert_eq!(tracker.get(&key("10.0.0.11")).unwrap().violations, 51);
        assert_eq!(tracker.stats(), TrackerStats { tracked: 0, banned: 1 });
    }
}
