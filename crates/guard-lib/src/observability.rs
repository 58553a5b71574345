//! Observability infrastructure for the flow guard
//!
//! Provides:
//! - Prometheus metrics (scoring latency, verdicts, decisions, firewall calls, model version)
//! - Structured JSON logging with tracing

use crate::error::TrackerInvariantError;
use crate::models::{Decision, OffenderKey};
use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, Encoder, GaugeVec, Histogram, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<GuardMetricsInner> = OnceLock::new();

struct GuardMetricsInner {
    scoring_latency_seconds: Histogram,
    flows_scored: IntCounterVec,
    preprocess_errors: IntCounter,
    batch_errors: IntCounter,
    decisions: IntCounterVec,
    offenders_tracked: IntGauge,
    bans_active: IntGauge,
    firewall_operations: IntCounterVec,
    firewall_latency_seconds: HistogramVec,
    enforcement_pending: IntGauge,
    enforcement_abandoned: IntCounter,
    invariant_violations: IntCounterVec,
    model_version_info: GaugeVec,
}

impl GuardMetricsInner {
    fn new() -> Self {
        Self {
            scoring_latency_seconds: register_histogram!(
                "flowguard_scoring_latency_seconds",
                "Time spent preprocessing and scoring one flow batch",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scoring_latency_seconds"),

            flows_scored: register_int_counter_vec!(
                "flowguard_flows_scored_total",
                "Flows scored by the classifier, by verdict",
                &["verdict"]
            )
            .expect("Failed to register flows_scored"),

            preprocess_errors: register_int_counter!(
                "flowguard_preprocess_errors_total",
                "Flow records skipped because they could not be parsed"
            )
            .expect("Failed to register preprocess_errors"),

            batch_errors: register_int_counter!(
                "flowguard_batch_errors_total",
                "Flow batches refused by the preprocessor or classifier"
            )
            .expect("Failed to register batch_errors"),

            decisions: register_int_counter_vec!(
                "flowguard_decisions_total",
                "Ban and unban decisions taken by the tracker",
                &["action"]
            )
            .expect("Failed to register decisions"),

            offenders_tracked: register_int_gauge!(
                "flowguard_offenders_tracked",
                "Sources with recorded violations that are not banned"
            )
            .expect("Failed to register offenders_tracked"),

            bans_active: register_int_gauge!(
                "flowguard_bans_active",
                "Sources currently banned"
            )
            .expect("Failed to register bans_active"),

            firewall_operations: register_int_counter_vec!(
                "flowguard_firewall_operations_total",
                "Firewall backend calls, by operation and outcome",
                &["operation", "outcome"]
            )
            .expect("Failed to register firewall_operations"),

            firewall_latency_seconds: register_histogram_vec!(
                "flowguard_firewall_latency_seconds",
                "Time spent in firewall backend calls",
                &["operation"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register firewall_latency_seconds"),

            enforcement_pending: register_int_gauge!(
                "flowguard_enforcement_pending",
                "Enforcement actions parked for retry"
            )
            .expect("Failed to register enforcement_pending"),

            enforcement_abandoned: register_int_counter!(
                "flowguard_enforcement_abandoned_total",
                "Enforcement actions dropped at shutdown"
            )
            .expect("Failed to register enforcement_abandoned"),

            invariant_violations: register_int_counter_vec!(
                "flowguard_tracker_invariant_violations_total",
                "Disagreements between tracker state and installed rules",
                &["kind"]
            )
            .expect("Failed to register invariant_violations"),

            model_version_info: register_gauge_vec!(
                "flowguard_model_version_info",
                "Information about the currently loaded model",
                &["version"]
            )
            .expect("Failed to register model_version_info"),
        }
    }
}

/// Flow guard metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct GuardMetrics {
    _private: (),
}

impl Default for GuardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(GuardMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &GuardMetricsInner {
        GLOBAL_METRICS.get_or_init(GuardMetricsInner::new)
    }

    pub fn observe_scoring_latency(&self, duration_secs: f64) {
        self.inner().scoring_latency_seconds.observe(duration_secs);
    }

    pub fn add_flows_scored(&self, benign: u64, attack: u64) {
        let flows = &self.inner().flows_scored;
        flows.with_label_values(&["benign"]).inc_by(benign);
        flows.with_label_values(&["attack"]).inc_by(attack);
    }

    pub fn add_preprocess_errors(&self, count: u64) {
        self.inner().preprocess_errors.inc_by(count);
    }

    pub fn inc_batch_errors(&self) {
        self.inner().batch_errors.inc();
    }

    pub fn inc_decision(&self, decision: &Decision) {
        let action = match decision {
            Decision::Ban(_) => "ban",
            Decision::Unban(_) => "unban",
            Decision::NoAction => return,
        };
        self.inner().decisions.with_label_values(&[action]).inc();
    }

    pub fn set_offender_counts(&self, tracked: usize, banned: usize) {
        self.inner().offenders_tracked.set(tracked as i64);
        self.inner().bans_active.set(banned as i64);
    }

    pub fn observe_firewall_call(&self, operation: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .firewall_operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.inner()
            .firewall_latency_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn set_enforcement_pending(&self, count: usize) {
        self.inner().enforcement_pending.set(count as i64);
    }

    pub fn inc_enforcement_abandoned(&self) {
        self.inner().enforcement_abandoned.inc();
    }

    pub fn inc_invariant_violation(&self, violation: &TrackerInvariantError) {
        let kind = match violation {
            TrackerInvariantError::OrphanedRule(_) => "orphaned_rule",
            TrackerInvariantError::MissingRule(_) => "missing_rule",
            TrackerInvariantError::DoubleBan(_) => "double_ban",
        };
        self.inner().invariant_violations.with_label_values(&[kind]).inc();
    }

    pub fn set_model_version(&self, version: &str) {
        self.inner().model_version_info.reset();
        self.inner()
            .model_version_info
            .with_label_values(&[version])
            .set(1.0);
    }

    /// Render every registered metric in Prometheus text format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for flow guard events
///
/// Provides consistent JSON-formatted logging for decisions,
/// firewall failures and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Log a ban or unban decision
    pub fn log_decision(&self, decision: &Decision) {
        match decision {
            Decision::Ban(offender) => {
                let ports: Vec<String> = offender
                    .port_mappings
                    .iter()
                    .map(|m| format!("{}/{}", m.protocol, m.port))
                    .collect();
                warn!(
                    event = "offender_banned",
                    host = %self.host,
                    offender = %offender.key,
                    violations = offender.violations,
                    ports = ?ports,
                    since_minute = ?offender.banned_since(),
                    "Offender banned"
                );
            }
            Decision::Unban(offender) => {
                info!(
                    event = "offender_unbanned",
                    host = %self.host,
                    offender = %offender.key,
                    violations = offender.violations,
                    "Offender unbanned"
                );
            }
            Decision::NoAction => {}
        }
    }

    /// Log one scored batch
    pub fn log_batch(&self, flows: usize, attacks: usize, skipped: usize, elapsed_ms: u128) {
        info!(
            event = "batch_scored",
            host = %self.host,
            flows = flows,
            attacks = attacks,
            skipped = skipped,
            elapsed_ms = elapsed_ms,
            "Flow batch scored"
        );
    }

    /// Log a batch the pipeline refused
    pub fn log_batch_refused(&self, reason: &str) {
        error!(
            event = "batch_refused",
            host = %self.host,
            reason = %reason,
            "Flow batch refused"
        );
    }

    /// Log a failed firewall call that will be retried
    pub fn log_firewall_failure(&self, operation: &str, offender: &OffenderKey, reason: &str) {
        warn!(
            event = "firewall_call_failed",
            host = %self.host,
            operation = %operation,
            offender = %offender,
            reason = %reason,
            "Firewall call failed, parked for retry"
        );
    }

    /// Log an action dropped because the worker ran out of time
    pub fn log_enforcement_abandoned(&self, operation: &str, offender: &OffenderKey) {
        warn!(
            event = "enforcement_abandoned",
            host = %self.host,
            operation = %operation,
            offender = %offender,
            "Enforcement action abandoned at shutdown"
        );
    }

    /// Log a tracker/firewall disagreement found during reconciliation
    pub fn log_invariant_violation(&self, violation: &TrackerInvariantError) {
        warn!(
            event = "tracker_invariant_violation",
            host = %self.host,
            violation = %violation,
            "Tracker and firewall disagree, healing"
        );
    }

    /// Log a model load at startup
    pub fn log_model_loaded(&self, name: &str, version: &str, fallback: bool) {
        if fallback {
            warn!(
                event = "model_loaded",
                host = %self.host,
                name = %name,
                version = %version,
                fallback = true,
                "Primary model unavailable, running on fallback model"
            );
        } else {
            info!(
                event = "model_loaded",
                host = %self.host,
                name = %name,
                version = %version,
                fallback = false,
                "Model loaded"
            );
        }
    }

    /// Log a model that failed to load
    pub fn log_model_load_failed(&self, name: &str, reason: &str) {
        error!(
            event = "model_load_failed",
            host = %self.host,
            name = %name,
            reason = %reason,
            "Model failed to load"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, model_version: &str, backend: &str) {
        info!(
            event = "agent_started",
            host = %self.host,
            agent_version = %version,
            model_version = %model_version,
            backend = %backend,
            "Flow guard agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host,
            reason = %reason,
            "Flow guard agent shutting down"
        );
    }
}
