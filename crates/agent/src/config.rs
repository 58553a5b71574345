//! Agent configuration

use anyhow::{Context, Result};
use guard_lib::enforcement::EnforcementConfig;
use guard_lib::firewall::BackendKind;
use guard_lib::pipeline::PipelineConfig;
use guard_lib::tracker::{TrackerConfig, DEFAULT_BAN_DURATION_MINUTES, DEFAULT_NAUGHTY_COUNT};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Host name reported in logs and status
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// CSV file the flow exporter keeps rewriting
    #[serde(default = "default_flow_path")]
    pub flow_path: PathBuf,

    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Tried when the primary model cannot be loaded
    #[serde(default)]
    pub fallback_model_name: Option<String>,

    /// Interface firewall rules are bound to
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_naughty_count")]
    pub naughty_count: u32,

    #[serde(default = "default_ban_duration")]
    pub ban_duration_minutes: i64,

    /// Addresses of this host; flows leaving them are outbound
    #[serde(default)]
    pub local_addrs: Vec<IpAddr>,

    #[serde(default)]
    pub retain_history: bool,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    #[serde(default = "default_enforcement_queue")]
    pub enforcement_queue: usize,

    #[serde(default = "default_scoring_workers")]
    pub scoring_workers: usize,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_flow_path() -> PathBuf {
    PathBuf::from("./flow_output/out.pcap_Flow.csv")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./etc/models")
}

fn default_model_name() -> String {
    "latest.json".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_naughty_count() -> u32 {
    DEFAULT_NAUGHTY_COUNT
}

fn default_ban_duration() -> i64 {
    DEFAULT_BAN_DURATION_MINUTES
}

fn default_poll_interval() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_retry_interval() -> u64 {
    30
}

fn default_enforcement_queue() -> usize {
    1024
}

fn default_scoring_workers() -> usize {
    4
}

fn default_drain_timeout() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from an optional file (`FLOWGUARD_CONFIG`) and
    /// `FLOWGUARD_*` environment variables, the latter taking precedence
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("FLOWGUARD_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("FLOWGUARD")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("local_addrs"),
        );
        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = builder.build().context("Failed to read agent configuration")?;
        let agent: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;

        if agent.ban_duration_minutes <= 0 {
            anyhow::bail!(
                "ban_duration_minutes must be positive, got {}",
                agent.ban_duration_minutes
            );
        }
        Ok(agent)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            naughty_count: self.naughty_count,
            ban_duration_minutes: self.ban_duration_minutes,
            local_addrs: self.local_addrs.iter().copied().collect(),
            retain_history: self.retain_history,
        }
    }

    pub fn enforcement_config(&self) -> EnforcementConfig {
        EnforcementConfig {
            queue_capacity: self.enforcement_queue,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            scoring_workers: self.scoring_workers,
            ..PipelineConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn from_json(json: &str) -> Result<AgentConfig> {
        AgentConfig::from_builder(
            config::Config::builder().add_source(File::from_str(json, FileFormat::Json)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = from_json("{}").unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.model_name, "latest.json");
        assert_eq!(config.fallback_model_name, None);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.naughty_count, 3);
        assert_eq!(config.ban_duration_minutes, 60);
        assert!(!config.retain_history);
        assert_eq!(config.enforcement_config().queue_capacity, 1024);
        assert_eq!(config.pipeline_config().scoring_workers, 4);
    }

    #[test]
    fn test_overrides() {
        let config = from_json(
            r#"{
                "backend": "memory",
                "naughty_count": 5,
                "local_addrs": ["192.168.1.10", "fe80::1"],
                "fallback_model_name": "previous.json",
                "retain_history": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Memory);
        let tracker = config.tracker_config();
        assert_eq!(tracker.naughty_count, 5);
        assert_eq!(tracker.local_addrs.len(), 2);
        assert!(tracker.retain_history);
        assert_eq!(config.fallback_model_name.as_deref(), Some("previous.json"));
    }

    #[test]
    fn test_rejects_non_positive_ban_duration() {
        assert!(from_json(r#"{"ban_duration_minutes": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(from_json(r#"{"backend": "pf"}"#).is_err());
    }
}
