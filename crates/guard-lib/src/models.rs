//! Core data models for the flow guard

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Transport protocol of a flow, as reported by the flow exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Any other IANA protocol number
    Other(u8),
}

impl Protocol {
    /// IANA protocol number
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
            Protocol::Other(n) => *n,
        }
    }

    /// Whether rules for this protocol can be narrowed by destination port
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl From<u8> for Protocol {
    fn from(value: u8) -> Self {
        match value {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            n => Protocol::Other(n),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            _ => {
                // Exporters write the number, sometimes as a float ("6.0")
                let value: f64 = trimmed
                    .parse()
                    .map_err(|_| format!("invalid protocol '{}'", s))?;
                if value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
                    return Err(format!("invalid protocol '{}'", s));
                }
                Ok(Protocol::from(value as u8))
            }
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Other(n) => write!(f, "{}", n),
        }
    }
}

/// Identifying fields of a flow, kept apart from the numeric features
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Ground-truth label of a training flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    Benign,
    Attack,
}

impl Label {
    /// Binarize a raw label cell: "ddos" is an attack, everything else benign
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("ddos") {
            Label::Attack
        } else {
            Label::Benign
        }
    }

    pub fn as_binary(&self) -> u8 {
        match self {
            Label::Benign => 0,
            Label::Attack => 1,
        }
    }
}

/// One observed connection after parsing, before sanitizing
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub metadata: FlowMetadata,
    /// Numeric features in schema order; may still hold NaN or infinities
    pub values: Vec<f64>,
    pub label: Option<Label>,
}

/// Finite numeric projection of a flow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector, replacing every non-finite value with zero
    pub fn sanitized(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|v| if v.is_finite() { v } else { 0.0 })
                .collect(),
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<&FlowRecord> for FeatureVector {
    fn from(record: &FlowRecord) -> Self {
        FeatureVector::sanitized(record.values.iter().copied())
    }
}

/// Classifier output for a single flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Benign,
    Attack,
}

impl Verdict {
    pub fn is_attack(&self) -> bool {
        matches!(self, Verdict::Attack)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Benign => write!(f, "benign"),
            Verdict::Attack => write!(f, "attack"),
        }
    }
}

/// Traffic direction relative to the protected host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Identity of an offender: remote address scoped by direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffenderKey {
    pub addr: IpAddr,
    pub direction: Direction,
}

impl OffenderKey {
    pub fn new(addr: IpAddr, direction: Direction) -> Self {
        Self { addr, direction }
    }
}

impl fmt::Display for OffenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.direction)
    }
}

/// A (protocol, destination port) pair seen in a violating flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub port: u16,
}

/// Ban state of a tracked offender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BanState {
    Tracked,
    Banned { since_minute: i64 },
}

/// Per-source violation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub key: OffenderKey,
    pub violations: u32,
    pub port_mappings: BTreeSet<PortMapping>,
    pub state: BanState,
}

impl Offender {
    pub fn new(key: OffenderKey) -> Self {
        Self {
            key,
            violations: 0,
            port_mappings: BTreeSet::new(),
            state: BanState::Tracked,
        }
    }

    pub fn is_banned(&self) -> bool {
        matches!(self.state, BanState::Banned { .. })
    }

    pub fn banned_since(&self) -> Option<i64> {
        match self.state {
            BanState::Banned { since_minute } => Some(since_minute),
            BanState::Tracked => None,
        }
    }
}

/// An active ban, as seen by operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub key: OffenderKey,
    pub since_minute: i64,
}

/// Outcome of feeding one classified flow into the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoAction,
    Ban(Offender),
    Unban(Offender),
}

impl Decision {
    pub fn is_action(&self) -> bool {
        !matches!(self, Decision::NoAction)
    }
}

/// Runtime summary reported by the agent's status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_version: String,
    pub host: String,
    pub backend: String,
    pub model_version: Option<String>,
    pub tracked: usize,
    pub banned: usize,
    /// Enforcement actions waiting for the retry tick
    pub enforcement_pending: usize,
    pub naughty_count: u32,
    pub ban_duration_minutes: i64,
    pub uptime_secs: i64,
}
