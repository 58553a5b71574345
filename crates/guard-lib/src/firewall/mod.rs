//! Firewall enforcement backends
//!
//! A backend turns a banned offender into drop rules, one per observed
//! (protocol, destination port) pair, scoped to the offender address and
//! direction. Installing is idempotent and removing an absent block is a
//! no-op, so callers can retry freely.

mod iptables;
mod memory;
mod netsh;
mod runner;

pub use iptables::IptablesBackend;
pub use memory::MemoryBackend;
pub use netsh::NetshBackend;
pub use runner::{CommandOutput, CommandRunner, SystemRunner};

use crate::error::FirewallError;
use crate::models::{BanState, Direction, Offender, OffenderKey, PortMapping};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Trait for firewall backends
pub trait FirewallBackend: Send + Sync {
    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;

    /// Whether rules can be installed for this direction
    fn supports(&self, direction: Direction) -> bool;

    /// Install drop rules for every port mapping of the offender
    fn install_block(&self, offender: &Offender) -> Result<(), FirewallError>;

    /// Remove the offender's drop rules
    fn remove_block(&self, offender: &Offender) -> Result<(), FirewallError>;

    /// Blocks currently installed by this backend, one entry per offender
    fn active_blocks(&self) -> Result<Vec<ActiveBlock>, FirewallError>;
}

/// Rules installed for one offender, as read back from the firewall
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBlock {
    pub key: OffenderKey,
    pub port_mappings: BTreeSet<PortMapping>,
}

impl ActiveBlock {
    /// Offender shape accepted by `remove_block`
    pub fn to_offender(&self) -> Offender {
        Offender {
            key: self.key,
            violations: 0,
            port_mappings: self.port_mappings.clone(),
            state: BanState::Tracked,
        }
    }
}

/// Group parsed rules by offender
pub(crate) fn group_rules(rules: impl IntoIterator<Item = (OffenderKey, PortMapping)>) -> Vec<ActiveBlock> {
    let mut grouped: BTreeMap<OffenderKey, BTreeSet<PortMapping>> = BTreeMap::new();
    for (key, mapping) in rules {
        grouped.entry(key).or_default().insert(mapping);
    }
    grouped
        .into_iter()
        .map(|(key, port_mappings)| ActiveBlock { key, port_mappings })
        .collect()
}

/// Which backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pick by target operating system
    #[default]
    Auto,
    Iptables,
    Netsh,
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "iptables" => Ok(BackendKind::Iptables),
            "netsh" => Ok(BackendKind::Netsh),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown firewall backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::Iptables => "iptables",
            BackendKind::Netsh => "netsh",
            BackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Resolve `Auto` for the platform this binary was built for
pub fn resolve_kind(kind: BackendKind) -> Result<BackendKind, FirewallError> {
    match kind {
        BackendKind::Auto if cfg!(target_os = "linux") => Ok(BackendKind::Iptables),
        BackendKind::Auto if cfg!(target_os = "windows") => Ok(BackendKind::Netsh),
        BackendKind::Auto => Err(FirewallError::Unsupported {
            platform: std::env::consts::OS.to_string(),
        }),
        explicit => Ok(explicit),
    }
}

/// Construct a backend, probing that its tooling is present
pub fn create_backend(
    kind: BackendKind,
    interface: &str,
) -> Result<Arc<dyn FirewallBackend>, FirewallError> {
    create_backend_with_runner(kind, interface, Arc::new(SystemRunner))
}

/// Like [`create_backend`], with an explicit command runner
pub fn create_backend_with_runner(
    kind: BackendKind,
    interface: &str,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn FirewallBackend>, FirewallError> {
    let backend: Arc<dyn FirewallBackend> = match resolve_kind(kind)? {
        BackendKind::Iptables => Arc::new(IptablesBackend::new(interface, runner)?),
        BackendKind::Netsh => Arc::new(NetshBackend::new(runner)?),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Auto => {
            return Err(FirewallError::Unsupported {
                platform: std::env::consts::OS.to_string(),
            })
        }
    };
    info!(backend = backend.name(), interface = %interface, "Firewall backend ready");
    Ok(backend)
}

/// Map a failed command to an error
pub(crate) fn check_output(
    program: &str,
    args: &[String],
    output: CommandOutput,
) -> Result<CommandOutput, FirewallError> {
    if output.success() {
        Ok(output)
    } else {
        Err(FirewallError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}
