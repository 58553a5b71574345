//! Linux netfilter backend driven through iptables/ip6tables

use super::{check_output, group_rules, ActiveBlock, CommandOutput, CommandRunner, FirewallBackend};
use crate::error::FirewallError;
use crate::models::{Direction, Offender, OffenderKey, PortMapping, Protocol};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marks rules owned by this backend so listing never touches foreign rules
const RULE_COMMENT: &str = "flowguard";

const IPTABLES: &str = "iptables";
const IP6TABLES: &str = "ip6tables";

pub struct IptablesBackend {
    interface: String,
    runner: Arc<dyn CommandRunner>,
    ipv6: bool,
}

impl IptablesBackend {
    /// Probe the tooling and build the backend
    pub fn new(interface: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Result<Self, FirewallError> {
        probe(runner.as_ref(), IPTABLES)?;
        let ipv6 = match probe(runner.as_ref(), IP6TABLES) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "ip6tables unavailable, IPv6 offenders cannot be blocked");
                false
            }
        };
        Ok(Self {
            interface: interface.into(),
            runner,
            ipv6,
        })
    }

    fn program_for(&self, addr: &IpAddr) -> Result<&'static str, FirewallError> {
        match addr {
            IpAddr::V4(_) => Ok(IPTABLES),
            IpAddr::V6(_) if self.ipv6 => Ok(IP6TABLES),
            IpAddr::V6(_) => Err(FirewallError::Unavailable {
                backend: IP6TABLES.to_string(),
                reason: "probe failed at startup".to_string(),
            }),
        }
    }

    /// Chain and match arguments for one (protocol, port) rule
    fn rule_spec(&self, key: &OffenderKey, mapping: &PortMapping) -> Vec<String> {
        let (chain, iface_flag, addr_flag) = match key.direction {
            Direction::Inbound => ("INPUT", "-i", "-s"),
            Direction::Outbound => ("OUTPUT", "-o", "-d"),
        };

        let mut spec = vec![
            chain.to_string(),
            iface_flag.to_string(),
            self.interface.clone(),
            addr_flag.to_string(),
            key.addr.to_string(),
            "-p".to_string(),
            protocol_name(mapping.protocol, &key.addr),
        ];
        if mapping.protocol.has_ports() {
            spec.push("--dport".to_string());
            spec.push(mapping.port.to_string());
        }
        spec.extend(
            ["-m", "comment", "--comment", RULE_COMMENT, "-j", "DROP"]
                .iter()
                .map(|s| s.to_string()),
        );
        spec
    }

    fn args(action: &str, spec: &[String]) -> Vec<String> {
        std::iter::once(action.to_string())
            .chain(spec.iter().cloned())
            .collect()
    }

    /// Run an action that must succeed
    fn exec(&self, program: &str, action: &str, spec: &[String]) -> Result<CommandOutput, FirewallError> {
        let args = Self::args(action, spec);
        let output = self.runner.run(program, &args)?;
        check_output(program, &args, output)
    }

    /// `-C` exits 0 when the rule exists and 1 when it does not
    fn rule_exists(&self, program: &str, spec: &[String]) -> Result<bool, FirewallError> {
        let args = Self::args("-C", spec);
        let output = self.runner.run(program, &args)?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => check_output(program, &args, output).map(|_| false),
        }
    }

    fn list_chain(
        &self,
        program: &str,
        chain: &str,
        direction: Direction,
    ) -> Result<Vec<(OffenderKey, PortMapping)>, FirewallError> {
        let output = self.exec(program, "-S", &[chain.to_string()])?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| parse_rule_line(line, direction))
            .collect())
    }
}

impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        IPTABLES
    }

    fn supports(&self, _direction: Direction) -> bool {
        true
    }

    fn install_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        let program = self.program_for(&offender.key.addr)?;
        for mapping in &offender.port_mappings {
            let spec = self.rule_spec(&offender.key, mapping);
            if self.rule_exists(program, &spec)? {
                debug!(offender = %offender.key, protocol = %mapping.protocol, port = mapping.port, "Rule already present");
                continue;
            }
            self.exec(program, "-I", &spec)?;
        }
        info!(
            offender = %offender.key,
            rules = offender.port_mappings.len(),
            interface = %self.interface,
            "Block installed"
        );
        Ok(())
    }

    fn remove_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        let program = self.program_for(&offender.key.addr)?;
        for mapping in &offender.port_mappings {
            let spec = self.rule_spec(&offender.key, mapping);
            if !self.rule_exists(program, &spec)? {
                continue;
            }
            self.exec(program, "-D", &spec)?;
        }
        info!(offender = %offender.key, "Block removed");
        Ok(())
    }

    fn active_blocks(&self) -> Result<Vec<ActiveBlock>, FirewallError> {
        let mut programs = vec![IPTABLES];
        if self.ipv6 {
            programs.push(IP6TABLES);
        }

        let mut rules = Vec::new();
        for program in programs {
            rules.extend(self.list_chain(program, "INPUT", Direction::Inbound)?);
            rules.extend(self.list_chain(program, "OUTPUT", Direction::Outbound)?);
        }
        Ok(group_rules(rules))
    }
}

fn probe(runner: &dyn CommandRunner, program: &str) -> Result<(), FirewallError> {
    let unavailable = |reason: String| FirewallError::Unavailable {
        backend: program.to_string(),
        reason,
    };
    match runner.run(program, &["--version".to_string()]) {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(unavailable(format!(
            "--version exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        ))),
        Err(e) => Err(unavailable(e.to_string())),
    }
}

fn protocol_name(protocol: Protocol, addr: &IpAddr) -> String {
    match (protocol, addr) {
        (Protocol::Icmp, IpAddr::V6(_)) => "ipv6-icmp".to_string(),
        (other, _) => other.to_string(),
    }
}

/// `-S` prints protocols by name when it knows one, from its builtin table
/// or `/etc/protocols`, and by number otherwise
fn listed_protocol(name: &str) -> Option<Protocol> {
    let number = match name.to_ascii_lowercase().as_str() {
        "ipv6-icmp" | "icmpv6" | "icmp6" => return Some(Protocol::Icmp),
        "igmp" => 2,
        "ipencap" => 4,
        "ipv6" => 41,
        "rsvp" => 46,
        "gre" => 47,
        "esp" => 50,
        "ah" => 51,
        "ipv6-mh" | "mh" => 135,
        "ospf" | "ospfigp" => 89,
        "pim" => 103,
        "vrrp" => 112,
        "l2tp" => 115,
        "sctp" => 132,
        "udplite" => 136,
        other => return other.parse().ok(),
    };
    Some(Protocol::from(number))
}

/// Extract the offender and port mapping from one `-S` line if the rule is ours
fn parse_rule_line(line: &str, direction: Direction) -> Option<(OffenderKey, PortMapping)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let value_of = |flag: &str| tokens.windows(2).find(|w| w[0] == flag).map(|w| w[1]);

    if value_of("--comment")?.trim_matches('"') != RULE_COMMENT {
        return None;
    }

    let addr_flag = match direction {
        Direction::Inbound => "-s",
        Direction::Outbound => "-d",
    };
    let addr = value_of(addr_flag)?.split('/').next()?.parse().ok()?;
    let protocol = listed_protocol(value_of("-p")?)?;
    let port = match value_of("--dport") {
        Some(port) => port.parse().ok()?,
        None => 0,
    };
    Some((OffenderKey::new(addr, direction), PortMapping { protocol, port }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::fake::{fail, ok, FakeRunner};
    use crate::models::BanState;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fake iptables keeping its rule set in memory
    fn netfilter() -> (Arc<FakeRunner>, Arc<Mutex<HashSet<String>>>) {
        let rules: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let state = rules.clone();
        let runner = FakeRunner::new(move |program, args| {
            let mut rules = state.lock().unwrap();
            let spec = format!("{} {}", program, args[1..].join(" "));
            match args[0].as_str() {
                "--version" => ok("iptables v1.8.9 (nf_tables)"),
                "-C" if rules.contains(&spec) => ok(""),
                "-C" => fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
                "-I" => {
                    rules.insert(spec);
                    ok("")
                }
                "-D" => {
                    if rules.remove(&spec) {
                        ok("")
                    } else {
                        fail(1, "iptables: Bad rule.")
                    }
                }
                "-S" => {
                    let prefix = format!("{} {} ", program, args[1]);
                    let listed: Vec<String> = rules
                        .iter()
                        .filter_map(|r| r.strip_prefix(&prefix))
                        .map(|rest| format!("-A {} {}", args[1], rest))
                        .collect();
                    ok(&format!("-P {} ACCEPT\n{}", args[1], listed.join("\n")))
                }
                _ => fail(2, "unexpected"),
            }
        });
        (Arc::new(runner), rules)
    }

    fn offender(addr: &str, direction: Direction, mappings: &[(Protocol, u16)]) -> Offender {
        Offender {
            key: OffenderKey::new(addr.parse().unwrap(), direction),
            violations: 4,
            port_mappings: mappings
                .iter()
                .map(|&(protocol, port)| PortMapping { protocol, port })
                .collect(),
            state: BanState::Banned { since_minute: 0 },
        }
    }

    #[test]
    fn test_install_is_idempotent() {
        let (runner, rules) = netfilter();
        let backend = IptablesBackend::new("eth0", runner.clone()).unwrap();
        let a = offender("10.0.0.1", Direction::Inbound, &[(Protocol::Tcp, 80)]);

        backend.install_block(&a).unwrap();
        backend.install_block(&a).unwrap();

        let rules = rules.lock().unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.contains(
            "iptables INPUT -i eth0 -s 10.0.0.1 -p tcp --dport 80 -m comment --comment flowguard -j DROP"
        ));
        let inserts = runner.calls().iter().filter(|c| c.starts_with("iptables -I")).count();
        assert_eq!(inserts, 1);
    }

    #[test]
    fn test_one_rule_per_port_mapping() {
        let (runner, rules) = netfilter();
        let backend = IptablesBackend::new("eth0", runner).unwrap();
        let a = offender(
            "10.0.0.2",
            Direction::Outbound,
            &[(Protocol::Tcp, 80), (Protocol::Udp, 53), (Protocol::Icmp, 0)],
        );

        backend.install_block(&a).unwrap();

        let rules = rules.lock().unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.contains("OUTPUT -o eth0 -d 10.0.0.2")));
        assert!(rules.iter().any(|r| r.contains("-p icmp -m comment")));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (runner, rules) = netfilter();
        let backend = IptablesBackend::new("eth0", runner).unwrap();
        let a = offender("10.0.0.3", Direction::Inbound, &[(Protocol::Tcp, 22)]);

        backend.remove_block(&a).unwrap();
        backend.install_block(&a).unwrap();
        backend.remove_block(&a).unwrap();
        backend.remove_block(&a).unwrap();
        assert!(rules.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ipv6_uses_ip6tables() {
        let (runner, rules) = netfilter();
        let backend = IptablesBackend::new("eth0", runner).unwrap();
        let a = offender("2001:db8::1", Direction::Inbound, &[(Protocol::Icmp, 0)]);

        backend.install_block(&a).unwrap();
        let rules = rules.lock().unwrap();
        let rule = rules.iter().next().unwrap();
        assert!(rule.starts_with("ip6tables INPUT"));
        assert!(rule.contains("-p ipv6-icmp"));
    }

    #[test]
    fn test_active_blocks_lists_only_owned_rules() {
        let (runner, rules) = netfilter();
        let backend = IptablesBackend::new("eth0", runner).unwrap();
        backend
            .install_block(&offender("10.0.0.4", Direction::Inbound, &[(Protocol::Tcp, 80), (Protocol::Tcp, 443)]))
            .unwrap();
        backend
            .install_block(&offender("10.0.0.5", Direction::Outbound, &[(Protocol::Udp, 53)]))
            .unwrap();
        rules
            .lock()
            .unwrap()
            .insert("iptables INPUT -s 10.9.9.9 -j DROP".to_string());

        let active = backend.active_blocks().unwrap();
        let keys: Vec<OffenderKey> = active.iter().map(|b| b.key).collect();
        assert_eq!(
            keys,
            vec![
                OffenderKey::new("10.0.0.4".parse().unwrap(), Direction::Inbound),
                OffenderKey::new("10.0.0.5".parse().unwrap(), Direction::Outbound),
            ]
        );
        assert_eq!(active[0].port_mappings.len(), 2);

        // What was listed is enough to remove it again
        backend.remove_block(&active[0].to_offender()).unwrap();
        backend.remove_block(&active[1].to_offender()).unwrap();
        assert_eq!(rules.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_rule_line() {
        let line = "-A INPUT -s 10.0.0.1/32 -i eth0 -p tcp -m tcp --dport 80 -m comment --comment flowguard -j DROP";
        assert_eq!(
            parse_rule_line(line, Direction::Inbound),
            Some((
                OffenderKey::new("10.0.0.1".parse().unwrap(), Direction::Inbound),
                PortMapping { protocol: Protocol::Tcp, port: 80 }
            ))
        );
        assert_eq!(parse_rule_line("-A INPUT -s 10.0.0.1/32 -j DROP", Direction::Inbound), None);
    }

    #[test]
    fn test_parse_named_protocols() {
        let line = "-A INPUT -s 10.0.0.2/32 -p gre -m comment --comment flowguard -j DROP";
        assert_eq!(
            parse_rule_line(line, Direction::Inbound),
            Some((
                OffenderKey::new("10.0.0.2".parse().unwrap(), Direction::Inbound),
                PortMapping { protocol: Protocol::Other(47), port: 0 }
            ))
        );

        assert_eq!(listed_protocol("sctp"), Some(Protocol::Other(132)));
        assert_eq!(listed_protocol("ipv6-icmp"), Some(Protocol::Icmp));
        assert_eq!(listed_protocol("UDP"), Some(Protocol::Udp));
        assert_eq!(listed_protocol("253"), Some(Protocol::Other(253)));
        assert_eq!(listed_protocol("nonsense"), None);
    }

    #[test]
    fn test_command_failure_surfaces() {
        let runner = Arc::new(FakeRunner::new(|_, args| match args[0].as_str() {
            "--version" => ok("iptables v1.8.9"),
            "-C" => fail(1, ""),
            _ => fail(4, "iptables: Resource temporarily unavailable."),
        }));
        let backend = IptablesBackend::new("eth0", runner).unwrap();
        let err = backend
            .install_block(&offender("10.0.0.6", Direction::Inbound, &[(Protocol::Tcp, 80)]))
            .unwrap_err();
        assert!(matches!(err, FirewallError::CommandFailed { exit_code: 4, .. }));
    }
}
