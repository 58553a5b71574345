//! Windows Defender Firewall backend driven through netsh

use super::{check_output, group_rules, ActiveBlock, CommandOutput, CommandRunner, FirewallBackend};
use crate::error::FirewallError;
use crate::models::{Direction, Offender, OffenderKey, PortMapping, Protocol};
use std::sync::Arc;
use tracing::{debug, info};

const NETSH: &str = "netsh";
const RULE_PREFIX: &str = "FlowGuard_Block_";

pub struct NetshBackend {
    runner: Arc<dyn CommandRunner>,
}

impl NetshBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Result<Self, FirewallError> {
        let args = firewall_args(&["show", "currentprofile"]);
        match runner.run(NETSH, &args) {
            Ok(output) if output.success() => Ok(Self { runner }),
            Ok(output) => Err(FirewallError::Unavailable {
                backend: NETSH.to_string(),
                reason: format!("exit code {}: {}", output.exit_code, output.stdout.trim()),
            }),
            Err(e) => Err(FirewallError::Unavailable {
                backend: NETSH.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn run(&self, args: Vec<String>) -> Result<CommandOutput, FirewallError> {
        let output = self.runner.run(NETSH, &args)?;
        check_output(NETSH, &args, output)
    }

    fn rule_exists(&self, name: &str) -> Result<bool, FirewallError> {
        let args = advfirewall(&["show", "rule", &format!("name={}", name)]);
        // netsh exits 1 with "No rules match" when the rule is absent
        Ok(self.runner.run(NETSH, &args)?.success())
    }
}

impl FirewallBackend for NetshBackend {
    fn name(&self) -> &'static str {
        NETSH
    }

    fn supports(&self, _direction: Direction) -> bool {
        true
    }

    fn install_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        for mapping in &offender.port_mappings {
            let name = rule_name(&offender.key, mapping);
            if self.rule_exists(&name)? {
                debug!(rule = %name, "Rule already present");
                continue;
            }

            let dir = match offender.key.direction {
                Direction::Inbound => "dir=in",
                Direction::Outbound => "dir=out",
            };
            let mut fields = vec![
                "add".to_string(),
                "rule".to_string(),
                format!("name={}", name),
                dir.to_string(),
                "action=block".to_string(),
                format!("remoteip={}", offender.key.addr),
                format!("protocol={}", netsh_protocol(mapping.protocol, &offender.key)),
                "enable=yes".to_string(),
            ];
            if mapping.protocol.has_ports() {
                // The violating port is the flow's destination
                let port_field = match offender.key.direction {
                    Direction::Inbound => "localport",
                    Direction::Outbound => "remoteport",
                };
                fields.push(format!("{}={}", port_field, mapping.port));
            }
            let mut args = advfirewall(&[]);
            args.extend(fields);
            self.run(args)?;
        }
        info!(offender = %offender.key, rules = offender.port_mappings.len(), "Block installed");
        Ok(())
    }

    fn remove_block(&self, offender: &Offender) -> Result<(), FirewallError> {
        for mapping in &offender.port_mappings {
            let name = rule_name(&offender.key, mapping);
            if !self.rule_exists(&name)? {
                continue;
            }
            self.run(advfirewall(&["delete", "rule", &format!("name={}", name)]))?;
        }
        info!(offender = %offender.key, "Block removed");
        Ok(())
    }

    fn active_blocks(&self) -> Result<Vec<ActiveBlock>, FirewallError> {
        let output = self.run(advfirewall(&["show", "rule", "name=all"]))?;
        let rules: Vec<(OffenderKey, PortMapping)> = output
            .stdout
            .lines()
            .filter_map(|line| {
                let (label, value) = line.split_once(':')?;
                if label.trim() != "Rule Name" {
                    return None;
                }
                parse_rule_name(value.trim())
            })
            .collect();
        Ok(group_rules(rules))
    }
}

fn firewall_args(rest: &[&str]) -> Vec<String> {
    ["advfirewall"]
        .iter()
        .chain(rest.iter())
        .map(|s| s.to_string())
        .collect()
}

fn advfirewall(rest: &[&str]) -> Vec<String> {
    let mut args = firewall_args(&["firewall"]);
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

fn netsh_protocol(protocol: Protocol, key: &OffenderKey) -> String {
    match protocol {
        Protocol::Tcp => "TCP".to_string(),
        Protocol::Udp => "UDP".to_string(),
        Protocol::Icmp if key.addr.is_ipv6() => "ICMPv6".to_string(),
        Protocol::Icmp => "ICMPv4".to_string(),
        Protocol::Other(n) => n.to_string(),
    }
}

/// `FlowGuard_Block_<in|out>_<proto>_<port|any>_<addr>`
fn rule_name(key: &OffenderKey, mapping: &PortMapping) -> String {
    let dir = match key.direction {
        Direction::Inbound => "in",
        Direction::Outbound => "out",
    };
    let port = if mapping.protocol.has_ports() {
        mapping.port.to_string()
    } else {
        "any".to_string()
    };
    format!("{}{}_{}_{}_{}", RULE_PREFIX, dir, mapping.protocol, port, key.addr)
}

fn parse_rule_name(name: &str) -> Option<(OffenderKey, PortMapping)> {
    let rest = name.strip_prefix(RULE_PREFIX)?;
    let mut parts = rest.splitn(4, '_');
    let direction = match parts.next()? {
        "in" => Direction::Inbound,
        "out" => Direction::Outbound,
        _ => return None,
    };
    let protocol: Protocol = parts.next()?.parse().ok()?;
    let port = match parts.next()? {
        "any" => 0,
        port => port.parse().ok()?,
    };
    let addr = parts.next()?.parse().ok()?;
    Some((OffenderKey::new(addr, direction), PortMapping { protocol, port }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::fake::{fail, ok, FakeRunner};
    use crate::models::BanState;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn field<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
        args.iter()
            .find_map(|a| a.strip_prefix(key).and_then(|v| v.strip_prefix('=')))
    }

    /// Fake netsh keeping rules by name
    fn windows_firewall() -> (Arc<FakeRunner>, Arc<Mutex<BTreeMap<String, String>>>) {
        let rules: Arc<Mutex<BTreeMap<String, String>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let state = rules.clone();
        let runner = FakeRunner::new(move |_, args| {
            let mut rules = state.lock().unwrap();
            let verb = args.get(2).map(String::as_str);
            let name = field(args, "name").unwrap_or_default().to_string();
            match (args.get(1).map(String::as_str), verb) {
                (Some("show"), _) => ok("Domain Profile Settings:\nState ON"),
                (Some("firewall"), Some("add")) => {
                    rules.insert(name, args.join(" "));
                    ok("Ok.")
                }
                (Some("firewall"), Some("show")) if name == "all" => {
                    let listing: Vec<String> = rules
                        .keys()
                        .map(|n| format!("Rule Name:                            {}\nEnabled: Yes\n", n))
                        .chain(std::iter::once("Rule Name:   Core Networking - DNS".to_string()))
                        .collect();
                    ok(&listing.join("\n"))
                }
                (Some("firewall"), Some("show")) if rules.contains_key(&name) => ok("Rule Name: x"),
                (Some("firewall"), Some("show")) => fail(1, "No rules match the specified criteria."),
                (Some("firewall"), Some("delete")) => {
                    rules.remove(&name);
                    ok("Deleted 1 rule(s).")
                }
                _ => fail(1, "unexpected"),
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
    fn test_install_idempotent_and_scoped() {
        let (runner, rules) = windows_firewall();
        let backend = NetshBackend::new(runner).unwrap();
        let a = offender("10.0.0.1", Direction::Inbound, &[(Protocol::Tcp, 80)]);

        backend.install_block(&a).unwrap();
        backend.install_block(&a).unwrap();

        let rules = rules.lock().unwrap();
        assert_eq!(rules.len(), 1);
        let command = rules.get("FlowGuard_Block_in_tcp_80_10.0.0.1").unwrap();
        assert!(command.contains("dir=in"));
        assert!(command.contains("remoteip=10.0.0.1"));
        assert!(command.contains("protocol=TCP"));
        assert!(command.contains("localport=80"));
    }

    #[test]
    fn test_outbound_uses_remote_port() {
        let (runner, rules) = windows_firewall();
        let backend = NetshBackend::new(runner).unwrap();
        backend
            .install_block(&offender("10.0.0.2", Direction::Outbound, &[(Protocol::Udp, 53), (Protocol::Icmp, 0)]))
            .unwrap();

        let rules = rules.lock().unwrap();
        assert!(rules["FlowGuard_Block_out_udp_53_10.0.0.2"].contains("remoteport=53"));
        assert!(rules["FlowGuard_Block_out_icmp_any_10.0.0.2"].contains("protocol=ICMPv4"));
    }

    #[test]
    fn test_remove_and_list() {
        let (runner, rules) = windows_firewall();
        let backend = NetshBackend::new(runner).unwrap();
        let a = offender("10.0.0.3", Direction::Inbound, &[(Protocol::Tcp, 80)]);
        let b = offender("2001:db8::7", Direction::Outbound, &[(Protocol::Tcp, 443)]);
        backend.install_block(&a).unwrap();
        backend.install_block(&b).unwrap();

        let keys: Vec<OffenderKey> = backend.active_blocks().unwrap().iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![a.key, b.key]);

        backend.remove_block(&a).unwrap();
        backend.remove_block(&a).unwrap();
        assert_eq!(rules.lock().unwrap().len(), 1);
        let active = backend.active_blocks().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, b.key);
        assert_eq!(active[0].port_mappings, b.port_mappings);
    }

    #[test]
    fn test_rule_name_roundtrip() {
        let key = OffenderKey::new("2001:db8::1".parse().unwrap(), Direction::Outbound);
        let mapping = PortMapping { protocol: Protocol::Tcp, port: 22 };
        let name = rule_name(&key, &mapping);
        assert_eq!(parse_rule_name(&name), Some((key, mapping)));
        assert_eq!(parse_rule_name("Core Networking - DNS"), None);
    }
}
