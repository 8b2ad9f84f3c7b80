//! `iptables-restore` style rule fragments.
use chain_render_common::{Action, Chain, ChainRule, Criterion, MatchCriteria, PortRange};

/// `-A <chain> [comments] <match> <action>` for every rule.
pub fn render_chain(chain: &Chain) -> Vec<String> {
    chain
        .rules
        .iter()
        .map(|rule| format!("-A {} {}", chain.name, render_rule(rule)))
        .collect()
}

/// A rule without its `-A <chain>` head.
pub fn render_rule(rule: &ChainRule) -> String {
    let mut parts: Vec<String> = rule
        .comments
        .iter()
        .map(|comment| format!("-m comment --comment \"{}\"", comment.replace('"', "'")))
        .collect();
    let match_criteria = render_match(&rule.match_criteria);
    if !match_criteria.is_empty() {
        parts.push(match_criteria);
    }
    if let Some(action) = &rule.action {
        parts.push(render_action(action));
    }
    parts.join(" ")
}

pub fn render_match(match_criteria: &MatchCriteria) -> String {
    match_criteria
        .criteria()
        .iter()
        .map(render_criterion)
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_criterion(criterion: &Criterion) -> String {
    match criterion {
        Criterion::Protocol(p) => format!("-p {p}"),
        Criterion::NotProtocol(p) => format!("! -p {p}"),
        Criterion::SourceNet(net) => format!("--source {net}"),
        Criterion::NotSourceNet(net) => format!("! --source {net}"),
        Criterion::DestNet(net) => format!("--destination {net}"),
        Criterion::NotDestNet(net) => format!("! --destination {net}"),
        Criterion::SourceIpSet(name) => format!("-m set --match-set {name} src"),
        Criterion::NotSourceIpSet(name) => format!("-m set ! --match-set {name} src"),
        Criterion::DestIpSet(name) => format!("-m set --match-set {name} dst"),
        Criterion::NotDestIpSet(name) => format!("-m set ! --match-set {name} dst"),
        Criterion::SourceIpPortSet(name) => format!("-m set --match-set {name} src,src"),
        Criterion::NotSourceIpPortSet(name) => format!("-m set ! --match-set {name} src,src"),
        Criterion::DestIpPortSet(name) => format!("-m set --match-set {name} dst,dst"),
        Criterion::NotDestIpPortSet(name) => format!("-m set ! --match-set {name} dst,dst"),
        Criterion::SourceDestIpSet(name) => format!("-m set --match-set {name} src,dst"),
        Criterion::SourcePorts(ports) => format!("-m multiport --source-ports {}", port_list(ports)),
        Criterion::NotSourcePorts(ports) => {
            format!("-m multiport ! --source-ports {}", port_list(ports))
        }
        Criterion::DestPorts(ports) => {
            format!("-m multiport --destination-ports {}", port_list(ports))
        }
        Criterion::NotDestPorts(ports) => {
            format!("-m multiport ! --destination-ports {}", port_list(ports))
        }
        Criterion::Icmp {
            v6,
            icmp_type,
            code,
            negated,
        } => {
            let (module, flag) = if *v6 {
                ("icmp6", "--icmpv6-type")
            } else {
                ("icmp", "--icmp-type")
            };
            let not = if *negated { "! " } else { "" };
            match code {
                Some(code) => format!("-m {module} {not}{flag} {icmp_type}/{code}"),
                None => format!("-m {module} {not}{flag} {icmp_type}"),
            }
        }
        Criterion::Mark {
            mark,
            mask,
            negated,
        } => {
            let not = if *negated { "! " } else { "" };
            format!("-m mark {not}--mark {}/{mask:#x}", hex_or_zero(*mark))
        }
        Criterion::ConntrackState { states, negated } => {
            let not = if *negated { "! " } else { "" };
            format!("-m conntrack {not}--ctstate {states}")
        }
        Criterion::ConntrackOrigDest(addr) => format!("-m conntrack --ctorigdst {addr}"),
        Criterion::ConntrackOrigDestPort(port) => format!("-m conntrack --ctorigdstport {port}"),
        Criterion::InInterface(iface) => format!("--in-interface {iface}"),
        Criterion::OutInterface(iface) => format!("--out-interface {iface}"),
        Criterion::SourceAddrTypeLocal {
            limit_iface_out,
            negated,
        } => {
            let not = if *negated { "! " } else { "" };
            let limit = if *limit_iface_out {
                " --limit-iface-out"
            } else {
                ""
            };
            format!("-m addrtype {not}--src-type LOCAL{limit}")
        }
        Criterion::DestAddrTypeLocal => "-m addrtype --dst-type LOCAL".to_string(),
        Criterion::RpfCheckFailed { accept_local } => {
            if *accept_local {
                "-m rpfilter --invert --validmark --accept-local".to_string()
            } else {
                "-m rpfilter --invert --validmark".to_string()
            }
        }
    }
}

pub fn render_action(action: &Action) -> String {
    match action {
        Action::Accept => "--jump ACCEPT".to_string(),
        Action::Drop => "--jump DROP".to_string(),
        Action::Reject => "--jump REJECT".to_string(),
        Action::Return => "--jump RETURN".to_string(),
        Action::Jump { target } => format!("--jump {target}"),
        Action::Goto { target } => format!("--goto {target}"),
        Action::Log { prefix } => format!("--jump LOG --log-prefix \"{prefix}: \" --log-level 5"),
        Action::Nflog {
            group,
            prefix,
            size,
        } => {
            if *size == 0 {
                format!("--jump NFLOG --nflog-group {group} --nflog-prefix {prefix} --nflog-range 80")
            } else {
                format!("--jump NFLOG --nflog-group {group} --nflog-prefix {prefix} --nflog-size {size}")
            }
        }
        Action::SetMark { mark } => format!("--jump MARK --set-mark {mark:#x}/{mark:#x}"),
        Action::SetMaskedMark { mark, mask } => {
            format!("--jump MARK --set-mark {mark:#x}/{mask:#x}")
        }
        Action::ClearMark { mark } => format!("--jump MARK --set-mark 0/{mark:#x}"),
        Action::Masquerade { to_ports } => match to_ports {
            Some(ports) => format!("--jump MASQUERADE --to-ports {ports}"),
            None => "--jump MASQUERADE".to_string(),
        },
        Action::Snat { to_address } => format!("--jump SNAT --to-source {to_address}"),
        Action::Dnat { address, port } => match (address, port) {
            (_, None) => format!("--jump DNAT --to-destination {address}"),
            (std::net::IpAddr::V4(_), Some(port)) => {
                format!("--jump DNAT --to-destination {address}:{port}")
            }
            (std::net::IpAddr::V6(_), Some(port)) => {
                format!("--jump DNAT --to-destination [{address}]:{port}")
            }
        },
        Action::NoTrack => "--jump NOTRACK".to_string(),
        Action::Nfqueue { queue } => format!("--jump NFQUEUE --queue-num {queue}"),
        Action::NfqueueWithBypass { queue } => {
            format!("--jump NFQUEUE --queue-num {queue} --queue-bypass")
        }
        Action::SaveConnMark { mask } => {
            format!("--jump CONNMARK --save-mark --mask {mask:#x}")
        }
        Action::RestoreConnMark { mask } => {
            format!("--jump CONNMARK --restore-mark --mask {mask:#x}")
        }
        Action::SetConnMark { mark, mask } => {
            format!("--jump CONNMARK --set-mark {mark:#x}/{mask:#x}")
        }
        Action::Tproxy { mark, mask, port } => {
            format!("--jump TPROXY --on-port {port} --tproxy-mark {mark:#x}/{mask:#x}")
        }
        Action::ChecksumFill => "--jump CHECKSUM --checksum-fill".to_string(),
    }
}

fn port_list(ports: &[PortRange]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// iptables prints a zero mark value as plain 0.
fn hex_or_zero(value: u32) -> String {
    if value == 0 {
        "0".to_string()
    } else {
        format!("{value:#x}")
    }
}
