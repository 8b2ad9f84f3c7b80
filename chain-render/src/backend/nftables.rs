//! `nft -f` style rules for the `calico` table of the matching family.
use std::net::IpAddr;

use chain_render_common::{Action, Chain, ChainRule, Criterion, IpVersion, MatchCriteria, PortRange};

pub const TABLE_NAME: &str = "calico";

fn family(ip_version: IpVersion) -> &'static str {
    match ip_version {
        IpVersion::V4 => "ip",
        IpVersion::V6 => "ip6",
    }
}

pub fn render_chain(ip_version: IpVersion, chain: &Chain) -> Vec<String> {
    let family = family(ip_version);
    chain
        .rules
        .iter()
        .map(|rule| {
            format!(
                "add rule {family} {TABLE_NAME} {} {}",
                chain.name,
                render_rule(ip_version, rule)
            )
        })
        .collect()
}

/// A rule without its `add rule` head. Comments go last, joined into one.
pub fn render_rule(ip_version: IpVersion, rule: &ChainRule) -> String {
    let mut parts = Vec::new();
    let match_criteria = render_match(ip_version, &rule.match_criteria);
    if !match_criteria.is_empty() {
        parts.push(match_criteria);
    }
    if let Some(action) = &rule.action {
        parts.push(render_action(action));
    }
    if !rule.comments.is_empty() {
        parts.push(format!(
            "comment \"{}\"",
            rule.comments.join("; ").replace('"', "'")
        ));
    }
    parts.join(" ")
}

pub fn render_match(ip_version: IpVersion, match_criteria: &MatchCriteria) -> String {
    match_criteria
        .criteria()
        .iter()
        .map(|criterion| render_criterion(family(ip_version), criterion))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_criterion(family: &str, criterion: &Criterion) -> String {
    let not = |negated: bool| if negated { "!= " } else { "" };
    match criterion {
        Criterion::Protocol(p) => format!("meta l4proto {p}"),
        Criterion::NotProtocol(p) => format!("meta l4proto != {p}"),
        Criterion::SourceNet(net) => format!("{family} saddr {net}"),
        Criterion::NotSourceNet(net) => format!("{family} saddr != {net}"),
        Criterion::DestNet(net) => format!("{family} daddr {net}"),
        Criterion::NotDestNet(net) => format!("{family} daddr != {net}"),
        Criterion::SourceIpSet(name) => format!("{family} saddr @{name}"),
        Criterion::NotSourceIpSet(name) => format!("{family} saddr != @{name}"),
        Criterion::DestIpSet(name) => format!("{family} daddr @{name}"),
        Criterion::NotDestIpSet(name) => format!("{family} daddr != @{name}"),
        Criterion::SourceIpPortSet(name) => {
            format!("{family} saddr . meta l4proto . th sport @{name}")
        }
        Criterion::NotSourceIpPortSet(name) => {
            format!("{family} saddr . meta l4proto . th sport != @{name}")
        }
        Criterion::DestIpPortSet(name) => {
            format!("{family} daddr . meta l4proto . th dport @{name}")
        }
        Criterion::NotDestIpPortSet(name) => {
            format!("{family} daddr . meta l4proto . th dport != @{name}")
        }
        Criterion::SourceDestIpSet(name) => {
            format!("{family} saddr @{name} {family} daddr @{name}")
        }
        Criterion::SourcePorts(ports) => format!("th sport {}", port_set(ports)),
        Criterion::NotSourcePorts(ports) => format!("th sport != {}", port_set(ports)),
        Criterion::DestPorts(ports) => format!("th dport {}", port_set(ports)),
        Criterion::NotDestPorts(ports) => format!("th dport != {}", port_set(ports)),
        Criterion::Icmp {
            v6,
            icmp_type,
            code,
            negated,
        } => {
            let proto = if *v6 { "icmpv6" } else { "icmp" };
            match code {
                Some(code) => format!(
                    "{proto} type . {proto} code {}{icmp_type} . {code}",
                    not(*negated)
                ),
                None => format!("{proto} type {}{icmp_type}", not(*negated)),
            }
        }
        Criterion::Mark {
            mark,
            mask,
            negated,
        } => {
            let op = if *negated { "!=" } else { "==" };
            format!("meta mark & {mask:#010x} {op} {mark:#010x}")
        }
        Criterion::ConntrackState { states, negated } => {
            if states == "DNAT" {
                format!("ct status {}dnat", not(*negated))
            } else {
                format!("ct state {}{}", not(*negated), states.to_lowercase())
            }
        }
        Criterion::ConntrackOrigDest(addr) => format!("ct original {family} daddr {addr}"),
        Criterion::ConntrackOrigDestPort(port) => format!("ct original proto-dst {port}"),
        Criterion::InInterface(iface) => format!("iifname \"{iface}\""),
        Criterion::OutInterface(iface) => format!("oifname \"{iface}\""),
        Criterion::SourceAddrTypeLocal {
            limit_iface_out,
            negated,
        } => {
            let key = if *limit_iface_out { "saddr . oif" } else { "saddr" };
            format!("fib {key} type {}local", not(*negated))
        }
        Criterion::DestAddrTypeLocal => "fib daddr type local".to_string(),
        Criterion::RpfCheckFailed { accept_local } => {
            if *accept_local {
                "fib saddr . mark . iif oif missing fib saddr type != local".to_string()
            } else {
                "fib saddr . mark . iif oif missing".to_string()
            }
        }
    }
}

pub fn render_action(action: &Action) -> String {
    match action {
        Action::Accept => "accept".to_string(),
        Action::Drop => "drop".to_string(),
        Action::Reject => "reject".to_string(),
        Action::Return => "return".to_string(),
        Action::Jump { target } => format!("jump {target}"),
        Action::Goto { target } => format!("goto {target}"),
        Action::Log { prefix } => format!("log prefix \"{prefix}: \" level notice"),
        Action::Nflog {
            group,
            prefix,
            size,
        } => {
            let snaplen = if *size == 0 { 80 } else { *size };
            format!("log prefix \"{prefix}\" group {group} snaplen {snaplen}")
        }
        Action::SetMark { mark } => format!("meta mark set mark or {mark:#x}"),
        Action::SetMaskedMark { mark, mask } => {
            format!("meta mark set mark & {:#x} ^ {mark:#x}", !mask)
        }
        Action::ClearMark { mark } => format!("meta mark set mark & {:#x}", !mark),
        Action::Masquerade { to_ports } => match to_ports {
            Some(ports) => format!("masquerade to :{ports}"),
            None => "masquerade".to_string(),
        },
        Action::Snat { to_address } => format!("snat to {to_address}"),
        Action::Dnat { address, port } => match (address, port) {
            (_, None) => format!("dnat to {address}"),
            (IpAddr::V4(_), Some(port)) => format!("dnat to {address}:{port}"),
            (IpAddr::V6(_), Some(port)) => format!("dnat to [{address}]:{port}"),
        },
        Action::NoTrack => "notrack".to_string(),
        Action::Nfqueue { queue } => format!("queue num {queue}"),
        Action::NfqueueWithBypass { queue } => format!("queue flags bypass num {queue}"),
        Action::SaveConnMark { mask } => format!("ct mark set mark & {mask:#x}"),
        Action::RestoreConnMark { mask } => format!("meta mark set ct mark & {mask:#x}"),
        Action::SetConnMark { mark, mask } => {
            format!("ct mark set ct mark & {:#x} ^ {mark:#x}", !mask)
        }
        Action::Tproxy { mark, mask, port } => format!(
            "meta mark set mark & {:#x} ^ {mark:#x} tproxy to :{port}",
            !mask
        ),
        // nftables fills checksums itself; keep the rule as a counter.
        Action::ChecksumFill => "counter".to_string(),
    }
}

fn port_set(ports: &[PortRange]) -> String {
    let render = |p: &PortRange| {
        if p.is_single() {
            p.first.to_string()
        } else {
            format!("{}-{}", p.first, p.last)
        }
    };
    match ports {
        [single] => render(single),
        _ => format!(
            "{{ {} }}",
            ports.iter().map(render).collect::<Vec<_>>().join(", ")
        ),
    }
}
