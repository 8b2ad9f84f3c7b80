use chain_render_common::{ChainRule, MarkBitConfig};
use ipnet::IpNet;

use crate::{backend::iptables, cidr::parse_cidr_or_ip, Config, DnsPolicyMode, Renderer};

/// Mark layout used by the rule compiler tests.
pub(crate) fn rule_marks() -> MarkBitConfig {
    MarkBitConfig {
        egress: 0x40,
        accept: 0x80,
        pass: 0x100,
        scratch0: 0x200,
        scratch1: 0x400,
        drop: 0x800,
        endpoint: 0xff000,
        dns_policy: 0x1,
        skip_dns_policy_nfqueue: 0x400000,
        ..Default::default()
    }
}

/// Mark layout used by the endpoint and static chain tests.
pub(crate) fn endpoint_marks() -> MarkBitConfig {
    MarkBitConfig {
        egress: 0x4,
        accept: 0x8,
        pass: 0x10,
        scratch0: 0x20,
        scratch1: 0x40,
        drop: 0x80,
        endpoint: 0xff00,
        non_cali_endpoint: 0x100,
        dns_policy: 0x1,
        skip_dns_policy_nfqueue: 0x400000,
        ..Default::default()
    }
}

pub(crate) fn rule_config() -> Config {
    Config {
        dns_policy_nfqueue_id: 100,
        dns_packets_nfqueue_id: 101,
        ..Config::default()
    }
    .with_marks(rule_marks())
    .with_dns_policy(DnsPolicyMode::DelayDeniedPacket, 100)
}

/// Like [rule_config] but without a DNS policy mark, so no nfqueue rules appear.
pub(crate) fn plain_rule_config() -> Config {
    Config {
        marks: MarkBitConfig {
            dns_policy: 0,
            skip_dns_policy_nfqueue: 0,
            ..rule_marks()
        },
        ..rule_config()
    }
}

pub(crate) fn endpoint_config() -> Config {
    Config {
        marks: MarkBitConfig {
            dns_policy: 0,
            skip_dns_policy_nfqueue: 0,
            ..endpoint_marks()
        },
        ..Config::default()
    }
}

pub(crate) fn renderer(config: Config) -> Renderer {
    init_tracing();
    Renderer::new(config).unwrap()
}

pub(crate) fn rendered(rules: &[ChainRule]) -> Vec<String> {
    rules.iter().map(iptables::render_rule).collect()
}

pub(crate) fn net(s: &str) -> IpNet {
    parse_cidr_or_ip(s).unwrap()
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
