use std::{collections::BTreeMap, fmt};

use chain_render_common::{IpVersion, PortRange};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

const STAGED_PREFIX: &str = "staged:";

/// Protocol given by name (`tcp`) or by number (`8`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Protocol {
    Number(u8),
    Name(String),
}

impl Protocol {
    pub fn tcp() -> Self {
        Protocol::Name("tcp".to_string())
    }

    pub fn udp() -> Self {
        Protocol::Name("udp".to_string())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Number(n) => write!(f, "{n}"),
            Protocol::Name(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Icmp {
    pub icmp_type: u8,
    pub code: Option<u8>,
}

/// Verdict of a [Rule].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
    /// Skip the rest of the tier and continue with the next one.
    Pass,
    Log,
}

/// One match/action unit of a policy or profile.
///
/// Every list is an OR of its entries and the rule is the AND of all non-empty lists.
/// IP sets are referenced by ID and resolved to concrete names at render time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub action: RuleAction,
    pub ip_version: Option<IpVersion>,

    pub protocol: Option<Protocol>,
    pub not_protocol: Option<Protocol>,

    pub src_net: Vec<IpNet>,
    pub not_src_net: Vec<IpNet>,
    pub dst_net: Vec<IpNet>,
    pub not_dst_net: Vec<IpNet>,

    pub src_ports: Vec<PortRange>,
    pub not_src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub not_dst_ports: Vec<PortRange>,

    pub src_named_port_ip_set_ids: Vec<String>,
    pub not_src_named_port_ip_set_ids: Vec<String>,
    pub dst_named_port_ip_set_ids: Vec<String>,
    pub not_dst_named_port_ip_set_ids: Vec<String>,

    pub src_ip_set_ids: Vec<String>,
    pub not_src_ip_set_ids: Vec<String>,
    pub dst_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,
    /// Sets filled from DNS answers; each one is an alternative to `dst_ip_set_ids`.
    pub dst_domain_ip_set_ids: Vec<String>,

    pub icmp: Option<Icmp>,
    pub not_icmp: Option<Icmp>,

    /// Overrides the configured log prefix for [RuleAction::Log] rules.
    pub log_prefix: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_ip_version(self, ip_version: IpVersion) -> Self {
        Self {
            ip_version: Some(ip_version),
            ..self
        }
    }

    pub fn with_protocol(self, protocol: Protocol) -> Self {
        Self {
            protocol: Some(protocol),
            ..self
        }
    }

    pub fn with_src_net(self, src_net: Vec<IpNet>) -> Self {
        Self { src_net, ..self }
    }

    pub fn with_not_src_net(self, not_src_net: Vec<IpNet>) -> Self {
        Self {
            not_src_net,
            ..self
        }
    }

    pub fn with_dst_net(self, dst_net: Vec<IpNet>) -> Self {
        Self { dst_net, ..self }
    }

    pub fn with_src_ports(self, src_ports: Vec<PortRange>) -> Self {
        Self { src_ports, ..self }
    }

    pub fn with_dst_ports(self, dst_ports: Vec<PortRange>) -> Self {
        Self { dst_ports, ..self }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// All CIDRs the rule mentions, positive and negated.
    pub(crate) fn all_nets(&self) -> impl Iterator<Item = &IpNet> {
        self.src_net
            .iter()
            .chain(&self.not_src_net)
            .chain(&self.dst_net)
            .chain(&self.not_dst_net)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
}

impl PolicyId {
    pub fn new(tier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            name: name.into(),
        }
    }

    /// Staged policies only report what they would have done.
    pub fn is_staged(&self) -> bool {
        is_staged_name(&self.name)
    }
}

pub(crate) fn is_staged_name(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map_or(false, |last| last.starts_with(STAGED_PREFIX))
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    pub untracked: bool,
    pub pre_dnat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ProfileId {
    pub name: String,
}

impl ProfileId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}
