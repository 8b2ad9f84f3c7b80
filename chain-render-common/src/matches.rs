use serde::Serialize;

use crate::PortRange;

/// One typed match condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum Criterion {
    /// Protocol by name (`tcp`) or number (`8`).
    Protocol(String),
    NotProtocol(String),
    SourceNet(String),
    NotSourceNet(String),
    DestNet(String),
    NotDestNet(String),
    SourceIpSet(String),
    NotSourceIpSet(String),
    DestIpSet(String),
    NotDestIpSet(String),
    /// IP set of `ip,port` members matched against the source address and port.
    SourceIpPortSet(String),
    NotSourceIpPortSet(String),
    DestIpPortSet(String),
    NotDestIpPortSet(String),
    /// Packets whose source and destination addresses are both members of the set.
    SourceDestIpSet(String),
    SourcePorts(Vec<PortRange>),
    NotSourcePorts(Vec<PortRange>),
    DestPorts(Vec<PortRange>),
    NotDestPorts(Vec<PortRange>),
    Icmp {
        v6: bool,
        icmp_type: u8,
        code: Option<u8>,
        negated: bool,
    },
    /// `(packet mark & mask) == mark`, or the opposite when negated.
    Mark {
        mark: u32,
        mask: u32,
        negated: bool,
    },
    ConntrackState {
        states: String,
        negated: bool,
    },
    ConntrackOrigDest(String),
    ConntrackOrigDestPort(u16),
    InInterface(String),
    OutInterface(String),
    SourceAddrTypeLocal {
        limit_iface_out: bool,
        negated: bool,
    },
    DestAddrTypeLocal,
    RpfCheckFailed {
        accept_local: bool,
    },
}

/// Ordered conjunction of [Criterion]s. Criteria render in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct MatchCriteria(Vec<Criterion>);

impl MatchCriteria {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.0
    }

    fn with(mut self, criterion: Criterion) -> Self {
        self.0.push(criterion);
        self
    }

    /// Appends all of `other`'s criteria after this one's.
    pub fn combine(mut self, other: MatchCriteria) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn protocol(self, name: impl Into<String>) -> Self {
        self.with(Criterion::Protocol(name.into()))
    }

    pub fn not_protocol(self, name: impl Into<String>) -> Self {
        self.with(Criterion::NotProtocol(name.into()))
    }

    pub fn source_net(self, net: impl Into<String>) -> Self {
        self.with(Criterion::SourceNet(net.into()))
    }

    pub fn not_source_net(self, net: impl Into<String>) -> Self {
        self.with(Criterion::NotSourceNet(net.into()))
    }

    pub fn dest_net(self, net: impl Into<String>) -> Self {
        self.with(Criterion::DestNet(net.into()))
    }

    pub fn not_dest_net(self, net: impl Into<String>) -> Self {
        self.with(Criterion::NotDestNet(net.into()))
    }

    pub fn source_ip_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::SourceIpSet(name.into()))
    }

    pub fn not_source_ip_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::NotSourceIpSet(name.into()))
    }

    pub fn dest_ip_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::DestIpSet(name.into()))
    }

    pub fn not_dest_ip_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::NotDestIpSet(name.into()))
    }

    pub fn source_ip_port_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::SourceIpPortSet(name.into()))
    }

    pub fn not_source_ip_port_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::NotSourceIpPortSet(name.into()))
    }

    pub fn dest_ip_port_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::DestIpPortSet(name.into()))
    }

    pub fn not_dest_ip_port_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::NotDestIpPortSet(name.into()))
    }

    pub fn source_dest_ip_set(self, name: impl Into<String>) -> Self {
        self.with(Criterion::SourceDestIpSet(name.into()))
    }

    pub fn source_ports(self, ports: Vec<PortRange>) -> Self {
        self.with(Criterion::SourcePorts(ports))
    }

    pub fn not_source_ports(self, ports: Vec<PortRange>) -> Self {
        self.with(Criterion::NotSourcePorts(ports))
    }

    pub fn dest_ports(self, ports: Vec<PortRange>) -> Self {
        self.with(Criterion::DestPorts(ports))
    }

    pub fn not_dest_ports(self, ports: Vec<PortRange>) -> Self {
        self.with(Criterion::NotDestPorts(ports))
    }

    pub fn dest_port(self, port: u16) -> Self {
        self.dest_ports(vec![PortRange::single(port)])
    }

    pub fn source_port(self, port: u16) -> Self {
        self.source_ports(vec![PortRange::single(port)])
    }

    pub fn icmp(self, v6: bool, icmp_type: u8, code: Option<u8>) -> Self {
        self.with(Criterion::Icmp {
            v6,
            icmp_type,
            code,
            negated: false,
        })
    }

    pub fn not_icmp(self, v6: bool, icmp_type: u8, code: Option<u8>) -> Self {
        self.with(Criterion::Icmp {
            v6,
            icmp_type,
            code,
            negated: true,
        })
    }

    pub fn mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.with(Criterion::Mark {
            mark,
            mask,
            negated: false,
        })
    }

    pub fn not_mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.with(Criterion::Mark {
            mark,
            mask,
            negated: true,
        })
    }

    pub fn mark_single_bit_set(self, bit: u32) -> Self {
        self.mark_matches_with_mask(bit, bit)
    }

    /// Matches packets with every bit in `bits` clear.
    pub fn mark_clear(self, bits: u32) -> Self {
        self.mark_matches_with_mask(0, bits)
    }

    /// Matches packets with at least one bit in `bits` set.
    pub fn mark_not_clear(self, bits: u32) -> Self {
        self.not_mark_matches_with_mask(0, bits)
    }

    pub fn conntrack_state(self, states: impl Into<String>) -> Self {
        self.with(Criterion::ConntrackState {
            states: states.into(),
            negated: false,
        })
    }

    pub fn not_conntrack_state(self, states: impl Into<String>) -> Self {
        self.with(Criterion::ConntrackState {
            states: states.into(),
            negated: true,
        })
    }

    pub fn conntrack_orig_dest(self, addr: impl Into<String>) -> Self {
        self.with(Criterion::ConntrackOrigDest(addr.into()))
    }

    pub fn conntrack_orig_dest_port(self, port: u16) -> Self {
        self.with(Criterion::ConntrackOrigDestPort(port))
    }

    pub fn in_interface(self, iface: impl Into<String>) -> Self {
        self.with(Criterion::InInterface(iface.into()))
    }

    pub fn out_interface(self, iface: impl Into<String>) -> Self {
        self.with(Criterion::OutInterface(iface.into()))
    }

    pub fn src_addr_type_local(self, limit_iface_out: bool) -> Self {
        self.with(Criterion::SourceAddrTypeLocal {
            limit_iface_out,
            negated: false,
        })
    }

    pub fn not_src_addr_type_local(self, limit_iface_out: bool) -> Self {
        self.with(Criterion::SourceAddrTypeLocal {
            limit_iface_out,
            negated: true,
        })
    }

    pub fn dest_addr_type_local(self) -> Self {
        self.with(Criterion::DestAddrTypeLocal)
    }

    pub fn rpf_check_failed(self, accept_local: bool) -> Self {
        self.with(Criterion::RpfCheckFailed { accept_local })
    }
}
