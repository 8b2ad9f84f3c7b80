
use std::net::IpAddr;

use chain_render_common::{MarkBitConfig, MarkField, MarkRequirement, PortRange};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Packet filter syntax the chains are serialized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum Backend {
    #[default]
    Iptables,
    Nftables,
}

impl Backend {
    pub fn max_chain_name_length(&self) -> usize {
        match self {
            Backend::Iptables => 28,
            Backend::Nftables => 64,
        }
    }

    /// Suffix that turns an interface prefix into a wildcard match.
    pub fn iface_wildcard(&self) -> &'static str {
        match self {
            Backend::Iptables => "+",
            Backend::Nftables => "*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum FilterDenyAction {
    #[default]
    Drop,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum AllowAction {
    #[default]
    Accept,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
pub enum EndpointToHostAction {
    #[default]
    Drop,
    Reject,
    Accept,
    Return,
}

/// What happens to a packet once policy has decided to drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, AsRefStr)]
pub enum ActionOnDrop {
    #[default]
    Drop,
    Accept,
    LogAndDrop,
    LogAndAccept,
}

impl ActionOnDrop {
    pub fn logs(&self) -> bool {
        matches!(self, ActionOnDrop::LogAndDrop | ActionOnDrop::LogAndAccept)
    }

    pub fn accepts(&self) -> bool {
        matches!(self, ActionOnDrop::Accept | ActionOnDrop::LogAndAccept)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DnsPolicyMode {
    NoDelay,
    #[default]
    DelayDeniedPacket,
    DelayDnsResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TproxyMode {
    #[default]
    Disabled,
    Enabled,
    EnabledAllServices,
}

impl TproxyMode {
    pub fn is_enabled(&self) -> bool {
        *self != TproxyMode::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceLoopPrevention {
    #[default]
    Drop,
    Reject,
    Disabled,
}

/// Failsafe entry: always allow `protocol` to/from `port`, optionally only for `net`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtoPort {
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub net: Option<String>,
}

impl ProtoPort {
    pub fn new(protocol: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            port,
            net: None,
        }
    }

    pub fn with_net(self, net: impl Into<String>) -> Self {
        Self {
            net: Some(net.into()),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerPort {
    pub ip: IpAddr,
    pub port: u16,
}

/// Everything that shapes the rendered chains.
///
/// Built by whoever loads the agent's configuration and validated by
/// [crate::Renderer::new]; never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub backend: Backend,
    pub marks: MarkBitConfig,
    pub ip_set_prefix: String,
    pub workload_iface_prefixes: Vec<String>,

    pub failsafe_inbound_host_ports: Vec<ProtoPort>,
    pub failsafe_outbound_host_ports: Vec<ProtoPort>,

    pub action_on_drop: ActionOnDrop,
    pub filter_deny_action: FilterDenyAction,
    pub endpoint_to_host_action: EndpointToHostAction,
    pub filter_allow_action: AllowAction,
    pub mangle_allow_action: AllowAction,
    pub log_prefix: String,
    pub include_drop_action_in_prefix: bool,
    pub disable_conntrack_invalid: bool,

    pub ipip_enabled: bool,
    pub ipip_tunnel_address: Option<IpAddr>,
    pub allow_ipip_packets_from_workloads: bool,

    pub vxlan_enabled: bool,
    pub vxlan_enabled_v6: bool,
    pub vxlan_port: u16,
    pub vxlan_tunnel_address: Option<IpAddr>,
    pub vxlan_tunnel_address_v6: Option<IpAddr>,
    pub allow_vxlan_packets_from_workloads: bool,

    pub wireguard_enabled: bool,
    pub wireguard_enabled_v6: bool,
    pub wireguard_interface_name: String,
    pub wireguard_interface_name_v6: String,
    pub wireguard_listening_port: u16,
    pub wireguard_listening_port_v6: u16,
    pub wireguard_mark: u32,
    pub wireguard_encrypt_host_traffic: bool,

    pub ipsec_enabled: bool,

    pub egress_ip_enabled: bool,
    pub egress_ip_vxlan_port: u16,
    pub egress_ip_interface: String,

    pub openstack_special_cases: bool,
    pub openstack_metadata_ip: Option<IpAddr>,
    pub openstack_metadata_port: u16,

    pub dns_trusted_servers: Vec<ServerPort>,
    pub dns_policy_mode: DnsPolicyMode,
    pub dns_policy_nfqueue_id: u16,
    pub dns_packets_nfqueue_id: u16,

    pub kube_ipvs_support_enabled: bool,
    pub kube_node_port_ranges: Vec<PortRange>,

    pub bpf_enabled: bool,

    pub tproxy_mode: TproxyMode,
    pub tproxy_port: u16,
    /// Conntrack mark of the upstream leg of a proxied connection.
    pub tproxy_upstream_conn_mark: u32,
    pub kube_masquerade_mark: u32,

    pub nat_port_range: Option<PortRange>,
    pub nat_outgoing_address: Option<IpAddr>,
    pub nat_outgoing_interface_filter: Option<String>,
    pub service_loop_prevention: ServiceLoopPrevention,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Iptables,
            marks: MarkBitConfig {
                accept: 0x10000,
                pass: 0x20000,
                scratch0: 0x40000,
                scratch1: 0x80000,
                drop: 0x100000,
                endpoint: 0xffe00000,
                non_cali_endpoint: 0x200000,
                ..Default::default()
            },
            ip_set_prefix: "cali".to_string(),
            workload_iface_prefixes: vec!["cali".to_string()],
            failsafe_inbound_host_ports: [
                ("tcp", 22),
                ("udp", 68),
                ("tcp", 179),
                ("tcp", 2379),
                ("tcp", 2380),
                ("tcp", 5473),
                ("tcp", 6443),
                ("tcp", 6666),
                ("tcp", 6667),
            ]
            .into_iter()
            .map(|(proto, port)| ProtoPort::new(proto, port))
            .collect(),
            failsafe_outbound_host_ports: [
                ("udp", 53),
                ("udp", 67),
                ("tcp", 179),
                ("tcp", 2379),
                ("tcp", 2380),
                ("tcp", 5473),
                ("tcp", 6443),
                ("tcp", 6666),
                ("tcp", 6667),
            ]
            .into_iter()
            .map(|(proto, port)| ProtoPort::new(proto, port))
            .collect(),
            action_on_drop: ActionOnDrop::Drop,
            filter_deny_action: FilterDenyAction::Drop,
            endpoint_to_host_action: EndpointToHostAction::Drop,
            filter_allow_action: AllowAction::Accept,
            mangle_allow_action: AllowAction::Accept,
            log_prefix: "calico-packet".to_string(),
            include_drop_action_in_prefix: false,
            disable_conntrack_invalid: false,
            ipip_enabled: false,
            ipip_tunnel_address: None,
            allow_ipip_packets_from_workloads: false,
            vxlan_enabled: false,
            vxlan_enabled_v6: false,
            vxlan_port: 4789,
            vxlan_tunnel_address: None,
            vxlan_tunnel_address_v6: None,
            allow_vxlan_packets_from_workloads: false,
            wireguard_enabled: false,
            wireguard_enabled_v6: false,
            wireguard_interface_name: "wireguard.cali".to_string(),
            wireguard_interface_name_v6: "wg-v6.cali".to_string(),
            wireguard_listening_port: 51820,
            wireguard_listening_port_v6: 51821,
            wireguard_mark: 0,
            wireguard_encrypt_host_traffic: false,
            ipsec_enabled: false,
            egress_ip_enabled: false,
            egress_ip_vxlan_port: 4790,
            egress_ip_interface: "egress.calico".to_string(),
            openstack_special_cases: false,
            openstack_metadata_ip: None,
            openstack_metadata_port: 8775,
            dns_trusted_servers: Vec::new(),
            dns_policy_mode: DnsPolicyMode::DelayDeniedPacket,
            dns_policy_nfqueue_id: 0,
            dns_packets_nfqueue_id: 0,
            kube_ipvs_support_enabled: false,
            kube_node_port_ranges: vec![PortRange::new(30000, 32767)],
            bpf_enabled: false,
            tproxy_mode: TproxyMode::Disabled,
            tproxy_port: 16001,
            tproxy_upstream_conn_mark: 0x17,
            kube_masquerade_mark: 0x4000,
            nat_port_range: None,
            nat_outgoing_address: None,
            nat_outgoing_interface_filter: None,
            service_loop_prevention: ServiceLoopPrevention::Drop,
        }
    }
}

impl Config {
    /// Parses a JSON config document. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether `field` has to be set, and kept disjoint, under this feature combination.
    pub fn mark_requirement(&self, field: MarkField) -> MarkRequirement {
        let required_if = |on: bool| {
            if on {
                MarkRequirement::Required
            } else {
                MarkRequirement::Ignored
            }
        };
        match field {
            MarkField::Accept | MarkField::Drop | MarkField::Scratch0 => MarkRequirement::Required,
            MarkField::Pass | MarkField::Scratch1 | MarkField::Endpoint => {
                required_if(!self.bpf_enabled)
            }
            // A value inside the endpoint mask, not bits of its own.
            MarkField::NonCaliEndpoint => MarkRequirement::Ignored,
            MarkField::Ipsec => required_if(self.ipsec_enabled),
            MarkField::Egress => required_if(self.egress_ip_enabled),
            MarkField::Proxy => required_if(self.tproxy_mode.is_enabled()),
            MarkField::DnsPolicy | MarkField::SkipDnsPolicyNfqueue => {
                if self.bpf_enabled {
                    MarkRequirement::Ignored
                } else {
                    MarkRequirement::Optional
                }
            }
        }
    }

    /// Every interface prefix as a backend wildcard, e.g. `cali+`.
    pub(crate) fn workload_iface_wildcards(&self) -> impl Iterator<Item = String> + '_ {
        let wildcard = self.backend.iface_wildcard();
        self.workload_iface_prefixes
            .iter()
            .map(move |prefix| format!("{prefix}{wildcard}"))
    }

    pub fn with_backend(self, backend: Backend) -> Self {
        Self { backend, ..self }
    }

    pub fn with_marks(self, marks: MarkBitConfig) -> Self {
        Self { marks, ..self }
    }

    pub fn with_action_on_drop(self, action_on_drop: ActionOnDrop) -> Self {
        Self {
            action_on_drop,
            ..self
        }
    }

    pub fn with_filter_deny_action(self, filter_deny_action: FilterDenyAction) -> Self {
        Self {
            filter_deny_action,
            ..self
        }
    }

    pub fn with_ipip(self, tunnel_address: Option<IpAddr>) -> Self {
        Self {
            ipip_enabled: true,
            ipip_tunnel_address: tunnel_address,
            ..self
        }
    }

    pub fn with_vxlan(self, tunnel_address: Option<IpAddr>) -> Self {
        Self {
            vxlan_enabled: true,
            vxlan_tunnel_address: tunnel_address,
            ..self
        }
    }

    pub fn with_wireguard(self, mark: u32) -> Self {
        Self {
            wireguard_enabled: true,
            wireguard_mark: mark,
            ..self
        }
    }

    pub fn with_egress_ip(self) -> Self {
        Self {
            egress_ip_enabled: true,
            ..self
        }
    }

    pub fn with_tproxy(self, proxy_mark: u32) -> Self {
        Self {
            tproxy_mode: TproxyMode::Enabled,
            marks: MarkBitConfig {
                proxy: proxy_mark,
                ..self.marks
            },
            ..self
        }
    }

    pub fn with_openstack(self, metadata_ip: Option<IpAddr>) -> Self {
        Self {
            openstack_special_cases: true,
            openstack_metadata_ip: metadata_ip,
            ..self
        }
    }

    pub fn with_ipvs(self) -> Self {
        Self {
            kube_ipvs_support_enabled: true,
            ..self
        }
    }

    pub fn with_dns_trusted_servers(self, dns_trusted_servers: Vec<ServerPort>) -> Self {
        Self {
            dns_trusted_servers,
            ..self
        }
    }

    pub fn with_dns_policy(self, mode: DnsPolicyMode, nfqueue_id: u16) -> Self {
        Self {
            dns_policy_mode: mode,
            dns_policy_nfqueue_id: nfqueue_id,
            ..self
        }
    }
}
