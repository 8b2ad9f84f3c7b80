//! Top-level chains hooked from the kernel's built-in chains.
//!
//! The cali-INPUT, cali-OUTPUT and cali-FORWARD chains are built from contributor lists
//! the same way endpoint chains are; everything else here is a short fixed sequence.
mod test;

use chain_render_common::{mark, split_port_list, Action, Chain, ChainRule, IpVersion, MatchCriteria};

use crate::{
    cidr::{parse_cidr_or_ip, IpFamily},
    config::{DnsPolicyMode, ProtoPort},
    Renderer, Table, CHAIN_CIDR_BLOCK, CHAIN_DISPATCH_FROM_ENDPOINT_MARK,
    CHAIN_DISPATCH_FROM_HOST_ENDPOINT, CHAIN_DISPATCH_FROM_HOST_ENDPOINT_FORWARD,
    CHAIN_DISPATCH_SET_ENDPOINT_MARK, CHAIN_DISPATCH_TO_HOST_ENDPOINT,
    CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD, CHAIN_FAILSAFE_IN, CHAIN_FAILSAFE_OUT,
    CHAIN_FILTER_FORWARD, CHAIN_FILTER_INPUT, CHAIN_FILTER_INPUT_TPROXY, CHAIN_FILTER_OUTPUT,
    CHAIN_FILTER_OUTPUT_TPROXY, CHAIN_FORWARD_CHECK, CHAIN_FORWARD_ENDPOINT_MARK,
    CHAIN_FROM_WORKLOAD_DISPATCH, CHAIN_MANGLE_OUTPUT, CHAIN_MANGLE_OUTPUT_TPROXY,
    CHAIN_MANGLE_OUTPUT_TPROXY_HOST_NET, CHAIN_MANGLE_POSTROUTING,
    CHAIN_MANGLE_POSTROUTING_EGRESS, CHAIN_MANGLE_PREROUTING, CHAIN_MANGLE_PREROUTING_EGRESS,
    CHAIN_MANGLE_PREROUTING_EGRESS_INBOUND, CHAIN_MANGLE_PREROUTING_TPROXY_ESTABL,
    CHAIN_MANGLE_PREROUTING_TPROXY_NP, CHAIN_MANGLE_PREROUTING_TPROXY_SELECT,
    CHAIN_MANGLE_PREROUTING_TPROXY_SVC, CHAIN_RAW_OUTPUT, CHAIN_RAW_PREROUTING, CHAIN_RPF_SKIP,
    CHAIN_SET_WIREGUARD_INCOMING_MARK, CHAIN_TO_WORKLOAD_DISPATCH, CHAIN_WORKLOAD_TO_HOST,
    IPSET_ID_ALL_EGW_HEALTH_PORTS, IPSET_ID_ALL_HOST_NETS, IPSET_ID_ALL_VXLAN_SOURCE_NETS,
    IPSET_ID_NAT_OUTGOING_ALL_POOLS, IPSET_ID_THIS_HOST_IPS, IPSET_ID_TPROXY_NODE_PORTS,
    IPSET_ID_TPROXY_POD_IPS, IPSET_ID_TPROXY_POD_SELF, IPSET_ID_TPROXY_SERVICE_IPS,
    NFLOG_DOMAIN_GROUP, PORT_IKE, PROTO_ESP, PROTO_ICMPV6, PROTO_IPIP, PROTO_TCP, PROTO_UDP,
};

const DNS_ACTION_PREFIX: &str = "DNS";
const DNS_NFLOG_SIZE: u32 = 1024;

const POLICY_ACCEPTED: &str = "Policy explicitly accepted packet.";
const HOST_POLICY_ACCEPTED: &str = "Host endpoint policy accepted packet.";

/// ICMPv6 types a workload needs to reach the host for neighbour discovery and MLD.
const ICMPV6_TO_HOST_TYPES: [u8; 6] = [130, 131, 132, 133, 135, 136];

const OPENSTACK_METADATA_PORT_DNS: u16 = 53;

type StaticContributor = fn(&Renderer, IpVersion) -> Vec<ChainRule>;

/// Rule contributors of cali-INPUT, in chain order.
pub(crate) const INPUT_CONTRIBUTORS: [(&str, StaticContributor); 11] = [
    ("tproxy", Renderer::input_tproxy_rules),
    ("dns-response-snooping", Renderer::input_dns_response_rules),
    ("dns-request-snooping", Renderer::input_dns_request_rules),
    ("ipip", Renderer::input_ipip_rules),
    ("ipsec", Renderer::input_ipsec_rules),
    ("vxlan", Renderer::input_vxlan_rules),
    ("wireguard", Renderer::input_wireguard_rules),
    ("egress-ip", Renderer::input_egress_ip_rules),
    ("ipvs", Renderer::input_ipvs_rules),
    ("workload", Renderer::input_workload_rules),
    ("host-endpoint", Renderer::input_host_endpoint_rules),
];

/// Rule contributors of cali-OUTPUT, in chain order.
pub(crate) const OUTPUT_CONTRIBUTORS: [(&str, StaticContributor); 11] = [
    ("tproxy", Renderer::output_tproxy_rules),
    ("already-accepted", Renderer::accept_already_accepted),
    ("ipvs", Renderer::output_ipvs_rules),
    ("dns-request-snooping", Renderer::output_dns_request_rules),
    ("workload", Renderer::output_workload_rules),
    ("ipip", Renderer::output_ipip_rules),
    ("vxlan", Renderer::output_vxlan_rules),
    ("egress-ip", Renderer::output_egress_ip_rules),
    ("ipsec", Renderer::output_ipsec_rules),
    ("wireguard", Renderer::output_wireguard_rules),
    ("host-endpoint", Renderer::output_host_endpoint_rules),
];

/// Rule contributors of cali-FORWARD, in chain order.
pub(crate) const FORWARD_CONTRIBUTORS: [(&str, StaticContributor); 6] = [
    ("dns-snooping", Renderer::forward_dns_rules),
    ("from-host-endpoint", Renderer::filter_from_host_endpoint_rules),
    ("workload", Renderer::forward_workload_rules),
    ("to-host-endpoint", Renderer::forward_to_host_endpoint_rules),
    ("cidr-block", Renderer::forward_cidr_block_rules),
    ("accept", Renderer::forward_accept_rules),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Dest,
}

impl Renderer {
    /// Filter table: the FORWARD chains, then INPUT, then OUTPUT.
    pub fn static_filter_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let mut chains = vec![self.contributed_chain(
            CHAIN_FILTER_FORWARD,
            &FORWARD_CONTRIBUTORS,
            ip_version,
        )];
        chains.extend(self.static_filter_input_chains(ip_version));
        chains.extend(self.static_filter_output_chains(ip_version));
        chains
    }

    fn static_filter_input_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let mut chains = vec![
            self.contributed_chain(CHAIN_FILTER_INPUT, &INPUT_CONTRIBUTORS, ip_version),
            self.workload_to_host_chain(ip_version),
            self.failsafe_in_chain(Table::Filter, ip_version),
        ];
        if self.config.kube_ipvs_support_enabled {
            chains.push(self.forward_check_chain(ip_version));
        }
        if self.tproxy_filter_enabled() {
            let mut rules = self.filter_from_host_endpoint_rules(ip_version);
            for wildcard in self.config.workload_iface_wildcards() {
                rules.push(ChainRule::new(
                    MatchCriteria::new().in_interface(wildcard),
                    Action::jump(CHAIN_FROM_WORKLOAD_DISPATCH),
                ));
            }
            rules.push(self.accepted_rule(POLICY_ACCEPTED));
            chains.push(Chain::new(CHAIN_FILTER_INPUT_TPROXY, rules));
        }
        chains
    }

    fn static_filter_output_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let mut chains = vec![
            self.contributed_chain(CHAIN_FILTER_OUTPUT, &OUTPUT_CONTRIBUTORS, ip_version),
            self.failsafe_out_chain(Table::Filter, ip_version),
        ];
        if self.config.kube_ipvs_support_enabled {
            chains.push(self.forward_endpoint_mark_chain());
        }
        if self.tproxy_filter_enabled() {
            let rules = self
                .config
                .workload_iface_wildcards()
                .map(|wildcard| {
                    ChainRule::new(
                        MatchCriteria::new().out_interface(wildcard),
                        Action::jump(CHAIN_TO_WORKLOAD_DISPATCH),
                    )
                })
                .collect();
            chains.push(Chain::new(CHAIN_FILTER_OUTPUT_TPROXY, rules));
        }
        chains
    }

    /// Mangle table: egress gateway and TPROXY helpers, failsafe, then PREROUTING,
    /// POSTROUTING and OUTPUT.
    pub fn static_mangle_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let mut chains = Vec::new();
        if ip_version == IpVersion::V4 && self.config.egress_ip_enabled {
            chains.extend(self.mangle_egress_chains());
        }
        if self.config.tproxy_mode.is_enabled() {
            chains.extend(self.mangle_tproxy_chains(ip_version));
        }
        chains.extend([
            self.failsafe_in_chain(Table::Mangle, ip_version),
            self.failsafe_out_chain(Table::Mangle, ip_version),
            self.mangle_prerouting_chain(),
            self.mangle_postrouting_chain(),
            self.mangle_output_chain(),
        ]);
        chains
    }

    /// Raw table: failsafe, anti-spoofing in PREROUTING, the WireGuard incoming mark
    /// chain and OUTPUT.
    pub fn static_raw_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        vec![
            self.failsafe_in_chain(Table::Raw, ip_version),
            self.failsafe_out_chain(Table::Raw, ip_version),
            self.raw_prerouting_chain(ip_version),
            Chain::new(CHAIN_RPF_SKIP, Vec::new()),
            self.wireguard_incoming_mark_chain(),
            self.raw_output_chain(),
        ]
    }

    fn contributed_chain(
        &self,
        name: &str,
        contributors: &[(&str, StaticContributor)],
        ip_version: IpVersion,
    ) -> Chain {
        let rules = contributors
            .iter()
            .flat_map(|(_, contribute)| contribute(self, ip_version))
            .collect();
        Chain::new(name, rules)
    }

    fn tproxy_filter_enabled(&self) -> bool {
        self.config.tproxy_mode.is_enabled() && !self.config.bpf_enabled
    }

    fn accepted_rule(&self, comment: &str) -> ChainRule {
        ChainRule::new(
            mark::is_set(self.config.marks.accept),
            self.filter_allow_action().clone(),
        )
        .with_comment(comment)
    }

    fn allow(&self, criteria: MatchCriteria, comment: &str) -> ChainRule {
        ChainRule::new(criteria, self.filter_allow_action().clone()).with_comment(comment)
    }

    fn ip_set(&self, id: &str, ip_version: IpVersion) -> String {
        self.ip_sets.name_for(id, ip_version)
    }

    fn input_tproxy_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.tproxy_filter_enabled() {
            return Vec::new();
        }
        let proxy = self.config.marks.proxy;
        vec![ChainRule::new(
            MatchCriteria::new().mark_matches_with_mask(proxy, proxy),
            Action::jump(CHAIN_FILTER_INPUT_TPROXY),
        )
        .with_comment("Police packets towards proxy")]
    }

    fn input_dns_response_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        self.dns_response_snooping_rules(None, ip_version)
    }

    fn input_dns_request_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        self.config
            .workload_iface_wildcards()
            .flat_map(|wildcard| self.dns_request_snooping_rules(Some(&wildcard), ip_version))
            .collect()
    }

    fn input_ipip_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if ip_version != IpVersion::V4 || !self.config.ipip_enabled {
            return Vec::new();
        }
        let mut rules = vec![self.allow(
            MatchCriteria::new()
                .protocol(PROTO_IPIP)
                .source_ip_set(self.ip_set(IPSET_ID_ALL_HOST_NETS, ip_version))
                .dest_addr_type_local(),
            "Allow IPIP packets from Calico hosts",
        )];
        rules.extend(self.drop_rules(
            MatchCriteria::new().protocol(PROTO_IPIP),
            &["Drop IPIP packets from non-Calico hosts"],
        ));
        rules
    }

    fn input_ipsec_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if ip_version != IpVersion::V4 || !self.config.ipsec_enabled {
            return Vec::new();
        }
        let from_hosts = || {
            MatchCriteria::new()
                .source_ip_set(self.ip_set(IPSET_ID_ALL_HOST_NETS, ip_version))
                .dest_addr_type_local()
        };
        let esp = || MatchCriteria::new().protocol(PROTO_ESP);
        let ike = || MatchCriteria::new().protocol(PROTO_UDP).dest_port(PORT_IKE);
        let mut rules = vec![
            self.allow(
                esp().combine(from_hosts()),
                "Allow IPSec ESP packets from Calico hosts",
            ),
            self.allow(
                ike().combine(from_hosts()),
                "Allow IPSec IKEv2 packets from Calico hosts",
            ),
        ];
        rules.extend(self.drop_rules(esp(), &["Drop IPSec ESP packets from non-Calico hosts"]));
        rules.extend(self.drop_rules(ike(), &["Drop IPSec IKE packets from non-Calico hosts"]));
        rules
    }

    fn input_vxlan_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let enabled = match ip_version {
            IpVersion::V4 => self.config.vxlan_enabled,
            IpVersion::V6 => self.config.vxlan_enabled_v6,
        };
        if !enabled {
            return Vec::new();
        }
        let vxlan = || {
            MatchCriteria::new()
                .protocol(PROTO_UDP)
                .dest_port(self.config.vxlan_port)
        };
        let allowed = vxlan()
            .source_ip_set(self.ip_set(IPSET_ID_ALL_VXLAN_SOURCE_NETS, ip_version))
            .dest_addr_type_local();
        match ip_version {
            IpVersion::V4 => vec![
                self.allow(allowed, "Allow IPv4 VXLAN packets from allowed hosts"),
                ChainRule::new(vxlan().dest_addr_type_local(), Action::Drop)
                    .with_comment("Drop IPv4 VXLAN packets from non-allowed hosts"),
            ],
            IpVersion::V6 => vec![
                self.allow(allowed, "Allow IPv6 VXLAN packets from allowed hosts"),
                ChainRule::new(vxlan().dest_addr_type_local(), self.deny_action().clone())
                    .with_comment(format!(
                        "{} IPv6 VXLAN packets from non-allowed hosts",
                        self.deny_name()
                    )),
            ],
        }
    }

    fn input_wireguard_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let Some(port) = self.wireguard_port(ip_version) else {
            return Vec::new();
        };
        vec![self.allow(
            MatchCriteria::new()
                .protocol(PROTO_UDP)
                .dest_port(port)
                .dest_addr_type_local(),
            &format!("Allow incoming IPv{ip_version} Wireguard packets"),
        )]
    }

    fn wireguard_port(&self, ip_version: IpVersion) -> Option<u16> {
        match ip_version {
            IpVersion::V4 if self.config.wireguard_enabled => {
                Some(self.config.wireguard_listening_port)
            }
            IpVersion::V6 if self.config.wireguard_enabled_v6 => {
                Some(self.config.wireguard_listening_port_v6)
            }
            _ => None,
        }
    }

    fn egress_ip_filter_enabled(&self, ip_version: IpVersion) -> bool {
        ip_version == IpVersion::V4 && self.config.egress_ip_enabled && !self.config.bpf_enabled
    }

    fn input_egress_ip_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.egress_ip_filter_enabled(ip_version) {
            return Vec::new();
        }
        vec![
            self.allow(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .dest_port(self.config.egress_ip_vxlan_port)
                    .dest_addr_type_local(),
                "Allow VXLAN UDP traffic to egress clients",
            ),
            self.allow(
                MatchCriteria::new()
                    .protocol(PROTO_TCP)
                    .dest_addr_type_local()
                    .source_ip_port_set(self.ip_set(IPSET_ID_ALL_EGW_HEALTH_PORTS, ip_version)),
                "Accept egress gateway health port probe traffic",
            ),
        ]
    }

    fn input_ipvs_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.config.kube_ipvs_support_enabled {
            return Vec::new();
        }
        let endpoint = self.config.marks.endpoint;
        vec![
            ChainRule::always(mark::clear(endpoint)),
            ChainRule::always(Action::jump(CHAIN_FORWARD_CHECK)),
            ChainRule::new(MatchCriteria::new().mark_not_clear(endpoint), Action::Return),
        ]
    }

    fn input_workload_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        self.config
            .workload_iface_wildcards()
            .map(|wildcard| {
                ChainRule::new(
                    MatchCriteria::new().in_interface(wildcard),
                    Action::goto(CHAIN_WORKLOAD_TO_HOST),
                )
            })
            .collect()
    }

    fn input_host_endpoint_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let mut rules = self.accept_already_accepted(ip_version);
        rules.extend([
            ChainRule::always(mark::clear(self.all_mark_bits)),
            ChainRule::always(Action::jump(CHAIN_DISPATCH_FROM_HOST_ENDPOINT)),
            self.accepted_rule(HOST_POLICY_ACCEPTED),
        ]);
        rules
    }

    fn accept_already_accepted(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        vec![ChainRule::new(
            mark::is_set(self.config.marks.accept),
            self.filter_allow_action().clone(),
        )]
    }

    /// Workload to host traffic: neighbour discovery and OpenStack services, then the
    /// workload's own egress policy, then the configured default.
    fn workload_to_host_chain(&self, ip_version: IpVersion) -> Chain {
        let allow = || self.filter_allow_action().clone();
        let mut rules = Vec::new();
        if ip_version == IpVersion::V6 {
            for icmp_type in ICMPV6_TO_HOST_TYPES {
                rules.push(ChainRule::new(
                    MatchCriteria::new()
                        .protocol(PROTO_ICMPV6)
                        .icmp(true, icmp_type, None),
                    allow(),
                ));
            }
        }
        if self.config.openstack_special_cases {
            tracing::info!("Adding OpenStack special-case rules");
            if let (IpVersion::V4, Some(metadata_ip)) =
                (ip_version, self.config.openstack_metadata_ip)
            {
                rules.push(ChainRule::new(
                    MatchCriteria::new()
                        .protocol(PROTO_TCP)
                        .dest_net(metadata_ip.to_string())
                        .dest_port(self.config.openstack_metadata_port),
                    allow(),
                ));
            }
            let (dhcp_client, dhcp_server) = match ip_version {
                IpVersion::V4 => (68, 67),
                IpVersion::V6 => (546, 547),
            };
            rules.push(ChainRule::new(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .source_port(dhcp_client)
                    .dest_port(dhcp_server),
                allow(),
            ));
            rules.push(ChainRule::new(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .dest_port(OPENSTACK_METADATA_PORT_DNS),
                allow(),
            ));
        }
        rules.push(ChainRule::always(Action::jump(CHAIN_FROM_WORKLOAD_DISPATCH)));
        rules.extend(self.input_accept_rules("Configured DefaultEndpointToHostAction"));
        Chain::new(CHAIN_WORKLOAD_TO_HOST, rules)
    }

    /// Inbound failsafe ports. The raw table sees packets before conntrack, so there the
    /// replies to outbound failsafe connections are let in too.
    pub(crate) fn failsafe_in_chain(&self, table: Table, ip_version: IpVersion) -> Chain {
        let config = &self.config;
        let mut rules = self.failsafe_rules(
            &config.failsafe_inbound_host_ports,
            Side::Dest,
            Side::Source,
            ip_version,
        );
        if table == Table::Raw {
            rules.extend(self.failsafe_rules(
                &config.failsafe_outbound_host_ports,
                Side::Source,
                Side::Source,
                ip_version,
            ));
        }
        Chain::new(CHAIN_FAILSAFE_IN, rules)
    }

    pub(crate) fn failsafe_out_chain(&self, table: Table, ip_version: IpVersion) -> Chain {
        let config = &self.config;
        let mut rules = self.failsafe_rules(
            &config.failsafe_outbound_host_ports,
            Side::Dest,
            Side::Dest,
            ip_version,
        );
        if table == Table::Raw {
            rules.extend(self.failsafe_rules(
                &config.failsafe_inbound_host_ports,
                Side::Source,
                Side::Source,
                ip_version,
            ));
        }
        Chain::new(CHAIN_FAILSAFE_OUT, rules)
    }

    /// One accept rule per entry. An entry scoped to a network of the other IP family is
    /// rendered unscoped.
    fn failsafe_rules(
        &self,
        entries: &[ProtoPort],
        port_side: Side,
        net_side: Side,
        ip_version: IpVersion,
    ) -> Vec<ChainRule> {
        entries
            .iter()
            .filter_map(|entry| {
                let Some(protocol) = failsafe_protocol(&entry.protocol) else {
                    tracing::warn!(protocol = %entry.protocol, port = entry.port,
                        "Unknown protocol in failsafe rule, skipping it");
                    return None;
                };
                let criteria = MatchCriteria::new().protocol(protocol);
                let mut criteria = match port_side {
                    Side::Source => criteria.source_port(entry.port),
                    Side::Dest => criteria.dest_port(entry.port),
                };
                if let Some(net) = &entry.net {
                    match parse_cidr_or_ip(net) {
                        Err(error) => {
                            tracing::error!(%error, net, "Failed to parse CIDR in failsafe rule, skipping it");
                            return None;
                        }
                        Ok(parsed) if parsed.is_version(ip_version) => {
                            criteria = match net_side {
                                Side::Source => criteria.source_net(parsed.to_string()),
                                Side::Dest => criteria.dest_net(parsed.to_string()),
                            };
                        }
                        Ok(_) => {}
                    }
                }
                Some(ChainRule::new(criteria, Action::Accept))
            })
            .collect()
    }

    /// IPVS: decides whether INPUT traffic is really on its way to another endpoint, in
    /// which case the ingress endpoint gets stamped into the mark.
    fn forward_check_chain(&self, ip_version: IpVersion) -> Chain {
        let this_host = self.ip_set(IPSET_ID_THIS_HOST_IPS, ip_version);
        let mut rules = vec![ChainRule::new(
            MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"),
            Action::Return,
        )];
        for ports in split_port_list(&self.config.kube_node_port_ranges) {
            for protocol in [PROTO_TCP, PROTO_UDP] {
                rules.push(
                    ChainRule::new(
                        MatchCriteria::new()
                            .protocol(protocol)
                            .dest_ports(ports.clone())
                            .dest_ip_set(this_host.clone()),
                        Action::goto(CHAIN_DISPATCH_SET_ENDPOINT_MARK),
                    )
                    .with_comment("To kubernetes NodePort service"),
                );
            }
        }
        rules.push(
            ChainRule::new(
                MatchCriteria::new().not_dest_ip_set(this_host),
                Action::jump(CHAIN_DISPATCH_SET_ENDPOINT_MARK),
            )
            .with_comment("To kubernetes service"),
        );
        Chain::new(CHAIN_FORWARD_CHECK, rules)
    }

    /// IPVS: OUTPUT traffic carrying an endpoint mark gets forward policy applied here.
    fn forward_endpoint_mark_chain(&self) -> Chain {
        let marks = &self.config.marks;
        let mut rules = vec![ChainRule::new(
            MatchCriteria::new().not_mark_matches_with_mask(marks.non_cali_endpoint, marks.endpoint),
            Action::jump(CHAIN_DISPATCH_FROM_ENDPOINT_MARK),
        )];
        for wildcard in self.config.workload_iface_wildcards() {
            rules.push(ChainRule::new(
                MatchCriteria::new().out_interface(wildcard),
                Action::jump(CHAIN_TO_WORKLOAD_DISPATCH),
            ));
        }
        rules.extend([
            ChainRule::always(Action::jump(CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD)),
            ChainRule::always(mark::clear(marks.endpoint)),
            self.accepted_rule(POLICY_ACCEPTED),
        ]);
        Chain::new(CHAIN_FORWARD_ENDPOINT_MARK, rules)
    }

    /// UDP flows of trusted DNS servers of this IP family, in conntrack `state`.
    fn dns_server_matches(
        &self,
        state: &'static str,
        ip_version: IpVersion,
    ) -> impl Iterator<Item = MatchCriteria> + '_ {
        self.config
            .dns_trusted_servers
            .iter()
            .filter(move |server| server.ip.is_version(ip_version))
            .map(move |server| {
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .conntrack_state(state)
                    .conntrack_orig_dest_port(server.port)
                    .conntrack_orig_dest(server.ip.to_string())
            })
    }

    fn dns_nflog() -> Action {
        Action::Nflog {
            group: NFLOG_DOMAIN_GROUP,
            prefix: DNS_ACTION_PREFIX.to_string(),
            size: DNS_NFLOG_SIZE,
        }
    }

    /// Responses from trusted DNS servers, going out `iface` if given.
    fn dns_response_snooping_rules(
        &self,
        iface: Option<&str>,
        ip_version: IpVersion,
    ) -> Vec<ChainRule> {
        let action = if self.config.dns_policy_mode == DnsPolicyMode::DelayDnsResponse
            && self.config.dns_packets_nfqueue_id != 0
        {
            Action::NfqueueWithBypass {
                queue: self.config.dns_packets_nfqueue_id,
            }
        } else {
            Self::dns_nflog()
        };
        let base = match iface {
            Some(iface) => MatchCriteria::new().out_interface(iface),
            None => MatchCriteria::new(),
        };
        self.dns_server_matches("ESTABLISHED", ip_version)
            .map(|server| ChainRule::new(base.clone().combine(server), action.clone()))
            .collect()
    }

    /// Requests to trusted DNS servers, coming in `iface` if given.
    fn dns_request_snooping_rules(
        &self,
        iface: Option<&str>,
        ip_version: IpVersion,
    ) -> Vec<ChainRule> {
        let base = match iface {
            Some(iface) => MatchCriteria::new().in_interface(iface),
            None => MatchCriteria::new(),
        };
        self.dns_server_matches("NEW", ip_version)
            .map(|server| ChainRule::new(base.clone().combine(server), Self::dns_nflog()))
            .collect()
    }

    fn output_tproxy_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.tproxy_filter_enabled() {
            return Vec::new();
        }
        vec![ChainRule::new(
            MatchCriteria::new().not_src_addr_type_local(false),
            Action::jump(CHAIN_FILTER_OUTPUT_TPROXY),
        )
        .with_comment("Police packets from proxy")]
    }

    fn output_ipvs_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.config.kube_ipvs_support_enabled {
            return Vec::new();
        }
        vec![ChainRule::new(
            MatchCriteria::new().mark_not_clear(self.config.marks.endpoint),
            Action::goto(CHAIN_FORWARD_ENDPOINT_MARK),
        )]
    }

    fn output_dns_request_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        self.dns_request_snooping_rules(None, ip_version)
    }

    /// Traffic to a local workload is policed on the workload's ingress chain instead.
    fn output_workload_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let mut rules = Vec::new();
        for wildcard in self.config.workload_iface_wildcards() {
            rules.extend(self.dns_response_snooping_rules(Some(&wildcard), ip_version));
            rules.push(ChainRule::new(
                MatchCriteria::new().out_interface(wildcard),
                Action::Return,
            ));
        }
        rules
    }

    fn output_ipip_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if ip_version != IpVersion::V4 || !self.config.ipip_enabled {
            return Vec::new();
        }
        vec![self.allow(
            MatchCriteria::new()
                .protocol(PROTO_IPIP)
                .dest_ip_set(self.ip_set(IPSET_ID_ALL_HOST_NETS, ip_version))
                .src_addr_type_local(true),
            "Allow IPIP packets to other Calico hosts",
        )]
    }

    fn output_vxlan_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let enabled = match ip_version {
            IpVersion::V4 => self.config.vxlan_enabled,
            IpVersion::V6 => self.config.vxlan_enabled_v6,
        };
        if !enabled {
            return Vec::new();
        }
        vec![self.allow(
            MatchCriteria::new()
                .protocol(PROTO_UDP)
                .dest_port(self.config.vxlan_port)
                .src_addr_type_local(true)
                .dest_ip_set(self.ip_set(IPSET_ID_ALL_VXLAN_SOURCE_NETS, ip_version)),
            &format!("Allow IPv{ip_version} VXLAN packets to other allowed hosts"),
        )]
    }

    fn output_egress_ip_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if !self.egress_ip_filter_enabled(ip_version) {
            return Vec::new();
        }
        vec![
            self.allow(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .src_addr_type_local(true)
                    .dest_port(self.config.egress_ip_vxlan_port),
                "Accept VXLAN UDP traffic from egress clients",
            ),
            self.allow(
                MatchCriteria::new()
                    .protocol(PROTO_TCP)
                    .src_addr_type_local(true)
                    .dest_ip_port_set(self.ip_set(IPSET_ID_ALL_EGW_HEALTH_PORTS, ip_version)),
                "Accept egress gateway health port probe traffic",
            ),
        ]
    }

    fn output_ipsec_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        if ip_version != IpVersion::V4 || !self.config.ipsec_enabled {
            return Vec::new();
        }
        let to_hosts = || {
            MatchCriteria::new()
                .dest_ip_set(self.ip_set(IPSET_ID_ALL_HOST_NETS, ip_version))
                .src_addr_type_local(true)
        };
        vec![
            self.allow(
                MatchCriteria::new().protocol(PROTO_ESP).combine(to_hosts()),
                "Allow IPSec ESP packets to other Calico hosts",
            ),
            self.allow(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .dest_port(PORT_IKE)
                    .combine(to_hosts()),
                "Allow IPSec IKE packets to other Calico hosts",
            ),
        ]
    }

    fn output_wireguard_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let Some(port) = self.wireguard_port(ip_version) else {
            return Vec::new();
        };
        vec![self.allow(
            MatchCriteria::new()
                .protocol(PROTO_UDP)
                .dest_port(port)
                .src_addr_type_local(true),
            &format!("Allow outgoing IPv{ip_version} Wireguard packets"),
        )]
    }

    /// Host endpoint policy only runs here for traffic that wasn't DNAT'd; the rest is
    /// handled in mangle POSTROUTING once the output interface is known.
    fn output_host_endpoint_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        vec![
            ChainRule::always(mark::clear(self.all_mark_bits)),
            ChainRule::new(
                MatchCriteria::new().not_conntrack_state("DNAT"),
                Action::jump(CHAIN_DISPATCH_TO_HOST_ENDPOINT),
            ),
            self.accepted_rule(HOST_POLICY_ACCEPTED),
        ]
    }

    fn forward_dns_rules(&self, ip_version: IpVersion) -> Vec<ChainRule> {
        let mut rules = Vec::new();
        for wildcard in self.config.workload_iface_wildcards() {
            rules.extend(self.dns_response_snooping_rules(Some(&wildcard), ip_version));
            rules.extend(self.dns_request_snooping_rules(Some(&wildcard), ip_version));
        }
        rules
    }

    fn filter_from_host_endpoint_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        let marks = &self.config.marks;
        vec![
            ChainRule::always(mark::clear(self.all_mark_bits & !(marks.accept | marks.ipsec))),
            ChainRule::new(
                MatchCriteria::new().mark_clear(marks.accept),
                Action::jump(CHAIN_DISPATCH_FROM_HOST_ENDPOINT_FORWARD),
            ),
        ]
    }

    fn forward_workload_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        self.config
            .workload_iface_wildcards()
            .flat_map(|wildcard| {
                [
                    ChainRule::new(
                        MatchCriteria::new().in_interface(wildcard.clone()),
                        Action::jump(CHAIN_FROM_WORKLOAD_DISPATCH),
                    ),
                    ChainRule::new(
                        MatchCriteria::new().out_interface(wildcard),
                        Action::jump(CHAIN_TO_WORKLOAD_DISPATCH),
                    ),
                ]
            })
            .collect()
    }

    fn forward_to_host_endpoint_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        vec![ChainRule::always(Action::jump(
            CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD,
        ))]
    }

    fn forward_cidr_block_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        vec![ChainRule::always(Action::jump(CHAIN_CIDR_BLOCK))]
    }

    /// The accept mark left set here tells mangle POSTROUTING the packet was forwarded.
    fn forward_accept_rules(&self, _ip_version: IpVersion) -> Vec<ChainRule> {
        vec![
            self.accepted_rule(POLICY_ACCEPTED),
            ChainRule::always(mark::set(self.config.marks.accept)),
        ]
    }

    fn mangle_egress_chains(&self) -> Vec<Chain> {
        let egress = self.config.marks.egress;
        let mut chains = vec![Chain::new(
            CHAIN_MANGLE_PREROUTING_EGRESS,
            vec![ChainRule::new(
                MatchCriteria::new()
                    .source_ip_set(self.ip_set(IPSET_ID_NAT_OUTGOING_ALL_POOLS, IpVersion::V4)),
                Action::RestoreConnMark { mask: egress },
            )
            .with_comment("Restore connmark for pod traffic")],
        )];
        let tunnel = if self.config.vxlan_enabled {
            Some("vxlan.calico")
        } else if self.config.ipip_enabled {
            Some("tunl0")
        } else {
            None
        };
        if let Some(tunnel) = tunnel {
            chains.push(Chain::new(
                CHAIN_MANGLE_POSTROUTING_EGRESS,
                vec![ChainRule::new(
                    mark::is_set(egress).out_interface(tunnel),
                    Action::ChecksumFill,
                )],
            ));
        }
        chains.push(Chain::new(
            CHAIN_MANGLE_PREROUTING_EGRESS_INBOUND,
            vec![ChainRule::new(
                MatchCriteria::new().in_interface(self.config.egress_ip_interface.clone()),
                mark::set_masked(egress, egress),
            )
            .with_comment("Set mark for returning egress packet")],
        ));
        chains
    }

    fn mangle_tproxy_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let proxy = self.config.marks.proxy;
        let upstream = self.config.tproxy_upstream_conn_mark;
        let port = self.config.tproxy_port;
        let tproxy = |port: u16| Action::Tproxy {
            mark: proxy,
            mask: proxy,
            port,
        };
        let set_conn_mark = |mark: u32| Action::SetConnMark { mark, mask: proxy };

        let established = Chain::new(
            CHAIN_MANGLE_PREROUTING_TPROXY_ESTABL,
            vec![
                ChainRule::always(mark::clear(upstream))
                    .with_comment("Clean upstream mark, not needed anymore"),
                ChainRule::new(
                    MatchCriteria::new().mark_clear(proxy),
                    Action::RestoreConnMark { mask: proxy },
                )
                .with_comment("Restore proxy mark from connection if not set"),
                ChainRule::new(
                    MatchCriteria::new().mark_matches_with_mask(proxy, proxy),
                    Action::Accept,
                )
                .with_comment("Accept packets destined to proxy on existing connection"),
            ],
        );
        let services = Chain::new(
            CHAIN_MANGLE_PREROUTING_TPROXY_SVC,
            vec![
                ChainRule::always(set_conn_mark(proxy))
                    .with_comment("Mark the connection so that subsequent packets go to proxy"),
                ChainRule::new(MatchCriteria::new().protocol(PROTO_TCP), tproxy(port))
                    .with_comment("Divert the TCP connection to proxy"),
                ChainRule::always(set_conn_mark(0)).with_comment("Unmark non-proxied"),
            ],
        );
        let select = Chain::new(
            CHAIN_MANGLE_PREROUTING_TPROXY_SELECT,
            vec![
                ChainRule::new(
                    MatchCriteria::new()
                        .dest_ip_port_set(self.ip_set(IPSET_ID_TPROXY_SERVICE_IPS, ip_version)),
                    Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_SVC),
                )
                .with_comment("Proxy selected services"),
                ChainRule::new(
                    MatchCriteria::new()
                        .protocol(PROTO_TCP)
                        .dest_ip_set(self.ip_set(IPSET_ID_TPROXY_POD_IPS, ip_version)),
                    Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_SVC),
                )
                .with_comment("Proxy selected pods"),
                // One node port set serves both IP versions.
                ChainRule::new(
                    MatchCriteria::new()
                        .protocol(PROTO_TCP)
                        .dest_addr_type_local()
                        .dest_ip_port_set(self.ip_set(IPSET_ID_TPROXY_NODE_PORTS, IpVersion::V4)),
                    Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_NP),
                )
                .with_comment("Proxy selected nodeports"),
            ],
        );
        let node_ports = Chain::new(
            CHAIN_MANGLE_PREROUTING_TPROXY_NP,
            [PROTO_TCP, PROTO_UDP]
                .into_iter()
                .map(|protocol| {
                    ChainRule::new(
                        MatchCriteria::new().protocol(protocol).dest_addr_type_local(),
                        tproxy(port.saturating_add(1)),
                    )
                    .with_comment("Divert the TCP connection to proxy")
                })
                .collect(),
        );
        let output = Chain::new(
            CHAIN_MANGLE_OUTPUT_TPROXY,
            vec![
                ChainRule::always(set_conn_mark(proxy))
                    .with_comment("Mark any non-local connection as local for return"),
                ChainRule::new(
                    MatchCriteria::new().mark_matches_with_mask(upstream, upstream),
                    Action::SetConnMark {
                        mark: upstream,
                        mask: upstream,
                    },
                )
                .with_comment("Save tproxy upstream mark in conntrack if set"),
                ChainRule::new(
                    MatchCriteria::new()
                        .source_dest_ip_set(self.ip_set(IPSET_ID_TPROXY_POD_SELF, ip_version)),
                    mark::set_masked(
                        self.config.kube_masquerade_mark,
                        self.config.kube_masquerade_mark,
                    ),
                )
                .with_comment("MASQ proxied pod-service-self"),
            ],
        );
        let output_host_net = Chain::new(
            CHAIN_MANGLE_OUTPUT_TPROXY_HOST_NET,
            vec![
                ChainRule::new(
                    MatchCriteria::new().mark_clear(upstream),
                    Action::RestoreConnMark { mask: upstream },
                )
                .with_comment("Restore tproxy upstream mark in conntrack if not set"),
                ChainRule::new(
                    MatchCriteria::new()
                        .mark_matches_with_mask(upstream, upstream)
                        .conntrack_state("RELATED,ESTABLISHED"),
                    Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_ESTABL),
                )
                .with_comment("If upstream and from local address, accept it"),
            ],
        );
        vec![established, services, select, node_ports, output, output_host_net]
    }

    fn mangle_prerouting_chain(&self) -> Chain {
        let tproxy = self.config.tproxy_mode.is_enabled();
        let allow = || self.mangle_allow_action().clone();
        let accepted = || mark::is_set(self.config.marks.accept);
        let mut rules = Vec::new();
        if tproxy {
            rules.push(
                ChainRule::new(
                    MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"),
                    Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_ESTABL),
                )
                .with_comment("Check if should be proxied when established"),
            );
        }
        rules.extend([
            ChainRule::new(
                MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"),
                allow(),
            ),
            ChainRule::new(accepted(), allow()),
            ChainRule::always(Action::jump(CHAIN_DISPATCH_FROM_HOST_ENDPOINT)),
            ChainRule::new(accepted(), allow()).with_comment(HOST_POLICY_ACCEPTED),
        ]);
        if tproxy {
            rules.push(
                ChainRule::always(Action::jump(CHAIN_MANGLE_PREROUTING_TPROXY_SELECT))
                    .with_comment("Check if it is a new connection to be proxied"),
            );
        }
        Chain::new(CHAIN_MANGLE_PREROUTING, rules)
    }

    /// Host endpoint egress policy for DNAT'd local traffic, which only has its final
    /// output interface from here on.
    fn mangle_postrouting_chain(&self) -> Chain {
        let accepted = || mark::is_set(self.config.marks.accept);
        let mut rules = vec![ChainRule::new(accepted(), Action::Return)];
        if self.config.kube_ipvs_support_enabled {
            rules.push(ChainRule::new(
                MatchCriteria::new().mark_not_clear(self.config.marks.endpoint),
                Action::Return,
            ));
        }
        rules.extend([
            ChainRule::always(mark::clear(self.all_mark_bits)),
            ChainRule::new(
                MatchCriteria::new().conntrack_state("DNAT"),
                Action::jump(CHAIN_DISPATCH_TO_HOST_ENDPOINT),
            ),
            ChainRule::new(accepted(), Action::Return).with_comment(HOST_POLICY_ACCEPTED),
        ]);
        Chain::new(CHAIN_MANGLE_POSTROUTING, rules)
    }

    fn mangle_output_chain(&self) -> Chain {
        let mut rules = Vec::new();
        if self.config.tproxy_mode.is_enabled() {
            rules.push(
                ChainRule::new(
                    MatchCriteria::new().not_src_addr_type_local(false),
                    Action::jump(CHAIN_MANGLE_OUTPUT_TPROXY),
                )
                .with_comment("Process non-local connections as proxied"),
            );
            rules.push(
                ChainRule::new(
                    MatchCriteria::new().src_addr_type_local(false),
                    Action::jump(CHAIN_MANGLE_OUTPUT_TPROXY_HOST_NET),
                )
                .with_comment("Check local connections for host networked workloads"),
            );
        }
        Chain::new(CHAIN_MANGLE_OUTPUT, rules)
    }

    fn wireguard_host_encryption(&self) -> bool {
        let config = &self.config;
        let v4 = config.wireguard_enabled && !config.wireguard_interface_name.is_empty();
        let v6 = config.wireguard_enabled_v6 && !config.wireguard_interface_name_v6.is_empty();
        (v4 || v6) && config.wireguard_encrypt_host_traffic
    }

    /// Marks workload traffic, drops spoofed workload sources and runs untracked host
    /// endpoint policy for everything else.
    fn raw_prerouting_chain(&self, ip_version: IpVersion) -> Chain {
        let marks = &self.config.marks;
        let from_workload = marks.scratch0;
        let mut rules = vec![ChainRule::always(mark::clear(self.all_mark_bits))];
        if self.wireguard_host_encryption() {
            rules.push(ChainRule::always(Action::jump(
                CHAIN_SET_WIREGUARD_INCOMING_MARK,
            )));
        }
        for wildcard in self.config.workload_iface_wildcards() {
            rules.push(ChainRule::new(
                MatchCriteria::new().in_interface(wildcard),
                mark::set(from_workload),
            ));
        }
        if ip_version == IpVersion::V4 && marks.ipsec != 0 {
            rules.push(ChainRule::new(mark::is_set(from_workload), mark::set(marks.ipsec)));
        }
        rules.push(ChainRule::new(
            MatchCriteria::new().mark_matches_with_mask(from_workload, from_workload),
            Action::jump(CHAIN_RPF_SKIP),
        ));
        rules.extend(self.rpf_filter_rules(ip_version, from_workload, from_workload, false));
        rules.extend([
            ChainRule::new(
                MatchCriteria::new().mark_clear(from_workload),
                Action::jump(CHAIN_DISPATCH_FROM_HOST_ENDPOINT),
            ),
            ChainRule::new(mark::is_set(marks.accept), Action::Accept),
        ]);
        Chain::new(CHAIN_RAW_PREROUTING, rules)
    }

    /// Drops packets failing the strict reverse path check. A zero `mark` means the caller
    /// already knows the packet came from a workload.
    pub fn rpf_filter_rules(
        &self,
        ip_version: IpVersion,
        mark: u32,
        mask: u32,
        accept_local: bool,
    ) -> Vec<ChainRule> {
        let mut rules = Vec::new();
        // DHCP discovery from 0.0.0.0 fails the rpfilter match on some kernels.
        if self.config.openstack_special_cases && ip_version == IpVersion::V4 {
            rules.push(ChainRule::new(
                MatchCriteria::new()
                    .protocol(PROTO_UDP)
                    .source_net("0.0.0.0/32")
                    .source_port(68)
                    .dest_port(67),
                Action::Accept,
            ));
        }
        let base = if mark == 0 {
            MatchCriteria::new()
        } else {
            MatchCriteria::new().mark_matches_with_mask(mark, mask)
        };
        rules.extend(self.drop_rules(base.rpf_check_failed(accept_local), &[]));
        rules
    }

    /// Sets the WireGuard mark on incoming packets that didn't arrive over the tunnel, over
    /// loopback or from a workload.
    pub fn wireguard_incoming_mark_chain(&self) -> Chain {
        let config = &self.config;
        let mut rules: Vec<ChainRule> = [
            "lo",
            config.wireguard_interface_name.as_str(),
            config.wireguard_interface_name_v6.as_str(),
        ]
        .into_iter()
        .filter(|iface| !iface.is_empty())
        .map(|iface| ChainRule::new(MatchCriteria::new().in_interface(iface), Action::Return))
        .collect();
        for wildcard in config.workload_iface_wildcards() {
            rules.push(ChainRule::new(
                MatchCriteria::new().in_interface(wildcard),
                Action::Return,
            ));
        }
        rules.push(ChainRule::always(mark::set(config.wireguard_mark)));
        Chain::new(CHAIN_SET_WIREGUARD_INCOMING_MARK, rules)
    }

    fn raw_output_chain(&self) -> Chain {
        Chain::new(
            CHAIN_RAW_OUTPUT,
            vec![
                ChainRule::always(mark::clear(self.all_mark_bits)),
                ChainRule::always(Action::jump(CHAIN_DISPATCH_TO_HOST_ENDPOINT)),
                ChainRule::new(mark::is_set(self.config.marks.accept), Action::Accept),
            ],
        )
    }
}

fn failsafe_protocol(protocol: &str) -> Option<&'static str> {
    match protocol.to_ascii_lowercase().as_str() {
        "tcp" => Some("tcp"),
        "udp" => Some("udp"),
        "sctp" => Some("sctp"),
        _ => None,
    }
}
