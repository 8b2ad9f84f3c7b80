//! NAT table chains, plus the blocked CIDR chain that sits in filter.
use std::{collections::BTreeMap, net::IpAddr};

use chain_render_common::{mark, Action, Chain, ChainRule, IpVersion, MatchCriteria};
use ipnet::IpNet;

use crate::{
    cidr::IpFamily, Renderer, CHAIN_CIDR_BLOCK, CHAIN_FIP_DNAT, CHAIN_FIP_SNAT,
    CHAIN_NAT_OUTGOING, CHAIN_NAT_OUTPUT, CHAIN_NAT_POSTROUTING, CHAIN_NAT_PREROUTING,
    CHAIN_NAT_PREROUTING_EGRESS, IPSET_ID_ALL_HOST_NETS, IPSET_ID_NAT_OUTGOING_ALL_POOLS,
    IPSET_ID_NAT_OUTGOING_MASQ_POOLS, PROTO_TCP, PROTO_UDP,
};

const OPENSTACK_METADATA_NET: &str = "169.254.169.254/32";
const OPENSTACK_METADATA_PORT: u16 = 80;

impl Renderer {
    /// PREROUTING (plus the egress gateway mark chain), POSTROUTING, OUTPUT.
    pub fn static_nat_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let mut chains = self.nat_prerouting_chains(ip_version);
        chains.push(self.nat_postrouting_chain(ip_version));
        chains.push(Chain::new(
            CHAIN_NAT_OUTPUT,
            vec![ChainRule::always(Action::jump(CHAIN_FIP_DNAT))],
        ));
        chains
    }

    fn nat_prerouting_chains(&self, ip_version: IpVersion) -> Vec<Chain> {
        let config = &self.config;
        let mut rules = vec![ChainRule::always(Action::jump(CHAIN_FIP_DNAT))];
        if let (IpVersion::V4, true, Some(metadata_ip)) = (
            ip_version,
            config.openstack_special_cases,
            config.openstack_metadata_ip,
        ) {
            rules.push(ChainRule::new(
                MatchCriteria::new()
                    .protocol(PROTO_TCP)
                    .dest_port(OPENSTACK_METADATA_PORT)
                    .dest_net(OPENSTACK_METADATA_NET),
                Action::Dnat {
                    address: metadata_ip,
                    port: Some(config.openstack_metadata_port),
                },
            ));
        }
        let mut chains = vec![Chain::new(CHAIN_NAT_PREROUTING, rules)];

        if ip_version == IpVersion::V4 && config.egress_ip_enabled {
            let egress = config.marks.egress;
            let pools = self.ip_sets.name_for(IPSET_ID_NAT_OUTGOING_ALL_POOLS, ip_version);
            chains.push(Chain::new(
                CHAIN_NAT_PREROUTING_EGRESS,
                vec![
                    // First packet from a pod to anything that isn't a pod or a host.
                    ChainRule::new(
                        MatchCriteria::new()
                            .source_ip_set(pools.clone())
                            .not_dest_ip_set(pools)
                            .not_dest_ip_set(
                                self.ip_sets.name_for(IPSET_ID_ALL_HOST_NETS, ip_version),
                            ),
                        mark::set_masked(egress, egress),
                    )
                    .with_comment("Set mark for egress packet"),
                    ChainRule::new(
                        mark::is_set(egress),
                        Action::SaveConnMark { mask: u32::MAX },
                    )
                    .with_comment("Save mark for egress connection"),
                ],
            ));
        }
        chains
    }

    /// Floating IP SNAT, NAT-outgoing, then source fix-up for tunnel devices.
    fn nat_postrouting_chain(&self, ip_version: IpVersion) -> Chain {
        let mut rules = vec![
            ChainRule::always(Action::jump(CHAIN_FIP_SNAT)),
            ChainRule::always(Action::jump(CHAIN_NAT_OUTGOING)),
        ];
        // A host process that bound the wrong local address, or reached a service IP
        // through NAT, would send down the tunnel with a source the peer can't route back.
        for tunnel in self.tunnel_ifaces(ip_version) {
            rules.push(ChainRule::new(
                MatchCriteria::new()
                    .out_interface(tunnel)
                    .not_src_addr_type_local(true)
                    .src_addr_type_local(false),
                Action::Masquerade { to_ports: None },
            ));
        }
        Chain::new(CHAIN_NAT_POSTROUTING, rules)
    }

    fn tunnel_ifaces(&self, ip_version: IpVersion) -> Vec<String> {
        let config = &self.config;
        let mut ifaces = Vec::new();
        match ip_version {
            IpVersion::V4 => {
                if config.ipip_enabled && config.ipip_tunnel_address.is_some() {
                    ifaces.push("tunl0".to_string());
                }
                if config.vxlan_enabled && config.vxlan_tunnel_address.is_some() {
                    ifaces.push("vxlan.calico".to_string());
                }
                // WireGuard gets its address at runtime, so the device alone is enough.
                if config.wireguard_enabled && !config.wireguard_interface_name.is_empty() {
                    ifaces.push(config.wireguard_interface_name.clone());
                }
            }
            IpVersion::V6 => {
                if config.vxlan_enabled_v6 && config.vxlan_tunnel_address_v6.is_some() {
                    ifaces.push("vxlan-v6.calico".to_string());
                }
                if config.wireguard_enabled_v6 && !config.wireguard_interface_name_v6.is_empty() {
                    ifaces.push(config.wireguard_interface_name_v6.clone());
                }
            }
        }
        ifaces
    }

    /// `cali-nat-outgoing`: traffic from a masquerading pool to anywhere outside the pools
    /// leaves with the host's (or the configured) source address. Empty when no pool has
    /// NAT-outgoing on.
    pub fn nat_outgoing_chain(&self, active: bool, ip_version: IpVersion) -> Chain {
        if !active {
            return Chain::new(CHAIN_NAT_OUTGOING, Vec::new());
        }
        let config = &self.config;
        let address = config
            .nat_outgoing_address
            .filter(|address| address.is_version(ip_version));
        let action = |ports: Option<String>| match address {
            Some(address) => Action::Snat {
                to_address: match (address, ports) {
                    (IpAddr::V6(_), Some(ports)) => format!("[{address}]:{ports}"),
                    (_, Some(ports)) => format!("{address}:{ports}"),
                    (_, None) => address.to_string(),
                },
            },
            None => Action::Masquerade { to_ports: ports },
        };
        let rule = |protocol: Option<&str>, action: Action| {
            let mut criteria = MatchCriteria::new()
                .source_ip_set(self.ip_sets.name_for(IPSET_ID_NAT_OUTGOING_MASQ_POOLS, ip_version))
                .not_dest_ip_set(self.ip_sets.name_for(IPSET_ID_NAT_OUTGOING_ALL_POOLS, ip_version));
            if let Some(protocol) = protocol {
                criteria = criteria.protocol(protocol);
            }
            if let Some(iface) = &config.nat_outgoing_interface_filter {
                criteria = criteria.out_interface(iface.clone());
            }
            ChainRule::new(criteria, action)
        };

        // Only TCP and UDP have ports to remap; everything else keeps its own.
        let rules = match config.nat_port_range {
            Some(range) if range.last > 0 => {
                let ports = format!("{}-{}", range.first, range.last);
                vec![
                    rule(Some(PROTO_TCP), action(Some(ports.clone()))),
                    rule(Some(PROTO_UDP), action(Some(ports))),
                    rule(None, action(None)),
                ]
            }
            _ => vec![rule(None, action(None))],
        };
        Chain::new(CHAIN_NAT_OUTGOING, rules)
    }

    /// `cali-fip-dnat`: external to internal address of each floating IP of this family.
    pub fn floating_ip_dnat_chain(
        &self,
        dnats: &BTreeMap<IpAddr, IpAddr>,
        ip_version: IpVersion,
    ) -> Chain {
        let rules = dnats
            .iter()
            .filter(|(external, _)| external.is_version(ip_version))
            .map(|(external, internal)| {
                ChainRule::new(
                    MatchCriteria::new().dest_net(external.to_string()),
                    Action::Dnat {
                        address: *internal,
                        port: None,
                    },
                )
            })
            .collect();
        Chain::new(CHAIN_FIP_DNAT, rules)
    }

    /// `cali-fip-snat`: hairpinned traffic of each floating IP leaves with the external
    /// address. Keyed by internal address.
    pub fn floating_ip_snat_chain(
        &self,
        snats: &BTreeMap<IpAddr, IpAddr>,
        ip_version: IpVersion,
    ) -> Chain {
        let rules = snats
            .iter()
            .filter(|(internal, _)| internal.is_version(ip_version))
            .map(|(internal, external)| {
                ChainRule::new(
                    MatchCriteria::new()
                        .source_net(internal.to_string())
                        .dest_net(internal.to_string()),
                    Action::Snat {
                        to_address: external.to_string(),
                    },
                )
            })
            .collect();
        Chain::new(CHAIN_FIP_SNAT, rules)
    }

    /// `cali-cidr-block`: service CIDRs that must not loop back out of the host. Empty
    /// when service loop prevention is off.
    pub fn blocked_cidrs_chain(&self, cidrs: &[IpNet], ip_version: IpVersion) -> Chain {
        let rules = match self.block_cidr_action() {
            Some(action) => cidrs
                .iter()
                .filter(|cidr| cidr.is_version(ip_version))
                .map(|cidr| {
                    ChainRule::new(MatchCriteria::new().dest_net(cidr.to_string()), action.clone())
                })
                .collect(),
            None => Vec::new(),
        };
        Chain::new(CHAIN_CIDR_BLOCK, rules)
    }
}
