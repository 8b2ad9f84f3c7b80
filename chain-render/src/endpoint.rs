//! Per-endpoint chains: the place where tiers, policy groups and profiles are stitched
//! together for one interface.
//!
//! Each chain is built by a fixed sequence of contributors (see [ENDPOINT_CONTRIBUTORS]).
//! Every contributor decides for itself whether its feature applies, so the order of the
//! rules in a chain is the order of that list and nothing else.

use chain_render_common::{mark, Action, Chain, ChainRule, IpVersion, MatchCriteria};
use serde::{Deserialize, Serialize};

use crate::{
    chain_name::{endpoint_chain_name, profile_chain_name},
    endpoint_mark::EndpointMarkMapper,
    nflog::{NflogPrefix, RuleDirection},
    policy_group::TierPolicyGroups,
    ProfileId, Renderer, CHAIN_FAILSAFE_IN, CHAIN_FAILSAFE_OUT, HOST_FROM_ENDPOINT_FORWARD_PFX,
    HOST_FROM_ENDPOINT_PFX, HOST_TO_ENDPOINT_FORWARD_PFX, HOST_TO_ENDPOINT_PFX,
    IPSET_ID_ALL_HOST_NETS, IPSET_ID_ALL_TUNNEL_NETS, PROFILE_INBOUND_PFX, PROFILE_OUTBOUND_PFX,
    PROTO_IPIP, PROTO_TCP, PROTO_UDP, SET_ENDPOINT_MARK_PFX, WORKLOAD_FROM_ENDPOINT_PFX,
    WORKLOAD_TO_ENDPOINT_PFX,
};

const DEFAULT_EGRESS_GATEWAY_HEALTH_PORT: u16 = 8080;

const NO_PROFILE_MATCHED: &str = "Drop if no profiles matched";
const EGRESS_GATEWAY_INGRESS_DROP: &str = "Drop all other ingress traffic to egress gateway.";
const NO_POLICY_PASSED: &str = "Drop if no policies passed packet";

/// Which table an endpoint chain lives in, and so which parts of the pipeline it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChainType {
    /// Filter table: conntrack, tiers with end-of-tier drop, profiles.
    Normal,
    /// Raw table: no conntrack, accepted packets also skip tracking.
    Untracked,
    /// Mangle table before DNAT. Tiers only.
    PreDnat,
    /// Forwarded traffic of a host endpoint. No tiers means allow.
    Forward,
}

/// What the renderer needs to know about one workload interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadEndpoint {
    pub iface: String,
    pub admin_up: bool,
    #[serde(skip)]
    pub tiers: Vec<TierPolicyGroups>,
    pub profile_ids: Vec<String>,
    pub is_egress_gateway: bool,
    /// Port of the egress gateway readiness probe. Zero means 8080.
    pub egress_gateway_health_port: u16,
}

impl WorkloadEndpoint {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            admin_up: true,
            ..Default::default()
        }
    }

    pub fn with_admin_up(self, admin_up: bool) -> Self {
        Self { admin_up, ..self }
    }

    pub fn with_tiers(self, tiers: Vec<TierPolicyGroups>) -> Self {
        Self { tiers, ..self }
    }

    pub fn with_profiles(self, profile_ids: Vec<String>) -> Self {
        Self {
            profile_ids,
            ..self
        }
    }

    pub fn with_egress_gateway(self, health_port: u16) -> Self {
        Self {
            is_egress_gateway: true,
            egress_gateway_health_port: health_port,
            ..self
        }
    }
}

/// Everything that varies between the endpoint chains of one renderer.
#[derive(Debug, Clone)]
pub(crate) struct EndpointChain<'a> {
    name: String,
    tiers: &'a [TierPolicyGroups],
    profile_ids: &'a [String],
    profile_prefix: &'static str,
    failsafe_chain: Option<&'static str>,
    chain_type: ChainType,
    admin_up: bool,
    direction: RuleDirection,
    allow_action: Action,
    allow_vxlan_encap: bool,
    allow_ipip_encap: bool,
    is_egress_gateway: bool,
    egress_gateway_health_port: u16,
    ip_version: Option<IpVersion>,
    end_of_chain_comment: &'static str,
}

impl<'a> EndpointChain<'a> {
    fn new(
        name: String,
        direction: RuleDirection,
        chain_type: ChainType,
        allow_action: Action,
    ) -> Self {
        Self {
            name,
            tiers: &[],
            profile_ids: &[],
            profile_prefix: match direction {
                RuleDirection::Ingress => PROFILE_INBOUND_PFX,
                RuleDirection::Egress => PROFILE_OUTBOUND_PFX,
            },
            failsafe_chain: None,
            chain_type,
            admin_up: true,
            direction,
            allow_action,
            allow_vxlan_encap: true,
            allow_ipip_encap: true,
            is_egress_gateway: false,
            egress_gateway_health_port: DEFAULT_EGRESS_GATEWAY_HEALTH_PORT,
            ip_version: None,
            end_of_chain_comment: NO_PROFILE_MATCHED,
        }
    }

    fn tiers(self, tiers: &'a [TierPolicyGroups]) -> Self {
        Self { tiers, ..self }
    }

    fn profiles(self, profile_ids: &'a [String]) -> Self {
        Self {
            profile_ids,
            ..self
        }
    }

    fn failsafe(self, chain: &'static str) -> Self {
        Self {
            failsafe_chain: Some(chain),
            ..self
        }
    }
}

type Contributor = fn(&Renderer, &EndpointChain<'_>) -> Vec<ChainRule>;

/// Rule contributors of an admin-up endpoint chain, in chain order.
pub(crate) const ENDPOINT_CONTRIBUTORS: [(&str, Contributor); 8] = [
    ("conntrack", Renderer::conntrack_rules),
    ("failsafe", Renderer::failsafe_jump_rules),
    ("clear-verdict", Renderer::clear_verdict_rules),
    ("egress-gateway", Renderer::egress_gateway_rules),
    ("encap-drop", Renderer::encap_drop_rules),
    ("tiers", Renderer::tier_rules),
    ("forward-default", Renderer::forward_default_rules),
    ("profiles", Renderer::profile_rules),
];

impl Renderer {
    /// `cali-tw-<iface>` (ingress policy), `cali-fw-<iface>` (egress policy) and, with
    /// IPVS support, `cali-sm-<iface>`.
    pub fn workload_endpoint_to_chains(
        &self,
        endpoint: &WorkloadEndpoint,
        mark_mapper: &mut dyn EndpointMarkMapper,
        ip_version: IpVersion,
    ) -> Vec<Chain> {
        tracing::debug!(iface = %endpoint.iface, %ip_version, "Rendering workload endpoint chains");
        let max = self.max_chain_name_length;
        let allow = self.filter_allow_action().clone();
        let workload_chain = |prefix: &str, direction: RuleDirection| {
            let chain = EndpointChain {
                admin_up: endpoint.admin_up,
                is_egress_gateway: endpoint.is_egress_gateway,
                egress_gateway_health_port: match endpoint.egress_gateway_health_port {
                    0 => DEFAULT_EGRESS_GATEWAY_HEALTH_PORT,
                    port => port,
                },
                ip_version: Some(ip_version),
                ..EndpointChain::new(
                    endpoint_chain_name(prefix, &endpoint.iface, max),
                    direction,
                    ChainType::Normal,
                    allow.clone(),
                )
            };
            chain.tiers(&endpoint.tiers).profiles(&endpoint.profile_ids)
        };

        let to_endpoint = workload_chain(WORKLOAD_TO_ENDPOINT_PFX, RuleDirection::Ingress);
        // Encapsulated traffic from a workload could tunnel past its egress policy.
        let from_endpoint = EndpointChain {
            allow_vxlan_encap: self.config.allow_vxlan_packets_from_workloads,
            allow_ipip_encap: self.config.allow_ipip_packets_from_workloads,
            ..workload_chain(WORKLOAD_FROM_ENDPOINT_PFX, RuleDirection::Egress)
        };

        let mut chains = vec![
            self.endpoint_chain(to_endpoint),
            self.endpoint_chain(from_endpoint),
        ];
        if self.config.kube_ipvs_support_enabled {
            chains.push(self.endpoint_set_mark_chain(&endpoint.iface, mark_mapper));
        }
        chains
    }

    /// Filter table chains of a host endpoint: `cali-th-`, `cali-fh-`, the forward
    /// variants `cali-thfw-` / `cali-fhfw-` and, with IPVS support, `cali-sm-`.
    pub fn host_endpoint_to_filter_chains(
        &self,
        iface: &str,
        tiers: &[TierPolicyGroups],
        forward_tiers: &[TierPolicyGroups],
        mark_mapper: &mut dyn EndpointMarkMapper,
        profile_ids: &[String],
    ) -> Vec<Chain> {
        tracing::debug!(iface, "Rendering filter host endpoint chains");
        let max = self.max_chain_name_length;
        let allow = self.filter_allow_action();
        let host_chain = |prefix: &str, direction, chain_type, tiers| {
            EndpointChain::new(
                endpoint_chain_name(prefix, iface, max),
                direction,
                chain_type,
                allow.clone(),
            )
            .tiers(tiers)
            .profiles(profile_ids)
        };

        let mut chains = vec![
            self.endpoint_chain(
                host_chain(HOST_TO_ENDPOINT_PFX, RuleDirection::Egress, ChainType::Normal, tiers)
                    .failsafe(CHAIN_FAILSAFE_OUT),
            ),
            self.endpoint_chain(
                host_chain(HOST_FROM_ENDPOINT_PFX, RuleDirection::Ingress, ChainType::Normal, tiers)
                    .failsafe(CHAIN_FAILSAFE_IN),
            ),
            self.endpoint_chain(host_chain(
                HOST_TO_ENDPOINT_FORWARD_PFX,
                RuleDirection::Egress,
                ChainType::Forward,
                forward_tiers,
            )),
            self.endpoint_chain(host_chain(
                HOST_FROM_ENDPOINT_FORWARD_PFX,
                RuleDirection::Ingress,
                ChainType::Forward,
                forward_tiers,
            )),
        ];
        if self.config.kube_ipvs_support_enabled {
            chains.push(self.endpoint_set_mark_chain(iface, mark_mapper));
        }
        chains
    }

    /// Mangle table chain for traffic to a host endpoint. Allowed packets return so later
    /// mangle rules still see them.
    pub fn host_endpoint_to_mangle_egress_chains(
        &self,
        iface: &str,
        tiers: &[TierPolicyGroups],
        profile_ids: &[String],
    ) -> Vec<Chain> {
        tracing::debug!(iface, "Rendering mangle egress host endpoint chain");
        let chain = EndpointChain::new(
            endpoint_chain_name(HOST_TO_ENDPOINT_PFX, iface, self.max_chain_name_length),
            RuleDirection::Egress,
            ChainType::Normal,
            Action::Return,
        )
        .tiers(tiers)
        .profiles(profile_ids)
        .failsafe(CHAIN_FAILSAFE_OUT);
        vec![self.endpoint_chain(chain)]
    }

    /// Raw table chains of a host endpoint, for untracked policy. Profiles don't apply.
    pub fn host_endpoint_to_raw_chains(
        &self,
        iface: &str,
        untracked_tiers: &[TierPolicyGroups],
    ) -> Vec<Chain> {
        tracing::debug!(iface, "Rendering raw host endpoint chains");
        let max = self.max_chain_name_length;
        vec![
            self.endpoint_chain(
                EndpointChain::new(
                    endpoint_chain_name(HOST_TO_ENDPOINT_PFX, iface, max),
                    RuleDirection::Egress,
                    ChainType::Untracked,
                    Action::Accept,
                )
                .tiers(untracked_tiers)
                .failsafe(CHAIN_FAILSAFE_OUT),
            ),
            self.endpoint_chain(
                EndpointChain::new(
                    endpoint_chain_name(HOST_FROM_ENDPOINT_PFX, iface, max),
                    RuleDirection::Ingress,
                    ChainType::Untracked,
                    Action::Accept,
                )
                .tiers(untracked_tiers)
                .failsafe(CHAIN_FAILSAFE_IN),
            ),
        ]
    }

    /// Mangle table chain for pre-DNAT policy. Only traffic from the endpoint is covered.
    pub fn host_endpoint_to_mangle_ingress_chains(
        &self,
        iface: &str,
        pre_dnat_tiers: &[TierPolicyGroups],
    ) -> Vec<Chain> {
        tracing::debug!(iface, "Rendering pre-DNAT host endpoint chain");
        let chain = EndpointChain::new(
            endpoint_chain_name(HOST_FROM_ENDPOINT_PFX, iface, self.max_chain_name_length),
            RuleDirection::Ingress,
            ChainType::PreDnat,
            self.mangle_allow_action().clone(),
        )
        .tiers(pre_dnat_tiers)
        .failsafe(CHAIN_FAILSAFE_IN);
        vec![self.endpoint_chain(chain)]
    }

    /// Writes the endpoint's value into the endpoint mark. Empty if no value could be had.
    fn endpoint_set_mark_chain(&self, iface: &str, mark_mapper: &mut dyn EndpointMarkMapper) -> Chain {
        let name = endpoint_chain_name(SET_ENDPOINT_MARK_PFX, iface, self.max_chain_name_length);
        let rules = match mark_mapper.endpoint_mark(iface) {
            Ok(value) => vec![ChainRule::always(mark::set_masked(value, mark_mapper.mask()))],
            Err(error) => {
                tracing::error!(iface, %error, "Failed to get endpoint mark");
                Vec::new()
            }
        };
        Chain::new(name, rules)
    }

    pub(crate) fn endpoint_chain(&self, mut chain: EndpointChain<'_>) -> Chain {
        if !chain.admin_up {
            let rules = self.drop_rules(MatchCriteria::new(), &["Endpoint admin disabled"]);
            return Chain::new(chain.name, rules);
        }
        if !self.config.bpf_enabled
            && chain.is_egress_gateway
            && chain.direction == RuleDirection::Ingress
        {
            chain.tiers = &[];
            chain.profile_ids = &[];
            chain.end_of_chain_comment = EGRESS_GATEWAY_INGRESS_DROP;
        }
        let rules = ENDPOINT_CONTRIBUTORS
            .iter()
            .flat_map(|(_, contribute)| contribute(self, &chain))
            .collect();
        Chain::new(chain.name, rules)
    }

    /// Lets established flows through before any policy runs.
    fn conntrack_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        if chain.chain_type == ChainType::Untracked {
            return Vec::new();
        }
        let established = || MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED");
        let mut rules = Vec::new();
        if chain.allow_action != Action::Accept {
            rules.push(ChainRule::new(
                established(),
                mark::set(self.config.marks.accept),
            ));
        }
        rules.push(ChainRule::new(established(), chain.allow_action.clone()));
        // Egress gateway return traffic takes a different path than the tunnelled request.
        if !(self.config.disable_conntrack_invalid || chain.is_egress_gateway) {
            rules.push(ChainRule::new(
                MatchCriteria::new().conntrack_state("INVALID"),
                Action::Drop,
            ));
        }
        rules
    }

    fn failsafe_jump_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        chain
            .failsafe_chain
            .map(|failsafe| ChainRule::always(Action::jump(failsafe)))
            .into_iter()
            .collect()
    }

    fn clear_verdict_rules(&self, _chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        let marks = &self.config.marks;
        vec![ChainRule::always(mark::clear(marks.accept | marks.drop))]
    }

    /// Tunnel and readiness traffic between egress gateways and Calico hosts.
    fn egress_gateway_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        if self.config.bpf_enabled
            || !chain.is_egress_gateway
            || chain.ip_version != Some(IpVersion::V4)
        {
            return Vec::new();
        }
        let mut set_ids = vec![IPSET_ID_ALL_HOST_NETS];
        if self.config.vxlan_enabled || self.config.ipip_enabled || self.config.wireguard_enabled {
            set_ids.push(IPSET_ID_ALL_TUNNEL_NETS);
        }
        let ingress = chain.direction == RuleDirection::Ingress;
        let mut rules = Vec::new();
        for id in set_ids {
            let set = self.ip_sets.name_for(id, IpVersion::V4);
            let base = |protocol: &str| {
                let criteria = MatchCriteria::new().protocol(protocol);
                if ingress {
                    criteria.source_ip_set(set.clone())
                } else {
                    criteria.dest_ip_set(set.clone())
                }
            };
            rules.push(
                ChainRule::new(
                    base(PROTO_UDP).dest_port(self.config.egress_ip_vxlan_port),
                    Action::Accept,
                )
                .with_comment("Accept VXLAN UDP traffic for egress gateways"),
            );
            if ingress {
                rules.push(
                    ChainRule::new(
                        base(PROTO_TCP).dest_port(chain.egress_gateway_health_port),
                        Action::Accept,
                    )
                    .with_comment("Accept readiness probes for egress gateways"),
                );
            }
        }
        rules
    }

    fn encap_drop_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        let mut rules = Vec::new();
        if chain.is_egress_gateway {
            return rules;
        }
        if !chain.allow_vxlan_encap {
            rules.push(
                ChainRule::new(
                    MatchCriteria::new()
                        .protocol(PROTO_UDP)
                        .dest_port(self.config.vxlan_port),
                    Action::Drop,
                )
                .with_comment("Drop VXLAN encapped packets originating in workloads"),
            );
        }
        if !chain.allow_ipip_encap {
            rules.push(
                ChainRule::new(MatchCriteria::new().protocol(PROTO_IPIP), Action::Drop)
                    .with_comment("Drop IPinIP encapped packets originating in workloads"),
            );
        }
        rules
    }

    fn tier_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        let marks = &self.config.marks;
        let pass_clear = || MatchCriteria::new().mark_clear(marks.pass);
        let nflog_group = chain.direction.nflog_group();
        let mut rules = Vec::new();
        for tier in chain.tiers {
            let groups = tier.groups(chain.direction);
            if groups.is_empty() {
                continue;
            }
            rules.push(
                ChainRule::always(mark::clear(marks.pass))
                    .with_comment(format!("Start of tier {}", tier.name)),
            );

            // A tier of staged policies only can never drop.
            let mut end_of_tier_drop = false;
            for group in groups {
                rules.push(ChainRule::new(
                    pass_clear(),
                    Action::jump(group.chain_name(self.max_chain_name_length)),
                ));
                if !group.has_non_staged_policies() {
                    continue;
                }
                end_of_tier_drop = true;
                if chain.chain_type == ChainType::Untracked {
                    rules.push(ChainRule::new(mark::is_set(marks.accept), Action::NoTrack));
                }
                rules.push(
                    ChainRule::new(mark::is_set(marks.accept), Action::Return)
                        .with_comment("Return if policy accepted"),
                );
            }

            // Untracked and pre-DNAT chains leave the final say to the filter table.
            if !matches!(chain.chain_type, ChainType::Normal | ChainType::Forward) {
                continue;
            }
            if end_of_tier_drop {
                rules.extend(self.nfqueue_rule(pass_clear(), Some(NO_POLICY_PASSED)));
                let prefix = NflogPrefix::EndOfTierDrop {
                    direction: chain.direction,
                    tier: &tier.name,
                };
                rules.push(ChainRule::new(
                    pass_clear(),
                    Action::nflog(nflog_group, prefix.render()),
                ));
                rules.extend(self.drop_rules(pass_clear(), &[NO_POLICY_PASSED]));
            } else {
                let prefix = NflogPrefix::EndOfTierPass {
                    direction: chain.direction,
                    tier: &tier.name,
                };
                rules.push(ChainRule::new(
                    pass_clear(),
                    Action::nflog(nflog_group, prefix.render()),
                ));
            }
        }
        rules
    }

    /// Forwarded traffic is allowed when no apply-on-forward policy covers the endpoint.
    fn forward_default_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        if chain.chain_type != ChainType::Forward || !chain.tiers.is_empty() {
            return Vec::new();
        }
        vec![
            ChainRule::always(mark::set(self.config.marks.accept))
                .with_comment("Allow forwarded traffic by default"),
            ChainRule::always(Action::Return).with_comment("Return for accepted forward traffic"),
        ]
    }

    fn profile_rules(&self, chain: &EndpointChain<'_>) -> Vec<ChainRule> {
        if chain.chain_type != ChainType::Normal {
            return Vec::new();
        }
        let accept = self.config.marks.accept;
        let mut rules = Vec::new();
        for profile_id in chain.profile_ids {
            let target = profile_chain_name(
                chain.profile_prefix,
                &ProfileId::new(profile_id.as_str()),
                self.max_chain_name_length,
            );
            rules.push(ChainRule::always(Action::jump(target)));
            rules.push(
                ChainRule::new(mark::is_set(accept), Action::Return)
                    .with_comment("Return if profile accepted"),
            );
        }
        // DNS policy isn't supported on egress gateways.
        if !chain.is_egress_gateway {
            rules.extend(self.nfqueue_rule(MatchCriteria::new(), Some(chain.end_of_chain_comment)));
        }
        let prefix = NflogPrefix::NoMatchProfile {
            direction: chain.direction,
        };
        rules.push(ChainRule::always(Action::nflog(
            chain.direction.nflog_group(),
            prefix.render(),
        )));
        rules.extend(self.drop_rules(MatchCriteria::new(), &[chain.end_of_chain_comment]));
        rules
    }
}
