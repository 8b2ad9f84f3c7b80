//! Interface-name dispatch into the per-endpoint chains.
use std::collections::BTreeSet;

use chain_render_common::{mark, Action, Chain, ChainRule, MatchCriteria};

use crate::{
    chain_name::endpoint_chain_name, endpoint_mark::EndpointMarkMapper, Renderer,
    CHAIN_DISPATCH_FROM_ENDPOINT_MARK, CHAIN_DISPATCH_FROM_HOST_ENDPOINT,
    CHAIN_DISPATCH_FROM_HOST_ENDPOINT_FORWARD, CHAIN_DISPATCH_SET_ENDPOINT_MARK,
    CHAIN_DISPATCH_TO_HOST_ENDPOINT, CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD,
    CHAIN_FROM_WORKLOAD_DISPATCH, CHAIN_TO_WORKLOAD_DISPATCH, HOST_FROM_ENDPOINT_FORWARD_PFX,
    HOST_FROM_ENDPOINT_PFX, HOST_TO_ENDPOINT_FORWARD_PFX, HOST_TO_ENDPOINT_PFX,
    SET_ENDPOINT_MARK_PFX, WORKLOAD_FROM_ENDPOINT_PFX, WORKLOAD_TO_ENDPOINT_PFX,
};

/// Which host endpoint chains a set of dispatch chains feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEndpointChainKind {
    /// Filter table: to/from plus the apply-on-forward pair.
    Filter,
    /// Raw table: to/from.
    Untracked,
    /// Mangle PREROUTING: from only.
    PreDnat,
    /// Mangle POSTROUTING: to only.
    MangleEgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Way {
    In,
    Out,
}

impl Renderer {
    /// `cali-from-wl-dispatch` and `cali-to-wl-dispatch`. Packets on a workload interface
    /// with no endpoint are dropped.
    pub fn workload_dispatch_chains(&self, ifaces: &[String]) -> Vec<Chain> {
        let ifaces: BTreeSet<&str> = ifaces.iter().map(String::as_str).collect();
        tracing::debug!(count = ifaces.len(), "Rendering workload dispatch chains");
        let unknown = || self.drop_rules(MatchCriteria::new(), &["Unknown interface"]);

        let mut from = self.dispatch_rules(&ifaces, Way::In, WORKLOAD_FROM_ENDPOINT_PFX);
        from.extend(unknown());
        let mut to = self.dispatch_rules(&ifaces, Way::Out, WORKLOAD_TO_ENDPOINT_PFX);
        to.extend(unknown());
        vec![
            Chain::new(CHAIN_FROM_WORKLOAD_DISPATCH, from),
            Chain::new(CHAIN_TO_WORKLOAD_DISPATCH, to),
        ]
    }

    /// Host endpoint dispatch chains. Unknown interfaces go to `default_iface`'s chains
    /// when there is one, otherwise they return to the caller.
    pub fn host_dispatch_chains(
        &self,
        ifaces: &[String],
        default_iface: Option<&str>,
        kind: HostEndpointChainKind,
    ) -> Vec<Chain> {
        let ifaces: BTreeSet<&str> = ifaces.iter().map(String::as_str).collect();
        tracing::debug!(count = ifaces.len(), ?kind, "Rendering host dispatch chains");
        let chain = |name: &str, way: Way, prefix: &str| {
            let mut rules = self.dispatch_rules(&ifaces, way, prefix);
            rules.push(match default_iface {
                Some(iface) => ChainRule::always(Action::goto(endpoint_chain_name(
                    prefix,
                    iface,
                    self.max_chain_name_length,
                ))),
                None => ChainRule::always(Action::Return),
            });
            Chain::new(name, rules)
        };
        let from = || {
            chain(
                CHAIN_DISPATCH_FROM_HOST_ENDPOINT,
                Way::In,
                HOST_FROM_ENDPOINT_PFX,
            )
        };
        let to = || chain(CHAIN_DISPATCH_TO_HOST_ENDPOINT, Way::Out, HOST_TO_ENDPOINT_PFX);
        match kind {
            HostEndpointChainKind::Filter => vec![
                from(),
                to(),
                chain(
                    CHAIN_DISPATCH_FROM_HOST_ENDPOINT_FORWARD,
                    Way::In,
                    HOST_FROM_ENDPOINT_FORWARD_PFX,
                ),
                chain(
                    CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD,
                    Way::Out,
                    HOST_TO_ENDPOINT_FORWARD_PFX,
                ),
            ],
            HostEndpointChainKind::Untracked => vec![from(), to()],
            HostEndpointChainKind::PreDnat => vec![from()],
            HostEndpointChainKind::MangleEgress => vec![to()],
        }
    }

    /// IPVS support: `cali-set-endpoint-mark` stamps the ingress endpoint into the mark and
    /// `cali-from-endpoint-mark` later finds that endpoint's egress chain from it.
    pub fn endpoint_mark_dispatch_chains(
        &self,
        mark_mapper: &mut dyn EndpointMarkMapper,
        workload_ifaces: &[String],
        host_ifaces: &[String],
    ) -> Vec<Chain> {
        let max = self.max_chain_name_length;
        let marks = &self.config.marks;
        let all: BTreeSet<&str> = workload_ifaces
            .iter()
            .chain(host_ifaces)
            .map(String::as_str)
            .collect();

        let mut set_mark = Vec::new();
        for iface in &all {
            set_mark.push(ChainRule::new(
                MatchCriteria::new().in_interface(*iface),
                Action::goto(endpoint_chain_name(SET_ENDPOINT_MARK_PFX, iface, max)),
            ));
        }
        for wildcard in self.config.workload_iface_wildcards() {
            set_mark.push(
                ChainRule::new(MatchCriteria::new().in_interface(wildcard), Action::Drop)
                    .with_comment("Unknown endpoint"),
            );
        }
        set_mark.push(
            ChainRule::always(mark::set_masked(marks.non_cali_endpoint, mark_mapper.mask()))
                .with_comment("Non-Cali endpoint mark"),
        );

        let workloads: BTreeSet<&str> = workload_ifaces.iter().map(String::as_str).collect();
        let mut from_mark = Vec::new();
        for iface in &all {
            let value = match mark_mapper.endpoint_mark(iface) {
                Ok(value) => value,
                Err(error) => {
                    tracing::error!(iface, %error, "Failed to get endpoint mark");
                    continue;
                }
            };
            let prefix = if workloads.contains(iface) {
                WORKLOAD_FROM_ENDPOINT_PFX
            } else {
                HOST_FROM_ENDPOINT_FORWARD_PFX
            };
            from_mark.push(ChainRule::new(
                MatchCriteria::new().mark_matches_with_mask(value, mark_mapper.mask()),
                Action::goto(endpoint_chain_name(prefix, iface, max)),
            ));
        }
        from_mark.push(
            ChainRule::always(Action::Drop).with_comment("Unknown interface"),
        );

        vec![
            Chain::new(CHAIN_DISPATCH_SET_ENDPOINT_MARK, set_mark),
            Chain::new(CHAIN_DISPATCH_FROM_ENDPOINT_MARK, from_mark),
        ]
    }

    fn dispatch_rules(&self, ifaces: &BTreeSet<&str>, way: Way, prefix: &str) -> Vec<ChainRule> {
        ifaces
            .iter()
            .map(|iface| {
                let criteria = match way {
                    Way::In => MatchCriteria::new().in_interface(*iface),
                    Way::Out => MatchCriteria::new().out_interface(*iface),
                };
                let target = endpoint_chain_name(prefix, iface, self.max_chain_name_length);
                ChainRule::new(criteria, Action::goto(target))
            })
            .collect()
    }
}
