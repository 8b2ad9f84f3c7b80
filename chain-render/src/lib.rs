//! Compiles tiered network policy into ordered packet-filter chains.
//!
//! The entry point is [Renderer]: build it once from a validated [Config], then ask it for
//! policy, profile, endpoint, dispatch and static chains. Output is backend independent
//! ([Chain]s of [ChainRule]s) until it goes through one of the [backend] serializers.
pub mod backend;
mod chain_log;
mod chain_name;
mod cidr;
mod compiler;
mod config;
mod dispatch;
mod endpoint;
mod endpoint_mark;
mod error;
mod ipsets;
mod nat;
mod nflog;
mod policy_group;
mod renderer;
mod rule;
mod static_chains;
mod tables;
#[cfg(test)]
mod test_data;

pub use chain_render_common::{
    mark, Action, Chain, ChainRule, Criterion, IpVersion, MarkBitConfig, MarkField, MatchCriteria,
    PortRange,
};

pub use chain_log::log_tables;
pub use chain_name::{endpoint_chain_name, length_limited_id, policy_chain_name, profile_chain_name};
pub use config::{
    ActionOnDrop, AllowAction, Backend, Config, DnsPolicyMode, EndpointToHostAction,
    FilterDenyAction, ProtoPort, ServerPort, ServiceLoopPrevention, TproxyMode,
};
pub use dispatch::HostEndpointChainKind;
pub use endpoint::{ChainType, WorkloadEndpoint};
pub use endpoint_mark::{EndpointMarkMapper, HashEndpointMarkMapper};
pub use error::Error;
pub use ipsets::IpSetNamer;
pub use nflog::{NflogPrefix, NflogVerdict, RuleDirection, RuleOwner};
pub use policy_group::{group_policies, PolicyGroup, TierPolicyGroups};
pub use renderer::Renderer;
pub use rule::{Icmp, Policy, PolicyId, Profile, ProfileId, Protocol, Rule, RuleAction};
pub use tables::{Table, TableSet};

pub type Result<T> = std::result::Result<T, Error>;

pub const CHAIN_NAME_PREFIX: &str = "cali-";

pub const POLICY_INBOUND_PFX: &str = "cali-pi-";
pub const POLICY_OUTBOUND_PFX: &str = "cali-po-";
pub const PROFILE_INBOUND_PFX: &str = "cali-pri-";
pub const PROFILE_OUTBOUND_PFX: &str = "cali-pro-";
pub const POLICY_GROUP_INBOUND_PFX: &str = "cali-gi-";
pub const POLICY_GROUP_OUTBOUND_PFX: &str = "cali-go-";

pub const WORKLOAD_TO_ENDPOINT_PFX: &str = "cali-tw-";
pub const WORKLOAD_FROM_ENDPOINT_PFX: &str = "cali-fw-";
pub const SET_ENDPOINT_MARK_PFX: &str = "cali-sm-";
pub const HOST_TO_ENDPOINT_PFX: &str = "cali-th-";
pub const HOST_FROM_ENDPOINT_PFX: &str = "cali-fh-";
pub const HOST_TO_ENDPOINT_FORWARD_PFX: &str = "cali-thfw-";
pub const HOST_FROM_ENDPOINT_FORWARD_PFX: &str = "cali-fhfw-";

pub const CHAIN_FILTER_INPUT: &str = "cali-INPUT";
pub const CHAIN_FILTER_FORWARD: &str = "cali-FORWARD";
pub const CHAIN_FILTER_OUTPUT: &str = "cali-OUTPUT";
pub const CHAIN_WORKLOAD_TO_HOST: &str = "cali-wl-to-host";
pub const CHAIN_FAILSAFE_IN: &str = "cali-failsafe-in";
pub const CHAIN_FAILSAFE_OUT: &str = "cali-failsafe-out";
pub const CHAIN_FILTER_INPUT_TPROXY: &str = "cali-input-filter-tproxy";
pub const CHAIN_FILTER_OUTPUT_TPROXY: &str = "cali-output-filter-tproxy";

pub const CHAIN_FROM_WORKLOAD_DISPATCH: &str = "cali-from-wl-dispatch";
pub const CHAIN_TO_WORKLOAD_DISPATCH: &str = "cali-to-wl-dispatch";
pub const CHAIN_DISPATCH_TO_HOST_ENDPOINT: &str = "cali-to-host-endpoint";
pub const CHAIN_DISPATCH_FROM_HOST_ENDPOINT: &str = "cali-from-host-endpoint";
pub const CHAIN_DISPATCH_TO_HOST_ENDPOINT_FORWARD: &str = "cali-to-hep-forward";
pub const CHAIN_DISPATCH_FROM_HOST_ENDPOINT_FORWARD: &str = "cali-from-hep-forward";
pub const CHAIN_DISPATCH_SET_ENDPOINT_MARK: &str = "cali-set-endpoint-mark";
pub const CHAIN_DISPATCH_FROM_ENDPOINT_MARK: &str = "cali-from-endpoint-mark";

pub const CHAIN_FORWARD_CHECK: &str = "cali-forward-check";
pub const CHAIN_FORWARD_ENDPOINT_MARK: &str = "cali-forward-endpoint-mark";
pub const CHAIN_RPF_SKIP: &str = "cali-rpf-skip";
pub const CHAIN_SET_WIREGUARD_INCOMING_MARK: &str = "cali-wireguard-incoming-mark";

pub const CHAIN_NAT_PREROUTING: &str = "cali-PREROUTING";
pub const CHAIN_NAT_PREROUTING_EGRESS: &str = "cali-egress";
pub const CHAIN_NAT_POSTROUTING: &str = "cali-POSTROUTING";
pub const CHAIN_NAT_OUTPUT: &str = "cali-OUTPUT";
pub const CHAIN_NAT_OUTGOING: &str = "cali-nat-outgoing";
pub const CHAIN_FIP_DNAT: &str = "cali-fip-dnat";
pub const CHAIN_FIP_SNAT: &str = "cali-fip-snat";
pub const CHAIN_CIDR_BLOCK: &str = "cali-cidr-block";

pub const CHAIN_MANGLE_PREROUTING: &str = "cali-PREROUTING";
pub const CHAIN_MANGLE_PREROUTING_EGRESS: &str = "cali-pre-egress";
pub const CHAIN_MANGLE_PREROUTING_EGRESS_INBOUND: &str = "cali-pre-egress-in";
pub const CHAIN_MANGLE_POSTROUTING: &str = "cali-POSTROUTING";
pub const CHAIN_MANGLE_POSTROUTING_EGRESS: &str = "cali-post-egress";
pub const CHAIN_MANGLE_OUTPUT: &str = "cali-OUTPUT";
pub const CHAIN_MANGLE_PREROUTING_TPROXY_SVC: &str = "cali-pre-tproxy-svc";
pub const CHAIN_MANGLE_PREROUTING_TPROXY_NP: &str = "cali-pre-tproxy-np";
pub const CHAIN_MANGLE_PREROUTING_TPROXY_ESTABL: &str = "cali-pre-tproxy-establ";
pub const CHAIN_MANGLE_PREROUTING_TPROXY_SELECT: &str = "cali-pre-tproxy-selec";
pub const CHAIN_MANGLE_OUTPUT_TPROXY: &str = "cali-out-mangle-tproxy";
pub const CHAIN_MANGLE_OUTPUT_TPROXY_HOST_NET: &str = "cali-out-mangle-tproxy-host";

pub const CHAIN_RAW_PREROUTING: &str = "cali-PREROUTING";
pub const CHAIN_RAW_OUTPUT: &str = "cali-OUTPUT";

pub const IPSET_ID_NAT_OUTGOING_ALL_POOLS: &str = "all-ipam-pools";
pub const IPSET_ID_NAT_OUTGOING_MASQ_POOLS: &str = "masq-ipam-pools";
pub const IPSET_ID_ALL_HOST_NETS: &str = "all-hosts-net";
pub const IPSET_ID_ALL_VXLAN_SOURCE_NETS: &str = "all-vxlan-net";
pub const IPSET_ID_THIS_HOST_IPS: &str = "this-host";
pub const IPSET_ID_ALL_TUNNEL_NETS: &str = "all-tunnel-net";
pub const IPSET_ID_ALL_EGW_HEALTH_PORTS: &str = "egw-health-ports";
pub const IPSET_ID_TPROXY_SERVICE_IPS: &str = "tproxy-services";
pub const IPSET_ID_TPROXY_POD_IPS: &str = "tproxy-pods";
pub const IPSET_ID_TPROXY_NODE_PORTS: &str = "tproxy-nodeports-tcp";
pub const IPSET_ID_TPROXY_POD_SELF: &str = "tproxy-pod-self";

pub const NFLOG_INBOUND_GROUP: u16 = 1;
pub const NFLOG_OUTBOUND_GROUP: u16 = 2;
pub const NFLOG_DOMAIN_GROUP: u16 = 3;
pub const NFLOG_PREFIX_MAX_LENGTH: usize = 64;

const PROTO_IPIP: &str = "4";
const PROTO_TCP: &str = "6";
const PROTO_UDP: &str = "17";
const PROTO_ESP: &str = "50";
const PROTO_ICMPV6: &str = "58";
const PORT_IKE: u16 = 500;
