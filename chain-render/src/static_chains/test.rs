#![cfg(test)]

use std::net::IpAddr;

use chain_render_common::{MarkBitConfig, PortRange};
use test_case::test_case;

use super::*;
use crate::{
    config::{FilterDenyAction, ServerPort},
    test_data::{endpoint_config, renderer, rendered},
    Config,
};

const HOST_ACCEPTED: &str = "-m comment --comment \"Host endpoint policy accepted packet.\" -m mark --mark 0x8/0x8 --jump ACCEPT";
const POLICY_ACCEPTED_RULE: &str =
    "-m comment --comment \"Policy explicitly accepted packet.\" -m mark --mark 0x8/0x8 --jump ACCEPT";
const DNS_NFLOG: &str = "--jump NFLOG --nflog-group 3 --nflog-prefix DNS --nflog-size 1024";

fn chain<'a>(chains: &'a [Chain], name: &str) -> &'a Chain {
    chains
        .iter()
        .find(|chain| chain.name == name)
        .unwrap_or_else(|| panic!("no chain {name}"))
}

fn names(chains: &[Chain]) -> Vec<&str> {
    chains.iter().map(|chain| chain.name.as_str()).collect()
}

fn dns_config() -> Config {
    endpoint_config().with_dns_trusted_servers(vec![
        ServerPort {
            ip: "10.96.0.10".parse().unwrap(),
            port: 53,
        },
        ServerPort {
            ip: "fd00::a".parse().unwrap(),
            port: 5353,
        },
    ])
}

fn order(contributors: &[(&'static str, StaticContributor)]) -> Vec<&'static str> {
    contributors.iter().map(|(name, _)| *name).collect()
}

#[test]
fn contributor_order() {
    assert_eq!(
        order(&INPUT_CONTRIBUTORS),
        vec![
            "tproxy",
            "dns-response-snooping",
            "dns-request-snooping",
            "ipip",
            "ipsec",
            "vxlan",
            "wireguard",
            "egress-ip",
            "ipvs",
            "workload",
            "host-endpoint",
        ]
    );
    assert_eq!(
        order(&OUTPUT_CONTRIBUTORS),
        vec![
            "tproxy",
            "already-accepted",
            "ipvs",
            "dns-request-snooping",
            "workload",
            "ipip",
            "vxlan",
            "egress-ip",
            "ipsec",
            "wireguard",
            "host-endpoint",
        ]
    );
    assert_eq!(
        order(&FORWARD_CONTRIBUTORS),
        vec![
            "dns-snooping",
            "from-host-endpoint",
            "workload",
            "to-host-endpoint",
            "cidr-block",
            "accept",
        ]
    );
}

#[test_case(IpVersion::V4)]
#[test_case(IpVersion::V6)]
fn default_filter_chains(ip_version: IpVersion) {
    let renderer = renderer(endpoint_config());
    let chains = renderer.static_filter_chains(ip_version);
    assert_eq!(
        names(&chains),
        vec![
            "cali-FORWARD",
            "cali-INPUT",
            "cali-wl-to-host",
            "cali-failsafe-in",
            "cali-OUTPUT",
            "cali-failsafe-out",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-INPUT").rules),
        vec![
            "--in-interface cali+ --goto cali-wl-to-host",
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
            "--jump MARK --set-mark 0/0x78",
            "--jump cali-from-host-endpoint",
            HOST_ACCEPTED,
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-OUTPUT").rules),
        vec![
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
            "--out-interface cali+ --jump RETURN",
            "--jump MARK --set-mark 0/0x78",
            "-m conntrack ! --ctstate DNAT --jump cali-to-host-endpoint",
            HOST_ACCEPTED,
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-FORWARD").rules),
        vec![
            "--jump MARK --set-mark 0/0x70",
            "-m mark --mark 0/0x8 --jump cali-from-hep-forward",
            "--in-interface cali+ --jump cali-from-wl-dispatch",
            "--out-interface cali+ --jump cali-to-wl-dispatch",
            "--jump cali-to-hep-forward",
            "--jump cali-cidr-block",
            POLICY_ACCEPTED_RULE,
            "--jump MARK --set-mark 0x8/0x8",
        ]
    );
}

#[test]
fn workload_to_host_v4() {
    let renderer = renderer(endpoint_config());
    let chain = renderer.workload_to_host_chain(IpVersion::V4);
    assert_eq!(chain.name, "cali-wl-to-host");
    assert_eq!(
        rendered(&chain.rules),
        vec![
            "--jump cali-from-wl-dispatch",
            "-m comment --comment \"Configured DefaultEndpointToHostAction\" --jump DROP",
        ]
    );
}

#[test]
fn workload_to_host_v6_allows_neighbour_discovery() {
    let renderer = renderer(endpoint_config());
    let rules = rendered(&renderer.workload_to_host_chain(IpVersion::V6).rules);
    let icmp: Vec<String> = [130, 131, 132, 133, 135, 136]
        .iter()
        .map(|t| format!("-p 58 -m icmp6 --icmpv6-type {t} --jump ACCEPT"))
        .collect();
    assert_eq!(rules[..6], icmp[..]);
    assert_eq!(rules[6], "--jump cali-from-wl-dispatch");
    assert_eq!(rules.len(), 8);
}

#[test]
fn workload_to_host_openstack() {
    let metadata: IpAddr = "169.254.169.254".parse().unwrap();
    let renderer = renderer(endpoint_config().with_openstack(Some(metadata)));
    assert_eq!(
        rendered(&renderer.workload_to_host_chain(IpVersion::V4).rules),
        vec![
            "-p 6 --destination 169.254.169.254 -m multiport --destination-ports 8775 --jump ACCEPT",
            "-p 17 -m multiport --source-ports 68 -m multiport --destination-ports 67 --jump ACCEPT",
            "-p 17 -m multiport --destination-ports 53 --jump ACCEPT",
            "--jump cali-from-wl-dispatch",
            "-m comment --comment \"Configured DefaultEndpointToHostAction\" --jump DROP",
        ]
    );
    let v6 = rendered(&renderer.workload_to_host_chain(IpVersion::V6).rules);
    assert_eq!(
        v6[6..9],
        [
            "-p 17 -m multiport --source-ports 546 -m multiport --destination-ports 547 --jump ACCEPT",
            "-p 17 -m multiport --destination-ports 53 --jump ACCEPT",
            "--jump cali-from-wl-dispatch",
        ]
    );
}

fn failsafe_config() -> Config {
    Config {
        failsafe_inbound_host_ports: vec![
            ProtoPort::new("tcp", 22),
            ProtoPort::new("UDP", 68).with_net("10.0.0.0/8"),
            ProtoPort::new("tcp", 179).with_net("fd00::/64"),
            ProtoPort::new("tcp", 2379).with_net("not-a-net"),
            ProtoPort::new("icmp", 1),
        ],
        failsafe_outbound_host_ports: vec![ProtoPort::new("udp", 53).with_net("192.168.0.0/16")],
        ..endpoint_config()
    }
}

#[test]
fn failsafe_in_skips_bad_entries() {
    let renderer = renderer(failsafe_config());
    assert_eq!(
        rendered(&renderer.failsafe_in_chain(Table::Filter, IpVersion::V4).rules),
        vec![
            "-p tcp -m multiport --destination-ports 22 --jump ACCEPT",
            "-p udp -m multiport --destination-ports 68 --source 10.0.0.0/8 --jump ACCEPT",
            "-p tcp -m multiport --destination-ports 179 --jump ACCEPT",
        ]
    );
    assert_eq!(
        rendered(&renderer.failsafe_in_chain(Table::Filter, IpVersion::V6).rules),
        vec![
            "-p tcp -m multiport --destination-ports 22 --jump ACCEPT",
            "-p udp -m multiport --destination-ports 68 --jump ACCEPT",
            "-p tcp -m multiport --destination-ports 179 --source fd00::/64 --jump ACCEPT",
        ]
    );
}

#[test]
fn raw_failsafe_lets_replies_through() {
    let renderer = renderer(failsafe_config());
    let mangle_in = renderer.failsafe_in_chain(Table::Mangle, IpVersion::V4);
    let raw_in = renderer.failsafe_in_chain(Table::Raw, IpVersion::V4);
    assert_eq!(raw_in.rules[..mangle_in.rules.len()], mangle_in.rules[..]);
    assert_eq!(
        rendered(&raw_in.rules[mangle_in.rules.len()..]),
        vec!["-p udp -m multiport --source-ports 53 --source 192.168.0.0/16 --jump ACCEPT"]
    );

    assert_eq!(
        rendered(&renderer.failsafe_out_chain(Table::Filter, IpVersion::V4).rules),
        vec!["-p udp -m multiport --destination-ports 53 --destination 192.168.0.0/16 --jump ACCEPT"]
    );
    let raw_out = rendered(&renderer.failsafe_out_chain(Table::Raw, IpVersion::V4).rules);
    assert_eq!(
        raw_out,
        vec![
            "-p udp -m multiport --destination-ports 53 --destination 192.168.0.0/16 --jump ACCEPT",
            "-p tcp -m multiport --source-ports 22 --jump ACCEPT",
            "-p udp -m multiport --source-ports 68 --source 10.0.0.0/8 --jump ACCEPT",
            "-p tcp -m multiport --source-ports 179 --jump ACCEPT",
        ]
    );
}

#[test]
fn dns_snooping_uses_nflog() {
    let renderer = renderer(dns_config());
    let input = rendered(&renderer.contributed_chain(
        CHAIN_FILTER_INPUT,
        &INPUT_CONTRIBUTORS,
        IpVersion::V4,
    )
    .rules);
    let server = |state: &str| {
        format!("-p 17 -m conntrack --ctstate {state} -m conntrack --ctorigdstport 53 -m conntrack --ctorigdst 10.96.0.10")
    };
    assert_eq!(input[0], format!("{} {DNS_NFLOG}", server("ESTABLISHED")));
    assert_eq!(
        input[1],
        format!("--in-interface cali+ {} {DNS_NFLOG}", server("NEW"))
    );
    assert_eq!(input[2], "--in-interface cali+ --goto cali-wl-to-host");

    let output = rendered(&renderer.contributed_chain(
        CHAIN_FILTER_OUTPUT,
        &OUTPUT_CONTRIBUTORS,
        IpVersion::V4,
    )
    .rules);
    assert_eq!(output[1], format!("{} {DNS_NFLOG}", server("NEW")));
    assert_eq!(
        output[2],
        format!("--out-interface cali+ {} {DNS_NFLOG}", server("ESTABLISHED"))
    );
    assert_eq!(output[3], "--out-interface cali+ --jump RETURN");
}

#[test]
fn dns_snooping_follows_ip_version() {
    let renderer = renderer(dns_config());
    let forward = rendered(&renderer.forward_dns_rules(IpVersion::V6));
    assert_eq!(
        forward,
        vec![
            format!("--out-interface cali+ -p 17 -m conntrack --ctstate ESTABLISHED -m conntrack --ctorigdstport 5353 -m conntrack --ctorigdst fd00::a {DNS_NFLOG}"),
            format!("--in-interface cali+ -p 17 -m conntrack --ctstate NEW -m conntrack --ctorigdstport 5353 -m conntrack --ctorigdst fd00::a {DNS_NFLOG}"),
        ]
    );
}

#[test]
fn delayed_dns_responses_are_queued() {
    let renderer = renderer(Config {
        dns_policy_mode: DnsPolicyMode::DelayDnsResponse,
        dns_packets_nfqueue_id: 101,
        ..dns_config()
    });
    let rules = rendered(&renderer.dns_response_snooping_rules(None, IpVersion::V4));
    assert_eq!(rules.len(), 1);
    assert!(rules[0].ends_with("--jump NFQUEUE --queue-num 101 --queue-bypass"));
    // Requests are only ever logged.
    let requests = rendered(&renderer.dns_request_snooping_rules(None, IpVersion::V4));
    assert!(requests[0].ends_with(DNS_NFLOG));
}

#[test]
fn ipip_input_before_host_endpoint() {
    let renderer = renderer(endpoint_config().with_ipip(None));
    let input = |ip_version| {
        rendered(&renderer.contributed_chain(CHAIN_FILTER_INPUT, &INPUT_CONTRIBUTORS, ip_version).rules)
    };
    assert_eq!(
        input(IpVersion::V4)[..3],
        [
            "-m comment --comment \"Allow IPIP packets from Calico hosts\" -p 4 -m set --match-set cali40all-hosts-net src -m addrtype --dst-type LOCAL --jump ACCEPT",
            "-m comment --comment \"Drop IPIP packets from non-Calico hosts\" -p 4 --jump DROP",
            "--in-interface cali+ --goto cali-wl-to-host",
        ]
    );
    assert_eq!(input(IpVersion::V6)[0], "--in-interface cali+ --goto cali-wl-to-host");
    assert_eq!(
        rendered(&renderer.output_ipip_rules(IpVersion::V4)),
        vec!["-m comment --comment \"Allow IPIP packets to other Calico hosts\" -p 4 -m set --match-set cali40all-hosts-net dst -m addrtype --src-type LOCAL --limit-iface-out --jump ACCEPT"]
    );
}

#[test]
fn ipsec_input_rules() {
    let renderer = renderer(Config {
        ipsec_enabled: true,
        marks: MarkBitConfig {
            ipsec: 0x10000,
            ..endpoint_config().marks
        },
        ..endpoint_config()
    });
    assert_eq!(
        rendered(&renderer.input_ipsec_rules(IpVersion::V4)),
        vec![
            "-m comment --comment \"Allow IPSec ESP packets from Calico hosts\" -p 50 -m set --match-set cali40all-hosts-net src -m addrtype --dst-type LOCAL --jump ACCEPT",
            "-m comment --comment \"Allow IPSec IKEv2 packets from Calico hosts\" -p 17 -m multiport --destination-ports 500 -m set --match-set cali40all-hosts-net src -m addrtype --dst-type LOCAL --jump ACCEPT",
            "-m comment --comment \"Drop IPSec ESP packets from non-Calico hosts\" -p 50 --jump DROP",
            "-m comment --comment \"Drop IPSec IKE packets from non-Calico hosts\" -p 17 -m multiport --destination-ports 500 --jump DROP",
        ]
    );
    assert!(renderer.input_ipsec_rules(IpVersion::V6).is_empty());
    // The IPsec mark survives the forward chain's clear.
    assert_eq!(
        rendered(&renderer.filter_from_host_endpoint_rules(IpVersion::V4)[..1]),
        vec!["--jump MARK --set-mark 0/0x70"]
    );
}

#[test]
fn vxlan_v6_uses_deny_action() {
    let renderer = renderer(Config {
        vxlan_enabled_v6: true,
        ..endpoint_config().with_filter_deny_action(FilterDenyAction::Reject)
    });
    assert_eq!(
        rendered(&renderer.input_vxlan_rules(IpVersion::V6)),
        vec![
            "-m comment --comment \"Allow IPv6 VXLAN packets from allowed hosts\" -p 17 -m multiport --destination-ports 4789 -m set --match-set cali60all-vxlan-net src -m addrtype --dst-type LOCAL --jump ACCEPT",
            "-m comment --comment \"Reject IPv6 VXLAN packets from non-allowed hosts\" -p 17 -m multiport --destination-ports 4789 -m addrtype --dst-type LOCAL --jump REJECT",
        ]
    );
    assert!(renderer.input_vxlan_rules(IpVersion::V4).is_empty());
    assert_eq!(
        rendered(&renderer.output_vxlan_rules(IpVersion::V6)),
        vec!["-m comment --comment \"Allow IPv6 VXLAN packets to other allowed hosts\" -p 17 -m multiport --destination-ports 4789 -m addrtype --src-type LOCAL --limit-iface-out -m set --match-set cali60all-vxlan-net dst --jump ACCEPT"]
    );
}

#[test]
fn wireguard_ports_per_version() {
    let renderer = renderer(Config {
        wireguard_enabled_v6: true,
        ..endpoint_config().with_wireguard(0x100000)
    });
    assert_eq!(
        rendered(&renderer.input_wireguard_rules(IpVersion::V4)),
        vec!["-m comment --comment \"Allow incoming IPv4 Wireguard packets\" -p 17 -m multiport --destination-ports 51820 -m addrtype --dst-type LOCAL --jump ACCEPT"]
    );
    assert_eq!(
        rendered(&renderer.output_wireguard_rules(IpVersion::V6)),
        vec!["-m comment --comment \"Allow outgoing IPv6 Wireguard packets\" -p 17 -m multiport --destination-ports 51821 -m addrtype --src-type LOCAL --limit-iface-out --jump ACCEPT"]
    );
}

#[test]
fn egress_ip_filter_rules_are_v4_only() {
    let renderer = renderer(endpoint_config().with_egress_ip());
    assert_eq!(
        rendered(&renderer.input_egress_ip_rules(IpVersion::V4)),
        vec![
            "-m comment --comment \"Allow VXLAN UDP traffic to egress clients\" -p 17 -m multiport --destination-ports 4790 -m addrtype --dst-type LOCAL --jump ACCEPT",
            "-m comment --comment \"Accept egress gateway health port probe traffic\" -p 6 -m addrtype --dst-type LOCAL -m set --match-set cali40egw-health-ports src,src --jump ACCEPT",
        ]
    );
    assert!(renderer.input_egress_ip_rules(IpVersion::V6).is_empty());
    assert!(renderer.output_egress_ip_rules(IpVersion::V6).is_empty());
}

fn ipvs_renderer() -> Renderer {
    renderer(endpoint_config().with_ipvs())
}

#[test]
fn ipvs_filter_chains() {
    let renderer = ipvs_renderer();
    let chains = renderer.static_filter_chains(IpVersion::V4);
    assert_eq!(
        names(&chains),
        vec![
            "cali-FORWARD",
            "cali-INPUT",
            "cali-wl-to-host",
            "cali-failsafe-in",
            "cali-forward-check",
            "cali-OUTPUT",
            "cali-failsafe-out",
            "cali-forward-endpoint-mark",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-INPUT").rules[..3]),
        vec![
            "--jump MARK --set-mark 0/0xff00",
            "--jump cali-forward-check",
            "-m mark ! --mark 0/0xff00 --jump RETURN",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-OUTPUT").rules[..2]),
        vec![
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
            "-m mark ! --mark 0/0xff00 --goto cali-forward-endpoint-mark",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-forward-check").rules),
        vec![
            "-m conntrack --ctstate RELATED,ESTABLISHED --jump RETURN",
            "-m comment --comment \"To kubernetes NodePort service\" -p 6 -m multiport --destination-ports 30000:32767 -m set --match-set cali40this-host dst --goto cali-set-endpoint-mark",
            "-m comment --comment \"To kubernetes NodePort service\" -p 17 -m multiport --destination-ports 30000:32767 -m set --match-set cali40this-host dst --goto cali-set-endpoint-mark",
            "-m comment --comment \"To kubernetes service\" -m set ! --match-set cali40this-host dst --jump cali-set-endpoint-mark",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-forward-endpoint-mark").rules),
        vec![
            "-m mark ! --mark 0x100/0xff00 --jump cali-from-endpoint-mark",
            "--out-interface cali+ --jump cali-to-wl-dispatch",
            "--jump cali-to-hep-forward",
            "--jump MARK --set-mark 0/0xff00",
            POLICY_ACCEPTED_RULE,
        ]
    );
}

#[test]
fn forward_check_splits_node_ports() {
    let renderer = renderer(Config {
        kube_node_port_ranges: (0..8)
            .map(|i| PortRange::new(30000 + i * 10, 30005 + i * 10))
            .collect(),
        ..endpoint_config().with_ipvs()
    });
    let rules = renderer.forward_check_chain(IpVersion::V4).rules;
    // Eight ranges need sixteen multiport slots: two chunks, each for TCP and UDP.
    assert_eq!(rules.len(), 6);
    let rules = rendered(&rules);
    assert!(rules[1].contains("30000:30005,") && rules[1].contains("30060:30065 "));
    assert!(rules[3].contains("--destination-ports 30070:30075 "));
}

fn tproxy_config() -> Config {
    endpoint_config().with_tproxy(0x20000)
}

#[test]
fn tproxy_filter_chains() {
    let renderer = renderer(tproxy_config());
    let chains = renderer.static_filter_chains(IpVersion::V4);
    assert_eq!(
        rendered(&chain(&chains, "cali-INPUT").rules[..1]),
        vec!["-m comment --comment \"Police packets towards proxy\" -m mark --mark 0x20000/0x20000 --jump cali-input-filter-tproxy"]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-OUTPUT").rules[..1]),
        vec!["-m comment --comment \"Police packets from proxy\" -m addrtype ! --src-type LOCAL --jump cali-output-filter-tproxy"]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-input-filter-tproxy").rules),
        vec![
            "--jump MARK --set-mark 0/0x70",
            "-m mark --mark 0/0x8 --jump cali-from-hep-forward",
            "--in-interface cali+ --jump cali-from-wl-dispatch",
            POLICY_ACCEPTED_RULE,
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-output-filter-tproxy").rules),
        vec!["--out-interface cali+ --jump cali-to-wl-dispatch"]
    );
}

#[test]
fn tproxy_filter_chains_skipped_in_bpf_mode() {
    let renderer = renderer(Config {
        bpf_enabled: true,
        ..tproxy_config()
    });
    let chains = renderer.static_filter_chains(IpVersion::V4);
    assert!(!names(&chains).contains(&"cali-input-filter-tproxy"));
    assert!(!names(&chains).contains(&"cali-output-filter-tproxy"));
    // The mangle side still diverts to the proxy.
    let mangle = renderer.static_mangle_chains(IpVersion::V4);
    assert!(names(&mangle).contains(&"cali-pre-tproxy-selec"));
}

#[test]
fn default_mangle_chains() {
    let renderer = renderer(endpoint_config());
    let chains = renderer.static_mangle_chains(IpVersion::V4);
    assert_eq!(
        names(&chains),
        vec![
            "cali-failsafe-in",
            "cali-failsafe-out",
            "cali-PREROUTING",
            "cali-POSTROUTING",
            "cali-OUTPUT",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-PREROUTING").rules),
        vec![
            "-m conntrack --ctstate RELATED,ESTABLISHED --jump ACCEPT",
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
            "--jump cali-from-host-endpoint",
            HOST_ACCEPTED,
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-POSTROUTING").rules),
        vec![
            "-m mark --mark 0x8/0x8 --jump RETURN",
            "--jump MARK --set-mark 0/0x78",
            "-m conntrack --ctstate DNAT --jump cali-to-host-endpoint",
            "-m comment --comment \"Host endpoint policy accepted packet.\" -m mark --mark 0x8/0x8 --jump RETURN",
        ]
    );
    assert!(chain(&chains, "cali-OUTPUT").rules.is_empty());
}

#[test]
fn ipvs_mangle_postrouting_skips_endpoint_marked() {
    let renderer = ipvs_renderer();
    let chains = renderer.static_mangle_chains(IpVersion::V4);
    assert_eq!(
        rendered(&chain(&chains, "cali-POSTROUTING").rules[..2]),
        vec![
            "-m mark --mark 0x8/0x8 --jump RETURN",
            "-m mark ! --mark 0/0xff00 --jump RETURN",
        ]
    );
}

#[test]
fn tproxy_mangle_chains() {
    let renderer = renderer(tproxy_config());
    let chains = renderer.static_mangle_chains(IpVersion::V4);
    assert_eq!(
        names(&chains),
        vec![
            "cali-pre-tproxy-establ",
            "cali-pre-tproxy-svc",
            "cali-pre-tproxy-selec",
            "cali-pre-tproxy-np",
            "cali-out-mangle-tproxy",
            "cali-out-mangle-tproxy-host",
            "cali-failsafe-in",
            "cali-failsafe-out",
            "cali-PREROUTING",
            "cali-POSTROUTING",
            "cali-OUTPUT",
        ]
    );
    let prerouting = rendered(&chain(&chains, "cali-PREROUTING").rules);
    assert_eq!(
        prerouting.first().unwrap(),
        "-m comment --comment \"Check if should be proxied when established\" -m conntrack --ctstate RELATED,ESTABLISHED --jump cali-pre-tproxy-establ"
    );
    assert_eq!(
        prerouting.last().unwrap(),
        "-m comment --comment \"Check if it is a new connection to be proxied\" --jump cali-pre-tproxy-selec"
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-pre-tproxy-svc").rules),
        vec![
            "-m comment --comment \"Mark the connection so that subsequent packets go to proxy\" --jump CONNMARK --set-mark 0x20000/0x20000",
            "-m comment --comment \"Divert the TCP connection to proxy\" -p 6 --jump TPROXY --on-port 16001 --tproxy-mark 0x20000/0x20000",
            "-m comment --comment \"Unmark non-proxied\" --jump CONNMARK --set-mark 0x0/0x20000",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-pre-tproxy-np").rules),
        vec![
            "-m comment --comment \"Divert the TCP connection to proxy\" -p 6 -m addrtype --dst-type LOCAL --jump TPROXY --on-port 16002 --tproxy-mark 0x20000/0x20000",
            "-m comment --comment \"Divert the TCP connection to proxy\" -p 17 -m addrtype --dst-type LOCAL --jump TPROXY --on-port 16002 --tproxy-mark 0x20000/0x20000",
        ]
    );
    // Node ports share the v4 set.
    let select = rendered(&renderer.mangle_tproxy_chains(IpVersion::V6)[2].rules);
    assert!(select[0].contains("cali60tproxy-services dst,dst"));
    assert!(select[2].contains("cali40tproxy-nodeports-tcp dst,dst"));
    assert_eq!(
        rendered(&chain(&chains, "cali-OUTPUT").rules),
        vec![
            "-m comment --comment \"Process non-local connections as proxied\" -m addrtype ! --src-type LOCAL --jump cali-out-mangle-tproxy",
            "-m comment --comment \"Check local connections for host networked workloads\" -m addrtype --src-type LOCAL --jump cali-out-mangle-tproxy-host",
        ]
    );
}

#[test]
fn egress_gateway_mangle_chains() {
    let renderer = renderer(endpoint_config().with_egress_ip().with_vxlan(None));
    let chains = renderer.static_mangle_chains(IpVersion::V4);
    assert_eq!(
        names(&chains)[..3],
        ["cali-pre-egress", "cali-post-egress", "cali-pre-egress-in"]
    );
    assert_eq!(
        rendered(&chains[0].rules),
        vec!["-m comment --comment \"Restore connmark for pod traffic\" -m set --match-set cali40all-ipam-pools src --jump CONNMARK --restore-mark --mask 0x4"]
    );
    assert_eq!(
        rendered(&chains[1].rules),
        vec!["-m mark --mark 0x4/0x4 --out-interface vxlan.calico --jump CHECKSUM --checksum-fill"]
    );
    assert_eq!(
        rendered(&chains[2].rules),
        vec!["-m comment --comment \"Set mark for returning egress packet\" --in-interface egress.calico --jump MARK --set-mark 0x4/0x4"]
    );
    assert_eq!(names(&renderer.static_mangle_chains(IpVersion::V6))[0], "cali-failsafe-in");

    // No tunnel, nothing to checksum.
    let untunneled = crate::test_data::renderer(endpoint_config().with_egress_ip());
    assert_eq!(
        names(&untunneled.static_mangle_chains(IpVersion::V4))[..2],
        ["cali-pre-egress", "cali-pre-egress-in"]
    );
}

#[test]
fn default_raw_chains() {
    let renderer = renderer(endpoint_config());
    let chains = renderer.static_raw_chains(IpVersion::V4);
    assert_eq!(
        names(&chains),
        vec![
            "cali-failsafe-in",
            "cali-failsafe-out",
            "cali-PREROUTING",
            "cali-rpf-skip",
            "cali-wireguard-incoming-mark",
            "cali-OUTPUT",
        ]
    );
    assert_eq!(
        rendered(&chain(&chains, "cali-PREROUTING").rules),
        vec![
            "--jump MARK --set-mark 0/0x78",
            "--in-interface cali+ --jump MARK --set-mark 0x20/0x20",
            "-m mark --mark 0x20/0x20 --jump cali-rpf-skip",
            "-m mark --mark 0x20/0x20 -m rpfilter --invert --validmark --jump DROP",
            "-m mark --mark 0/0x20 --jump cali-from-host-endpoint",
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
        ]
    );
    assert!(chain(&chains, "cali-rpf-skip").rules.is_empty());
    assert_eq!(
        rendered(&chain(&chains, "cali-OUTPUT").rules),
        vec![
            "--jump MARK --set-mark 0/0x78",
            "--jump cali-to-host-endpoint",
            "-m mark --mark 0x8/0x8 --jump ACCEPT",
        ]
    );
}

#[test]
fn raw_prerouting_with_ipsec_and_wireguard() {
    let renderer = renderer(Config {
        ipsec_enabled: true,
        wireguard_encrypt_host_traffic: true,
        marks: MarkBitConfig {
            ipsec: 0x10000,
            ..endpoint_config().marks
        },
        ..endpoint_config().with_wireguard(0x100000)
    });
    let v4 = rendered(&renderer.raw_prerouting_chain(IpVersion::V4).rules);
    assert_eq!(
        v4[..4],
        [
            "--jump MARK --set-mark 0/0x10078",
            "--jump cali-wireguard-incoming-mark",
            "--in-interface cali+ --jump MARK --set-mark 0x20/0x20",
            "-m mark --mark 0x20/0x20 --jump MARK --set-mark 0x10000/0x10000",
        ]
    );
    let v6 = rendered(&renderer.raw_prerouting_chain(IpVersion::V6).rules);
    assert_eq!(v6.len(), v4.len() - 1);
    assert!(!v6.iter().any(|rule| rule.contains("0x10000/0x10000")));
}

#[test_case(false, "-m rpfilter --invert --validmark --jump DROP"; "strict")]
#[test_case(true, "-m rpfilter --invert --validmark --accept-local --jump DROP"; "accept local")]
fn rpf_filter_without_mark(accept_local: bool, expected: &str) {
    let renderer = renderer(endpoint_config());
    assert_eq!(
        rendered(&renderer.rpf_filter_rules(IpVersion::V6, 0, 0, accept_local)),
        vec![expected]
    );
}

#[test]
fn rpf_filter_lets_openstack_dhcp_through() {
    let renderer = renderer(endpoint_config().with_openstack(None));
    assert_eq!(
        rendered(&renderer.rpf_filter_rules(IpVersion::V4, 0x20, 0x20, false)),
        vec![
            "-p 17 --source 0.0.0.0/32 -m multiport --source-ports 68 -m multiport --destination-ports 67 --jump ACCEPT",
            "-m mark --mark 0x20/0x20 -m rpfilter --invert --validmark --jump DROP",
        ]
    );
    assert_eq!(renderer.rpf_filter_rules(IpVersion::V6, 0x20, 0x20, false).len(), 1);
}

#[test]
fn wireguard_incoming_mark() {
    let renderer = renderer(endpoint_config().with_wireguard(0x100000));
    assert_eq!(
        rendered(&renderer.wireguard_incoming_mark_chain().rules),
        vec![
            "--in-interface lo --jump RETURN",
            "--in-interface wireguard.cali --jump RETURN",
            "--in-interface wg-v6.cali --jump RETURN",
            "--in-interface cali+ --jump RETURN",
            "--jump MARK --set-mark 0x100000/0x100000",
        ]
    );

    let v4_only = crate::test_data::renderer(Config {
        wireguard_interface_name_v6: String::new(),
        ..endpoint_config().with_wireguard(0x100000)
    });
    assert_eq!(v4_only.wireguard_incoming_mark_chain().rules.len(), 4);
}
