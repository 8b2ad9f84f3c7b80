#![cfg(test)]

use std::net::IpAddr;

use chain_render_common::{Action, Chain, ChainRule, IpVersion, MatchCriteria, PortRange};
use test_case::test_case;

use super::{iptables, nftables, render_chain};
use crate::Backend;

#[test_case(Action::Accept, "--jump ACCEPT", "accept")]
#[test_case(Action::Drop, "--jump DROP", "drop")]
#[test_case(Action::Reject, "--jump REJECT", "reject")]
#[test_case(Action::Return, "--jump RETURN", "return")]
#[test_case(Action::jump("cali-pi-foo"), "--jump cali-pi-foo", "jump cali-pi-foo")]
#[test_case(Action::goto("cali-tw-x"), "--goto cali-tw-x", "goto cali-tw-x")]
#[test_case(
    Action::log("calico-drop"),
    "--jump LOG --log-prefix \"calico-drop: \" --log-level 5",
    "log prefix \"calico-drop: \" level notice"
)]
#[test_case(
    Action::nflog(1, "API0|default.foo"),
    "--jump NFLOG --nflog-group 1 --nflog-prefix API0|default.foo --nflog-range 80",
    "log prefix \"API0|default.foo\" group 1 snaplen 80"
)]
#[test_case(
    Action::Nflog { group: 3, prefix: "DNS".to_string(), size: 1024 },
    "--jump NFLOG --nflog-group 3 --nflog-prefix DNS --nflog-size 1024",
    "log prefix \"DNS\" group 3 snaplen 1024"
)]
#[test_case(Action::SetMark { mark: 0x80 }, "--jump MARK --set-mark 0x80/0x80", "meta mark set mark or 0x80")]
#[test_case(
    Action::SetMaskedMark { mark: 0, mask: 0x600 },
    "--jump MARK --set-mark 0x0/0x600",
    "meta mark set mark & 0xfffff9ff ^ 0x0"
)]
#[test_case(Action::ClearMark { mark: 0x200 }, "--jump MARK --set-mark 0/0x200", "meta mark set mark & 0xfffffdff")]
#[test_case(Action::Masquerade { to_ports: None }, "--jump MASQUERADE", "masquerade")]
#[test_case(
    Action::Masquerade { to_ports: Some("1000-2000".to_string()) },
    "--jump MASQUERADE --to-ports 1000-2000",
    "masquerade to :1000-2000"
)]
#[test_case(
    Action::Snat { to_address: "10.0.0.1".to_string() },
    "--jump SNAT --to-source 10.0.0.1",
    "snat to 10.0.0.1"
)]
#[test_case(
    Action::Dnat { address: "10.0.0.2".parse::<IpAddr>().unwrap(), port: Some(8775) },
    "--jump DNAT --to-destination 10.0.0.2:8775",
    "dnat to 10.0.0.2:8775"
)]
#[test_case(
    Action::Dnat { address: "fd00::2".parse::<IpAddr>().unwrap(), port: Some(80) },
    "--jump DNAT --to-destination [fd00::2]:80",
    "dnat to [fd00::2]:80"
)]
#[test_case(Action::NoTrack, "--jump NOTRACK", "notrack")]
#[test_case(Action::Nfqueue { queue: 100 }, "--jump NFQUEUE --queue-num 100", "queue num 100")]
#[test_case(
    Action::NfqueueWithBypass { queue: 101 },
    "--jump NFQUEUE --queue-num 101 --queue-bypass",
    "queue flags bypass num 101"
)]
#[test_case(
    Action::SaveConnMark { mask: 0x40 },
    "--jump CONNMARK --save-mark --mask 0x40",
    "ct mark set mark & 0x40"
)]
#[test_case(
    Action::RestoreConnMark { mask: 0x40 },
    "--jump CONNMARK --restore-mark --mask 0x40",
    "meta mark set ct mark & 0x40"
)]
#[test_case(
    Action::SetConnMark { mark: 0x40, mask: 0x40 },
    "--jump CONNMARK --set-mark 0x40/0x40",
    "ct mark set ct mark & 0xffffffbf ^ 0x40"
)]
#[test_case(
    Action::Tproxy { mark: 0x4, mask: 0x4, port: 16001 },
    "--jump TPROXY --on-port 16001 --tproxy-mark 0x4/0x4",
    "meta mark set mark & 0xfffffffb ^ 0x4 tproxy to :16001"
)]
#[test_case(Action::ChecksumFill, "--jump CHECKSUM --checksum-fill", "counter")]
fn renders_action(action: Action, expected_iptables: &str, expected_nftables: &str) {
    assert_eq!(iptables::render_action(&action), expected_iptables);
    assert_eq!(nftables::render_action(&action), expected_nftables);
}

#[test_case(MatchCriteria::new().mark_single_bit_set(0x200), "-m mark --mark 0x200/0x200")]
#[test_case(MatchCriteria::new().mark_clear(0x400), "-m mark --mark 0/0x400")]
#[test_case(MatchCriteria::new().mark_not_clear(0x180), "-m mark ! --mark 0/0x180")]
#[test_case(MatchCriteria::new().protocol("tcp"), "-p tcp")]
#[test_case(MatchCriteria::new().protocol("8"), "-p 8")]
#[test_case(MatchCriteria::new().not_protocol("tcp"), "! -p tcp")]
#[test_case(MatchCriteria::new().source_net("10.0.0.0/8"), "--source 10.0.0.0/8")]
#[test_case(MatchCriteria::new().not_dest_net("10.0.0.0/8"), "! --destination 10.0.0.0/8")]
#[test_case(MatchCriteria::new().source_ip_set("cali40ipsetid1"), "-m set --match-set cali40ipsetid1 src")]
#[test_case(MatchCriteria::new().not_dest_ip_set("cali40ipsetid1"), "-m set ! --match-set cali40ipsetid1 dst")]
#[test_case(MatchCriteria::new().source_ip_port_set("cali40ipset-1"), "-m set --match-set cali40ipset-1 src,src")]
#[test_case(MatchCriteria::new().dest_ip_port_set("cali40ipset-1"), "-m set --match-set cali40ipset-1 dst,dst")]
#[test_case(MatchCriteria::new().source_dest_ip_set("cali40tproxy-pod-self"), "-m set --match-set cali40tproxy-pod-self src,dst")]
#[test_case(
    MatchCriteria::new().source_ports(vec![PortRange::new(10, 12), PortRange::new(20, 30), PortRange::single(8080)]),
    "-m multiport --source-ports 10:12,20:30,8080"
)]
#[test_case(MatchCriteria::new().not_dest_ports(vec![PortRange::single(80)]), "-m multiport ! --destination-ports 80")]
#[test_case(MatchCriteria::new().icmp(false, 10, Some(12)), "-m icmp --icmp-type 10/12")]
#[test_case(MatchCriteria::new().icmp(true, 10, None), "-m icmp6 --icmpv6-type 10")]
#[test_case(MatchCriteria::new().not_icmp(false, 10, None), "-m icmp ! --icmp-type 10")]
#[test_case(MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"), "-m conntrack --ctstate RELATED,ESTABLISHED")]
#[test_case(MatchCriteria::new().not_conntrack_state("DNAT"), "-m conntrack ! --ctstate DNAT")]
#[test_case(
    MatchCriteria::new().conntrack_orig_dest("10.0.0.53").conntrack_orig_dest_port(53),
    "-m conntrack --ctorigdst 10.0.0.53 -m conntrack --ctorigdstport 53"
)]
#[test_case(MatchCriteria::new().in_interface("cali+"), "--in-interface cali+")]
#[test_case(MatchCriteria::new().out_interface("cali+"), "--out-interface cali+")]
#[test_case(MatchCriteria::new().not_src_addr_type_local(true), "-m addrtype ! --src-type LOCAL --limit-iface-out")]
#[test_case(MatchCriteria::new().dest_addr_type_local(), "-m addrtype --dst-type LOCAL")]
#[test_case(MatchCriteria::new().rpf_check_failed(false), "-m rpfilter --invert --validmark")]
fn renders_iptables_match(match_criteria: MatchCriteria, expected: &str) {
    assert_eq!(iptables::render_match(&match_criteria), expected);
}

#[test_case(IpVersion::V4, MatchCriteria::new().source_net("10.0.0.0/8"), "ip saddr 10.0.0.0/8")]
#[test_case(IpVersion::V6, MatchCriteria::new().not_dest_ip_set("cali60s"), "ip6 daddr != @cali60s")]
#[test_case(
    IpVersion::V4,
    MatchCriteria::new().dest_ports(vec![PortRange::new(10, 12), PortRange::single(80)]),
    "th dport { 10-12, 80 }"
)]
#[test_case(IpVersion::V4, MatchCriteria::new().mark_clear(0x10), "meta mark & 0x00000010 == 0x00000000")]
#[test_case(IpVersion::V4, MatchCriteria::new().conntrack_state("RELATED,ESTABLISHED"), "ct state related,established")]
#[test_case(IpVersion::V4, MatchCriteria::new().not_conntrack_state("DNAT"), "ct status != dnat")]
#[test_case(IpVersion::V4, MatchCriteria::new().in_interface("cali*"), "iifname \"cali*\"")]
fn renders_nftables_match(ip_version: IpVersion, match_criteria: MatchCriteria, expected: &str) {
    assert_eq!(nftables::render_match(ip_version, &match_criteria), expected);
}

#[test]
fn renders_whole_chain() {
    let chain = Chain::new(
        "cali-pi-foo",
        vec![
            ChainRule::new(MatchCriteria::new().protocol("tcp"), Action::Accept)
                .with_comment("Policy foo ingress"),
            ChainRule::default().with_comment("comment only"),
        ],
    );

    assert_eq!(
        render_chain(Backend::Iptables, IpVersion::V4, &chain),
        vec![
            "-A cali-pi-foo -m comment --comment \"Policy foo ingress\" -p tcp --jump ACCEPT",
            "-A cali-pi-foo -m comment --comment \"comment only\"",
        ]
    );
    assert_eq!(
        render_chain(Backend::Nftables, IpVersion::V4, &chain),
        vec![
            "add rule ip calico cali-pi-foo meta l4proto tcp accept comment \"Policy foo ingress\"",
            "add rule ip calico cali-pi-foo comment \"comment only\"",
        ]
    );
}
