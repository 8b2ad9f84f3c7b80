use chain_render::{
    backend, group_policies, log_tables, Backend, Config, HashEndpointMarkMapper, IpVersion,
    Policy, PolicyId, PortRange, Protocol, Renderer, Rule, RuleAction, RuleDirection,
    TierPolicyGroups, WorkloadEndpoint,
};
use clap::Parser;

#[derive(Debug, Parser)]
pub struct Opt {
    #[clap(short, long, default_value = "cali1234")]
    iface: String,
    /// Render nftables rules instead of iptables.
    #[clap(long)]
    nftables: bool,
    #[clap(short = '6', long)]
    ipv6: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    tracing_subscriber::fmt::init();

    let backend = if opt.nftables {
        Backend::Nftables
    } else {
        Backend::Iptables
    };
    let ip_version = if opt.ipv6 { IpVersion::V6 } else { IpVersion::V4 };
    let renderer = Renderer::new(Config::default().with_backend(backend))?;

    let web = PolicyId::new("default", "allow-web");
    let policy = Policy {
        inbound_rules: vec![Rule::new(RuleAction::Allow)
            .with_protocol(Protocol::tcp())
            .with_dst_ports(vec![PortRange::single(80), PortRange::single(443)])],
        outbound_rules: vec![Rule::new(RuleAction::Allow)],
        ..Default::default()
    };
    let policies = [("allow-web", "app == 'web'"), ("allow-dns", "app == 'web'")];
    let tier = TierPolicyGroups {
        name: "default".to_string(),
        ingress: group_policies("default", RuleDirection::Ingress, &policies),
        egress: group_policies("default", RuleDirection::Egress, &policies),
    };
    let endpoint = WorkloadEndpoint::new(opt.iface.clone())
        .with_tiers(vec![tier.clone()])
        .with_profiles(vec!["kns.default".to_string()]);

    let marks = &renderer.config().marks;
    let mut mapper = HashEndpointMarkMapper::new(marks.endpoint, marks.non_cali_endpoint);
    let mut chains = renderer.policy_to_chains(&web, &policy, ip_version);
    chains.extend(
        tier.ingress
            .iter()
            .chain(&tier.egress)
            .filter(|group| !group.should_be_inlined())
            .map(|group| renderer.policy_group_to_chain(group)),
    );
    chains.extend(renderer.workload_endpoint_to_chains(&endpoint, &mut mapper, ip_version));
    chains.extend(renderer.workload_dispatch_chains(&[opt.iface]));
    for chain in &chains {
        for line in backend::render_chain(backend, ip_version, chain) {
            println!("{line}");
        }
    }

    let tables = renderer.static_tables(ip_version);
    for (table, chain) in tables.iter() {
        println!("# {table}");
        for line in backend::render_chain(backend, ip_version, chain) {
            println!("{line}");
        }
    }
    log_tables(&tables);
    tracing::info!(chains = chains.len() + tables.len(), "Rendered");

    Ok(())
}
