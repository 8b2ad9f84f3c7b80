//! Grouping of rendered chains by netfilter table.
use std::collections::BTreeMap;

use chain_render_common::{Chain, IpVersion};
use serde::Serialize;
use strum_macros::{Display, EnumIter};

use crate::{HashEndpointMarkMapper, HostEndpointChainKind, Renderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Raw,
    Mangle,
    Nat,
    Filter,
}

/// Every chain of one IP version, per table, in render order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSet {
    pub ip_version: IpVersion,
    tables: BTreeMap<Table, Vec<Chain>>,
}

impl TableSet {
    pub fn new(ip_version: IpVersion) -> Self {
        Self {
            ip_version,
            tables: BTreeMap::new(),
        }
    }

    /// Appends `chains` to `table`.
    pub fn extend(&mut self, table: Table, chains: impl IntoIterator<Item = Chain>) {
        self.tables.entry(table).or_default().extend(chains);
    }

    pub fn chains(&self, table: Table) -> &[Chain] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn chain(&self, table: Table, name: &str) -> Option<&Chain> {
        self.chains(table).iter().find(|chain| chain.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Table, &Chain)> {
        self.tables
            .iter()
            .flat_map(|(table, chains)| chains.iter().map(move |chain| (*table, chain)))
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Renderer {
    /// All static chains of `ip_version`. The chains filled in later from dataplane state
    /// (dispatch, NAT-outgoing, floating IPs, blocked CIDRs) start out empty so every jump
    /// target exists.
    pub fn static_tables(&self, ip_version: IpVersion) -> TableSet {
        let mut tables = TableSet::new(ip_version);
        tables.extend(Table::Raw, self.static_raw_chains(ip_version));
        tables.extend(Table::Raw, self.host_dispatch_chains(
            &[],
            None,
            HostEndpointChainKind::Untracked,
        ));
        tables.extend(Table::Mangle, self.static_mangle_chains(ip_version));
        tables.extend(Table::Mangle, self.host_dispatch_chains(
            &[],
            None,
            HostEndpointChainKind::PreDnat,
        ));
        tables.extend(Table::Mangle, self.host_dispatch_chains(
            &[],
            None,
            HostEndpointChainKind::MangleEgress,
        ));
        tables.extend(Table::Nat, self.static_nat_chains(ip_version));
        tables.extend(
            Table::Nat,
            [
                self.nat_outgoing_chain(false, ip_version),
                self.floating_ip_dnat_chain(&BTreeMap::new(), ip_version),
                self.floating_ip_snat_chain(&BTreeMap::new(), ip_version),
            ],
        );
        tables.extend(Table::Filter, self.static_filter_chains(ip_version));
        tables.extend(Table::Filter, self.workload_dispatch_chains(&[]));
        tables.extend(Table::Filter, self.host_dispatch_chains(
            &[],
            None,
            HostEndpointChainKind::Filter,
        ));
        tables.extend(Table::Filter, [self.blocked_cidrs_chain(&[], ip_version)]);
        if self.config.kube_ipvs_support_enabled {
            let marks = &self.config.marks;
            let mut mapper = HashEndpointMarkMapper::new(marks.endpoint, marks.non_cali_endpoint);
            tables.extend(
                Table::Filter,
                self.endpoint_mark_dispatch_chains(&mut mapper, &[], &[]),
            );
        }
        tracing::debug!(%ip_version, chains = tables.len(), "Rendered static tables");
        tables
    }
}
