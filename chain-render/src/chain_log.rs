//! Structured dump of rendered tables, one JSON event per chain.
use chain_render_common::{Chain, IpVersion};
use serde::Serialize;

use crate::{Table, TableSet};

#[derive(Debug, Clone, Serialize)]
struct ChainFormatted<'a> {
    table: Table,
    ip_version: IpVersion,
    chain: &'a Chain,
    timestamp: String,
}

/// Logs every chain of `tables` under the `chain_log` target.
pub fn log_tables(tables: &TableSet) {
    let timestamp =
        chrono::offset::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    for (table, chain) in tables.iter() {
        let formatted = ChainFormatted {
            table,
            ip_version: tables.ip_version,
            chain,
            timestamp: timestamp.clone(),
        };
        match serde_json::to_string(&formatted) {
            Ok(chain) => tracing::debug!(target: "chain_log", "{chain}"),
            Err(error) => {
                tracing::warn!(%error, chain = %chain.name, "Failed to format chain for logging")
            }
        }
    }
}
