//! Backend serializers.
//!
//! Both are plain functions from the backend independent [Chain] model to rule text, and
//! both match exhaustively on [chain_render_common::Action] and
//! [chain_render_common::Criterion].
pub mod iptables;
pub mod nftables;
mod test;

use chain_render_common::{Chain, IpVersion};

use crate::Backend;

/// Renders every rule of `chain` in `backend` syntax, one line per rule.
pub fn render_chain(backend: Backend, ip_version: IpVersion, chain: &Chain) -> Vec<String> {
    match backend {
        Backend::Iptables => iptables::render_chain(chain),
        Backend::Nftables => nftables::render_chain(ip_version, chain),
    }
}
