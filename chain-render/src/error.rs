use chain_render_common::MarkError;
use thiserror::Error;

/// Renderer errors.
///
/// All of these come out of [crate::Renderer::new] or input validation; once a renderer
/// exists, rendering itself doesn't fail.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Mark bits are missing or overlap.
    #[error(transparent)]
    MarkLayout(#[from] MarkError),
    /// DNS policy mark configured without a queue to send held packets to.
    #[error("DNS policy mark is set but DNSPolicyNfqueueID is 0")]
    DnsNfqueueIdUnset,
    /// Port range for a rule or NAT port range is not valid.
    #[error("Port range is invalid")]
    InvalidPort,
    /// Every value inside the endpoint mark is already taken.
    #[error("No free endpoint mark for interface {iface}")]
    EndpointMarksExhausted { iface: String },
    /// Address or CIDR string couldn't be parsed.
    #[error(transparent)]
    InvalidCidr(#[from] ipnet::AddrParseError),
    /// Config was not valid JSON for [crate::Config].
    #[error(transparent)]
    ConfigFormat(#[from] serde_json::Error),
}
