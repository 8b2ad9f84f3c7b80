mod action;
mod chain;
pub mod mark;
mod matches;
mod port;

pub use action::Action;
pub use chain::{Chain, ChainRule};
pub use mark::{MarkBitConfig, MarkError, MarkField, MarkRequirement};
pub use matches::{Criterion, MatchCriteria};
pub use port::{split_port_list, PortRange, MAX_MULTIPORT_SLOTS};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// IP family a set of chains is rendered for.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum IpVersion {
    #[strum(serialize = "4")]
    #[serde(rename = "4")]
    V4 = 4,
    #[strum(serialize = "6")]
    #[serde(rename = "6")]
    V6 = 6,
}

impl Default for IpVersion {
    fn default() -> Self {
        Self::V4
    }
}

impl IpVersion {
    pub fn is_v6(&self) -> bool {
        *self == IpVersion::V6
    }
}
