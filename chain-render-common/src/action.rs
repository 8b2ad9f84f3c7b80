use std::net::IpAddr;

use serde::Serialize;
use strum_macros::AsRefStr;

/// What a [crate::ChainRule] does with a matching packet.
///
/// This is the complete set of actions any chain may carry; every backend serializer
/// matches on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, AsRefStr)]
#[serde(tag = "kind")]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Return,
    Jump {
        target: String,
    },
    Goto {
        target: String,
    },
    /// Kernel log with the given prefix.
    Log {
        prefix: String,
    },
    /// Copies packet metadata to the NFLOG group. A zero `size` uses the backend default.
    Nflog {
        group: u16,
        prefix: String,
        size: u32,
    },
    SetMark {
        mark: u32,
    },
    SetMaskedMark {
        mark: u32,
        mask: u32,
    },
    ClearMark {
        mark: u32,
    },
    Masquerade {
        to_ports: Option<String>,
    },
    Snat {
        to_address: String,
    },
    Dnat {
        address: IpAddr,
        port: Option<u16>,
    },
    NoTrack,
    Nfqueue {
        queue: u16,
    },
    /// Same as [Action::Nfqueue] but lets packets through when nothing listens.
    NfqueueWithBypass {
        queue: u16,
    },
    SaveConnMark {
        mask: u32,
    },
    RestoreConnMark {
        mask: u32,
    },
    SetConnMark {
        mark: u32,
        mask: u32,
    },
    Tproxy {
        mark: u32,
        mask: u32,
        port: u16,
    },
    ChecksumFill,
}

impl Action {
    pub fn jump(target: impl Into<String>) -> Self {
        Action::Jump {
            target: target.into(),
        }
    }

    pub fn goto(target: impl Into<String>) -> Self {
        Action::Goto {
            target: target.into(),
        }
    }

    pub fn nflog(group: u16, prefix: impl Into<String>) -> Self {
        Action::Nflog {
            group,
            prefix: prefix.into(),
            size: 0,
        }
    }

    pub fn log(prefix: impl Into<String>) -> Self {
        Action::Log {
            prefix: prefix.into(),
        }
    }
}
