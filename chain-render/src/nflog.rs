use serde::Serialize;

use crate::{chain_name::length_limited_id, NFLOG_INBOUND_GROUP, NFLOG_OUTBOUND_GROUP, NFLOG_PREFIX_MAX_LENGTH};

/// Which way a chain or rule list faces, from the endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl RuleDirection {
    fn letter(&self) -> char {
        match self {
            RuleDirection::Ingress => 'I',
            RuleDirection::Egress => 'E',
        }
    }

    pub fn nflog_group(&self) -> u16 {
        match self {
            RuleDirection::Ingress => NFLOG_INBOUND_GROUP,
            RuleDirection::Egress => NFLOG_OUTBOUND_GROUP,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RuleDirection::Ingress => "ingress",
            RuleDirection::Egress => "egress",
        }
    }
}

/// Kind of object a rule list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RuleOwner {
    Policy,
    Profile,
}

impl RuleOwner {
    fn letter(&self) -> char {
        match self {
            RuleOwner::Policy => 'P',
            RuleOwner::Profile => 'R',
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RuleOwner::Policy => "Policy",
            RuleOwner::Profile => "Profile",
        }
    }
}

/// Verdict recorded in an NFLOG prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NflogVerdict {
    Allow,
    Deny,
    Pass,
}

impl NflogVerdict {
    fn letter(&self) -> char {
        match self {
            NflogVerdict::Allow => 'A',
            NflogVerdict::Deny => 'D',
            NflogVerdict::Pass => 'P',
        }
    }
}

/// Prefix attached to NFLOG'd packets so the collector can tell which rule, tier or
/// profile list produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NflogPrefix<'a> {
    /// `<verdict><owner><dir><index>|<name>`
    Rule {
        verdict: NflogVerdict,
        owner: RuleOwner,
        direction: RuleDirection,
        index: usize,
        name: &'a str,
    },
    /// No policy in the tier passed or accepted: `DP<dir>|<tier>`.
    EndOfTierDrop {
        direction: RuleDirection,
        tier: &'a str,
    },
    /// Tier had only staged policies: `PP<dir>|<tier>`.
    EndOfTierPass {
        direction: RuleDirection,
        tier: &'a str,
    },
    /// No profile accepted: `DR<dir>`.
    NoMatchProfile { direction: RuleDirection },
    /// A staged policy fell off its end: `DP<dir>|<name>`.
    StagedEndOfPolicy {
        direction: RuleDirection,
        name: &'a str,
    },
}

impl NflogPrefix<'_> {
    /// Renders the prefix; a name that would push it over the NFLOG limit is hashed.
    pub fn render(&self) -> String {
        let (head, name) = match *self {
            NflogPrefix::Rule {
                verdict,
                owner,
                direction,
                index,
                name,
            } => (
                format!(
                    "{}{}{}{}|",
                    verdict.letter(),
                    owner.letter(),
                    direction.letter(),
                    index
                ),
                name,
            ),
            NflogPrefix::EndOfTierDrop { direction, tier } => {
                (format!("DP{}|", direction.letter()), tier)
            }
            NflogPrefix::EndOfTierPass { direction, tier } => {
                (format!("PP{}|", direction.letter()), tier)
            }
            NflogPrefix::NoMatchProfile { direction } => {
                return format!("DR{}", direction.letter())
            }
            NflogPrefix::StagedEndOfPolicy { direction, name } => {
                (format!("DP{}|", direction.letter()), name)
            }
        };
        if head.len() + name.len() <= NFLOG_PREFIX_MAX_LENGTH {
            format!("{head}{name}")
        } else {
            length_limited_id(&head, name, NFLOG_PREFIX_MAX_LENGTH)
        }
    }
}
