//! Bit-field layout of the per-packet mark word.
//!
//! Every component that reads or writes a mark goes through the helpers in this module
//! ([set], [clear], [set_masked], [is_set]) rather than building mark actions from raw
//! integers.
mod test;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter};
use thiserror::Error;

use crate::{Action, MatchCriteria};

/// Named masks inside the 32-bit packet mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkBitConfig {
    /// Set by a policy or profile that accepted the packet.
    pub accept: u32,
    /// Set by a policy that passed the packet to the next tier.
    pub pass: u32,
    /// Set by a policy that denied the packet.
    pub drop: u32,
    pub ipsec: u32,
    pub egress: u32,
    /// "All blocks passed" accumulator of the rule compiler.
    pub scratch0: u32,
    /// "This block passed" accumulator of the rule compiler.
    pub scratch1: u32,
    /// Mask holding the per-endpoint value written by the set-mark chains.
    pub endpoint: u32,
    /// Value inside [MarkBitConfig::endpoint] reserved for non-workload interfaces.
    pub non_cali_endpoint: u32,
    pub proxy: u32,
    pub dns_policy: u32,
    pub skip_dns_policy_nfqueue: u32,
}

/// Every field of [MarkBitConfig], in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumCount)]
#[strum(serialize_all = "snake_case")]
pub enum MarkField {
    Accept,
    Pass,
    Drop,
    Ipsec,
    Egress,
    Scratch0,
    Scratch1,
    Endpoint,
    NonCaliEndpoint,
    Proxy,
    DnsPolicy,
    SkipDnsPolicyNfqueue,
}

/// How a [MarkField] takes part in layout validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRequirement {
    /// Must be non-zero and must not overlap any other checked field.
    Required,
    /// May be zero; when set it must not overlap any other checked field.
    Optional,
    /// Not checked at all, either because its feature is off or because it is a value
    /// inside another field rather than bits of its own.
    Ignored,
}

/// Mark layout violations. These are configuration bugs: the agent must not continue.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkError {
    /// A required mark field has no bits assigned.
    #[error("mark field `{0}` is required but unset")]
    Unset(MarkField),
    /// A mark field shares bits with an earlier field.
    #[error("mark field `{field}` ({bits:#x}) overlaps bits already in use ({used:#x})")]
    Overlap { field: MarkField, bits: u32, used: u32 },
}

impl MarkBitConfig {
    pub fn get(&self, field: MarkField) -> u32 {
        match field {
            MarkField::Accept => self.accept,
            MarkField::Pass => self.pass,
            MarkField::Drop => self.drop,
            MarkField::Ipsec => self.ipsec,
            MarkField::Egress => self.egress,
            MarkField::Scratch0 => self.scratch0,
            MarkField::Scratch1 => self.scratch1,
            MarkField::Endpoint => self.endpoint,
            MarkField::NonCaliEndpoint => self.non_cali_endpoint,
            MarkField::Proxy => self.proxy,
            MarkField::DnsPolicy => self.dns_policy,
            MarkField::SkipDnsPolicyNfqueue => self.skip_dns_policy_nfqueue,
        }
    }

    /// Checks that every checked field is disjoint from the others and that every
    /// required field is non-zero. Returns the union of the checked bits.
    pub fn validate(
        &self,
        requirement: impl Fn(MarkField) -> MarkRequirement,
    ) -> Result<u32, MarkError> {
        let mut used = 0u32;
        for field in MarkField::iter() {
            let bits = self.get(field);
            match requirement(field) {
                MarkRequirement::Ignored => continue,
                MarkRequirement::Optional if bits == 0 => continue,
                MarkRequirement::Required if bits == 0 => return Err(MarkError::Unset(field)),
                _ => {}
            }
            if used & bits != 0 {
                return Err(MarkError::Overlap { field, bits, used });
            }
            used |= bits;
        }
        Ok(used)
    }
}

/// Sets every bit in `bits`, leaving the rest of the mark untouched.
pub fn set(bits: u32) -> Action {
    Action::SetMark { mark: bits }
}

/// Clears every bit in `bits`, leaving the rest of the mark untouched.
pub fn clear(bits: u32) -> Action {
    Action::ClearMark { mark: bits }
}

/// Writes `bits` into the bits selected by `mask`.
pub fn set_masked(bits: u32, mask: u32) -> Action {
    Action::SetMaskedMark { mark: bits, mask }
}

/// Matches packets with `bit` set.
pub fn is_set(bit: u32) -> MatchCriteria {
    MatchCriteria::new().mark_single_bit_set(bit)
}
