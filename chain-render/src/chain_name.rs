use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

use crate::{PolicyId, ProfileId};

/// Marks a suffix that has been replaced by its hash.
const SHORTENED_PREFIX: char = '_';

/// `prefix + suffix` if that fits in `max_len`, otherwise `prefix_<hash of suffix>` cut to at
/// most `max_len`.
///
/// Suffixes that already start with `_` are always hashed so a literal name can never
/// collide with a hashed one.
pub fn length_limited_id(prefix: &str, suffix: &str, max_len: usize) -> String {
    if prefix.len() + suffix.len() <= max_len && !suffix.starts_with(SHORTENED_PREFIX) {
        return format!("{prefix}{suffix}");
    }
    let hash = URL_SAFE_NO_PAD.encode(Sha256::digest(suffix.as_bytes()));
    let room = max_len
        .saturating_sub(prefix.len() + 1)
        .min(hash.len());
    format!("{prefix}{SHORTENED_PREFIX}{}", &hash[..room])
}

pub fn policy_chain_name(prefix: &str, id: &PolicyId, max_len: usize) -> String {
    length_limited_id(prefix, &format!("{}/{}", id.tier, id.name), max_len)
}

pub fn profile_chain_name(prefix: &str, id: &ProfileId, max_len: usize) -> String {
    length_limited_id(prefix, &id.name, max_len)
}

pub fn endpoint_chain_name(prefix: &str, iface: &str, max_len: usize) -> String {
    length_limited_id(prefix, iface, max_len)
}
