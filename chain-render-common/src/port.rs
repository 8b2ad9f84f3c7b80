
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of slots a single multiport match can hold. A single port takes one slot, a
/// range takes two.
pub const MAX_MULTIPORT_SLOTS: usize = 15;

/// Inclusive port range; `first == last` is a single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn new(first: u16, last: u16) -> Self {
        Self { first, last }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn is_single(&self) -> bool {
        self.first == self.last
    }

    pub fn is_valid(&self) -> bool {
        self.first <= self.last
    }

    fn slots(&self) -> usize {
        if self.is_single() {
            1
        } else {
            2
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}:{}", self.first, self.last)
        }
    }
}

/// Splits `ports` into consecutive chunks that each fit one multiport match.
///
/// Order is preserved and a range is never split across chunks: a range that doesn't fit
/// in the current chunk starts the next one.
pub fn split_port_list(ports: &[PortRange]) -> Vec<Vec<PortRange>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for port in ports {
        let slots = port.slots();
        if used + slots > MAX_MULTIPORT_SLOTS {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(*port);
        used += slots;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
