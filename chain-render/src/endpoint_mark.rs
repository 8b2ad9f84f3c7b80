//! Per-endpoint values inside the endpoint mark, used by the IPVS set-mark chains.
use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Hands out the value a `cali-sm-` chain writes into the endpoint mark.
pub trait EndpointMarkMapper {
    /// Bits of the packet mark that hold the endpoint value.
    fn mask(&self) -> u32;

    /// Value for `iface`, allocating one on first use.
    fn endpoint_mark(&mut self, iface: &str) -> Result<u32>;

    /// Frees the value of an endpoint that went away.
    fn release(&mut self, iface: &str);
}

/// Picks a start slot from a hash of the interface name and probes forward on collision,
/// so an interface usually keeps its value across restarts.
///
/// Zero and the non-calico value are never handed out.
#[derive(Debug, Clone)]
pub struct HashEndpointMarkMapper {
    mask: u32,
    non_cali_mark: u32,
    allocated: BTreeMap<String, u32>,
    in_use: BTreeSet<u32>,
}

impl HashEndpointMarkMapper {
    pub fn new(mask: u32, non_cali_mark: u32) -> Self {
        Self {
            mask,
            non_cali_mark,
            allocated: BTreeMap::new(),
            in_use: BTreeSet::new(),
        }
    }

    fn slots(&self) -> u64 {
        1u64 << self.mask.count_ones()
    }

    /// Spreads the bits of `index` over the set bits of the mask, lowest first.
    fn deposit(&self, index: u64) -> u32 {
        let mut value = 0;
        let mut index = index;
        let mut remaining = self.mask;
        while remaining != 0 {
            let bit = remaining & remaining.wrapping_neg();
            if index & 1 == 1 {
                value |= bit;
            }
            index >>= 1;
            remaining &= !bit;
        }
        value
    }
}

impl EndpointMarkMapper for HashEndpointMarkMapper {
    fn mask(&self) -> u32 {
        self.mask
    }

    fn endpoint_mark(&mut self, iface: &str) -> Result<u32> {
        if let Some(mark) = self.allocated.get(iface) {
            return Ok(*mark);
        }
        let digest = Sha256::digest(iface.as_bytes());
        let start = u64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]));
        let slots = self.slots();
        for offset in 0..slots {
            let mark = self.deposit((start + offset) % slots);
            if mark == 0 || mark == self.non_cali_mark || self.in_use.contains(&mark) {
                continue;
            }
            tracing::debug!(iface, mark = format_args!("{mark:#x}"), "Allocated endpoint mark");
            self.allocated.insert(iface.to_string(), mark);
            self.in_use.insert(mark);
            return Ok(mark);
        }
        Err(Error::EndpointMarksExhausted {
            iface: iface.to_string(),
        })
    }

    fn release(&mut self, iface: &str) {
        if let Some(mark) = self.allocated.remove(iface) {
            self.in_use.remove(&mark);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn marks_stay_inside_mask_and_skip_reserved_values() {
        let mut mapper = HashEndpointMarkMapper::new(0xff00, 0x100);
        for i in 0..200 {
            let mark = mapper.endpoint_mark(&format!("cali{i}")).unwrap();
            assert_eq!(mark & !0xff00, 0);
            assert_ne!(mark, 0);
            assert_ne!(mark, 0x100);
        }
        assert_eq!(mapper.in_use.len(), 200);
    }

    #[test]
    fn same_interface_keeps_its_mark() {
        let mut mapper = HashEndpointMarkMapper::new(0xff00, 0x100);
        let first = mapper.endpoint_mark("cali1234").unwrap();
        assert_eq!(mapper.endpoint_mark("cali1234").unwrap(), first);

        let mut fresh = HashEndpointMarkMapper::new(0xff00, 0x100);
        assert_eq!(fresh.endpoint_mark("cali1234").unwrap(), first);
    }

    #[test]
    fn non_contiguous_mask() {
        let mut mapper = HashEndpointMarkMapper::new(0b1010_0000, 0);
        let mut marks: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|iface| mapper.endpoint_mark(iface).unwrap())
            .collect();
        marks.sort();
        assert_eq!(marks, vec![0b0010_0000, 0b1000_0000, 0b1010_0000]);
        assert!(matches!(
            mapper.endpoint_mark("d"),
            Err(Error::EndpointMarksExhausted { .. })
        ));

        mapper.release("b");
        assert!(mapper.endpoint_mark("d").is_ok());
    }
}
