//! Instance placement
//!
//! Maps a chunk to its primary instance and to the peers that hold its
//! replicas. Placement only depends on the chunk coordinates and the
//! cluster size, so every instance computes the same answer.

use crate::storage::StorageAddress;

/// 2^64 / golden ratio
const FIB_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

fn fib_hash(key: u64) -> u64 {
    key.wrapping_mul(FIB_MULTIPLIER) >> 32
}

/// Placement for a fixed-size cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    instances: u32,
    redundancy: u32,
}

impl Placement {
    pub fn new(instances: u32, redundancy: u32) -> Self {
        Self {
            instances: instances.max(1),
            redundancy: redundancy.min(instances.saturating_sub(1)),
        }
    }

    pub fn redundancy(&self) -> u32 {
        self.redundancy
    }

    /// Instance that owns `address`
    pub fn primary(&self, address: &StorageAddress) -> u32 {
        (address.coordinate_hash() % self.instances as u64) as u32
    }

    /// Distinct peers, other than `owner`, that receive replicas
    pub fn replicas(&self, address: &StorageAddress, owner: u32) -> Vec<u32> {
        let n = self.instances as u64;
        let hash = address.coordinate_hash();
        let mut chosen: Vec<u32> = Vec::with_capacity(self.redundancy as usize);

        for i in 1..=self.redundancy as u64 {
            let mut candidate = (fib_hash(hash.wrapping_add(i)) % n) as u32;
            // Probe past the owner and peers already picked
            while candidate == owner || chosen.contains(&candidate) {
                candidate = ((candidate as u64 + 1) % n) as u32;
            }
            chosen.push(candidate);
        }
        chosen
    }
}
