//! Chunk addressing and geometry

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::ArrayDesc;

/// Cell coordinates, one entry per dimension
pub type Coordinates = Vec<i64>;

/// Identifies a chunk slot: (unversioned array, attribute, chunk origin).
///
/// Ordering is by array, then attribute, then coordinates, so one array's
/// chunks for one attribute are contiguous in the chunk map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageAddress {
    pub uaid: u64,
    pub att_id: u32,
    pub coords: Coordinates,
}

impl StorageAddress {
    pub fn new(uaid: u64, att_id: u32, coords: Coordinates) -> Self {
        Self { uaid, att_id, coords }
    }

    /// Hash of the coordinates alone, used for instance placement
    pub fn coordinate_hash(&self) -> u64 {
        // FNV-1a over the little-endian coordinate bytes
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for c in &self.coords {
            for b in c.to_le_bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x0100_0000_01b3);
            }
        }
        h
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array {} attr {} at {:?}", self.uaid, self.att_id, self.coords)
    }
}

/// Bounding box of one chunk, with and without the overlap region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub first: Coordinates,
    pub last: Coordinates,
    pub first_overlap: Coordinates,
    pub last_overlap: Coordinates,
}

impl ChunkGeometry {
    /// Geometry of the chunk whose origin is `origin`
    pub fn new(desc: &ArrayDesc, origin: &[i64]) -> Self {
        let mut geom = ChunkGeometry {
            first: Vec::with_capacity(origin.len()),
            last: Vec::with_capacity(origin.len()),
            first_overlap: Vec::with_capacity(origin.len()),
            last_overlap: Vec::with_capacity(origin.len()),
        };
        for (&o, d) in origin.iter().zip(&desc.dimensions) {
            let last = (o + d.chunk_interval - 1).min(d.end);
            geom.first.push(o);
            geom.last.push(last);
            geom.first_overlap.push((o - d.overlap).max(d.start));
            geom.last_overlap.push((last + d.overlap).min(d.end));
        }
        geom
    }

    fn extents(&self) -> impl Iterator<Item = u64> + '_ {
        self.first_overlap
            .iter()
            .zip(&self.last_overlap)
            .map(|(f, l)| (l - f + 1).max(0) as u64)
    }

    /// Cells in the overlap-inclusive box; this is the dense buffer length
    pub fn cell_count(&self) -> u64 {
        self.extents().product()
    }

    /// Row-major coordinates of the `index`-th cell of the overlap box
    pub fn coords_of(&self, mut index: u64) -> Coordinates {
        let extents: Vec<u64> = self.extents().collect();
        let mut coords = vec![0i64; extents.len()];
        for d in (0..extents.len()).rev() {
            let e = extents[d].max(1);
            coords[d] = self.first_overlap[d] + (index % e) as i64;
            index /= e;
        }
        coords
    }

    /// Row-major index of `coords` within the overlap box
    pub fn index_of(&self, coords: &[i64]) -> Option<u64> {
        if coords.len() != self.first_overlap.len() {
            return None;
        }
        let mut index = 0u64;
        for (d, e) in self.extents().enumerate() {
            let c = coords[d];
            if c < self.first_overlap[d] || c > self.last_overlap[d] {
                return None;
            }
            index = index * e + (c - self.first_overlap[d]) as u64;
        }
        Some(index)
    }
}
