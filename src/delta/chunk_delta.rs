//! Chunk delta encoding
//!
//! A delta reconstructs a *target* chunk buffer from a *source* buffer.
//! Two strategies are available and every package starts with a tag byte
//! naming the one that produced it:
//!
//! - **Subtractive** (`0x00`): both buffers are dense arrays of the same
//!   fixed-width integer cells. Each cell stores `target - source`,
//!   wrapping in the element width and read back sign-extended. A single
//!   dense width is chosen for the whole chunk; differences that do not fit
//!   it are moved to a sparse side array tagged with cell coordinates.
//!
//!   ```text
//!   [0x00][sparse_len: u64][dense_len: u64][dense_bit_width: u8]
//!   [sparse: (coords i64 x rank, diff: elem bytes)*][dense: diff x cells]
//!   ```
//!
//! - **Binary diff** (`0xFF`): the buffers are opaque bytes and the payload
//!   is a copy/insert patch (see [`binary_diff`](super::binary_diff)).
//!
//! A delta is only worth keeping when the whole package is strictly smaller
//! than the target it rebuilds.

use crate::error::{Error, Result};
use crate::schema::ElementType;
use crate::storage::ChunkGeometry;

use super::binary_diff;

/// Leading byte of a subtractive package
pub const SUBTRACTIVE_TAG: u8 = 0x00;

/// Leading byte of a binary-diff package
pub const BINARY_DIFF_TAG: u8 = 0xFF;

/// Tag plus the subtractive header fields
const SUBTRACTIVE_HEADER_SIZE: usize = 1 + 8 + 8 + 1;

/// One chunk version handed to the delta engine
#[derive(Debug, Clone, Copy)]
pub struct ChunkBuffer<'a> {
    pub data: &'a [u8],
    pub element: ElementType,
    pub sparse: bool,
    pub rle: bool,
}

impl<'a> ChunkBuffer<'a> {
    /// Plain dense buffer
    pub fn dense(data: &'a [u8], element: ElementType) -> Self {
        Self {
            data,
            element,
            sparse: false,
            rle: false,
        }
    }

    /// Element width when the buffer is a dense array of 1, 2, 4 or 8 byte cells
    /// covering every cell of `geom`
    fn dense_width(&self, geom: &ChunkGeometry) -> Option<usize> {
        if self.sparse || self.rle {
            return None;
        }
        let width = self.element.fixed_width()?;
        if !matches!(width, 1 | 2 | 4 | 8) {
            return None;
        }
        let cells = geom.cell_count() as usize;
        (cells > 0 && self.data.len() == cells * width).then_some(width)
    }
}

/// How a delta gets built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaStrategy {
    /// Cell-wise subtraction on elements of this byte width
    Subtractive { element_width: usize },
    /// Opaque copy/insert patch
    BinaryDiff,
}

/// Result of an encode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Package that rebuilds the target from the source
    Delta(Vec<u8>),
    /// The package would not be smaller than the target
    NotWorthwhile,
}

/// Pick the strategy for a (source, target) pair
pub fn choose_strategy(source: &ChunkBuffer, target: &ChunkBuffer, geom: &ChunkGeometry) -> DeltaStrategy {
    match (source.dense_width(geom), target.dense_width(geom)) {
        (Some(a), Some(b)) if a == b => DeltaStrategy::Subtractive { element_width: a },
        _ => DeltaStrategy::BinaryDiff,
    }
}

/// Encode a delta that rebuilds `target` from `source`
pub fn encode(source: &ChunkBuffer, target: &ChunkBuffer, geom: &ChunkGeometry) -> Result<Encoded> {
    let package = match choose_strategy(source, target, geom) {
        DeltaStrategy::Subtractive { element_width } => {
            encode_subtractive(source.data, target.data, element_width, geom)
        }
        DeltaStrategy::BinaryDiff => {
            let mut package = vec![BINARY_DIFF_TAG];
            package.extend_from_slice(&binary_diff::diff(source.data, target.data));
            package
        }
    };

    if package.len() >= target.data.len() {
        return Ok(Encoded::NotWorthwhile);
    }
    Ok(Encoded::Delta(package))
}

/// Rebuild the target of `package` from `source`
pub fn apply(source: &[u8], package: &[u8], geom: &ChunkGeometry) -> Result<Vec<u8>> {
    match package.first() {
        Some(&SUBTRACTIVE_TAG) => apply_subtractive(source, package, geom),
        Some(&BINARY_DIFF_TAG) => binary_diff::patch(source, &package[1..]),
        Some(other) => Err(Error::InvalidDelta(format!("unknown delta tag {:#04x}", other))),
        None => Err(Error::InvalidDelta("empty delta package".into())),
    }
}

fn read_cell(bytes: &[u8], width: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&bytes[..width]);
    u64::from_le_bytes(buf)
}

fn write_cell(out: &mut [u8], width: usize, value: u64) {
    out[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

/// Interpret the low `width` bytes of `v` as a signed integer
fn sign_extend(v: u64, width: usize) -> i64 {
    if width == 0 {
        return 0;
    }
    let shift = 64 - 8 * width as u32;
    ((v << shift) as i64) >> shift
}

/// Smallest byte width (0..=8) holding `v`
fn min_width(v: i64) -> usize {
    if v == 0 {
        return 0;
    }
    (1..8)
        .find(|&w| {
            let bound = 1i64 << (8 * w - 1);
            (-bound..bound).contains(&v)
        })
        .unwrap_or(8)
}

/// Dense width minimizing `width * cells + outliers * record_size`.
/// Ties go to the narrower width.
fn optimal_width(histogram: &[u64], cells: u64, record_size: u64) -> usize {
    let mut best = (u64::MAX, 0usize);
    for width in 0..histogram.len() {
        let outliers: u64 = histogram[width + 1..].iter().sum();
        let cost = width as u64 * cells + outliers * record_size;
        if cost < best.0 {
            best = (cost, width);
        }
    }
    best.1
}

fn encode_subtractive(source: &[u8], target: &[u8], width: usize, geom: &ChunkGeometry) -> Vec<u8> {
    let cells = source.len() / width;
    let mask = if width == 8 { u64::MAX } else { (1u64 << (8 * width)) - 1 };

    let diffs: Vec<i64> = (0..cells)
        .map(|i| {
            let s = read_cell(&source[i * width..], width);
            let t = read_cell(&target[i * width..], width);
            sign_extend(t.wrapping_sub(s) & mask, width)
        })
        .collect();

    // Widths above the element width never beat the element width itself
    let mut histogram = vec![0u64; width + 1];
    for &d in &diffs {
        histogram[min_width(d).min(width)] += 1;
    }
    let rank = geom.first_overlap.len();
    let record_size = (rank * 8 + width) as u64;
    let dense_width = optimal_width(&histogram, cells as u64, record_size);

    let mut sparse = Vec::new();
    let mut dense = vec![0u8; cells * dense_width];
    for (i, &d) in diffs.iter().enumerate() {
        if min_width(d) <= dense_width {
            write_cell(&mut dense[i * dense_width..], dense_width, d as u64);
        } else {
            for c in geom.coords_of(i as u64) {
                sparse.extend_from_slice(&c.to_le_bytes());
            }
            let mut cell = [0u8; 8];
            write_cell(&mut cell, width, d as u64);
            sparse.extend_from_slice(&cell[..width]);
        }
    }

    let mut package = Vec::with_capacity(SUBTRACTIVE_HEADER_SIZE + sparse.len() + dense.len());
    package.push(SUBTRACTIVE_TAG);
    package.extend_from_slice(&(sparse.len() as u64).to_le_bytes());
    package.extend_from_slice(&(dense.len() as u64).to_le_bytes());
    package.push((dense_width * 8) as u8);
    package.extend_from_slice(&sparse);
    package.extend_from_slice(&dense);
    package
}

fn apply_subtractive(source: &[u8], package: &[u8], geom: &ChunkGeometry) -> Result<Vec<u8>> {
    if package.len() < SUBTRACTIVE_HEADER_SIZE {
        return Err(Error::InvalidDelta("subtractive header truncated".into()));
    }
    let mut quad = [0u8; 8];
    quad.copy_from_slice(&package[1..9]);
    let sparse_len = u64::from_le_bytes(quad) as usize;
    quad.copy_from_slice(&package[9..17]);
    let dense_len = u64::from_le_bytes(quad) as usize;
    let bits = package[17] as usize;
    if bits % 8 != 0 || bits > 64 {
        return Err(Error::InvalidDelta(format!("bad dense bit width {}", bits)));
    }
    let dense_width = bits / 8;

    let body = &package[SUBTRACTIVE_HEADER_SIZE..];
    if sparse_len.checked_add(dense_len) != Some(body.len()) {
        return Err(Error::InvalidDelta(format!(
            "delta body is {} bytes, header claims {} + {}",
            body.len(),
            sparse_len,
            dense_len
        )));
    }

    let cells = geom.cell_count() as usize;
    if cells == 0 || source.len() % cells != 0 {
        return Err(Error::InvalidDelta("source does not match chunk geometry".into()));
    }
    let width = source.len() / cells;
    if !matches!(width, 1 | 2 | 4 | 8) || dense_width > width || dense_len != cells * dense_width {
        return Err(Error::InvalidDelta(format!(
            "dense section of {} bytes does not fit {} cells of width {}",
            dense_len, cells, width
        )));
    }

    let (sparse, dense) = body.split_at(sparse_len);
    let mut out = source.to_vec();

    if dense_width > 0 {
        for i in 0..cells {
            let d = sign_extend(read_cell(&dense[i * dense_width..], dense_width), dense_width);
            let s = read_cell(&out[i * width..], width);
            write_cell(&mut out[i * width..], width, s.wrapping_add(d as u64));
        }
    }

    let rank = geom.first_overlap.len();
    let record_size = rank * 8 + width;
    if sparse.len() % record_size != 0 {
        return Err(Error::InvalidDelta("sparse section truncated".into()));
    }
    for record in sparse.chunks_exact(record_size) {
        let coords: Vec<i64> = record[..rank * 8]
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                i64::from_le_bytes(b)
            })
            .collect();
        let index = geom.index_of(&coords).ok_or_else(|| {
            Error::InvalidDelta(format!("sparse cell {:?} outside the chunk", coords))
        })? as usize;
        let d = read_cell(&record[rank * 8..], width);
        let s = read_cell(&out[index * width..], width);
        write_cell(&mut out[index * width..], width, s.wrapping_add(d));
    }

    Ok(out)
}
