//! Delta block layout
//!
//! A chunk that has accumulated versions is stored as one block holding
//! the newest version materialized, followed by reverse deltas that each
//! rebuild the next older version from the one before it. Per-version
//! headers live in a trailer at the end of the block, written backwards
//! from the block header so that the first record sits closest to it:
//!
//! ```text
//! [v_newest bytes][delta -> v_n-1]...[delta -> v_oldest]
//! [record n-1]...[record 1][record 0][num_chunks: u64][type_signature: u32]
//! record = [version: u64][end: u64][sparse: u8][rle: u8]
//! ```
//!
//! `end` is the offset one past a record's bytes, so record `i` spans
//! `end[i-1]..end[i]` (record 0 starts at 0). Versions strictly decrease
//! with the record index.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Size of one per-version record in the trailer
pub const RECORD_SIZE: usize = 18;

/// Size of the block header at the very end
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Trailer entry describing one stored version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRecord {
    pub version: u64,
    pub end: u64,
    pub sparse: bool,
    pub rle: bool,
}

impl DeltaRecord {
    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.end.to_le_bytes());
        bytes[16] = self.sparse as u8;
        bytes[17] = self.rle as u8;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut v = [0u8; 8];
        let mut e = [0u8; 8];
        v.copy_from_slice(&bytes[0..8]);
        e.copy_from_slice(&bytes[8..16]);
        Self {
            version: u64::from_le_bytes(v),
            end: u64::from_le_bytes(e),
            sparse: bytes[16] != 0,
            rle: bytes[17] != 0,
        }
    }
}

/// Payload of one version as handed to [`DeltaBlock::assemble`]
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub version: u64,
    pub sparse: bool,
    pub rle: bool,
    /// Materialized bytes for the first entry, a delta package otherwise
    pub bytes: Bytes,
}

/// Parsed view over a delta block
#[derive(Debug, Clone)]
pub struct DeltaBlock {
    data: Bytes,
    records: Vec<DeltaRecord>,
    type_signature: u32,
}

impl DeltaBlock {
    /// Parse a stored block
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(Error::InvalidDelta("delta block shorter than its header".into()));
        }
        let hdr = &data[data.len() - BLOCK_HEADER_SIZE..];
        let mut n = [0u8; 8];
        let mut t = [0u8; 4];
        n.copy_from_slice(&hdr[0..8]);
        t.copy_from_slice(&hdr[8..12]);
        let num_chunks = u64::from_le_bytes(n) as usize;
        let type_signature = u32::from_le_bytes(t);

        let trailer = num_chunks
            .checked_mul(RECORD_SIZE)
            .and_then(|r| r.checked_add(BLOCK_HEADER_SIZE))
            .filter(|&len| len <= data.len() && num_chunks > 0)
            .ok_or_else(|| Error::InvalidDelta(format!("delta block claims {} versions", num_chunks)))?;
        let body_len = (data.len() - trailer) as u64;

        let trailer_end = data.len() - BLOCK_HEADER_SIZE;
        let mut records = Vec::with_capacity(num_chunks);
        let mut prev_end = 0u64;
        for i in 0..num_chunks {
            let at = trailer_end - (i + 1) * RECORD_SIZE;
            let record = DeltaRecord::from_bytes(&data[at..at + RECORD_SIZE]);
            if record.end < prev_end || record.end > body_len {
                return Err(Error::InvalidDelta(format!(
                    "record {} ends at {} outside {}..{}",
                    i, record.end, prev_end, body_len
                )));
            }
            if let Some(last) = records.last() {
                let last: &DeltaRecord = last;
                if record.version >= last.version {
                    return Err(Error::InvalidDelta("delta block versions out of order".into()));
                }
            }
            prev_end = record.end;
            records.push(record);
        }

        Ok(Self {
            data,
            records,
            type_signature,
        })
    }

    /// Build a block from entries ordered newest first
    pub fn assemble(entries: &[BlockEntry], type_signature: u32) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Internal("delta block needs at least one version".into()));
        }
        let body: usize = entries.iter().map(|e| e.bytes.len()).sum();
        let mut out = Vec::with_capacity(body + entries.len() * RECORD_SIZE + BLOCK_HEADER_SIZE);

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(last) = records.last() {
                let last: &DeltaRecord = last;
                if entry.version >= last.version {
                    return Err(Error::Internal(format!(
                        "version {} is not older than {}",
                        entry.version, last.version
                    )));
                }
            }
            out.extend_from_slice(&entry.bytes);
            records.push(DeltaRecord {
                version: entry.version,
                end: out.len() as u64,
                sparse: entry.sparse,
                rle: entry.rle,
            });
        }
        for record in records.iter().rev() {
            out.extend_from_slice(&record.to_bytes());
        }
        out.extend_from_slice(&(records.len() as u64).to_le_bytes());
        out.extend_from_slice(&type_signature.to_le_bytes());

        Ok(Self {
            data: Bytes::from(out),
            records,
            type_signature,
        })
    }

    /// Whole encoded block
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn type_signature(&self) -> u32 {
        self.type_signature
    }

    pub fn num_versions(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, index: usize) -> Option<&DeltaRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[DeltaRecord] {
        &self.records
    }

    /// Versions held, newest first
    pub fn versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.iter().map(|r| r.version)
    }

    pub fn newest_version(&self) -> u64 {
        self.records[0].version
    }

    pub fn oldest_version(&self) -> u64 {
        self.records[self.records.len() - 1].version
    }

    /// Index of the newest stored version not after `version`
    pub fn index_at_or_before(&self, version: u64) -> Option<usize> {
        let idx = self.records.partition_point(|r| r.version > version);
        (idx < self.records.len()).then_some(idx)
    }

    /// Bytes of record `index` (materialized for 0, a delta otherwise)
    pub fn chunk_bytes(&self, index: usize) -> Bytes {
        let start = if index == 0 { 0 } else { self.records[index - 1].end as usize };
        let end = self.records[index].end as usize;
        self.data.slice(start..end)
    }

    /// Newest version, materialized
    pub fn head(&self) -> Bytes {
        self.chunk_bytes(0)
    }

    /// Entries newest first, ready to be reassembled
    pub fn entries(&self) -> Vec<BlockEntry> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| BlockEntry {
                version: r.version,
                sparse: r.sparse,
                rle: r.rle,
                bytes: self.chunk_bytes(i),
            })
            .collect()
    }
}
