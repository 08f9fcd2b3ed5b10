//! Version control over delta blocks
//!
//! Only reverse ordering is implemented: the newest version is always the
//! materialized head and each new version rewrites the whole block. Reads
//! of the current version are free, reads of older versions replay
//! `index` deltas, and a write costs one delta encode plus a block rewrite
//! proportional to the block size.

use bytes::Bytes;
use tracing::trace;

use super::block::{BlockEntry, DeltaBlock};
use super::chunk_delta::{self, ChunkBuffer, Encoded};
use crate::error::{Error, Result};
use crate::schema::ElementType;
use crate::storage::ChunkGeometry;

/// A new chunk version before it is stored
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub version: u64,
    pub data: Bytes,
    pub sparse: bool,
    pub rle: bool,
}

/// Decision for how to store a new version
#[derive(Debug, Clone)]
pub enum DeltaOutcome {
    /// Store this block, which holds the new version plus history
    Delta(DeltaBlock),
    /// Store the new version on its own
    Materialize,
}

/// Wrap a single materialized version as a one-record block
pub fn single(version: &NewVersion, element: ElementType) -> Result<DeltaBlock> {
    DeltaBlock::assemble(
        &[BlockEntry {
            version: version.version,
            sparse: version.sparse,
            rle: version.rle,
            bytes: version.data.clone(),
        }],
        element.type_signature(),
    )
}

/// Reconstruct the newest stored version that is not after `version`
pub fn get_version(block: &DeltaBlock, version: u64, geom: &ChunkGeometry) -> Result<Bytes> {
    let index = block.index_at_or_before(version).ok_or_else(|| {
        Error::InvalidDelta(format!(
            "version {} predates the oldest stored version {}",
            version,
            block.oldest_version()
        ))
    })?;
    if index == 0 {
        return Ok(block.head());
    }

    trace!("Replaying {} deltas to reach version {}", index, version);
    let mut acc = block.head().to_vec();
    for i in 1..=index {
        acc = chunk_delta::apply(&acc, &block.chunk_bytes(i), geom)?;
    }
    Ok(Bytes::from(acc))
}

/// Decide how to store `new` on top of `block`.
///
/// The new version becomes the head; the old head is kept as a delta that
/// rebuilds it from the new one. When that delta is not smaller than the
/// old head, or the element types differ, the caller stores `new` on its
/// own instead.
pub fn new_version(
    block: &DeltaBlock,
    new: &NewVersion,
    element: ElementType,
    geom: &ChunkGeometry,
) -> Result<DeltaOutcome> {
    if new.version <= block.newest_version() {
        return Err(Error::ChunkExists(format!(
            "version {} is not newer than stored version {}",
            new.version,
            block.newest_version()
        )));
    }
    if block.type_signature() != element.type_signature() {
        return Ok(DeltaOutcome::Materialize);
    }

    let old_head = block.head();
    let head_record = block.records()[0];
    let source = ChunkBuffer {
        data: &new.data,
        element,
        sparse: new.sparse,
        rle: new.rle,
    };
    let target = ChunkBuffer {
        data: &old_head,
        element,
        sparse: head_record.sparse,
        rle: head_record.rle,
    };

    let package = match chunk_delta::encode(&source, &target, geom)? {
        Encoded::Delta(package) => package,
        Encoded::NotWorthwhile => return Ok(DeltaOutcome::Materialize),
    };

    let mut entries = Vec::with_capacity(block.num_versions() + 1);
    entries.push(BlockEntry {
        version: new.version,
        sparse: new.sparse,
        rle: new.rle,
        bytes: new.data.clone(),
    });
    entries.push(BlockEntry {
        version: head_record.version,
        sparse: head_record.sparse,
        rle: head_record.rle,
        bytes: Bytes::from(package),
    });
    entries.extend(block.entries().into_iter().skip(1));

    Ok(DeltaOutcome::Delta(DeltaBlock::assemble(
        &entries,
        element.type_signature(),
    )?))
}
