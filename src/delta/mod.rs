//! Chunk version deltas
//!
//! Encodes successive versions of a chunk as differences, packs them into
//! delta blocks and replays blocks to rebuild historical versions.

pub mod binary_diff;
pub mod block;
pub mod chunk_delta;
pub mod version;

pub use block::{BlockEntry, DeltaBlock, DeltaRecord};
pub use chunk_delta::{ChunkBuffer, DeltaStrategy, Encoded};
pub use version::{get_version, new_version, DeltaOutcome, NewVersion};
