//! Replication Protocol
//!
//! Payloads shipped to replica instances. The chunk block travels exactly
//! as it is stored on the primary (compressed, possibly a delta block) so
//! the replica can persist it without re-encoding.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::{ChunkFlags, StorageAddress};

/// Protocol messages for chunk replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMessage {
    /// A stored chunk version
    Chunk {
        address: StorageAddress,
        version: u64,
        /// Instance that wrote the chunk
        source_instance: u32,
        compression: i8,
        flags: ChunkFlags,
        /// Uncompressed block size
        size: u64,
        n_elems: u32,
        /// Block carries the previous version's history and replaces it
        supersedes_prior: bool,
        data: Vec<u8>,
    },

    /// A slot deleted as of `version`
    Tombstone {
        address: StorageAddress,
        version: u64,
        source_instance: u32,
    },
}

impl ReplicaMessage {
    pub fn address(&self) -> &StorageAddress {
        match self {
            ReplicaMessage::Chunk { address, .. } | ReplicaMessage::Tombstone { address, .. } => address,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            ReplicaMessage::Chunk { version, .. } | ReplicaMessage::Tombstone { version, .. } => *version,
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_bytes() {
        let msg = ReplicaMessage::Chunk {
            address: StorageAddress::new(4, 1, vec![10, 20]),
            version: 6,
            source_instance: 0,
            compression: 1,
            flags: ChunkFlags::DELTA,
            size: 900,
            n_elems: 100,
            supersedes_prior: true,
            data: vec![1, 2, 3, 4],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ReplicaMessage::from_bytes(&bytes).unwrap(), msg);
        assert_eq!(msg.version(), 6);

        let tomb = ReplicaMessage::Tombstone {
            address: StorageAddress::new(4, 1, vec![10, 20]),
            version: 7,
            source_instance: 0,
        };
        let parsed = ReplicaMessage::from_bytes(&tomb.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.address(), tomb.address());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ReplicaMessage::from_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }
}
