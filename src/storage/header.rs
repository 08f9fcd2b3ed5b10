//! On-disk chunk header
//!
//! Fixed-layout, little-endian record describing where one chunk version
//! lives and how it is encoded. Each header is stored in the descriptor
//! table followed by its coordinates and a CRC32:
//!
//! ```text
//! [storage_version u32][ds_guid u64][hdr_pos u64][offs u64][arr_id u64]
//! [att_id u32][compressed_size u64][size u64][compression i8][flags u8]
//! [n_coordinates u16][allocated_size u64][n_elems u32][instance_id u32]
//! [coords i64 x MAX_COORDINATES][crc32 u32]
//! ```

use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::address::{Coordinates, StorageAddress};
use super::compression::CompressionMethod;
use crate::error::{Error, Result};

/// Format version written into every header
pub const STORAGE_FORMAT_VERSION: u32 = 3;

/// Highest rank a stored chunk may have
pub const MAX_COORDINATES: usize = 8;

/// Size of the fixed part of a header
pub const CHUNK_HEADER_SIZE: usize = 76;

/// Size of one descriptor slot: header + coordinates + checksum
pub const DESCRIPTOR_SIZE: usize = CHUNK_HEADER_SIZE + MAX_COORDINATES * 8 + 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ChunkFlags: u8 {
        /// Cells are stored in a sparse encoding
        const SPARSE    = 0b0000_0001;
        /// Block is a delta chain rather than one materialized version
        const DELTA     = 0b0000_0010;
        /// Cells are run-length encoded
        const RLE       = 0b0000_0100;
        /// Slot deleted as of this version; carries no data
        const TOMBSTONE = 0b0000_1000;
    }
}

/// Where a chunk lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskPos {
    /// Data store guid; one store per unversioned array
    pub ds_guid: u64,
    /// Offset of the descriptor slot in the descriptor table
    pub hdr_pos: u64,
    /// Offset of the chunk block in the data store
    pub offs: u64,
}

/// Fixed part of a chunk descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub storage_version: u32,
    pub pos: DiskPos,
    /// Versioned array id; 0 marks a free descriptor slot
    pub arr_id: u64,
    pub att_id: u32,
    pub compressed_size: u64,
    /// Uncompressed block size
    pub size: u64,
    pub compression_method: i8,
    pub flags: ChunkFlags,
    pub n_coordinates: u16,
    /// Bytes reserved in the data store, `>= compressed_size`
    pub allocated_size: u64,
    /// Live elements in the newest version
    pub n_elems: u32,
    /// Instance that owns the chunk
    pub instance_id: u32,
}

impl ChunkHeader {
    /// Header for a new chunk version that has not been placed yet
    pub fn new(address: &StorageAddress, version: u64, instance_id: u32) -> Self {
        Self {
            storage_version: STORAGE_FORMAT_VERSION,
            pos: DiskPos {
                ds_guid: address.uaid,
                hdr_pos: 0,
                offs: 0,
            },
            arr_id: version,
            att_id: address.att_id,
            compressed_size: 0,
            size: 0,
            compression_method: CompressionMethod::None.tag(),
            flags: ChunkFlags::empty(),
            n_coordinates: address.coords.len() as u16,
            allocated_size: 0,
            n_elems: 0,
            instance_id,
        }
    }

    pub fn is(&self, flag: ChunkFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_tombstone(&self) -> bool {
        self.is(ChunkFlags::TOMBSTONE)
    }

    pub fn compression(&self) -> Result<CompressionMethod> {
        CompressionMethod::from_tag(self.compression_method)
    }

    /// Serialize the fixed part
    pub fn write_to(&self, out: &mut Vec<u8>) {
        // Writes into a Vec cannot fail
        let _ = self.write_fields(out);
    }

    fn write_fields(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(self.storage_version)?;
        out.write_u64::<LittleEndian>(self.pos.ds_guid)?;
        out.write_u64::<LittleEndian>(self.pos.hdr_pos)?;
        out.write_u64::<LittleEndian>(self.pos.offs)?;
        out.write_u64::<LittleEndian>(self.arr_id)?;
        out.write_u32::<LittleEndian>(self.att_id)?;
        out.write_u64::<LittleEndian>(self.compressed_size)?;
        out.write_u64::<LittleEndian>(self.size)?;
        out.write_i8(self.compression_method)?;
        out.write_u8(self.flags.bits())?;
        out.write_u16::<LittleEndian>(self.n_coordinates)?;
        out.write_u64::<LittleEndian>(self.allocated_size)?;
        out.write_u32::<LittleEndian>(self.n_elems)?;
        out.write_u32::<LittleEndian>(self.instance_id)?;
        Ok(())
    }

    /// Parse the fixed part
    pub fn read_from(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            storage_version: cur.read_u32::<LittleEndian>()?,
            pos: DiskPos {
                ds_guid: cur.read_u64::<LittleEndian>()?,
                hdr_pos: cur.read_u64::<LittleEndian>()?,
                offs: cur.read_u64::<LittleEndian>()?,
            },
            arr_id: cur.read_u64::<LittleEndian>()?,
            att_id: cur.read_u32::<LittleEndian>()?,
            compressed_size: cur.read_u64::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
            compression_method: cur.read_i8()?,
            flags: ChunkFlags::from_bits_truncate(cur.read_u8()?),
            n_coordinates: cur.read_u16::<LittleEndian>()?,
            allocated_size: cur.read_u64::<LittleEndian>()?,
            n_elems: cur.read_u32::<LittleEndian>()?,
            instance_id: cur.read_u32::<LittleEndian>()?,
        })
    }
}

/// A header plus the chunk's origin coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub header: ChunkHeader,
    pub coords: Coordinates,
}

impl ChunkDescriptor {
    pub fn address(&self) -> StorageAddress {
        StorageAddress::new(self.header.pos.ds_guid, self.header.att_id, self.coords.clone())
    }

    /// Whether this slot is unused
    pub fn is_free(&self) -> bool {
        self.header.arr_id == 0
    }

    /// Serialize into a full descriptor slot
    pub fn to_bytes(&self) -> Result<[u8; DESCRIPTOR_SIZE]> {
        if self.coords.len() > MAX_COORDINATES {
            return Err(Error::Internal(format!(
                "Chunk rank {} exceeds the supported maximum of {}",
                self.coords.len(),
                MAX_COORDINATES
            )));
        }

        let mut buf = Vec::with_capacity(DESCRIPTOR_SIZE);
        self.header.write_to(&mut buf);
        for i in 0..MAX_COORDINATES {
            let c = self.coords.get(i).copied().unwrap_or(0);
            buf.extend_from_slice(&c.to_le_bytes());
        }
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let mut bytes = [0u8; DESCRIPTOR_SIZE];
        bytes.copy_from_slice(&buf);
        Ok(bytes)
    }

    /// Parse a descriptor slot read from position `pos`
    pub fn from_bytes(bytes: &[u8], pos: u64) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_SIZE {
            return Err(Error::Corrupted {
                pos,
                reason: "descriptor slot too short".into(),
            });
        }

        let body = &bytes[..DESCRIPTOR_SIZE - 4];
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[DESCRIPTOR_SIZE - 4..DESCRIPTOR_SIZE]);
        if crc32fast::hash(body) != u32::from_le_bytes(crc) {
            return Err(Error::Corrupted {
                pos,
                reason: "checksum mismatch".into(),
            });
        }

        let mut cur = Cursor::new(body);
        let header = ChunkHeader::read_from(&mut cur)?;
        if header.storage_version != STORAGE_FORMAT_VERSION {
            return Err(Error::Corrupted {
                pos,
                reason: format!("unsupported storage version {}", header.storage_version),
            });
        }
        let rank = header.n_coordinates as usize;
        if rank > MAX_COORDINATES {
            return Err(Error::Corrupted {
                pos,
                reason: format!("rank {} out of range", rank),
            });
        }

        let mut coords = Vec::with_capacity(rank);
        for i in 0..MAX_COORDINATES {
            let c = cur.read_i64::<LittleEndian>()?;
            if i < rank {
                coords.push(c);
            }
        }

        Ok(Self { header, coords })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header_size() {
        let addr = StorageAddress::new(5, 1, vec![0, 10]);
        let mut buf = Vec::new();
        ChunkHeader::new(&addr, 3, 0).write_to(&mut buf);
        assert_eq!(buf.len(), CHUNK_HEADER_SIZE);
    }

    #[test]
    fn test_descriptor_bytes() {
        let addr = StorageAddress::new(5, 1, vec![-10, 20, 30]);
        let mut header = ChunkHeader::new(&addr, 9, 2);
        header.flags = ChunkFlags::DELTA | ChunkFlags::SPARSE;
        header.pos.offs = 4096;
        header.size = 800;
        header.compressed_size = 120;
        header.allocated_size = 128;
        let desc = ChunkDescriptor {
            header,
            coords: addr.coords.clone(),
        };

        let bytes = desc.to_bytes().unwrap();
        let parsed = ChunkDescriptor::from_bytes(&bytes, 0).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.address(), addr);
        assert!(parsed.header.is(ChunkFlags::DELTA));
        assert!(!parsed.header.is_tombstone());
    }

    #[test]
    fn test_checksum_detects_damage() {
        let addr = StorageAddress::new(5, 0, vec![0]);
        let desc = ChunkDescriptor {
            header: ChunkHeader::new(&addr, 1, 0),
            coords: addr.coords.clone(),
        };
        let mut bytes = desc.to_bytes().unwrap();
        bytes[30] ^= 0xFF;
        assert!(matches!(
            ChunkDescriptor::from_bytes(&bytes, 144),
            Err(Error::Corrupted { pos: 144, .. })
        ));
    }

    #[test]
    fn test_rank_limit() {
        let coords = vec![0; MAX_COORDINATES + 1];
        let addr = StorageAddress::new(1, 0, coords.clone());
        let desc = ChunkDescriptor {
            header: ChunkHeader::new(&addr, 1, 0),
            coords,
        };
        assert!(desc.to_bytes().is_err());
    }
}
