//! Chunk block compression

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression method recorded in each chunk header (one byte on disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    Lz4,
}

impl CompressionMethod {
    /// On-disk tag
    pub fn tag(&self) -> i8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: i8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Lz4),
            other => Err(Error::DataStore(format!("Unknown compression tag {}", other))),
        }
    }

    /// Compress `data`. Returns `None` when compression would not shrink
    /// it, in which case the caller stores the block raw.
    pub fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            CompressionMethod::None => None,
            CompressionMethod::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(data);
                (compressed.len() < data.len()).then_some(compressed)
            }
        }
    }

    /// Undo [`compress`](Self::compress). Blocks stored raw are passed
    /// through untouched: on disk that is `compressed == uncompressed` size.
    pub fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        if data.len() == uncompressed_size {
            return Ok(data.to_vec());
        }
        match self {
            CompressionMethod::None => Err(Error::DataStore(format!(
                "Raw block is {} bytes, header says {}",
                data.len(),
                uncompressed_size
            ))),
            CompressionMethod::Lz4 => {
                let out = lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| Error::DataStore(format!("Decompression failed: {}", e)))?;
                if out.len() != uncompressed_size {
                    return Err(Error::DataStore(format!(
                        "Decompressed {} bytes, header says {}",
                        out.len(),
                        uncompressed_size
                    )));
                }
                Ok(out)
            }
        }
    }
}
