//! Array schema
//!
//! Descriptors handed to the engine by the catalog. The engine never
//! creates or persists these itself; it only uses them to work out chunk
//! geometry, element widths and default compression.

use serde::{Deserialize, Serialize};

use crate::storage::{CompressionMethod, Coordinates};

/// Physical encoding of one attribute's cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    /// Fixed-width cells of the given byte size
    Fixed(u8),
    /// Variable-width cells (strings, blobs)
    Variable,
}

impl ElementType {
    /// Byte width for fixed-size types
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ElementType::Fixed(w) => Some(*w as usize),
            ElementType::Variable => None,
        }
    }

    /// Stable tag stored in delta block headers
    pub fn type_signature(&self) -> u32 {
        match self {
            ElementType::Fixed(w) => *w as u32,
            ElementType::Variable => u32::MAX,
        }
    }
}

/// One dimension of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDesc {
    pub name: String,
    /// First valid coordinate
    pub start: i64,
    /// Last valid coordinate (inclusive)
    pub end: i64,
    /// Chunk length along this dimension
    pub chunk_interval: i64,
    /// Cells borrowed from each neighbouring chunk
    pub overlap: i64,
}

impl DimensionDesc {
    pub fn new(name: &str, start: i64, end: i64, chunk_interval: i64) -> Self {
        Self {
            name: name.to_string(),
            start,
            end,
            chunk_interval,
            overlap: 0,
        }
    }

    pub fn with_overlap(mut self, overlap: i64) -> Self {
        self.overlap = overlap;
        self
    }
}

/// One attribute of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDesc {
    pub id: u32,
    pub name: String,
    pub element_type: ElementType,
    /// Overrides the configured compression for this attribute
    pub compression: Option<CompressionMethod>,
}

impl AttributeDesc {
    pub fn new(id: u32, name: &str, element_type: ElementType) -> Self {
        Self {
            id,
            name: name.to_string(),
            element_type,
            compression: None,
        }
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = Some(compression);
        self
    }
}

/// Array descriptor as supplied by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDesc {
    /// Unversioned array id
    pub uaid: u64,
    pub name: String,
    pub dimensions: Vec<DimensionDesc>,
    pub attributes: Vec<AttributeDesc>,
}

impl ArrayDesc {
    pub fn new(uaid: u64, name: &str, dimensions: Vec<DimensionDesc>, attributes: Vec<AttributeDesc>) -> Self {
        Self {
            uaid,
            name: name.to_string(),
            dimensions,
            attributes,
        }
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Look up an attribute by id
    pub fn attribute(&self, att_id: u32) -> Option<&AttributeDesc> {
        self.attributes.iter().find(|a| a.id == att_id)
    }

    /// Origin of the chunk containing `coords`
    pub fn chunk_origin(&self, coords: &[i64]) -> Coordinates {
        coords
            .iter()
            .zip(&self.dimensions)
            .map(|(&c, d)| {
                let interval = d.chunk_interval.max(1);
                d.start + (c - d.start).div_euclid(interval) * interval
            })
            .collect()
    }
}
