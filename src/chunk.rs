use serde::{Deserialize, Serialize};

use crate::storage::{Endian, Segment};

/// Where the stored bytes of a chunk live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkLocation {
    /// One contiguous block starting at this file address.
    Address(u64),
    /// A byte stream split across linked blocks (legacy dialect).
    Linked(Vec<Segment>),
    /// Never written; read as fill.
    Missing,
}

/// One chunk as resolved by a [ChunkIndex](crate::index::ChunkIndex).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    pub(crate) origin: Vec<u64>,
    pub(crate) size: u64,
    pub(crate) filter_mask: u32,
    pub(crate) location: ChunkLocation,
    pub(crate) legacy: Option<LegacyCompression>,
}

impl ChunkEntry {
    pub fn new(origin: Vec<u64>, size: u64, filter_mask: u32, address: u64) -> Self {
        Self {
            origin,
            size,
            filter_mask,
            location: ChunkLocation::Address(address),
            legacy: None,
        }
    }

    /// A stand-in for a tile with no stored chunk.
    pub fn missing(origin: Vec<u64>) -> Self {
        Self {
            origin,
            size: 0,
            filter_mask: 0,
            location: ChunkLocation::Missing,
            legacy: None,
        }
    }

    /// A chunk of the legacy dialect, which carries its own compression header.
    pub fn legacy(
        origin: Vec<u64>,
        location: ChunkLocation,
        compression: LegacyCompression,
    ) -> Self {
        let size = match &location {
            ChunkLocation::Linked(segments) => segments.iter().map(|s| s.length).sum(),
            _ => 0,
        };
        Self {
            origin,
            size,
            filter_mask: 0,
            location,
            legacy: Some(compression),
        }
    }

    pub(crate) fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Element-space coordinate of the chunk's first element.
    pub fn origin(&self) -> &[u64] {
        &self.origin
    }

    /// Stored (filtered) byte length.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn filter_mask(&self) -> u32 {
        self.filter_mask
    }

    pub fn location(&self) -> &ChunkLocation {
        &self.location
    }

    pub fn legacy_compression(&self) -> Option<&LegacyCompression> {
        self.legacy.as_ref()
    }

    pub fn is_missing(&self) -> bool {
        matches!(self.location, ChunkLocation::Missing)
    }

    /// Whether the filter at pipeline position `idx` was not applied to this chunk.
    pub fn is_filter_skipped(&self, idx: usize) -> bool {
        idx < 32 && (self.filter_mask >> idx) & 1 == 1
    }
}

/// Per-chunk compression of the legacy (HDF4) dialect.
///
/// Unlike the variable-wide filter list, every chunk records this in its own storage header.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum LegacyCompression {
    /// Stored as-is.
    #[default]
    Raw,
    #[serde(rename_all = "camelCase")]
    Deflate {
        /// Informational; decoding does not depend on it.
        #[serde(default = "default_deflate_level")]
        level: u16,
        uncompressed_length: u64,
    },
    #[serde(rename_all = "camelCase")]
    NBit {
        uncompressed_length: u64,
        params: NBitParams,
    },
    /// A compression code this reader does not decode (RLE, Huffman, szip...).
    Other { code: u16 },
}

fn default_deflate_level() -> u16 {
    6
}

/// Parameters of n-bit packing: each element keeps `bit_length` bits ending at `start_bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NBitParams {
    /// Width in bytes of an unpacked element.
    pub element_size: u8,
    /// Fill the bits above the field with the field's top bit.
    pub sign_extend: bool,
    /// Fill bits outside the field with ones instead of zeros.
    pub fill_one: bool,
    /// Highest bit of the field, counting from 0 at the least significant bit.
    pub start_bit: u32,
    pub bit_length: u32,
}

const COMP_CODE_NONE: u16 = 0;
const COMP_CODE_NBIT: u16 = 2;
const COMP_CODE_DEFLATE: u16 = 4;

/// The compressed-element header stored in front of a legacy chunk's data description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyChunkHeader {
    pub version: u16,
    /// Reference number of the data element holding the compressed bytes.
    pub data_ref: u16,
    pub compression: LegacyCompression,
}

impl LegacyChunkHeader {
    /// Parse a big-endian compressed-element header.
    ///
    /// `element_size` is the unpacked element width, needed to describe n-bit chunks.
    pub fn from_bytes(bytes: &[u8], element_size: u8) -> crate::Result<Self> {
        let be = Endian::Big;
        let field = |offset: usize, len: usize| header_field(bytes, offset, len);

        let version = be.read_u16(field(0, 2)?);
        let uncompressed_length = u64::from(be.read_u32(field(2, 4)?));
        let data_ref = be.read_u16(field(6, 2)?);
        // model type at 8..10 is always "standard"
        let code = be.read_u16(field(10, 2)?);
        let compression = match code {
            COMP_CODE_NONE => LegacyCompression::Raw,
            COMP_CODE_NBIT => {
                // number type code at 12..16 is implied by element_size
                let sign_extend = be.read_u16(field(16, 2)?) != 0;
                let fill_one = be.read_u16(field(18, 2)?) != 0;
                let start_bit = be.read_u32(field(20, 4)?);
                let bit_length = be.read_u32(field(24, 4)?);
                LegacyCompression::NBit {
                    uncompressed_length,
                    params: NBitParams {
                        element_size,
                        sign_extend,
                        fill_one,
                        start_bit,
                        bit_length,
                    },
                }
            }
            COMP_CODE_DEFLATE => LegacyCompression::Deflate {
                level: be.read_u16(field(12, 2)?),
                uncompressed_length,
            },
            code => LegacyCompression::Other { code },
        };
        Ok(Self {
            version,
            data_ref,
            compression,
        })
    }
}

fn header_field(bytes: &[u8], offset: usize, len: usize) -> crate::Result<&[u8]> {
    bytes.get(offset..offset + len).ok_or_else(|| {
        crate::Error::general(format!(
            "legacy chunk header truncated: need {} bytes, have {}",
            offset + len,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(code: u16, tail: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&400u32.to_be_bytes());
        b.extend_from_slice(&77u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&code.to_be_bytes());
        b.extend_from_slice(tail);
        b
    }

    #[test]
    fn parses_deflate_header() {
        let h = LegacyChunkHeader::from_bytes(&header(4, &5u16.to_be_bytes()), 4).unwrap();
        assert_eq!(h.data_ref, 77);
        assert_eq!(
            h.compression,
            LegacyCompression::Deflate {
                level: 5,
                uncompressed_length: 400
            }
        );
    }

    #[test]
    fn parses_nbit_header() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&24u32.to_be_bytes());
        tail.extend_from_slice(&1u16.to_be_bytes());
        tail.extend_from_slice(&0u16.to_be_bytes());
        tail.extend_from_slice(&11u32.to_be_bytes());
        tail.extend_from_slice(&6u32.to_be_bytes());
        let h = LegacyChunkHeader::from_bytes(&header(2, &tail), 2).unwrap();
        let LegacyCompression::NBit {
            uncompressed_length,
            params,
        } = h.compression
        else {
            panic!("expected n-bit, got {:?}", h.compression);
        };
        assert_eq!(uncompressed_length, 400);
        assert!(params.sign_extend);
        assert!(!params.fill_one);
        assert_eq!((params.start_bit, params.bit_length), (11, 6));
    }

    #[test]
    fn truncated_header_is_an_error() {
        assert!(LegacyChunkHeader::from_bytes(&[0, 1, 2], 4).is_err());
        assert!(LegacyChunkHeader::from_bytes(&header(2, &[0; 4]), 4).is_err());
    }

    #[test]
    fn unknown_code_is_kept() {
        let h = LegacyChunkHeader::from_bytes(&header(1, &[]), 4).unwrap();
        assert_eq!(h.compression, LegacyCompression::Other { code: 1 });
    }

    #[test]
    fn skip_mask_bits() {
        let mut e = ChunkEntry::new(vec![0, 0], 10, 0b101, 64);
        assert!(e.is_filter_skipped(0));
        assert!(!e.is_filter_skipped(1));
        assert!(e.is_filter_skipped(2));
        e.filter_mask = 0;
        assert!(!e.is_filter_skipped(40));
    }
}
