use serde::{Deserialize, Serialize};

use crate::array::FillValue;
use crate::chunk::{LegacyChunkHeader, LegacyCompression};
use crate::filter::FilterDescriptor;
use crate::storage::{Endian, Segment};

/// Everything the reader needs to know about one variable.
///
/// Produced by whatever parses the container's object headers; this crate only consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    /// Used in logs and error reports.
    pub name: String,
    /// Logical shape, slowest-varying dimension first.
    pub shape: Vec<u64>,
    /// Bytes per element.
    pub element_size: usize,
    pub datatype: Datatype,
    /// Byte order of stored elements.
    #[serde(default)]
    pub endian: Endian,
    /// Value of elements in chunks that were never written. Zero bytes if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<FillValue>,
    pub storage: StorageLayout,
}

/// Element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Fixed-width bytes with no interpretation.
    Opaque,
    /// Fixed-length string.
    String,
    /// Fixed-width record of named members.
    Compound,
    /// Reference to variable-length data kept elsewhere in the file.
    #[serde(rename = "vlen")]
    VarLen,
}

impl Datatype {
    /// Width in bytes, for types whose width is implied by the tag.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Datatype::Int8 | Datatype::UInt8 => Some(1),
            Datatype::Int16 | Datatype::UInt16 => Some(2),
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => Some(4),
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => Some(8),
            Datatype::Opaque | Datatype::String | Datatype::Compound | Datatype::VarLen => None,
        }
    }
}

/// Where and how a variable's bytes are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StorageLayout {
    /// One block holding the whole variable; `None` (or the all-ones address for
    /// `offset_size`) if never allocated.
    Contiguous {
        #[serde(default)]
        address: Option<u64>,
        #[serde(default = "default_offset_size")]
        offset_size: u8,
    },
    /// Data held in the descriptor itself.
    Compact { data: Vec<u8> },
    /// The whole variable as one byte stream over several blocks.
    LinkedSegments { segments: Vec<Segment> },
    /// Chunks indexed by a B-tree.
    #[serde(rename_all = "camelCase")]
    Chunked {
        /// May include a trailing element-size dimension.
        chunk_shape: Vec<u64>,
        /// B-tree root; `None` (or the undefined address) if no chunk was written.
        #[serde(default)]
        index_address: Option<u64>,
        #[serde(default = "default_offset_size")]
        offset_size: u8,
        /// In the order they were applied when writing.
        #[serde(default)]
        filters: Vec<FilterDescriptor>,
    },
    /// Chunks listed in a flat table (legacy dialect).
    #[serde(rename_all = "camelCase")]
    ChunkTable {
        chunk_shape: Vec<u64>,
        chunks: Vec<TableChunk>,
    },
}

fn default_offset_size() -> u8 {
    8
}

impl StorageLayout {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StorageLayout::Contiguous { .. } => "contiguous",
            StorageLayout::Compact { .. } => "compact",
            StorageLayout::LinkedSegments { .. } => "linked-segments",
            StorageLayout::Chunked { .. } => "chunked",
            StorageLayout::ChunkTable { .. } => "chunk-table",
        }
    }

    pub fn chunk_shape(&self) -> Option<&[u64]> {
        match self {
            StorageLayout::Chunked { chunk_shape, .. }
            | StorageLayout::ChunkTable { chunk_shape, .. } => Some(chunk_shape),
            _ => None,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_shape().is_some()
    }
}

/// One row of a legacy chunk table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChunk {
    /// Position in tile units, not elements.
    pub tile: Vec<u64>,
    pub data: ChunkData,
    #[serde(default)]
    pub compression: LegacyCompression,
}

impl TableChunk {
    /// A row whose compression is read from the compressed-element header stored with the
    /// chunk. `element_size` is the variable's unpacked element width.
    pub fn from_header(
        tile: Vec<u64>,
        header: &[u8],
        element_size: u8,
        data: ChunkData,
    ) -> crate::Result<Self> {
        let header = LegacyChunkHeader::from_bytes(header, element_size)?;
        log::trace!(
            "table chunk {tile:?}: header version {}, data ref {}",
            header.version,
            header.data_ref
        );
        Ok(Self {
            tile,
            data,
            compression: header.compression,
        })
    }
}

/// Stored bytes of a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ChunkData {
    Block { address: u64, length: u64 },
    Linked { segments: Vec<Segment> },
}

impl VariableDescriptor {
    /// Parse and validate a JSON descriptor.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let descriptor: Self = serde_json::from_str(json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements, or `None` on overflow.
    pub fn num_elements(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |acc, &n| acc.checked_mul(n))
    }

    /// Check the descriptor is self-consistent.
    pub fn validate(&self) -> crate::Result<()> {
        let bad = |message: String| Err(crate::Error::invalid_descriptor(&self.name, message));
        if self.element_size == 0 {
            return bad("element size is zero".into());
        }
        if let Some(size) = self.datatype.fixed_size()
            && size != self.element_size
        {
            return bad(format!(
                "{:?} elements are {size} bytes, descriptor says {}",
                self.datatype, self.element_size
            ));
        }
        if let Some(fill) = &self.fill_value
            && fill.len() != self.element_size
        {
            return bad(format!(
                "fill value has {} bytes, elements have {}",
                fill.len(),
                self.element_size
            ));
        }
        if let Some(chunk_shape) = self.storage.chunk_shape() {
            if chunk_shape.len() < self.rank() {
                return bad(format!(
                    "chunk shape {chunk_shape:?} has lower rank than shape {:?}",
                    self.shape
                ));
            }
            if chunk_shape[..self.rank()].contains(&0) {
                return bad(format!("chunk shape {chunk_shape:?} has a zero dimension"));
            }
        }
        match &self.storage {
            StorageLayout::Chunked { offset_size, .. }
            | StorageLayout::Contiguous { offset_size, .. }
                if !(1..=8).contains(offset_size) =>
            {
                bad(format!("offset size {offset_size} is not in 1..=8"))
            }
            StorageLayout::Compact { data } => {
                let needed = self
                    .num_elements()
                    .and_then(|n| n.checked_mul(self.element_size as u64));
                match needed {
                    Some(n) if data.len() as u64 >= n => Ok(()),
                    _ => bad(format!(
                        "compact data has {} bytes, shape {:?} needs {needed:?}",
                        data.len(),
                        self.shape
                    )),
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FILTER_DEFLATE;

    const CHUNKED: &str = r#"{
        "name": "temperature",
        "shape": [4, 4],
        "elementSize": 4,
        "datatype": "int32",
        "endian": "big",
        "fillValue": [255, 255, 255, 255],
        "storage": {
            "kind": "chunked",
            "chunkShape": [2, 2, 4],
            "indexAddress": 800,
            "filters": [{"id": 2}, {"id": 1, "name": "deflate", "clientValues": [6]}]
        }
    }"#;

    #[test]
    fn chunked_descriptor_from_json() {
        let d = VariableDescriptor::from_json(CHUNKED).unwrap();
        assert_eq!(d.endian, Endian::Big);
        assert_eq!(d.datatype, Datatype::Int32);
        let StorageLayout::Chunked {
            chunk_shape,
            index_address,
            offset_size,
            filters,
        } = &d.storage
        else {
            panic!("expected chunked storage, got {:?}", d.storage);
        };
        assert_eq!(chunk_shape, &[2, 2, 4]);
        assert_eq!(*index_address, Some(800));
        assert_eq!(*offset_size, 8);
        assert_eq!(filters[1].id, FILTER_DEFLATE);
        assert_eq!(filters[1].client_values, vec![6]);
    }

    #[test]
    fn chunk_table_descriptor_from_json() {
        let d = VariableDescriptor::from_json(
            r#"{
                "name": "sst",
                "shape": [10],
                "elementSize": 2,
                "datatype": "int16",
                "storage": {
                    "kind": "chunkTable",
                    "chunkShape": [5],
                    "chunks": [
                        {"tile": [0], "data": {"type": "block", "address": 64, "length": 10}},
                        {"tile": [1],
                         "data": {"type": "linked", "segments": [{"address": 90, "length": 4}]},
                         "compression": {"type": "deflate", "uncompressedLength": 10}}
                    ]
                }
            }"#,
        )
        .unwrap();
        let StorageLayout::ChunkTable { chunks, .. } = &d.storage else {
            panic!("expected a chunk table");
        };
        assert_eq!(chunks[0].compression, LegacyCompression::Raw);
        assert_eq!(
            chunks[1].compression,
            LegacyCompression::Deflate {
                level: 6,
                uncompressed_length: 10
            }
        );
    }

    #[test]
    fn fill_width_must_match() {
        let json = CHUNKED.replace("[255, 255, 255, 255]", "[0, 0]");
        assert!(matches!(
            VariableDescriptor::from_json(&json),
            Err(crate::Error::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn datatype_width_must_match() {
        let json = CHUNKED.replace("\"elementSize\": 4", "\"elementSize\": 8");
        assert!(VariableDescriptor::from_json(&json).is_err());
    }

    #[test]
    fn zero_chunk_dimension_is_rejected() {
        let json = CHUNKED.replace("[2, 2, 4]", "[2, 0, 4]");
        assert!(VariableDescriptor::from_json(&json).is_err());
    }

    #[test]
    fn compact_data_must_cover_shape() {
        let d = VariableDescriptor {
            name: "small".into(),
            shape: vec![3],
            element_size: 2,
            datatype: Datatype::UInt16,
            endian: Endian::Little,
            fill_value: None,
            storage: StorageLayout::Compact { data: vec![0; 5] },
        };
        assert!(d.validate().is_err());
    }
}
