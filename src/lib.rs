//! Read sections of chunked array variables from scientific data files.
//!
//! Chunks are located through an on-disk B-tree ([`index::BTreeIndex`]) or a flat chunk
//! table ([`index::ChunkTable`]), decoded through a [`filter::FilterPipeline`] and stitched
//! into the requested section by a [`stitch::Stitcher`]. Chunks that were never written
//! read as the variable's fill value.
//!
//! ```no_run
//! use hdfchunk::{ChunkedArrayReader, IndexSpace, ReaderConfig, VariableDescriptor};
//!
//! # fn main() -> hdfchunk::Result<()> {
//! let file = std::fs::File::open("data.h5")?;
//! let descriptor = VariableDescriptor::from_json(&std::fs::read_to_string("temperature.json")?)?;
//! let mut reader = ChunkedArrayReader::new(&file, descriptor, ReaderConfig::default())?;
//! let section = reader.read_section(&IndexSpace::new(vec![0, 10], vec![4, 20]))?;
//! println!("{:?}", section.as_slice::<f32>());
//! # Ok(())
//! # }
//! ```
pub mod array;
pub mod chunk;
mod concurrent;
pub mod config;
mod error;
pub mod filter;
pub mod index;
pub mod metadata;
pub mod reader;
pub mod stitch;
pub mod storage;
pub mod tiling;

pub use array::{FillValue, HeapResolver, TypedArray};
pub use config::ReaderConfig;
pub use error::{Error, Result};
pub use metadata::VariableDescriptor;
pub use reader::{ChunkIter, ChunkedArrayReader, ReadStats};
pub use tiling::{IndexSpace, Tiling};
