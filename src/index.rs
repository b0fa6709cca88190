//! Resolving tiles to stored chunks.
//!
//! Both on-disk layouts answer the same two questions through [`ChunkIndex`]: where is the
//! chunk starting at this origin, and which chunks cover this region. [`open`] picks the
//! backend from a variable's storage layout.
use crate::chunk::ChunkEntry;
use crate::metadata::{StorageLayout, VariableDescriptor};
use crate::storage::{ReadAt, undefined_address};
use crate::tiling::{IndexSpace, Odometer, Tiling};

pub mod btree;
pub mod table;

pub use btree::{BTreeIndex, IndexStats};
pub use table::ChunkTable;

pub trait ChunkIndex {
    fn tiling(&self) -> &Tiling;

    /// The stored chunk whose origin is exactly `origin`, or `None` if it was never written.
    fn locate_chunk(&mut self, origin: &[u64]) -> crate::Result<Option<ChunkEntry>>;

    /// Every allocated chunk, in index order.
    fn allocated_chunks(&mut self) -> crate::Result<Vec<ChunkEntry>>;

    /// One entry per tile overlapping `want`, in row-major tile order.
    ///
    /// Tiles with no stored chunk come back as [ChunkEntry::missing].
    fn list_chunks_for_region(&mut self, want: &IndexSpace) -> crate::Result<Vec<ChunkEntry>> {
        if want.is_empty() {
            return Ok(Vec::new());
        }
        let section = self.tiling().section(want)?;
        let mut entries = Vec::new();
        for tile in Odometer::new(section) {
            let origin = self.tiling().index(&tile);
            // strided selections can skip whole tiles
            let chunk = self.tiling().chunk_space(&origin);
            if want.intersect(&chunk).is_none() {
                continue;
            }
            let entry = match self.locate_chunk(&origin)? {
                Some(entry) => entry,
                None => ChunkEntry::missing(origin),
            };
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Open the chunk index of a chunked variable.
pub fn open<'a, R: ReadAt + ?Sized>(
    file: &'a R,
    descriptor: &VariableDescriptor,
) -> crate::Result<Box<dyn ChunkIndex + 'a>> {
    match &descriptor.storage {
        StorageLayout::Chunked {
            chunk_shape,
            index_address,
            offset_size,
            ..
        } => {
            let tiling = Tiling::new(&descriptor.shape, chunk_shape)?;
            let root = index_address.filter(|&a| a != undefined_address(*offset_size));
            log::debug!(
                "{}: opening chunk b-tree at {root:?}, tiles {:?}",
                descriptor.name,
                tiling.tile_shape()
            );
            Ok(Box::new(BTreeIndex::new(
                file,
                &descriptor.name,
                tiling,
                root,
                *offset_size,
            )))
        }
        StorageLayout::ChunkTable {
            chunk_shape,
            chunks,
        } => {
            let tiling = Tiling::new(&descriptor.shape, chunk_shape)?;
            log::debug!(
                "{}: chunk table with {} rows, tiles {:?}",
                descriptor.name,
                chunks.len(),
                tiling.tile_shape()
            );
            Ok(Box::new(ChunkTable::from_rows(
                &descriptor.name,
                tiling,
                chunks,
            )?))
        }
        other => Err(crate::Error::invalid_descriptor(
            &descriptor.name,
            format!("{} storage has no chunk index", other.kind_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(origins: &[[u64; 2]]) -> ChunkTable {
        let tiling = Tiling::new(&[6, 6], &[2, 2]).unwrap();
        let entries = origins
            .iter()
            .enumerate()
            .map(|(i, o)| ChunkEntry::new(o.to_vec(), 16, 0, 100 * (i as u64 + 1)))
            .collect();
        ChunkTable::new(tiling, entries)
    }

    #[test]
    fn region_lists_every_overlapping_tile() {
        let mut idx = table(&[[0, 0], [2, 2]]);
        let want = IndexSpace::new(vec![1, 1], vec![3, 2]);
        let entries = idx.list_chunks_for_region(&want).unwrap();
        let origins: Vec<_> = entries.iter().map(|e| e.origin().to_vec()).collect();
        assert_eq!(
            origins,
            vec![vec![0, 0], vec![0, 2], vec![2, 0], vec![2, 2]]
        );
        let missing: Vec<_> = entries.iter().map(|e| e.is_missing()).collect();
        assert_eq!(missing, vec![false, true, true, false]);
    }

    #[test]
    fn strided_region_skips_untouched_tiles() {
        let mut idx = table(&[]);
        // columns 0 and 4 only: the tile at column 2 holds no selected point
        let want = IndexSpace::with_stride(vec![0, 0], vec![1, 2], vec![1, 4]).unwrap();
        let entries = idx.list_chunks_for_region(&want).unwrap();
        let origins: Vec<_> = entries.iter().map(|e| e.origin().to_vec()).collect();
        assert_eq!(origins, vec![vec![0, 0], vec![0, 4]]);
    }

    #[test]
    fn empty_region_lists_nothing() {
        let mut idx = table(&[[0, 0]]);
        let want = IndexSpace::new(vec![0, 0], vec![0, 3]);
        assert!(idx.list_chunks_for_region(&want).unwrap().is_empty());
    }
}
