use crate::chunk::{ChunkEntry, ChunkLocation};
use crate::metadata::{ChunkData, TableChunk};
use crate::tiling::Tiling;

use super::ChunkIndex;

/// A chunk directory stored as one flat table, searched linearly.
#[derive(Debug, Clone)]
pub struct ChunkTable {
    tiling: Tiling,
    entries: Vec<ChunkEntry>,
}

impl ChunkTable {
    pub fn new(tiling: Tiling, entries: Vec<ChunkEntry>) -> Self {
        Self { tiling, entries }
    }

    /// Build from table rows, whose positions are in tile units.
    pub fn from_rows(variable: &str, tiling: Tiling, rows: &[TableChunk]) -> crate::Result<Self> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            if row.tile.len() != tiling.rank() {
                return Err(crate::Error::invalid_descriptor(
                    variable,
                    format!(
                        "chunk table row {:?} has rank {}, expected {}",
                        row.tile,
                        row.tile.len(),
                        tiling.rank()
                    ),
                ));
            }
            let origin = tiling.index(&row.tile);
            let entry = match &row.data {
                ChunkData::Block { address, length } => {
                    ChunkEntry::legacy(origin, ChunkLocation::Address(*address), row.compression)
                        .with_size(*length)
                }
                ChunkData::Linked { segments } => ChunkEntry::legacy(
                    origin,
                    ChunkLocation::Linked(segments.clone()),
                    row.compression,
                ),
            };
            entries.push(entry);
        }
        Ok(Self::new(tiling, entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChunkIndex for ChunkTable {
    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn locate_chunk(&mut self, origin: &[u64]) -> crate::Result<Option<ChunkEntry>> {
        let rank = self.tiling.rank();
        Ok(self
            .entries
            .iter()
            .find(|e| e.origin() == &origin[..rank])
            .cloned())
    }

    fn allocated_chunks(&mut self) -> crate::Result<Vec<ChunkEntry>> {
        Ok(self.entries.clone())
    }
}
