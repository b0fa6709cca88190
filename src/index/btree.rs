//! Version-1 B-tree of raw data chunks (node type 1).
//!
//! Node layout, little-endian:
//!
//! | field | size |
//! |---|---|
//! | magic `TREE` | 4 |
//! | node type | 1 |
//! | level (0 = leaf) | 1 |
//! | entries used | 2 |
//! | left sibling address | offset size |
//! | right sibling address | offset size |
//! | key 0, child 0, key 1, child 1, ..., key N | |
//!
//! Each key is the chunk's stored size (`u32`), its filter mask (`u32`) and `rank + 1`
//! `u64` offsets, the last of which belongs to the element-size dimension.
//! Child `i` holds every chunk from key `i` up to, not including, key `i + 1`.
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::chunk::ChunkEntry;
use crate::storage::{Endian, ReadAt, undefined_address};
use crate::tiling::Tiling;

use super::ChunkIndex;

const MAGIC: &[u8; 4] = b"TREE";
const RAW_DATA_NODE: u8 = 1;

#[derive(Debug, Clone)]
enum NodeEntry {
    /// Leaf entry.
    Chunk(ChunkEntry),
    /// Child `child` starts at `key`.
    Internal { key: Vec<u64>, child: u64 },
}

impl NodeEntry {
    fn key(&self) -> &[u64] {
        match self {
            NodeEntry::Chunk(c) => c.origin(),
            NodeEntry::Internal { key, .. } => key,
        }
    }
}

#[derive(Debug)]
struct Node {
    address: u64,
    level: u8,
    entries: Vec<NodeEntry>,
    right: Option<u64>,
}

/// Node reads and cache hits of one [BTreeIndex].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub nodes_read: u64,
    pub cache_hits: u64,
}

/// A chunk B-tree read lazily from `file`.
///
/// Nodes are parsed once per address and kept for the life of the index.
pub struct BTreeIndex<'a, R: ?Sized> {
    file: &'a R,
    variable: String,
    tiling: Tiling,
    root: Option<u64>,
    offset_size: u8,
    nodes: HashMap<u64, Arc<Node>>,
    stats: IndexStats,
}

impl<'a, R: ReadAt + ?Sized> BTreeIndex<'a, R> {
    /// `root` of `None` means no chunk was ever written.
    pub fn new(
        file: &'a R,
        variable: &str,
        tiling: Tiling,
        root: Option<u64>,
        offset_size: u8,
    ) -> Self {
        Self {
            file,
            variable: variable.to_string(),
            tiling,
            root,
            offset_size,
            nodes: HashMap::new(),
            stats: IndexStats::default(),
        }
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    fn node(&mut self, address: u64) -> crate::Result<Arc<Node>> {
        if let Some(node) = self.nodes.get(&address) {
            self.stats.cache_hits += 1;
            return Ok(Arc::clone(node));
        }
        let node = Arc::new(self.read_node(address)?);
        self.stats.nodes_read += 1;
        log::trace!(
            "{}: read b-tree node at {address:#x}, level {}, {} entries",
            self.variable,
            node.level,
            node.entries.len()
        );
        self.nodes.insert(address, Arc::clone(&node));
        Ok(node)
    }

    /// Fetch `address`, which must be a node at `level`.
    fn node_at_level(&mut self, address: u64, level: u8) -> crate::Result<Arc<Node>> {
        let node = self.node(address)?;
        if node.level != level {
            return Err(crate::Error::structural(
                &self.variable,
                address,
                format!("b-tree node at level {level}"),
                format!("level {}", node.level),
            ));
        }
        Ok(node)
    }

    fn read_node(&self, address: u64) -> crate::Result<Node> {
        let le = Endian::Little;
        let os = usize::from(self.offset_size);
        if !(1..=8).contains(&os) {
            return Err(crate::Error::invalid_descriptor(
                &self.variable,
                format!("offset size {os} is not in 1..=8"),
            ));
        }
        let undefined = undefined_address(self.offset_size);
        let rank = self.tiling.rank();

        let header_len = 8 + 2 * os;
        let header = self.file.read_bytes_at(address, header_len)?;
        if &header[..4] != MAGIC {
            return Err(crate::Error::structural(
                &self.variable,
                address,
                "b-tree signature \"TREE\"",
                format!("{:?}", String::from_utf8_lossy(&header[..4])),
            ));
        }
        if header[4] != RAW_DATA_NODE {
            return Err(crate::Error::structural(
                &self.variable,
                address,
                format!("raw data chunk node (type {RAW_DATA_NODE})"),
                format!("type {}", header[4]),
            ));
        }
        let level = header[5];
        let used = usize::from(le.read_u16(&header[6..8]));
        let right = le.read_uint(&header[8 + os..8 + 2 * os], os);

        let key_len = 8 + 8 * (rank + 1);
        let body_len = (used + 1) * key_len + used * os;
        let body = self
            .file
            .read_bytes_at(address + header_len as u64, body_len)?;

        let mut entries = Vec::with_capacity(used);
        for i in 0..used {
            let at = i * (key_len + os);
            let key = &body[at..at + key_len];
            let size = le.read_u32(&key[0..4]);
            let filter_mask = le.read_u32(&key[4..8]);
            let origin: Vec<u64> = key[8..8 + 8 * rank]
                .chunks_exact(8)
                .map(|b| le.read_uint(b, 8))
                .collect();
            let child = le.read_uint(&body[at + key_len..at + key_len + os], os);
            entries.push(if level == 0 {
                NodeEntry::Chunk(ChunkEntry::new(
                    origin,
                    u64::from(size),
                    filter_mask,
                    child,
                ))
            } else {
                NodeEntry::Internal { key: origin, child }
            });
        }
        // the trailing key only bounds the last child

        for pair in entries.windows(2) {
            if self.tiling.compare(pair[0].key(), pair[1].key()) != Ordering::Less {
                return Err(crate::Error::structural(
                    &self.variable,
                    address,
                    "keys in increasing tile order",
                    format!("{:?} before {:?}", pair[0].key(), pair[1].key()),
                ));
            }
        }

        Ok(Node {
            address,
            level,
            entries,
            right: (right != undefined).then_some(right),
        })
    }
}

impl<R: ReadAt + ?Sized> ChunkIndex for BTreeIndex<'_, R> {
    fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn locate_chunk(&mut self, origin: &[u64]) -> crate::Result<Option<ChunkEntry>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let rank = self.tiling.rank();
        let mut node = self.node(root)?;
        loop {
            let found = node
                .entries
                .iter()
                .take_while(|e| self.tiling.compare(e.key(), origin) != Ordering::Greater)
                .last();
            if node.level == 0 {
                return Ok(match found {
                    Some(NodeEntry::Chunk(c)) if c.origin() == &origin[..rank] => Some(c.clone()),
                    _ => None,
                });
            }
            let child = match found.or(node.entries.first()) {
                Some(NodeEntry::Internal { child, .. }) => *child,
                _ => return Ok(None),
            };
            node = self.node_at_level(child, node.level - 1)?;
        }
    }

    fn allocated_chunks(&mut self) -> crate::Result<Vec<ChunkEntry>> {
        let Some(root) = self.root else {
            return Ok(Vec::new());
        };
        let mut node = self.node(root)?;
        while node.level > 0 {
            let child = match node.entries.first() {
                Some(NodeEntry::Internal { child, .. }) => *child,
                _ => return Ok(Vec::new()),
            };
            node = self.node_at_level(child, node.level - 1)?;
        }

        let mut chunks = Vec::new();
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(node.address) {
                return Err(crate::Error::structural(
                    &self.variable,
                    node.address,
                    "acyclic sibling chain",
                    "a leaf visited twice",
                ));
            }
            chunks.extend(node.entries.iter().filter_map(|e| match e {
                NodeEntry::Chunk(c) => Some(c.clone()),
                NodeEntry::Internal { .. } => None,
            }));
            match node.right {
                Some(right) => node = self.node_at_level(right, 0)?,
                None => break,
            }
        }
        log::debug!(
            "{}: {} allocated chunks over {} leaves",
            self.variable,
            chunks.len(),
            visited.len()
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: u64 = u64::MAX;

    /// Serialise a rank-2 node; `keys` has one more element than `children`.
    fn node(level: u8, right: u64, keys: &[[u64; 2]], children: &[u64]) -> Vec<u8> {
        assert_eq!(keys.len(), children.len() + 1);
        let mut b = Vec::new();
        b.extend_from_slice(b"TREE");
        b.push(1);
        b.push(level);
        b.extend_from_slice(&(children.len() as u16).to_le_bytes());
        b.extend_from_slice(&NONE.to_le_bytes());
        b.extend_from_slice(&right.to_le_bytes());
        for (i, k) in keys.iter().enumerate() {
            b.extend_from_slice(&64u32.to_le_bytes());
            b.extend_from_slice(&(i as u32).to_le_bytes());
            for o in k.iter().chain(&[0]) {
                b.extend_from_slice(&o.to_le_bytes());
            }
            if let Some(c) = children.get(i) {
                b.extend_from_slice(&c.to_le_bytes());
            }
        }
        b
    }

    fn place(file: &mut Vec<u8>, at: usize, bytes: &[u8]) {
        if file.len() < at + bytes.len() {
            file.resize(at + bytes.len(), 0);
        }
        file[at..at + bytes.len()].copy_from_slice(bytes);
    }

    const PRESENT: [[u64; 2]; 5] = [[0, 2], [0, 4], [2, 2], [4, 0], [6, 4]];

    /// 8x8 variable in 2x2 chunks; two leaves under one root.
    fn two_level_tree() -> Vec<u8> {
        let mut file = Vec::new();
        let leaf_a = node(
            0,
            2048,
            &[PRESENT[0], PRESENT[1], PRESENT[2], [4, 0]],
            &[9000, 9100, 9200],
        );
        let leaf_b = node(0, NONE, &[PRESENT[3], PRESENT[4], [8, 8]], &[9300, 9400]);
        let root = node(1, NONE, &[[0, 2], [4, 0], [8, 8]], &[1024, 2048]);
        place(&mut file, 64, &root);
        place(&mut file, 1024, &leaf_a);
        place(&mut file, 2048, &leaf_b);
        file
    }

    fn tiling() -> Tiling {
        Tiling::new(&[8, 8], &[2, 2, 4]).unwrap()
    }

    #[test]
    fn locates_every_present_chunk_and_nothing_else() {
        let file = two_level_tree();
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        for i in (0..8).step_by(2) {
            for j in (0..8).step_by(2) {
                let got = idx.locate_chunk(&[i, j]).unwrap();
                match PRESENT.iter().position(|p| p == &[i, j]) {
                    Some(k) => {
                        let entry = got.unwrap();
                        assert_eq!(entry.origin(), &[i, j]);
                        assert_eq!(
                            entry.location(),
                            &crate::chunk::ChunkLocation::Address(9000 + 100 * k as u64)
                        );
                        assert_eq!(entry.size(), 64);
                    }
                    None => assert!(got.is_none(), "unexpected chunk at {i},{j}"),
                }
            }
        }
        let stats = idx.stats();
        assert_eq!(stats.nodes_read, 3);
        assert!(stats.cache_hits > 0);
    }

    #[test]
    fn filter_masks_come_from_keys() {
        let file = two_level_tree();
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        assert_eq!(idx.locate_chunk(&[2, 2]).unwrap().unwrap().filter_mask(), 2);
        assert_eq!(idx.locate_chunk(&[6, 4]).unwrap().unwrap().filter_mask(), 1);
    }

    #[test]
    fn allocated_chunks_follow_siblings() {
        let file = two_level_tree();
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        let origins: Vec<_> = idx
            .allocated_chunks()
            .unwrap()
            .iter()
            .map(|c| c.origin().to_vec())
            .collect();
        let expected: Vec<_> = PRESENT.iter().map(|p| p.to_vec()).collect();
        assert_eq!(origins, expected);
    }

    #[test]
    fn undefined_root_is_empty() {
        let file = Vec::new();
        let mut idx = BTreeIndex::new(&file, "var", tiling(), None, 8);
        assert!(idx.locate_chunk(&[0, 0]).unwrap().is_none());
        assert!(idx.allocated_chunks().unwrap().is_empty());
    }

    #[test]
    fn bad_signature_is_structural() {
        let mut file = two_level_tree();
        file[64..68].copy_from_slice(b"HEAP");
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        let err = idx.locate_chunk(&[0, 0]).unwrap_err();
        match err {
            crate::Error::Structural {
                variable,
                address,
                found,
                ..
            } => {
                assert_eq!(variable, "var");
                assert_eq!(address, 64);
                assert!(found.contains("HEAP"));
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn wrong_node_type_is_structural() {
        let mut file = two_level_tree();
        file[68] = 0;
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        assert!(matches!(
            idx.locate_chunk(&[0, 0]),
            Err(crate::Error::Structural { .. })
        ));
    }

    #[test]
    fn unordered_keys_are_structural() {
        let mut file = Vec::new();
        place(
            &mut file,
            0,
            &node(0, NONE, &[[2, 2], [0, 4], [8, 8]], &[100, 200]),
        );
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(0), 8);
        assert!(matches!(
            idx.locate_chunk(&[0, 4]),
            Err(crate::Error::Structural { .. })
        ));
    }

    #[test]
    fn child_level_must_decrease_by_one() {
        let mut file = two_level_tree();
        // root claims level 2 but points at leaves
        file[64 + 5] = 2;
        let mut idx = BTreeIndex::new(&file, "var", tiling(), Some(64), 8);
        assert!(matches!(
            idx.locate_chunk(&[2, 2]),
            Err(crate::Error::Structural { .. })
        ));
    }
}
