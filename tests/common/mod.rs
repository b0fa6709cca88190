//! Builders for small synthetic files: chunk B-trees and filtered chunks.
#![allow(dead_code)]

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use hdfchunk::filter::{
    FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE, FilterDescriptor, fletcher32,
};
use hdfchunk::tiling::Odometer;
use hdfchunk::{IndexSpace, Tiling};

pub fn init_logging() {
    env_logger::try_init().ok();
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("write to vec");
    enc.finish().expect("finish zlib stream")
}

pub fn shuffle(data: &[u8], n: usize) -> Vec<u8> {
    let m = data.len() / n;
    let mut out = data.to_vec();
    for i in 0..m {
        for j in 0..n {
            out[j * m + i] = data[i * n + j];
        }
    }
    out
}

/// Apply `filters` in order, skipping those whose bit is set in `mask`.
pub fn encode(
    plain: &[u8],
    filters: &[FilterDescriptor],
    element_size: usize,
    mask: u32,
) -> Vec<u8> {
    let mut data = plain.to_vec();
    for (i, f) in filters.iter().enumerate() {
        if (mask >> i) & 1 == 1 {
            continue;
        }
        data = match f.id {
            FILTER_DEFLATE => zlib(&data),
            FILTER_SHUFFLE => {
                let n = f.client_values.first().map_or(element_size, |&n| n as usize);
                shuffle(&data, n)
            }
            FILTER_FLETCHER32 => {
                let sum = fletcher32(&data);
                data.extend_from_slice(&sum.to_le_bytes());
                data
            }
            id => panic!("no test encoder for filter {id}"),
        };
    }
    data
}

/// The little-endian bytes of a whole chunk at `origin`, each element `value(point)`.
pub fn chunk_i32(tiling: &Tiling, origin: &[u64], value: impl Fn(&[u64]) -> i32) -> Vec<u8> {
    Odometer::new(tiling.chunk_space(origin))
        .flat_map(|p| value(&p).to_le_bytes())
        .collect()
}

/// Expected values of `want`.
pub fn expected_i32(want: &IndexSpace, value: impl Fn(&[u64]) -> i32) -> Vec<i32> {
    Odometer::new(want.clone()).map(|p| value(&p)).collect()
}

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub origin: Vec<u64>,
    pub address: u64,
    pub size: u32,
    pub filter_mask: u32,
}

/// An in-memory file, grown by appending.
pub struct FileBuilder {
    bytes: Vec<u8>,
}

impl Default for FileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FileBuilder {
    pub fn new() -> Self {
        // nothing lives at address 0
        Self { bytes: vec![0; 16] }
    }

    pub fn append(&mut self, data: &[u8]) -> u64 {
        let address = self.bytes.len() as u64;
        self.bytes.extend_from_slice(data);
        address
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    /// Append one encoded chunk and describe it.
    pub fn chunk(&mut self, origin: &[u64], encoded: &[u8], filter_mask: u32) -> StoredChunk {
        StoredChunk {
            origin: origin.to_vec(),
            address: self.append(encoded),
            size: encoded.len() as u32,
            filter_mask,
        }
    }

    /// Append a B-tree over `chunks` (in tile order) with at most `leaf_capacity` chunks per
    /// leaf, and return the root address. More than one leaf gets a level-1 root.
    pub fn btree(&mut self, rank: usize, chunks: &[StoredChunk], leaf_capacity: usize) -> u64 {
        let leaves: Vec<&[StoredChunk]> = chunks.chunks(leaf_capacity).collect();
        let start = self.len();
        let mut addresses = Vec::new();
        let mut at = start;
        for leaf in &leaves {
            addresses.push(at);
            at += node_len(rank, leaf.len());
        }
        for (i, leaf) in leaves.iter().enumerate() {
            let right = addresses.get(i + 1).copied();
            let trailing = leaves
                .get(i + 1)
                .map_or_else(|| leaf[leaf.len() - 1].origin.clone(), |next| next[0].origin.clone());
            let keys: Vec<(Vec<u64>, u32, u32)> = leaf
                .iter()
                .map(|c| (c.origin.clone(), c.size, c.filter_mask))
                .chain(std::iter::once((trailing, 0, 0)))
                .collect();
            let children: Vec<u64> = leaf.iter().map(|c| c.address).collect();
            let bytes = node(0, right, &keys, &children);
            assert_eq!(self.append(&bytes), addresses[i]);
        }
        if leaves.len() == 1 {
            return addresses[0];
        }
        let keys: Vec<(Vec<u64>, u32, u32)> = leaves
            .iter()
            .map(|l| (l[0].origin.clone(), 0, 0))
            .chain(std::iter::once((chunks[chunks.len() - 1].origin.clone(), 0, 0)))
            .collect();
        self.append(&node(1, None, &keys, &addresses))
    }
}

fn node_len(rank: usize, entries: usize) -> u64 {
    let key = 8 + 8 * (rank + 1);
    (24 + (entries + 1) * key + entries * 8) as u64
}

/// Serialise a raw-data B-tree node with 8-byte addresses.
pub fn node(
    level: u8,
    right: Option<u64>,
    keys: &[(Vec<u64>, u32, u32)],
    children: &[u64],
) -> Vec<u8> {
    assert_eq!(keys.len(), children.len() + 1);
    let mut b = Vec::new();
    b.extend_from_slice(b"TREE");
    b.push(1);
    b.push(level);
    b.extend_from_slice(&(children.len() as u16).to_le_bytes());
    b.extend_from_slice(&u64::MAX.to_le_bytes());
    b.extend_from_slice(&right.unwrap_or(u64::MAX).to_le_bytes());
    for (i, (origin, size, mask)) in keys.iter().enumerate() {
        b.extend_from_slice(&size.to_le_bytes());
        b.extend_from_slice(&mask.to_le_bytes());
        for o in origin.iter().chain(&[0]) {
            b.extend_from_slice(&o.to_le_bytes());
        }
        if let Some(c) = children.get(i) {
            b.extend_from_slice(&c.to_le_bytes());
        }
    }
    b
}
