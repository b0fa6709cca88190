//! Element-space and tile-space arithmetic for one variable.
//!
//! A [`Tiling`] divides a variable's index space into equally-sized tiles (chunks).
//! Index points live in element space; tiles live in tile space, where tile `t` covers the
//! elements `t * chunk .. (t + 1) * chunk` in each dimension.
use std::cmp::Ordering;
use std::fmt;

/// A rectangular, possibly strided, region of element space.
///
/// `shape` counts selected elements per dimension, so the last selected coordinate in
/// dimension `d` is `origin[d] + (shape[d] - 1) * stride[d]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexSpace {
    origin: Vec<u64>,
    shape: Vec<u64>,
    stride: Vec<u64>,
}

impl IndexSpace {
    /// A unit-stride region.
    ///
    /// # Panics
    ///
    /// If `origin` and `shape` differ in length.
    pub fn new(origin: Vec<u64>, shape: Vec<u64>) -> Self {
        assert_eq!(origin.len(), shape.len(), "origin and shape rank differ");
        let stride = vec![1; shape.len()];
        Self {
            origin,
            shape,
            stride,
        }
    }

    /// A strided region. Every stride component must be at least 1.
    pub fn with_stride(origin: Vec<u64>, shape: Vec<u64>, stride: Vec<u64>) -> crate::Result<Self> {
        if origin.len() != shape.len() || shape.len() != stride.len() {
            return Err(crate::Error::general(format!(
                "index space rank mismatch: origin {origin:?}, shape {shape:?}, stride {stride:?}"
            )));
        }
        if stride.contains(&0) {
            return Err(crate::Error::general(format!(
                "index space stride must be positive: {stride:?}"
            )));
        }
        Ok(Self {
            origin,
            shape,
            stride,
        })
    }

    /// The region `[0, shape)`.
    pub fn from_shape(shape: &[u64]) -> Self {
        Self::new(vec![0; shape.len()], shape.to_vec())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn origin(&self) -> &[u64] {
        &self.origin
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn stride(&self) -> &[u64] {
        &self.stride
    }

    pub fn is_unit_stride(&self) -> bool {
        self.stride.iter().all(|&s| s == 1)
    }

    /// Number of selected elements, or `None` on overflow.
    pub fn num_elements(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |acc, &n| acc.checked_mul(n))
    }

    pub fn is_empty(&self) -> bool {
        self.shape.contains(&0)
    }

    /// Last selected coordinate (inclusive) in each dimension. Meaningless if empty.
    pub fn last(&self) -> Vec<u64> {
        self.origin
            .iter()
            .zip(&self.shape)
            .zip(&self.stride)
            .map(|((&o, &n), &s)| o + n.saturating_sub(1) * s)
            .collect()
    }

    /// Whether every point selected by `other` is also selected by `self`.
    pub fn contains(&self, other: &IndexSpace) -> bool {
        if self.rank() != other.rank() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        let last = self.last();
        let other_last = other.last();
        (0..self.rank()).all(|d| {
            let s = self.stride[d];
            other.origin[d] >= self.origin[d]
                && other_last[d] <= last[d]
                && (other.origin[d] - self.origin[d]) % s == 0
                && (other.shape[d] == 1 || other.stride[d] % s == 0)
        })
    }

    /// Per dimension, the inclusive range of selection counters `k` whose coordinate
    /// `origin + k * stride` falls inside `[start, start + len)`.
    ///
    /// `None` if no selected point lies in the box.
    pub(crate) fn selected_within(&self, start: &[u64], len: &[u64]) -> Option<Vec<(u64, u64)>> {
        let mut ranges = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            let (o, n, s) = (self.origin[d], self.shape[d], self.stride[d]);
            if n == 0 || len[d] == 0 {
                return None;
            }
            let box_last = start[d] + len[d] - 1;
            let lo = if start[d] <= o {
                0
            } else {
                (start[d] - o).div_ceil(s)
            };
            if box_last < o {
                return None;
            }
            let hi = ((box_last - o) / s).min(n - 1);
            if lo > hi {
                return None;
            }
            ranges.push((lo, hi));
        }
        Some(ranges)
    }

    /// The points of `self` that fall inside the unit-stride box `other`, or `None` if there
    /// are none.
    pub fn intersect(&self, other: &IndexSpace) -> Option<IndexSpace> {
        let ranges = self.selected_within(&other.origin, &other.shape)?;
        let origin = ranges
            .iter()
            .enumerate()
            .map(|(d, &(lo, _))| self.origin[d] + lo * self.stride[d])
            .collect();
        let shape = ranges.iter().map(|&(lo, hi)| hi - lo + 1).collect();
        Some(IndexSpace {
            origin,
            shape,
            stride: self.stride.clone(),
        })
    }
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.last();
        write!(f, "[")?;
        for d in 0..self.rank() {
            if d > 0 {
                write!(f, ", ")?;
            }
            if self.shape[d] == 0 {
                write!(f, "{}:empty", self.origin[d])?;
            } else if self.stride[d] == 1 {
                write!(f, "{}:{}", self.origin[d], last[d])?;
            } else {
                write!(f, "{}:{}:{}", self.origin[d], last[d], self.stride[d])?;
            }
        }
        write!(f, "]")
    }
}

/// Mapping between element coordinates and tile coordinates for one (shape, chunk shape) pair.
#[derive(Debug, Clone)]
pub struct Tiling {
    chunk: Vec<u64>,
    /// Extent of the index space; may be larger than the variable shape.
    index_shape: Vec<u64>,
    tile_shape: Vec<u64>,
    strides: Vec<u64>,
}

impl Tiling {
    /// `chunk_shape` may carry trailing dimensions beyond the variable's rank
    /// (the element size, in HDF5 storage); they are ignored.
    pub fn new(var_shape: &[u64], chunk_shape: &[u64]) -> crate::Result<Self> {
        let rank = var_shape.len();
        if chunk_shape.len() < rank {
            return Err(crate::Error::general(format!(
                "chunk shape {chunk_shape:?} has lower rank than variable shape {var_shape:?}"
            )));
        }
        let chunk = chunk_shape[..rank].to_vec();
        if chunk.contains(&0) {
            return Err(crate::Error::general(format!(
                "chunk shape {chunk_shape:?} has a zero dimension"
            )));
        }
        let index_shape: Vec<u64> = var_shape
            .iter()
            .zip(&chunk)
            .map(|(&v, &c)| v.max(c))
            .collect();
        let tile_shape: Vec<u64> = index_shape
            .iter()
            .zip(&chunk)
            .map(|(&n, &c)| n.div_ceil(c))
            .collect();
        let mut strides = vec![1u64; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * tile_shape[d + 1];
        }
        Ok(Self {
            chunk,
            index_shape,
            tile_shape,
            strides,
        })
    }

    pub fn rank(&self) -> usize {
        self.chunk.len()
    }

    /// Chunk shape, without any trailing storage dimensions.
    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk
    }

    /// Number of tiles along each dimension.
    pub fn tile_shape(&self) -> &[u64] {
        &self.tile_shape
    }

    /// The tile containing index point `pt`.
    ///
    /// Points of higher rank than the tiling (variable-length element types) only use
    /// their first `rank` components.
    pub fn tile(&self, pt: &[u64]) -> Vec<u64> {
        pt.iter().zip(&self.chunk).map(|(&p, &c)| p / c).collect()
    }

    /// The first element of a tile; inverse of [Tiling::tile] on chunk origins.
    pub fn index(&self, tile: &[u64]) -> Vec<u64> {
        tile.iter().zip(&self.chunk).map(|(&t, &c)| t * c).collect()
    }

    /// Row-major position in tile space of the tile containing `pt`.
    pub fn order(&self, pt: &[u64]) -> u64 {
        pt.iter()
            .zip(&self.chunk)
            .zip(&self.strides)
            .map(|((&p, &c), &s)| (p / c) * s)
            .sum()
    }

    /// Order index points by the tile they belong to.
    pub fn compare(&self, p1: &[u64], p2: &[u64]) -> Ordering {
        self.order(p1).cmp(&self.order(p2))
    }

    /// The smallest rectangle of tiles covering every point of `want`.
    pub fn section(&self, want: &IndexSpace) -> crate::Result<IndexSpace> {
        if want.rank() != self.rank() {
            return Err(crate::Error::general(format!(
                "section {want} has rank {}, tiling has rank {}",
                want.rank(),
                self.rank()
            )));
        }
        if want.is_empty() {
            return Ok(IndexSpace::new(vec![0; self.rank()], vec![0; self.rank()]));
        }
        let last = want.last();
        if let Some(d) = (0..self.rank()).find(|&d| last[d] >= self.index_shape[d]) {
            return Err(crate::Error::general(format!(
                "section {want} exceeds index space {:?} in dimension {d}",
                self.index_shape
            )));
        }
        let start = self.tile(want.origin());
        let end = self.tile(&last);
        let shape = start.iter().zip(&end).map(|(&s, &e)| e - s + 1).collect();
        Ok(IndexSpace::new(start, shape))
    }

    /// The element-space region covered by the chunk starting at `origin`.
    pub fn chunk_space(&self, origin: &[u64]) -> IndexSpace {
        IndexSpace::new(origin[..self.rank()].to_vec(), self.chunk.clone())
    }
}

/// Iterates the points of an [IndexSpace] in row-major order.
///
/// The last dimension turns fastest and carries into slower dimensions on overflow.
#[derive(Debug, Clone)]
pub struct Odometer {
    space: IndexSpace,
    counter: Vec<u64>,
    done: bool,
}

impl Odometer {
    pub fn new(space: IndexSpace) -> Self {
        let done = space.is_empty();
        let counter = vec![0; space.rank()];
        Self {
            space,
            counter,
            done,
        }
    }

    fn current(&self) -> Vec<u64> {
        self.counter
            .iter()
            .enumerate()
            .map(|(d, &k)| self.space.origin[d] + k * self.space.stride[d])
            .collect()
    }

    fn increment(&mut self) {
        for d in (0..self.counter.len()).rev() {
            self.counter[d] += 1;
            if self.counter[d] < self.space.shape[d] {
                return;
            }
            self.counter[d] = 0;
        }
        self.done = true;
    }
}

impl Iterator for Odometer {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let pt = self.current();
        self.increment();
        Some(pt)
    }
}

/// Splits a section into row-major pieces of about `max_elements` points each.
///
/// The innermost dimension is never split. Outer dimensions take as many rows as fit, so a
/// piece is never smaller than one innermost row. Pieces keep the section's stride.
#[derive(Debug, Clone)]
pub struct MaxChunker {
    space: IndexSpace,
    /// Points in one step of each dimension.
    strides: Vec<u64>,
    max_elements: u64,
    total: u64,
    done: u64,
}

impl MaxChunker {
    pub fn new(space: IndexSpace, max_elements: u64) -> Self {
        let rank = space.rank();
        let mut strides = vec![1u64; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            strides[d] = strides[d + 1].saturating_mul(space.shape[d + 1]);
        }
        let total = space.num_elements().unwrap_or(u64::MAX);
        Self {
            space,
            strides,
            max_elements,
            total,
            done: 0,
        }
    }
}

impl Iterator for MaxChunker {
    type Item = IndexSpace;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done >= self.total {
            return None;
        }
        let rank = self.space.rank();
        let mut rest = self.done;
        let cursor: Vec<u64> = self
            .strides
            .iter()
            .map(|&s| {
                let c = rest / s;
                rest %= s;
                c
            })
            .collect();
        let shape: Vec<u64> = (0..rank)
            .map(|d| {
                let left = self.space.shape[d] - cursor[d];
                if d + 1 == rank {
                    left
                } else {
                    (self.max_elements / self.strides[d]).clamp(1, left)
                }
            })
            .collect();
        self.done = self
            .done
            .saturating_add(shape.iter().product::<u64>().max(1));
        let origin = (0..rank)
            .map(|d| self.space.origin[d] + cursor[d] * self.space.stride[d])
            .collect();
        Some(IndexSpace {
            origin,
            shape,
            stride: self.space.stride.clone(),
        })
    }
}
