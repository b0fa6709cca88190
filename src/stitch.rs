//! Copying the overlap of one chunk into a destination section.
//!
//! A [`Stitcher`] walks the points shared by a chunk's index space and the wanted index
//! space in row-major order, grouped into the longest runs that are contiguous in both
//! buffers. Offsets and lengths are in elements.
use crate::array::FillValue;
use crate::tiling::{IndexSpace, Odometer};

/// One contiguous copy: `len` elements from `src` in the chunk to `dst` in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
struct OuterDim {
    /// `want.origin - chunk.origin`, as a signed offset.
    offset: i128,
    want_stride: u64,
    src_stride: u64,
    dst_stride: u64,
}

/// Iterator over the [Transfer]s between a chunk and a wanted region.
#[derive(Debug, Clone)]
pub struct Stitcher {
    counters: Option<Odometer>,
    outer: Vec<OuterDim>,
    base_src: u64,
    base_dst: u64,
    run: u64,
}

fn row_major_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

impl Stitcher {
    /// `chunk` must have unit stride; `want` may be strided.
    pub fn new(chunk: &IndexSpace, want: &IndexSpace) -> Self {
        let rank = want.rank();
        let Some(ranges) = want.selected_within(chunk.origin(), chunk.shape()) else {
            return Self {
                counters: None,
                outer: Vec::new(),
                base_src: 0,
                base_dst: 0,
                run: 0,
            };
        };
        let count: Vec<u64> = ranges.iter().map(|&(lo, hi)| hi - lo + 1).collect();
        let stride = want.stride();
        let src_strides = row_major_strides(chunk.shape());
        let dst_strides = row_major_strides(want.shape());

        // dimensions outer_rank.. are folded into each run
        let (mut outer_rank, mut run) = match rank {
            0 => (0, 1),
            r if stride[r - 1] != 1 => (r, 1),
            r => (r - 1, count[r - 1]),
        };
        while outer_rank > 0 && outer_rank < rank {
            let d = outer_rank;
            let full = count[d] == chunk.shape()[d] && count[d] == want.shape()[d];
            if !full || stride[d - 1] != 1 {
                break;
            }
            outer_rank -= 1;
            run *= count[outer_rank];
        }

        let coord = |d: usize, k: u64| want.origin()[d] + k * stride[d];
        let mut base_src = 0;
        let mut base_dst = 0;
        for d in outer_rank..rank {
            let lo = ranges[d].0;
            base_src += (coord(d, lo) - chunk.origin()[d]) * src_strides[d];
            base_dst += lo * dst_strides[d];
        }
        let outer = (0..outer_rank)
            .map(|d| OuterDim {
                offset: i128::from(want.origin()[d]) - i128::from(chunk.origin()[d]),
                want_stride: stride[d],
                src_stride: src_strides[d],
                dst_stride: dst_strides[d],
            })
            .collect();
        let counters = Odometer::new(IndexSpace::new(
            ranges[..outer_rank].iter().map(|&(lo, _)| lo).collect(),
            count[..outer_rank].to_vec(),
        ));
        Self {
            counters: Some(counters),
            outer,
            base_src,
            base_dst,
            run,
        }
    }

    /// Copy every run from `src` (the decoded chunk) into `dst` (the destination section).
    ///
    /// Returns the number of runs copied.
    pub fn transfer(self, src: &[u8], element_size: usize, dst: &mut [u8]) -> usize {
        let mut runs = 0;
        for t in self {
            let s = t.src as usize * element_size;
            let d = t.dst as usize * element_size;
            let n = t.len as usize * element_size;
            dst[d..d + n].copy_from_slice(&src[s..s + n]);
            runs += 1;
        }
        runs
    }

    /// Write `fill` into every destination run, as for a chunk that was never written.
    ///
    /// Without a fill value (or with an all-zero one) the destination is assumed zeroed and
    /// left untouched. Returns the number of runs.
    pub fn transfer_fill(
        self,
        fill: Option<&FillValue>,
        element_size: usize,
        dst: &mut [u8],
    ) -> usize {
        let pattern = match fill {
            Some(f) if !f.is_zero() => f.as_bytes(),
            _ => return self.count(),
        };
        let mut runs = 0;
        for t in self {
            let d = t.dst as usize * element_size;
            let n = t.len as usize * element_size;
            for elem in dst[d..d + n].chunks_exact_mut(element_size) {
                elem.copy_from_slice(pattern);
            }
            runs += 1;
        }
        runs
    }
}

impl Iterator for Stitcher {
    type Item = Transfer;

    fn next(&mut self) -> Option<Transfer> {
        let k = self.counters.as_mut()?.next()?;
        let mut src = self.base_src;
        let mut dst = self.base_dst;
        for (dim, &kd) in self.outer.iter().zip(&k) {
            let within = dim.offset + i128::from(kd * dim.want_stride);
            src += within as u64 * dim.src_stride;
            dst += kd * dim.dst_stride;
        }
        Some(Transfer {
            src,
            dst,
            len: self.run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(origin: &[u64], shape: &[u64]) -> IndexSpace {
        IndexSpace::new(origin.to_vec(), shape.to_vec())
    }

    fn runs(chunk: &IndexSpace, want: &IndexSpace) -> Vec<(u64, u64, u64)> {
        Stitcher::new(chunk, want)
            .map(|t| (t.src, t.dst, t.len))
            .collect()
    }

    #[test]
    fn chunk_inside_larger_want() {
        let chunk = space(&[2, 2], &[2, 2]);
        let want = space(&[0, 0], &[4, 4]);
        assert_eq!(runs(&chunk, &want), vec![(0, 10, 2), (2, 14, 2)]);
    }

    #[test]
    fn identical_spaces_are_one_run() {
        let chunk = space(&[4, 0, 2], &[2, 3, 2]);
        assert_eq!(runs(&chunk, &chunk.clone()), vec![(0, 0, 12)]);
    }

    #[test]
    fn full_rows_merge() {
        let chunk = space(&[0, 0], &[2, 4]);
        let want = space(&[0, 0], &[3, 4]);
        assert_eq!(runs(&chunk, &want), vec![(0, 0, 8)]);
    }

    #[test]
    fn partial_inner_dimension_does_not_merge() {
        let chunk = space(&[0, 0], &[2, 4]);
        let want = space(&[0, 1], &[2, 2]);
        assert_eq!(runs(&chunk, &want), vec![(1, 0, 2), (5, 2, 2)]);
    }

    #[test]
    fn chunk_past_the_logical_edge_is_clipped() {
        // 3x4 variable, chunk covering rows 2..4
        let chunk = space(&[2, 0], &[2, 4]);
        let want = space(&[0, 0], &[3, 4]);
        assert_eq!(runs(&chunk, &want), vec![(0, 8, 4)]);
    }

    #[test]
    fn strided_want_gives_single_elements() {
        let chunk = space(&[0, 0], &[4, 4]);
        let want = IndexSpace::with_stride(vec![0, 1], vec![2, 2], vec![2, 2]).unwrap();
        assert_eq!(
            runs(&chunk, &want),
            vec![(1, 0, 1), (3, 1, 1), (9, 2, 1), (11, 3, 1)]
        );
    }

    #[test]
    fn strided_outer_dimension_keeps_inner_runs() {
        let chunk = space(&[0, 0], &[4, 3]);
        let want = IndexSpace::with_stride(vec![1, 0], vec![2, 3], vec![2, 1]).unwrap();
        assert_eq!(runs(&chunk, &want), vec![(3, 0, 3), (9, 3, 3)]);
    }

    #[test]
    fn disjoint_spaces_have_no_runs() {
        let chunk = space(&[0, 0], &[2, 2]);
        let want = space(&[2, 0], &[2, 2]);
        assert!(runs(&chunk, &want).is_empty());
    }

    #[test]
    fn fill_writes_pattern() {
        let chunk = space(&[0, 2], &[2, 2]);
        let want = space(&[0, 0], &[2, 4]);
        let mut dst = vec![0u8; 8 * 2];
        let fill = FillValue::new(vec![0xab, 0xcd]);
        let n = Stitcher::new(&chunk, &want).transfer_fill(Some(&fill), 2, &mut dst);
        assert_eq!(n, 2);
        let cells: Vec<_> = dst.chunks(2).map(|c| c == [0xab, 0xcd]).collect();
        assert_eq!(
            cells,
            vec![false, false, true, true, false, false, true, true]
        );

        let mut zeros = vec![0u8; 16];
        Stitcher::new(&chunk, &want).transfer_fill(None, 2, &mut zeros);
        assert!(zeros.iter().all(|&b| b == 0));
    }

    /// Stitch every chunk of a variable whose element values are their own linear index and
    /// compare against direct indexing.
    #[test]
    fn stitching_matches_pointwise_copy() {
        let shape = [5u64, 7];
        let chunk_shape = [2u64, 3];
        let tiling = crate::tiling::Tiling::new(&shape, &chunk_shape).unwrap();
        let wants = [
            IndexSpace::new(vec![0, 0], vec![5, 7]),
            IndexSpace::new(vec![1, 2], vec![3, 4]),
            IndexSpace::with_stride(vec![0, 1], vec![3, 3], vec![2, 2]).unwrap(),
            IndexSpace::with_stride(vec![1, 0], vec![2, 7], vec![3, 1]).unwrap(),
        ];
        for want in wants {
            let mut dst = vec![u8::MAX; want.num_elements().unwrap() as usize];
            for tile in Odometer::new(tiling.section(&want).unwrap()) {
                let origin = tiling.index(&tile);
                let chunk = tiling.chunk_space(&origin);
                // chunk buffer: value = linear index into the variable, clipped to u8
                let src: Vec<u8> = Odometer::new(chunk.clone())
                    .map(|p| (p[0] * shape[1] + p[1]) as u8)
                    .collect();
                Stitcher::new(&chunk, &want).transfer(&src, 1, &mut dst);
            }
            let expected: Vec<u8> = Odometer::new(want.clone())
                .map(|p| (p[0] * shape[1] + p[1]) as u8)
                .collect();
            assert_eq!(dst, expected, "want {want}");
        }
    }
}
