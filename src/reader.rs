//! Reading sections of one variable.
//!
//! [`ChunkedArrayReader`] turns a wanted [`IndexSpace`] into a [`TypedArray`], either in one
//! shot ([`ChunkedArrayReader::read_section`]) or one chunk at a time
//! ([`ChunkedArrayReader::iter_chunks`]). Chunked variables go through the chunk index,
//! the filter pipeline and the stitcher; the other storage layouts are treated as a single
//! chunk covering the whole variable.
use std::sync::Arc;

use bytes::Bytes;

use crate::array::{HeapResolver, TypedArray};
use crate::chunk::{ChunkEntry, ChunkLocation};
use crate::config::ReaderConfig;
use crate::filter::{FilterPipeline, decode_legacy};
use crate::index::{self, ChunkIndex};
use crate::metadata::{StorageLayout, VariableDescriptor};
use crate::stitch::Stitcher;
use crate::storage::{LinkedReader, ReadAt, undefined_address};
use crate::tiling::{IndexSpace, MaxChunker, Tiling};

/// Counters over the life of one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Stored chunks read and decoded.
    pub chunks_decoded: u64,
    /// Tiles with no stored chunk, filled instead.
    pub chunks_missing: u64,
    /// Contiguous copies (or fills) into destination buffers.
    pub transfers: u64,
}

/// Reads sections of one variable from `file`.
pub struct ChunkedArrayReader<'a, R: ?Sized> {
    pub(crate) file: &'a R,
    pub(crate) descriptor: VariableDescriptor,
    pub(crate) config: ReaderConfig,
    pub(crate) pipeline: FilterPipeline,
    index: Option<Box<dyn ChunkIndex + 'a>>,
    heap: Option<Arc<dyn HeapResolver + Send + Sync>>,
    pub(crate) stats: ReadStats,
}

impl<'a, R: ReadAt + ?Sized> ChunkedArrayReader<'a, R> {
    pub fn new(
        file: &'a R,
        descriptor: VariableDescriptor,
        config: ReaderConfig,
    ) -> crate::Result<Self> {
        descriptor.validate()?;
        let filters = match &descriptor.storage {
            StorageLayout::Chunked { filters, .. } => filters.clone(),
            _ => Vec::new(),
        };
        let pipeline = FilterPipeline::new(
            &descriptor.name,
            filters,
            descriptor.element_size,
            &config,
        );
        Ok(Self {
            file,
            descriptor,
            config,
            pipeline,
            index: None,
            heap: None,
            stats: ReadStats::default(),
        })
    }

    /// Resolver for variable-length elements.
    pub fn with_heap_resolver(mut self, resolver: Arc<dyn HeapResolver + Send + Sync>) -> Self {
        self.heap = Some(resolver);
        self
    }

    pub fn descriptor(&self) -> &VariableDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// The variable's chunk index, opened on first use.
    pub fn index(&mut self) -> crate::Result<&mut (dyn ChunkIndex + 'a)> {
        let index = match self.index.take() {
            Some(index) => index,
            None => index::open(self.file, &self.descriptor)?,
        };
        Ok(&mut **self.index.insert(index))
    }

    /// Read the whole variable.
    pub fn read_all(&mut self) -> crate::Result<TypedArray> {
        let want = IndexSpace::from_shape(&self.descriptor.shape);
        self.read_section(&want)
    }

    /// Read `want` into a new array of shape `want.shape()`.
    ///
    /// The section is checked against the variable's shape and the buffer limit before any
    /// I/O. There are no partial results: any failure fails the whole read.
    pub fn read_section(&mut self, want: &IndexSpace) -> crate::Result<TypedArray> {
        let nbytes = self.check_section(want)?;
        if nbytes == 0 {
            return self.wrap(want.shape().to_vec(), Vec::new());
        }
        let bytes = if self.descriptor.storage.is_chunked() {
            self.read_chunked(want, nbytes)?
        } else {
            let mut dst = vec![0u8; nbytes];
            let runs = self.read_unchunked(want, &mut dst)?;
            self.stats.transfers += runs as u64;
            dst
        };
        self.wrap(want.shape().to_vec(), bytes)
    }

    /// Stream `want` one chunk at a time.
    ///
    /// Each item is the part of `want` inside one chunk, as an array and the region it covers.
    /// Layouts without chunks are cut into pieces of about `config.max_stream_elements`
    /// elements, each spanning whole innermost rows.
    pub fn iter_chunks(&mut self, want: &IndexSpace) -> crate::Result<ChunkIter<'_, 'a, R>> {
        self.check_bounds(want)?;
        let mut pieces = None;
        let (tiling, entries) = if want.is_empty() {
            (None, Vec::new())
        } else if self.descriptor.storage.is_chunked() {
            let index = self.index()?;
            let entries = index.list_chunks_for_region(want)?;
            (Some(index.tiling().clone()), entries)
        } else {
            pieces = Some(MaxChunker::new(want.clone(), self.config.max_stream_elements));
            (None, Vec::new())
        };
        Ok(ChunkIter {
            reader: self,
            want: want.clone(),
            tiling,
            entries: entries.into_iter(),
            pieces,
        })
    }

    fn check_bounds(&self, want: &IndexSpace) -> crate::Result<()> {
        let name = &self.descriptor.name;
        if want.rank() != self.descriptor.rank() {
            return Err(crate::Error::invalid_section(
                name,
                format!(
                    "section {want} has rank {}, variable has rank {}",
                    want.rank(),
                    self.descriptor.rank()
                ),
            ));
        }
        if want.is_empty() {
            return Ok(());
        }
        let last = want.last();
        if let Some(d) = (0..want.rank()).find(|&d| last[d] >= self.descriptor.shape[d]) {
            return Err(crate::Error::invalid_section(
                name,
                format!(
                    "section {want} exceeds shape {:?} in dimension {d}",
                    self.descriptor.shape
                ),
            ));
        }
        Ok(())
    }

    /// Validate `want` and return the size of its destination buffer in bytes.
    pub(crate) fn check_section(&self, want: &IndexSpace) -> crate::Result<usize> {
        self.check_bounds(want)?;
        let requested = want
            .num_elements()
            .and_then(|n| n.checked_mul(self.descriptor.element_size as u64))
            .unwrap_or(u64::MAX);
        if requested > self.config.max_buffer_bytes {
            return Err(crate::Error::SizeLimit {
                variable: self.descriptor.name.clone(),
                requested,
                limit: self.config.max_buffer_bytes,
            });
        }
        usize::try_from(requested).map_err(|_| crate::Error::SizeLimit {
            variable: self.descriptor.name.clone(),
            requested,
            limit: usize::MAX as u64,
        })
    }

    pub(crate) fn decoder(&self) -> crate::Result<ChunkDecoder<'_, R>> {
        let chunk_shape = self.descriptor.storage.chunk_shape().unwrap_or(&[]);
        let chunk_bytes = chunk_shape[..self.descriptor.rank().min(chunk_shape.len())]
            .iter()
            .try_fold(self.descriptor.element_size as u64, |acc, &n| {
                acc.checked_mul(n)
            })
            .filter(|&n| n <= self.config.max_buffer_bytes)
            .ok_or_else(|| crate::Error::SizeLimit {
                variable: self.descriptor.name.clone(),
                requested: u64::MAX,
                limit: self.config.max_buffer_bytes,
            })?;
        Ok(ChunkDecoder {
            file: self.file,
            descriptor: &self.descriptor,
            pipeline: &self.pipeline,
            config: &self.config,
            chunk_bytes: chunk_bytes as usize,
        })
    }

    fn read_chunked(&mut self, want: &IndexSpace, nbytes: usize) -> crate::Result<Vec<u8>> {
        let index = self.index()?;
        let entries = index.list_chunks_for_region(want)?;
        let tiling = index.tiling().clone();
        log::debug!(
            "{}: reading {want} from {} chunks",
            self.descriptor.name,
            entries.len()
        );

        if let [entry] = entries.as_slice()
            && !entry.is_missing()
            && tiling.chunk_space(entry.origin()) == *want
        {
            let data = self.decoder()?.decode(entry)?;
            self.stats.chunks_decoded += 1;
            self.stats.transfers += 1;
            return Ok(Vec::from(data.slice(..nbytes)));
        }

        let mut dst = vec![0u8; nbytes];
        for entry in &entries {
            self.stitch_entry(entry, &tiling, want, &mut dst)?;
        }
        Ok(dst)
    }

    /// Decode (or fill) one entry and stitch it into `dst`, which holds `want`.
    fn stitch_entry(
        &mut self,
        entry: &ChunkEntry,
        tiling: &Tiling,
        want: &IndexSpace,
        dst: &mut [u8],
    ) -> crate::Result<()> {
        let element_size = self.descriptor.element_size;
        let chunk = tiling.chunk_space(entry.origin());
        let stitcher = Stitcher::new(&chunk, want);
        let runs = if entry.is_missing() {
            log::trace!("{}: chunk {chunk} missing", self.descriptor.name);
            self.stats.chunks_missing += 1;
            stitcher.transfer_fill(self.descriptor.fill_value.as_ref(), element_size, dst)
        } else {
            let data = self.decoder()?.decode(entry)?;
            self.stats.chunks_decoded += 1;
            stitcher.transfer(&data, element_size, dst)
        };
        self.stats.transfers += runs as u64;
        Ok(())
    }

    /// Read from a layout without chunks, treating the variable as one chunk.
    fn read_unchunked(&self, want: &IndexSpace, dst: &mut [u8]) -> crate::Result<usize> {
        let es = self.descriptor.element_size;
        let whole = IndexSpace::from_shape(&self.descriptor.shape);
        let stitcher = Stitcher::new(&whole, want);
        match &self.descriptor.storage {
            StorageLayout::Contiguous {
                address,
                offset_size,
            } => match address.filter(|&a| a != undefined_address(*offset_size)) {
                None => Ok(stitcher.transfer_fill(self.descriptor.fill_value.as_ref(), es, dst)),
                Some(address) => {
                    let mut runs = 0;
                    for t in stitcher {
                        let d = t.dst as usize * es;
                        let n = t.len as usize * es;
                        self.file
                            .read_exact_at(&mut dst[d..d + n], address + t.src * es as u64)?;
                        runs += 1;
                    }
                    Ok(runs)
                }
            },
            StorageLayout::Compact { data } => Ok(stitcher.transfer(data, es, dst)),
            StorageLayout::LinkedSegments { segments } => {
                let mut linked = LinkedReader::new(self.file, segments.clone());
                let mut runs = 0;
                for t in stitcher {
                    let d = t.dst as usize * es;
                    let n = t.len as usize * es;
                    linked.read_exact_at_logical(t.src * es as u64, &mut dst[d..d + n])?;
                    runs += 1;
                }
                Ok(runs)
            }
            other => Err(crate::Error::invalid_descriptor(
                &self.descriptor.name,
                format!("{} storage is chunked", other.kind_name()),
            )),
        }
    }

    pub(crate) fn wrap(&self, shape: Vec<u64>, bytes: Vec<u8>) -> crate::Result<TypedArray> {
        let d = &self.descriptor;
        TypedArray::from_bytes(
            &d.name,
            shape,
            d.datatype,
            d.element_size,
            d.endian,
            bytes,
            self.heap.as_ref().map(|h| h.as_ref() as &dyn HeapResolver),
        )
    }

    /// Read the part of `want` covered by one chunk.
    fn read_part(
        &mut self,
        entry: &ChunkEntry,
        tiling: &Tiling,
        want: &IndexSpace,
    ) -> crate::Result<(TypedArray, IndexSpace)> {
        let chunk = tiling.chunk_space(entry.origin());
        let part = want.intersect(&chunk).ok_or_else(|| {
            crate::Error::general(format!("chunk {chunk} does not overlap section {want}"))
        })?;
        let nbytes = self.check_section(&part)?;
        if !entry.is_missing() && part == chunk {
            // whole chunk wanted: hand back the decoded buffer itself
            let data = self.decoder()?.decode(entry)?;
            self.stats.chunks_decoded += 1;
            self.stats.transfers += 1;
            let bytes = Vec::from(data.slice(..nbytes));
            return Ok((self.wrap(part.shape().to_vec(), bytes)?, part));
        }
        let mut dst = vec![0u8; nbytes];
        self.stitch_entry(entry, tiling, &part, &mut dst)?;
        Ok((self.wrap(part.shape().to_vec(), dst)?, part))
    }
}

/// Decodes stored chunks. Shares nothing mutable, so one decoder can serve several threads.
pub(crate) struct ChunkDecoder<'r, R: ?Sized> {
    file: &'r R,
    descriptor: &'r VariableDescriptor,
    pipeline: &'r FilterPipeline,
    config: &'r ReaderConfig,
    /// Decoded size of a whole chunk.
    chunk_bytes: usize,
}

impl<R: ReadAt + ?Sized> ChunkDecoder<'_, R> {
    /// Read and decode one stored chunk, returning at least `chunk_bytes` bytes.
    pub(crate) fn decode(&self, entry: &ChunkEntry) -> crate::Result<Bytes> {
        let name = &self.descriptor.name;
        if entry.size() > self.config.max_buffer_bytes {
            return Err(crate::Error::SizeLimit {
                variable: name.clone(),
                requested: entry.size(),
                limit: self.config.max_buffer_bytes,
            });
        }
        let address = match entry.location() {
            ChunkLocation::Address(a) => *a,
            ChunkLocation::Linked(segments) => segments.first().map_or(0, |s| s.address),
            ChunkLocation::Missing => {
                return Err(crate::Error::general(format!(
                    "{name}: no stored data for chunk at {:?}",
                    entry.origin()
                )));
            }
        };
        log::trace!(
            "{name}: decoding chunk {:?} at {address:#x}, {} bytes stored",
            entry.origin(),
            entry.size()
        );

        let decoded = match (entry.legacy_compression(), entry.location()) {
            (Some(compression), ChunkLocation::Linked(segments)) => {
                let linked = LinkedReader::new(self.file, segments.clone());
                Bytes::from(decode_legacy(
                    name,
                    linked,
                    compression,
                    self.descriptor.endian,
                    self.config,
                )?)
            }
            (Some(compression), _) => {
                let raw = self.file.read_bytes_at(address, entry.size() as usize)?;
                Bytes::from(decode_legacy(
                    name,
                    &raw[..],
                    compression,
                    self.descriptor.endian,
                    self.config,
                )?)
            }
            (None, ChunkLocation::Linked(segments)) => {
                let mut raw = vec![0u8; entry.size() as usize];
                LinkedReader::new(self.file, segments.clone()).read_exact_at_logical(0, &mut raw)?;
                self.pipeline
                    .decode(Bytes::from(raw), entry.filter_mask(), self.chunk_bytes, address)?
            }
            (None, _) => {
                let raw = self.file.read_bytes_at(address, entry.size() as usize)?;
                self.pipeline
                    .decode(raw, entry.filter_mask(), self.chunk_bytes, address)?
            }
        };

        if decoded.len() < self.chunk_bytes {
            return Err(crate::Error::structural(
                name,
                address,
                format!("decoded chunk of {} bytes", self.chunk_bytes),
                format!("{} bytes", decoded.len()),
            ));
        }
        if decoded.len() > self.chunk_bytes {
            log::warn!(
                "{name}: chunk at {address:#x} decoded to {} bytes, expected {}; ignoring the excess",
                decoded.len(),
                self.chunk_bytes
            );
        }
        Ok(decoded)
    }
}

/// Streams a section chunk by chunk. Created by [ChunkedArrayReader::iter_chunks].
pub struct ChunkIter<'r, 'a, R: ?Sized> {
    reader: &'r mut ChunkedArrayReader<'a, R>,
    want: IndexSpace,
    tiling: Option<Tiling>,
    entries: std::vec::IntoIter<ChunkEntry>,
    /// Pieces of `want` for layouts without chunks.
    pieces: Option<MaxChunker>,
}

impl<R: ReadAt + ?Sized> Iterator for ChunkIter<'_, '_, R> {
    type Item = crate::Result<(TypedArray, IndexSpace)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(pieces) = &mut self.pieces {
            let part = pieces.next()?;
            return Some(self.reader.read_section(&part).map(|a| (a, part)));
        }
        let entry = self.entries.next()?;
        let tiling = self.tiling.as_ref()?;
        Some(self.reader.read_part(&entry, tiling, &self.want))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.pieces {
            Some(pieces) => pieces.size_hint(),
            None => (self.entries.len(), Some(self.entries.len())),
        }
    }
}
