use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};

use crate::chunk::LegacyCompression;
use crate::config::ReaderConfig;
use crate::storage::Endian;

pub mod nbit;

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;

/// One entry of a variable's filter list, in the order it was applied when writing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterDescriptor {
    pub id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_values: Vec<u32>,
    /// Writers may leave an optional filter unapplied on individual chunks.
    #[serde(default)]
    pub optional: bool,
}

impl FilterDescriptor {
    pub fn new(id: u16, client_values: Vec<u32>) -> Self {
        Self {
            id,
            name: None,
            client_values,
            optional: false,
        }
    }

    pub fn deflate(level: u32) -> Self {
        Self::new(FILTER_DEFLATE, vec![level])
    }

    /// Byte shuffle; `element_size` of `None` uses the variable's element size.
    pub fn shuffle(element_size: Option<u32>) -> Self {
        Self::new(FILTER_SHUFFLE, element_size.into_iter().collect())
    }

    pub fn fletcher32() -> Self {
        Self::new(FILTER_FLETCHER32, vec![])
    }

    pub fn kind(&self) -> FilterKind {
        match self.id {
            FILTER_DEFLATE => FilterKind::Deflate,
            FILTER_SHUFFLE => FilterKind::Shuffle {
                element_size: self.client_values.first().map(|n| *n as usize),
            },
            FILTER_FLETCHER32 => FilterKind::Fletcher32,
            _ => FilterKind::Unsupported,
        }
    }

    fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} (id {})", self.id),
            None => format!("id {}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Deflate,
    Shuffle { element_size: Option<usize> },
    Fletcher32,
    Unsupported,
}

/// Undoes a variable's filter list on each stored chunk.
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    variable: String,
    filters: Vec<FilterDescriptor>,
    element_size: usize,
    max_output: u64,
    verify_checksums: bool,
    inflate_buffer_size: usize,
}

impl FilterPipeline {
    pub fn new(
        variable: &str,
        filters: Vec<FilterDescriptor>,
        element_size: usize,
        config: &ReaderConfig,
    ) -> Self {
        Self {
            variable: variable.to_string(),
            filters,
            element_size,
            max_output: config.max_buffer_bytes,
            verify_checksums: config.verify_checksums,
            inflate_buffer_size: config.inflate_buffer_size,
        }
    }

    pub fn filters(&self) -> &[FilterDescriptor] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Reverse the filter list on one chunk's stored bytes.
    ///
    /// Filters run last-to-first; a filter whose bit is set in `filter_mask` was not applied
    /// when writing and is skipped. `expected_len` is the decoded size of the chunk: deflate
    /// may not produce more than that plus the checksums still to be stripped after it.
    /// `address` is only used in error reports.
    pub fn decode(
        &self,
        raw: Bytes,
        filter_mask: u32,
        expected_len: usize,
        address: u64,
    ) -> crate::Result<Bytes> {
        let mut data = raw;
        for (idx, filter) in self.filters.iter().enumerate().rev() {
            if idx < 32 && (filter_mask >> idx) & 1 == 1 {
                if filter.optional {
                    log::trace!("{}: filter {} skipped by mask", self.variable, filter.id);
                } else {
                    log::warn!(
                        "{}: mandatory filter {} skipped by chunk mask at {address:#x}",
                        self.variable,
                        filter.display_name()
                    );
                }
                continue;
            }
            data = match filter.kind() {
                FilterKind::Deflate => {
                    let cap = self.inflate_cap(idx, filter_mask, expected_len);
                    Bytes::from(self.inflate(&data, cap, address)?)
                }
                FilterKind::Shuffle { element_size } => {
                    let n = element_size.unwrap_or(self.element_size);
                    if n <= 1 {
                        data
                    } else {
                        Bytes::from(unshuffle(&data, n))
                    }
                }
                FilterKind::Fletcher32 => self.strip_checksum(data, address)?,
                FilterKind::Unsupported => {
                    return Err(crate::Error::UnsupportedFilter {
                        variable: self.variable.clone(),
                        filter: filter.display_name(),
                    });
                }
            };
        }
        Ok(data)
    }

    /// Most bytes the deflate filter at `idx` may produce, or `None` when an earlier deflate
    /// stage leaves its output size open.
    fn inflate_cap(&self, idx: usize, filter_mask: u32, expected_len: usize) -> Option<u64> {
        let mut cap = expected_len as u64;
        for (i, filter) in self.filters[..idx].iter().enumerate() {
            if i < 32 && (filter_mask >> i) & 1 == 1 {
                continue;
            }
            match filter.kind() {
                FilterKind::Fletcher32 => cap += 4,
                FilterKind::Deflate | FilterKind::Unsupported => return None,
                FilterKind::Shuffle { .. } => {}
            }
        }
        Some(cap)
    }

    fn inflate(&self, data: &[u8], cap: Option<u64>, address: u64) -> crate::Result<Vec<u8>> {
        let limit = cap.map_or(self.max_output, |c| c.min(self.max_output));
        let hint = cap.map_or(data.len(), |c| c as usize);
        let out = inflate(data, hint, limit, self.inflate_buffer_size)?;
        if out.len() as u64 <= limit {
            return Ok(out);
        }
        match cap {
            Some(cap) if cap <= self.max_output => Err(crate::Error::structural(
                &self.variable,
                address,
                format!("deflate stream of at most {cap} bytes"),
                "a longer stream",
            )),
            _ => Err(crate::Error::SizeLimit {
                variable: self.variable.clone(),
                requested: out.len() as u64,
                limit: self.max_output,
            }),
        }
    }

    fn strip_checksum(&self, data: Bytes, address: u64) -> crate::Result<Bytes> {
        if data.len() < 4 {
            return Err(crate::Error::structural(
                &self.variable,
                address,
                "at least 4 bytes of fletcher32 checksum",
                format!("{} bytes", data.len()),
            ));
        }
        let body = data.slice(..data.len() - 4);
        if self.verify_checksums {
            let tail = &data[data.len() - 4..];
            let stored = Endian::Little.read_u32(tail);
            let computed = fletcher32(&body);
            // older writers stored the sum byte-swapped
            if stored != computed && stored != computed.swap_bytes() {
                return Err(crate::Error::ChecksumMismatch {
                    variable: self.variable.clone(),
                    address,
                    stored,
                    computed,
                });
            }
        }
        Ok(body)
    }
}

/// Inflate a zlib stream, stopping once `limit + 1` bytes have come out.
///
/// Callers compare the result's length against `limit` to tell a bounded stream from an
/// overlong one.
pub(crate) fn inflate<R: Read>(
    input: R,
    size_hint: usize,
    limit: u64,
    buffer_size: usize,
) -> crate::Result<Vec<u8>> {
    let decoder = ZlibDecoder::new_with_buf(input, vec![0; buffer_size.max(1)]);
    let mut out = Vec::with_capacity(size_hint.min(limit as usize));
    decoder.take(limit.saturating_add(1)).read_to_end(&mut out)?;
    Ok(out)
}

/// Undo a byte shuffle of `element_size`-byte elements.
///
/// Shuffled data holds byte 0 of every element, then byte 1 of every element, and so on.
/// Trailing bytes that do not fill a whole element were left in place.
pub fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    let n = element_size;
    let m = data.len() / n;
    let mut out = vec![0u8; data.len()];
    for j in 0..n {
        let plane = &data[j * m..(j + 1) * m];
        for (i, b) in plane.iter().enumerate() {
            out[i * n + j] = *b;
        }
    }
    out[m * n..].copy_from_slice(&data[m * n..]);
    out
}

/// The fletcher32 variant used for chunk checksums: big-endian 16-bit words, an odd trailing
/// byte padded with a zero low byte.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);
    loop {
        // 360 words keep both sums below overflow between folds
        let mut taken = 0;
        for w in words.by_ref().take(360) {
            sum1 += (u32::from(w[0]) << 8) | u32::from(w[1]);
            sum2 += sum1;
            taken += 1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
        if taken < 360 {
            break;
        }
    }
    if let [last] = words.remainder() {
        sum1 += u32::from(*last) << 8;
        sum2 += sum1;
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

/// Decode one chunk of the legacy dialect, whose compression is described per chunk.
pub fn decode_legacy<R: Read>(
    variable: &str,
    mut input: R,
    compression: &LegacyCompression,
    endian: Endian,
    config: &ReaderConfig,
) -> crate::Result<Vec<u8>> {
    match compression {
        LegacyCompression::Raw => {
            let mut out = Vec::new();
            input.read_to_end(&mut out)?;
            Ok(out)
        }
        LegacyCompression::Deflate {
            uncompressed_length,
            ..
        } => {
            let limit = *uncompressed_length;
            check_limit(variable, limit, config)?;
            let mut out = inflate(input, limit as usize, limit, config.inflate_buffer_size)?;
            out.truncate(limit as usize);
            Ok(out)
        }
        LegacyCompression::NBit {
            uncompressed_length,
            params,
        } => {
            check_limit(variable, *uncompressed_length, config)?;
            let mut packed = Vec::new();
            input.read_to_end(&mut packed)?;
            nbit::unpack(&packed, params, *uncompressed_length, endian)
        }
        LegacyCompression::Other { code } => Err(crate::Error::UnsupportedFilter {
            variable: variable.to_string(),
            filter: format!("legacy compression code {code}"),
        }),
    }
}

fn check_limit(variable: &str, requested: u64, config: &ReaderConfig) -> crate::Result<()> {
    if requested > config.max_buffer_bytes {
        return Err(crate::Error::SizeLimit {
            variable: variable.to_string(),
            requested,
            limit: config.max_buffer_bytes,
        });
    }
    Ok(())
}
