//! Typed, shaped views of decoded element bytes.
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metadata::Datatype;
use crate::storage::Endian;

/// Resolves variable-length elements stored outside the chunk.
///
/// Each element of a variable-length variable is a fixed-width reference
/// (typically a length, a heap address and an object index); the schema layer knows how
/// to follow it.
pub trait HeapResolver {
    fn resolve(&self, reference: &[u8]) -> crate::Result<Bytes>;
}

/// One element's worth of bytes, in the variable's byte order, used for never-written chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FillValue(Vec<u8>);

impl FillValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encode a scalar in `endian` order.
    pub fn from_element<T: Element>(value: T, endian: Endian) -> Self {
        let mut bytes = vec![0u8; std::mem::size_of::<T>()];
        value.write(endian, &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether filling with this value leaves a zeroed buffer unchanged.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

/// Decoded values, one variant per element representation.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValues {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    /// Fixed-width records left for the caller to interpret: opaque blobs, fixed-length
    /// strings and compound records.
    Fixed { element_size: usize, bytes: Vec<u8> },
    /// Variable-length elements after heap resolution.
    VarLen(Vec<Bytes>),
}

impl ArrayValues {
    pub fn len(&self) -> usize {
        match self {
            ArrayValues::Int8(v) => v.len(),
            ArrayValues::UInt8(v) => v.len(),
            ArrayValues::Int16(v) => v.len(),
            ArrayValues::UInt16(v) => v.len(),
            ArrayValues::Int32(v) => v.len(),
            ArrayValues::UInt32(v) => v.len(),
            ArrayValues::Int64(v) => v.len(),
            ArrayValues::UInt64(v) => v.len(),
            ArrayValues::Float32(v) => v.len(),
            ArrayValues::Float64(v) => v.len(),
            ArrayValues::Fixed {
                element_size,
                bytes,
            } => bytes.len().checked_div(*element_size).unwrap_or(0),
            ArrayValues::VarLen(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A native scalar type an array can hold.
pub trait Element: Copy + Sized {
    fn slice(values: &ArrayValues) -> Option<&[Self]>;

    fn write(self, endian: Endian, buf: &mut [u8]);
}

impl Element for i8 {
    fn slice(values: &ArrayValues) -> Option<&[Self]> {
        match values {
            ArrayValues::Int8(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn write(self, _endian: Endian, buf: &mut [u8]) {
        buf[0] = self as u8;
    }
}

impl Element for u8 {
    fn slice(values: &ArrayValues) -> Option<&[Self]> {
        match values {
            ArrayValues::UInt8(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn write(self, _endian: Endian, buf: &mut [u8]) {
        buf[0] = self;
    }
}

macro_rules! multibyte_element {
    ($t:ty, $variant:ident, $write:ident) => {
        impl Element for $t {
            fn slice(values: &ArrayValues) -> Option<&[Self]> {
                match values {
                    ArrayValues::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn write(self, endian: Endian, buf: &mut [u8]) {
                match endian {
                    Endian::Little => LittleEndian::$write(buf, self),
                    Endian::Big => BigEndian::$write(buf, self),
                }
            }
        }
    };
}

multibyte_element!(i16, Int16, write_i16);
multibyte_element!(u16, UInt16, write_u16);
multibyte_element!(i32, Int32, write_i32);
multibyte_element!(u32, UInt32, write_u32);
multibyte_element!(i64, Int64, write_i64);
multibyte_element!(u64, UInt64, write_u64);
multibyte_element!(f32, Float32, write_f32);
multibyte_element!(f64, Float64, write_f64);

/// A row-major array of decoded elements.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    shape: Vec<u64>,
    datatype: Datatype,
    values: ArrayValues,
}

macro_rules! read_into {
    ($bytes:expr, $endian:expr, $n:expr, $t:ty, $read:ident, $variant:ident) => {{
        let mut out = vec![<$t>::default(); $n];
        match $endian {
            Endian::Little => LittleEndian::$read($bytes, &mut out),
            Endian::Big => BigEndian::$read($bytes, &mut out),
        }
        ArrayValues::$variant(out)
    }};
}

impl TypedArray {
    /// Interpret `bytes` as `shape` elements of `datatype`, stored in `endian` order.
    ///
    /// Variable-length elements need `resolver`.
    pub fn from_bytes(
        variable: &str,
        shape: Vec<u64>,
        datatype: Datatype,
        element_size: usize,
        endian: Endian,
        bytes: Vec<u8>,
        resolver: Option<&dyn HeapResolver>,
    ) -> crate::Result<Self> {
        let n = shape.iter().product::<u64>() as usize;
        if bytes.len() != n * element_size {
            return Err(crate::Error::general(format!(
                "{variable}: {} bytes do not hold {n} elements of {element_size} bytes",
                bytes.len()
            )));
        }
        if let Some(size) = datatype.fixed_size()
            && size != element_size
        {
            return Err(crate::Error::invalid_descriptor(
                variable,
                format!("{datatype:?} elements are {size} bytes, not {element_size}"),
            ));
        }
        let b = bytes.as_slice();
        let values = match datatype {
            Datatype::Int8 => ArrayValues::Int8(bytes.iter().map(|&x| x as i8).collect()),
            Datatype::UInt8 => ArrayValues::UInt8(bytes),
            Datatype::Int16 => read_into!(b, endian, n, i16, read_i16_into, Int16),
            Datatype::UInt16 => read_into!(b, endian, n, u16, read_u16_into, UInt16),
            Datatype::Int32 => read_into!(b, endian, n, i32, read_i32_into, Int32),
            Datatype::UInt32 => read_into!(b, endian, n, u32, read_u32_into, UInt32),
            Datatype::Int64 => read_into!(b, endian, n, i64, read_i64_into, Int64),
            Datatype::UInt64 => read_into!(b, endian, n, u64, read_u64_into, UInt64),
            Datatype::Float32 => read_into!(b, endian, n, f32, read_f32_into, Float32),
            Datatype::Float64 => read_into!(b, endian, n, f64, read_f64_into, Float64),
            Datatype::Opaque | Datatype::String | Datatype::Compound => ArrayValues::Fixed {
                element_size,
                bytes,
            },
            Datatype::VarLen => {
                let resolver = resolver.ok_or_else(|| crate::Error::MissingHeapResolver {
                    variable: variable.to_string(),
                })?;
                let elements = bytes
                    .chunks_exact(element_size.max(1))
                    .map(|r| resolver.resolve(r))
                    .collect::<crate::Result<Vec<_>>>()?;
                ArrayValues::VarLen(elements)
            }
        };
        Ok(Self {
            shape,
            datatype,
            values,
        })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn values(&self) -> &ArrayValues {
        &self.values
    }

    pub fn into_values(self) -> ArrayValues {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The elements as native scalars, if `T` matches the datatype.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.values)
    }

    /// The element at row-major coordinate `pt`.
    pub fn get<T: Element>(&self, pt: &[u64]) -> Option<T> {
        if pt.len() != self.shape.len() || pt.iter().zip(&self.shape).any(|(&p, &n)| p >= n) {
            return None;
        }
        let idx = pt
            .iter()
            .zip(&self.shape)
            .fold(0u64, |acc, (&p, &n)| acc * n + p);
        self.as_slice::<T>()?.get(idx as usize).copied()
    }
}
