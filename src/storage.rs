//! Positioned, read-only access to the bytes of an open file.
//!
//! Everything in the crate reads through [`ReadAt`]: an explicit-offset read with no shared
//! cursor, so one handle can serve several readers (and threads) at once.
//! The one exception is [`LinkedReader`], which walks legacy linked storage strictly forwards.
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod linked;

pub use linked::{LinkedReader, Segment};

/// Byte order of multi-byte values on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    /// Read an unsigned integer of `nbytes` (1..=8) bytes.
    pub fn read_uint(self, buf: &[u8], nbytes: usize) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_uint(buf, nbytes),
            Endian::Big => BigEndian::read_uint(buf, nbytes),
        }
    }

    /// Write the low `nbytes` (1..=8) bytes of `value`.
    pub fn write_uint(self, buf: &mut [u8], value: u64, nbytes: usize) {
        match self {
            Endian::Little => LittleEndian::write_uint(buf, value, nbytes),
            Endian::Big => BigEndian::write_uint(buf, value, nbytes),
        }
    }
}

/// The "undefined address" marker for an address field of `offset_size` bytes: all bits set.
pub fn undefined_address(offset_size: u8) -> u64 {
    match offset_size {
        0 => 0,
        n if n >= 8 => u64::MAX,
        n => (1u64 << (8 * n as u32)) - 1,
    }
}

/// Read N bytes at an absolute offset.
pub trait ReadAt {
    /// Fill `buf` from the bytes starting at `offset`, failing if fewer are available.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()>;

    /// Read `len` bytes starting at `offset`.
    fn read_bytes_at(&self, offset: u64, len: usize) -> crate::Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(&mut buf, offset)?;
        Ok(Bytes::from(buf))
    }
}

fn eof(offset: u64, len: usize, available: usize) -> crate::Error {
    crate::Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} is past the end ({available} bytes)"),
    ))
}

fn slice_range(offset: u64, len: usize, available: usize) -> crate::Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| eof(offset, len, available))?;
    match start.checked_add(len) {
        Some(end) if end <= available => Ok(start..end),
        _ => Err(eof(offset, len, available)),
    }
}

impl ReadAt for [u8] {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let range = slice_range(offset, buf.len(), self.len())?;
        buf.copy_from_slice(&self[range]);
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        self.as_slice().read_exact_at(buf, offset)
    }
}

impl ReadAt for Bytes {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        self.as_ref().read_exact_at(buf, offset)
    }

    fn read_bytes_at(&self, offset: u64, len: usize) -> crate::Result<Bytes> {
        let range = slice_range(offset, len, self.len())?;
        Ok(self.slice(range))
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        use std::os::unix::fs::FileExt;
        FileExt::read_exact_at(self, buf, offset)?;
        Ok(())
    }
}

#[cfg(windows)]
impl ReadAt for std::fs::File {
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> crate::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => return Err(eof(offset, buf.len(), 0)),
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        (**self).read_exact_at(buf, offset)
    }

    fn read_bytes_at(&self, offset: u64, len: usize) -> crate::Result<Bytes> {
        (**self).read_bytes_at(offset, len)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        (**self).read_exact_at(buf, offset)
    }

    fn read_bytes_at(&self, offset: u64, len: usize) -> crate::Result<Bytes> {
        (**self).read_bytes_at(offset, len)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Box<T> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        (**self).read_exact_at(buf, offset)
    }

    fn read_bytes_at(&self, offset: u64, len: usize) -> crate::Result<Bytes> {
        (**self).read_bytes_at(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_reads_and_rejects_overrun() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut buf = [0u8; 3];
        data.read_exact_at(&mut buf, 2).unwrap();
        assert_eq!(buf, [3, 4, 5]);
        assert!(data.read_exact_at(&mut buf, 3).is_err());
    }

    #[test]
    fn bytes_slices_without_copy() {
        let data = Bytes::from_static(b"abcdef");
        let got = data.read_bytes_at(1, 3).unwrap();
        assert_eq!(&got[..], b"bcd");
    }

    #[test]
    fn undefined_addresses() {
        assert_eq!(undefined_address(4), 0xffff_ffff);
        assert_eq!(undefined_address(8), u64::MAX);
    }

    #[test]
    fn endian_uint_roundtrip() {
        let mut buf = [0u8; 4];
        Endian::Big.write_uint(&mut buf, 0x0102_0304, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(Endian::Little.read_uint(&buf, 4), 0x0403_0201);
    }
}
