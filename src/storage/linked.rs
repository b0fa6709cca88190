use std::io::Read;

use serde::{Deserialize, Serialize};

use super::ReadAt;

/// One block of a linked byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// File address of the block.
    pub address: u64,
    /// Number of bytes of the stream held by this block.
    pub length: u64,
}

/// A sequential reader over data split across several file blocks.
///
/// The logical stream is the concatenation of the segments in order.
/// Positions only ever move forwards; [LinkedReader::seek_forward] to an earlier
/// position is an error rather than a re-read.
pub struct LinkedReader<'a, R: ?Sized> {
    file: &'a R,
    segments: Vec<Segment>,
    /// Logical start of each segment.
    starts: Vec<u64>,
    total: u64,
    position: u64,
    current: usize,
}

impl<'a, R: ReadAt + ?Sized> LinkedReader<'a, R> {
    pub fn new(file: &'a R, segments: Vec<Segment>) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut total = 0u64;
        for seg in &segments {
            starts.push(total);
            total += seg.length;
        }
        Self {
            file,
            segments,
            starts,
            total,
            position: 0,
            current: 0,
        }
    }

    /// Total length of the logical stream.
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move to logical position `pos`, which must not be behind the current one.
    pub fn seek_forward(&mut self, pos: u64) -> crate::Result<()> {
        if pos < self.position {
            return Err(crate::Error::BackwardSeek {
                position: self.position,
                requested: pos,
            });
        }
        self.position = pos;
        while self.current < self.segments.len()
            && self.starts[self.current] + self.segments[self.current].length <= self.position
        {
            self.current += 1;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes starting at logical position `pos`.
    pub fn read_exact_at_logical(&mut self, pos: u64, buf: &mut [u8]) -> crate::Result<()> {
        self.seek_forward(pos)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "linked storage ended at {} of {} bytes",
                        self.position, self.total
                    ),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if buf.is_empty() || self.current >= self.segments.len() {
            return Ok(0);
        }
        let seg = self.segments[self.current];
        let within = self.position - self.starts[self.current];
        let available = seg.length - within;
        let n = (buf.len() as u64).min(available) as usize;
        self.file.read_exact_at(&mut buf[..n], seg.address + within)?;
        self.position += n as u64;
        if within + n as u64 >= seg.length {
            self.current += 1;
        }
        Ok(n)
    }
}

impl<R: ReadAt + ?Sized> Read for LinkedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_some(buf).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> Vec<u8> {
        // stream "0123456789" split as [0..4) at 20, [4..7) at 2, [7..10) at 10
        let mut f = vec![b'.'; 32];
        f[20..24].copy_from_slice(b"0123");
        f[2..5].copy_from_slice(b"456");
        f[10..13].copy_from_slice(b"789");
        f
    }

    fn segments() -> Vec<Segment> {
        vec![
            Segment { address: 20, length: 4 },
            Segment { address: 2, length: 3 },
            Segment { address: 10, length: 3 },
        ]
    }

    #[test]
    fn reads_across_segments() {
        let f = file();
        let mut r = LinkedReader::new(f.as_slice(), segments());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
        assert_eq!(r.len(), 10);
    }

    #[test]
    fn forward_seeks_skip_bytes() {
        let f = file();
        let mut r = LinkedReader::new(f.as_slice(), segments());
        let mut buf = [0u8; 3];
        r.read_exact_at_logical(2, &mut buf).unwrap();
        assert_eq!(&buf, b"234");
        r.read_exact_at_logical(8, &mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn backward_seek_is_rejected() {
        let f = file();
        let mut r = LinkedReader::new(f.as_slice(), segments());
        let mut buf = [0u8; 2];
        r.read_exact_at_logical(5, &mut buf).unwrap();
        let err = r.read_exact_at_logical(1, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::BackwardSeek {
                position: 7,
                requested: 1
            }
        ));
    }

    #[test]
    fn reading_past_the_end_fails() {
        let f = file();
        let mut r = LinkedReader::new(f.as_slice(), segments());
        let mut buf = [0u8; 4];
        assert!(r.read_exact_at_logical(8, &mut buf).is_err());
    }
}
