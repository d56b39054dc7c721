//! Stitches an ordered list of byte ranges from a seekable source into a
//! single contiguous stream.

use std::io::{Read, Seek, SeekFrom};

/// A byte range `[offset, offset + length)` to read from the underlying
/// source, in the order it should appear in the stitched output. Ranges
/// may repeat or go backwards; the slicer seeks before every range, so it
/// makes no assumption about ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub offset: u64,
    pub length: u64,
}

/// Reads each configured [`Slice`] of `inner` in turn, presenting them as
/// one contiguous stream.
#[derive(Debug)]
pub struct SlicedReader<S> {
    inner: S,
    slices: std::vec::IntoIter<Slice>,
    remaining: u64,
}

impl<S: Read + Seek> SlicedReader<S> {
    #[must_use]
    pub fn new(inner: S, slices: Vec<Slice>) -> Self {
        Self {
            inner,
            slices: slices.into_iter(),
            remaining: 0,
        }
    }
}

impl<S: Read + Seek> Read for SlicedReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.remaining == 0 {
                let Some(slice) = self.slices.next() else {
                    return Ok(0);
                };
                if slice.length == 0 {
                    continue;
                }
                self.inner.seek(SeekFrom::Start(slice.offset))?;
                self.remaining = slice.length;
            }
            let want = buf.len().min(self.remaining as usize);
            if want == 0 {
                return Ok(0);
            }
            let n = self.inner.read(&mut buf[..want])?;
            if n == 0 {
                // Source is shorter than the slice claimed; stop here
                // rather than looping forever.
                self.remaining = 0;
                continue;
            }
            self.remaining -= n as u64;
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all<R: Read>(mut r: R) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn stitches_overlapping_and_backward_slices() {
        let input = b"abcdefghijklmnopqrstuvwxyz".to_vec();
        let slices = vec![
            Slice { offset: 0, length: 2 },
            Slice { offset: 0, length: 26 },
            Slice { offset: 3, length: 4 },
            Slice { offset: 25, length: 1 },
            Slice { offset: 25, length: 2 },
        ];
        let reader = SlicedReader::new(Cursor::new(input), slices);
        let out = read_all(reader);
        assert_eq!(out, b"ababcdefghijklmnopqrstuvwxyzdefgzz".to_vec());
    }

    #[test]
    fn empty_slice_list_yields_empty_stream() {
        let reader = SlicedReader::new(Cursor::new(b"hello".to_vec()), vec![]);
        assert!(read_all(reader).is_empty());
    }

    #[test]
    fn zero_length_slices_are_skipped() {
        let input = b"hello".to_vec();
        let slices = vec![
            Slice { offset: 1, length: 0 },
            Slice { offset: 0, length: 5 },
        ];
        let reader = SlicedReader::new(Cursor::new(input), slices);
        assert_eq!(read_all(reader), b"hello".to_vec());
    }
}
