//! Read-side stream types: the `SizedRead` capability for `add` sources and
//! the bounded slice view handed out by `get`.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use flate2::read::GzDecoder;

/// A readable source whose total byte count is known up front.
///
/// The append pipeline requires the capability of every `add` source: an
/// unknown length is an IO error, and the reported length gates the
/// compression decision. Sources are consumed from their current position;
/// `byte_len` reports how many bytes a full read will produce.
pub trait SizedRead: Read {
    fn byte_len(&self) -> io::Result<u64>;
}

impl SizedRead for File {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<T: AsRef<[u8]>> SizedRead for Cursor<T> {
    fn byte_len(&self) -> io::Result<u64> {
        let total = self.get_ref().as_ref().len() as u64;
        Ok(total.saturating_sub(self.position()))
    }
}

impl SizedRead for &[u8] {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

/// A read-only window of `length` bytes starting at `offset` of an inner
/// seekable handle.
///
/// The slice owns its handle; dropping the slice closes it. The logical
/// position ranges over `[0, length]` and every read is issued at the
/// absolute position `offset + p`, so independent slices over one file never
/// interfere. There is no write surface.
pub struct SliceReader<R> {
    inner: R,
    offset: u64,
    length: u64,
    pos: u64,
}

impl<R: Read + Seek> SliceReader<R> {
    /// Builds a slice over `[offset, offset + length)` of `inner`.
    ///
    /// Fails when the window extends past the end of the inner handle,
    /// distinguishing an offset beyond the end from a window running over
    /// it.
    pub fn new(mut inner: R, offset: u64, length: u64) -> io::Result<Self> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        if offset > file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slice offset {offset} is beyond the file length {file_len}"),
            ));
        }
        let end = offset.checked_add(length).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "slice range overflows")
        })?;
        if end > file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slice end {end} exceeds the file length {file_len}"),
            ));
        }

        Ok(Self {
            inner,
            offset,
            length,
            pos: 0,
        })
    }

    /// Window length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current logical position within the window.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<R: Read + Seek> Read for SliceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        self.inner.seek(SeekFrom::Start(self.offset + self.pos))?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SliceReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.length as i128 + delta as i128,
        };
        if target < 0 || target > self.length as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek target {target} outside slice of {} bytes", self.length),
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// The stream returned by `Store::get`: a bounded window over the data file,
/// transparently gzip-decompressed for records stored compressed.
pub enum EntryReader {
    Raw(SliceReader<File>),
    Compressed(GzDecoder<SliceReader<File>>),
}

impl EntryReader {
    pub(crate) fn raw(slice: SliceReader<File>) -> Self {
        EntryReader::Raw(slice)
    }

    pub(crate) fn compressed(slice: SliceReader<File>) -> Self {
        EntryReader::Compressed(GzDecoder::new(slice))
    }

    /// Byte count of the record as stored in the data file. For compressed
    /// entries this is the compressed size, not the payload size.
    pub fn stored_len(&self) -> u64 {
        match self {
            EntryReader::Raw(slice) => slice.len(),
            EntryReader::Compressed(decoder) => decoder.get_ref().len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, EntryReader::Compressed(_))
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryReader::Raw(slice) => slice.read(buf),
            EntryReader::Compressed(decoder) => decoder.read(buf),
        }
    }
}

impl Seek for EntryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            EntryReader::Raw(slice) => slice.seek(pos),
            EntryReader::Compressed(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "compressed entries are not seekable",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing() -> Cursor<Vec<u8>> {
        Cursor::new((0u8..=99).collect())
    }

    #[test]
    fn test_slice_reads_exact_window() {
        let mut slice = SliceReader::new(backing(), 10, 20).unwrap();
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();

        assert_eq!(out, (10u8..30).collect::<Vec<_>>());
        assert_eq!(slice.position(), 20);

        // Past the end of the window every read reports exhaustion.
        let mut buf = [0u8; 8];
        assert_eq!(slice.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_empty_slice() {
        let mut slice = SliceReader::new(backing(), 50, 0).unwrap();
        assert!(slice.is_empty());
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_construction_rejects_out_of_range() {
        // Offset itself beyond the end.
        assert!(SliceReader::new(backing(), 101, 0).is_err());
        // Offset valid, window overruns.
        assert!(SliceReader::new(backing(), 90, 20).is_err());
        // Exactly at the end is allowed.
        assert!(SliceReader::new(backing(), 100, 0).is_ok());
        assert!(SliceReader::new(backing(), 80, 20).is_ok());
    }

    #[test]
    fn test_seek_bounds() {
        let mut slice = SliceReader::new(backing(), 10, 20).unwrap();

        assert_eq!(slice.seek(SeekFrom::Start(20)).unwrap(), 20);
        assert!(slice.seek(SeekFrom::Start(21)).is_err());

        assert_eq!(slice.seek(SeekFrom::End(-20)).unwrap(), 0);
        assert!(slice.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(slice.seek(SeekFrom::Current(5)).unwrap(), 5);

        let mut byte = [0u8; 1];
        slice.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 15);
    }

    #[test]
    fn test_interleaved_seek_and_read() {
        let mut slice = SliceReader::new(backing(), 40, 10).unwrap();
        let mut buf = [0u8; 4];

        slice.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [40, 41, 42, 43]);

        slice.seek(SeekFrom::Start(8)).unwrap();
        let mut tail = Vec::new();
        slice.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, vec![48, 49]);
    }

    #[test]
    fn test_sized_read_for_cursor_tracks_position() {
        let mut cursor = Cursor::new(vec![0u8; 100]);
        assert_eq!(cursor.byte_len().unwrap(), 100);

        let mut buf = [0u8; 30];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(cursor.byte_len().unwrap(), 70);
    }

    #[test]
    fn test_sized_read_for_slice() {
        let data = [1u8, 2, 3];
        assert_eq!((&data[..]).byte_len().unwrap(), 3);
    }
}
