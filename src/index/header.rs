use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::hasher::DIRECTORY_SLOTS;
use crate::Error;

use super::block::BlockInfo;

/// Fixed header size: two `i64` counters plus the full directory.
pub const FULL_HEADER_SIZE: usize = 16 + DIRECTORY_SLOTS * BlockInfo::SIZE;

/// The fixed-layout header at offset 0 of the index file.
///
/// Holds the two logical length counters and one `BlockInfo` per directory
/// slot. Kept in memory while the store is open and rewritten in place only
/// at shutdown, so a crash can lose recent inserts but never leave the
/// directory pointing into unwritten space.
#[derive(Debug, Clone)]
pub struct IndexHeader {
    /// Total bytes committed to the data file.
    pub storage_written_length: u64,
    /// Logical bytes used in the index file, excluding this header.
    pub index_written_length: u64,
    /// Chain heads, addressed by `hasher::slot(key)`.
    pub directory: Vec<BlockInfo>,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexHeader {
    pub fn new() -> Self {
        Self {
            storage_written_length: 0,
            index_written_length: 0,
            directory: vec![BlockInfo::none(); DIRECTORY_SLOTS],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FULL_HEADER_SIZE);
        buf.write_i64::<LittleEndian>(self.storage_written_length as i64)?;
        buf.write_i64::<LittleEndian>(self.index_written_length as i64)?;
        for info in &self.directory {
            info.encode(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FULL_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "index header is {} bytes, expected {FULL_HEADER_SIZE}",
                buf.len()
            )));
        }

        let mut cursor = Cursor::new(buf);
        let storage_written_length = cursor.read_i64::<LittleEndian>()?;
        let index_written_length = cursor.read_i64::<LittleEndian>()?;
        if storage_written_length < 0 || index_written_length < 0 {
            return Err(Error::Corruption(format!(
                "index header with negative counters ({storage_written_length}, {index_written_length})"
            )));
        }

        let mut directory = Vec::with_capacity(DIRECTORY_SLOTS);
        for _ in 0..DIRECTORY_SLOTS {
            directory.push(BlockInfo::decode(&mut cursor)?);
        }

        Ok(Self {
            storage_written_length: storage_written_length as u64,
            index_written_length: index_written_length as u64,
            directory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(FULL_HEADER_SIZE, 786_436);
        let header = IndexHeader::new();
        assert_eq!(header.encode().unwrap().len(), FULL_HEADER_SIZE);
    }

    #[test]
    fn test_roundtrip() {
        let mut header = IndexHeader::new();
        header.storage_written_length = 42_000;
        header.index_written_length = 9_000;
        header.directory[0] = BlockInfo {
            offset: 786_436,
            length: 100,
        };
        header.directory[DIRECTORY_SLOTS - 1] = BlockInfo {
            offset: 800_000,
            length: 52,
        };

        let bytes = header.encode().unwrap();
        let decoded = IndexHeader::decode(&bytes).unwrap();

        assert_eq!(decoded.storage_written_length, 42_000);
        assert_eq!(decoded.index_written_length, 9_000);
        assert_eq!(decoded.directory[0], header.directory[0]);
        assert_eq!(
            decoded.directory[DIRECTORY_SLOTS - 1],
            header.directory[DIRECTORY_SLOTS - 1]
        );
        assert!(decoded.directory[1].is_none());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let header = IndexHeader::new();
        let bytes = header.encode().unwrap();
        assert!(matches!(
            IndexHeader::decode(&bytes[..FULL_HEADER_SIZE - 1]),
            Err(Error::Corruption(_))
        ));
    }
}
