use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::{errinput, Error};

/// Caller-supplied hints for an `add`. All fields are optional; a provided
/// hint must match the computed value or the add is rejected.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// Exact payload byte count asserted by the caller.
    pub length: Option<u64>,
    /// Exact payload MD5 asserted by the caller.
    pub hash: Option<[u8; 16]>,
    /// Request compression for payloads above the configured threshold.
    pub compressed: bool,
}

impl StreamInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert the exact payload length
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Assert the exact payload MD5
    pub fn hash(mut self, hash: [u8; 16]) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Request compression
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }
}

/// Per-key persistent record locating one stream inside the data file.
///
/// On disk: `key_units: i32`, the key as UTF-16LE code units, `offset: i64`,
/// `length: i64` (sign bit carries the compressed flag, magnitude is the
/// stored byte count), and the 16-byte payload MD5. Records are immutable
/// once installed.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    pub key: String,
    pub offset: u64,
    pub length: u64,
    pub hash: [u8; 16],
    pub compressed: bool,
}

impl StreamMetadata {
    /// Serialized size in bytes: `2*8 + 16 + 4 + 2*key_units`.
    pub fn serialized_len(&self) -> usize {
        4 + 2 * self.key.encode_utf16().count() + 8 + 8 + 16
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let units: Vec<u16> = self.key.encode_utf16().collect();
        if units.is_empty() {
            return errinput!("metadata key must not be empty");
        }
        if units.len() > i32::MAX as usize {
            return errinput!("metadata key of {} code units is too long", units.len());
        }

        buf.write_i32::<LittleEndian>(units.len() as i32)?;
        for unit in &units {
            buf.write_u16::<LittleEndian>(*unit)?;
        }
        buf.write_i64::<LittleEndian>(self.offset as i64)?;
        let signed_length = if self.compressed {
            -(self.length as i64)
        } else {
            self.length as i64
        };
        buf.write_i64::<LittleEndian>(signed_length)?;
        buf.extend_from_slice(&self.hash);
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let key_units = reader.read_i32::<LittleEndian>()?;
        if key_units <= 0 {
            return Err(Error::Corruption(format!(
                "metadata record with key length {key_units}"
            )));
        }
        let mut units = vec![0u16; key_units as usize];
        reader.read_u16_into::<LittleEndian>(&mut units)?;
        let key = String::from_utf16(&units)
            .map_err(|_| Error::Corruption("metadata key is not valid UTF-16".to_string()))?;

        let offset = reader.read_i64::<LittleEndian>()?;
        if offset < 0 {
            return Err(Error::Corruption(format!(
                "metadata record with negative offset {offset}"
            )));
        }
        let signed_length = reader.read_i64::<LittleEndian>()?;
        let mut hash = [0u8; 16];
        reader.read_exact(&mut hash)?;

        Ok(Self {
            key,
            offset: offset as u64,
            length: signed_length.unsigned_abs(),
            hash,
            compressed: signed_length < 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(key: &str, compressed: bool) -> StreamMetadata {
        StreamMetadata {
            key: key.to_string(),
            offset: 123_456,
            length: 789,
            hash: *md5::compute(key.as_bytes()),
            compressed,
        }
    }

    #[test]
    fn test_roundtrip() {
        for meta in [sample("alpha", false), sample("beta", true)] {
            let mut buf = Vec::new();
            meta.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), meta.serialized_len());

            let decoded = StreamMetadata::decode(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(decoded, meta);
        }
    }

    #[test]
    fn test_non_ascii_key_counts_utf16_units() {
        // "鍵" is one UTF-16 unit, "𝄞" (U+1D11E) is a surrogate pair.
        let meta = sample("鍵𝄞", false);
        assert_eq!(meta.serialized_len(), 36 + 2 * 3);

        let mut buf = Vec::new();
        meta.encode(&mut buf).unwrap();
        let decoded = StreamMetadata::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.key, "鍵𝄞");
    }

    #[test]
    fn test_compressed_flag_rides_the_sign_bit() {
        let meta = sample("z", true);
        let mut buf = Vec::new();
        meta.encode(&mut buf).unwrap();

        let decoded = StreamMetadata::decode(&mut Cursor::new(&buf)).unwrap();
        assert!(decoded.compressed);
        assert_eq!(decoded.length, 789);
    }

    #[test]
    fn test_empty_key_rejected() {
        let meta = StreamMetadata {
            key: String::new(),
            offset: 0,
            length: 0,
            hash: [0; 16],
            compressed: false,
        };
        let mut buf = Vec::new();
        assert!(matches!(
            meta.encode(&mut buf),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_short_buffer_fails() {
        let meta = sample("key", false);
        let mut buf = Vec::new();
        meta.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(StreamMetadata::decode(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn test_info_builder() {
        let info = StreamInfo::new().length(42).compressed(true);
        assert_eq!(info.length, Some(42));
        assert!(info.hash.is_none());
        assert!(info.compressed);
    }
}
