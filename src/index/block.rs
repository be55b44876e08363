use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::{errinput, Error};

use super::meta::StreamMetadata;

/// Locates a block inside the index file. `offset == 0` denotes "no block";
/// real blocks always live past the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockInfo {
    pub offset: u64,
    pub length: u32,
}

impl BlockInfo {
    /// Serialized size: `i64` offset + `i32` length.
    pub const SIZE: usize = 12;

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.offset == 0
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_i64::<LittleEndian>(self.offset as i64)?;
        buf.write_i32::<LittleEndian>(self.length as i32)?;
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let offset = reader.read_i64::<LittleEndian>()?;
        let length = reader.read_i32::<LittleEndian>()?;
        if offset < 0 || length < 0 {
            return Err(Error::Corruption(format!(
                "block locator with offset {offset} and length {length}"
            )));
        }
        Ok(Self {
            offset: offset as u64,
            length: length as u32,
        })
    }
}

/// One link of a directory slot's chain: a pointer to the previous head and
/// a key-sorted payload of metadata records.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBlock {
    pub next: BlockInfo,
    pub payload: Vec<StreamMetadata>,
}

impl IndexBlock {
    /// A fresh chain head holding a single record.
    pub fn single(meta: StreamMetadata, next: BlockInfo) -> Self {
        Self {
            next,
            payload: vec![meta],
        }
    }

    /// Serialized size: locator + count + payload records.
    pub fn serialized_len(&self) -> usize {
        BlockInfo::SIZE
            + 4
            + self
                .payload
                .iter()
                .map(StreamMetadata::serialized_len)
                .sum::<usize>()
    }

    /// Binary-searches the payload for `key`.
    pub fn find(&self, key: &str) -> Option<&StreamMetadata> {
        self.payload
            .binary_search_by(|meta| meta.key.as_str().cmp(key))
            .ok()
            .map(|i| &self.payload[i])
    }

    /// Inserts `meta` keeping the payload sorted; duplicate keys are
    /// rejected.
    pub fn insert(&mut self, meta: StreamMetadata) -> Result<()> {
        match self
            .payload
            .binary_search_by(|existing| existing.key.cmp(&meta.key))
        {
            Ok(_) => errinput!("duplicate key: {}", meta.key),
            Err(position) => {
                self.payload.insert(position, meta);
                Ok(())
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.next.encode(&mut buf)?;
        buf.write_i32::<LittleEndian>(self.payload.len() as i32)?;
        for meta in &self.payload {
            meta.encode(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let next = BlockInfo::decode(&mut cursor)?;
        let count = cursor.read_i32::<LittleEndian>()?;
        if count < 0 {
            return Err(Error::Corruption(format!(
                "index block with record count {count}"
            )));
        }

        let mut payload = Vec::with_capacity(count as usize);
        for _ in 0..count {
            payload.push(StreamMetadata::decode(&mut cursor)?);
        }
        if cursor.position() as usize != buf.len() {
            return Err(Error::Corruption(format!(
                "index block has {} trailing bytes",
                buf.len() - cursor.position() as usize
            )));
        }

        Ok(Self { next, payload })
    }
}
