//! Persistent key -> metadata map: a fixed 65 535-slot directory fronting
//! chains of sorted, variable-length metadata blocks.
//!
//! Blocks are never updated in place. An insert either rewrites the slot's
//! head block at a fresh offset (append-rewrite) or chains a new head in
//! front of it; obsolete block versions stay where they are and are
//! reclaimed logically through the header counters. Block bytes reach the
//! file before the in-memory directory points at them, and the header is
//! rewritten only at shutdown, so a crash loses at most the newest inserts.

pub mod block;
pub mod header;
pub mod meta;

pub use block::{BlockInfo, IndexBlock};
pub use header::{IndexHeader, FULL_HEADER_SIZE};
pub use meta::{StreamInfo, StreamMetadata};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::{errinput, flock, hasher, Error};

/// A head block is rewritten in place of growing the chain until it would
/// reach this size.
const BLOCK_REWRITE_LIMIT: usize = 256 * 1024 * 1024;

struct IndexInner {
    file: File,
    header: IndexHeader,
    /// Physical end of the index file; fresh blocks append here.
    append_pos: u64,
    rewrite_limit: usize,
}

/// The on-disk index component. All methods serialize on one internal lock;
/// the file handle is owned exclusively.
pub struct Index {
    inner: Mutex<IndexInner>,
}

impl Index {
    /// Opens or creates the index file, takes the single-process lock on its
    /// handle, and loads the header into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        flock::try_lock(&file)
            .map_err(|e| Error::IO(format!("index file is locked by another process: {e}")))?;

        let file_len = file.metadata()?.len();
        let header = if file_len == 0 {
            let header = IndexHeader::new();
            file.write_all(&header.encode()?)?;
            header
        } else {
            if file_len < FULL_HEADER_SIZE as u64 {
                return Err(Error::Corruption(format!(
                    "index file is {file_len} bytes, smaller than its header"
                )));
            }
            let mut buf = vec![0u8; FULL_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            IndexHeader::decode(&buf)?
        };

        let append_pos = file.metadata()?.len().max(FULL_HEADER_SIZE as u64);
        tracing::debug!(
            storage_written_length = header.storage_written_length,
            index_written_length = header.index_written_length,
            "Index opened"
        );

        Ok(Self {
            inner: Mutex::new(IndexInner {
                file,
                header,
                append_pos,
                rewrite_limit: BLOCK_REWRITE_LIMIT,
            }),
        })
    }

    /// Looks up the metadata record for `key` by walking the slot's chain.
    pub fn get(&self, key: &str) -> Result<Option<StreamMetadata>> {
        let mut inner = self.inner.lock()?;
        inner.lookup(key)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Installs a new metadata record.
    ///
    /// The slot's head block is rewritten at a fresh offset with the record
    /// merged into its sorted payload, unless the head is absent or would
    /// outgrow the rewrite limit, in which case a new single-record block is
    /// chained in front. Also advances `storage_written_length` by the
    /// record's stored length.
    pub fn set(&self, meta: &StreamMetadata) -> Result<()> {
        if meta.key.is_empty() {
            return errinput!("key must not be empty");
        }
        let mut inner = self.inner.lock()?;
        if inner.lookup(&meta.key)?.is_some() {
            return errinput!("duplicate key: {}", meta.key);
        }

        let slot = hasher::slot(&meta.key);
        let head = inner.header.directory[slot];

        let (block, old_length) =
            if !head.is_none() && head.length as usize + meta.serialized_len() < inner.rewrite_limit {
                let mut block = inner.read_block(head)?;
                block.insert(meta.clone())?;
                (block, head.length as u64)
            } else {
                (IndexBlock::single(meta.clone(), head), 0)
            };

        let bytes = block.encode()?;
        let offset = inner.append_pos;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&bytes)?;
        inner.file.flush()?;

        // The block is on file; only now may the directory point at it.
        inner.append_pos += bytes.len() as u64;
        inner.header.directory[slot] = BlockInfo {
            offset,
            length: bytes.len() as u32,
        };
        inner.header.index_written_length += bytes.len() as u64 - old_length;
        inner.header.storage_written_length += meta.length;
        Ok(())
    }

    /// Advances the logical end-of-data without installing a record, so the
    /// bytes of a failed stream keep subsequent offsets truthful.
    pub fn skip(&self, length: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.header.storage_written_length += length;
        Ok(())
    }

    /// Rolls the index back to a durable end-of-data.
    ///
    /// When the write path stops before draining the staging buffer, records
    /// may have been installed for streams whose bytes never reached the
    /// data file, and `storage_written_length` includes bytes that were
    /// dropped with the buffer. This drops every record extending past
    /// `durable` (rewriting the affected chains) and pulls the counter back,
    /// so the header never commits bytes the data file does not hold.
    pub(crate) fn rollback(&self, durable: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.header.storage_written_length <= durable {
            return Ok(());
        }

        for slot in 0..hasher::DIRECTORY_SLOTS {
            let head = inner.header.directory[slot];
            if head.is_none() {
                continue;
            }

            let mut chain = Vec::new();
            let mut info = head;
            while !info.is_none() {
                let block = inner.read_block(info)?;
                let next = block.next;
                chain.push((info, block));
                info = next;
            }
            let doomed = |meta: &StreamMetadata| meta.offset + meta.length > durable;
            if !chain.iter().any(|(_, block)| block.payload.iter().any(doomed)) {
                continue;
            }

            // Rebuild the chain back to front, filtering doomed records and
            // unlinking blocks that end up empty.
            let mut old_bytes = 0u64;
            let mut new_bytes = 0u64;
            let mut next = chain.last().map(|(_, block)| block.next).unwrap_or_default();
            for (info, block) in chain.iter().rev() {
                old_bytes += info.length as u64;
                let payload: Vec<StreamMetadata> = block
                    .payload
                    .iter()
                    .filter(|meta| !doomed(*meta))
                    .cloned()
                    .collect();
                if payload.is_empty() {
                    continue;
                }
                let bytes = IndexBlock { next, payload }.encode()?;
                let offset = inner.append_pos;
                inner.file.seek(SeekFrom::Start(offset))?;
                inner.file.write_all(&bytes)?;
                inner.append_pos += bytes.len() as u64;
                new_bytes += bytes.len() as u64;
                next = BlockInfo {
                    offset,
                    length: bytes.len() as u32,
                };
            }
            inner.header.directory[slot] = next;
            inner.header.index_written_length =
                inner.header.index_written_length + new_bytes - old_bytes;
        }

        tracing::warn!(
            committed = inner.header.storage_written_length,
            durable,
            "Index rolled back to the durable end-of-data"
        );
        inner.header.storage_written_length = durable;
        Ok(())
    }

    /// Total bytes committed to the data file; the next stream's offset.
    pub fn storage_written_length(&self) -> Result<u64> {
        Ok(self.inner.lock()?.header.storage_written_length)
    }

    /// Logical bytes used in the index file, excluding the header.
    pub fn index_written_length(&self) -> Result<u64> {
        Ok(self.inner.lock()?.header.index_written_length)
    }

    /// Rewrites the header at offset 0 and syncs. Called at shutdown; until
    /// then the on-disk header intentionally lags the in-memory one.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let bytes = inner.header.encode()?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&bytes)?;
        inner.file.sync_all()?;
        tracing::debug!(
            storage_written_length = inner.header.storage_written_length,
            "Index header persisted"
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_rewrite_limit(&self, limit: usize) {
        self.inner.lock().unwrap().rewrite_limit = limit;
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self, key: &str) -> Result<usize> {
        let mut inner = self.inner.lock()?;
        let mut info = inner.header.directory[hasher::slot(key)];
        let mut links = 0;
        while !info.is_none() {
            let block = inner.read_block(info)?;
            links += 1;
            info = block.next;
        }
        Ok(links)
    }
}

impl IndexInner {
    fn lookup(&mut self, key: &str) -> Result<Option<StreamMetadata>> {
        let mut info = self.header.directory[hasher::slot(key)];
        while !info.is_none() {
            let block = self.read_block(info)?;
            if let Some(meta) = block.find(key) {
                return Ok(Some(meta.clone()));
            }
            info = block.next;
        }
        Ok(None)
    }

    fn read_block(&mut self, info: BlockInfo) -> Result<IndexBlock> {
        let mut buf = vec![0u8; info.length as usize];
        self.file.seek(SeekFrom::Start(info.offset))?;
        self.file.read_exact(&mut buf).map_err(|e| {
            Error::IO(format!("index block short read at {}: {e}", info.offset))
        })?;
        IndexBlock::decode(&buf)
    }
}
