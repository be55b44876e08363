//! Store façade: assembles the staging ring, append pipeline, and on-disk
//! index over one working folder.
//!
//! # Data Flow
//!
//! ## Write path (`add`)
//! 1. **Admission**: producers serialize on the pipeline's write lock
//! 2. **Staging**: bytes are hashed on the fly and copied into the ring
//! 3. **Append**: the append thread drains the ring into `storage.bin`
//! 4. **Install**: the metadata record lands in the index
//! 5. **Ticket**: the caller returns once the append thread flushed past it
//!
//! ## Read path (`get`)
//! 1. **Lookup**: resolve the key's metadata record from the index
//! 2. **Slice**: open a fresh read handle and bound it to the record's range
//!
//! # Durability
//!
//! The data file is recovered on open by truncating anything past the
//! header's committed length; a data file *shorter* than that is reported as
//! corruption. The index header is rewritten at close, so closing the store
//! is what makes recent adds reachable in the next session. Before the
//! header is persisted, the pipeline rolls the index back to the bytes the
//! append thread actually wrote, so records of streams that failed or were
//! cut off mid-flight never reach the header pointing at missing data.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::index::{Index, StreamInfo, StreamMetadata};
use crate::pipeline::Pipeline;
use crate::stream::{EntryReader, SizedRead, SliceReader};
use crate::token::CancelToken;
use crate::Error;

/// Data file name inside the working folder.
pub const STORAGE_FILE: &str = "storage.bin";

/// Index file name inside the working folder.
pub const INDEX_FILE: &str = "index.bin";

/// An embedded binary blob store over one working folder.
pub struct Store {
    index: Arc<Index>,
    pipeline: Pipeline,
    data_path: PathBuf,
}

impl Store {
    /// Opens the store, creating the working folder and both files on first
    /// use and recovering the data file against the index header.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let index = Arc::new(Index::open(&config.dir.join(INDEX_FILE))?);
        let data_path = config.dir.join(STORAGE_FILE);
        let data_file = File::options().create(true).append(true).open(&data_path)?;

        let physical = data_file.metadata()?.len();
        let committed = index.storage_written_length()?;
        if physical < committed {
            return Err(Error::Corruption(format!(
                "data file is {physical} bytes but the index header commits {committed}"
            )));
        }
        if physical > committed {
            data_file.set_len(committed)?;
            tracing::info!(
                from = physical,
                to = committed,
                "Data file truncated to the last committed length"
            );
        }

        let pipeline = Pipeline::new(
            index.clone(),
            Arc::new(data_file),
            config.clamped_block_size(),
            config.compression_threshold,
        )?;

        tracing::info!(dir = %config.dir.display(), "Store opened");
        Ok(Self {
            index,
            pipeline,
            data_path,
        })
    }

    /// Persists `data` under `key`. Fails without installing anything when
    /// the key exists or a hint in `info` does not match the stream.
    pub fn add<R: SizedRead>(&self, key: &str, data: R, info: &StreamInfo) -> Result<()> {
        self.pipeline.add(key, data, info, &CancelToken::new())
    }

    /// Like [`Store::add`], but observing a caller-supplied cancellation
    /// token in addition to the store-wide one.
    pub fn add_cancellable<R: SizedRead>(
        &self,
        key: &str,
        data: R,
        info: &StreamInfo,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.pipeline.add(key, data, info, cancel)
    }

    /// Returns a bounded readable stream over the stored bytes of `key`,
    /// decompressing transparently when the record is flagged compressed.
    pub fn get(&self, key: &str) -> Result<EntryReader> {
        let meta = self
            .index
            .get(key)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        let file = File::open(&self.data_path)?;
        let slice = SliceReader::new(file, meta.offset, meta.length)?;
        Ok(if meta.compressed {
            EntryReader::compressed(slice)
        } else {
            EntryReader::raw(slice)
        })
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.index.contains(key)
    }

    /// The metadata record for `key`, if present.
    pub fn metadata(&self, key: &str) -> Result<Option<StreamMetadata>> {
        self.index.get(key)
    }

    /// Shuts the write path down and persists the index header. Dropping the
    /// store performs the same steps best-effort; `close` reports failures.
    pub fn close(mut self) -> Result<()> {
        let shutdown = self.pipeline.shutdown();
        let header = self.index.close();
        shutdown.and(header)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.shutdown() {
            tracing::warn!(error = %e, "Pipeline shutdown failed on drop");
        }
        if let Err(e) = self.index.close() {
            tracing::warn!(error = %e, "Index header write failed on drop");
        }
    }
}
