//! The write path: producers are admitted one at a time under a write lock,
//! hash and stage their bytes into the ring, install metadata, then wait on
//! a completion ticket until the append thread has drained past their bytes.
//!
//! The ticket scheduler is a monotone pair of counters: `pending` counts
//! bytes submitted to the ring, `processed` counts bytes the append thread
//! has written. A producer's ticket is the `pending` value observed after
//! staging; it completes once `processed` catches up. A persistent append
//! failure is promoted to a store-wide fatal state that fails every
//! outstanding and future ticket instead of leaving producers parked, and
//! shutdown reconciles the index against `processed` so the header never
//! commits bytes the data file does not hold.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use flate2::read::GzEncoder;
use flate2::Compression;

use crate::error::Result;
use crate::hasher::HashReader;
use crate::index::{Index, StreamInfo, StreamMetadata};
use crate::ring::StagingBuffer;
use crate::stream::SizedRead;
use crate::token::CancelToken;
use crate::{errinput, Error};

/// How often ticket waiters recheck their cancellation signals.
const TICKET_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Progress {
    processed: u64,
    failed: Option<String>,
}

/// Result of staging one stream into the ring.
struct Staged {
    /// Bytes placed in the ring (what the data file will hold).
    stored_len: u64,
    /// Bytes drawn from the caller's source.
    source_len: u64,
    /// MD5 of the caller's payload.
    payload_hash: [u8; 16],
}

pub(crate) struct Pipeline {
    index: Arc<Index>,
    buffer: Arc<StagingBuffer>,
    data_file: Arc<File>,
    /// Physical data file length when the pipeline started; `base_len +
    /// processed` is the durable end-of-data at any point.
    base_len: u64,
    write_lock: Mutex<()>,
    pending: AtomicU64,
    progress: Arc<(Mutex<Progress>, Condvar)>,
    appender: Option<JoinHandle<()>>,
    shutdown: CancelToken,
    compression_threshold: u64,
}

impl Pipeline {
    pub fn new(
        index: Arc<Index>,
        data_file: Arc<File>,
        block_size: usize,
        compression_threshold: u64,
    ) -> Result<Self> {
        let buffer = Arc::new(StagingBuffer::new(block_size));
        let progress = Arc::new((Mutex::new(Progress::default()), Condvar::new()));
        let base_len = data_file.metadata()?.len();

        let appender = {
            let buffer = buffer.clone();
            let data_file = data_file.clone();
            let progress = progress.clone();
            std::thread::Builder::new()
                .name("binstore-append".to_string())
                .spawn(move || run_appender(&buffer, &data_file, &progress))?
        };

        Ok(Self {
            index,
            buffer,
            data_file,
            base_len,
            write_lock: Mutex::new(()),
            pending: AtomicU64::new(0),
            progress,
            appender: Some(appender),
            shutdown: CancelToken::new(),
            compression_threshold,
        })
    }

    /// Admits one stream: validate, reserve the offset, hash and stage the
    /// bytes, install the metadata record, then wait for the append thread
    /// to flush past it.
    pub fn add<R: SizedRead>(
        &self,
        key: &str,
        data: R,
        info: &StreamInfo,
        cancel: &CancelToken,
    ) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        let source_len = data
            .byte_len()
            .map_err(|e| Error::IO(format!("source length unavailable: {e}")))?;
        let compress = info.compressed
            && self.compression_threshold > 0
            && source_len > self.compression_threshold;

        if cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let admission = self.write_lock.lock()?;

        if self.index.contains(key)? {
            return errinput!("duplicate key: {key}");
        }
        let offset = self.index.storage_written_length()?;

        let outcome = if compress {
            self.stage_compressed(data, info.length)
        } else {
            self.stage_raw(data, info.length)
        };
        let staged = match outcome {
            Ok(staged) => staged,
            Err((staged_bytes, error)) => {
                // The bytes are in the ring and will be written; account for
                // them so subsequent offsets stay truthful.
                self.index.skip(staged_bytes)?;
                tracing::warn!(key, staged_bytes, error = %error, "Stream admission failed");
                return Err(error);
            }
        };

        if let Some(declared) = info.length {
            if staged.source_len != declared {
                self.index.skip(staged.stored_len)?;
                tracing::warn!(key, declared, actual = staged.source_len, "Declared length mismatch");
                return errinput!(
                    "declared length {declared} does not match stream length {}",
                    staged.source_len
                );
            }
        }
        if let Some(expected) = info.hash {
            if expected != staged.payload_hash {
                self.index.skip(staged.stored_len)?;
                tracing::warn!(key, "Declared hash mismatch");
                return errinput!("declared hash does not match stream contents");
            }
        }

        let meta = StreamMetadata {
            key: key.to_string(),
            offset,
            length: staged.stored_len,
            hash: staged.payload_hash,
            compressed: compress,
        };
        self.index.set(&meta)?;

        let required = self.pending.load(Ordering::SeqCst);
        drop(admission);

        self.wait_durable(required, cancel)
    }

    /// Streams raw payload bytes into the ring through the hasher.
    fn stage_raw<R: Read>(
        &self,
        data: R,
        declared: Option<u64>,
    ) -> std::result::Result<Staged, (u64, Error)> {
        let mut reader = HashReader::new(data);
        let staged = self.pump(&mut reader, declared, |reader| reader.count())?;
        let (hash, count) = reader.finish();
        Ok(Staged {
            stored_len: staged,
            source_len: count,
            payload_hash: hash,
        })
    }

    /// Streams payload bytes through the hasher and a gzip encoder; the ring
    /// receives compressed bytes while the hash and length checks see the
    /// caller's payload.
    fn stage_compressed<R: Read>(
        &self,
        data: R,
        declared: Option<u64>,
    ) -> std::result::Result<Staged, (u64, Error)> {
        let mut encoder = GzEncoder::new(HashReader::new(data), Compression::default());
        let staged = self.pump(&mut encoder, declared, |encoder| encoder.get_ref().count())?;
        let (hash, count) = encoder.into_inner().finish();
        Ok(Staged {
            stored_len: staged,
            source_len: count,
            payload_hash: hash,
        })
    }

    /// Drains `reader` into the ring one span at a time, watching the
    /// source-byte counter against the declared length.
    fn pump<R: Read>(
        &self,
        reader: &mut R,
        declared: Option<u64>,
        source_count: impl Fn(&R) -> u64,
    ) -> std::result::Result<u64, (u64, Error)> {
        let mut staged = 0u64;
        loop {
            match self.buffer.write_from(reader) {
                Ok(0) => {
                    if self.buffer.is_disposed() {
                        return Err((staged, Error::Cancelled));
                    }
                    return Ok(staged);
                }
                Ok(n) => {
                    staged += n as u64;
                    self.pending.fetch_add(n as u64, Ordering::SeqCst);
                    if let Some(limit) = declared {
                        if source_count(reader) > limit {
                            return Err((
                                staged,
                                Error::InvalidInput(format!(
                                    "stream exceeds its declared length of {limit} bytes"
                                )),
                            ));
                        }
                    }
                }
                Err(e) => return Err((staged, Error::IO(e.to_string()))),
            }
        }
    }

    /// Blocks until the append thread has written at least `required` bytes,
    /// the pipeline fails, or a cancellation signal fires.
    fn wait_durable(&self, required: u64, cancel: &CancelToken) -> Result<()> {
        let (lock, cvar) = &*self.progress;
        let mut progress = lock.lock()?;
        loop {
            if progress.processed >= required {
                return Ok(());
            }
            if let Some(message) = &progress.failed {
                return Err(Error::IO(format!("append thread failed: {message}")));
            }
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (guard, _) = cvar.wait_timeout(progress, TICKET_POLL)?;
            progress = guard;
        }
    }

    /// Stops the write path: cancels waiters, disposes the ring (releasing
    /// blocked producers), joins the append thread, reconciles the index
    /// with what was actually written, and shrinks the data file to that
    /// point. Idempotent.
    ///
    /// Disposing the ring drops any bytes the append thread never drained,
    /// so the index may hold records and counter contributions for bytes
    /// that are not on file. Rolling the index back to `base_len +
    /// processed` before anyone persists the header keeps the crash model
    /// honest: the header never commits past the physical data, and no
    /// record survives pointing at bytes that were lost.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.buffer.dispose();
        if let Some(handle) = self.appender.take() {
            if handle.join().is_err() {
                tracing::error!("Append thread panicked during shutdown");
            }
        }

        // Wait out any producer still inside its admission section so the
        // counters are final before reconciling.
        let _admission = self.write_lock.lock()?;
        let processed = {
            let (lock, _) = &*self.progress;
            lock.lock()?.processed
        };
        let durable = self.base_len + processed;
        if self.index.storage_written_length()? > durable {
            self.index.rollback(durable)?;
        }

        // Never extends: `durable` cannot exceed the physical length, and a
        // torn trailing write gets cut off here.
        let committed = self.index.storage_written_length()?;
        self.data_file.set_len(committed)?;
        if let Err(e) = self.data_file.sync_all() {
            tracing::warn!(error = %e, "Data file sync failed at shutdown");
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Pipeline shutdown failed");
        }
    }
}

/// Append thread body: drain the ring into the data file sequentially and
/// publish progress to ticket waiters.
fn run_appender(
    buffer: &StagingBuffer,
    data_file: &File,
    progress: &(Mutex<Progress>, Condvar),
) {
    let mut sink: &File = data_file;
    loop {
        match buffer.read_into(&mut sink) {
            Ok(0) => break,
            Ok(n) => {
                let (lock, cvar) = progress;
                let mut state = lock.lock().unwrap();
                state.processed += n as u64;
                cvar.notify_all();
            }
            Err(e) => {
                tracing::error!(error = %e, "Append write failed, stopping the write path");
                let (lock, cvar) = progress;
                lock.lock().unwrap().failed = Some(e.to_string());
                cvar.notify_all();
                buffer.dispose();
                break;
            }
        }
    }

    if let Err(e) = data_file.sync_all() {
        tracing::warn!(error = %e, "Data file sync failed at append exit");
    }
}
