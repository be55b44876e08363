//! Cyclic staging buffer between producer threads and the append thread.
//!
//! A bounded byte ring of `16 x block_size` bytes. Producers copy spans in
//! with `write_from`, the append thread copies spans out with `read_into`.
//! Span length is `min(block_size, bytes_to_buffer_end, available)`, which
//! guarantees progress, keeps FIFO byte order, and lets the append thread do
//! large sequential writes. Readiness is signaled with two condition
//! variables standing in for the original auto-reset events; offset updates
//! happen under a short critical section while the byte copies themselves
//! run outside the lock.

use std::cell::UnsafeCell;
use std::cmp::min;
use std::io::{self, Read, Write};
use std::sync::{Condvar, Mutex};

use crate::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Ring capacity in block quanta.
const RING_BLOCKS: usize = 16;

struct RingState {
    read_pos: usize,
    used: usize,
    disposed: bool,
}

/// Bounded producer/consumer byte ring.
///
/// At most one producer and one consumer may be active concurrently; the
/// append pipeline enforces the producer side with its write lock and runs a
/// single consumer thread. Under that contract the producer writes only to
/// the free region and the consumer reads only from the used region, which
/// never overlap, so the copies can run outside the state lock.
pub struct StagingBuffer {
    buf: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    capacity: usize,
    state: Mutex<RingState>,
    can_read: Condvar,
    can_write: Condvar,
}

// SAFETY: the cells are only accessed through disjoint spans handed out
// under the single-producer/single-consumer contract above.
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    /// Creates a ring of `16 x block_size` bytes, clamping `block_size` to
    /// [1 KiB, 64 MiB].
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        let capacity = RING_BLOCKS * block_size;
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buf,
            block_size,
            capacity,
            state: Mutex::new(RingState {
                read_pos: 0,
                used: 0,
                disposed: false,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies up to one contiguous span from `source` into the ring,
    /// blocking until space is available. Returns 0 when the source is
    /// exhausted or the buffer is disposed.
    pub fn write_from(&self, source: &mut impl Read) -> io::Result<usize> {
        let (write_pos, span) = {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.disposed {
                    return Ok(0);
                }
                if state.used < self.capacity {
                    break;
                }
                state = self.can_write.wait(state).unwrap();
            }
            let write_pos = (state.read_pos + state.used) % self.capacity;
            let free = self.capacity - state.used;
            let span = min(self.block_size, min(self.capacity - write_pos, free));
            (write_pos, span)
        };

        // Only the producer moves the write position, and the consumer can
        // only grow the free region, so the span stays exclusively ours
        // while the lock is released.
        let slice = unsafe { self.span_mut(write_pos, span) };
        let n = source.read(slice)?;
        if n == 0 {
            return Ok(0);
        }

        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Ok(0);
        }
        state.used += n;
        self.can_read.notify_one();
        Ok(n)
    }

    /// Copies the next contiguous readable span from the ring into `sink`
    /// and flushes it, blocking until data is available. Returns 0 only once
    /// the buffer is disposed.
    pub fn read_into(&self, sink: &mut impl Write) -> io::Result<usize> {
        let (read_pos, span) = {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.disposed {
                    return Ok(0);
                }
                if state.used > 0 {
                    break;
                }
                state = self.can_read.wait(state).unwrap();
            }
            let span = min(self.block_size, min(self.capacity - state.read_pos, state.used));
            (state.read_pos, span)
        };

        let slice = unsafe { self.span_ref(read_pos, span) };
        sink.write_all(slice)?;
        sink.flush()?;

        let mut state = self.state.lock().unwrap();
        state.read_pos = (read_pos + span) % self.capacity;
        state.used -= span;
        self.can_write.notify_one();
        Ok(span)
    }

    /// Marks the buffer disposed and wakes every waiter. Pending and
    /// subsequent calls return 0. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        state.disposed = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }

    /// SAFETY: caller must be the sole producer and `pos..pos + len` must
    /// lie within the free region.
    #[allow(clippy::mut_from_ref)]
    unsafe fn span_mut(&self, pos: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.buf[pos].get(), len)
    }

    /// SAFETY: caller must be the sole consumer and `pos..pos + len` must
    /// lie within the used region.
    unsafe fn span_ref(&self, pos: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.buf[pos].get(), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(buffer: &StagingBuffer, expected: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < expected {
            let n = buffer.read_into(&mut out).expect("read_into failed");
            assert!(n > 0, "ring disposed before all bytes were drained");
        }
        out
    }

    #[test]
    fn test_block_size_clamping() {
        assert_eq!(StagingBuffer::new(1).block_size(), MIN_BLOCK_SIZE);
        assert_eq!(StagingBuffer::new(usize::MAX).block_size(), MAX_BLOCK_SIZE);
        assert_eq!(StagingBuffer::new(8192).capacity(), 16 * 8192);
    }

    #[test]
    fn test_roundtrip_preserves_fifo_order() {
        let buffer = StagingBuffer::new(MIN_BLOCK_SIZE);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();

        let mut source = Cursor::new(data.clone());
        let mut written = 0;
        loop {
            let n = buffer.write_from(&mut source).unwrap();
            if n == 0 {
                break;
            }
            written += n;
        }
        assert_eq!(written, data.len());
        assert_eq!(drain(&buffer, data.len()), data);
    }

    #[test]
    fn test_span_bounded_by_block_size() {
        let buffer = StagingBuffer::new(MIN_BLOCK_SIZE);
        let mut source = Cursor::new(vec![7u8; 5000]);

        let n = buffer.write_from(&mut source).unwrap();
        assert_eq!(n, MIN_BLOCK_SIZE);
    }

    #[test]
    fn test_exhausted_source_returns_zero() {
        let buffer = StagingBuffer::new(MIN_BLOCK_SIZE);
        let mut source = Cursor::new(Vec::<u8>::new());
        assert_eq!(buffer.write_from(&mut source).unwrap(), 0);
    }

    #[test]
    fn test_wrap_around() {
        let buffer = StagingBuffer::new(MIN_BLOCK_SIZE);
        let capacity = buffer.capacity();

        // Fill the ring completely, then free two spans so the next write
        // lands back at offset 0.
        let first: Vec<u8> = (0..capacity).map(|i| (i % 255) as u8).collect();
        let mut source = Cursor::new(first.clone());
        let mut written = 0;
        while written < capacity {
            written += buffer.write_from(&mut source).unwrap();
        }

        let head = drain(&buffer, 2 * MIN_BLOCK_SIZE);
        assert_eq!(head, first[..2 * MIN_BLOCK_SIZE]);

        let tail = vec![0xABu8; 1000];
        let mut source = Cursor::new(tail.clone());
        assert_eq!(buffer.write_from(&mut source).unwrap(), 1000);

        let mut rest = drain(&buffer, capacity - 2 * MIN_BLOCK_SIZE);
        rest.extend(drain(&buffer, 1000));
        let mut expected = first[2 * MIN_BLOCK_SIZE..].to_vec();
        expected.extend(&tail);
        assert_eq!(rest, expected);
    }

    #[test]
    fn test_threaded_producer_consumer() {
        let buffer = Arc::new(StagingBuffer::new(MIN_BLOCK_SIZE));
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let total = data.len();

        let consumer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || drain(&buffer, total))
        };

        let mut source = Cursor::new(data.clone());
        loop {
            let n = buffer.write_from(&mut source).unwrap();
            if n == 0 {
                break;
            }
        }

        let received = consumer.join().expect("consumer panicked");
        assert_eq!(received, data);
    }

    #[test]
    fn test_dispose_releases_blocked_reader() {
        let buffer = Arc::new(StagingBuffer::new(MIN_BLOCK_SIZE));

        let reader = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut sink = Vec::new();
                buffer.read_into(&mut sink).unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        buffer.dispose();
        assert_eq!(reader.join().expect("reader panicked"), 0);
    }

    #[test]
    fn test_dispose_releases_blocked_writer() {
        let buffer = Arc::new(StagingBuffer::new(MIN_BLOCK_SIZE));

        // Fill the ring so the next writer blocks on free space.
        let mut source = Cursor::new(vec![1u8; buffer.capacity()]);
        let mut written = 0;
        while written < buffer.capacity() {
            written += buffer.write_from(&mut source).unwrap();
        }

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let mut source = Cursor::new(vec![2u8; 100]);
                buffer.write_from(&mut source).unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        buffer.dispose();
        assert_eq!(writer.join().expect("writer panicked"), 0);
    }

    #[test]
    fn test_dispose_is_idempotent_and_drops_pending() {
        let buffer = StagingBuffer::new(MIN_BLOCK_SIZE);
        let mut source = Cursor::new(vec![9u8; 100]);
        assert_eq!(buffer.write_from(&mut source).unwrap(), 100);

        buffer.dispose();
        buffer.dispose();

        let mut sink = Vec::new();
        assert_eq!(buffer.read_into(&mut sink).unwrap(), 0);
        assert!(sink.is_empty());

        let mut source = Cursor::new(vec![9u8; 100]);
        assert_eq!(buffer.write_from(&mut source).unwrap(), 0);
    }
}
