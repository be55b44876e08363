use std::io::{self, Read};

/// Number of fixed directory slots in the index header.
pub const DIRECTORY_SLOTS: usize = 65_535;

/// Maps a key to its directory slot.
///
/// The key's UTF-16LE bytes are digested with MD5 and the digest is folded
/// into an `i32` with a 397 multiply/XOR accumulator. Distinct runs against
/// the same files must agree on placement, so this function is part of the
/// on-disk format and must not change.
pub fn slot(key: &str) -> usize {
    let mut context = md5::Context::new();
    for unit in key.encode_utf16() {
        context.consume(unit.to_le_bytes());
    }
    let digest = context.compute();

    let mut acc: i32 = 397;
    for byte in digest.iter() {
        acc = acc.wrapping_mul(397) ^ (*byte as i32);
    }
    acc.unsigned_abs() as usize % DIRECTORY_SLOTS
}

/// A reader that digests everything passing through it.
///
/// Hashing and transfer share one pass: the pipeline pulls bytes out of this
/// wrapper into the staging buffer and the MD5 state advances as a side
/// effect. Also counts the bytes produced, which doubles as the running
/// length check during admission.
pub struct HashReader<R> {
    inner: R,
    context: md5::Context,
    count: u64,
}

impl<R: Read> HashReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            context: md5::Context::new(),
            count: 0,
        }
    }

    /// Bytes produced so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Finalizes the digest, returning it with the total byte count.
    pub fn finish(self) -> ([u8; 16], u64) {
        (self.context.compute().0, self.count)
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.consume(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}
