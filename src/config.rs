use std::path::PathBuf;

/// Default staging block quantum (16 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Smallest accepted block quantum (1 KiB).
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest accepted block quantum (64 MiB).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a store instance, immutable once the store is open.
#[derive(Debug, Clone)]
pub struct Config {
    /// Working folder holding exactly two files, `storage.bin` and
    /// `index.bin`. Created on first open.
    pub dir: PathBuf,

    /// Staging block quantum in bytes (default: 16 KiB). Clamped to
    /// [1 KiB, 64 MiB] when the staging buffer is built.
    pub block_size: usize,

    /// Streams longer than this are eligible for compression when the
    /// caller requests it. 0 disables compression (default).
    pub compression_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./binstore"),
            block_size: DEFAULT_BLOCK_SIZE,
            compression_threshold: 0,
        }
    }
}

impl Config {
    /// Create a new config with the given working folder
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the staging block quantum
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the compression threshold (0 disables compression)
    pub fn compression_threshold(mut self, bytes: u64) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Block quantum clamped to the supported range.
    pub fn clamped_block_size(&self) -> usize {
        self.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./binstore"));
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.compression_threshold, 0);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .block_size(32 * 1024)
            .compression_threshold(4096);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.block_size, 32 * 1024);
        assert_eq!(config.compression_threshold, 4096);
    }

    #[test]
    fn test_block_size_clamping() {
        assert_eq!(Config::new("/tmp/t").block_size(1).clamped_block_size(), MIN_BLOCK_SIZE);
        assert_eq!(
            Config::new("/tmp/t").block_size(usize::MAX).clamped_block_size(),
            MAX_BLOCK_SIZE
        );
        assert_eq!(
            Config::new("/tmp/t").block_size(8192).clamped_block_size(),
            8192
        );
    }
}
