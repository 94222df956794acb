//! Engine configuration.

use std::sync::Arc;

use crate::cache::Cache;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;

/// How a table file's blocks are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Configuration shared by the memtable, log, and table code.
#[derive(Clone)]
pub struct Options {
    /// Total order over user keys.
    pub comparator: Arc<dyn Comparator>,

    /// Memtable size that triggers a flush (default: 4MB).
    pub write_buffer_size: usize,

    /// Target uncompressed size of a table data block (default: 4KB).
    pub block_size: usize,

    /// Keys between prefix-compression restart points (default: 16).
    pub block_restart_interval: usize,

    /// Block compression (default: snappy, with automatic fallback when
    /// compression does not pay for itself).
    pub compression: CompressionType,

    /// Filter policy for table files, if any (default: none).
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Shared cache for table data blocks, if any (default: none).
    pub block_cache: Option<Arc<Cache>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            write_buffer_size: 4 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,
            filter_policy: None,
            block_cache: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn block_cache(mut self, cache: Arc<Cache>) -> Self {
        self.block_cache = Some(cache);
        self
    }
}

/// Per-read configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify block checksums on every read (default: false).
    pub verify_checksums: bool,

    /// Populate the block cache with blocks read on this operation
    /// (default: true). Bulk scans typically turn this off.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn fill_cache(mut self, fill: bool) -> Self {
        self.fill_cache = fill;
        self
    }
}

/// Per-write configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the log before the write is acknowledged (default: false).
    pub sync: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.block_size, 4 * 1024);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.compression, CompressionType::Snappy);
        assert!(options.filter_policy.is_none());
        assert!(options.block_cache.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = Options::new()
            .write_buffer_size(64 * 1024)
            .block_size(1024)
            .block_restart_interval(4)
            .compression(CompressionType::None);
        assert_eq!(options.write_buffer_size, 64 * 1024);
        assert_eq!(options.block_size, 1024);
        assert_eq!(options.block_restart_interval, 4);
        assert_eq!(options.compression, CompressionType::None);
    }

    #[test]
    fn test_read_options() {
        let read_options = ReadOptions::default();
        assert!(!read_options.verify_checksums);
        assert!(read_options.fill_cache);

        let read_options = ReadOptions::new().verify_checksums(true).fill_cache(false);
        assert!(read_options.verify_checksums);
        assert!(!read_options.fill_cache);
    }
}
