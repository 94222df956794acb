//! Per-range filter blocks.
//!
//! One filter summarizes the keys of every data block that starts inside
//! an aligned `2^base_lg`-byte span of file offsets:
//!
//! ```text
//! filter_block := filter_body* ‖ fixed32 filter_offset[n]
//!                 ‖ fixed32 offsets_array_offset ‖ u8 base_lg
//! ```
//!
//! The reader maps a data block's offset to a filter index with a shift,
//! so lookups never search.

use std::sync::Arc;

use crate::encoding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// 2 KiB of data-block offsets per filter.
const FILTER_BASE_LG: u32 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Key bytes of the current region, flattened, with per-key starts.
    keys: Vec<u8>,
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Announces that the next data block begins at `block_offset`. Emits
    /// a filter for every region that has ended, empty ones included.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.starts.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            let offset = self.filter_offsets[i];
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.starts.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // No data blocks started in this region.
            return;
        }
        self.starts.push(self.keys.len());
        let key_slices: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.starts[i]..self.starts[i + 1]])
            .collect();
        self.policy.create_filter(&key_slices, &mut self.result);
        self.keys.clear();
        self.starts.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    /// Start of the offsets array within `data`.
    offsets_start: usize,
    num_filters: usize,
    base_lg: u32,
}

impl FilterBlockReader {
    /// A malformed block yields a reader with zero filters, which matches
    /// everything: corruption must never produce a false negative.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Self {
        let mut reader = Self {
            policy,
            data,
            offsets_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = reader.data.len();
        if n < 5 {
            return reader;
        }
        reader.base_lg = reader.data[n - 1] as u32;
        let offsets_start = decode_fixed32(&reader.data[n - 5..]) as usize;
        if offsets_start > n - 5 {
            return reader;
        }
        reader.offsets_start = offsets_start;
        reader.num_filters = (n - 5 - offsets_start) / 4;
        reader
    }

    /// Whether the data block at `block_offset` may contain `key`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Out of range or malformed: potential match.
            return true;
        }
        let start = decode_fixed32(&self.data[self.offsets_start + 4 * index..]) as usize;
        // For the last filter this reads the offsets_array_offset field,
        // which is exactly where the filter bodies end.
        let limit = decode_fixed32(&self.data[self.offsets_start + 4 * (index + 1)..]) as usize;
        if start <= limit && limit <= self.offsets_start {
            let filter = &self.data[start..limit];
            return self.policy.key_may_match(key, filter);
        } else if start == limit {
            // Empty filter: nothing in this region.
            return false;
        }
        true
    }
}
