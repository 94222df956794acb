//! Prefix-compressed key-value blocks.
//!
//! Entries share prefixes with their predecessor:
//!
//! ```text
//! entry := varint32 shared ‖ varint32 unshared ‖ varint32 value_len
//!          ‖ key_delta[unshared] ‖ value[value_len]
//! block := entry* ‖ fixed32 restart_offset[num_restarts]
//!          ‖ fixed32 num_restarts
//! ```
//!
//! Every `restart_interval`-th entry stores its full key (`shared = 0`),
//! and the trailer records where those entries start, so a seek can
//! bisect the restart points and only decode linearly inside one
//! interval.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::encoding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::error::{Error, Result};
use crate::iterator::StorageIterator;

/// Accumulates ascending key-value pairs into a block image.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. `key` must be greater than every key added since
    /// the last `reset`.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let unshared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, unshared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart trailer and returns the finished block image.
    pub fn finish(&mut self) -> &[u8] {
        for i in 0..self.restarts.len() {
            let restart = self.restarts[i];
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size of the block if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }
}

/// An immutable decoded block.
pub struct Block {
    data: Vec<u8>,
    /// Start of the restart array.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too small for its trailer".to_string()));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts == 0 || num_restarts as usize > max_restarts {
            return Err(Error::Corruption(format!(
                "bad restart count {num_restarts} in {}-byte block",
                data.len()
            )));
        }
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts as usize);
        decode_fixed32(&self.data[self.restart_offset + 4 * index..]) as usize
    }

    pub fn iter(self: &Arc<Self>, cmp: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator::new(self.clone(), cmp)
    }
}

/// Decodes the entry header at `offset`. Returns
/// `(shared, unshared, value_len, delta_offset)` or `None` when the entry
/// does not fit in `[offset, data_end)`.
fn decode_entry(
    data: &[u8],
    offset: usize,
    data_end: usize,
) -> Option<(usize, usize, usize, usize)> {
    // A corrupt restart array can point anywhere.
    if offset > data_end {
        return None;
    }
    let mut input = &data[offset..data_end];
    let shared = get_varint32(&mut input)? as usize;
    let unshared = get_varint32(&mut input)? as usize;
    let value_len = get_varint32(&mut input)? as usize;
    let delta_offset = data_end - input.len();
    if delta_offset + unshared + value_len > data_end {
        return None;
    }
    Some((shared, unshared, value_len, delta_offset))
}

/// Bidirectional cursor over one block.
pub struct BlockIterator {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `data_end` when exhausted.
    current: usize,
    /// Restart point at or before `current`.
    restart_index: usize,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Result<()>,
}

impl BlockIterator {
    fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> Self {
        let data_end = block.restart_offset;
        Self {
            block,
            cmp,
            current: data_end,
            restart_index: 0,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: Ok(()),
        }
    }

    fn data_end(&self) -> usize {
        self.block.restart_offset
    }

    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // Leave a zero-length value at the restart offset so the next
        // parse starts there.
        self.value_offset = self.block.restart_point(index);
        self.value_len = 0;
    }

    fn corrupt(&mut self) {
        if self.status.is_ok() {
            self.status = Err(Error::Corruption("bad entry in block".to_string()));
        }
        self.current = self.data_end();
        self.restart_index = self.block.num_restarts as usize;
        self.key.clear();
        self.value_offset = 0;
        self.value_len = 0;
    }

    /// Advances to the entry at `next_entry_offset`. False at the end of
    /// the block or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.data_end() {
            // Past the last entry.
            self.current = self.data_end();
            self.restart_index = self.block.num_restarts as usize;
            return false;
        }
        match decode_entry(&self.block.data, self.current, self.data_end()) {
            Some((shared, unshared, value_len, delta_offset)) if shared <= self.key.len() => {
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.block.data[delta_offset..delta_offset + unshared]);
                self.value_offset = delta_offset + unshared;
                self.value_len = value_len;
                while self.restart_index + 1 < self.block.num_restarts as usize
                    && self.block.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            _ => {
                self.corrupt();
                false
            }
        }
    }
}

impl StorageIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.current < self.data_end()
    }

    fn seek_to_first(&mut self) {
        if self.status.is_err() {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.status.is_err() {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts as usize - 1);
        while self.parse_next_key() && self.next_entry_offset() < self.data_end() {
            // Walk to the last entry of the last restart interval.
        }
    }

    fn seek(&mut self, target: &[u8]) {
        if self.status.is_err() {
            return;
        }
        // Bisect to the last restart point whose key is < target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts as usize - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.block.restart_point(mid);
            match decode_entry(&self.block.data, offset, self.data_end()) {
                Some((0, unshared, _, delta_offset)) => {
                    let mid_key = &self.block.data[delta_offset..delta_offset + unshared];
                    if self.cmp.compare(mid_key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                // Restart entries must store a full key.
                _ => {
                    self.corrupt();
                    return;
                }
            }
        }
        // Scan forward to the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_key();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        // Find the restart point strictly before the current entry, then
        // replay entries until the one that ends where we started.
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No entry before the first.
                self.current = self.data_end();
                self.restart_index = self.block.num_restarts as usize;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish().to_vec()).expect("Failed to decode block"))
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn sample_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"apple".to_vec(), b"fruit".to_vec()),
            (b"application".to_vec(), b"software".to_vec()),
            (b"banana".to_vec(), b"fruit".to_vec()),
            (b"band".to_vec(), b"music".to_vec()),
            (b"bandana".to_vec(), b"clothing".to_vec()),
        ]
    }

    #[test]
    fn test_empty_block() {
        let mut builder = BlockBuilder::new(16);
        let block = Arc::new(Block::new(builder.finish().to_vec()).expect("decode"));
        let mut iter = block.iter(cmp());
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_iterate_reproduces_input() {
        for restart_interval in [1, 2, 3, 16] {
            let entries = sample_entries();
            let refs: Vec<(&[u8], &[u8])> = entries
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            let block = build_block(&refs, restart_interval);

            let mut iter = block.iter(cmp());
            iter.seek_to_first();
            for (key, value) in &entries {
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
                iter.next();
            }
            assert!(!iter.valid());
            assert!(iter.status().is_ok());
        }
    }

    #[test]
    fn test_seek_finds_smallest_at_least() {
        for restart_interval in [1, 2, 3, 16] {
            let entries = sample_entries();
            let refs: Vec<(&[u8], &[u8])> = entries
                .iter()
                .map(|(k, v)| (k.as_slice(), v.as_slice()))
                .collect();
            let block = build_block(&refs, restart_interval);
            let mut iter = block.iter(cmp());

            // Every stored key finds itself.
            for (key, value) in &entries {
                iter.seek(key);
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
            }

            // Probes between keys land on the successor.
            iter.seek(b"a");
            assert_eq!(iter.key(), b"apple");
            iter.seek(b"appz");
            assert_eq!(iter.key(), b"banana");
            iter.seek(b"bandan");
            assert_eq!(iter.key(), b"bandana");
            iter.seek(b"zzz");
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_reverse_iteration() {
        let entries = sample_entries();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        for restart_interval in [1, 2, 16] {
            let block = build_block(&refs, restart_interval);
            let mut iter = block.iter(cmp());

            iter.seek_to_last();
            for (key, _) in entries.iter().rev() {
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                iter.prev();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_prev_after_seek() {
        let entries = sample_entries();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&refs, 2);
        let mut iter = block.iter(cmp());

        iter.seek(b"band");
        assert_eq!(iter.key(), b"band");
        iter.prev();
        assert_eq!(iter.key(), b"banana");
        iter.prev();
        assert_eq!(iter.key(), b"application");

        iter.seek_to_first();
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_many_keys_all_probes() {
        // Restart correctness: for several intervals, a seek to any probe
        // returns the smallest stored key >= probe.
        let keys: Vec<Vec<u8>> = (0..400u32).map(|i| format!("key{:06}", i * 3).into_bytes()).collect();
        for restart_interval in [1, 7, 16, 64] {
            let entries: Vec<(&[u8], &[u8])> =
                keys.iter().map(|k| (k.as_slice(), &b"v"[..])).collect();
            let block = build_block(&entries, restart_interval);
            let mut iter = block.iter(cmp());

            for probe in 0..(400 * 3) {
                let target = format!("key{:06}", probe).into_bytes();
                iter.seek(&target);
                let expected = (probe + 2) / 3 * 3;
                if expected < 400 * 3 {
                    assert!(iter.valid());
                    assert_eq!(iter.key(), format!("key{:06}", expected).into_bytes());
                } else {
                    assert!(!iter.valid());
                }
            }
        }
    }

    #[test]
    fn test_truncated_entry_sets_status() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"aaa", b"vvvv");
        builder.add(b"bbb", b"wwww");
        let image = builder.finish().to_vec();

        // Rebuild the image with the second entry's value length inflated
        // past the end of the data region.
        let mut corrupt = image.clone();
        // entry 1: shared=0, unshared=3, value_len=4 → starts at 0; entry 2
        // begins at 3 + 3 + 4 = 10, its value_len varint is at offset 12.
        corrupt[12] = 200;
        let block = Arc::new(Block::new(corrupt).expect("trailer still parses"));
        let mut iter = block.iter(cmp());
        iter.seek_to_first();
        assert!(iter.valid());
        iter.next();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_restart_count_validation() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0, 0]).is_err());
        // Claims 100 restarts in a 4-byte block.
        let mut data = Vec::new();
        put_fixed32(&mut data, 100);
        assert!(Block::new(data).is_err());
    }
}
