//! The mutable in-memory table.
//!
//! Every write lands here first. Entries are immutable once inserted; an
//! overwrite or delete is a new entry under a higher sequence number, and
//! reads pick the newest entry at or below their snapshot.
//!
//! Entry layout, one arena-resident byte run per entry:
//!
//! ```text
//! varint32(internal_key_len) ‖ user_key ‖ fixed64(seq<<8|type)
//!                            ‖ varint32(value_len) ‖ value
//! ```

pub mod arena;
pub mod skiplist;

use std::cmp::Ordering;
use std::sync::Arc;

use self::arena::Arena;
use self::skiplist::{KeyComparator, SkipList, SkipListIterator};
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::encoding::{
    decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32, varint_length,
};
use crate::error::{Error, Result};
use crate::internal_key::{pack_sequence_and_type, LookupKey, SequenceNumber, ValueType};
use crate::iterator::StorageIterator;

/// Orders encoded memtable entries by their embedded internal key.
struct EntryComparator {
    cmp: Arc<InternalKeyComparator>,
}

impl KeyComparator for EntryComparator {
    fn compare(&self, mut a: &[u8], mut b: &[u8]) -> Ordering {
        // Entries are engine-encoded; a missing length prefix is unreachable.
        let ka = get_length_prefixed_slice(&mut a).unwrap_or_default();
        let kb = get_length_prefixed_slice(&mut b).unwrap_or_default();
        self.cmp.compare(ka, kb)
    }
}

pub struct MemTable {
    cmp: Arc<InternalKeyComparator>,
    list: Arc<SkipList>,
    arena: Arc<Arena>,
}

impl MemTable {
    pub fn new(cmp: Arc<InternalKeyComparator>) -> Self {
        let arena = Arc::new(Arena::new());
        let list = Arc::new(SkipList::new(
            Arc::new(EntryComparator { cmp: cmp.clone() }),
            arena.clone(),
        ));
        Self { cmp, list, arena }
    }

    /// Bytes of arena storage behind this table. Drives the flush
    /// threshold; readable concurrently with writes.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Inserts an entry. The caller assigns sequences; one writer at a
    /// time, per the engine's write path.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let mut buf = Vec::with_capacity(
            varint_length(internal_key_len as u64)
                + internal_key_len
                + varint_length(value.len() as u64)
                + value.len(),
        );
        put_varint32(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(sequence, value_type as u8));
        put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);
        self.list.insert(&buf);
    }

    /// Looks up the newest entry for the lookup key's user key at or below
    /// its snapshot. `Some(Ok(value))` for a live value, `Some(Err(
    /// NotFound))` for a tombstone, `None` when this table has no entry.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Vec<u8>>> {
        let mut iter = SkipListIterator::new(self.list.clone());
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return None;
        }

        let mut entry = iter.key();
        let internal_key = get_length_prefixed_slice(&mut entry)?;
        let user_key = &internal_key[..internal_key.len() - 8];
        if self
            .cmp
            .user_comparator()
            .compare(user_key, key.user_key())
            != Ordering::Equal
        {
            return None;
        }

        let trailer = decode_fixed64(&internal_key[internal_key.len() - 8..]);
        match ValueType::from_u8((trailer & 0xff) as u8) {
            Ok(ValueType::Value) => {
                let value = get_length_prefixed_slice(&mut entry)?;
                Some(Ok(value.to_vec()))
            }
            Ok(ValueType::Deletion) => Some(Err(Error::NotFound)),
            Err(err) => Some(Err(err)),
        }
    }

    /// Iterates the table's entries; keys are internal keys.
    pub fn iter(&self) -> MemTableIterator {
        MemTableIterator {
            iter: SkipListIterator::new(self.list.clone()),
            scratch: Vec::new(),
        }
    }
}

/// Yields `(internal_key, value)` in internal-key order.
pub struct MemTableIterator {
    iter: SkipListIterator,
    scratch: Vec<u8>,
}

impl MemTableIterator {
    fn entry(&self) -> &[u8] {
        self.iter.key()
    }
}

impl StorageIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // The list stores length-prefixed entries; wrap the bare internal
        // key the same way before comparing.
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.iter.seek(&self.scratch);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        let mut entry = self.entry();
        get_length_prefixed_slice(&mut entry).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        let mut entry = self.entry();
        let _internal_key = get_length_prefixed_slice(&mut entry);
        get_length_prefixed_slice(&mut entry).unwrap_or_default()
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
