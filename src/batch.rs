//! Write batches.
//!
//! A batch stages a group of mutations that apply atomically: its byte
//! representation is appended to the log as one record, then replayed
//! into the memtable. The staging format and the log payload are the
//! same bytes:
//!
//! ```text
//! fixed64 sequence ‖ fixed32 count ‖ record*
//! record := 0x01 ‖ varstring key ‖ varstring value     (put)
//!         | 0x00 ‖ varstring key                       (delete)
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::{decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice};
use crate::error::{Error, Result};
use crate::internal_key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

/// Sequence (8 bytes) plus record count (4 bytes).
pub const HEADER_SIZE: usize = 12;

/// Receives a batch's records in order during [`WriteBatch::iterate`].
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; HEADER_SIZE],
        }
    }

    /// Resets to an empty batch with a zeroed header.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Number of records staged.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    pub fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.rep[8..12], count);
    }

    /// Sequence assigned to the batch's first record.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[0..8])
    }

    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        LittleEndian::write_u64(&mut self.rep[0..8], sequence);
    }

    /// Size of the byte representation, header included.
    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// The bytes that go to the log.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopts bytes previously produced by `contents`; this is the log
    /// recovery path.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "write batch of {} bytes is smaller than its header",
                contents.len()
            )));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }

    /// Appends `other`'s records to this batch, summing the counts. The
    /// sequence of `other` is ignored.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Replays the record stream into `handler` in staging order.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> Result<()> {
        if self.rep.len() < HEADER_SIZE {
            return Err(Error::Corruption(
                "write batch is smaller than its header".to_string(),
            ));
        }
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found: u32 = 0;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            if tag == ValueType::Value as u8 {
                let key = get_length_prefixed_slice(&mut input)
                    .ok_or_else(|| Error::Corruption("bad write batch put record".to_string()))?;
                let value = get_length_prefixed_slice(&mut input)
                    .ok_or_else(|| Error::Corruption("bad write batch put record".to_string()))?;
                handler.put(key, value);
            } else if tag == ValueType::Deletion as u8 {
                let key = get_length_prefixed_slice(&mut input).ok_or_else(|| {
                    Error::Corruption("bad write batch delete record".to_string())
                })?;
                handler.delete(key);
            } else {
                return Err(Error::Corruption(format!("unknown write batch tag {tag}")));
            }
            found += 1;
        }
        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch count is {} but {} records are present",
                self.count(),
                found
            )));
        }
        Ok(())
    }

    /// Applies the batch to `mem`, assigning sequences `sequence(),
    /// sequence()+1, …` in record order.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalKeyComparator};
    use crate::internal_key::{LookupKey, MAX_SEQUENCE_NUMBER};
    use std::sync::Arc;

    /// Renders the records it sees, for easy comparison.
    #[derive(Default)]
    struct Printer {
        log: Vec<String>,
    }

    impl BatchHandler for Printer {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.log.push(format!(
                "put({}, {})",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ));
        }

        fn delete(&mut self, key: &[u8]) {
            self.log
                .push(format!("delete({})", String::from_utf8_lossy(key)));
        }
    }

    fn records_of(batch: &WriteBatch) -> Vec<String> {
        let mut printer = Printer::default();
        batch.iterate(&mut printer).expect("Iterate failed");
        printer.log
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.sequence(), 0);
        assert_eq!(batch.byte_size(), HEADER_SIZE);
        assert!(records_of(&batch).is_empty());
    }

    #[test]
    fn test_multiple_records() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.delete(b"box");
        batch.put(b"baz", b"boo");
        batch.set_sequence(100);

        assert_eq!(batch.sequence(), 100);
        assert_eq!(batch.count(), 3);
        assert_eq!(
            records_of(&batch),
            vec!["put(foo, bar)", "delete(box)", "put(baz, boo)"]
        );

        batch.clear();
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.sequence(), 0);
        assert!(records_of(&batch).is_empty());
    }

    #[test]
    fn test_append() {
        let mut b1 = WriteBatch::new();
        let mut b2 = WriteBatch::new();
        b1.set_sequence(200);
        b2.set_sequence(300);

        b1.append(&b2);
        assert!(records_of(&b1).is_empty());

        b2.put(b"a", b"va");
        b1.append(&b2);
        assert_eq!(records_of(&b1), vec!["put(a, va)"]);
        assert_eq!(b1.count(), 1);

        b2.clear();
        b2.put(b"b", b"vb");
        b1.append(&b2);
        assert_eq!(records_of(&b1), vec!["put(a, va)", "put(b, vb)"]);

        b2.delete(b"foo");
        b1.append(&b2);
        assert_eq!(
            records_of(&b1),
            vec!["put(a, va)", "put(b, vb)", "put(b, vb)", "delete(foo)"]
        );
        assert_eq!(b1.count(), 4);
        assert_eq!(b1.sequence(), 200);
    }

    #[test]
    fn test_corrupted_batch_is_rejected() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.delete(b"box");

        // Truncated mid-record.
        let contents = batch.contents().to_vec();
        let mut truncated = WriteBatch::new();
        truncated
            .set_contents(&contents[..contents.len() - 1])
            .expect("Set contents failed");
        let result = truncated.iterate(&mut Printer::default());
        assert!(matches!(result, Err(Error::Corruption(_))));

        // Count claims one more record than the stream holds.
        let mut wrong_count = WriteBatch::new();
        wrong_count.set_contents(&contents).expect("Set contents failed");
        wrong_count.set_count(3);
        let result = wrong_count.iterate(&mut Printer::default());
        assert!(matches!(result, Err(Error::Corruption(_))));

        // Unknown tag.
        let mut bad_tag_bytes = contents.clone();
        bad_tag_bytes[HEADER_SIZE] = 0x7f;
        let mut bad_tag = WriteBatch::new();
        bad_tag.set_contents(&bad_tag_bytes).expect("Set contents failed");
        let result = bad_tag.iterate(&mut Printer::default());
        assert!(matches!(result, Err(Error::Corruption(_))));

        // Shorter than the header.
        let mut short = WriteBatch::new();
        assert!(short.set_contents(&contents[..HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_insert_into_memtable() {
        let mem = MemTable::new(Arc::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))));

        // put(k,v1); delete(k); put(k,v2) at base sequence 10 lands as
        // entries 10, 11, 12.
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v1");
        batch.delete(b"k");
        batch.put(b"k", b"v2");
        batch.set_sequence(10);
        batch.insert_into(&mem).expect("Insert failed");

        let get = |snapshot| mem.get(&LookupKey::new(b"k", snapshot));
        assert_eq!(get(MAX_SEQUENCE_NUMBER), Some(Ok(b"v2".to_vec())));
        assert_eq!(get(12), Some(Ok(b"v2".to_vec())));
        assert_eq!(get(11), Some(Err(Error::NotFound)));
        assert_eq!(get(10), Some(Ok(b"v1".to_vec())));
        assert_eq!(get(9), None);
    }
}
