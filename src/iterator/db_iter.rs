//! The user-visible view over the versioned entry stream.
//!
//! The inner iterator yields `(user_key, sequence, type)` entries, newest
//! first within a user key. This wrapper collapses that stream into one
//! entry per live user key as of a snapshot sequence: versions newer than
//! the snapshot are invisible, a tombstone hides everything older under
//! its key, and only the newest visible `Value` survives.
//!
//! Position bookkeeping differs by direction. Moving forward, the inner
//! iterator sits exactly on the yielded entry. Moving in reverse, it sits
//! just before the run of entries for the yielded user key, and the
//! yielded key/value live in saved buffers.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::StorageIterator;
use crate::comparator::Comparator;
use crate::encoding::put_fixed64;
use crate::error::{Error, Result};
use crate::internal_key::{
    extract_user_key, pack_sequence_and_type, parse_internal_key, SequenceNumber, ValueType,
    VALUE_TYPE_FOR_SEEK,
};

/// Mean key+value bytes consumed between read samples.
pub const READ_BYTES_PERIOD: usize = 1 << 20;

/// Receives occasional keys while iteration proceeds, as a signal for
/// read-triggered compaction.
pub trait ReadSampler: Send {
    fn record_read_sample(&mut self, internal_key: &[u8]);
}

#[derive(PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct DbIterator {
    user_comparator: Arc<dyn Comparator>,
    iter: Box<dyn StorageIterator>,
    sequence: SequenceNumber,
    sampler: Option<Box<dyn ReadSampler>>,
    rng: StdRng,
    bytes_until_read_sampling: i64,
    status: Result<()>,
    /// Current user key in reverse mode; skip buffer in forward mode.
    saved_key: Vec<u8>,
    /// Current value in reverse mode.
    saved_value: Vec<u8>,
    direction: Direction,
    valid: bool,
}

impl DbIterator {
    pub fn new(
        user_comparator: Arc<dyn Comparator>,
        iter: Box<dyn StorageIterator>,
        sequence: SequenceNumber,
        seed: u64,
        sampler: Option<Box<dyn ReadSampler>>,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bytes_until_read_sampling = Self::random_period(&mut rng);
        Self {
            user_comparator,
            iter,
            sequence,
            sampler,
            rng,
            bytes_until_read_sampling,
            status: Ok(()),
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            direction: Direction::Forward,
            valid: false,
        }
    }

    fn random_period(rng: &mut StdRng) -> i64 {
        rng.gen_range(0..2 * READ_BYTES_PERIOD as i64)
    }

    /// Charges the current entry against the sampling budget and parses
    /// its trailer. `None` marks the entry unusable (and the iterator's
    /// status corrupt).
    fn sample_and_parse(&mut self) -> Option<(SequenceNumber, ValueType)> {
        let consumed = (self.iter.key().len() + self.iter.value().len()) as i64;
        self.bytes_until_read_sampling -= consumed;
        while self.bytes_until_read_sampling < 0 {
            self.bytes_until_read_sampling += Self::random_period(&mut self.rng);
            if let Some(sampler) = &mut self.sampler {
                sampler.record_read_sample(self.iter.key());
            }
        }

        match parse_internal_key(self.iter.key()) {
            Ok(parsed) => Some((parsed.sequence, parsed.value_type)),
            Err(_) => {
                if self.status.is_ok() {
                    self.status = Err(Error::Corruption(
                        "corrupted internal key in iterator".to_string(),
                    ));
                }
                None
            }
        }
    }

    /// Advances to the next visible user entry. `saved_key` is the skip
    /// buffer: when `skipping`, entries with user keys <= it are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.iter.valid());
        debug_assert!(self.direction == Direction::Forward);
        loop {
            if let Some((sequence, value_type)) = self.sample_and_parse() {
                if sequence <= self.sequence {
                    match value_type {
                        ValueType::Deletion => {
                            // Hide all older entries for this user key.
                            self.saved_key.clear();
                            self.saved_key
                                .extend_from_slice(extract_user_key(self.iter.key()));
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self
                                    .user_comparator
                                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.saved_key.clear();
                                self.valid = true;
                                return;
                            }
                        }
                    }
                }
            }
            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Scans backward to the newest visible entry of the previous live
    /// user key, leaving it in the saved buffers.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        if self.iter.valid() {
            loop {
                if let Some((sequence, parsed_type)) = self.sample_and_parse() {
                    if sequence <= self.sequence {
                        if value_type != ValueType::Deletion
                            && self
                                .user_comparator
                                .compare(extract_user_key(self.iter.key()), &self.saved_key)
                                == Ordering::Less
                        {
                            // A live record is saved and this entry belongs
                            // to an earlier user key.
                            break;
                        }
                        value_type = parsed_type;
                        if value_type == ValueType::Deletion {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        } else {
                            self.saved_key.clear();
                            self.saved_key
                                .extend_from_slice(extract_user_key(self.iter.key()));
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if value_type == ValueType::Deletion {
            // Ran out of entries with nothing live pending.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl StorageIterator for DbIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();

        let mut seek_key = Vec::with_capacity(target.len() + 8);
        seek_key.extend_from_slice(target);
        put_fixed64(
            &mut seek_key,
            pack_sequence_and_type(self.sequence, VALUE_TYPE_FOR_SEEK),
        );
        self.iter.seek(&seek_key);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator sits just before the entries for the
            // current key; step into them. saved_key already holds the
            // key to skip past.
            if !self.iter.valid() {
                self.iter.seek_to_first();
            } else {
                self.iter.next();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            // Remember the yielded user key so every older version of it
            // is skipped.
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
        }

        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // The inner iterator sits on the yielded entry; back it out of
            // the current user key's run.
            debug_assert!(self.iter.valid());
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .user_comparator
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.iter.status()
    }
}
