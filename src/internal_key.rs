//! Versioned key layout.
//!
//! Every entry the engine stores is keyed by an internal key:
//!
//! ```text
//! user_key ‖ fixed64( sequence << 8 | type )
//! ```
//!
//! Internal keys order by user key ascending, then sequence descending,
//! then type descending, so the newest visible version of a user key is
//! the first one a forward seek lands on.

use crate::encoding::{decode_fixed64, put_fixed64, put_varint32};
use crate::error::{Error, Result};

pub type SequenceNumber = u64;

/// Sequences are 56-bit so they can share a u64 with the type tag.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Distinguishes live values from tombstones. The tag byte is part of the
/// on-disk format for both write batches and internal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A tombstone.
    Deletion = 0,
    /// A regular value.
    Value = 1,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(Error::Corruption(format!("unknown value type tag {other}"))),
        }
    }
}

/// Seek keys carry a tag larger than any real type, so a seek for
/// `(user_key, snapshot)` lands on the newest entry of `user_key` with
/// sequence at or below the snapshot. Never stored.
pub const VALUE_TYPE_FOR_SEEK: u8 = 0xff;

pub fn pack_sequence_and_type(sequence: SequenceNumber, tag: u8) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | tag as u64
}

/// Appends the internal key for `(user_key, sequence, value_type)`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(sequence, value_type as u8));
}

/// The `(user_key, sequence, type)` triple unpacked from an internal key.
#[derive(Debug, Clone, Copy)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

pub fn parse_internal_key(internal_key: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if internal_key.len() < 8 {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            internal_key.len()
        )));
    }
    let trailer = decode_fixed64(&internal_key[internal_key.len() - 8..]);
    let value_type = ValueType::from_u8((trailer & 0xff) as u8)?;
    Ok(ParsedInternalKey {
        user_key: &internal_key[..internal_key.len() - 8],
        sequence: trailer >> 8,
        value_type,
    })
}

/// The user-key prefix of a well-formed internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// A user key formatted for lookups at a snapshot. Carries the memtable
/// form (length-prefixed) and the table form (bare internal key) in one
/// allocation.
pub struct LookupKey {
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + 13);
        put_varint32(&mut data, (user_key.len() + 8) as u32);
        let kstart = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_sequence_and_type(snapshot, VALUE_TYPE_FOR_SEEK));
        LookupKey { data, kstart }
    }

    /// Key for probing the memtable: `varint32(len) ‖ internal_key`.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// Key for probing tables.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }
}
