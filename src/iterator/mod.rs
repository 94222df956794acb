//! Iterator contracts and combinators.
//!
//! Everything that yields ordered entries (memtables, blocks, tables,
//! the n-way merge, the user-visible view) speaks [`StorageIterator`].
//! Unlike `std::iter::Iterator`, the cursor is bidirectional and
//! seekable, and `key`/`value` borrow from the iterator's current
//! position instead of handing out owned items.

pub mod db_iter;
pub mod merge;

use crate::error::Result;

/// A bidirectional, seekable cursor over ordered entries.
///
/// A fresh iterator is not valid; position it with one of the seek
/// methods first. `key`, `value`, `next`, and `prev` require `valid()`.
pub trait StorageIterator {
    fn valid(&self) -> bool;

    /// Positions at the first entry, if any.
    fn seek_to_first(&mut self);

    /// Positions at the last entry, if any.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with key `>= target`.
    fn seek(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Sticky: once non-OK, every later call returns the same error.
    fn status(&self) -> Result<()>;
}
