//! Core of an embedded, ordered key-value storage engine.
//!
//! EmberDB organizes data as a Log-Structured Merge tree. This crate is
//! the engine core: the in-memory index, the on-disk formats, and the
//! iterators that reconcile them into one versioned, snapshot-consistent
//! view. Orchestration (file naming, version tracking, compaction
//! scheduling) lives above it.
//!
//! # Write path
//!
//! ```text
//! WriteBatch ──► wal::Writer ──► MemTable (skip list over an arena)
//!                (durability)        │ size threshold
//!                                    ▼
//!                              sstable::TableBuilder ──► immutable table
//! ```
//!
//! A batch stages mutations in the same byte format the log stores, so
//! commit is one log append followed by one memtable replay. Every entry
//! carries a 56-bit sequence number; nothing is updated in place.
//!
//! # Read path
//!
//! ```text
//! MemTable ──┐
//! table 1  ──┤── iterator::MergingIterator ──► iterator::DbIterator
//! table N  ──┘      (internal key order)        (user view at snapshot)
//! ```
//!
//! Table reads go through a sharded LRU block [`cache::Cache`], and a
//! configurable [`filter::FilterPolicy`] short-circuits point lookups
//! that cannot match.
//!
//! Readers never block writers: the memtable's skip list publishes nodes
//! with release/acquire pointer ordering, and everything on disk is
//! immutable.

pub mod batch;
pub mod cache;
pub mod checksum;
pub mod comparator;
pub mod config;
pub mod encoding;
pub mod env;
pub mod error;
pub mod filter;
pub mod internal_key;
pub mod iterator;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use batch::WriteBatch;
pub use cache::Cache;
pub use comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use config::{CompressionType, Options, ReadOptions, WriteOptions};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use internal_key::{LookupKey, SequenceNumber, ValueType};
pub use iterator::db_iter::{DbIterator, ReadSampler};
pub use iterator::merge::MergingIterator;
pub use iterator::StorageIterator;
pub use memtable::MemTable;
pub use sstable::builder::TableBuilder;
pub use sstable::table::Table;
