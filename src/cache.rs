//! Sharded LRU cache.
//!
//! Sixteen independently locked shards, selected by the top bits of the
//! caller-supplied hash. Each shard keeps a chained hash table for
//! lookups and two circular lists for ordering:
//!
//! - `in_use`: entries with outstanding external handles (refs ≥ 2), in
//!   no particular order.
//! - `lru`: entries held only by the cache (refs = 1), oldest first.
//!   This is the eviction queue.
//!
//! Every live entry is on exactly one of those lists, or detached when
//! inserted into a zero-capacity cache. An entry is in the hash table iff
//! `in_cache` is set, and `in_cache` is cleared exactly once, when the
//! entry leaves the table. The entry itself is freed (deleter first)
//! when the last reference goes away, which can be long after eviction.
//!
//! Values are type-erased; callers that need `(value, cleanup)` pairs
//! attach a deleter that runs under the shard lock and must not reenter
//! the cache.

use std::any::Any;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

pub type Value = Box<dyn Any + Send + Sync>;

/// Per-entry cleanup hook, run under the shard lock when the entry is
/// freed. Must not touch the cache.
pub type Deleter = Box<dyn FnOnce(&[u8], Value) + Send>;

struct Entry {
    value: Option<Value>,
    deleter: Option<Deleter>,
    next_hash: *mut Entry,
    next: *mut Entry,
    prev: *mut Entry,
    charge: usize,
    hash: u32,
    /// Whether the entry is in the shard's hash table.
    in_cache: bool,
    /// References, including the cache's own while `in_cache`.
    refs: u32,
    key: Vec<u8>,
}

impl Entry {
    fn sentinel() -> *mut Entry {
        let e = Box::into_raw(Box::new(Entry {
            value: None,
            deleter: None,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge: 0,
            hash: 0,
            in_cache: false,
            refs: 0,
            key: Vec::new(),
        }));
        unsafe {
            (*e).next = e;
            (*e).prev = e;
        }
        e
    }
}

unsafe fn list_remove(e: *mut Entry) {
    (*(*e).next).prev = (*e).prev;
    (*(*e).prev).next = (*e).next;
}

/// Appends `e` before the sentinel: `list.prev` is the newest entry.
unsafe fn list_append(list: *mut Entry, e: *mut Entry) {
    (*e).next = list;
    (*e).prev = (*list).prev;
    (*(*e).prev).next = e;
    (*list).prev = e;
}

/// Frees an entry whose refcount hit zero.
unsafe fn free_entry(e: *mut Entry) {
    debug_assert!(!(*e).in_cache);
    let mut boxed = Box::from_raw(e);
    let value = boxed.value.take();
    if let (Some(deleter), Some(value)) = (boxed.deleter.take(), value) {
        deleter(&boxed.key, value);
    }
}

/// Separately chained hash table with power-of-two buckets; doubles when
/// the load factor reaches one so chains stay short.
struct HandleTable {
    list: Vec<*mut Entry>,
    elems: usize,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            list: vec![ptr::null_mut(); 4],
            elems: 0,
        }
    }

    /// Slot holding the matching entry, or the empty slot at the end of
    /// its chain.
    unsafe fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut Entry {
        let index = (hash as usize) & (self.list.len() - 1);
        let mut slot: *mut *mut Entry = &mut self.list[index];
        while !(*slot).is_null() && ((**slot).hash != hash || (**slot).key != key) {
            slot = &mut (**slot).next_hash;
        }
        slot
    }

    unsafe fn lookup(&mut self, key: &[u8], hash: u32) -> *mut Entry {
        *self.find_pointer(key, hash)
    }

    /// Inserts `e`, returning the displaced entry with the same key+hash
    /// if there was one.
    unsafe fn insert(&mut self, e: *mut Entry) -> *mut Entry {
        let key = (*e).key.as_ptr();
        let key_len = (*e).key.len();
        let slot = self.find_pointer(std::slice::from_raw_parts(key, key_len), (*e).hash);
        let old = *slot;
        (*e).next_hash = if old.is_null() {
            ptr::null_mut()
        } else {
            (*old).next_hash
        };
        *slot = e;
        if old.is_null() {
            self.elems += 1;
            if self.elems > self.list.len() {
                self.resize();
            }
        }
        old
    }

    unsafe fn remove(&mut self, key: &[u8], hash: u32) -> *mut Entry {
        let slot = self.find_pointer(key, hash);
        let result = *slot;
        if !result.is_null() {
            *slot = (*result).next_hash;
            self.elems -= 1;
        }
        result
    }

    unsafe fn resize(&mut self) {
        let mut new_length = 4;
        while new_length < self.elems {
            new_length *= 2;
        }
        let mut new_list: Vec<*mut Entry> = vec![ptr::null_mut(); new_length];
        for i in 0..self.list.len() {
            let mut e = self.list[i];
            while !e.is_null() {
                let next = (*e).next_hash;
                let index = ((*e).hash as usize) & (new_length - 1);
                (*e).next_hash = new_list[index];
                new_list[index] = e;
                e = next;
            }
        }
        self.list = new_list;
    }
}

struct Shard {
    capacity: usize,
    usage: usize,
    lru: *mut Entry,
    in_use: *mut Entry,
    table: HandleTable,
}

// Entries are only reached under the owning shard's mutex (or through a
// Handle, which reads immutable fields of an entry it holds a ref on).
unsafe impl Send for Shard {}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            usage: 0,
            lru: Entry::sentinel(),
            in_use: Entry::sentinel(),
            table: HandleTable::new(),
        }
    }

    unsafe fn ref_entry(&mut self, e: *mut Entry) {
        if (*e).refs == 1 && (*e).in_cache {
            // Leaving the eviction queue.
            list_remove(e);
            list_append(self.in_use, e);
        }
        (*e).refs += 1;
    }

    unsafe fn unref(&mut self, e: *mut Entry) {
        debug_assert!((*e).refs > 0);
        (*e).refs -= 1;
        if (*e).refs == 0 {
            free_entry(e);
        } else if (*e).in_cache && (*e).refs == 1 {
            // No external handles left; eligible for eviction again.
            list_remove(e);
            list_append(self.lru, e);
        }
    }

    /// Detaches `e` from its list and the accounting after the hash table
    /// dropped it. Every table removal funnels through here, so
    /// `in_cache` is cleared exactly once.
    unsafe fn finish_erase(&mut self, e: *mut Entry) -> bool {
        if e.is_null() {
            return false;
        }
        debug_assert!((*e).in_cache);
        list_remove(e);
        (*e).in_cache = false;
        self.usage -= (*e).charge;
        self.unref(e);
        true
    }

    unsafe fn lookup(&mut self, key: &[u8], hash: u32) -> *mut Entry {
        let e = self.table.lookup(key, hash);
        if !e.is_null() {
            self.ref_entry(e);
        }
        e
    }

    unsafe fn insert(
        &mut self,
        key: &[u8],
        hash: u32,
        value: Value,
        charge: usize,
        deleter: Option<Deleter>,
    ) -> *mut Entry {
        let e = Box::into_raw(Box::new(Entry {
            value: Some(value),
            deleter,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge,
            hash,
            in_cache: false,
            refs: 1, // the returned handle
            key: key.to_vec(),
        }));

        if self.capacity > 0 {
            (*e).refs += 1; // the cache's own reference
            (*e).in_cache = true;
            list_append(self.in_use, e);
            self.usage += charge;
            let displaced = self.table.insert(e);
            self.finish_erase(displaced);
        }
        // With no capacity the entry stays detached: usable through the
        // handle, never cached.

        while self.usage > self.capacity && (*self.lru).next != self.lru {
            let old = (*self.lru).next;
            debug_assert!((*old).refs == 1);
            let old_key = std::slice::from_raw_parts((*old).key.as_ptr(), (*old).key.len());
            let removed = self.table.remove(old_key, (*old).hash);
            debug_assert!(removed == old);
            self.finish_erase(removed);
        }

        e
    }

    unsafe fn erase(&mut self, key: &[u8], hash: u32) {
        let removed = self.table.remove(key, hash);
        self.finish_erase(removed);
    }

    /// Drops every unreferenced cached entry.
    unsafe fn prune(&mut self) {
        while (*self.lru).next != self.lru {
            let e = (*self.lru).next;
            debug_assert!((*e).refs == 1);
            let key = std::slice::from_raw_parts((*e).key.as_ptr(), (*e).key.len());
            let removed = self.table.remove(key, (*e).hash);
            debug_assert!(removed == e);
            self.finish_erase(removed);
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        unsafe {
            // Dropping the cache with handles still out is a caller bug.
            debug_assert!((*self.in_use).next == self.in_use);
            let mut e = (*self.lru).next;
            while e != self.lru {
                let next = (*e).next;
                debug_assert!((*e).in_cache && (*e).refs == 1);
                (*e).in_cache = false;
                (*e).refs = 0;
                free_entry(e);
                e = next;
            }
            drop(Box::from_raw(self.lru));
            drop(Box::from_raw(self.in_use));
        }
    }
}

/// An external reference to a cache entry. Must be handed back with
/// [`Cache::release`]; the entry stays alive until that happens, even if
/// it has been erased or evicted meanwhile.
pub struct Handle {
    entry: NonNull<Entry>,
}

// A handle pins its entry; the fields it exposes are immutable while
// pinned.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn key(&self) -> &[u8] {
        unsafe { &self.entry.as_ref().key }
    }

    /// The entry's value, downcast to its concrete type.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        unsafe {
            self.entry
                .as_ref()
                .value
                .as_ref()
                .and_then(|v| v.downcast_ref::<T>())
        }
    }
}

/// The sharded cache. Capacity is split evenly across shards; the
/// caller supplies the 32-bit hash, and its top bits pick the shard.
pub struct Cache {
    shards: Vec<Mutex<Shard>>,
    last_id: AtomicU64,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Shard::new(per_shard))).collect(),
            last_id: AtomicU64::new(0),
        }
    }

    fn shard(&self, hash: u32) -> &Mutex<Shard> {
        &self.shards[(hash >> (32 - NUM_SHARD_BITS)) as usize]
    }

    /// Inserts and returns a handle to the new entry. If an entry with the
    /// same key and hash was cached, it is erased (it dies once its other
    /// handles are released).
    pub fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: Value,
        charge: usize,
        deleter: Option<Deleter>,
    ) -> Handle {
        let mut shard = self.shard(hash).lock().unwrap();
        let e = unsafe { shard.insert(key, hash, value, charge, deleter) };
        Handle {
            entry: NonNull::new(e).expect("insert returns a live entry"),
        }
    }

    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<Handle> {
        let mut shard = self.shard(hash).lock().unwrap();
        let e = unsafe { shard.lookup(key, hash) };
        NonNull::new(e).map(|entry| Handle { entry })
    }

    pub fn release(&self, handle: Handle) {
        let e = handle.entry.as_ptr();
        let hash = unsafe { (*e).hash };
        let mut shard = self.shard(hash).lock().unwrap();
        unsafe { shard.unref(e) };
    }

    pub fn erase(&self, key: &[u8], hash: u32) {
        let mut shard = self.shard(hash).lock().unwrap();
        unsafe { shard.erase(key, hash) };
    }

    /// A fresh id for partitioning the key space among clients that share
    /// this cache.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops every unreferenced cached entry in every shard.
    pub fn prune(&self) {
        for shard in &self.shards {
            unsafe { shard.lock().unwrap().prune() };
        }
    }

    /// Total charge of cached entries across shards.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().usage).sum()
    }
}
