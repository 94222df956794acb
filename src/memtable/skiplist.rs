//! A probabilistic ordered index over arena storage.
//!
//! One writer and any number of concurrent readers, including readers
//! racing the writer. Reader safety rests on two things:
//!
//! - Forward pointers are published with release stores and chased with
//!   acquire loads, so a reader that observes a pointer to a node also
//!   observes the node fully initialized. Splicing goes bottom level
//!   first; the bottom level is the authoritative linked list.
//! - Node storage comes from an [`Arena`] that frees nothing until the
//!   whole list drops, so a pointer read at any time stays dereferenceable.
//!
//! The list's height field is racy but monotone: a reader seeing a stale
//! height starts one level lower and still reaches every node.

use std::cmp::Ordering as CmpOrdering;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::arena::Arena;

/// Tallest tower a node can have.
pub const MAX_HEIGHT: usize = 12;

/// 1-in-4 chance of growing a level; keeps towers short and memory low.
const BRANCHING: u32 = 4;

/// Total order over the raw byte runs stored in the list.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering;
}

struct Node {
    key_ptr: *const u8,
    key_len: usize,
    height: usize,
    // Array of `height` forward pointers, allocated separately in the
    // arena. The length lives in `height`; there is no inline trick.
    tower: *const AtomicPtr<Node>,
}

impl Node {
    fn key(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    fn next(&self, level: usize) -> *mut Node {
        debug_assert!(level < self.height);
        unsafe { (*self.tower.add(level)).load(Ordering::Acquire) }
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        debug_assert!(level < self.height);
        unsafe { (*self.tower.add(level)).store(node, Ordering::Release) }
    }

    /// Writer-only variants for links not yet visible to any reader.
    fn next_relaxed(&self, level: usize) -> *mut Node {
        debug_assert!(level < self.height);
        unsafe { (*self.tower.add(level)).load(Ordering::Relaxed) }
    }

    fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        debug_assert!(level < self.height);
        unsafe { (*self.tower.add(level)).store(node, Ordering::Relaxed) }
    }
}

pub struct SkipList {
    arena: Arc<Arena>,
    cmp: Arc<dyn KeyComparator>,
    head: *mut Node,
    max_height: AtomicUsize,
    writer: Mutex<StdRng>,
}

// Nodes are arena-owned and immutable after publication; all shared
// mutation goes through atomics or the writer mutex.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new(cmp: Arc<dyn KeyComparator>, arena: Arc<Arena>) -> Self {
        let mut list = Self {
            arena,
            cmp,
            head: ptr::null_mut(),
            max_height: AtomicUsize::new(1),
            writer: Mutex::new(StdRng::seed_from_u64(0xdeadbeef)),
        };
        list.head = list.new_node(b"", MAX_HEIGHT);
        list
    }

    /// Inserts `key`. Keys equal under the comparator must never be
    /// inserted twice; memtable entries embed a unique sequence number,
    /// which guarantees that.
    pub fn insert(&self, key: &[u8]) {
        // Serializes splices; readers never take this lock.
        let mut rng = self.writer.lock().unwrap();

        let mut prev: [*mut Node; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        let found = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            found.is_null() || self.cmp.compare(unsafe { (*found).key() }, key) != CmpOrdering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = Self::random_height(&mut rng);
        let max_height = self.max_height.load(Ordering::Relaxed);
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
        }

        let node = self.new_node(key, height);
        for level in 0..height {
            unsafe {
                // The node's own pointer is not yet visible, so a relaxed
                // store suffices; the predecessor's store is the release
                // that publishes the node. Bottom level goes first.
                (*node).set_next_relaxed(level, (*prev[level]).next_relaxed(level));
                (*prev[level]).set_next(level, node);
            }
        }

        if height > max_height {
            // Published after the links exist. A reader still on the old
            // height just searches one level lower.
            self.max_height.store(height, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == CmpOrdering::Equal
    }

    fn random_height(rng: &mut StdRng) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    fn new_node(&self, key: &[u8], height: usize) -> *mut Node {
        let key_ptr = if key.is_empty() {
            ptr::NonNull::<u8>::dangling().as_ptr() as *const u8
        } else {
            let dst = self.arena.allocate(key.len());
            unsafe { ptr::copy_nonoverlapping(key.as_ptr(), dst, key.len()) };
            dst as *const u8
        };

        let tower = self
            .arena
            .allocate_aligned(mem::size_of::<AtomicPtr<Node>>() * height)
            as *mut AtomicPtr<Node>;
        for level in 0..height {
            unsafe { ptr::write(tower.add(level), AtomicPtr::new(ptr::null_mut())) };
        }

        let node = self.arena.allocate_aligned(mem::size_of::<Node>()) as *mut Node;
        unsafe {
            ptr::write(
                node,
                Node {
                    key_ptr,
                    key_len: key.len(),
                    height,
                    tower,
                },
            );
        }
        node
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == CmpOrdering::Less
    }

    /// First node with `node.key >= key`, or null. When `prev` is given it
    /// receives the predecessor at every level, ready for a splice.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Latest node with `node.key < key`, or the head sentinel.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if !next.is_null()
                && self.cmp.compare(unsafe { (*next).key() }, key) == CmpOrdering::Less
            {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list, or the head sentinel when empty.
    fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }
}

/// Iteration over the list. Holds the list alive through an `Arc`, so the
/// node pointer inside stays valid for the iterator's lifetime.
pub struct SkipListIterator {
    list: Arc<SkipList>,
    node: *mut Node,
}

// The iterator only reads published nodes.
unsafe impl Send for SkipListIterator {}

impl SkipListIterator {
    pub fn new(list: Arc<SkipList>) -> Self {
        Self {
            list,
            node: ptr::null_mut(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { (*self.node).key() }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        // Search instead of back-links: predecessors may be stale the
        // moment they are read, a fresh search never is.
        debug_assert!(self.valid());
        let node = self.list.find_less_than(self.key());
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytewise;

    impl KeyComparator for Bytewise {
        fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
            a.cmp(b)
        }
    }

    fn new_list() -> Arc<SkipList> {
        Arc::new(SkipList::new(Arc::new(Bytewise), Arc::new(Arena::new())))
    }

    fn key_for(n: u32) -> Vec<u8> {
        format!("key{:08}", n).into_bytes()
    }

    #[test]
    fn test_empty_list() {
        let list = new_list();
        assert!(!list.contains(b"anything"));

        let mut iter = SkipListIterator::new(list);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"x");
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        let list = new_list();
        // Insert a deterministic pseudo-random permutation of 0..500.
        let mut present = std::collections::BTreeSet::new();
        let mut n: u32 = 1;
        for _ in 0..500 {
            n = n.wrapping_mul(1103515245).wrapping_add(12345) % 2000;
            if present.insert(n) {
                list.insert(&key_for(n));
            }
        }

        for i in 0..2000 {
            assert_eq!(list.contains(&key_for(i)), present.contains(&i));
        }

        // Full forward scan returns the sorted set.
        let mut iter = SkipListIterator::new(list.clone());
        iter.seek_to_first();
        for expected in &present {
            assert!(iter.valid());
            assert_eq!(iter.key(), key_for(*expected));
            iter.next();
        }
        assert!(!iter.valid());

        // Full reverse scan returns the reverse.
        let mut iter = SkipListIterator::new(list.clone());
        iter.seek_to_last();
        for expected in present.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key_for(*expected));
            iter.prev();
        }
        assert!(!iter.valid());

        // Seek lands on the smallest key >= target.
        let mut iter = SkipListIterator::new(list);
        for probe in [0u32, 1, 997, 1500, 1999] {
            iter.seek(&key_for(probe));
            match present.range(probe..).next() {
                Some(expected) => {
                    assert!(iter.valid());
                    assert_eq!(iter.key(), key_for(*expected));
                }
                None => assert!(!iter.valid()),
            }
        }
    }

    #[test]
    fn test_concurrent_readers_during_insert() {
        let list = new_list();
        let writer_list = list.clone();

        std::thread::scope(|scope| {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let list = list.clone();
                    scope.spawn(move || {
                        // Repeatedly scan; keys must always come out in
                        // strictly increasing order, even mid-insert.
                        for _ in 0..50 {
                            let mut iter = SkipListIterator::new(list.clone());
                            iter.seek_to_first();
                            let mut last: Option<Vec<u8>> = None;
                            while iter.valid() {
                                let key = iter.key().to_vec();
                                if let Some(last) = &last {
                                    assert!(*last < key);
                                }
                                last = Some(key);
                                iter.next();
                            }
                        }
                    })
                })
                .collect();

            scope.spawn(move || {
                for i in 0..2000u32 {
                    // An odd multiplier permutes u32, so keys never repeat.
                    let shuffled = i.wrapping_mul(2654435761);
                    writer_list.insert(&key_for(shuffled));
                }
            });

            for reader in readers {
                reader.join().expect("reader panicked");
            }
        });
    }
}
