//! Bump allocation for memtable storage.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CHUNK_SIZE: usize = 4096;

/// A bump allocator backing the memtable's skip list.
///
/// Nothing is ever freed individually; every chunk is released when the
/// arena drops. Chunks are boxed slices that never move, so a pointer
/// handed out stays valid for the arena's whole lifetime. That is what
/// lets skip-list readers chase node pointers without any reclamation
/// protocol.
pub struct Arena {
    core: Mutex<ArenaCore>,
    usage: AtomicUsize,
}

struct ArenaCore {
    // Chunks are u64 slices so every chunk start is pointer-aligned.
    chunks: Vec<Box<[u64]>>,
    ptr: *mut u8,
    remaining: usize,
}

// The raw cursor only ever points into chunks owned by the same struct.
unsafe impl Send for ArenaCore {}

impl Arena {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(ArenaCore {
                chunks: Vec::new(),
                ptr: std::ptr::null_mut(),
                remaining: 0,
            }),
            usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `bytes` bytes with no alignment guarantee.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let mut core = self.core.lock().unwrap();
        if bytes <= core.remaining {
            let result = core.ptr;
            core.ptr = unsafe { core.ptr.add(bytes) };
            core.remaining -= bytes;
            return result;
        }
        self.allocate_fallback(&mut core, bytes)
    }

    /// Allocates `bytes` bytes aligned for pointer-sized values.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let align = mem::size_of::<usize>();
        let mut core = self.core.lock().unwrap();

        let current_mod = (core.ptr as usize) & (align - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            align - current_mod
        };
        if bytes + slop <= core.remaining {
            let result = unsafe { core.ptr.add(slop) };
            core.ptr = unsafe { core.ptr.add(bytes + slop) };
            core.remaining -= bytes + slop;
            return result;
        }
        // Fresh chunks start pointer-aligned.
        self.allocate_fallback(&mut core, bytes)
    }

    /// Bytes allocated from the OS on behalf of this arena.
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&self, core: &mut ArenaCore, bytes: usize) -> *mut u8 {
        if bytes > CHUNK_SIZE / 4 {
            // Oversize requests get a dedicated chunk so the tail of the
            // current one keeps serving small allocations.
            return self.new_chunk(core, bytes);
        }

        let ptr = self.new_chunk(core, CHUNK_SIZE);
        core.ptr = unsafe { ptr.add(bytes) };
        core.remaining = CHUNK_SIZE - bytes;
        ptr
    }

    fn new_chunk(&self, core: &mut ArenaCore, size: usize) -> *mut u8 {
        let words = (size + 7) / 8;
        let mut chunk = vec![0u64; words].into_boxed_slice();
        let ptr = chunk.as_mut_ptr() as *mut u8;
        core.chunks.push(chunk);
        self.usage.fetch_add(
            words * 8 + mem::size_of::<Box<[u64]>>(),
            Ordering::Relaxed,
        );
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
