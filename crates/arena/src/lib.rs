//! # Arena — bump-pointer allocation for the memtable
//!
//! The memtable carves every node, key, and value out of one arena so that
//! teardown is a single bulk release instead of a per-entry walk. Allocation
//! is a pointer bump in the common case; nothing is ever freed individually.
//!
//! ## Block policy
//!
//! The arena keeps one *current* block of [`BLOCK_SIZE`] bytes and serves
//! requests from its remaining space. When a request does not fit:
//!
//! - requests larger than a quarter block get a **dedicated block** of
//!   exactly the requested size, leaving the current block's remaining
//!   space untouched for future small requests;
//! - smaller requests abandon the current block's leftover and start a
//!   fresh [`BLOCK_SIZE`] block.
//!
//! This bounds waste to a quarter block per block while keeping large
//! values out of the bump path.
//!
//! ## Concurrency contract
//!
//! One writer, any number of readers. `allocate` and `allocate_aligned`
//! must be externally serialized (the memtable's write path already is);
//! [`Arena::memory_usage`] may be read concurrently from any thread and is
//! eventually consistent with the writer. Bytes handed out are immutable
//! once the caller finishes writing them, so readers may dereference spans
//! freely while the writer allocates new ones.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Alignment guaranteed by [`Arena::allocate_aligned`].
const ALIGN: usize = if std::mem::size_of::<usize>() > 8 {
    std::mem::size_of::<usize>()
} else {
    8
};

struct State {
    /// Bump pointer into the current block.
    alloc_ptr: *mut u8,
    /// Bytes left in the current block.
    alloc_bytes_remaining: usize,
    /// Every block ever allocated. `u64` storage keeps block starts aligned
    /// for [`Arena::allocate_aligned`] without a custom allocator.
    blocks: Vec<Box<[u64]>>,
}

/// Append-only allocator; all memory is released when the arena drops.
pub struct Arena {
    state: UnsafeCell<State>,
    /// Total bytes held, published after every block allocation.
    memory_usage: AtomicUsize,
}

// Safety: the single-writer contract above. `memory_usage` is atomic, the
// rest of the state is only touched by the (externally serialized) writer,
// and handed-out spans are immutable after initialization.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an empty arena. No block is allocated until the first request.
    #[must_use]
    pub fn new() -> Self {
        Arena {
            state: UnsafeCell::new(State {
                alloc_ptr: std::ptr::null_mut(),
                alloc_bytes_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns a span of `bytes` bytes that lives as long as the arena.
    ///
    /// The span is uninitialized (zeroed on first use of the block) and has
    /// no alignment guarantee beyond a byte; use [`Arena::allocate_aligned`]
    /// for pointer-bearing structures.
    ///
    /// # Panics
    ///
    /// Panics on a zero-byte request. Host allocation failure aborts.
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        // Zero-byte spans have no useful identity; disallow them outright.
        assert!(bytes > 0, "arena: zero-byte allocation");
        let state = unsafe { &mut *self.state.get() };
        if bytes <= state.alloc_bytes_remaining {
            let result = state.alloc_ptr;
            state.alloc_ptr = unsafe { state.alloc_ptr.add(bytes) };
            state.alloc_bytes_remaining -= bytes;
            // In-bounds of a live block, hence non-null.
            unsafe { NonNull::new_unchecked(result) }
        } else {
            self.allocate_fallback(state, bytes)
        }
    }

    /// Like [`Arena::allocate`] but aligned to `max(8, pointer size)`.
    ///
    /// # Panics
    ///
    /// Panics on a zero-byte request.
    pub fn allocate_aligned(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "arena: zero-byte allocation");
        let state = unsafe { &mut *self.state.get() };

        let current_mod = state.alloc_ptr as usize & (ALIGN - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            ALIGN - current_mod
        };
        let needed = bytes + slop;

        if needed <= state.alloc_bytes_remaining {
            let result = unsafe { state.alloc_ptr.add(slop) };
            state.alloc_ptr = unsafe { state.alloc_ptr.add(needed) };
            state.alloc_bytes_remaining -= needed;
            unsafe { NonNull::new_unchecked(result) }
        } else {
            // Fresh blocks start on a u64 boundary, already aligned.
            self.allocate_fallback(state, bytes)
        }
    }

    /// Total bytes of blocks held plus per-block bookkeeping.
    ///
    /// Safe to call from any thread while the writer allocates; the value
    /// trails the writer by at most one block.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&self, state: &mut State, bytes: usize) -> NonNull<u8> {
        if bytes > BLOCK_SIZE / 4 {
            // Large object: dedicated block, current block stays useful.
            let ptr = self.allocate_new_block(state, bytes);
            return unsafe { NonNull::new_unchecked(ptr) };
        }

        // Abandon the current block's leftover and start a new one.
        let ptr = self.allocate_new_block(state, BLOCK_SIZE);
        state.alloc_ptr = unsafe { ptr.add(bytes) };
        state.alloc_bytes_remaining = BLOCK_SIZE - bytes;
        unsafe { NonNull::new_unchecked(ptr) }
    }

    fn allocate_new_block(&self, state: &mut State, block_bytes: usize) -> *mut u8 {
        let words = block_bytes.div_ceil(std::mem::size_of::<u64>());
        let mut block = vec![0u64; words].into_boxed_slice();
        let ptr = block.as_mut_ptr().cast::<u8>();
        state.blocks.push(block);
        self.memory_usage.fetch_add(
            words * std::mem::size_of::<u64>() + std::mem::size_of::<usize>(),
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

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("memory_usage", &self.memory_usage())
            .finish()
    }
}
