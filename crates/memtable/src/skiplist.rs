//! # Skiplist — the memtable's ordered index
//!
//! A probabilistic ordered map over opaque byte-string keys (the keys embed
//! their values, so there is no separate value slot). Nodes live in the
//! memtable's [`Arena`]; each node carries a *tower* of forward pointers
//! whose height is drawn from a geometric distribution with branching
//! factor [`BRANCHING`], capped at [`MAX_HEIGHT`].
//!
//! ```text
//! level 2:  HEAD ----------------> c ----------------------> nil
//! level 1:  HEAD ------> b ------> c ------------> e ------> nil
//! level 0:  HEAD -> a -> b -> c -> d -> e -> f ------------> nil
//! ```
//!
//! ## Concurrency
//!
//! Single writer, lock-free readers:
//!
//! - `insert` is called by at most one thread at a time (the memtable's
//!   write path is externally serialized).
//! - Any number of readers may traverse concurrently with that writer.
//!
//! Safety rests on the publication order: a node's key pointer and lower
//! tower slots are written first, then each predecessor's forward pointer
//! is stored with `Release`; readers load forward pointers with `Acquire`
//! before dereferencing. A reader therefore sees either the pre-insert
//! list or a fully initialized node, never a torn one. The current
//! `max_height` is a relaxed atomic — a reader that observes the new
//! height before the new node simply falls through the head's null slots
//! one level down.
//!
//! Nodes are never deleted; the arena reclaims everything at once when the
//! owning memtable drops.

use std::cmp::Ordering as KeyOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use arena::Arena;

/// Tallest tower a node can have. Heights follow a geometric distribution,
/// so 12 levels comfortably cover memtables of tens of millions of entries.
pub const MAX_HEIGHT: usize = 12;

/// Expected fan-out per level: each level promotes 1-in-4 nodes.
const BRANCHING: u32 = 4;

/// A total order over the encoded keys stored in the list.
///
/// Keys are raw pointers into arena memory; the comparator is responsible
/// for decoding whatever framing the keys carry (the memtable uses a
/// varint32 length prefix).
pub trait KeyComparator: Send + Sync {
    /// Compares two stored keys.
    ///
    /// # Safety
    ///
    /// Both pointers must reference well-formed encoded keys that outlive
    /// the call (in practice: spans carved from the list's arena, or a
    /// caller-owned seek target).
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> KeyOrdering;
}

/// List node: key pointer plus a variable-height tower of forward
/// pointers. Only `tower[0]` is declared; higher slots are carved from the
/// same arena allocation directly behind it.
#[repr(C)]
struct Node {
    key: *const u8,
    tower: [AtomicPtr<Node>; 1],
}

/// Pointer to the `level`-th tower slot of `node`.
///
/// Raw-pointer arithmetic throughout: the tower extends past the end of
/// the declared array, inside the node's arena allocation.
unsafe fn tower_slot(node: *const Node, level: usize) -> *const AtomicPtr<Node> {
    ptr::addr_of!((*node).tower).cast::<AtomicPtr<Node>>().add(level)
}

/// Loads a forward pointer, synchronizing with the writer's publication.
unsafe fn next(node: *const Node, level: usize) -> *mut Node {
    (*tower_slot(node, level)).load(Ordering::Acquire)
}

/// Publishes a forward pointer; everything written to the pointee before
/// this store is visible to readers that observe it.
unsafe fn set_next(node: *const Node, level: usize, x: *mut Node) {
    (*tower_slot(node, level)).store(x, Ordering::Release);
}

/// Relaxed variants for writer-private steps of an insertion.
unsafe fn next_relaxed(node: *const Node, level: usize) -> *mut Node {
    (*tower_slot(node, level)).load(Ordering::Relaxed)
}

unsafe fn set_next_relaxed(node: *const Node, level: usize, x: *mut Node) {
    (*tower_slot(node, level)).store(x, Ordering::Relaxed)
}

/// Ordered index with lock-free readers and a single external writer.
pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    /// Sentinel; its key is never read.
    head: *mut Node,
    /// Height of the tallest node currently in the list.
    max_height: AtomicUsize,
    /// Height generator. Writer-only state, like the rest of insertion.
    rnd: AtomicU32,
}

// Safety: readers only follow Acquire-loaded pointers into immutable arena
// spans; all mutation funnels through the externally serialized writer.
unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Creates an empty list whose nodes will be carved from `arena`.
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let head = Self::new_node_in(&arena, ptr::null(), MAX_HEIGHT);
        SkipList {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rnd: AtomicU32::new(0xdead_beef),
        }
    }

    /// Inserts `key` into the list.
    ///
    /// # Safety
    ///
    /// `key` must be a well-formed encoded key living at least as long as
    /// the list (arena memory), must compare unequal to every key already
    /// present, and the call must be serialized with every other `insert`.
    pub unsafe fn insert(&self, key: *const u8) {
        let mut prev = [ptr::null_mut::<Node>(); MAX_HEIGHT];
        let found = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            found.is_null() || self.cmp.compare(key, (*found).key) != KeyOrdering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = self.random_height();
        let max_height = self.max_height.load(Ordering::Relaxed);
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
            // Readers racing with this store either see the old height, or
            // the new height and a still-null head slot — both walk the
            // same list.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node_in(&self.arena, key, height);
        for level in 0..height {
            // The node's own pointer can be relaxed: it is published to
            // readers only by the Release store into its predecessor.
            set_next_relaxed(node, level, next_relaxed(prev[level], level));
            set_next(prev[level], level, node);
        }
    }

    /// Returns true iff a key equal to `key` is in the list.
    ///
    /// # Safety
    ///
    /// `key` must be a well-formed encoded key valid for the duration of
    /// the call.
    pub unsafe fn contains(&self, key: *const u8) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null() && self.cmp.compare(key, (*node).key) == KeyOrdering::Equal
    }

    /// Cursor positioned nowhere; call one of the seeks first.
    pub fn iter(&self) -> Iter<'_, C> {
        Iter {
            list: self,
            node: ptr::null(),
        }
    }

    fn new_node_in(arena: &Arena, key: *const u8, height: usize) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let size = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(size).as_ptr().cast::<Node>();
        unsafe {
            ptr::addr_of_mut!((*node).key).write(key);
            for level in 0..height {
                (tower_slot(node, level) as *mut AtomicPtr<Node>)
                    .write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    /// 1-in-`BRANCHING` chance of each additional level; xorshift32 keeps
    /// the generator self-contained and allocation-free.
    fn random_height(&self) -> usize {
        let mut x = self.rnd.load(Ordering::Relaxed);
        let mut height = 1;
        loop {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            if height >= MAX_HEIGHT || x % BRANCHING != 0 {
                break;
            }
            height += 1;
        }
        self.rnd.store(x, Ordering::Relaxed);
        height
    }

    /// True iff `key` sorts strictly after node `n` (null counts as +inf).
    unsafe fn key_is_after_node(&self, key: *const u8, n: *const Node) -> bool {
        !n.is_null() && self.cmp.compare((*n).key, key) == KeyOrdering::Less
    }

    /// First node at or after `key`, or null. When `prev` is supplied it
    /// receives the rightmost node before `key` on every level — the
    /// insertion splice.
    unsafe fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head as *const Node;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let nxt = next(node, level);
            if self.key_is_after_node(key, nxt) {
                node = nxt;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = node as *mut Node;
                }
                if level == 0 {
                    return nxt;
                }
                level -= 1;
            }
        }
    }

    /// Last node strictly before `key`, or the head sentinel.
    unsafe fn find_less_than(&self, key: *const u8) -> *const Node {
        let mut node = self.head as *const Node;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let nxt = next(node, level);
            if !nxt.is_null() && self.cmp.compare((*nxt).key, key) == KeyOrdering::Less {
                node = nxt;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list, or the head sentinel when empty.
    unsafe fn find_last(&self) -> *const Node {
        let mut node = self.head as *const Node;
        let mut level = self.max_height.load(Ordering::Relaxed) - 1;
        loop {
            let nxt = next(node, level);
            if !nxt.is_null() {
                node = nxt;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }
}

/// Cursor over the list in key order. Reads are lock-free; the cursor may
/// run concurrently with the single writer.
pub struct Iter<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *const Node,
}

impl<'a, C: KeyComparator> Iter<'a, C> {
    /// True iff the cursor is positioned at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The current entry's key pointer. Requires [`Iter::valid`].
    #[must_use]
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    /// Advances to the next entry. Requires [`Iter::valid`].
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { next(self.node, 0) };
    }

    /// Retreats to the previous entry (or invalidates at the front).
    /// Requires [`Iter::valid`].
    ///
    /// Implemented by searching from the top rather than storing back
    /// pointers in every node.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        unsafe {
            let node = self.list.find_less_than((*self.node).key);
            self.node = if node == self.list.head.cast_const() {
                ptr::null()
            } else {
                node
            };
        }
    }

    /// Positions at the first entry whose key is ≥ `target`.
    ///
    /// # Safety
    ///
    /// `target` must be a well-formed encoded key valid for the duration
    /// of the call.
    pub unsafe fn seek(&mut self, target: *const u8) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    /// Positions at the first entry (or invalidates if empty).
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { next(self.list.head, 0) };
    }

    /// Positions at the last entry (or invalidates if empty).
    pub fn seek_to_last(&mut self) {
        unsafe {
            let node = self.list.find_last();
            self.node = if node == self.list.head.cast_const() {
                ptr::null()
            } else {
                node
            };
        }
    }
}
