//! A single LRU shard: reference-counted handles, two-list tracking, and
//! charge-based capacity accounting, all under one mutex.
//!
//! ## Reference tracking
//!
//! Every live handle has `refs ≥ 1`. While an entry is cached
//! (`in_cache`), the cache itself owns one reference, and the handle sits
//! on exactly one of two sentinel-headed circular lists:
//!
//! - **`in_use`** — entries some client also holds (`refs ≥ 2`), in no
//!   particular order;
//! - **`lru`** — entries only the cache holds (`refs == 1`), oldest at
//!   `lru.next`, newest at `lru.prev`. Only these are evictable.
//!
//! Handles move between the lists inside `ref_handle`/`unref`, and leave
//! both in `finish_erase` — the single uncache path used by eviction,
//! [`LruShard::erase`], [`LruShard::prune`], and duplicate-key inserts.
//! An erased-but-still-referenced handle sits on neither list and dies
//! when its last external reference is released.
//!
//! The per-entry `charge` is the caller's cost estimate (typically byte
//! size); `usage` is the sum of charges of cached entries, and inserts
//! evict from the cold end of `lru` until `usage ≤ capacity` or nothing
//! evictable remains.

use std::fmt;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::trace;

use crate::table::HandleTable;

/// Per-entry finalizer, run exactly once when the last reference drops.
pub type Deleter<V> = Box<dyn FnOnce(&[u8], V) + Send>;

/// Cache entry. Heap-allocated; linked into the hash table through
/// `next_hash` and into one of the shard's circular lists through
/// `next`/`prev`. Freed by `unref` when the count hits zero.
pub(crate) struct LruHandle<V> {
    /// `None` only on list sentinels and after death.
    pub(crate) value: Option<V>,
    pub(crate) deleter: Option<Deleter<V>>,
    pub(crate) next_hash: *mut LruHandle<V>,
    pub(crate) next: *mut LruHandle<V>,
    pub(crate) prev: *mut LruHandle<V>,
    pub(crate) charge: usize,
    pub(crate) key: Box<[u8]>,
    /// Kept alongside the key for cheap comparisons and shard routing.
    pub(crate) hash: u32,
    /// Whether the cache holds a reference to this entry.
    pub(crate) in_cache: bool,
    /// References, including the cache's own when `in_cache`.
    pub(crate) refs: u32,
}

impl<V> LruHandle<V> {
    fn sentinel() -> Box<Self> {
        let mut node = Box::new(LruHandle {
            value: None,
            deleter: None,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge: 0,
            key: Box::default(),
            hash: 0,
            in_cache: false,
            refs: 0,
        });
        // Empty circular list: the sentinel points at itself.
        let p: *mut LruHandle<V> = &mut *node;
        node.next = p;
        node.prev = p;
        node
    }
}

/// Unlinks `e` from whichever circular list holds it.
unsafe fn list_remove<V>(e: *mut LruHandle<V>) {
    (*(*e).next).prev = (*e).prev;
    (*(*e).prev).next = (*e).next;
}

/// Appends `e` as the newest entry of `list` (just before the sentinel).
unsafe fn list_append<V>(list: *mut LruHandle<V>, e: *mut LruHandle<V>) {
    (*e).next = list;
    (*e).prev = (*list).prev;
    (*(*e).prev).next = e;
    (*(*e).next).prev = e;
}

/// An outstanding reference to a cache entry.
///
/// Move-only: passing it back to `release` is the only way to drop the
/// reference, so releasing twice is unrepresentable. Dropping a `Handle`
/// without releasing it leaks the entry (it can never be evicted down to
/// zero references).
pub struct Handle<V> {
    pub(crate) ptr: NonNull<LruHandle<V>>,
}

// Safety: the pointee is only mutated under its shard's mutex; the handle
// itself just carries the pointer and a claim on one reference.
unsafe impl<V: Send> Send for Handle<V> {}
unsafe impl<V: Send + Sync> Sync for Handle<V> {}

impl<V> fmt::Debug for Handle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

struct ShardInner<V> {
    /// Sum of charges of in-cache entries.
    usage: usize,
    /// Boxed so the sentinels keep stable addresses.
    lru: Box<LruHandle<V>>,
    in_use: Box<LruHandle<V>>,
    table: HandleTable<V>,
}

/// One shard of the cache. See the module docs for the invariants.
pub(crate) struct LruShard<V> {
    capacity: usize,
    inner: Mutex<ShardInner<V>>,
}

// Safety: all pointer surgery happens under `inner`'s mutex; values and
// deleters may cross threads, hence V: Send.
unsafe impl<V: Send> Send for LruShard<V> {}
unsafe impl<V: Send> Sync for LruShard<V> {}

impl<V: Send> LruShard<V> {
    /// A shard holding at most `capacity` total charge. Zero disables
    /// caching entirely: inserts hand back working handles but retain
    /// nothing.
    pub(crate) fn new(capacity: usize) -> Self {
        LruShard {
            capacity,
            inner: Mutex::new(ShardInner {
                usage: 0,
                lru: LruHandle::sentinel(),
                in_use: LruHandle::sentinel(),
                table: HandleTable::new(),
            }),
        }
    }

    /// Inserts an entry and returns a handle holding the caller's
    /// reference. An existing entry with an equal key is displaced (its
    /// deleter runs once its outstanding references drain). Evicts from
    /// the cold end until `usage ≤ capacity` or only pinned entries
    /// remain.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        hash: u32,
        value: V,
        charge: usize,
        deleter: Option<Deleter<V>>,
    ) -> Handle<V> {
        let mut inner = self.inner.lock();

        let handle = Box::into_raw(Box::new(LruHandle {
            value: Some(value),
            deleter,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge,
            key: key.to_vec().into_boxed_slice(),
            hash,
            in_cache: false,
            refs: 1, // the returned handle
        }));

        unsafe {
            if self.capacity > 0 {
                (*handle).refs += 1; // the cache's reference
                (*handle).in_cache = true;
                list_append(inner.in_use_ptr(), handle);
                inner.usage += charge;
                let displaced = inner.table.insert(handle);
                inner.finish_erase(displaced);
            }

            let lru = inner.lru_ptr();
            while inner.usage > self.capacity && (*lru).next != lru {
                let oldest = (*lru).next;
                debug_assert_eq!((*oldest).refs, 1);
                trace!(charge = (*oldest).charge, "evicting cold cache entry");
                let victim_key: &[u8] = &(*oldest).key;
                let removed = inner.table.remove(victim_key, (*oldest).hash);
                debug_assert_eq!(removed, oldest);
                inner.finish_erase(removed);
            }

            Handle {
                ptr: NonNull::new_unchecked(handle),
            }
        }
    }

    /// Looks up `(key, hash)`, taking a reference on a hit. A hit on an
    /// `lru` entry moves it to `in_use`.
    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<Handle<V>> {
        let mut inner = self.inner.lock();
        let handle = inner.table.lookup(key, hash);
        if handle.is_null() {
            return None;
        }
        unsafe {
            inner.ref_handle(handle);
            Some(Handle {
                ptr: NonNull::new_unchecked(handle),
            })
        }
    }

    /// Drops the reference `handle` holds. The transition to one
    /// remaining (cache-only) reference moves the entry back to `lru`;
    /// the transition to zero runs the deleter and frees the entry.
    pub(crate) fn release(&self, handle: Handle<V>) {
        let mut inner = self.inner.lock();
        unsafe { inner.unref(handle.ptr.as_ptr()) };
    }

    /// Removes `(key, hash)` from the cache. Outstanding handles keep the
    /// entry alive until they are released.
    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let mut inner = self.inner.lock();
        unsafe {
            let removed = inner.table.remove(key, hash);
            inner.finish_erase(removed);
        }
    }

    /// Evicts every entry not currently referenced by a client.
    pub(crate) fn prune(&self) {
        let mut inner = self.inner.lock();
        unsafe {
            let lru = inner.lru_ptr();
            while (*lru).next != lru {
                let oldest = (*lru).next;
                debug_assert_eq!((*oldest).refs, 1);
                let key: &[u8] = &(*oldest).key;
                let removed = inner.table.remove(key, (*oldest).hash);
                debug_assert_eq!(removed, oldest);
                inner.finish_erase(removed);
            }
        }
    }

    /// Sum of charges of cached entries.
    pub(crate) fn total_charge(&self) -> usize {
        self.inner.lock().usage
    }
}

impl<V> ShardInner<V> {
    fn lru_ptr(&mut self) -> *mut LruHandle<V> {
        &mut *self.lru
    }

    fn in_use_ptr(&mut self) -> *mut LruHandle<V> {
        &mut *self.in_use
    }

    /// Adds a reference; promotes an `lru` resident to `in_use`.
    unsafe fn ref_handle(&mut self, e: *mut LruHandle<V>) {
        if (*e).refs == 1 && (*e).in_cache {
            list_remove(e);
            list_append(self.in_use_ptr(), e);
        }
        (*e).refs += 1;
    }

    /// Drops a reference; demotes to `lru` on the second-to-last drop of a
    /// cached entry, frees (running the deleter) on the last.
    unsafe fn unref(&mut self, e: *mut LruHandle<V>) {
        assert!((*e).refs > 0, "cache handle released more times than referenced");
        (*e).refs -= 1;
        if (*e).refs == 0 {
            debug_assert!(!(*e).in_cache);
            let mut dead = Box::from_raw(e);
            if let Some(value) = dead.value.take() {
                if let Some(deleter) = dead.deleter.take() {
                    deleter(&dead.key, value);
                }
            }
        } else if (*e).in_cache && (*e).refs == 1 {
            // Only the cache holds it now: it becomes evictable.
            list_remove(e);
            list_append(self.lru_ptr(), e);
        }
    }

    /// Completes removal of a handle already unlinked from the hash
    /// table: takes it off its list, drops the cache's reference, and
    /// un-counts its charge. Null (no such entry) is a no-op.
    unsafe fn finish_erase(&mut self, e: *mut LruHandle<V>) -> bool {
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
}

impl<V> Drop for ShardInner<V> {
    fn drop(&mut self) {
        unsafe {
            let in_use: *mut LruHandle<V> = &mut *self.in_use;
            assert!(
                (*in_use).next == in_use,
                "cache dropped with outstanding in-use handles"
            );

            // Every lru resident holds exactly the cache's reference;
            // drop it, which frees the entry and runs its deleter.
            let lru: *mut LruHandle<V> = &mut *self.lru;
            let mut e = (*lru).next;
            while e != lru {
                let next = (*e).next;
                debug_assert!((*e).in_cache);
                assert_eq!((*e).refs, 1, "lru entry with external references");
                let mut dead = Box::from_raw(e);
                if let Some(value) = dead.value.take() {
                    if let Some(deleter) = dead.deleter.take() {
                        deleter(&dead.key, value);
                    }
                }
                e = next;
            }
        }
    }
}
