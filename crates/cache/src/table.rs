//! Open-chained hash table over cache handles.
//!
//! A power-of-two array of buckets, each the head of a singly linked list
//! threaded through the handles' `next_hash` field. Rolling our own keeps
//! the table allocation-free on the lookup path and lets `insert` replace
//! an equal-keyed handle in place — the shard needs the displaced handle
//! back so it can finish erasing it.
//!
//! The unifying trick is [`HandleTable::find_pointer`]: it returns a
//! pointer to *the link that points at the match* (a bucket slot or a
//! predecessor's `next_hash`), so head and interior updates are the same
//! single store.

use tracing::debug;

use crate::shard::LruHandle;

pub(crate) struct HandleTable<V> {
    /// Bucket count; always a power of two, so indexing is a mask.
    length: u32,
    /// Live handles in the table.
    elems: u32,
    list: Vec<*mut LruHandle<V>>,
}

impl<V> HandleTable<V> {
    pub(crate) fn new() -> Self {
        let mut table = HandleTable {
            length: 0,
            elems: 0,
            list: Vec::new(),
        };
        table.resize();
        table
    }

    /// The handle matching `(key, hash)`, or null.
    pub(crate) fn lookup(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<V> {
        unsafe { *self.find_pointer(key, hash) }
    }

    /// Links `handle` into its bucket. A handle with an equal key is
    /// unlinked and returned (the caller owns finishing its erase); the
    /// element count is unchanged in that case.
    pub(crate) fn insert(&mut self, handle: *mut LruHandle<V>) -> *mut LruHandle<V> {
        unsafe {
            let key: &[u8] = &(*handle).key;
            let slot = self.find_pointer(key, (*handle).hash);
            let old = *slot;
            (*handle).next_hash = if old.is_null() {
                std::ptr::null_mut()
            } else {
                (*old).next_hash
            };
            *slot = handle;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.length {
                    // Handles are heavyweight; aim for chains of length ≤ 1.
                    self.resize();
                }
            }
            old
        }
    }

    /// Unlinks and returns the handle matching `(key, hash)`, or null.
    pub(crate) fn remove(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<V> {
        unsafe {
            let slot = self.find_pointer(key, hash);
            let handle = *slot;
            if !handle.is_null() {
                *slot = (*handle).next_hash;
                self.elems -= 1;
            }
            handle
        }
    }

    /// Pointer to the link pointing at the handle matching `(key, hash)`,
    /// or to the null link at the end of the bucket's chain.
    fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut LruHandle<V> {
        let bucket = (hash & (self.length - 1)) as usize;
        let mut link: *mut *mut LruHandle<V> = &mut self.list[bucket];
        unsafe {
            while !(*link).is_null()
                && ((**link).hash != hash || *(**link).key != *key)
            {
                link = std::ptr::addr_of_mut!((**link).next_hash);
            }
        }
        link
    }

    /// Doubles the bucket array until the load factor drops to ≤ 1 and
    /// rehashes every handle, pushing each onto its new bucket's head.
    fn resize(&mut self) {
        let mut new_length: u32 = 4;
        while new_length < self.elems {
            new_length *= 2;
        }
        let mut new_list: Vec<*mut LruHandle<V>> =
            vec![std::ptr::null_mut(); new_length as usize];

        let mut count = 0u32;
        for bucket in &self.list {
            let mut handle = *bucket;
            while !handle.is_null() {
                unsafe {
                    let next = (*handle).next_hash;
                    let slot = &mut new_list[((*handle).hash & (new_length - 1)) as usize];
                    (*handle).next_hash = *slot;
                    *slot = handle;
                    handle = next;
                }
                count += 1;
            }
        }
        debug_assert_eq!(self.elems, count);

        if !self.list.is_empty() {
            debug!(buckets = new_length, elems = self.elems, "handle table resized");
        }
        self.list = new_list;
        self.length = new_length;
    }
}
