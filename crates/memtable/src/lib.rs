//! # Memtable — the ordered, multi-version in-memory table
//!
//! The memtable is the hot end of the write path: batches of mutations are
//! replayed into it, and every read consults it before touching persistent
//! storage. It wraps two pieces:
//!
//! - an [`Arena`](arena::Arena) that owns every byte of every entry, and
//! - a [`skiplist`] index over those entries, single-writer with lock-free
//!   readers.
//!
//! ## Entry layout
//!
//! Each `add` encodes one immutable entry into arena memory:
//!
//! ```text
//! entry        := varstring(internal_key) varstring(value)
//! internal_key := user_key u64_le((sequence << 8) | tag)
//! ```
//!
//! Deletions are entries with [`ValueType::Deletion`] and an empty value —
//! the memtable never removes anything; newer sequence numbers shadow
//! older ones, and a point lookup sees the newest version at or below its
//! snapshot sequence.
//!
//! ## Ownership and concurrency
//!
//! Multiple threads share a memtable through `Arc<MemTable>`; dropping the
//! last reference releases the table and its arena in one sweep. Readers
//! ([`MemTable::get`], [`MemTable::iter`]) never block and may run
//! concurrently with the single writer; calls to [`MemTable::add`] must be
//! serialized externally (the write path holds its own lock).

mod key;
pub mod skiplist;


use std::cmp::Ordering;
use std::sync::Arc;

use arena::Arena;
use encoding::{
    decode_fixed64, encode_fixed64, encode_varint32, put_varstring, varint32_length,
    MAX_VARINT32_BYTES,
};
use thiserror::Error;

use key::InternalKeyComparator;
pub use key::{
    pack_trailer, unpack_trailer, BytewiseComparator, Comparator, LookupKey, SequenceNumber,
    ValueType, MAX_SEQUENCE_NUMBER, TYPE_FOR_SEEK,
};
use skiplist::{KeyComparator, SkipList};

/// A point lookup resolved to a deletion entry: the key existed and was
/// deleted at or before the lookup sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("key not found")]
pub struct NotFound;

/// Decodes a varint32 starting at `p`, returning the value and the bytes
/// consumed. Reads only the bytes of the encoding itself, so it never
/// touches memory past the end of a well-formed entry.
///
/// # Safety
///
/// `p` must point at a valid varint32 encoding.
unsafe fn decode_varint32_raw(p: *const u8) -> (u32, usize) {
    let mut result = 0u32;
    let mut i = 0usize;
    loop {
        let byte = *p.add(i);
        result |= u32::from(byte & 0x7f) << (i * 7);
        i += 1;
        if byte & 0x80 == 0 {
            return (result, i);
        }
        debug_assert!(i < MAX_VARINT32_BYTES, "corrupt length prefix");
    }
}

/// Decodes the internal key of an encoded entry.
///
/// # Safety
///
/// `entry` must point at a well-formed entry written by [`MemTable::add`]
/// (or an equivalently encoded seek key).
unsafe fn entry_internal_key<'a>(entry: *const u8) -> &'a [u8] {
    let (len, consumed) = decode_varint32_raw(entry);
    std::slice::from_raw_parts(entry.add(consumed), len as usize)
}

/// Decodes the value of an encoded entry.
///
/// # Safety
///
/// Same contract as [`entry_internal_key`].
unsafe fn entry_value<'a>(entry: *const u8) -> &'a [u8] {
    let ikey = entry_internal_key(entry);
    let value_start = ikey.as_ptr().add(ikey.len());
    let (len, consumed) = decode_varint32_raw(value_start);
    std::slice::from_raw_parts(value_start.add(consumed), len as usize)
}

/// Orders encoded entries by their internal keys.
#[derive(Clone)]
struct EntryComparator<C> {
    inner: InternalKeyComparator<C>,
}

impl<C: Comparator> KeyComparator for EntryComparator<C> {
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> Ordering {
        self.inner
            .compare(entry_internal_key(a), entry_internal_key(b))
    }
}

/// Ordered, multi-version in-memory table. See the module docs.
pub struct MemTable<C: Comparator = BytewiseComparator> {
    arena: Arc<Arena>,
    table: SkipList<EntryComparator<C>>,
    user_cmp: C,
}

impl MemTable<BytewiseComparator> {
    /// A memtable ordered by plain byte comparison of user keys.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(BytewiseComparator)
    }
}

impl Default for MemTable<BytewiseComparator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Comparator> MemTable<C> {
    /// A memtable ordered by `cmp` over user keys.
    pub fn with_comparator(cmp: C) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            EntryComparator {
                inner: InternalKeyComparator::new(cmp.clone()),
            },
            Arc::clone(&arena),
        );
        MemTable {
            arena,
            table,
            user_cmp: cmp,
        }
    }

    /// Bytes held by the table's arena. Safe to call while a writer is
    /// adding entries.
    #[must_use]
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Inserts an entry mapping `user_key` to `value` at `seq` with the
    /// given type. For deletions the value is conventionally empty.
    ///
    /// Calls must be externally serialized; concurrent readers are fine.
    /// The `(user_key, seq)` pair must not already be present — the write
    /// path's strictly increasing sequence numbers guarantee that.
    pub fn add(&self, seq: SequenceNumber, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint32_length(internal_key_len as u32)
            + internal_key_len
            + varint32_length(value.len() as u32)
            + value.len();

        let ptr = self.arena.allocate(encoded_len);
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), encoded_len) };

        let mut at = encode_varint32(buf, internal_key_len as u32);
        buf[at..at + user_key.len()].copy_from_slice(user_key);
        at += user_key.len();
        encode_fixed64(&mut buf[at..at + 8], pack_trailer(seq, value_type));
        at += 8;
        at += encode_varint32(&mut buf[at..], value.len() as u32);
        buf[at..at + value.len()].copy_from_slice(value);
        debug_assert_eq!(at + value.len(), encoded_len);

        // The entry bytes are complete before the insert publishes them.
        unsafe { self.table.insert(ptr.as_ptr()) };
    }

    /// Point lookup for the newest version at or before the lookup key's
    /// sequence.
    ///
    /// - `Some(Ok(value))` — a live value is visible.
    /// - `Some(Err(NotFound))` — the newest visible version is a deletion;
    ///   older storage layers must not be consulted.
    /// - `None` — the memtable knows nothing about this key.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Vec<u8>, NotFound>> {
        let mut iter = self.table.iter();
        // The seek target encodes the query sequence, so the first entry
        // at or after it is already the newest visible version: no
        // post-filtering on sequence numbers.
        unsafe { iter.seek(key.memtable_key().as_ptr()) };
        if !iter.valid() {
            return None;
        }

        let ikey = unsafe { entry_internal_key(iter.key()) };
        let user_key = &ikey[..ikey.len() - 8];
        if self.user_cmp.compare(user_key, key.user_key()) != Ordering::Equal {
            return None;
        }

        let (_, tag) = unpack_trailer(decode_fixed64(&ikey[ikey.len() - 8..]));
        match ValueType::from_tag(tag) {
            Some(ValueType::Value) => {
                let value = unsafe { entry_value(iter.key()) };
                Some(Ok(value.to_vec()))
            }
            Some(ValueType::Deletion) => Some(Err(NotFound)),
            None => None,
        }
    }

    /// Cursor over the table in internal-key order.
    pub fn iter(&self) -> MemTableIter<'_, C> {
        MemTableIter {
            iter: self.table.iter(),
            scratch: Vec::new(),
        }
    }
}

impl<C: Comparator> std::fmt::Debug for MemTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("memory_usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Cursor over a memtable's entries in internal-key order.
///
/// Exposes decoded views of the current entry: [`MemTableIter::key`] is
/// the internal key (user key + trailer), [`MemTableIter::value`] the
/// value bytes. The cursor may run concurrently with the single writer.
pub struct MemTableIter<'a, C: Comparator> {
    iter: skiplist::Iter<'a, EntryComparator<C>>,
    /// Seek targets are re-encoded with a length prefix to match the
    /// entry framing; the buffer is reused across seeks.
    scratch: Vec<u8>,
}

impl<'a, C: Comparator> MemTableIter<'a, C> {
    /// True iff the cursor is positioned at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Positions at the first entry with internal key ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        put_varstring(&mut self.scratch, target);
        unsafe { self.iter.seek(self.scratch.as_ptr()) };
    }

    /// Positions at the first entry.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Positions at the last entry.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Advances the cursor. Requires [`MemTableIter::valid`].
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Retreats the cursor. Requires [`MemTableIter::valid`].
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// Internal key of the current entry. Requires [`MemTableIter::valid`].
    #[must_use]
    pub fn key(&self) -> &'a [u8] {
        unsafe { entry_internal_key(self.iter.key()) }
    }

    /// Value bytes of the current entry. Requires [`MemTableIter::valid`].
    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        unsafe { entry_value(self.iter.key()) }
    }
}
