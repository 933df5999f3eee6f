//! # Batch — the atomic unit of mutation
//!
//! A [`WriteBatch`] is a self-describing byte string holding a sequence of
//! `put`/`delete` records. It is the canonical unit the write path works
//! in: the database layer stages mutations into a batch, stamps it with a
//! starting sequence number, appends the bytes to the log for durability,
//! and then replays the same bytes into the memtable. Because the encoded
//! form is the source of truth, log replay after a crash and live
//! application to the memtable are literally the same code path.
//!
//! ## Binary format
//!
//! ```text
//! batch     := seq: u64 LE | count: u32 LE | record*
//! record    := tag: u8 | varstring(key) [| varstring(value) if tag = 1]
//! varstring := varint32(len) | bytes[len]
//! tag       := 1 (put) | 0 (delete)
//! ```
//!
//! The header is exactly [`HEADER_SIZE`] bytes; `count` must match the
//! number of records or replay fails with [`BatchError::WrongCount`].
//!
//! ## Replay
//!
//! [`WriteBatch::iterate`] walks the records and dispatches each to a
//! [`Handler`]. The batch does not interpret values and knows nothing
//! about its consumers; [`apply_to_memtable`] is the one adapter this
//! crate ships, assigning consecutive sequence numbers starting from the
//! batch header.
//!
//! ## Example
//!
//! ```rust
//! use batch::{apply_to_memtable, WriteBatch};
//! use memtable::{LookupKey, MemTable};
//!
//! let mut batch = WriteBatch::new();
//! batch.put(b"name", b"alice");
//! batch.delete(b"stale");
//! batch.set_sequence(1);
//!
//! let mem = MemTable::new();
//! apply_to_memtable(&batch, &mem).unwrap();
//! assert!(mem.get(&LookupKey::new(b"name", 10)).is_some());
//! ```
//!
//! ## Concurrency
//!
//! Shared-read / exclusive-write: every `&self` method is safe to call
//! concurrently; mutation requires the usual exclusive borrow.

use encoding::{
    decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64, get_varstring, put_varstring,
};
use memtable::{Comparator, MemTable, SequenceNumber, ValueType};
use thiserror::Error;
use tracing::warn;

#[cfg(test)]
mod tests;

/// Header size: an 8-byte sequence number followed by a 4-byte count.
pub const HEADER_SIZE: usize = 12;

/// Corruption detected while decoding a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The buffer is smaller than the 12-byte header.
    #[error("malformed write batch (too small)")]
    TooSmall,
    /// A put record's key or value varstring was truncated.
    #[error("bad write batch put record")]
    BadPut,
    /// A delete record's key varstring was truncated.
    #[error("bad write batch delete record")]
    BadDelete,
    /// A record tag byte was neither put nor delete.
    #[error("unknown write batch tag {0}")]
    UnknownTag(u8),
    /// The header count disagrees with the number of parsed records.
    #[error("write batch has wrong count (header {header}, found {found})")]
    WrongCount { header: u32, found: u32 },
}

/// Consumer capability for [`WriteBatch::iterate`].
///
/// Implementations choose their own payload target — the memtable, a
/// recording probe in tests, a secondary index. The batch never interprets
/// keys or values.
pub trait Handler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// An ordered sequence of mutations, encoded and ready for the log.
#[derive(Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    /// An empty batch: a bare header, zero records.
    #[must_use]
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0u8; HEADER_SIZE],
        }
    }

    /// Drops every record and zeroes the header.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Appends a `put` record and bumps the count.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_varstring(&mut self.rep, key);
        put_varstring(&mut self.rep, value);
    }

    /// Appends a `delete` record and bumps the count.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_varstring(&mut self.rep, key);
    }

    /// Size of the encoded batch in bytes.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Concatenates `other`'s records onto this batch and adds the counts.
    /// `other`'s header sequence is ignored.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// Walks the records in order, dispatching each to `handler`.
    ///
    /// # Errors
    ///
    /// Any [`BatchError`] aborts the walk at the offending record; effects
    /// already dispatched to the handler stay dispatched, and the caller
    /// is expected to discard the partially mutated consumer.
    pub fn iterate<H: Handler>(&self, handler: &mut H) -> Result<(), BatchError> {
        let result = self.iterate_inner(handler);
        if let Err(e) = &result {
            warn!(error = %e, "write batch replay aborted");
        }
        result
    }

    fn iterate_inner<H: Handler>(&self, handler: &mut H) -> Result<(), BatchError> {
        if self.rep.len() < HEADER_SIZE {
            return Err(BatchError::TooSmall);
        }
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found: u32 = 0;
        while let Some((&tag, rest)) = input.split_first() {
            input = rest;
            found += 1;
            match ValueType::from_tag(tag) {
                Some(ValueType::Value) => {
                    let key = get_varstring(&mut input).ok_or(BatchError::BadPut)?;
                    let value = get_varstring(&mut input).ok_or(BatchError::BadPut)?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_varstring(&mut input).ok_or(BatchError::BadDelete)?;
                    handler.delete(key);
                }
                None => return Err(BatchError::UnknownTag(tag)),
            }
        }
        if found != self.count() {
            return Err(BatchError::WrongCount {
                header: self.count(),
                found,
            });
        }
        Ok(())
    }

    // ---- Header accessors, reserved for the write path ----

    /// The starting sequence number stamped by the write path.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[..8])
    }

    /// Stamps the starting sequence number.
    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        encode_fixed64(&mut self.rep[..8], seq);
    }

    /// Number of records the header claims.
    #[must_use]
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    /// Overwrites the header count.
    pub fn set_count(&mut self, n: u32) {
        encode_fixed32(&mut self.rep[8..12], n);
    }

    /// The raw encoded bytes, suitable for appending to a log.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replaces the batch with bytes read back from a log.
    ///
    /// # Errors
    ///
    /// [`BatchError::TooSmall`] if `contents` cannot even hold the header.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<(), BatchError> {
        if contents.len() < HEADER_SIZE {
            return Err(BatchError::TooSmall);
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        Ok(())
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("sequence", &self.sequence())
            .field("count", &self.count())
            .field("bytes", &self.rep.len())
            .finish()
    }
}

/// [`Handler`] that inserts records into a memtable, assigning each the
/// next sequence number after its predecessor.
struct MemTableInserter<'a, C: Comparator> {
    sequence: SequenceNumber,
    mem: &'a MemTable<C>,
}

impl<C: Comparator> Handler for MemTableInserter<'_, C> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

/// Replays `batch` into `mem`.
///
/// Records receive sequence numbers `S, S+1, …` where `S` is the batch's
/// header sequence. The write path hands out snapshot sequences only at
/// batch boundaries, so readers observe either the whole batch or none of
/// it. The caller serializes this with every other memtable writer.
///
/// # Errors
///
/// Propagates corruption from [`WriteBatch::iterate`]; on error the
/// memtable has absorbed a prefix of the batch and should be discarded by
/// the caller (replay failures surface during recovery, where the table is
/// rebuilt from scratch anyway).
pub fn apply_to_memtable<C: Comparator>(
    batch: &WriteBatch,
    mem: &MemTable<C>,
) -> Result<(), BatchError> {
    let mut inserter = MemTableInserter {
        sequence: batch.sequence(),
        mem,
    };
    batch.iterate(&mut inserter)
}
