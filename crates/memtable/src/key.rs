//! Internal-key format: user keys tagged with a sequence number and a
//! value-type byte.
//!
//! Every entry the memtable stores is keyed by an **internal key**:
//!
//! ```text
//! internal_key := user_key trailer
//! trailer      := u64_le((sequence << 8) | tag)
//! ```
//!
//! Internal keys order by user key ascending (per the user [`Comparator`])
//! and, for equal user keys, by trailer **descending** — the newest version
//! of a key sorts first. Deletions are ordinary entries with
//! [`ValueType::Deletion`], so a point lookup that lands on a tombstone
//! knows the key is dead without consulting older versions.

use std::cmp::Ordering;

use encoding::{decode_fixed64, put_fixed64, put_varint32};

/// Monotonically increasing version number assigned by the write path.
pub type SequenceNumber = u64;

/// Sequence numbers share their `u64` with the type tag, leaving 56 bits.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Tag byte distinguishing live values from tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// The entry is a deletion marker; the value is empty.
    Deletion = 0,
    /// The entry carries a live value.
    Value = 1,
}

impl ValueType {
    /// Decodes a trailer tag byte. Returns `None` for tags this version
    /// does not know.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<ValueType> {
        match tag {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// Tag used when constructing seek targets.
///
/// `Value` is the numerically largest tag, so for a fixed `(user_key, seq)`
/// a seek key with this tag sorts before (at or ahead of) every real entry
/// with the same user key and a sequence ≤ `seq` — exactly the newest
/// visible version.
pub const TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Packs a sequence number and type tag into the 8-byte trailer value.
#[must_use]
pub fn pack_trailer(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// Splits a trailer into `(sequence, raw tag byte)`.
#[must_use]
pub fn unpack_trailer(trailer: u64) -> (SequenceNumber, u8) {
    (trailer >> 8, trailer as u8)
}

/// A total order over user keys.
///
/// The persistent layers above this crate supply the comparator; the
/// memtable only requires that it is a total order and consistent across
/// the process.
pub trait Comparator: Clone + Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// The default order: plain `memcmp` over the key bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Orders encoded internal keys: user key ascending, trailer descending.
#[derive(Clone, Debug)]
pub(crate) struct InternalKeyComparator<C> {
    user: C,
}

impl<C: Comparator> InternalKeyComparator<C> {
    pub(crate) fn new(user: C) -> Self {
        InternalKeyComparator { user }
    }

    pub(crate) fn user_comparator(&self) -> &C {
        &self.user
    }

    /// Both arguments must be well-formed internal keys (≥ 8 bytes).
    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert!(a.len() >= 8 && b.len() >= 8);
        let (a_user, a_trailer) = a.split_at(a.len() - 8);
        let (b_user, b_trailer) = b.split_at(b.len() - 8);
        match self.user.compare(a_user, b_user) {
            Ordering::Equal => {
                // Descending by trailer: bigger sequence sorts first.
                decode_fixed64(b_trailer).cmp(&decode_fixed64(a_trailer))
            }
            ord => ord,
        }
    }
}

/// A probe key targeting "the newest version of `user_key` at or before
/// `seq`".
///
/// The buffer holds the memtable-entry key encoding — a varint32 length
/// prefix followed by the internal key — so it can be handed directly to
/// the skiplist's seek, while [`LookupKey::internal_key`] and
/// [`LookupKey::user_key`] expose the inner views.
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    #[must_use]
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> LookupKey {
        let mut data = Vec::with_capacity(user_key.len() + 13);
        put_varint32(&mut data, (user_key.len() + 8) as u32);
        let key_start = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_trailer(seq, TYPE_FOR_SEEK));
        LookupKey { data, key_start }
    }

    /// The full length-prefixed encoding, as stored in memtable entries.
    #[must_use]
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key: user key plus trailer.
    #[must_use]
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    /// The user key alone.
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - 8]
    }
}

impl std::fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (seq, tag) = unpack_trailer(decode_fixed64(
            &self.data[self.data.len() - 8..],
        ));
        f.debug_struct("LookupKey")
            .field("user_key", &self.user_key())
            .field("seq", &seq)
            .field("tag", &tag)
            .finish()
    }
}
