use super::*;
use anyhow::Result;
use memtable::{LookupKey, NotFound};

// -------------------- Helpers --------------------

#[derive(Debug, PartialEq, Eq)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(Default)]
struct Recorder {
    ops: Vec<Op>,
}

impl Handler for Recorder {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(Op::Delete(key.to_vec()));
    }
}

fn record(batch: &WriteBatch) -> Result<Vec<Op>, BatchError> {
    let mut rec = Recorder::default();
    batch.iterate(&mut rec)?;
    Ok(rec.ops)
}

/// Builds batch bytes by hand: header {seq, count} followed by raw record
/// bytes.
fn raw_batch(seq: u64, count: u32, records: &[u8]) -> WriteBatch {
    let mut bytes = Vec::new();
    encoding::put_fixed64(&mut bytes, seq);
    encoding::put_fixed32(&mut bytes, count);
    bytes.extend_from_slice(records);

    let mut batch = WriteBatch::new();
    batch.set_contents(&bytes).unwrap();
    batch
}

// -------------------- Construction --------------------

#[test]
fn empty_batch() {
    let batch = WriteBatch::new();
    assert_eq!(batch.count(), 0);
    assert_eq!(batch.sequence(), 0);
    assert_eq!(batch.approximate_size(), HEADER_SIZE);
    assert_eq!(record(&batch).unwrap(), vec![]);
}

#[test]
fn put_and_delete_roundtrip() {
    let mut batch = WriteBatch::new();
    batch.put(b"k1", b"v1");
    batch.delete(b"k2");
    batch.put(b"k3", b"v3");

    assert_eq!(batch.count(), 3);
    assert_eq!(
        record(&batch).unwrap(),
        vec![
            Op::Put(b"k1".to_vec(), b"v1".to_vec()),
            Op::Delete(b"k2".to_vec()),
            Op::Put(b"k3".to_vec(), b"v3".to_vec()),
        ]
    );
}

#[test]
fn empty_keys_and_values_are_preserved() {
    let mut batch = WriteBatch::new();
    batch.put(b"", b"");
    batch.delete(b"");

    assert_eq!(
        record(&batch).unwrap(),
        vec![Op::Put(vec![], vec![]), Op::Delete(vec![])]
    );
}

#[test]
fn large_records_use_multibyte_varints() {
    let key = vec![b'k'; 300];
    let value = vec![b'v'; 70_000];
    let mut batch = WriteBatch::new();
    batch.put(&key, &value);

    assert_eq!(
        record(&batch).unwrap(),
        vec![Op::Put(key.clone(), value.clone())]
    );
    // tag + 2-byte key prefix + key + 3-byte value prefix + value
    assert_eq!(
        batch.approximate_size(),
        HEADER_SIZE + 1 + 2 + key.len() + 3 + value.len()
    );
}

#[test]
fn clear_resets_to_bare_header() {
    let mut batch = WriteBatch::new();
    batch.set_sequence(42);
    batch.put(b"k", b"v");
    batch.clear();

    assert_eq!(batch.count(), 0);
    assert_eq!(batch.sequence(), 0);
    assert_eq!(batch.approximate_size(), HEADER_SIZE);
}

// -------------------- Header accessors --------------------

#[test]
fn sequence_and_count_roundtrip_through_header() {
    let mut batch = WriteBatch::new();
    batch.set_sequence(0x0011_2233_4455_6677);
    batch.set_count(9);

    assert_eq!(batch.sequence(), 0x0011_2233_4455_6677);
    assert_eq!(batch.count(), 9);

    // The header lives in the first 12 bytes of the encoding.
    assert_eq!(encoding::decode_fixed64(batch.contents()), 0x0011_2233_4455_6677);
    assert_eq!(encoding::decode_fixed32(&batch.contents()[8..]), 9);
}

#[test]
fn set_contents_replaces_buffer() {
    let mut src = WriteBatch::new();
    src.set_sequence(5);
    src.put(b"a", b"1");

    let mut dst = WriteBatch::new();
    dst.put(b"junk", b"junk");
    dst.set_contents(src.contents()).unwrap();

    assert_eq!(dst, src);
    assert_eq!(record(&dst).unwrap(), vec![Op::Put(b"a".to_vec(), b"1".to_vec())]);
}

#[test]
fn set_contents_rejects_short_buffer() {
    let mut batch = WriteBatch::new();
    assert_eq!(
        batch.set_contents(&[0u8; HEADER_SIZE - 1]),
        Err(BatchError::TooSmall)
    );
}

// -------------------- Append --------------------

#[test]
fn append_concatenates_records_and_counts() {
    let mut b1 = WriteBatch::new();
    b1.set_sequence(200);
    b1.put(b"a", b"va");
    b1.delete(b"b");

    let mut b2 = WriteBatch::new();
    b2.set_sequence(999); // ignored by append
    b2.put(b"c", b"vc");

    b1.append(&b2);
    assert_eq!(b1.count(), 3);
    assert_eq!(b1.sequence(), 200);
    assert_eq!(
        record(&b1).unwrap(),
        vec![
            Op::Put(b"a".to_vec(), b"va".to_vec()),
            Op::Delete(b"b".to_vec()),
            Op::Put(b"c".to_vec(), b"vc".to_vec()),
        ]
    );
}

#[test]
fn append_empty_batches() {
    let mut b1 = WriteBatch::new();
    let b2 = WriteBatch::new();
    b1.append(&b2);
    assert_eq!(b1.count(), 0);
    assert_eq!(record(&b1).unwrap(), vec![]);

    let mut b3 = WriteBatch::new();
    b3.put(b"k", b"v");
    b1.append(&b3);
    b1.append(&WriteBatch::new());
    assert_eq!(b1.count(), 1);
    assert_eq!(record(&b1).unwrap(), vec![Op::Put(b"k".to_vec(), b"v".to_vec())]);
}

// -------------------- Corruption --------------------

#[test]
fn one_record_but_count_two_is_wrong_count() {
    // A single valid put record under a header claiming two.
    let mut records = Vec::new();
    records.push(ValueType::Value as u8);
    encoding::put_varstring(&mut records, b"a");
    encoding::put_varstring(&mut records, b"1");

    let batch = raw_batch(0, 2, &records);
    assert_eq!(
        record(&batch),
        Err(BatchError::WrongCount { header: 2, found: 1 })
    );
}

#[test]
fn extra_record_is_wrong_count() {
    let mut records = Vec::new();
    for _ in 0..2 {
        records.push(ValueType::Deletion as u8);
        encoding::put_varstring(&mut records, b"k");
    }
    let batch = raw_batch(0, 1, &records);
    assert_eq!(
        record(&batch),
        Err(BatchError::WrongCount { header: 1, found: 2 })
    );
}

#[test]
fn truncated_put_value_is_bad_put() {
    let mut records = Vec::new();
    records.push(ValueType::Value as u8);
    encoding::put_varstring(&mut records, b"key");
    // Value prefix claims 10 bytes, only 2 present.
    records.push(10);
    records.extend_from_slice(b"xx");

    let batch = raw_batch(0, 1, &records);
    assert_eq!(record(&batch), Err(BatchError::BadPut));
}

#[test]
fn put_missing_value_is_bad_put() {
    let mut records = Vec::new();
    records.push(ValueType::Value as u8);
    encoding::put_varstring(&mut records, b"key");

    let batch = raw_batch(0, 1, &records);
    assert_eq!(record(&batch), Err(BatchError::BadPut));
}

#[test]
fn truncated_delete_key_is_bad_delete() {
    let mut records = Vec::new();
    records.push(ValueType::Deletion as u8);
    records.push(5); // key prefix claims 5 bytes, none present

    let batch = raw_batch(0, 1, &records);
    assert_eq!(record(&batch), Err(BatchError::BadDelete));
}

#[test]
fn unknown_tag_aborts_replay() {
    let mut records = Vec::new();
    records.push(ValueType::Value as u8);
    encoding::put_varstring(&mut records, b"good");
    encoding::put_varstring(&mut records, b"record");
    records.push(7); // no such tag
    encoding::put_varstring(&mut records, b"k");

    let batch = raw_batch(0, 2, &records);
    let mut rec = Recorder::default();
    let err = batch.iterate(&mut rec).unwrap_err();
    assert_eq!(err, BatchError::UnknownTag(7));
    // The valid prefix was dispatched before the abort.
    assert_eq!(
        rec.ops,
        vec![Op::Put(b"good".to_vec(), b"record".to_vec())]
    );
}

// -------------------- Replay into the memtable --------------------

#[test]
fn replay_assigns_consecutive_sequences() -> Result<()> {
    let mut batch = WriteBatch::new();
    batch.put(b"a", b"va");
    batch.delete(b"b");
    batch.put(b"c", b"vc");
    batch.set_sequence(100);

    let mem = MemTable::new();
    apply_to_memtable(&batch, &mem)?;

    // Walk the memtable and collect (user_key, seq, tag).
    let mut iter = mem.iter();
    iter.seek_to_first();
    let mut seen = Vec::new();
    while iter.valid() {
        let ikey = iter.key();
        let (user, trailer) = ikey.split_at(ikey.len() - 8);
        let (seq, tag) = memtable::unpack_trailer(encoding::decode_fixed64(trailer));
        seen.push((user.to_vec(), seq, tag));
        iter.next();
    }
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), 100, 1),
            (b"b".to_vec(), 101, 0),
            (b"c".to_vec(), 102, 1),
        ]
    );
    Ok(())
}

#[test]
fn delete_at_higher_sequence_wins_over_put() -> Result<()> {
    // put k=v1, delete k, put k=v2, starting at sequence 10: the delete
    // lands at 11 and the second put at 12.
    let mut batch = WriteBatch::new();
    batch.put(b"k", b"v1");
    batch.delete(b"k");
    batch.put(b"k", b"v2");
    batch.set_sequence(10);

    let mem = MemTable::new();
    apply_to_memtable(&batch, &mem)?;

    assert_eq!(
        mem.get(&LookupKey::new(b"k", 13)),
        Some(Ok(b"v2".to_vec()))
    );
    assert_eq!(mem.get(&LookupKey::new(b"k", 11)), Some(Err(NotFound)));
    assert_eq!(
        mem.get(&LookupKey::new(b"k", 10)),
        Some(Ok(b"v1".to_vec()))
    );
    assert_eq!(mem.get(&LookupKey::new(b"k", 9)), None);
    Ok(())
}

#[test]
fn replaying_two_batches_continues_the_sequence_space() -> Result<()> {
    let mem = MemTable::new();

    let mut b1 = WriteBatch::new();
    b1.put(b"k", b"old");
    b1.set_sequence(1);
    apply_to_memtable(&b1, &mem)?;

    let mut b2 = WriteBatch::new();
    b2.put(b"k", b"new");
    b2.set_sequence(2);
    apply_to_memtable(&b2, &mem)?;

    assert_eq!(mem.get(&LookupKey::new(b"k", 1)), Some(Ok(b"old".to_vec())));
    assert_eq!(mem.get(&LookupKey::new(b"k", 2)), Some(Ok(b"new".to_vec())));
    Ok(())
}

#[test]
fn appended_batch_replays_as_concatenation() -> Result<()> {
    let mut b1 = WriteBatch::new();
    b1.put(b"a", b"1");
    let mut b2 = WriteBatch::new();
    b2.delete(b"a");
    b1.append(&b2);
    b1.set_sequence(1);

    let mem = MemTable::new();
    apply_to_memtable(&b1, &mem)?;

    // The delete from b2 got sequence 2, shadowing the put at 1.
    assert_eq!(mem.get(&LookupKey::new(b"a", 2)), Some(Err(NotFound)));
    assert_eq!(mem.get(&LookupKey::new(b"a", 1)), Some(Ok(b"1".to_vec())));
    Ok(())
}
