//! Versioned field container.
//!
//! A cell never stores "the" value of a field. It keeps an append-only log
//! of ADD/REMOVE revisions and derives value-sets by folding that log:
//! - present state: fold over every revision
//! - historical state at `t`: fold over revisions with `timestamp <= t`
//!
//! The byte form is `[key][revision]*` with each revision laid out as
//! `[u64 timestamp][u8 action][value]`.
//!
//! A cell also remembers how much of its log the persistence layer has
//! taken. Revisions past that mark make the cell dirty, and the registry
//! never reclaims a tuple with dirty cells.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::storage::codec::{self, Codec};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::lock::{FieldLock, ReadGuard, WriteGuard};
use crate::storage::types::{Action, Timestamp};

/// Requirements on the key naming a cell within a tuple.
pub trait CellKey: Codec + Clone + Eq + Ord + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> CellKey for T where T: Codec + Clone + Eq + Ord + Hash + fmt::Display + Send + Sync + 'static {}

/// Requirements on the values a cell holds.
pub trait CellValue: Codec + Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> CellValue for T where T: Codec + Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// One entry of a cell's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision<V> {
    pub value: V,
    pub timestamp: Timestamp,
    pub action: Action,
}

impl<V: Codec> Revision<V> {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u64(self.timestamp.as_micros());
        out.put_u8(self.action.tag());
        self.value.encode(out);
    }

    fn decode(input: &mut &[u8]) -> StorageResult<Self> {
        let timestamp = Timestamp::from_micros(codec::get_u64(input, "revision timestamp")?);
        let tag = codec::get_u8(input, "revision action")?;
        let action = Action::from_tag(tag)
            .ok_or_else(|| StorageError::corrupt(format!("unknown revision action {}", tag)))?;
        let value = V::decode(input)?;
        Ok(Self {
            value,
            timestamp,
            action,
        })
    }

    fn encoded_len(&self) -> usize {
        8 + 1 + self.value.encoded_len()
    }
}

/// Apply one revision to an insertion-ordered value-set.
fn apply<V: PartialEq + Clone>(values: &mut Vec<V>, revision: &Revision<V>) {
    let position = values.iter().position(|v| *v == revision.value);
    match (revision.action, position) {
        (Action::Add, None) => values.push(revision.value.clone()),
        (Action::Remove, Some(pos)) => {
            values.remove(pos);
        }
        // duplicate add or remove of an absent value
        _ => {}
    }
}

#[derive(Debug)]
struct RevisionLog<V> {
    revisions: Vec<Revision<V>>,
    /// fold of `revisions`, maintained on append
    present: Vec<V>,
    /// leading revisions known to be persisted
    persisted: usize,
}

impl<V: CellValue> RevisionLog<V> {
    fn new() -> Self {
        Self {
            revisions: Vec::new(),
            present: Vec::new(),
            persisted: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.revisions.len() > self.persisted
    }

    fn last_timestamp(&self) -> Option<Timestamp> {
        self.revisions.last().map(|r| r.timestamp)
    }

    fn push(&mut self, revision: Revision<V>) {
        apply(&mut self.present, &revision);
        self.revisions.push(revision);
    }

    fn values_at(&self, timestamp: Timestamp) -> Vec<V> {
        let mut values = Vec::new();
        for revision in self.revisions.iter().take_while(|r| r.timestamp <= timestamp) {
            apply(&mut values, revision);
        }
        values
    }
}

/// Serialized cell plus how many revisions the bytes cover.
///
/// Hand it back through [`Cell::mark_persisted`] once the bytes are
/// durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint<K> {
    pub field: K,
    pub bytes: Bytes,
    pub revisions: usize,
}

/// A single field's revision history plus its reader-writer lock.
pub struct Cell<K, V> {
    field: K,
    log: RwLock<RevisionLog<V>>,
    lock: Arc<FieldLock>,
}

impl<K: CellKey, V: CellValue> Cell<K, V> {
    /// create an empty cell with no revisions
    pub fn new(field: K) -> Self {
        Self {
            field,
            log: RwLock::new(RevisionLog::new()),
            lock: Arc::new(FieldLock::new()),
        }
    }

    /// Rebuild a cell from the output of [`Cell::serialize`].
    pub fn reconstruct(bytes: &[u8]) -> StorageResult<Self> {
        let mut input = bytes;
        let field = K::decode(&mut input)?;
        let mut log = RevisionLog::new();

        while input.has_remaining() {
            let revision = Revision::<V>::decode(&mut input)?;
            if let Some(last) = log.last_timestamp() {
                if revision.timestamp < last {
                    return Err(StorageError::corrupt(format!(
                        "revision log of {} goes back in time: {} after {}",
                        field, revision.timestamp, last
                    )));
                }
            }
            log.push(revision);
        }
        // the bytes came from storage
        log.persisted = log.revisions.len();

        Ok(Self {
            field,
            log: RwLock::new(log),
            lock: Arc::new(FieldLock::new()),
        })
    }

    /// Canonical byte form.
    pub fn serialize(&self) -> Bytes {
        self.encode_log(&self.log.read())
    }

    /// Byte form together with the revision count it covers, taken under
    /// one read of the log.
    pub fn checkpoint(&self) -> Checkpoint<K> {
        let log = self.log.read();
        Checkpoint {
            field: self.field.clone(),
            bytes: self.encode_log(&log),
            revisions: log.revisions.len(),
        }
    }

    /// Record that the first `revisions` entries are durable. Older marks
    /// never move the high-water mark back.
    pub fn mark_persisted(&self, revisions: usize) {
        let mut log = self.log.write();
        let revisions = revisions.min(log.revisions.len());
        if revisions > log.persisted {
            log.persisted = revisions;
        }
    }

    /// true if some revisions have not been persisted yet
    pub fn is_dirty(&self) -> bool {
        self.log.read().is_dirty()
    }

    fn encode_log(&self, log: &RevisionLog<V>) -> Bytes {
        let len = self.field.encoded_len()
            + log.revisions.iter().map(Revision::encoded_len).sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        self.field.encode(&mut out);
        for revision in &log.revisions {
            revision.encode(&mut out);
        }
        out.freeze()
    }

    pub fn field(&self) -> &K {
        &self.field
    }

    /// Log that `value` was added at `timestamp`.
    ///
    /// Takes this cell's write lock for the duration of the append; a
    /// caller already holding it re-enters.
    pub fn add(&self, value: V, timestamp: Timestamp) -> StorageResult<()> {
        self.append(value, timestamp, Action::Add)
    }

    /// Log that `value` was removed at `timestamp`.
    pub fn remove(&self, value: V, timestamp: Timestamp) -> StorageResult<()> {
        self.append(value, timestamp, Action::Remove)
    }

    fn append(&self, value: V, timestamp: Timestamp, action: Action) -> StorageResult<()> {
        value.validate()?;
        let _guard = self.lock.write()?;
        let mut log = self.log.write();
        if let Some(last) = log.last_timestamp() {
            if timestamp < last {
                return Err(StorageError::OutOfOrderRevision {
                    field: self.field.to_string(),
                    last,
                    attempted: timestamp,
                });
            }
        }
        log.push(Revision {
            value,
            timestamp,
            action,
        });
        Ok(())
    }

    /// present value-set, in first-seen order
    pub fn values(&self) -> Vec<V> {
        self.log.read().present.clone()
    }

    /// value-set as of `timestamp`, in first-seen order
    pub fn values_at(&self, timestamp: Timestamp) -> Vec<V> {
        self.log.read().values_at(timestamp)
    }

    pub fn contains(&self, value: &V) -> bool {
        self.log.read().present.contains(value)
    }

    pub fn contains_at(&self, value: &V, timestamp: Timestamp) -> bool {
        self.values_at(timestamp).contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().present.is_empty()
    }

    pub fn is_empty_at(&self, timestamp: Timestamp) -> bool {
        self.values_at(timestamp).is_empty()
    }

    /// copy of the full revision log, oldest first
    pub fn revisions(&self) -> Vec<Revision<V>> {
        self.log.read().revisions.clone()
    }

    pub fn revision_count(&self) -> usize {
        self.log.read().revisions.len()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.log.read().last_timestamp()
    }

    /// shared hold on this cell's lock
    pub fn read(&self) -> ReadGuard {
        self.lock.read()
    }

    /// exclusive hold on this cell's lock
    pub fn write(&self) -> StorageResult<WriteGuard> {
        self.lock.write()
    }

    pub fn try_read_for(&self, timeout: Duration) -> Option<ReadGuard> {
        self.lock.try_read_for(timeout)
    }

    pub fn try_write_for(&self, timeout: Duration) -> StorageResult<Option<WriteGuard>> {
        self.lock.try_write_for(timeout)
    }

    /// the underlying lock, for diagnostics
    pub fn lock(&self) -> &FieldLock {
        &self.lock
    }

    /// true if no guard on this cell's lock is outstanding
    pub(crate) fn is_unlocked(&self) -> bool {
        Arc::strong_count(&self.lock) == 1
    }
}

impl<K: CellKey, V: CellValue> fmt::Debug for Cell<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("field", &format_args!("{}", self.field))
            .field("revisions", &self.log.read().revisions.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::FieldName;
    use crate::storage::value::Value;
    use std::thread;

    type TestCell = Cell<FieldName, Value>;

    fn cell(name: &str) -> TestCell {
        Cell::new(FieldName::new(name).unwrap())
    }

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[test]
    fn test_new_cell_is_empty() {
        let cell = cell("name");
        assert!(cell.is_empty());
        assert_eq!(cell.revision_count(), 0);
        assert_eq!(cell.last_timestamp(), None);
        assert!(cell.values_at(Timestamp::MAX).is_empty());
        assert_eq!(cell.field().as_str(), "name");
    }

    #[test]
    fn test_temporal_scenario() {
        let cell = cell("x");
        cell.add(s("x"), ts(1)).unwrap();
        cell.remove(s("x"), ts(5)).unwrap();
        cell.add(s("x"), ts(10)).unwrap();

        assert!(cell.values_at(ts(0)).is_empty());
        assert_eq!(cell.values_at(ts(3)), vec![s("x")]);
        assert!(cell.values_at(ts(7)).is_empty());
        assert_eq!(cell.values_at(ts(20)), vec![s("x")]);
        assert_eq!(cell.values(), vec![s("x")]);
    }

    #[test]
    fn test_revision_boundary_is_inclusive() {
        let cell = cell("x");
        cell.add(s("a"), ts(5)).unwrap();
        assert!(cell.values_at(ts(4)).is_empty());
        assert_eq!(cell.values_at(ts(5)), vec![s("a")]);
    }

    #[test]
    fn test_idempotent_add_and_remove() {
        let cell = cell("tags");
        cell.add(s("a"), ts(1)).unwrap();
        cell.add(s("a"), ts(2)).unwrap();
        assert_eq!(cell.values(), vec![s("a")]);

        cell.remove(s("missing"), ts(3)).unwrap();
        assert_eq!(cell.values(), vec![s("a")]);
        // still logged
        assert_eq!(cell.revision_count(), 3);
        assert_eq!(cell.revisions()[2].action, Action::Remove);
    }

    #[test]
    fn test_history_at_or_after_last_revision_is_present() {
        let cell = cell("multi");
        cell.add(s("a"), ts(1)).unwrap();
        cell.add(Value::Integer(2), ts(2)).unwrap();
        cell.remove(s("a"), ts(3)).unwrap();
        cell.add(s("c"), ts(4)).unwrap();
        cell.add(s("a"), ts(4)).unwrap();

        for t in [4, 5, 1_000, u64::MAX] {
            assert_eq!(cell.values_at(ts(t)), cell.values());
        }
        assert_eq!(cell.values(), vec![Value::Integer(2), s("c"), s("a")]);
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let cell = cell("x");
        cell.add(s("a"), ts(10)).unwrap();
        // equal timestamps are fine
        cell.add(s("b"), ts(10)).unwrap();
        let err = cell.add(s("c"), ts(9)).unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrderRevision { .. }));
        assert_eq!(cell.revision_count(), 2);
    }

    #[test]
    fn test_contains() {
        let cell = cell("name");
        cell.add(s("Bob"), ts(10)).unwrap();
        assert!(cell.contains(&s("Bob")));
        assert!(!cell.contains(&s("Amy")));
        assert!(!cell.contains_at(&s("Bob"), ts(9)));
        assert!(cell.contains_at(&s("Bob"), ts(10)));
        assert!(cell.is_empty_at(ts(9)));
    }

    #[test]
    fn test_serialize_layout() {
        let cell = cell("n");
        cell.add(s("v"), ts(1)).unwrap();
        let bytes = cell.serialize();
        let expected: Vec<u8> = [
            &[0, 0, 0, 1, b'n'][..],
            &[0, 0, 0, 0, 0, 0, 0, 1],
            &[1],
            &[0, 0, 0, 1, 7, b'v'],
        ]
        .concat();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_round_trip_preserves_queries() {
        let cell = cell("name");
        cell.add(s("Bob"), ts(10)).unwrap();
        cell.add(s("Amy"), ts(20)).unwrap();
        cell.remove(s("Bob"), ts(30)).unwrap();
        cell.add(Value::Long(7), ts(30)).unwrap();
        cell.add(s("Bob"), ts(40)).unwrap();

        let restored = TestCell::reconstruct(&cell.serialize()).unwrap();
        assert_eq!(restored.field(), cell.field());
        assert_eq!(restored.values(), cell.values());
        for t in [0, 10, 15, 20, 30, 35, 40, 50] {
            assert_eq!(restored.values_at(ts(t)), cell.values_at(ts(t)), "at {}", t);
        }
        assert_eq!(restored.revisions(), cell.revisions());
        assert_eq!(restored.serialize(), cell.serialize());
    }

    #[test]
    fn test_empty_cell_round_trip() {
        let cell = cell("empty");
        let restored = TestCell::reconstruct(&cell.serialize()).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.field().as_str(), "empty");
    }

    #[test]
    fn test_reconstruct_rejects_corruption() {
        let cell = cell("name");
        cell.add(s("Bob"), ts(10)).unwrap();
        let bytes = cell.serialize();

        // truncated in the middle of a value
        let err = TestCell::reconstruct(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_corrupt());

        // unknown action tag
        let mut bad = bytes.to_vec();
        bad[8 + 8] = 9;
        assert!(TestCell::reconstruct(&bad).unwrap_err().is_corrupt());

        // trailing garbage that is not a full revision
        let mut bad = bytes.to_vec();
        bad.push(0);
        assert!(TestCell::reconstruct(&bad).unwrap_err().is_corrupt());

        assert!(TestCell::reconstruct(&[]).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_reconstruct_rejects_time_travel() {
        let mut out = BytesMut::new();
        FieldName::new("x").unwrap().encode(&mut out);
        for t in [5u64, 3] {
            Revision {
                value: s("a"),
                timestamp: ts(t),
                action: Action::Add,
            }
            .encode(&mut out);
        }
        assert!(TestCell::reconstruct(&out).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_checkpoint_tracks_persisted_revisions() {
        let cell = cell("name");
        assert!(!cell.is_dirty());

        cell.add(s("Bob"), ts(10)).unwrap();
        assert!(cell.is_dirty());
        let first = cell.checkpoint();
        assert_eq!(first.revisions, 1);
        assert_eq!(first.bytes, cell.serialize());

        // appended after the snapshot was taken
        cell.add(s("Amy"), ts(20)).unwrap();
        cell.mark_persisted(first.revisions);
        assert!(cell.is_dirty());

        let second = cell.checkpoint();
        cell.mark_persisted(second.revisions);
        assert!(!cell.is_dirty());

        // a late acknowledgement of the older snapshot changes nothing
        cell.mark_persisted(first.revisions);
        assert!(!cell.is_dirty());
        cell.mark_persisted(usize::MAX);
        cell.add(s("Cid"), ts(30)).unwrap();
        assert!(cell.is_dirty());
    }

    #[test]
    fn test_reconstructed_cell_is_clean() {
        let cell = cell("name");
        cell.add(s("Bob"), ts(10)).unwrap();
        let restored = TestCell::reconstruct(&cell.serialize()).unwrap();
        assert!(!restored.is_dirty());
        restored.remove(s("Bob"), ts(11)).unwrap();
        assert!(restored.is_dirty());
    }

    /// string value limited to four bytes
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Short(String);

    impl Codec for Short {
        fn encode(&self, out: &mut BytesMut) {
            Value::from(self.0.as_str()).encode(out);
        }

        fn decode(input: &mut &[u8]) -> StorageResult<Self> {
            match Value::decode(input)? {
                Value::String(v) => Ok(Short(v)),
                other => Err(StorageError::corrupt(format!("not a string: {}", other))),
            }
        }

        fn encoded_len(&self) -> usize {
            Value::from(self.0.as_str()).encoded_len()
        }

        fn validate(&self) -> StorageResult<()> {
            if self.0.len() > 4 {
                return Err(StorageError::ValueTooLarge {
                    size: self.0.len(),
                    max: 4,
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_append_rejects_unencodable_value() {
        let cell: Cell<FieldName, Short> = Cell::new(FieldName::new("code").unwrap());
        cell.add(Short("abcd".to_string()), ts(1)).unwrap();
        let err = cell.add(Short("abcde".to_string()), ts(2)).unwrap_err();
        assert!(matches!(err, StorageError::ValueTooLarge { size: 5, max: 4 }));
        assert_eq!(cell.revision_count(), 1);
        assert!(!cell.lock().is_write_locked());
    }

    #[test]
    fn test_append_waits_for_foreign_write_lock() {
        let cell = Arc::new(cell("x"));
        let guard = cell.write().unwrap();

        let other = Arc::clone(&cell);
        let writer = thread::spawn(move || other.add(s("a"), ts(1)).unwrap());
        thread::sleep(Duration::from_millis(30));
        assert!(cell.is_empty());

        drop(guard);
        writer.join().unwrap();
        assert_eq!(cell.values(), vec![s("a")]);
    }

    #[test]
    fn test_append_reenters_callers_write_lock() {
        let cell = cell("x");
        let _guard = cell.write().unwrap();
        cell.add(s("a"), ts(1)).unwrap();
        assert_eq!(cell.values(), vec![s("a")]);
    }

    #[test]
    fn test_append_under_read_lock_is_misuse() {
        let cell = cell("x");
        let _guard = cell.read();
        assert!(cell.add(s("a"), ts(1)).unwrap_err().is_lock_misuse());
    }
}
