//! Locator-addressed aggregate of cells.
//!
//! A [`Tuple`] owns a lazily populated map from field to [`Cell`]. Cells are
//! created on first write or lock, or reconstructed from bytes handed over
//! by a [`CellSource`] on first read. Reads of a field that has neither a
//! cell nor persisted bytes answer "empty" without materializing anything.
//!
//! Two lock granularities coexist and are independent:
//! - the row-level read lock (the cell map's `RwLock`) held by `describe`,
//!   `contains` and `fetch` for the duration of their scan
//! - each cell's own [`FieldLock`](crate::storage::FieldLock), handed out
//!   through `read_lock` / `write_lock`
//!
//! A bulk scan therefore does not wait for a field's write lock and may
//! observe a write in progress on another thread. Callers that need a
//! consistent multi-step view of a field take that field's lock themselves.
//!
//! Writes stay in memory until the persistence layer collects them with
//! [`Tuple::dirty_cells`] and acknowledges them with
//! [`Tuple::mark_persisted`]. Until then the tuple is pinned in its registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::storage::cell::{Cell, CellKey, CellValue, Checkpoint, Revision};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::lock::{ReadGuard, WriteGuard};
use crate::storage::types::{FieldName, Locator, Timestamp};
use crate::storage::value::Value;

/// File extension for persisted record cells.
pub const FILE_EXTENSION: &str = "ccr";

/// The concrete row type: named fields holding typed values.
pub type Record = Tuple<FieldName, Value>;

/// Supplier of persisted cell bytes.
///
/// Implemented by the persistence layer. `Ok(None)` means the field was
/// never written for this locator.
pub trait CellSource<K>: Send + Sync {
    fn load(&self, locator: Locator, field: &K) -> StorageResult<Option<Bytes>>;
}

/// Source for tuples that live purely in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSource;

impl<K> CellSource<K> for NoSource {
    fn load(&self, _locator: Locator, _field: &K) -> StorageResult<Option<Bytes>> {
        Ok(None)
    }
}

/// A row of versioned cells addressed by a [`Locator`].
///
/// Obtain tuples from a [`Registry`](crate::storage::Registry) so that every
/// caller working on the same locator shares one instance, and with it the
/// same field locks.
pub struct Tuple<K, V> {
    locator: Locator,
    cells: RwLock<HashMap<K, Arc<Cell<K, V>>>>,
    source: Arc<dyn CellSource<K>>,
}

impl<K: CellKey, V: CellValue> Tuple<K, V> {
    pub(crate) fn new(locator: Locator, source: Arc<dyn CellSource<K>>) -> Self {
        Self {
            locator,
            cells: RwLock::new(HashMap::new()),
            source,
        }
    }

    pub fn locator(&self) -> Locator {
        self.locator
    }

    /// Get the cell for `field`, creating an empty one if the field has no
    /// cell and no persisted bytes.
    pub fn cell(&self, field: &K) -> StorageResult<Arc<Cell<K, V>>> {
        if let Some(cell) = self.load(field)? {
            return Ok(cell);
        }
        let mut cells = self.cells.write();
        let cell = cells
            .entry(field.clone())
            .or_insert_with(|| Arc::new(Cell::new(field.clone())));
        Ok(Arc::clone(cell))
    }

    /// Install a cell reconstructed from `bytes`.
    ///
    /// If the field is already loaded the existing cell wins and `bytes` are
    /// discarded, so a late hydration never replaces a cell someone may be
    /// holding a lock on.
    pub fn hydrate(&self, bytes: &[u8]) -> StorageResult<Arc<Cell<K, V>>> {
        let cell = Cell::<K, V>::reconstruct(bytes).inspect_err(|e| {
            tracing::warn!(locator = %self.locator, error = %e, "cannot hydrate cell");
        })?;
        Ok(self.install(cell))
    }

    fn install(&self, cell: Cell<K, V>) -> Arc<Cell<K, V>> {
        let mut cells = self.cells.write();
        let installed = cells
            .entry(cell.field().clone())
            .or_insert_with(|| Arc::new(cell));
        Arc::clone(installed)
    }

    /// Find a loaded cell, falling back to the source. Never creates an
    /// empty cell.
    fn load(&self, field: &K) -> StorageResult<Option<Arc<Cell<K, V>>>> {
        if let Some(cell) = self.cells.read().get(field) {
            return Ok(Some(Arc::clone(cell)));
        }

        let Some(bytes) = self.source.load(self.locator, field)? else {
            return Ok(None);
        };
        let cell = Cell::<K, V>::reconstruct(&bytes).inspect_err(|e| {
            tracing::warn!(locator = %self.locator, %field, error = %e, "persisted cell is corrupt");
        })?;
        if cell.field() != field {
            tracing::warn!(locator = %self.locator, %field, found = %cell.field(), "persisted cell has wrong field");
            return Err(StorageError::corrupt(format!(
                "cell for {} in record {} is labelled {}",
                field,
                self.locator,
                cell.field()
            )));
        }
        tracing::debug!(
            locator = %self.locator,
            %field,
            revisions = cell.revision_count(),
            "hydrated cell"
        );
        Ok(Some(self.install(cell)))
    }

    /// Run `query` against the cell for `field` while holding the row-level
    /// read lock.
    fn scan<R>(&self, field: &K, query: impl FnOnce(Option<&Cell<K, V>>) -> R) -> StorageResult<R> {
        {
            let cells = self.cells.read();
            if let Some(cell) = cells.get(field) {
                return Ok(query(Some(cell)));
            }
        }
        let cell = self.load(field)?;
        let _row = self.cells.read();
        Ok(query(cell.as_deref()))
    }

    /// Fields with a non-empty present value-set, in field order.
    ///
    /// Only loaded cells are considered.
    pub fn describe(&self) -> Vec<K> {
        self.describe_where(|cell| !cell.is_empty())
    }

    /// Fields with a non-empty value-set at `timestamp`, in field order.
    pub fn describe_at(&self, timestamp: Timestamp) -> Vec<K> {
        self.describe_where(|cell| !cell.is_empty_at(timestamp))
    }

    fn describe_where(&self, keep: impl Fn(&Cell<K, V>) -> bool) -> Vec<K> {
        let cells = self.cells.read();
        let mut fields: Vec<K> = cells
            .values()
            .filter_map(|cell| keep(&**cell).then(|| cell.field().clone()))
            .collect();
        fields.sort();
        fields
    }

    /// true if `value` is currently in `field`
    pub fn contains(&self, field: &K, value: &V) -> StorageResult<bool> {
        self.scan(field, |cell| cell.is_some_and(|c| c.contains(value)))
    }

    /// true if `value` was in `field` at `timestamp`
    pub fn contains_at(&self, field: &K, value: &V, timestamp: Timestamp) -> StorageResult<bool> {
        self.scan(field, |cell| cell.is_some_and(|c| c.contains_at(value, timestamp)))
    }

    /// present values of `field`, in first-seen order
    pub fn fetch(&self, field: &K) -> StorageResult<Vec<V>> {
        self.scan(field, |cell| cell.map(Cell::values).unwrap_or_default())
    }

    /// values of `field` at `timestamp`, in first-seen order
    pub fn fetch_at(&self, field: &K, timestamp: Timestamp) -> StorageResult<Vec<V>> {
        self.scan(field, |cell| {
            cell.map(|c| c.values_at(timestamp)).unwrap_or_default()
        })
    }

    /// full revision log of `field`, oldest first
    pub fn audit(&self, field: &K) -> StorageResult<Vec<Revision<V>>> {
        self.scan(field, |cell| cell.map(Cell::revisions).unwrap_or_default())
    }

    /// Log that `value` was added to `field` at `timestamp`.
    pub fn add(&self, field: &K, value: V, timestamp: Timestamp) -> StorageResult<()> {
        self.cell(field)?.add(value, timestamp)
    }

    /// Log that `value` was removed from `field` at `timestamp`.
    pub fn remove(&self, field: &K, value: V, timestamp: Timestamp) -> StorageResult<()> {
        self.cell(field)?.remove(value, timestamp)
    }

    /// Shared hold on the lock of `field`'s cell.
    pub fn read_lock(&self, field: &K) -> StorageResult<ReadGuard> {
        Ok(self.cell(field)?.read())
    }

    /// Exclusive hold on the lock of `field`'s cell.
    ///
    /// To lock several fields, take them in ascending field order.
    pub fn write_lock(&self, field: &K) -> StorageResult<WriteGuard> {
        self.cell(field)?.write()
    }

    /// true if nothing outside this tuple holds one of its cells or a guard
    /// on their locks, and every revision has been persisted
    pub(crate) fn is_idle(&self) -> bool {
        self.cells.read().values().all(|cell| {
            Arc::strong_count(cell) == 1 && cell.is_unlocked() && !cell.is_dirty()
        })
    }

    /// true if some loaded cell holds revisions not yet persisted
    pub fn is_dirty(&self) -> bool {
        self.cells.read().values().any(|cell| cell.is_dirty())
    }

    /// Checkpoints of every dirty cell, in field order.
    pub fn dirty_cells(&self) -> Vec<Checkpoint<K>> {
        let cells: Vec<Arc<Cell<K, V>>> = self.cells.read().values().cloned().collect();
        let mut out: Vec<Checkpoint<K>> = cells
            .iter()
            .filter(|cell| cell.is_dirty())
            .map(|cell| cell.checkpoint())
            .collect();
        out.sort_by(|a, b| a.field.cmp(&b.field));
        out
    }

    /// Acknowledge that `checkpoint` reached durable storage.
    pub fn mark_persisted(&self, checkpoint: &Checkpoint<K>) {
        match self.cells.read().get(&checkpoint.field) {
            Some(cell) => cell.mark_persisted(checkpoint.revisions),
            None => {
                tracing::warn!(locator = %self.locator, field = %checkpoint.field, "persisted checkpoint for unloaded cell");
            }
        }
    }

    /// fields that currently have a cell in memory, in field order
    pub fn loaded_fields(&self) -> Vec<K> {
        let mut fields: Vec<K> = self.cells.read().keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Serialized form of every loaded cell, in field order. Does not touch
    /// the persisted mark; see [`Tuple::dirty_cells`].
    pub fn serialize_cells(&self) -> Vec<(K, Bytes)> {
        let cells: Vec<Arc<Cell<K, V>>> = self.cells.read().values().cloned().collect();
        let mut out: Vec<(K, Bytes)> = cells
            .iter()
            .map(|cell| (cell.field().clone(), cell.serialize()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl<K, V> fmt::Debug for Tuple<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tuple")
            .field("locator", &self.locator)
            .field("loaded_cells", &self.cells.read().len())
            .finish()
    }
}
