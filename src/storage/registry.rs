//! Registry ensuring one live tuple per locator.
//!
//! Field locks only mean something if every caller touching a record shares
//! the same in-memory object. The registry hands out that object: `resolve`
//! is an atomic get-or-create under a single mutex, so racing callers always
//! converge on one instance.
//!
//! Reclamation is pluggable through [`Retention`]. Whatever the policy, a
//! tuple is only dropped while it is idle: no caller holds the tuple, one of
//! its cells, or a guard on one of its locks, and none of its cells carries
//! revisions the persistence layer has not acknowledged. Dropping a busy
//! tuple would let a second instance (with fresh locks) appear for the same
//! locator. Dropping a dirty one would lose history.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::cell::{CellKey, CellValue};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tuple::{CellSource, NoSource, Record, Tuple};
use crate::storage::types::{FieldName, Locator};
use crate::storage::value::Value;

/// Smallest registry size at which `Retention::Idle` sweeps.
const MIN_SWEEP: usize = 64;

/// How the registry reclaims tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Retention {
    /// Keep every tuple for the life of the registry.
    #[default]
    Unbounded,
    /// Keep at most `capacity` tuples, evicting the least recently resolved
    /// idle ones first. Busy tuples are never evicted, so the bound is soft.
    Bounded { capacity: usize },
    /// Drop tuples once they are idle. The sweep runs inside `resolve`
    /// when the map reaches a threshold (at least 64 entries, then twice
    /// what survived the last sweep), so idle tuples linger until then.
    /// Call [`Registry::evict_idle`] to reclaim immediately.
    Idle,
}

/// Registry configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub retention: Retention,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retention policy.
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Shorthand for `Retention::Bounded { capacity }`.
    pub fn capacity(self, capacity: usize) -> Self {
        self.retention(Retention::Bounded { capacity })
    }

    /// Parse from JSON, e.g. `{"retention": {"policy": "bounded", "capacity": 1024}}`.
    pub fn from_json(json: &str) -> StorageResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

struct Slot<K, V> {
    tuple: Arc<Tuple<K, V>>,
    last_used: u64,
}

impl<K: CellKey, V: CellValue> Slot<K, V> {
    /// Only the registry references the tuple, nothing inside it is
    /// shared, and it has nothing left to persist. Callers need an `Arc` from `resolve` to reach the tuple, and
    /// `resolve` needs the registry mutex, so this stays true while the
    /// mutex is held.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.tuple) == 1 && self.tuple.is_idle()
    }
}

struct Slots<K, V> {
    entries: HashMap<Locator, Slot<K, V>>,
    /// logical clock for recency
    clock: u64,
    /// entry count that triggers the next idle sweep
    next_sweep: usize,
}

struct RegistryInner<K, V> {
    config: RegistryConfig,
    source: Arc<dyn CellSource<K>>,
    slots: Mutex<Slots<K, V>>,
}

/// Process-wide map from locator to the single live tuple.
///
/// Cheap to clone; clones share the same map.
pub struct Registry<K, V> {
    inner: Arc<RegistryInner<K, V>>,
}

impl<K, V> Clone for Registry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Registry of [`Record`]s.
pub type RecordRegistry = Registry<FieldName, Value>;

impl<K: CellKey, V: CellValue> Registry<K, V> {
    /// Create a registry whose tuples hydrate cells from `source`.
    pub fn new(config: RegistryConfig, source: Arc<dyn CellSource<K>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                source,
                slots: Mutex::new(Slots {
                    entries: HashMap::new(),
                    clock: 0,
                    next_sweep: MIN_SWEEP,
                }),
            }),
        }
    }

    /// Create a registry for tuples that live purely in memory.
    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(config, Arc::new(NoSource))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Get the tuple for `locator`, creating it on first use.
    ///
    /// Every call for the same locator returns the same instance for as long
    /// as anyone holds it.
    pub fn resolve(&self, locator: Locator) -> Arc<Tuple<K, V>> {
        let mut slots = self.inner.slots.lock();
        slots.clock += 1;
        let now = slots.clock;

        if let Some(slot) = slots.entries.get_mut(&locator) {
            slot.last_used = now;
            return Arc::clone(&slot.tuple);
        }

        let tuple = Arc::new(Tuple::new(locator, Arc::clone(&self.inner.source)));
        slots.entries.insert(
            locator,
            Slot {
                tuple: Arc::clone(&tuple),
                last_used: now,
            },
        );
        tracing::debug!(%locator, cached = slots.entries.len(), "created tuple");

        self.reclaim(&mut slots);
        tuple
    }

    /// Get the tuple for `locator` if one is cached, without creating it.
    pub fn get(&self, locator: Locator) -> Option<Arc<Tuple<K, V>>> {
        let slots = self.inner.slots.lock();
        slots.entries.get(&locator).map(|slot| Arc::clone(&slot.tuple))
    }

    /// number of cached tuples
    pub fn len(&self) -> usize {
        self.inner.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every idle tuple regardless of policy. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let mut slots = self.inner.slots.lock();
        let before = slots.entries.len();
        slots.entries.retain(|_, slot| !slot.is_idle());
        let evicted = before - slots.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = slots.entries.len(), "evicted idle tuples");
        }
        evicted
    }

    fn reclaim(&self, slots: &mut Slots<K, V>) {
        match self.inner.config.retention {
            Retention::Unbounded => {}
            Retention::Bounded { capacity } => {
                if slots.entries.len() <= capacity {
                    return;
                }
                let mut idle: Vec<(u64, Locator)> = slots
                    .entries
                    .iter()
                    .filter(|(_, slot)| slot.is_idle())
                    .map(|(locator, slot)| (slot.last_used, *locator))
                    .collect();
                idle.sort_unstable();

                let excess = slots.entries.len() - capacity;
                for (_, locator) in idle.into_iter().take(excess) {
                    slots.entries.remove(&locator);
                    tracing::debug!(%locator, "evicted tuple over capacity");
                }
                if slots.entries.len() > capacity {
                    tracing::debug!(
                        capacity,
                        cached = slots.entries.len(),
                        "registry over capacity, remaining tuples are busy or dirty"
                    );
                }
            }
            Retention::Idle => {
                if slots.entries.len() < slots.next_sweep {
                    return;
                }
                slots.entries.retain(|_, slot| !slot.is_idle());
                slots.next_sweep = (slots.entries.len() * 2).max(MIN_SWEEP);
                tracing::debug!(
                    remaining = slots.entries.len(),
                    next_sweep = slots.next_sweep,
                    "swept idle tuples"
                );
            }
        }
    }
}

impl<K, V> fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("cached", &self.inner.slots.lock().entries.len())
            .finish()
    }
}

static GLOBAL: OnceLock<RecordRegistry> = OnceLock::new();

/// Configure the process-wide [`Record`] registry.
///
/// Must run before the first call to [`global`] or [`Record::resolve`];
/// afterwards it fails with `AlreadyInitialized`.
pub fn init_global(
    config: RegistryConfig,
    source: Arc<dyn CellSource<FieldName>>,
) -> StorageResult<&'static RecordRegistry> {
    let mut installed = false;
    let registry = GLOBAL.get_or_init(|| {
        installed = true;
        RecordRegistry::new(config, source)
    });
    if installed {
        Ok(registry)
    } else {
        Err(StorageError::AlreadyInitialized)
    }
}

/// The process-wide [`Record`] registry. Defaults to an unbounded, in-memory
/// registry unless [`init_global`] ran first.
pub fn global() -> &'static RecordRegistry {
    GLOBAL.get_or_init(|| RecordRegistry::in_memory(RegistryConfig::default()))
}

impl Record {
    /// Resolve `locator` through the process-wide registry.
    pub fn resolve(locator: Locator) -> Arc<Record> {
        global().resolve(locator)
    }
}
