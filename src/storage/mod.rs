//! storage layer for recordcore
//!
//! this module provides versioned, field-locked records. The upper layers
//! (query planner, segment manager) use this API to read and write cells
//! and never manage record identity or locks themselves.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Registry                             │
//! │        (one live Tuple per Locator, pluggable reclaim)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                       ┌─────────────┐        ┌─────────────┐
//!                       │    Tuple    │ ─────► │ CellSource  │
//!                       │  (Record)   │ bytes  │ (persisted) │
//!                       └─────────────┘        └─────────────┘
//!                              │
//!                              ▼
//!                       ┌─────────────┐
//!                       │    Cell     │
//!                       │ log + lock  │
//!                       └─────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Revision   │       │  FieldLock  │       │    Codec    │
//!  │ (ADD / REM) │       │ (reentrant) │       │  (binary)   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use recordcore::storage::{FieldName, Locator, RecordRegistry, RegistryConfig, Timestamp, Value};
//!
//! let registry = RecordRegistry::in_memory(RegistryConfig::default());
//! let record = registry.resolve(Locator::new(1));
//! let name = FieldName::new("name").unwrap();
//!
//! record.add(&name, Value::from("Bob"), Timestamp::from_micros(10)).unwrap();
//! record.add(&name, Value::from("Amy"), Timestamp::from_micros(20)).unwrap();
//!
//! assert_eq!(record.fetch(&name).unwrap(), vec![Value::from("Bob"), Value::from("Amy")]);
//! assert_eq!(
//!     record.fetch_at(&name, Timestamp::from_micros(15)).unwrap(),
//!     vec![Value::from("Bob")]
//! );
//!
//! // multi-step critical section on one field
//! let guard = record.write_lock(&name).unwrap();
//! if !record.contains(&name, &Value::from("Cid")).unwrap() {
//!     record.add(&name, Value::from("Cid"), Timestamp::from_micros(30)).unwrap();
//! }
//! drop(guard);
//! ```

mod cell;
mod codec;
mod error;
mod lock;
mod registry;
mod tuple;
mod types;
mod value;

// Re-export public API
pub use cell::{Cell, CellKey, CellValue, Checkpoint, Revision};
pub use codec::Codec;
pub use error::{StorageError, StorageResult};
pub use lock::{FieldLock, ReadGuard, WriteGuard};
pub use registry::{global, init_global, RecordRegistry, Registry, RegistryConfig, Retention};
pub use tuple::{CellSource, NoSource, Record, Tuple, FILE_EXTENSION};
pub use types::{Action, FieldName, InvalidNameError, Locator, Timestamp};
pub use value::Value;
