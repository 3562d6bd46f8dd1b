//! recordcore - versioned record storage core
//!
//! Records are locator-addressed rows whose fields each keep an append-only
//! history of ADD/REMOVE revisions instead of a single value. This crate
//! provides present and point-in-time reads over those histories, per-field
//! reader-writer locks, a compact binary encoding for persistence, and a
//! registry that keeps exactly one in-memory object per record so that locks
//! are shared by every caller.
//!
//! Persisting bytes, choosing which records to touch and assigning locators
//! are left to the layers above.
//!
//! # Example
//!
//! ```
//! use recordcore::storage::{FieldName, Locator, Record, Timestamp, Value};
//!
//! let record = Record::resolve(Locator::new(17));
//! let tags = FieldName::new("tags").unwrap();
//! record.add(&tags, Value::from("x"), Timestamp::from_micros(1)).unwrap();
//! record.remove(&tags, Value::from("x"), Timestamp::from_micros(5)).unwrap();
//!
//! assert!(record.fetch(&tags).unwrap().is_empty());
//! assert!(record.contains_at(&tags, &Value::from("x"), Timestamp::from_micros(3)).unwrap());
//! ```

pub mod storage;
