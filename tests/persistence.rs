// Records flushed to a directory of `.ccr` files and lazily hydrated back.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;
use recordcore::storage::{
    CellSource, FieldName, Locator, RecordRegistry, RegistryConfig, StorageError, StorageResult,
    Timestamp, Value, FILE_EXTENSION,
};

/// one directory per locator, one file per field
struct DirSource {
    root: PathBuf,
}

impl DirSource {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path(&self, locator: Locator, field: &FieldName) -> PathBuf {
        self.root
            .join(locator.to_string())
            .join(format!("{}.{}", field, FILE_EXTENSION))
    }

    /// write every dirty cell, then acknowledge it
    fn flush(&self, registry: &RecordRegistry, locator: Locator) -> StorageResult<usize> {
        let record = registry.resolve(locator);
        let pending = record.dirty_cells();
        for checkpoint in &pending {
            let path = self.path(locator, &checkpoint.field);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &checkpoint.bytes)?;
            record.mark_persisted(checkpoint);
        }
        Ok(pending.len())
    }
}

impl CellSource<FieldName> for DirSource {
    fn load(&self, locator: Locator, field: &FieldName) -> StorageResult<Option<Bytes>> {
        match fs::read(self.path(locator, field)) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

fn field(name: &str) -> FieldName {
    FieldName::new(name).unwrap()
}

fn ts(micros: u64) -> Timestamp {
    Timestamp::from_micros(micros)
}

fn reopen(dir: &Path) -> RecordRegistry {
    RecordRegistry::new(RegistryConfig::default(), Arc::new(DirSource::new(dir)))
}

#[test]
fn flushed_record_hydrates_in_fresh_registry() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirSource::new(dir.path());
    let locator = Locator::new(1001);

    let first = reopen(dir.path());
    {
        let record = first.resolve(locator);
        record.add(&field("name"), Value::from("Bob"), ts(10)).unwrap();
        record.add(&field("name"), Value::from("Amy"), ts(20)).unwrap();
        record.add(&field("age"), Value::Integer(30), ts(20)).unwrap();
        record.remove(&field("age"), Value::Integer(30), ts(25)).unwrap();
    }
    source.flush(&first, locator).unwrap();

    let file = dir.path().join(locator.to_string()).join("name.ccr");
    assert!(file.exists());

    let second = reopen(dir.path());
    let record = second.resolve(locator);
    assert!(record.loaded_fields().is_empty());

    assert_eq!(
        record.fetch(&field("name")).unwrap(),
        vec![Value::from("Bob"), Value::from("Amy")]
    );
    assert!(record.contains_at(&field("name"), &Value::from("Bob"), ts(15)).unwrap());
    assert!(!record.contains_at(&field("name"), &Value::from("Amy"), ts(15)).unwrap());
    assert!(record.fetch(&field("age")).unwrap().is_empty());
    assert_eq!(
        record.fetch_at(&field("age"), ts(22)).unwrap(),
        vec![Value::Integer(30)]
    );

    // only hydrated cells take part in describe
    assert_eq!(record.describe(), vec![field("name")]);
    assert_eq!(record.describe_at(ts(22)), vec![field("age"), field("name")]);
    assert!(record.describe_at(ts(0)).is_empty());

    // never-written fields stay unmaterialized
    assert!(record.fetch(&field("email")).unwrap().is_empty());
    assert_eq!(record.loaded_fields(), vec![field("age"), field("name")]);
}

#[test]
fn evicted_record_rehydrates_full_history() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirSource::new(dir.path());
    let registry = RecordRegistry::new(
        RegistryConfig::new().capacity(1),
        Arc::new(DirSource::new(dir.path())),
    );
    let locator = Locator::new(1);
    let name = field("name");

    {
        let record = registry.resolve(locator);
        record.add(&name, Value::from("Bob"), ts(10)).unwrap();
        record.add(&name, Value::from("Amy"), ts(20)).unwrap();
        record.remove(&name, Value::from("Bob"), ts(30)).unwrap();
    }

    // unflushed, so capacity pressure cannot push it out
    registry.resolve(Locator::new(2));
    registry.resolve(Locator::new(3));
    assert!(registry.get(locator).is_some());

    assert_eq!(source.flush(&registry, locator).unwrap(), 1);
    assert_eq!(source.flush(&registry, locator).unwrap(), 0);
    registry.resolve(Locator::new(4));
    registry.resolve(Locator::new(5));
    assert!(registry.get(locator).is_none());

    let record = registry.resolve(locator);
    assert!(record.loaded_fields().is_empty());
    assert!(record.fetch_at(&name, ts(5)).unwrap().is_empty());
    assert_eq!(record.fetch_at(&name, ts(15)).unwrap(), vec![Value::from("Bob")]);
    assert_eq!(
        record.fetch_at(&name, ts(25)).unwrap(),
        vec![Value::from("Bob"), Value::from("Amy")]
    );
    assert_eq!(record.fetch_at(&name, ts(30)).unwrap(), vec![Value::from("Amy")]);
    assert_eq!(record.fetch(&name).unwrap(), vec![Value::from("Amy")]);
    assert_eq!(record.audit(&name).unwrap().len(), 3);
    assert!(!record.is_dirty());
}

#[test]
fn corrupt_file_fails_the_triggering_read() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirSource::new(dir.path());
    let locator = Locator::new(7);
    let path = source.path(locator, &field("name"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, [0u8, 0, 0, 4, b'n', b'a']).unwrap();

    let registry = reopen(dir.path());
    let record = registry.resolve(locator);
    let err = record.fetch(&field("name")).unwrap_err();
    assert!(err.is_corrupt());
    assert!(record.contains(&field("name"), &Value::from("x")).unwrap_err().is_corrupt());

    // other fields are unaffected
    record.add(&field("other"), Value::Boolean(true), ts(1)).unwrap();
    assert_eq!(record.describe(), vec![field("other")]);
}

#[test]
fn unreadable_source_surfaces_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirSource::new(dir.path());
    let locator = Locator::new(8);
    // a directory where the cell file should be
    fs::create_dir_all(source.path(locator, &field("name"))).unwrap();

    let registry = reopen(dir.path());
    let record = registry.resolve(locator);
    let err = record.fetch(&field("name")).unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
    assert!(err.is_retriable());
}

#[test]
fn racing_threads_share_one_hydrated_record() {
    let dir = tempfile::tempdir().unwrap();
    let source = DirSource::new(dir.path());
    let locator = Locator::new(55);

    let seed = reopen(dir.path());
    seed.resolve(locator)
        .add(&field("count"), Value::Long(1), ts(1))
        .unwrap();
    source.flush(&seed, locator).unwrap();

    let registry = reopen(dir.path());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let record = registry.resolve(locator);
                let count = field("count");
                let _guard = record.write_lock(&count).unwrap();
                record
                    .add(&count, Value::Long(i as i64 + 2), ts(10))
                    .unwrap();
                record
            })
        })
        .collect();

    let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for record in &records[1..] {
        assert!(Arc::ptr_eq(&records[0], record));
    }

    let values = records[0].fetch(&field("count")).unwrap();
    assert_eq!(values.len(), threads + 1);
    assert_eq!(values[0], Value::Long(1));
    assert_eq!(records[0].audit(&field("count")).unwrap().len(), threads + 1);
}
