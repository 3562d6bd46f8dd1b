//! Reentrant reader-writer lock guarding a single cell.
//!
//! Ownership is tracked per thread, which gives us:
//! - reentrancy: a thread holding the lock can take it again (write holders
//!   may also take read locks)
//! - misuse detection: releasing a lock the thread does not hold, and
//!   read-to-write upgrades, fail with [`StorageError::LockMisuse`]
//!
//! Callers normally never touch the raw `unlock_*` functions; the
//! [`ReadGuard`] and [`WriteGuard`] handles release exactly once, on drop or
//! through an explicit `release()`.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::storage::error::{StorageError, StorageResult};

#[derive(Debug, Default)]
struct LockState {
    /// thread owning the write lock and its hold count
    writer: Option<(ThreadId, usize)>,
    /// read hold counts per thread
    readers: HashMap<ThreadId, usize>,
    /// writers parked in `write`; new readers queue behind them
    waiting_writers: usize,
}

impl LockState {
    fn holds_write(&self, me: ThreadId) -> bool {
        matches!(self.writer, Some((owner, _)) if owner == me)
    }

    fn holds_read(&self, me: ThreadId) -> bool {
        self.readers.contains_key(&me)
    }

    /// a thread already inside the lock never waits for a read
    fn read_blocked(&self, me: ThreadId) -> bool {
        if self.holds_write(me) || self.holds_read(me) {
            return false;
        }
        self.writer.is_some() || self.waiting_writers > 0
    }

    fn write_blocked(&self) -> bool {
        self.writer.is_some() || !self.readers.is_empty()
    }

    /// Take another write hold if `me` already owns the lock. Returns false
    /// when the caller has to queue for it.
    fn reenter_write(&mut self, me: ThreadId) -> StorageResult<bool> {
        if let Some((owner, holds)) = self.writer.as_mut() {
            if *owner == me {
                *holds += 1;
                return Ok(true);
            }
        }
        if self.holds_read(me) {
            tracing::warn!("refusing read-to-write lock upgrade");
            return Err(StorageError::lock_misuse(
                "cannot upgrade a read lock to a write lock",
            ));
        }
        Ok(false)
    }

    fn grant_read(&mut self, me: ThreadId) {
        *self.readers.entry(me).or_insert(0) += 1;
    }
}

/// Per-cell reentrant reader-writer lock.
#[derive(Default)]
pub struct FieldLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl FieldLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock, blocking while another thread writes.
    pub fn read(self: &Arc<Self>) -> ReadGuard {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.read_blocked(me) {
            self.cond.wait(&mut state);
        }
        state.grant_read(me);
        ReadGuard::new(Arc::clone(self))
    }

    /// Acquire a shared lock, giving up after `timeout`.
    pub fn try_read_for(self: &Arc<Self>, timeout: Duration) -> Option<ReadGuard> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.read_blocked(me) {
            if self.cond.wait_until(&mut state, deadline).timed_out() && state.read_blocked(me) {
                return None;
            }
        }
        state.grant_read(me);
        Some(ReadGuard::new(Arc::clone(self)))
    }

    /// Acquire the exclusive lock, blocking until every other holder leaves.
    ///
    /// Fails with `LockMisuse` if the calling thread holds only a read lock,
    /// since waiting for its own read to drain would never finish.
    pub fn write(self: &Arc<Self>) -> StorageResult<WriteGuard> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.reenter_write(me)? {
            return Ok(WriteGuard::new(Arc::clone(self)));
        }

        state.waiting_writers += 1;
        while state.write_blocked() {
            self.cond.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some((me, 1));
        Ok(WriteGuard::new(Arc::clone(self)))
    }

    /// Acquire the exclusive lock, giving up after `timeout`.
    pub fn try_write_for(self: &Arc<Self>, timeout: Duration) -> StorageResult<Option<WriteGuard>> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.reenter_write(me)? {
            return Ok(Some(WriteGuard::new(Arc::clone(self))));
        }

        state.waiting_writers += 1;
        while state.write_blocked() {
            if self.cond.wait_until(&mut state, deadline).timed_out() && state.write_blocked() {
                state.waiting_writers -= 1;
                // readers queued behind us may proceed now
                self.cond.notify_all();
                return Ok(None);
            }
        }
        state.waiting_writers -= 1;
        state.writer = Some((me, 1));
        Ok(Some(WriteGuard::new(Arc::clone(self))))
    }

    /// Release one read hold of the calling thread.
    pub fn unlock_read(&self) -> StorageResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let Some(holds) = state.readers.get_mut(&me) else {
            tracing::warn!("read lock released by a thread that does not hold it");
            return Err(StorageError::lock_misuse("read lock is not held by this thread"));
        };
        *holds -= 1;
        if *holds == 0 {
            state.readers.remove(&me);
            if state.readers.is_empty() {
                self.cond.notify_all();
            }
        }
        Ok(())
    }

    /// Release one write hold of the calling thread.
    pub fn unlock_write(&self) -> StorageResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.writer.as_mut() {
            Some((owner, holds)) if *owner == me => {
                *holds -= 1;
                if *holds == 0 {
                    state.writer = None;
                    self.cond.notify_all();
                }
                Ok(())
            }
            _ => {
                tracing::warn!("write lock released by a thread that does not hold it");
                Err(StorageError::lock_misuse("write lock is not held by this thread"))
            }
        }
    }

    /// true if the calling thread owns the write lock
    pub fn is_write_held_by_current_thread(&self) -> bool {
        self.state.lock().holds_write(thread::current().id())
    }

    /// true if any thread owns the write lock
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// number of threads currently holding a read lock
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }
}

impl fmt::Debug for FieldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FieldLock")
            .field("write_locked", &state.writer.is_some())
            .field("readers", &state.readers.len())
            .field("waiting_writers", &state.waiting_writers)
            .finish()
    }
}

/// Scoped shared hold on a [`FieldLock`].
///
/// Not `Send`: the hold belongs to the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard {
    lock: Option<Arc<FieldLock>>,
    _not_send: PhantomData<*const ()>,
}

impl ReadGuard {
    fn new(lock: Arc<FieldLock>) -> Self {
        Self {
            lock: Some(lock),
            _not_send: PhantomData,
        }
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) -> StorageResult<()> {
        match self.lock.take() {
            Some(lock) => lock.unlock_read(),
            None => Err(StorageError::lock_misuse("read guard already released")),
        }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.unlock_read() {
                release_failed(e);
            }
        }
    }
}

impl fmt::Debug for ReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").finish_non_exhaustive()
    }
}

/// Scoped exclusive hold on a [`FieldLock`].
///
/// Not `Send`: the hold belongs to the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    lock: Option<Arc<FieldLock>>,
    _not_send: PhantomData<*const ()>,
}

impl WriteGuard {
    fn new(lock: Arc<FieldLock>) -> Self {
        Self {
            lock: Some(lock),
            _not_send: PhantomData,
        }
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) -> StorageResult<()> {
        match self.lock.take() {
            Some(lock) => lock.unlock_write(),
            None => Err(StorageError::lock_misuse("write guard already released")),
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.unlock_write() {
                release_failed(e);
            }
        }
    }
}

impl fmt::Debug for WriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").finish_non_exhaustive()
    }
}

/// A guard whose hold vanished underneath it means someone released the
/// lock by hand. That is a defect in the caller, so surface it loudly unless
/// we are already unwinding.
fn release_failed(err: StorageError) {
    tracing::error!(error = %err, "guard release failed");
    if !thread::panicking() {
        panic!("{}", err);
    }
}
