//! Shared/exclusive lock with abortable waits.
//!
//! The lock guards no data of its own; the reader-writer engine keeps its
//! ledger behind a separate mutex and uses this lock purely for admission.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::SyncError;

/// Current holders of a [`SharedExclusiveLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockHolders {
    /// Number of shared holders.
    pub readers: usize,
    /// Whether the exclusive holder is present.
    pub writer: bool,
    /// Writers blocked in [`SharedExclusiveLock::write`].
    pub waiting_writers: usize,
}

/// A lock admitting many shared holders or one exclusive holder.
#[derive(Debug)]
pub struct SharedExclusiveLock {
    name: &'static str,
    state: Mutex<LockState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
    prefer_writers: bool,
    closed: bool,
}

impl LockState {
    const fn admits_reader(&self) -> bool {
        !self.writer && !(self.prefer_writers && self.waiting_writers > 0)
    }

    const fn admits_writer(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

impl SharedExclusiveLock {
    /// Creates an unlocked lock without writer preference.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        }
    }

    /// When enabled, new shared holders wait while any writer is queued.
    pub fn set_writer_preference(&self, prefer_writers: bool) {
        self.lock().prefer_writers = prefer_writers;
        self.changed.notify_all();
    }

    /// Snapshot of the current holders.
    #[must_use]
    pub fn holders(&self) -> LockHolders {
        let state = self.lock();
        LockHolders {
            readers: state.readers,
            writer: state.writer,
            waiting_writers: state.waiting_writers,
        }
    }

    /// Acquires shared access, blocking while it is not admitted.
    pub fn read(&self) -> Result<SharedGuard<'_>, SyncError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(self.aborted());
            }
            if state.admits_reader() {
                state.readers += 1;
                return Ok(SharedGuard { lock: self });
            }
            state = self.wait(state);
        }
    }

    /// Acquires shared access only if it is admitted right now.
    #[must_use]
    pub fn try_read(&self) -> Option<SharedGuard<'_>> {
        let mut state = self.lock();
        if state.closed || !state.admits_reader() {
            return None;
        }
        state.readers += 1;
        Some(SharedGuard { lock: self })
    }

    /// Acquires exclusive access, blocking until no one else holds the lock.
    pub fn write(&self) -> Result<ExclusiveGuard<'_>, SyncError> {
        let mut state = self.lock();
        state.waiting_writers += 1;
        loop {
            if state.closed {
                state.waiting_writers -= 1;
                drop(state);
                // Readers held back by writer preference may proceed now.
                self.changed.notify_all();
                return Err(self.aborted());
            }
            if state.admits_writer() {
                state.waiting_writers -= 1;
                state.writer = true;
                return Ok(ExclusiveGuard { lock: self });
            }
            state = self.wait(state);
        }
    }

    /// Acquires exclusive access only if the lock is free right now.
    #[must_use]
    pub fn try_write(&self) -> Option<ExclusiveGuard<'_>> {
        let mut state = self.lock();
        if state.closed || !state.admits_writer() {
            return None;
        }
        state.writer = true;
        Some(ExclusiveGuard { lock: self })
    }

    /// Wakes every waiter with [`SyncError::Aborted`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    /// Returns the lock to its unlocked, open state, keeping the preference.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.readers = 0;
        state.writer = false;
        state.waiting_writers = 0;
        state.closed = false;
    }

    fn release_shared(&self) {
        let mut state = self.lock();
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.changed.notify_all();
    }

    fn release_exclusive(&self) {
        self.lock().writer = false;
        self.changed.notify_all();
    }

    fn aborted(&self) -> SyncError {
        SyncError::Aborted {
            primitive: self.name.to_string(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared access to a [`SharedExclusiveLock`]. Released on drop.
#[derive(Debug)]
#[must_use = "shared access is released as soon as the guard drops"]
pub struct SharedGuard<'a> {
    lock: &'a SharedExclusiveLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Exclusive access to a [`SharedExclusiveLock`]. Released on drop.
#[derive(Debug)]
#[must_use = "exclusive access is released as soon as the guard drops"]
pub struct ExclusiveGuard<'a> {
    lock: &'a SharedExclusiveLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
