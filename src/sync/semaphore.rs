//! Counting semaphore with abortable waits.
//!
//! `acquire` blocks on a condition variable until a permit is available.
//! `close` wakes every waiter; a waiter woken by `close` returns
//! [`SyncError::Aborted`] and owns no permit, so the permit count is never
//! disturbed by a cancelled wait.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::SyncError;

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    name: &'static str,
    state: Mutex<SemaphoreState>,
    available: Condvar,
    initial: usize,
}

#[derive(Debug)]
struct SemaphoreState {
    permits: usize,
    closed: bool,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    #[must_use]
    pub fn new(name: &'static str, permits: usize) -> Self {
        Self {
            name,
            state: Mutex::new(SemaphoreState {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
            initial: permits,
        }
    }

    /// Name used in errors and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Permits currently available.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.lock().permits
    }

    /// Permit count the semaphore was created with.
    #[must_use]
    pub const fn initial_permits(&self) -> usize {
        self.initial
    }

    /// Returns true once `close` has been called and not yet undone by `reset`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes one permit, blocking while none is available.
    pub fn acquire(&self) -> Result<Permit<'_>, SyncError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(self.aborted());
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(Permit { semaphore: self });
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes one permit if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut state = self.lock();
        if state.closed || state.permits == 0 {
            return None;
        }
        state.permits -= 1;
        Some(Permit { semaphore: self })
    }

    /// Adds one permit and wakes a waiter.
    pub fn release(&self) {
        let mut state = self.lock();
        state.permits += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Wakes every waiter with [`SyncError::Aborted`]. Later acquires fail
    /// until [`Semaphore::reset`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Reopens the semaphore with its initial permit count.
    ///
    /// Only call once every holder has gone away; outstanding permits released
    /// afterwards would push the count above the initial value.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.permits = self.initial;
        state.closed = false;
    }

    fn aborted(&self) -> SyncError {
        SyncError::Aborted {
            primitive: self.name.to_string(),
        }
    }

    // The state is two plain fields updated in single assignments, so a
    // poisoned guard still holds a coherent value.
    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One permit of a [`Semaphore`]. Released on drop.
#[derive(Debug)]
#[must_use = "permit will be immediately released if not held"]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Permit<'_> {
    /// Consumes the permit without returning it to its semaphore.
    ///
    /// Used when the matching release happens on a different semaphore, as
    /// with the empty/full slot pair of a bounded buffer.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new("test", 2);
        let a = sem.acquire().unwrap();
        let b = sem.try_acquire().unwrap();
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());
        drop(a);
        assert_eq!(sem.available_permits(), 1);
        drop(b);
        assert_eq!(sem.available_permits(), 2);
    }

    #[test]
    fn forget_moves_permit_out() {
        let empty = Semaphore::new("empty", 1);
        let full = Semaphore::new("full", 0);
        empty.acquire().unwrap().forget();
        full.release();
        assert_eq!(empty.available_permits(), 0);
        assert_eq!(full.available_permits(), 1);
    }

    #[test]
    fn release_wakes_blocked_acquire() {
        let sem = Arc::new(Semaphore::new("gate", 0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire().map(Permit::forget))
        };
        thread::sleep(Duration::from_millis(20));
        sem.release();
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(sem.available_permits(), 0);
    }

    #[test]
    fn close_aborts_blocked_acquire_without_taking_a_permit() {
        let sem = Arc::new(Semaphore::new("full-slots", 0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire().map(Permit::forget))
        };
        thread::sleep(Duration::from_millis(20));
        sem.close();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(
            err,
            SyncError::Aborted {
                primitive: "full-slots".to_string()
            }
        );
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.try_acquire().is_none());
    }

    #[test]
    fn reset_restores_initial_count_and_reopens() {
        let sem = Semaphore::new("diners", 4);
        sem.acquire().unwrap().forget();
        sem.acquire().unwrap().forget();
        sem.close();
        assert!(sem.is_closed());

        sem.reset();
        assert!(!sem.is_closed());
        assert_eq!(sem.available_permits(), 4);
        assert_eq!(sem.initial_permits(), 4);
    }
}
