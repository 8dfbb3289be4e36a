//! Forks, seats and the acquisition strategies.
//!
//! Lock order: fork locks in ascending fork id, then seat state locks. Every
//! transition that ties a philosopher's state to fork ownership (Hungry →
//! Eating on acquisition, Eating → Thinking on release) happens while the
//! philosopher's fork locks are held. A snapshot taken with all fork locks
//! held is therefore a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{SimError, SimResult};
use crate::event::EngineKind;
use crate::sync::Semaphore;

use super::{DiningStrategy, ForkView, PhilosopherState, PhilosopherView};

type Holder<'a> = MutexGuard<'a, Option<usize>>;

#[derive(Debug)]
struct Fork {
    holder: Mutex<Option<usize>>,
}

#[derive(Debug)]
struct Seat {
    left: usize,
    right: usize,
    state: Mutex<PhilosopherState>,
    eat_count: AtomicU64,
}

/// N forks and N seats on a ring, plus the `N-1` permit gate used by
/// [`DiningStrategy::BoundedConcurrentDiners`].
#[derive(Debug)]
pub(crate) struct Table {
    forks: Vec<Fork>,
    seats: Vec<Seat>,
    diners: Semaphore,
}

impl Table {
    pub(crate) fn new(philosophers: usize) -> Self {
        let forks = (0..philosophers)
            .map(|_| Fork {
                holder: Mutex::new(None),
            })
            .collect();
        let seats = (0..philosophers)
            .map(|id| Seat {
                left: id,
                right: (id + 1) % philosophers,
                state: Mutex::new(PhilosopherState::Thinking),
                eat_count: AtomicU64::new(0),
            })
            .collect();
        Self {
            forks,
            seats,
            diners: Semaphore::new("concurrent-diners", philosophers.saturating_sub(1)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.seats.len()
    }

    #[cfg(test)]
    pub(crate) fn diner_permits(&self) -> usize {
        self.diners.available_permits()
    }

    pub(crate) fn set_state(&self, p: usize, state: PhilosopherState) {
        *self.state(p) = state;
    }

    pub(crate) fn eat_count(&self, p: usize) -> u64 {
        self.seats[p].eat_count.load(Ordering::Acquire)
    }

    /// One acquisition attempt by philosopher `p` under `strategy`.
    ///
    /// On success `p` holds both forks and is Eating. On failure `p` holds
    /// nothing. Only the concurrent-diners gate can block, and only that wait
    /// can be aborted.
    pub(crate) fn acquire(&self, p: usize, strategy: DiningStrategy) -> SimResult<bool> {
        match strategy {
            DiningStrategy::NoCoordination => self.take_left_then_right(p),
            DiningStrategy::BoundedConcurrentDiners => {
                let _permit = self.diners.acquire()?;
                self.take_left_then_right(p)
            }
            DiningStrategy::AtomicBothForks => self.take_both(p),
        }
    }

    /// Takes only the left fork, the first half of an uncoordinated attempt.
    pub(crate) fn take_left(&self, p: usize) -> bool {
        let mut left = self.fork(self.seats[p].left);
        if left.is_some() {
            return false;
        }
        *left = Some(p);
        true
    }

    fn take_left_then_right(&self, p: usize) -> SimResult<bool> {
        if !self.take_left(p) {
            return Ok(false);
        }

        let (mut left, mut right) = self.lock_pair(p);
        if *left != Some(p) {
            return Err(SimError::invariant(
                EngineKind::DiningPhilosophers,
                format!("P{p} lost its left fork to {left:?} before taking the right"),
            ));
        }
        if right.is_none() {
            *right = Some(p);
            *self.state(p) = PhilosopherState::Eating;
            return Ok(true);
        }
        *left = None;
        Ok(false)
    }

    fn take_both(&self, p: usize) -> SimResult<bool> {
        let (mut left, mut right) = self.lock_pair(p);
        if left.is_some() || right.is_some() {
            return Ok(false);
        }
        *left = Some(p);
        *right = Some(p);
        *self.state(p) = PhilosopherState::Eating;
        Ok(true)
    }

    /// Ends a meal: releases both forks, counts the meal and returns `p` to
    /// Thinking in one step. Returns the new meal count.
    pub(crate) fn finish_meal(&self, p: usize) -> SimResult<u64> {
        let (mut left, mut right) = self.lock_pair(p);
        if *left != Some(p) || *right != Some(p) {
            return Err(SimError::invariant(
                EngineKind::DiningPhilosophers,
                format!("P{p} finished eating holding left={left:?} right={right:?}"),
            ));
        }
        *left = None;
        *right = None;
        let meals = self.seats[p].eat_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.state(p) = PhilosopherState::Thinking;
        Ok(meals)
    }

    /// Consistent view of every seat and fork.
    pub(crate) fn views(&self) -> (Vec<PhilosopherView>, Vec<ForkView>) {
        let holders: Vec<Holder<'_>> = self.forks.iter().map(|f| lock(&f.holder)).collect();

        let forks = holders
            .iter()
            .enumerate()
            .map(|(id, holder)| ForkView {
                id,
                taken: holder.is_some(),
                holder: **holder,
            })
            .collect();
        let philosophers = self
            .seats
            .iter()
            .enumerate()
            .map(|(id, seat)| PhilosopherView {
                id,
                state: *lock(&seat.state),
                eat_count: seat.eat_count.load(Ordering::Acquire),
                left_fork: seat.left,
                right_fork: seat.right,
            })
            .collect();
        (philosophers, forks)
    }

    pub(crate) fn close(&self) {
        self.diners.close();
    }

    /// Releases every fork, zeroes every meal count and seats everyone back
    /// at Thinking.
    pub(crate) fn restore(&self) {
        for fork in &self.forks {
            *lock(&fork.holder) = None;
        }
        for seat in &self.seats {
            *lock(&seat.state) = PhilosopherState::Thinking;
            seat.eat_count.store(0, Ordering::Release);
        }
        self.diners.reset();
    }

    /// Locks `p`'s two forks lower id first, returning (left, right).
    fn lock_pair(&self, p: usize) -> (Holder<'_>, Holder<'_>) {
        let seat = &self.seats[p];
        if seat.left < seat.right {
            let left = self.fork(seat.left);
            let right = self.fork(seat.right);
            (left, right)
        } else {
            let right = self.fork(seat.right);
            let left = self.fork(seat.left);
            (left, right)
        }
    }

    fn fork(&self, id: usize) -> Holder<'_> {
        lock(&self.forks[id].holder)
    }

    fn state(&self, p: usize) -> MutexGuard<'_, PhilosopherState> {
        lock(&self.seats[p].state)
    }
}

// Fork and seat mutexes guard single `Copy` values, so a poisoned guard still
// holds a coherent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
