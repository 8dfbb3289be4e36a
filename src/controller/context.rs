//! Per-actor execution context.
//!
//! A [`RunSignal`] carries the Running/Paused/Stopped state of one run. Actors
//! block on its condition variable while paused and wake immediately when the
//! run is stopped, so neither pausing nor simulated work burns CPU.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{SimResult, SyncError};
use crate::event::{EventBus, EventLevel, RunId};
use crate::timing::DelayRange;

/// The part an actor plays in its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Dining philosopher.
    Philosopher,
    /// Buffer producer.
    Producer,
    /// Buffer consumer.
    Consumer,
    /// Shared-resource reader.
    Reader,
    /// Shared-resource writer.
    Writer,
    /// Background sampler that watches the engine, e.g. the deadlock observer.
    Observer,
}

/// Identity of one worker within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    /// Role of the actor.
    pub role: Role,
    /// Index among actors of the same role.
    pub index: usize,
}

impl ActorId {
    /// Creates an actor id.
    #[must_use]
    pub const fn new(role: Role, index: usize) -> Self {
        Self { role, index }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::Philosopher => write!(f, "P{}", self.index),
            Role::Producer => write!(f, "producer-{}", self.index),
            Role::Consumer => write!(f, "consumer-{}", self.index),
            Role::Reader => write!(f, "reader-{}", self.index),
            Role::Writer => write!(f, "writer-{}", self.index),
            Role::Observer => write!(f, "observer-{}", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Shared Running/Paused/Stopped flag for the workers of one run.
#[derive(Debug)]
pub(crate) struct RunSignal {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl RunSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Running),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn pause(&self) {
        self.set(RunState::Paused);
    }

    pub(crate) fn resume(&self) {
        self.set(RunState::Running);
    }

    pub(crate) fn stop(&self) {
        self.set(RunState::Stopped);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.lock() == RunState::Stopped
    }

    /// Blocks while paused; fails once stopped.
    fn checkpoint(&self) -> Result<(), SyncError> {
        let mut state = self.lock();
        while *state == RunState::Paused {
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if *state == RunState::Stopped {
            return Err(stopped());
        }
        Ok(())
    }

    /// Sleeps for `duration` unless the run is stopped first. Pausing does
    /// not cut a sleep short.
    fn sleep(&self, duration: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if *state == RunState::Stopped {
                return Err(stopped());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn set(&self, next: RunState) {
        let mut state = self.lock();
        // Stopped is terminal for a signal; a new run gets a new signal.
        if *state != RunState::Stopped {
            *state = next;
        }
        drop(state);
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stopped() -> SyncError {
    SyncError::Aborted {
        primitive: "run-signal".to_string(),
    }
}

/// What an actor's worker loop uses to cooperate with the controller.
#[derive(Debug, Clone)]
pub struct ActorContext {
    actor: ActorId,
    run_id: Option<RunId>,
    signal: Arc<RunSignal>,
    events: Arc<EventBus>,
}

impl ActorContext {
    pub(crate) fn new(
        actor: ActorId,
        run_id: Option<RunId>,
        signal: Arc<RunSignal>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            actor,
            run_id,
            signal,
            events,
        }
    }

    /// A context not attached to any controller, for driving an engine by hand.
    /// It stays Running until [`ActorContext::stop`] is called.
    #[must_use]
    pub fn detached(actor: ActorId, events: Arc<EventBus>) -> Self {
        Self::new(actor, None, Arc::new(RunSignal::new()), events)
    }

    /// The actor this context belongs to.
    #[must_use]
    pub const fn actor(&self) -> ActorId {
        self.actor
    }

    /// Top-of-loop suspension point: blocks while the run is paused and
    /// returns a cancellation error once it is stopped.
    pub fn checkpoint(&self) -> SimResult<()> {
        Ok(self.signal.checkpoint()?)
    }

    /// Simulated work: sleeps for a random duration from `range`.
    pub fn delay(&self, range: &DelayRange) -> SimResult<()> {
        let duration = range.sample(&mut rand::thread_rng());
        Ok(self.signal.sleep(duration)?)
    }

    /// Returns true once the run has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Stops the run this context belongs to.
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Publishes a fine-grained transition.
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(EventLevel::Debug, message);
    }

    /// Publishes a notable transition.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(EventLevel::Info, message);
    }

    /// Publishes an advisory warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(EventLevel::Warn, message);
    }

    /// Publishes an event attributed to this actor.
    pub fn emit(&self, level: EventLevel, message: impl Into<String>) {
        let actor = self.actor.to_string();
        self.events.publish(level, self.run_id, Some(&actor), message);
    }
}
