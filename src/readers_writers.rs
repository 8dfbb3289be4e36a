//! Reader-Writer Engine.
//!
//! R readers and W writers share one resource guarded by a
//! [`SharedExclusiveLock`]. The [`AccessPolicy`] decides how actors are
//! admitted:
//!
//! - `ReaderPriority`: readers take shared access directly. Writers first pass
//!   a one-permit writer gate. A steady stream of readers can starve writers.
//! - `WriterPriority`: readers first pass a reader gate sized to the reader
//!   count. The lock runs with writer preference, so once a writer waits, new
//!   readers queue until it has written.
//! - `Fair`: both sides only ever try-lock and back off for a fixed delay on
//!   failure. Uniform retry pressure approximates fairness; there is no FIFO
//!   queue and unlucky timing can still starve an actor.
//!
//! Independently of the lock, the engine keeps a ledger of active readers and
//! writers that is checked on every entry. A writer entering while anyone is
//! active, or a reader entering while a writer is, halts the engine.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::controller::{ActorContext, ActorId, Role, Simulation, SimulationController, Transition};
use crate::error::{SimError, SimResult, ValidationError};
use crate::event::EngineKind;
use crate::sync::{ExclusiveGuard, Permit, Semaphore, SharedExclusiveLock, SharedGuard};
use crate::timing::DelayRange;

/// Admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPolicy {
    /// Readers never wait for queued writers; writers may starve.
    ReaderPriority,
    /// Queued writers hold back new readers; readers may starve.
    WriterPriority,
    /// Try-lock with fixed back-off on both sides.
    Fair,
}

impl AccessPolicy {
    /// All policies.
    pub const ALL: [Self; 3] = [Self::ReaderPriority, Self::WriterPriority, Self::Fair];

    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReaderPriority => "reader-priority",
            Self::WriterPriority => "writer-priority",
            Self::Fair => "fair",
        }
    }
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reader-priority" | "readers" => Ok(Self::ReaderPriority),
            "writer-priority" | "writers" => Ok(Self::WriterPriority),
            "fair" => Ok(Self::Fair),
            _ => Err(ValidationError::UnknownVariant {
                kind: "access policy".to_string(),
                value: s.to_string(),
                expected: Self::ALL.map(Self::as_str).join(", "),
            }),
        }
    }
}

/// Reader or writer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessState {
    /// Not interested in the resource.
    Thinking,
    /// Trying to get in.
    Waiting,
    /// Reading (readers only).
    Reading,
    /// Writing (writers only).
    Writing,
}

/// Simulated-work delays of the reader-writer engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadersWritersTiming {
    pub reader_think: DelayRange,
    pub read: DelayRange,
    pub writer_think: DelayRange,
    pub write: DelayRange,
    /// Back-off after a failed attempt under [`AccessPolicy::Fair`].
    pub retry: DelayRange,
}

impl Default for ReadersWritersTiming {
    fn default() -> Self {
        Self {
            reader_think: DelayRange::new(1000, 3000),
            read: DelayRange::new(1500, 3500),
            writer_think: DelayRange::new(1500, 3500),
            write: DelayRange::new(2000, 4000),
            retry: DelayRange::fixed(500),
        }
    }
}

/// Reader-writer engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadersWritersConfig {
    /// Number of readers. At least 1.
    pub readers: usize,
    /// Number of writers. At least 1.
    pub writers: usize,
    /// Admission policy.
    pub policy: AccessPolicy,
    /// Simulated-work delays.
    pub timing: ReadersWritersTiming,
}

impl Default for ReadersWritersConfig {
    fn default() -> Self {
        Self {
            readers: 3,
            writers: 2,
            policy: AccessPolicy::ReaderPriority,
            timing: ReadersWritersTiming::default(),
        }
    }
}

impl ReadersWritersConfig {
    /// Checks counts and delay ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, actual) in [("readers", self.readers), ("writers", self.writers)] {
            if actual < 1 {
                return Err(ValidationError::TooSmall {
                    field: field.to_string(),
                    min: 1,
                    actual,
                });
            }
        }
        let t = &self.timing;
        t.reader_think.validate("reader_think")?;
        t.read.validate("read")?;
        t.writer_think.validate("writer_think")?;
        t.write.validate("write")?;
        t.retry.validate("retry")?;
        Ok(())
    }
}

/// Point-in-time view of the shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadersWritersSnapshot {
    /// Active policy.
    pub policy: AccessPolicy,
    /// Reader states by index.
    pub readers: Vec<AccessState>,
    /// Writer states by index.
    pub writers: Vec<AccessState>,
    /// Readers currently reading.
    pub active_readers: usize,
    /// Whether a writer is writing.
    pub writing: bool,
    /// Writers currently writing; never above 1.
    pub active_writers: usize,
    /// Writers blocked waiting for exclusive access.
    pub waiting_writers: usize,
    /// Completed reads.
    pub total_reads: u64,
    /// Completed writes.
    pub total_writes: u64,
    /// Most readers ever reading at once in this run.
    pub peak_concurrent_readers: usize,
}

impl ReadersWritersSnapshot {
    /// True if this snapshot shows the exclusion invariant broken.
    #[must_use]
    pub const fn violates_exclusion(&self) -> bool {
        self.active_writers > 1 || (self.writing && self.active_readers > 0)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    active_readers: usize,
    active_writers: usize,
    peak_readers: usize,
}

/// Shared access plus any gate permit taken to get it. Field order is
/// release order: lock first, then gate.
struct ReadAccess<'a> {
    _guard: SharedGuard<'a>,
    _gate: Option<Permit<'a>>,
}

/// Exclusive access plus any gate permit taken to get it.
struct WriteAccess<'a> {
    _guard: ExclusiveGuard<'a>,
    _gate: Option<Permit<'a>>,
}

/// The reader-writer engine driven by a [`ReadersWritersSim`] controller.
#[derive(Debug)]
pub struct ReadersWriters {
    config: ReadersWritersConfig,
    lock: SharedExclusiveLock,
    writer_gate: Semaphore,
    reader_gate: Semaphore,
    ledger: Mutex<Ledger>,
    reader_states: Mutex<Vec<AccessState>>,
    writer_states: Mutex<Vec<AccessState>>,
    total_reads: AtomicU64,
    total_writes: AtomicU64,
}

impl ReadersWriters {
    fn admit_reader(&self) -> SimResult<Option<ReadAccess<'_>>> {
        Ok(match self.config.policy {
            AccessPolicy::ReaderPriority => Some(ReadAccess {
                _guard: self.lock.read()?,
                _gate: None,
            }),
            AccessPolicy::WriterPriority => {
                let gate = self.reader_gate.acquire()?;
                Some(ReadAccess {
                    _guard: self.lock.read()?,
                    _gate: Some(gate),
                })
            }
            AccessPolicy::Fair => self.lock.try_read().map(|guard| ReadAccess {
                _guard: guard,
                _gate: None,
            }),
        })
    }

    fn admit_writer(&self) -> SimResult<Option<WriteAccess<'_>>> {
        Ok(match self.config.policy {
            AccessPolicy::ReaderPriority => {
                let gate = self.writer_gate.acquire()?;
                Some(WriteAccess {
                    _guard: self.lock.write()?,
                    _gate: Some(gate),
                })
            }
            AccessPolicy::WriterPriority => Some(WriteAccess {
                _guard: self.lock.write()?,
                _gate: None,
            }),
            AccessPolicy::Fair => self.lock.try_write().map(|guard| WriteAccess {
                _guard: guard,
                _gate: None,
            }),
        })
    }

    fn begin_read(&self, reader: usize) -> SimResult<usize> {
        let mut ledger = self.ledger()?;
        if ledger.active_writers > 0 {
            return Err(SimError::invariant(
                Self::KIND,
                format!("reader-{reader} admitted while a writer is active"),
            ));
        }
        ledger.active_readers += 1;
        ledger.peak_readers = ledger.peak_readers.max(ledger.active_readers);
        set_state(&self.reader_states, reader, AccessState::Reading);
        Ok(ledger.active_readers)
    }

    fn end_read(&self, reader: usize) -> SimResult<usize> {
        let mut ledger = self.ledger()?;
        if ledger.active_readers == 0 {
            return Err(SimError::invariant(
                Self::KIND,
                format!("reader-{reader} left with no active readers recorded"),
            ));
        }
        ledger.active_readers -= 1;
        self.total_reads.fetch_add(1, Ordering::AcqRel);
        set_state(&self.reader_states, reader, AccessState::Thinking);
        Ok(ledger.active_readers)
    }

    fn begin_write(&self, writer: usize) -> SimResult<()> {
        let mut ledger = self.ledger()?;
        if ledger.active_writers > 0 || ledger.active_readers > 0 {
            return Err(SimError::invariant(
                Self::KIND,
                format!(
                    "writer-{writer} admitted with {} writer(s) and {} reader(s) active",
                    ledger.active_writers, ledger.active_readers
                ),
            ));
        }
        ledger.active_writers = 1;
        set_state(&self.writer_states, writer, AccessState::Writing);
        Ok(())
    }

    fn end_write(&self, writer: usize) -> SimResult<()> {
        let mut ledger = self.ledger()?;
        if ledger.active_writers != 1 {
            return Err(SimError::invariant(
                Self::KIND,
                format!("writer-{writer} left with {} writers recorded", ledger.active_writers),
            ));
        }
        ledger.active_writers = 0;
        self.total_writes.fetch_add(1, Ordering::AcqRel);
        set_state(&self.writer_states, writer, AccessState::Thinking);
        Ok(())
    }

    fn run_reader(&self, reader: usize, ctx: &ActorContext) -> SimResult<()> {
        let timing = &self.config.timing;
        loop {
            ctx.checkpoint()?;
            set_state(&self.reader_states, reader, AccessState::Thinking);
            ctx.debug("thinking");
            ctx.delay(&timing.reader_think)?;

            set_state(&self.reader_states, reader, AccessState::Waiting);
            ctx.debug("wants to read");
            let access = loop {
                if let Some(access) = self.admit_reader()? {
                    break access;
                }
                ctx.delay(&timing.retry)?;
                ctx.checkpoint()?;
            };

            let active = self.begin_read(reader)?;
            ctx.info(format!("reading ({active} active reader(s))"));
            ctx.delay(&timing.read)?;
            let remaining = self.end_read(reader)?;
            drop(access);
            ctx.info(format!("finished reading ({remaining} still reading)"));
        }
    }

    fn run_writer(&self, writer: usize, ctx: &ActorContext) -> SimResult<()> {
        let timing = &self.config.timing;
        loop {
            ctx.checkpoint()?;
            set_state(&self.writer_states, writer, AccessState::Thinking);
            ctx.debug("thinking");
            ctx.delay(&timing.writer_think)?;

            set_state(&self.writer_states, writer, AccessState::Waiting);
            ctx.debug("wants to write");
            let access = loop {
                if let Some(access) = self.admit_writer()? {
                    break access;
                }
                ctx.delay(&timing.retry)?;
                ctx.checkpoint()?;
            };

            self.begin_write(writer)?;
            ctx.info("writing");
            ctx.delay(&timing.write)?;
            self.end_write(writer)?;
            drop(access);
            ctx.info("finished writing");
        }
    }

    fn ledger(&self) -> SimResult<MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| SimError::internal("poisoned lock: readers_writers.ledger"))
    }
}

impl Simulation for ReadersWriters {
    type Config = ReadersWritersConfig;
    type Snapshot = ReadersWritersSnapshot;

    const KIND: EngineKind = EngineKind::ReadersWriters;

    fn build(config: &ReadersWritersConfig) -> SimResult<Self> {
        config.validate()?;
        let lock = SharedExclusiveLock::new("shared-resource");
        lock.set_writer_preference(config.policy == AccessPolicy::WriterPriority);
        Ok(Self {
            config: config.clone(),
            lock,
            writer_gate: Semaphore::new("writer-gate", 1),
            reader_gate: Semaphore::new("reader-gate", config.readers),
            ledger: Mutex::new(Ledger::default()),
            reader_states: Mutex::new(vec![AccessState::Thinking; config.readers]),
            writer_states: Mutex::new(vec![AccessState::Thinking; config.writers]),
            total_reads: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
        })
    }

    fn describe(config: &ReadersWritersConfig) -> String {
        format!(
            "{} reader(s), {} writer(s), policy {}",
            config.readers, config.writers, config.policy
        )
    }

    fn actors(&self) -> Vec<ActorId> {
        (0..self.config.readers)
            .map(|i| ActorId::new(Role::Reader, i))
            .chain((0..self.config.writers).map(|i| ActorId::new(Role::Writer, i)))
            .collect()
    }

    fn run_actor(&self, actor: ActorId, ctx: &ActorContext) -> SimResult<()> {
        match actor.role {
            Role::Writer => self.run_writer(actor.index, ctx),
            _ => self.run_reader(actor.index, ctx),
        }
    }

    fn abort_waits(&self) {
        self.lock.close();
        self.writer_gate.close();
        self.reader_gate.close();
    }

    fn restore(&self) {
        self.lock.reset();
        self.writer_gate.reset();
        self.reader_gate.reset();
        *lock(&self.ledger) = Ledger::default();
        self.ledger.clear_poison();
        lock(&self.reader_states).fill(AccessState::Thinking);
        lock(&self.writer_states).fill(AccessState::Thinking);
        self.total_reads.store(0, Ordering::Release);
        self.total_writes.store(0, Ordering::Release);
    }

    fn snapshot(&self) -> ReadersWritersSnapshot {
        let (active_readers, active_writers, peak) = {
            let ledger = lock(&self.ledger);
            (ledger.active_readers, ledger.active_writers, ledger.peak_readers)
        };
        ReadersWritersSnapshot {
            policy: self.config.policy,
            readers: lock(&self.reader_states).clone(),
            writers: lock(&self.writer_states).clone(),
            active_readers,
            writing: active_writers > 0,
            active_writers,
            waiting_writers: self.lock.holders().waiting_writers,
            total_reads: self.total_reads.load(Ordering::Acquire),
            total_writes: self.total_writes.load(Ordering::Acquire),
            peak_concurrent_readers: peak,
        }
    }
}

fn set_state(states: &Mutex<Vec<AccessState>>, index: usize, state: AccessState) {
    if let Some(slot) = lock(states).get_mut(index) {
        *slot = state;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller for the reader-writer engine.
pub type ReadersWritersSim = SimulationController<ReadersWriters>;

impl SimulationController<ReadersWriters> {
    /// Swaps the admission policy, resetting (and restarting, if running) the
    /// simulation so no actor mixes two policies.
    pub fn set_policy(&self, policy: AccessPolicy) -> SimResult<Transition> {
        let mut config = self.config()?;
        if config.policy == policy {
            return Ok(Transition::NoOp);
        }
        config.policy = policy;
        self.configure(config)
    }
}
