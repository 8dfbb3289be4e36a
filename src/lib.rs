//! # syncsim - Concurrency Simulation Engines
//!
//! Three classic coordination problems, each run by real OS threads over
//! abortable synchronization primitives and observable while they run:
//!
//! - **Dining Philosophers**: N philosophers and N forks on a ring, with a
//!   choice of acquisition strategy ([`DiningStrategy`]).
//! - **Producer-Consumer**: a bounded ring buffer coordinated by two counting
//!   semaphores and a mutex ([`BoundedBuffer`]).
//! - **Readers-Writers**: a shared resource with a choice of admission policy
//!   ([`AccessPolicy`]).
//!
//! Every engine is driven by a [`SimulationController`] that owns the worker
//! threads and exposes start / pause / reset, consistent snapshots and a
//! stream of [`SimEvent`]s.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use syncsim::{DiningConfig, DiningStrategy, DiningTable};
//!
//! let table = DiningTable::new(DiningConfig {
//!     strategy: DiningStrategy::AtomicBothForks,
//!     ..DiningConfig::default()
//! })?;
//! let events = table.events();
//! table.start()?;
//! while let Ok(event) = events.recv() {
//!     println!("{event}");
//! }
//! # Ok::<(), syncsim::SimError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Ambient: errors, timing, events
pub mod error;
pub mod event;
pub mod timing;

// Primitives and lifecycle
pub mod controller;
pub mod sync;

// Engines
pub mod buffer;
pub mod dining;
pub mod readers_writers;

pub use buffer::{
    BoundedBuffer, BufferConfig, BufferSnapshot, BufferTiming, Item, ProducerConsumerSim,
    WorkerState,
};
pub use controller::{
    ActorContext, ActorId, EngineState, Phase, Role, Simulation, SimulationController, Transition,
};
pub use dining::{
    is_deadlocked, DiningConfig, DiningPhilosophers, DiningSnapshot, DiningStrategy, DiningTable,
    DiningTiming, ForkView, PhilosopherState, PhilosopherView,
};
pub use error::{ExecutionError, SimError, SimResult, SyncError, ValidationError};
pub use event::{EngineKind, EventBus, EventLevel, EventStream, RunId, SimEvent};
pub use readers_writers::{
    AccessPolicy, AccessState, ReadersWriters, ReadersWritersConfig, ReadersWritersSim,
    ReadersWritersSnapshot, ReadersWritersTiming,
};
pub use timing::DelayRange;
