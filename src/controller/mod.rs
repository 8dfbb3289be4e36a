//! Simulation controller shared by every engine.
//!
//! The controller owns one engine instance and drives it through
//! Idle → Running → Paused → Idle. Each actor of the engine runs on its own OS
//! thread for the duration of a run. `reset` stops the run signal, closes the
//! engine's primitives so blocked waits abort, joins every worker and restores
//! the engine's initial state.
//!
//! A worker that returns an invariant violation halts the whole engine: the
//! fault is recorded, the run is stopped and the controller reports
//! [`Phase::Halted`] until the next `reset` or `configure`.

/// Per-actor run signal and context.
pub mod context;

pub use context::{ActorContext, ActorId, Role};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, SimError, SimResult};
use crate::event::{EngineKind, EventBus, EventLevel, EventStream, RunId};

use context::RunSignal;

/// An engine that the controller can run.
///
/// Implementations own every shared resource of the simulation and expose
/// them to actors only through `run_actor`.
pub trait Simulation: Send + Sync + Sized + 'static {
    /// Engine configuration.
    type Config: Clone + fmt::Debug + Send + Sync + 'static;
    /// Engine-specific part of [`EngineState`].
    type Snapshot: Clone + fmt::Debug + Serialize;

    /// Which engine this is.
    const KIND: EngineKind;

    /// Validates `config` and builds a fresh engine.
    fn build(config: &Self::Config) -> SimResult<Self>;

    /// Short description of a configuration for lifecycle events.
    fn describe(config: &Self::Config) -> String;

    /// Every worker a run needs.
    fn actors(&self) -> Vec<ActorId>;

    /// The worker loop of `actor`. Returns when the run stops, on a
    /// contained failure, or when the actor has nothing left to do.
    fn run_actor(&self, actor: ActorId, ctx: &ActorContext) -> SimResult<()>;

    /// Closes every blocking primitive so waiting actors abort.
    fn abort_waits(&self);

    /// Restores the initial state. Only called with no worker running.
    fn restore(&self);

    /// Reads the engine's current state.
    fn snapshot(&self) -> Self::Snapshot;
}

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No run in progress; state is at its initial values.
    Idle,
    /// Workers are progressing.
    Running,
    /// Workers are suspended at the top of their loops.
    Paused,
    /// An invariant violation stopped the run; only `reset` or `configure`
    /// leave this phase.
    Halted,
}

/// Outcome of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transition {
    /// The operation changed the lifecycle.
    Applied,
    /// Nothing to do in the current phase.
    NoOp,
}

impl Transition {
    /// Returns true for [`Transition::Applied`].
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Point-in-time view of a controller and its engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineState<T> {
    /// Engine kind.
    pub engine: EngineKind,
    /// Lifecycle phase when the snapshot was taken.
    pub phase: Phase,
    /// Current run, if any.
    pub run_id: Option<RunId>,
    /// Reason the engine halted, if it did.
    pub fault: Option<String>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Engine-specific state.
    pub state: T,
}

#[derive(Debug, Default)]
struct FaultSlot(Mutex<Option<String>>);

impl FaultSlot {
    fn record(&self, reason: String) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Worker {
    actor: ActorId,
    handle: JoinHandle<()>,
}

struct ActiveRun {
    id: RunId,
    signal: Arc<RunSignal>,
    fault: Arc<FaultSlot>,
    workers: Vec<Worker>,
}

struct ControllerState<S: Simulation> {
    phase: Phase,
    config: S::Config,
    sim: Arc<S>,
    run: Option<ActiveRun>,
}

impl<S: Simulation> ControllerState<S> {
    fn fault(&self) -> Option<String> {
        self.run.as_ref().and_then(|run| run.fault.get())
    }

    fn effective_phase(&self) -> Phase {
        match self.phase {
            Phase::Running | Phase::Paused if self.fault().is_some() => Phase::Halted,
            phase => phase,
        }
    }
}

/// Lifecycle controller for one engine.
pub struct SimulationController<S: Simulation> {
    events: Arc<EventBus>,
    state: Mutex<ControllerState<S>>,
}

impl<S: Simulation> SimulationController<S> {
    /// Builds the engine from `config`. The controller starts Idle.
    pub fn new(config: S::Config) -> SimResult<Self> {
        let sim = S::build(&config)?;
        Ok(Self {
            events: Arc::new(EventBus::new(S::KIND)),
            state: Mutex::new(ControllerState {
                phase: Phase::Idle,
                config,
                sim: Arc::new(sim),
                run: None,
            }),
        })
    }

    /// Starts a run from Idle or resumes a paused one.
    pub fn start(&self) -> SimResult<Transition> {
        let mut state = self.lock("start")?;
        match state.effective_phase() {
            Phase::Running => Ok(Transition::NoOp),
            Phase::Halted => Err(SimError::Execution(ExecutionError::Halted {
                engine: S::KIND,
                reason: state.fault().unwrap_or_default(),
            })),
            Phase::Paused => {
                if let Some(run) = &state.run {
                    run.signal.resume();
                }
                state.phase = Phase::Running;
                self.publish(&state, EventLevel::Info, "simulation resumed");
                Ok(Transition::Applied)
            }
            Phase::Idle => {
                self.spawn_run(&mut state)?;
                Ok(Transition::Applied)
            }
        }
    }

    /// Suspends a running simulation at the top of each actor's loop.
    pub fn pause(&self) -> SimResult<Transition> {
        let mut state = self.lock("pause")?;
        if state.effective_phase() != Phase::Running {
            return Ok(Transition::NoOp);
        }
        if let Some(run) = &state.run {
            run.signal.pause();
        }
        state.phase = Phase::Paused;
        self.publish(&state, EventLevel::Info, "simulation paused");
        Ok(Transition::Applied)
    }

    /// Stops every worker, even blocked ones, and restores the initial state.
    /// Idempotent.
    pub fn reset(&self) -> SimResult<Transition> {
        let mut state = self.lock("reset")?;
        let before = state.effective_phase();
        self.teardown(&mut state);
        self.publish(&state, EventLevel::Info, "simulation reset");
        Ok(if before == Phase::Idle {
            Transition::NoOp
        } else {
            Transition::Applied
        })
    }

    /// Replaces the configuration.
    ///
    /// An invalid configuration is rejected without touching the current run.
    /// Otherwise a live run is reset first and, if it was running, restarted
    /// under the new configuration, so no actor ever mixes two protocols.
    pub fn configure(&self, config: S::Config) -> SimResult<Transition> {
        let sim = S::build(&config)?;
        let mut state = self.lock("configure")?;
        let before = state.effective_phase();
        if before != Phase::Idle {
            self.teardown(&mut state);
        }
        state.sim = Arc::new(sim);
        state.config = config;
        let message = format!("configured: {}", S::describe(&state.config));
        self.publish(&state, EventLevel::Info, message);
        if before == Phase::Running {
            self.spawn_run(&mut state)?;
        }
        Ok(Transition::Applied)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SimResult<Phase> {
        Ok(self.lock("phase")?.effective_phase())
    }

    /// Current configuration.
    pub fn config(&self) -> SimResult<S::Config> {
        Ok(self.lock("config")?.config.clone())
    }

    /// The engine instance currently driven by the controller.
    pub fn engine(&self) -> SimResult<Arc<S>> {
        Ok(Arc::clone(&self.lock("engine")?.sim))
    }

    /// Reads the controller phase and the engine state.
    ///
    /// The controller lock is held only to read the phase; the engine snapshot
    /// itself is taken afterwards.
    pub fn snapshot(&self) -> SimResult<EngineState<S::Snapshot>> {
        let (sim, phase, run_id, fault) = {
            let state = self.lock("snapshot")?;
            (
                Arc::clone(&state.sim),
                state.effective_phase(),
                state.run.as_ref().map(|run| run.id),
                state.fault(),
            )
        };
        Ok(EngineState {
            engine: S::KIND,
            phase,
            run_id,
            fault,
            taken_at: Utc::now(),
            state: sim.snapshot(),
        })
    }

    /// Subscribes to the engine's events.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Events lost because a subscriber fell behind.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped_events()
    }

    fn spawn_run(&self, state: &mut ControllerState<S>) -> SimResult<()> {
        let run_id = RunId::new();
        let signal = Arc::new(RunSignal::new());
        let fault = Arc::new(FaultSlot::default());
        let actors = state.sim.actors();

        let mut workers = Vec::with_capacity(actors.len());
        for actor in actors {
            let sim = Arc::clone(&state.sim);
            let fault_slot = Arc::clone(&fault);
            let ctx = ActorContext::new(actor, Some(run_id), Arc::clone(&signal), Arc::clone(&self.events));
            let spawned = thread::Builder::new()
                .name(format!("syncsim-{}-{actor}", S::KIND))
                .spawn(move || worker_main(sim.as_ref(), &ctx, &fault_slot));
            match spawned {
                Ok(handle) => workers.push(Worker { actor, handle }),
                Err(err) => {
                    state.run = Some(ActiveRun {
                        id: run_id,
                        signal,
                        fault,
                        workers,
                    });
                    self.teardown(state);
                    return Err(SimError::Execution(ExecutionError::WorkerSpawn {
                        worker: actor.to_string(),
                        message: err.to_string(),
                    }));
                }
            }
        }

        state.run = Some(ActiveRun {
            id: run_id,
            signal,
            fault,
            workers,
        });
        state.phase = Phase::Running;
        let message = format!("simulation started: {}", S::describe(&state.config));
        self.publish(state, EventLevel::Info, message);
        Ok(())
    }

    fn teardown(&self, state: &mut ControllerState<S>) {
        if let Some(run) = state.run.take() {
            run.signal.stop();
            state.sim.abort_waits();
            for worker in run.workers {
                if worker.handle.join().is_err() {
                    tracing::warn!(engine = %S::KIND, actor = %worker.actor, run_id = %run.id, "worker panicked");
                }
            }
        }
        state.sim.restore();
        state.phase = Phase::Idle;
    }

    fn publish(&self, state: &ControllerState<S>, level: EventLevel, message: impl Into<String>) {
        let run_id = state.run.as_ref().map(|run| run.id);
        self.events.publish(level, run_id, None, message);
    }

    fn lock(&self, context: &str) -> SimResult<MutexGuard<'_, ControllerState<S>>> {
        self.state
            .lock()
            .map_err(|_| SimError::internal(format!("poisoned lock: controller.{context}")))
    }
}

impl<S: Simulation> fmt::Debug for SimulationController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationController")
            .field("engine", &S::KIND)
            .field("phase", &self.phase().ok())
            .finish_non_exhaustive()
    }
}

impl<S: Simulation> Drop for SimulationController<S> {
    fn drop(&mut self) {
        // Deterministic shutdown: abort blocked waits and join every worker.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = state.run.take() {
            run.signal.stop();
            state.sim.abort_waits();
            for worker in run.workers {
                let _ = worker.handle.join();
            }
        }
    }
}

fn worker_main<S: Simulation>(sim: &S, ctx: &ActorContext, fault: &FaultSlot) {
    let actor = ctx.actor();
    tracing::debug!(engine = %S::KIND, %actor, "worker started");
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| sim.run_actor(actor, ctx))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            ctx.warn(format!("actor panicked: {}", panic_message(payload.as_ref())));
            return;
        }
    };
    match outcome {
        Ok(()) => ctx.debug("finished"),
        Err(err) if err.is_cancellation() => {
            tracing::debug!(engine = %S::KIND, %actor, "worker stopped");
        }
        Err(err) if err.is_invariant_violation() => {
            let reason = err.to_string();
            ctx.emit(EventLevel::Error, format!("engine halted: {reason}"));
            fault.record(reason);
            ctx.stop();
            sim.abort_waits();
        }
        Err(err) => ctx.warn(format!("actor failed: {err}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
