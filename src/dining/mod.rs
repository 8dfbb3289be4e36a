//! Dining Table Engine.
//!
//! N philosophers sit around a ring with one fork between each pair of
//! neighbours. Philosopher `i` uses fork `i` on its left and fork
//! `(i + 1) mod N` on its right. Each philosopher cycles
//! Thinking → Hungry → Eating → Thinking, acquiring forks under one of three
//! [`DiningStrategy`] protocols. A background observer flags the
//! all-hungry/all-forks-taken picture of a circular wait.

/// Heuristic deadlock observer.
pub mod observer;
mod table;

pub use observer::is_deadlocked;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::controller::{ActorContext, ActorId, Role, Simulation, SimulationController, Transition};
use crate::error::{SimResult, ValidationError};
use crate::event::EngineKind;
use crate::timing::DelayRange;

use table::Table;

/// Fork acquisition protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiningStrategy {
    /// Try the left fork, then the right; give the left back if the right is
    /// busy. Prevents nothing and can reach the circular-wait picture.
    NoCoordination,
    /// As `NoCoordination`, but at most `N-1` philosophers may attempt at once,
    /// which breaks circular wait.
    BoundedConcurrentDiners,
    /// Take both forks in one step under both fork locks, taken in ascending
    /// fork id order, or take neither.
    AtomicBothForks,
}

impl DiningStrategy {
    /// All strategies.
    pub const ALL: [Self; 3] = [
        Self::NoCoordination,
        Self::BoundedConcurrentDiners,
        Self::AtomicBothForks,
    ];

    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoCoordination => "no-coordination",
            Self::BoundedConcurrentDiners => "bounded-concurrent-diners",
            Self::AtomicBothForks => "atomic-both-forks",
        }
    }
}

impl fmt::Display for DiningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiningStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no-coordination" | "none" => Ok(Self::NoCoordination),
            "bounded-concurrent-diners" | "limit-diners" => Ok(Self::BoundedConcurrentDiners),
            "atomic-both-forks" | "both-forks" => Ok(Self::AtomicBothForks),
            _ => Err(ValidationError::UnknownVariant {
                kind: "dining strategy".to_string(),
                value: s.to_string(),
                expected: Self::ALL.map(Self::as_str).join(", "),
            }),
        }
    }
}

/// Philosopher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhilosopherState {
    /// Not interested in forks.
    Thinking,
    /// Trying to acquire forks.
    Hungry,
    /// Holding both forks.
    Eating,
}

/// Simulated-work delays of the dining engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiningTiming {
    pub think: DelayRange,
    pub eat: DelayRange,
    /// Pause between failed acquisition attempts.
    pub backoff: DelayRange,
}

impl Default for DiningTiming {
    fn default() -> Self {
        Self {
            think: DelayRange::new(1000, 3000),
            eat: DelayRange::new(800, 2300),
            backoff: DelayRange::new(300, 800),
        }
    }
}

/// Dining engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiningConfig {
    /// Number of philosophers, and of forks. At least 2.
    pub philosophers: usize,
    /// Acquisition protocol.
    pub strategy: DiningStrategy,
    /// Simulated-work delays.
    pub timing: DiningTiming,
    /// Deadlock observer sampling interval.
    pub observer_interval_ms: u64,
}

impl Default for DiningConfig {
    fn default() -> Self {
        Self {
            philosophers: 5,
            strategy: DiningStrategy::NoCoordination,
            timing: DiningTiming::default(),
            observer_interval_ms: 100,
        }
    }
}

impl DiningConfig {
    /// Checks counts and delay ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.philosophers < 2 {
            return Err(ValidationError::TooSmall {
                field: "philosophers".to_string(),
                min: 2,
                actual: self.philosophers,
            });
        }
        if self.observer_interval_ms == 0 {
            return Err(ValidationError::Zero {
                field: "observer_interval_ms".to_string(),
            });
        }
        self.timing.think.validate("think")?;
        self.timing.eat.validate("eat")?;
        self.timing.backoff.validate("backoff")?;
        Ok(())
    }
}

/// One philosopher in a [`DiningSnapshot`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhilosopherView {
    pub id: usize,
    pub state: PhilosopherState,
    pub eat_count: u64,
    pub left_fork: usize,
    pub right_fork: usize,
}

/// One fork in a [`DiningSnapshot`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkView {
    pub id: usize,
    pub taken: bool,
    /// Philosopher holding the fork.
    pub holder: Option<usize>,
}

/// Consistent view of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiningSnapshot {
    /// Active strategy.
    pub strategy: DiningStrategy,
    /// Every philosopher, by id.
    pub philosophers: Vec<PhilosopherView>,
    /// Every fork, by id.
    pub forks: Vec<ForkView>,
    /// Sum of all eat counts.
    pub total_meals: u64,
    /// Times the observer has seen the deadlock condition begin.
    pub deadlocks_observed: u64,
}

impl DiningSnapshot {
    /// Philosophers currently eating.
    #[must_use]
    pub fn eating(&self) -> usize {
        self.philosophers
            .iter()
            .filter(|p| p.state == PhilosopherState::Eating)
            .count()
    }

    /// True if two neighbours are eating at once.
    #[must_use]
    pub fn neighbours_eating(&self) -> bool {
        let n = self.philosophers.len();
        (0..n).any(|i| {
            self.philosophers[i].state == PhilosopherState::Eating
                && self.philosophers[(i + 1) % n].state == PhilosopherState::Eating
        })
    }

    /// Forks held by someone other than an Eating philosopher seated next to
    /// them.
    #[must_use]
    pub fn orphaned_forks(&self) -> Vec<usize> {
        self.forks
            .iter()
            .filter(|fork| match fork.holder {
                None => false,
                Some(p) => self.philosophers.get(p).map_or(true, |view| {
                    view.state != PhilosopherState::Eating
                        || (view.left_fork != fork.id && view.right_fork != fork.id)
                }),
            })
            .map(|fork| fork.id)
            .collect()
    }
}

/// The dining engine driven by a [`DiningTable`] controller.
#[derive(Debug)]
pub struct DiningPhilosophers {
    config: DiningConfig,
    table: Table,
    deadlocks_observed: AtomicU64,
}

impl DiningPhilosophers {
    /// Live sample of the deadlock observer's condition.
    #[must_use]
    pub fn deadlock_status(&self) -> bool {
        is_deadlocked(&self.snapshot_table())
    }

    fn snapshot_table(&self) -> DiningSnapshot {
        let (philosophers, forks) = self.table.views();
        DiningSnapshot {
            strategy: self.config.strategy,
            total_meals: philosophers.iter().map(|p| p.eat_count).sum(),
            philosophers,
            forks,
            deadlocks_observed: self.deadlocks_observed.load(Ordering::Acquire),
        }
    }

    fn dine(&self, p: usize, ctx: &ActorContext) -> SimResult<()> {
        let timing = &self.config.timing;
        loop {
            ctx.checkpoint()?;
            self.table.set_state(p, PhilosopherState::Thinking);
            ctx.debug("thinking");
            ctx.delay(&timing.think)?;

            self.table.set_state(p, PhilosopherState::Hungry);
            ctx.debug("hungry, reaching for forks");
            while !self.table.acquire(p, self.config.strategy)? {
                ctx.delay(&timing.backoff)?;
                ctx.checkpoint()?;
            }

            ctx.info(format!("eating (meal {})", self.table.eat_count(p) + 1));
            ctx.delay(&timing.eat)?;
            let meals = self.table.finish_meal(p)?;
            ctx.debug(format!("put down both forks after meal {meals}"));
        }
    }
}

impl Simulation for DiningPhilosophers {
    type Config = DiningConfig;
    type Snapshot = DiningSnapshot;

    const KIND: EngineKind = EngineKind::DiningPhilosophers;

    fn build(config: &DiningConfig) -> SimResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            table: Table::new(config.philosophers),
            deadlocks_observed: AtomicU64::new(0),
        })
    }

    fn describe(config: &DiningConfig) -> String {
        format!("{} philosophers, strategy {}", config.philosophers, config.strategy)
    }

    fn actors(&self) -> Vec<ActorId> {
        (0..self.table.len())
            .map(|i| ActorId::new(Role::Philosopher, i))
            .chain(std::iter::once(ActorId::new(Role::Observer, 0)))
            .collect()
    }

    fn run_actor(&self, actor: ActorId, ctx: &ActorContext) -> SimResult<()> {
        match actor.role {
            Role::Observer => observer::watch(self, ctx),
            _ => self.dine(actor.index, ctx),
        }
    }

    fn abort_waits(&self) {
        self.table.close();
    }

    fn restore(&self) {
        self.table.restore();
        self.deadlocks_observed.store(0, Ordering::Release);
    }

    fn snapshot(&self) -> DiningSnapshot {
        self.snapshot_table()
    }
}

/// Controller for the dining engine.
pub type DiningTable = SimulationController<DiningPhilosophers>;

impl SimulationController<DiningPhilosophers> {
    /// Swaps the acquisition strategy, resetting (and restarting, if running)
    /// the simulation so no philosopher mixes two protocols.
    pub fn set_strategy(&self, strategy: DiningStrategy) -> SimResult<Transition> {
        let mut config = self.config()?;
        if config.strategy == strategy {
            return Ok(Transition::NoOp);
        }
        config.strategy = strategy;
        self.configure(config)
    }

    /// Advisory flag from the deadlock observer's condition, sampled now.
    pub fn deadlock_status(&self) -> SimResult<bool> {
        Ok(self.engine()?.deadlock_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::event::{EventBus, EventLevel};

    fn engine(philosophers: usize, strategy: DiningStrategy) -> DiningPhilosophers {
        DiningPhilosophers::build(&DiningConfig {
            philosophers,
            strategy,
            observer_interval_ms: 1,
            ..DiningConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn strategy_names_round_trip_through_from_str() {
        for strategy in DiningStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<DiningStrategy>().unwrap(), strategy);
        }
        assert_eq!(
            "limit-diners".parse::<DiningStrategy>().unwrap(),
            DiningStrategy::BoundedConcurrentDiners
        );
        let err = "waiter".parse::<DiningStrategy>().unwrap_err();
        assert!(err.to_string().contains("atomic-both-forks"));
    }

    #[test]
    fn config_validation() {
        let mut config = DiningConfig::default();
        assert!(config.validate().is_ok());
        config.philosophers = 1;
        assert!(matches!(config.validate(), Err(ValidationError::TooSmall { min: 2, .. })));
        config.philosophers = 5;
        config.timing.eat = DelayRange::new(9, 3);
        assert!(matches!(config.validate(), Err(ValidationError::InvalidDelayRange { .. })));
    }

    #[test]
    fn lockstep_left_forks_trigger_the_observer() {
        let engine = engine(5, DiningStrategy::NoCoordination);
        for p in 0..5 {
            engine.table.set_state(p, PhilosopherState::Hungry);
            assert!(engine.table.take_left(p));
        }

        assert!(engine.deadlock_status());
        let snapshot = engine.snapshot();
        assert!(snapshot.forks.iter().all(|f| f.taken));
        // Nobody can make progress: every right fork is someone's left.
        for p in 0..5 {
            assert!(!engine.table.acquire(p, DiningStrategy::AtomicBothForks).unwrap());
        }

        engine.restore();
        assert!(!engine.deadlock_status());
    }

    #[test]
    fn observer_reports_rising_and_falling_edges() {
        let engine = Arc::new(engine(3, DiningStrategy::NoCoordination));
        let bus = Arc::new(EventBus::new(EngineKind::DiningPhilosophers));
        let events = bus.subscribe();
        let ctx = ActorContext::detached(ActorId::new(Role::Observer, 0), Arc::clone(&bus));

        let watcher = {
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            thread::spawn(move || observer::watch(&engine, &ctx))
        };

        for p in 0..3 {
            engine.table.set_state(p, PhilosopherState::Hungry);
            engine.table.take_left(p);
        }
        thread::sleep(Duration::from_millis(30));
        engine.table.restore();
        thread::sleep(Duration::from_millis(30));
        ctx.stop();
        assert!(watcher.join().unwrap().unwrap_err().is_cancellation());

        assert_eq!(engine.snapshot().deadlocks_observed, 1);
        let seen: Vec<(EventLevel, String)> = events
            .drain()
            .into_iter()
            .map(|e| (e.level, e.message))
            .collect();
        assert!(seen.iter().any(|(level, m)| *level == EventLevel::Warn && m.contains("deadlock suspected")));
        assert!(seen.iter().any(|(_, m)| m == "deadlock condition cleared"));
    }

    #[test]
    fn orphaned_forks_flags_non_eating_holder() {
        let engine = engine(3, DiningStrategy::NoCoordination);
        engine.table.set_state(0, PhilosopherState::Hungry);
        engine.table.take_left(0);
        assert_eq!(engine.snapshot().orphaned_forks(), vec![0]);

        engine.restore();
        assert!(engine.table.acquire(0, DiningStrategy::AtomicBothForks).unwrap());
        let snapshot = engine.snapshot();
        assert!(snapshot.orphaned_forks().is_empty());
        assert_eq!(snapshot.eating(), 1);
    }

    #[test]
    fn actors_include_the_observer() {
        let engine = engine(4, DiningStrategy::AtomicBothForks);
        let actors = engine.actors();
        assert_eq!(actors.len(), 5);
        assert_eq!(actors[4], ActorId::new(Role::Observer, 0));
    }
}
