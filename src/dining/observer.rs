//! Heuristic deadlock observer.
//!
//! The observer samples the table at a fixed cadence and flags the classic
//! circular-wait picture: every philosopher Hungry and every fork taken. It is
//! advisory. A deadlock that forms and dissolves between two samples is never
//! seen. A sample can also catch a transient all-hungry moment that would have
//! resolved on its own.

use std::sync::atomic::Ordering;

use crate::controller::ActorContext;
use crate::error::SimResult;
use crate::timing::DelayRange;

use super::{DiningPhilosophers, DiningSnapshot, PhilosopherState};

/// True when every philosopher is Hungry and every fork is taken.
#[must_use]
pub fn is_deadlocked(snapshot: &DiningSnapshot) -> bool {
    !snapshot.philosophers.is_empty()
        && snapshot
            .philosophers
            .iter()
            .all(|p| p.state == PhilosopherState::Hungry)
        && snapshot.forks.iter().all(|f| f.taken)
}

/// Observer worker loop: samples until the run stops, reporting each
/// transition into and out of the deadlock condition.
pub(crate) fn watch(engine: &DiningPhilosophers, ctx: &ActorContext) -> SimResult<()> {
    let cadence = DelayRange::fixed(engine.config.observer_interval_ms);
    let mut flagged = false;
    loop {
        ctx.checkpoint()?;
        let deadlocked = is_deadlocked(&engine.snapshot_table());
        if deadlocked && !flagged {
            engine.deadlocks_observed.fetch_add(1, Ordering::AcqRel);
            ctx.warn("deadlock suspected: every philosopher is hungry and every fork is taken");
        } else if !deadlocked && flagged {
            ctx.info("deadlock condition cleared");
        }
        flagged = deadlocked;
        ctx.delay(&cadence)?;
    }
}
