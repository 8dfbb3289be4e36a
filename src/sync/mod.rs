//! Resource primitives shared by the engines.
//!
//! Both primitives support `close`, which aborts every blocked wait, and
//! `reset`, which restores the initial state once all holders are gone. The
//! controller relies on this pair to tear a run down without leaking ownership.

/// Shared/exclusive lock.
pub mod rwlock;
/// Counting semaphore.
pub mod semaphore;

pub use rwlock::{ExclusiveGuard, LockHolders, SharedExclusiveLock, SharedGuard};
pub use semaphore::{Permit, Semaphore};
