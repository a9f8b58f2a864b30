//! N:M fiber scheduler.
//!
//! This module contains the components that run fibers on a pool of worker
//! threads:
//! - [`core`]: the [`Scheduler`] itself (queue, lifecycle, counters),
//! - [`worker`]: the dispatch loop every worker thread runs.
//!
//! The scheduler's waiting strategy is pluggable through [`Dispatch`]: the
//! plain [`Scheduler`] parks idle workers on a condition variable, while
//! [`IoManager`](crate::IoManager) waits on epoll instead.

pub(crate) mod core;
pub(crate) mod worker;

pub use self::core::Scheduler;

use crate::reactor::IoManager;

use std::sync::Arc;

/// Hooks a scheduler variant provides to the dispatch loop.
///
/// The dispatch loop only ever talks to the scheduler through this trait,
/// so a variant can change how workers sleep and wake without touching the
/// queueing logic in [`Scheduler`].
pub trait Dispatch: Send + Sync + 'static {
    /// The queue and counters shared by every variant.
    fn scheduler(&self) -> &Scheduler;

    /// Wakes at least one idle worker.
    fn tickle(&self);

    /// `true` once the workers may exit.
    fn stopping(&self) -> bool;

    /// Body of each worker's idle fiber.
    ///
    /// Runs while the queue has nothing for the worker. Implementations wait
    /// for work, yield with [`Fiber::yield_to_hold`](crate::Fiber::yield_to_hold)
    /// so the worker can look at the queue again, and return once
    /// [`stopping`](Dispatch::stopping) holds.
    fn idle(&self);

    /// Downcast used by the blocking-call facade.
    fn io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }
}
