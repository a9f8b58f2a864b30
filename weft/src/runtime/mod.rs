//! Core runtime components.
//!
//! This module contains the pieces that run fibers on threads:
//! - [`scheduler`]: the queue, worker pool and dispatch loop,
//! - [`task`]: the units of work a scheduler accepts,
//! - thread-local context and cooperative yielding.
//!
//! Most users go through [`Builder`](crate::Builder) and the
//! [`IoManager`](crate::IoManager) rather than these modules directly.

pub(crate) mod builder;
pub(crate) mod context;
pub(crate) mod scheduler;
pub(crate) mod task;
pub(crate) mod yield_now;
