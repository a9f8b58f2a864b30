//! Epoll-driven I/O manager.
//!
//! This module implements the [`IoManager`], a scheduler variant whose idle
//! workers wait on epoll instead of a condition variable. It is
//! responsible for:
//! - registering read/write interest on file descriptors,
//! - resuming the parked fiber (or running the callback) once ready,
//! - firing timers from the same wait loop,
//! - waking idle workers when new work arrives.
//!
//! The blocking-call facade in [`hook`](crate::hook) is built on top of it.

mod core;
mod event;
mod io;

pub(crate) mod poller;

pub use self::core::IoManager;
pub use event::Event;
