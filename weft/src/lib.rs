//! # Weft
//!
//! **Weft** is a fiber runtime for Linux: stackful coroutines multiplexed
//! over a pool of threads, with epoll-driven I/O and millisecond timers.
//!
//! Code running in a weft fiber is written in plain blocking style. When it
//! would block (on a socket, on a sleep) the fiber is parked and its worker
//! thread picks up other work until the descriptor is ready or the timer
//! fires.
//!
//! The pieces:
//!
//! - **Fibers** ([`Fiber`]) with private mmap'd stacks and explicit
//!   `resume` / `yield` switching
//! - An **N:M scheduler** ([`Scheduler`]) with FIFO queueing, thread
//!   pinning and optional participation of the creating thread
//! - An **I/O manager** ([`IoManager`]) whose idle workers wait on epoll and
//!   on the next timer deadline
//! - **Timers** ([`TimerManager`]): one-shot, recurring and conditional
//! - A **blocking-call facade** ([`hook`]) that parks fibers on `read`,
//!   `write`, `connect`, `sleep` and friends
//! - **Macros** `#[weft::main]` and `#[weft::test]`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! #[weft::main(threads = 2)]
//! fn main() {
//!     weft::time::sleep(Duration::from_millis(100));
//!     println!("slept without blocking a worker");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`hook`] — Fiber-aware replacements for blocking libc calls
//! - [`time`] — Timers and fiber-aware sleep
//! - [`config`] — Runtime configuration variables

mod error;
mod fiber;
mod reactor;
mod runtime;
mod utils;

pub mod config;
pub mod hook;
pub mod time;

pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, IoManager};
pub use runtime::builder::Builder;
pub use runtime::scheduler::{Dispatch, Scheduler};
pub use runtime::task::{Callback, Task};
pub use runtime::yield_now::yield_now;
pub use time::{Timer, TimerManager};

pub use weft_macros::{main, test};
