//! Timers and fiber-aware sleeping.
//!
//! It includes:
//! - [`TimerManager`] and [`Timer`], an ordered set of millisecond timers,
//! - [`sleep`], which parks the current fiber instead of its thread.

pub(crate) mod sleep;
mod timer;

#[doc(inline)]
pub use sleep::sleep;

#[doc(inline)]
pub use timer::{Timer, TimerCallback, TimerManager};
