//! Linux readiness polling.
//!
//! This module wraps the system facilities the I/O manager is built on:
//! - [`epoll`]: the shared epoll instance and its wake-up channel,
//! - [`unix`]: thin `libc` helpers returning `io::Result`.

pub(crate) mod common;
pub(crate) mod epoll;
pub(crate) mod unix;

pub(crate) use common::Waker;
pub(crate) use epoll::{EpollPoller, WAKE_TOKEN};
