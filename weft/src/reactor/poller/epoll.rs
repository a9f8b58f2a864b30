//! Linux `epoll` poller.
//!
//! Responsibilities:
//! - Own the epoll instance shared by every worker of an I/O manager
//! - Add, modify and remove edge-triggered registrations
//! - Block waiting for readiness with a millisecond timeout
//! - Interrupt waiting workers through an internal `eventfd`
//!
//! Registrations carry the file descriptor itself as their token.

use crate::reactor::poller::Waker;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLET, EPOLLIN, c_int,
    epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;

/// Reserved token used internally for the wake-up event.
///
/// File descriptors are non-negative `i32`s, so `u64::MAX` never collides
/// with a registration token.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// An `epoll_ctl` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Add,
    Modify,
    Delete,
}

impl Op {
    fn raw(self) -> c_int {
        match self {
            Op::Add => EPOLL_CTL_ADD,
            Op::Modify => EPOLL_CTL_MOD,
            Op::Delete => EPOLL_CTL_DEL,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Op::Add => "ADD",
            Op::Modify => "MOD",
            Op::Delete => "DEL",
        }
    }
}

/// Linux `epoll` poller.
///
/// Unlike a single-threaded reactor, several workers block in
/// [`wait`](Self::wait) on the same instance at once, each with its own
/// event buffer.
pub(crate) struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Waker wrapping the internal eventfd.
    waker: Waker,
}

impl EpollPoller {
    /// Creates the epoll instance and registers the wake-up eventfd.
    ///
    /// The eventfd is level-triggered: it stays readable until drained.
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }
        let waker = Waker(eventfd);

        let mut event = epoll_event {
            events: EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };

        let rc = unsafe { epoll_ctl(epoll, EPOLL_CTL_ADD, eventfd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll) };
            return Err(err);
        }

        Ok(Self { epoll, waker })
    }

    /// Applies `op` to `fd` with the given interest bits.
    ///
    /// Registrations are always edge-triggered.
    pub(crate) fn control(&self, op: Op, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events: EPOLLET as u32 | interest,
            u64: fd as u64,
        };

        let rc = unsafe { epoll_ctl(self.epoll, op.raw(), fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Blocks until readiness, a wake-up, or `timeout_ms` elapses.
    ///
    /// `events` is cleared and refilled; its capacity bounds how many events
    /// one call returns. Interrupted waits are retried.
    pub(crate) fn wait(&self, events: &mut Vec<epoll_event>, timeout_ms: i32) -> io::Result<()> {
        events.clear();

        loop {
            let n = unsafe {
                epoll_wait(
                    self.epoll,
                    events.as_mut_ptr(),
                    events.capacity() as i32,
                    timeout_ms,
                )
            };

            if n >= 0 {
                unsafe { events.set_len(n as usize) };
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Interrupts one or more threads blocked in [`wait`](Self::wait).
    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    /// Consumes pending wake-ups after a `WAKE_TOKEN` event.
    pub(crate) fn drain_wakeups(&self) {
        self.waker.drain();
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}
