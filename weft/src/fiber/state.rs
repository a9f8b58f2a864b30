use std::fmt;

/// Fiber was created or reset and has not run yet.
pub(crate) const INIT: u8 = 0;

/// Fiber yielded and asked to be run again soon.
///
/// A scheduler that observes this state after a resume re-queues the fiber.
pub(crate) const READY: u8 = 1;

/// Fiber is currently running on some thread.
///
/// At most one thread may observe a fiber in this state as its own.
pub(crate) const EXEC: u8 = 2;

/// Fiber yielded and is waiting for an external wake.
///
/// Whoever parked it (an I/O registration, a timer) is responsible for
/// scheduling it again.
pub(crate) const HOLD: u8 = 3;

/// Fiber body returned normally.
pub(crate) const TERM: u8 = 4;

/// Fiber body panicked. The panic was caught at the fiber boundary.
pub(crate) const EXCEPT: u8 = 5;

/// Lifecycle state of a [`Fiber`](super::Fiber).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    Init = INIT,
    Ready = READY,
    Exec = EXEC,
    Hold = HOLD,
    Term = TERM,
    Except = EXCEPT,
}

impl FiberState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            INIT => Self::Init,
            READY => Self::Ready,
            EXEC => Self::Exec,
            HOLD => Self::Hold,
            TERM => Self::Term,
            EXCEPT => Self::Except,
            other => unreachable!("invalid fiber state {other}"),
        }
    }

    /// `true` for states a fiber can be resumed from.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Init | Self::Ready | Self::Hold)
    }

    /// `true` once the fiber body has finished, normally or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Exec => "EXEC",
            Self::Hold => "HOLD",
            Self::Term => "TERM",
            Self::Except => "EXCEPT",
        };
        f.write_str(name)
    }
}
