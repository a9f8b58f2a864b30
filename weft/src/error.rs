//! Error type shared by the runtime.

use std::io;
use std::os::fd::RawFd;

/// Errors surfaced by the runtime's fallible operations.
///
/// Invariant violations (registering the same interest twice on one fd,
/// resuming a fiber that is not resumable, ...) are not represented here:
/// they indicate corrupted scheduler state and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An `epoll_ctl` call was rejected by the kernel.
    #[error("epoll_ctl({op}, fd={fd}) failed: {source}")]
    Epoll {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Mapping a fiber stack failed.
    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(#[source] io::Error),

    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for configuration variable {name}")]
    InvalidConfig { name: &'static str, value: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
