//! Blocking-call facade.
//!
//! The functions in this module have the signatures of their `libc`
//! counterparts. On a thread with hooking enabled (every scheduler worker
//! enables it) and inside a fiber run by an [`IoManager`](crate::IoManager),
//! a call that would block parks the calling fiber instead and lets the
//! worker run something else:
//! - socket I/O retries after waiting for readiness on the descriptor,
//! - `SO_RCVTIMEO`/`SO_SNDTIMEO` set through [`setsockopt`] bound that wait,
//! - sleeps become timers.
//!
//! Everywhere else the calls behave exactly like the system ones.
//!
//! Only sockets are parked. Descriptors are tracked by the process-wide
//! [`FdManager`], which switches sockets to non-blocking mode while
//! remembering the mode the application asked for.
//!
//! ```rust,ignore
//! iom.schedule(move || {
//!     let mut buf = [0u8; 512];
//!     let n = unsafe { weft::hook::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
//! });
//! ```

mod fd;
mod io;
mod sleep;

pub use fd::{FdCtx, FdManager, TimeoutKind};
pub use io::{
    accept, close, connect, connect_with_timeout, fcntl, getsockopt, ioctl, read, readv, recv,
    recvfrom, recvmsg, send, sendmsg, sendto, setsockopt, socket, write, writev,
};
pub use sleep::{nanosleep, sleep, usleep};

use crate::runtime::context;

/// Whether blocking calls on this thread park fibers.
pub fn is_hook_enabled() -> bool {
    context::hook_enabled()
}

/// Enables or disables parking for the calling thread.
pub fn set_hook_enabled(enabled: bool) {
    context::set_hook_enabled(enabled);
}
