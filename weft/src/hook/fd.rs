use crate::reactor::poller::unix::{sys_is_socket, sys_set_nonblocking};

use log::{debug, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NO_TIMEOUT: u64 = u64::MAX;

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::new);

/// Which socket timeout a hooked call honours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`, used by the read side.
    Recv,
    /// `SO_SNDTIMEO`, used by the write side and `connect`.
    Send,
}

/// What the facade knows about one descriptor.
///
/// Sockets are switched to `O_NONBLOCK` at the OS level as soon as they are
/// tracked (`sys_nonblock`). Whether the *application* asked for
/// non-blocking mode is tracked separately (`user_nonblock`): only
/// descriptors the application believes are blocking get parked.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let (is_init, is_socket) = match sys_is_socket(fd) {
            Ok(is_socket) => (true, is_socket),
            Err(err) => {
                debug!("fd {fd}: fstat failed: {err}");
                (false, false)
            }
        };

        let sys_nonblock = is_socket
            && match sys_set_nonblocking(fd) {
                Ok(()) => true,
                Err(err) => {
                    warn!("fd {fd}: could not switch to non-blocking mode: {err}");
                    false
                }
            };

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `false` if the descriptor could not be inspected when first tracked.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        };
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        let ms = ms.unwrap_or(NO_TIMEOUT);
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide table of tracked descriptors, indexed by fd.
pub struct FdManager {
    contexts: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> Self {
        Self {
            contexts: RwLock::new(vec![None; 64]),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static FdManager {
        &FD_MANAGER
    }

    /// Looks up `fd`, creating its record when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let index = usize::try_from(fd).ok()?;

        {
            let contexts = self.contexts.read();
            match contexts.get(index) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut contexts = self.contexts.write();
        if contexts.len() <= index {
            contexts.resize((index * 3 / 2).max(index + 1), None);
        }

        let ctx = contexts[index].get_or_insert_with(|| {
            debug!("fd {fd}: tracking");
            Arc::new(FdCtx::new(fd))
        });
        Some(ctx.clone())
    }

    /// Forgets `fd`. Holders of its old record see it as closed.
    pub fn remove(&self, fd: RawFd) {
        let Ok(index) = usize::try_from(fd) else {
            return;
        };

        let mut contexts = self.contexts.write();
        if let Some(ctx) = contexts.get_mut(index).and_then(Option::take) {
            ctx.mark_closed();
            debug!("fd {fd}: no longer tracked");
        }
    }
}
