use crate::config::TCP_CONNECT_TIMEOUT;
use crate::fiber::Fiber;
use crate::hook::fd::{FdManager, TimeoutKind};
use crate::reactor::poller::unix::{errno, set_errno, sys_socket_error};
use crate::reactor::{Event, IoManager};
use crate::runtime::context;
use crate::time::Timer;

use libc::{
    EAGAIN, EBADF, EINPROGRESS, EINTR, EINVAL, ETIMEDOUT, F_GETFL, F_SETFL, FIONBIO, O_NONBLOCK,
    SO_RCVTIMEO, SO_SNDTIMEO, SOL_SOCKET, c_int, c_ulong, c_void, iovec, msghdr, size_t, sockaddr,
    socklen_t, ssize_t, timeval,
};
use log::{debug, error, info};
use once_cell::sync::Lazy;

use std::mem;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Connect timeout in milliseconds, mirrored from [`TCP_CONNECT_TIMEOUT`].
static CONNECT_TIMEOUT: Lazy<AtomicU64> = Lazy::new(|| {
    TCP_CONNECT_TIMEOUT.add_listener(|old, new| {
        info!("tcp connect timeout changed from {old} to {new} ms");
        CONNECT_TIMEOUT.store(*new, Ordering::Release);
    });
    AtomicU64::new(TCP_CONNECT_TIMEOUT.get())
});

/// Outcome flag shared between a parked call and its timeout timer.
///
/// Holds `0` until the timer fires, then the errno to report.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Arms a timer that cancels the registration of `event` on `fd` after
/// `ms` milliseconds and records `ETIMEDOUT` in `info`.
fn arm_timeout(iom: &Arc<IoManager>, fd: RawFd, event: Event, ms: u64, info: &Arc<TimerInfo>) -> Timer {
    let weak_info = Arc::downgrade(info);
    let weak_iom = Arc::downgrade(iom);

    iom.add_condition_timer(
        ms,
        move || {
            let Some(info) = weak_info.upgrade() else {
                return;
            };
            if info
                .cancelled
                .compare_exchange(0, ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let Some(iom) = weak_iom.upgrade() else {
                return;
            };
            if !iom.cancel_event(fd, event) {
                // The event won the race: let the retry pick up its result.
                let _ = info
                    .cancelled
                    .compare_exchange(ETIMEDOUT, 0, Ordering::AcqRel, Ordering::Acquire);
            }
        },
        Arc::downgrade(info),
        false,
    )
}

fn report(err: &crate::Error) {
    let code = match err {
        crate::Error::Epoll { source, .. } | crate::Error::Io(source) => source.raw_os_error(),
        _ => None,
    };
    set_errno(code.unwrap_or(EINVAL));
}

/// Runs `call` until it stops failing with `EAGAIN`, parking the current
/// fiber on `event` between attempts.
///
/// Calls pass straight through when hooking is off for this thread, the
/// fd is not a tracked socket, the application put it in non-blocking mode,
/// or there is no fiber and I/O manager to park on.
fn do_io<F>(fd: RawFd, name: &'static str, event: Event, kind: TimeoutKind, mut call: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !context::hook_enabled() {
        return call();
    }

    let Some(ctx) = FdManager::global().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let Some(iom) = IoManager::current() else {
        return call();
    };
    if !Fiber::in_fiber() {
        return call();
    }

    let timeout = ctx.timeout(kind);

    loop {
        let mut n = call();
        while n == -1 && errno() == EINTR {
            n = call();
        }
        if n != -1 || errno() != EAGAIN {
            return n;
        }

        if let Err(err) = iom.add_event(fd, event) {
            error!("{name}: add_event({fd}, {event:?}) failed: {err}");
            report(&err);
            return -1;
        }

        let info = Arc::new(TimerInfo::default());
        let timer = timeout.map(|ms| arm_timeout(&iom, fd, event, ms, &info));

        Fiber::yield_to_hold();

        if let Some(timer) = timer {
            timer.cancel();
        }

        let cancelled = info.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            debug!("{name}: fd {fd} timed out");
            set_errno(cancelled);
            return -1;
        }
        if ctx.is_closed() {
            set_errno(EBADF);
            return -1;
        }
    }
}

/// Hooked `socket(2)`. New sockets are tracked and made non-blocking.
///
/// # Safety
///
/// Same contract as `libc::socket`.
pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && context::hook_enabled() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// Hooked `connect(2)` with the configured `tcp.connect.timeout`.
///
/// # Safety
///
/// Same contract as `libc::connect`.
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
    let ms = CONNECT_TIMEOUT.load(Ordering::Acquire);
    let timeout = (ms != u64::MAX).then_some(ms);
    unsafe { connect_with_timeout(fd, addr, len, timeout) }
}

/// Hooked `connect(2)` with an explicit timeout in milliseconds.
///
/// An in-progress connection parks the fiber until the socket is writable,
/// then reports the socket's pending error, if any.
///
/// # Safety
///
/// Same contract as `libc::connect`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    let passthrough = || unsafe { libc::connect(fd, addr, len) };

    if !context::hook_enabled() {
        return passthrough();
    }

    let Some(ctx) = FdManager::global().get(fd, false) else {
        return passthrough();
    };
    if ctx.is_closed() {
        set_errno(EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return passthrough();
    }

    let n = passthrough();
    if n == 0 || errno() != EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    if !Fiber::in_fiber() {
        return n;
    }

    if let Err(err) = iom.add_event(fd, Event::WRITE) {
        error!("connect: add_event({fd}, WRITE) failed: {err}");
        report(&err);
        return -1;
    }

    let info = Arc::new(TimerInfo::default());
    let timer = timeout_ms.map(|ms| arm_timeout(&iom, fd, Event::WRITE, ms, &info));

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }

    let cancelled = info.cancelled.load(Ordering::Acquire);
    if cancelled != 0 {
        debug!("connect: fd {fd} timed out");
        set_errno(cancelled);
        return -1;
    }

    match sys_socket_error(fd) {
        Ok(0) => 0,
        Ok(code) => {
            set_errno(code);
            -1
        }
        Err(err) => {
            set_errno(err.raw_os_error().unwrap_or(EINVAL));
            -1
        }
    }
}

/// Hooked `accept(2)`. The accepted socket is tracked.
///
/// # Safety
///
/// Same contract as `libc::accept`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, len) as ssize_t
    }) as c_int;

    if client >= 0 && context::hook_enabled() {
        FdManager::global().get(client, true);
    }
    client
}

/// Hooked `read(2)`.
///
/// # Safety
///
/// Same contract as `libc::read`.
pub unsafe fn read(fd: RawFd, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf, count)
    })
}

/// Hooked `readv(2)`.
///
/// # Safety
///
/// Same contract as `libc::readv`.
pub unsafe fn readv(fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// Hooked `recv(2)`.
///
/// # Safety
///
/// Same contract as `libc::recv`.
pub unsafe fn recv(fd: RawFd, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

/// Hooked `recvfrom(2)`.
///
/// # Safety
///
/// Same contract as `libc::recvfrom`.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf, len, flags, addr, addrlen)
    })
}

/// Hooked `recvmsg(2)`.
///
/// # Safety
///
/// Same contract as `libc::recvmsg`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

/// Hooked `write(2)`.
///
/// # Safety
///
/// Same contract as `libc::write`.
pub unsafe fn write(fd: RawFd, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf, count)
    })
}

/// Hooked `writev(2)`.
///
/// # Safety
///
/// Same contract as `libc::writev`.
pub unsafe fn writev(fd: RawFd, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// Hooked `send(2)`.
///
/// # Safety
///
/// Same contract as `libc::send`.
pub unsafe fn send(fd: RawFd, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

/// Hooked `sendto(2)`.
///
/// # Safety
///
/// Same contract as `libc::sendto`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf, len, flags, addr, addrlen)
    })
}

/// Hooked `sendmsg(2)`.
///
/// # Safety
///
/// Same contract as `libc::sendmsg`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Hooked `close(2)`.
///
/// Fibers parked on `fd` in the current I/O manager are woken first; their
/// retried call then fails with `EBADF`.
///
/// # Safety
///
/// Same contract as `libc::close`.
pub unsafe fn close(fd: RawFd) -> c_int {
    if let Some(ctx) = FdManager::global().get(fd, false) {
        ctx.mark_closed();
        if context::hook_enabled() {
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
        }
        FdManager::global().remove(fd);
    }

    unsafe { libc::close(fd) }
}

/// Hooked `fcntl(2)` for commands taking an integer argument.
///
/// `F_SETFL`/`F_GETFL` on tracked sockets virtualize `O_NONBLOCK`: the
/// application sees the mode it asked for while the descriptor itself
/// stays non-blocking.
///
/// # Safety
///
/// Same contract as `libc::fcntl` with an `int` argument.
pub unsafe fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    let tracked = || {
        FdManager::global()
            .get(fd, false)
            .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
    };

    match cmd {
        F_SETFL => {
            let Some(ctx) = tracked() else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            ctx.set_user_nonblock(arg & O_NONBLOCK != 0);

            let arg = if ctx.sys_nonblock() {
                arg | O_NONBLOCK
            } else {
                arg & !O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            match tracked() {
                Some(ctx) if ctx.user_nonblock() => flags | O_NONBLOCK,
                Some(_) => flags & !O_NONBLOCK,
                None => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl(2)`. `FIONBIO` on a tracked socket only changes the
/// application's view of its blocking mode.
///
/// # Safety
///
/// Same contract as `libc::ioctl`.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == FIONBIO as c_ulong && !arg.is_null() {
        let ctx = FdManager::global()
            .get(fd, false)
            .filter(|ctx| !ctx.is_closed() && ctx.is_socket());

        if let Some(ctx) = ctx {
            let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
            ctx.set_user_nonblock(user_nonblock);

            let mut sys_nonblock: c_int = ctx.sys_nonblock().into();
            return unsafe { libc::ioctl(fd, request as _, &mut sys_nonblock as *mut c_int) };
        }
    }

    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// `getsockopt(2)`, unchanged.
///
/// # Safety
///
/// Same contract as `libc::getsockopt`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, name, value, len) }
}

/// Hooked `setsockopt(2)`. `SO_RCVTIMEO`/`SO_SNDTIMEO` are also recorded
/// as the timeouts parked calls honour. A zero timeout means none, and a
/// `timeval` with a negative field fails with `EINVAL`.
///
/// # Safety
///
/// Same contract as `libc::setsockopt`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    let is_timeout = level == SOL_SOCKET
        && (name == SO_RCVTIMEO || name == SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= mem::size_of::<timeval>();

    if !context::hook_enabled() || !is_timeout {
        return unsafe { libc::setsockopt(fd, level, name, value, len) };
    }

    let tv = unsafe { &*(value as *const timeval) };
    if tv.tv_sec < 0 || tv.tv_usec < 0 {
        set_errno(EINVAL);
        return -1;
    }

    let rc = unsafe { libc::setsockopt(fd, level, name, value, len) };
    if rc == 0 {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            let ms = (tv.tv_sec as u64)
                .saturating_mul(1000)
                .saturating_add(tv.tv_usec as u64 / 1000);
            let kind = if name == SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, (ms != 0).then_some(ms));
        }
    }
    rc
}
