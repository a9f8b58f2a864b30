use crate::runtime::context;
use crate::time::sleep::park_for;

use libc::{c_int, c_uint, timespec, useconds_t};

use std::time::Duration;

/// Hooked `sleep(3)`: parks the current fiber instead of the thread.
pub fn sleep(seconds: c_uint) -> c_uint {
    if context::hook_enabled() && park_for(Duration::from_secs(seconds.into())) {
        return 0;
    }
    unsafe { libc::sleep(seconds) }
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: useconds_t) -> c_int {
    if context::hook_enabled() && park_for(Duration::from_micros(usec.into())) {
        return 0;
    }
    unsafe { libc::usleep(usec) }
}

/// Hooked `nanosleep(2)`. Parked sleeps have millisecond resolution and
/// are never interrupted, so `rem` is left untouched.
///
/// # Safety
///
/// Same contract as `libc::nanosleep`.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if context::hook_enabled() && !req.is_null() {
        let req = unsafe { &*req };
        if req.tv_sec >= 0 && (0..1_000_000_000).contains(&req.tv_nsec) {
            let duration = Duration::new(req.tv_sec as u64, req.tv_nsec as u32);
            if park_for(duration) {
                return 0;
            }
        }
    }
    unsafe { libc::nanosleep(req, rem) }
}
