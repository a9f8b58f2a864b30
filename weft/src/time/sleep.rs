use crate::fiber::Fiber;
use crate::reactor::IoManager;

use std::sync::Arc;
use std::time::Duration;

/// Suspends the current fiber for at least `duration`.
///
/// Inside a fiber run by an [`IoManager`], a one-shot timer re-schedules the
/// fiber and the worker thread is free to run other fibers meanwhile.
/// Anywhere else this falls back to blocking the thread.
///
/// # Examples
///
/// ```rust,ignore
/// use std::time::Duration;
///
/// weft::time::sleep(Duration::from_millis(10));
/// ```
pub fn sleep(duration: Duration) {
    if !park_for(duration) {
        std::thread::sleep(duration);
    }
}

/// Parks the current fiber on a timer. Returns `false` when there is no
/// fiber or no I/O manager to park on.
pub(crate) fn park_for(duration: Duration) -> bool {
    if !Fiber::in_fiber() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };

    let fiber = Fiber::current();
    let scheduler = Arc::downgrade(&iom);
    iom.add_timer(
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        move || {
            if let Some(iom) = scheduler.upgrade() {
                iom.schedule_fiber(fiber.clone());
            }
        },
        false,
    );

    Fiber::yield_to_hold();
    true
}
