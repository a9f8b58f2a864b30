use crate::fiber::Fiber;
use crate::runtime::scheduler::Dispatch;

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

// Every accessor below is `#[inline(never)]`. A fiber may be suspended on
// one thread and resumed on another; forcing a real call makes each access
// recompute the thread-local address instead of reusing one cached in a
// register before the switch.

thread_local! {
    /// Fiber currently executing on this thread.
    ///
    /// `None` while the thread runs on its own native stack.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Lazily created stand-in for the thread's native stack.
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler whose dispatch loop runs on this thread.
    ///
    /// Set for the duration of the loop so hooked calls and nested
    /// registrations can find their scheduler without passing it around.
    static CURRENT_SCHEDULER: RefCell<Option<Arc<dyn Dispatch>>> = const { RefCell::new(None) };

    /// Whether the blocking-call facade parks fibers on this thread.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Installs `fiber` as the running fiber and returns the previous one.
#[inline(never)]
pub(crate) fn replace_current_fiber(fiber: Option<Arc<Fiber>>) -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|current| current.replace(fiber))
}

#[inline(never)]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|current| current.borrow().clone())
}

/// Raw pointer to the running fiber, or null on the native stack.
///
/// Used by code running on the fiber's own stack, which must not hold a
/// strong reference across its final switch.
#[inline(never)]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|current| match &*current.borrow() {
        Some(fiber) => Arc::as_ptr(fiber),
        None => ptr::null(),
    })
}

#[inline(never)]
pub(crate) fn root_fiber() -> Arc<Fiber> {
    ROOT_FIBER.with(|root| root.borrow_mut().get_or_insert_with(Fiber::root).clone())
}

/// Installs `scheduler` for this thread and returns the previous one.
#[inline(never)]
pub(crate) fn enter_scheduler(
    scheduler: Option<Arc<dyn Dispatch>>,
) -> Option<Arc<dyn Dispatch>> {
    CURRENT_SCHEDULER.with(|current| current.replace(scheduler))
}

#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Arc<dyn Dispatch>> {
    CURRENT_SCHEDULER.with(|current| current.borrow().clone())
}

#[inline(never)]
pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

#[inline(never)]
pub(crate) fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}
