use crate::reactor::Event;
use crate::runtime::scheduler::Dispatch;
use crate::runtime::task::Task;

use log::warn;
use parking_lot::{Mutex, MutexGuard};

use std::os::fd::RawFd;
use std::sync::Weak;

/// What to run when one direction of a descriptor becomes ready.
///
/// Holds either a parked fiber or a callback, together with the scheduler
/// that was current when it was registered. The task goes back to that
/// scheduler, not necessarily the one whose worker saw the event.
#[derive(Default)]
pub(crate) struct EventContext {
    scheduler: Option<Weak<dyn Dispatch>>,
    task: Option<Task>,
}

impl EventContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.task.is_none()
    }

    fn arm(&mut self, scheduler: Weak<dyn Dispatch>, task: Task) {
        debug_assert!(self.is_empty(), "event slot armed twice");
        self.scheduler = Some(scheduler);
        self.task = Some(task);
    }

    fn take(&mut self) -> Option<(Weak<dyn Dispatch>, Task)> {
        let scheduler = self.scheduler.take()?;
        let task = self.task.take()?;
        Some((scheduler, task))
    }
}

/// Registration state of one descriptor, guarded by its [`FdContext`].
#[derive(Default)]
pub(crate) struct FdState {
    /// Interests currently registered with epoll.
    pub(crate) events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn slot_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("no event slot for {event:?}")
        }
    }

    /// Records `task` as the continuation for `event`.
    pub(crate) fn arm(&mut self, event: Event, scheduler: Weak<dyn Dispatch>, task: Task) {
        self.events.insert(event);
        self.slot_mut(event).arm(scheduler, task);
    }

    /// Clears `event` without running its continuation.
    pub(crate) fn clear(&mut self, event: Event) {
        self.events.remove(event);
        let slot = self.slot_mut(event);
        slot.scheduler = None;
        slot.task = None;
    }

    /// Clears `event` and hands its continuation to the scheduler it was
    /// registered under.
    pub(crate) fn trigger(&mut self, fd: RawFd, event: Event) {
        debug_assert!(self.events.contains(event), "triggering unregistered {event:?}");
        self.events.remove(event);

        let Some((scheduler, task)) = self.slot_mut(event).take() else {
            return;
        };

        match scheduler.upgrade() {
            Some(scheduler) => scheduler.scheduler().schedule_task(task, None),
            None => warn!("fd {fd}: scheduler for {event:?} is gone, dropping its task"),
        }
    }
}

/// Per-descriptor registration record owned by the I/O manager.
pub(crate) struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FdState> {
        self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::Scheduler;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn trigger_moves_the_task_to_its_scheduler() {
        let scheduler = Scheduler::new(1, false, "fd-context");
        let owner: Weak<dyn Dispatch> = Arc::downgrade(&scheduler) as Weak<dyn Dispatch>;

        let ctx = FdContext::new(7);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        {
            let mut state = ctx.lock();
            state.arm(Event::READ, owner, Task::callback(move || flag.store(true, Ordering::SeqCst)));
            assert_eq!(state.events, Event::READ);

            state.trigger(ctx.fd(), Event::READ);
            assert!(state.events.is_empty());
        }

        scheduler.start().unwrap();
        scheduler.stop();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn clear_drops_the_task_without_running_it() {
        let scheduler = Scheduler::new(1, false, "fd-context-clear");
        let owner: Weak<dyn Dispatch> = Arc::downgrade(&scheduler) as Weak<dyn Dispatch>;

        let ctx = FdContext::new(3);
        let mut state = ctx.lock();
        state.arm(Event::WRITE, owner, Task::callback(|| panic!("must not run")));
        state.clear(Event::WRITE);

        assert!(state.events.is_empty());
        assert!(state.write.is_empty());
    }
}
