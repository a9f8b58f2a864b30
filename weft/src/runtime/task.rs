//! Units of work accepted by a [`Scheduler`](crate::Scheduler).

use crate::fiber::Fiber;

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

/// A plain closure task. It runs inside a fiber the worker reuses.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Something a scheduler can run.
pub enum Task {
    /// An existing fiber, resumed where it last suspended.
    Fiber(Arc<Fiber>),

    /// A closure, run to completion (or to its first suspension) on a
    /// worker-owned fiber.
    Callback(Callback),
}

impl Task {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A queued task plus its optional thread affinity.
pub(crate) struct Entry {
    pub(crate) task: Task,

    /// `None` lets any worker run the task.
    pub(crate) thread: Option<ThreadId>,
}

impl Entry {
    pub(crate) fn new(task: Task, thread: Option<ThreadId>) -> Self {
        Self { task, thread }
    }

    /// `true` if the worker running on `me` may take this entry now.
    ///
    /// A fiber still in `EXEC` has been scheduled by someone else before its
    /// own thread finished switching away from it, so it has to wait.
    pub(crate) fn runnable_on(&self, me: ThreadId) -> bool {
        if self.thread.is_some_and(|thread| thread != me) {
            return false;
        }
        match &self.task {
            Task::Fiber(fiber) => fiber.state() != crate::FiberState::Exec,
            Task::Callback(_) => true,
        }
    }
}
