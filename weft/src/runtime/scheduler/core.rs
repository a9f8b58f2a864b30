use crate::fiber::Fiber;
use crate::runtime::context;
use crate::runtime::scheduler::{Dispatch, worker};
use crate::runtime::task::{Entry, Task};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use std::collections::VecDeque;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// How long an idle worker of a plain scheduler sleeps before re-checking.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Multi-threaded fiber scheduler.
///
/// The `Scheduler` is responsible for:
/// - spawning worker threads and joining them on [`stop`](Self::stop),
/// - queueing fibers and callbacks, optionally pinned to one thread,
/// - letting the creating thread take part in execution (`use_caller`),
/// - deciding when the pool may shut down.
///
/// Tasks are taken in FIFO order, skipping entries pinned to another thread.
pub struct Scheduler {
    name: String,

    /// The variant wrapping this scheduler. Tickles and idle waits go
    /// through it.
    owner: Weak<dyn Dispatch>,

    queue: Mutex<VecDeque<Entry>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<ThreadId>>,

    /// Number of dedicated worker threads, the caller excluded.
    thread_count: usize,

    /// Thread that created the scheduler, when it takes part in execution.
    caller: Option<ThreadId>,

    /// Workers currently running a task. Incremented under the queue lock.
    active: AtomicUsize,

    /// Workers currently inside their idle fiber.
    idle: AtomicUsize,

    /// `true` until started, and again once `stop` has been requested.
    stopping: AtomicBool,

    /// Set by `stop`: the pool should exit once all work is drained.
    auto_stop: AtomicBool,

    park: Mutex<()>,
    unpark: Condvar,
}

impl Scheduler {
    /// Creates a plain scheduler that parks idle workers on a condition
    /// variable. Workers are spawned by [`start`](Self::start).
    ///
    /// With `use_caller`, the calling thread counts as one of the `threads`
    /// and runs the dispatch loop itself inside [`stop`](Self::stop).
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let owner: Weak<dyn Dispatch> = weak.clone();
            Scheduler::with_owner(owner, threads, use_caller, name.into())
        })
    }

    pub(crate) fn with_owner(
        owner: Weak<dyn Dispatch>,
        threads: usize,
        use_caller: bool,
        name: String,
    ) -> Scheduler {
        assert!(threads > 0, "threads must be > 0");

        let caller = use_caller.then(|| thread::current().id());
        let thread_count = if use_caller { threads - 1 } else { threads };

        Scheduler {
            name,
            owner,
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            thread_ids: Mutex::new(caller.into_iter().collect()),
            thread_count,
            caller,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            park: Mutex::new(()),
            unpark: Condvar::new(),
        }
    }

    /// Returns the scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<dyn Dispatch>> {
        context::current_scheduler()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of every thread that runs tasks, the caller included when it
    /// participates. Valid targets for [`schedule_on`](Self::schedule_on).
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }

    pub fn active_threads(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_threads(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads() > 0
    }

    pub(crate) fn owner(&self) -> Weak<dyn Dispatch> {
        self.owner.clone()
    }

    /// Spawns the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut workers = self.workers.lock();
        if !self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }

        let Some(owner) = self.owner.upgrade() else {
            return Ok(());
        };
        self.stopping.store(false, Ordering::SeqCst);

        for index in 0..self.thread_count {
            let dispatch = owner.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, index))
                .spawn(move || worker::run(dispatch))?;

            self.thread_ids.lock().push(handle.thread().id());
            workers.push(handle);
        }

        info!(
            "scheduler {} started with {} worker threads{}",
            self.name,
            self.thread_count,
            if self.caller.is_some() { " plus the caller" } else { "" }
        );
        Ok(())
    }

    /// Requests shutdown and waits until every queued task, pending timer
    /// and registered I/O event has been dealt with.
    ///
    /// A caller-participating scheduler drains the remaining work on the
    /// calling thread before joining the workers.
    ///
    /// # Panics
    ///
    /// Panics when called from one of the scheduler's own fibers, or, with
    /// `use_caller`, from a thread other than the one that created it.
    pub fn stop(&self) {
        info!("scheduler {} stopping", self.name);

        if let Some(current) = context::current_scheduler() {
            assert!(
                !ptr::eq(current.scheduler(), self),
                "scheduler {} cannot be stopped from its own fibers",
                self.name
            );
        }
        if let Some(caller) = self.caller {
            assert_eq!(
                thread::current().id(),
                caller,
                "scheduler {} must be stopped from the thread that created it",
                self.name
            );
        }

        self.auto_stop.store(true, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);

        let Some(owner) = self.owner.upgrade() else {
            return;
        };

        for _ in 0..self.thread_count {
            owner.tickle();
        }

        if self.caller.is_some() {
            owner.tickle();
            if !owner.stopping() {
                debug!("scheduler {} draining on the caller thread", self.name);
                worker::run(owner.clone());
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("scheduler {}: a worker thread panicked", self.name);
            }
        }

        info!("scheduler {} stopped", self.name);
    }

    /// Queues a closure on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::callback(f), None);
    }

    /// Queues an existing fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::Fiber(fiber), None);
    }

    /// Queues a task that only `thread` may run.
    pub fn schedule_on(&self, task: Task, thread: ThreadId) {
        self.schedule_task(task, Some(thread));
    }

    pub fn schedule_task(&self, task: Task, thread: Option<ThreadId>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Entry::new(task, thread));
            was_empty
        };

        if need_tickle {
            self.tickle();
        }
    }

    /// Queues several tasks under a single lock acquisition.
    ///
    /// Wakes a worker at most once.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| Entry::new(task, None)));
            was_empty && queue.len() > before
        };

        if need_tickle {
            self.tickle();
        }
    }

    /// Runs `f` in a fiber and blocks the calling thread until it returns.
    ///
    /// This is the synchronous entry point used by `main` and tests.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler has no dedicated worker thread, or if `f`
    /// panics.
    pub fn block_on<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(
            self.thread_count > 0,
            "block_on needs at least one dedicated worker thread"
        );

        let (transmitter, receiver) = mpsc::channel();

        self.schedule(move || {
            let _ = transmitter.send(f());
        });

        match receiver.recv() {
            Ok(value) => value,
            Err(_) => panic!("block_on: the fiber panicked before producing a value"),
        }
    }

    fn tickle(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.tickle();
        }
    }

    /// Takes the first entry `me` may run.
    ///
    /// Also reports whether other workers should be woken because entries
    /// pinned to them were skipped.
    pub(crate) fn take_next(&self, me: ThreadId) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();

        let mut tickle_others = false;
        let mut found = None;
        for (index, entry) in queue.iter().enumerate() {
            if entry.thread.is_some_and(|thread| thread != me) {
                tickle_others = true;
                continue;
            }
            if entry.runnable_on(me) {
                found = Some(index);
                break;
            }
        }

        let task = found.and_then(|index| queue.remove(index)).map(|entry| entry.task);
        if task.is_some() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }

        (task, tickle_others)
    }

    /// `true` if the queue holds an entry `me` may run now or as soon as
    /// its fiber finishes switching out.
    pub(crate) fn has_runnable(&self, me: ThreadId) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|entry| entry.thread.is_none_or(|thread| thread == me))
    }

    pub(crate) fn finish_task(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn enter_idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_idle(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    /// Base stop predicate shared by every variant.
    ///
    /// Evaluated under the queue lock: a worker takes a task and bumps the
    /// active count under that same lock, so the two are seen together.
    pub(crate) fn base_stopping(&self) -> bool {
        let queue = self.queue.lock();
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && queue.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }
}

impl Dispatch for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn tickle(&self) {
        let _guard = self.park.lock();
        self.unpark.notify_one();
    }

    fn stopping(&self) -> bool {
        self.base_stopping()
    }

    fn idle(&self) {
        let me = thread::current().id();
        while !self.base_stopping() {
            {
                let mut guard = self.park.lock();
                if !self.has_runnable(me) {
                    self.unpark.wait_for(&mut guard, PARK_TIMEOUT);
                }
            }
            Fiber::yield_to_hold();
        }
        debug!("scheduler {}: idle fiber on {:?} exiting", self.name, me);
    }
}
