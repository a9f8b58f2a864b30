use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::reactor::io::FdContext;
use crate::reactor::poller::epoll::Op;
use crate::reactor::poller::{EpollPoller, WAKE_TOKEN};
use crate::reactor::Event;
use crate::runtime::context;
use crate::runtime::scheduler::{Dispatch, Scheduler};
use crate::runtime::task::Task;
use crate::time::{Timer, TimerCallback, TimerManager};

use libc::{EPOLLERR, EPOLLHUP, epoll_event};
use log::{debug, error, info};
use parking_lot::RwLock;

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Upper bound on a single `epoll_wait`, in milliseconds.
const MAX_TIMEOUT_MS: u64 = 5000;

/// Events collected per `epoll_wait` call.
const MAX_EVENTS: usize = 256;

const INITIAL_CONTEXTS: usize = 32;

/// A fiber scheduler whose idle workers wait on epoll and timers.
///
/// The `IoManager` is responsible for:
/// - running fibers and callbacks like a [`Scheduler`],
/// - parking fibers on fd readiness ([`add_event`](Self::add_event)),
/// - firing timers ([`add_timer`](Self::add_timer)),
/// - keeping the pool alive while events or timers are still pending.
///
/// Idle workers block in `epoll_wait` on a shared instance, bounded by the
/// next timer deadline. New work interrupts them through an internal
/// eventfd.
///
/// # Examples
///
/// ```rust,ignore
/// let iom = weft::Builder::new().threads(2).build()?;
///
/// iom.schedule(|| {
///     weft::time::sleep(Duration::from_millis(10));
/// });
///
/// iom.stop();
/// ```
pub struct IoManager {
    scheduler: Scheduler,
    timers: TimerManager,
    poller: EpollPoller,

    /// Indexed by fd. Grown on demand, never shrunk.
    contexts: RwLock<Vec<Arc<FdContext>>>,

    /// Registered, not yet fired or removed, interests across all fds.
    pending_events: AtomicUsize,
}

impl IoManager {
    /// Creates the I/O manager and starts its worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> io::Result<Arc<IoManager>> {
        let poller = EpollPoller::new()?;
        let name = name.into();

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let owner: Weak<dyn Dispatch> = weak.clone();
            let front = weak.clone();

            IoManager {
                scheduler: Scheduler::with_owner(owner, threads, use_caller, name),
                timers: TimerManager::with_front_hook(move || {
                    if let Some(iom) = front.upgrade() {
                        iom.tickle();
                    }
                }),
                poller,
                contexts: RwLock::new(Vec::new()),
                pending_events: AtomicUsize::new(0),
            }
        });

        grow(&mut iom.contexts.write(), INITIAL_CONTEXTS);
        iom.scheduler.start()?;

        Ok(iom)
    }

    /// Returns the I/O manager driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        context::current_scheduler().and_then(|scheduler| scheduler.io_manager())
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Number of registered interests that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.scheduler.thread_ids()
    }

    /// Queues a closure on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    pub fn schedule_on(&self, task: Task, thread: ThreadId) {
        self.scheduler.schedule_on(task, thread);
    }

    pub fn schedule_task(&self, task: Task, thread: Option<ThreadId>) {
        self.scheduler.schedule_task(task, thread);
    }

    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.scheduler.schedule_batch(tasks);
    }

    /// See [`Scheduler::block_on`].
    pub fn block_on<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.block_on(f)
    }

    /// Stops the manager once the queue, every pending event and every
    /// timer have drained. See [`Scheduler::stop`].
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + ?Sized + 'static,
    {
        self.timers.add_condition_timer(ms, callback, condition, recurring)
    }

    /// Parks the current fiber's continuation on `event` for `fd`.
    ///
    /// The caller is expected to [`Fiber::yield_to_hold`] right after; the
    /// fiber is scheduled again when the event fires or is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Epoll`] if the kernel rejects the registration.
    ///
    /// # Panics
    ///
    /// Panics outside a fiber, if `event` is not exactly one of
    /// [`Event::READ`] and [`Event::WRITE`], or if `event` is already
    /// registered on `fd`.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let fiber = Fiber::current();
        assert!(
            !fiber.is_root(),
            "add_event without a callback must be called from a fiber"
        );
        self.register(fd, event, Task::Fiber(fiber))
    }

    /// Runs `callback` on the scheduler once `event` fires on `fd`.
    ///
    /// Same contract as [`add_event`](Self::add_event), but usable from
    /// any thread.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Task::callback(callback))
    }

    fn register(&self, fd: RawFd, event: Event, task: Task) -> Result<()> {
        assert!(event.is_single(), "add_event takes exactly one interest, got {event:?}");

        let Ok(index) = usize::try_from(fd) else {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EBADF)));
        };
        let ctx = self.context_or_grow(index);
        let mut state = ctx.lock();

        assert!(
            !state.events.contains(event),
            "fd {fd} already has {event:?} registered (registered: {:?})",
            state.events
        );

        let op = if state.events.is_empty() { Op::Add } else { Op::Modify };
        let interest = state.events | event;
        if let Err(source) = self.poller.control(op, fd, interest.bits()) {
            error!("epoll_ctl({}, {fd}, {interest:?}) failed: {source}", op.name());
            return Err(Error::Epoll {
                op: op.name(),
                fd,
                source,
            });
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);

        let scheduler = context::current_scheduler()
            .map(|current| Arc::downgrade(&current))
            .unwrap_or_else(|| self.scheduler.owner());
        state.arm(event, scheduler, task);

        Ok(())
    }

    /// Removes `event` from `fd` without running its continuation.
    ///
    /// Returns `false` if it was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove(fd, event, false)
    }

    /// Removes `event` from `fd` and runs its continuation immediately, as
    /// if the event had fired.
    ///
    /// Returns `false` if it was not registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove(fd, event, true)
    }

    fn remove(&self, fd: RawFd, event: Event, fire: bool) -> bool {
        assert!(event.is_single(), "expected exactly one interest, got {event:?}");

        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let mut state = ctx.lock();
        if !state.events.contains(event) {
            return false;
        }

        let left = state.events - event;
        if let Err(err) = self.update_interest(fd, left) {
            error!("{err}");
            return false;
        }

        if fire {
            state.trigger(fd, event);
        } else {
            state.clear(event);
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Removes every interest on `fd`, running each continuation.
    ///
    /// Returns `false` if nothing was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd) else {
            return false;
        };
        let mut state = ctx.lock();
        if state.events.is_empty() {
            return false;
        }

        if let Err(err) = self.update_interest(fd, Event::empty()) {
            error!("{err}");
            return false;
        }

        for event in [Event::READ, Event::WRITE] {
            if state.events.contains(event) {
                state.trigger(fd, event);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
        true
    }

    fn update_interest(&self, fd: RawFd, left: Event) -> Result<()> {
        let op = if left.is_empty() { Op::Delete } else { Op::Modify };
        self.poller
            .control(op, fd, left.bits())
            .map_err(|source| Error::Epoll {
                op: op.name(),
                fd,
                source,
            })
    }

    fn context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.contexts.read().get(index).cloned()
    }

    fn context_or_grow(&self, index: usize) -> Arc<FdContext> {
        if let Some(ctx) = self.contexts.read().get(index) {
            return ctx.clone();
        }

        let mut contexts = self.contexts.write();
        grow(&mut contexts, (index * 3 / 2).max(index + 1));
        contexts[index].clone()
    }

    /// Hands the fired interests of one epoll event to their schedulers.
    fn dispatch_ready(&self, fd: RawFd, raw: u32) {
        let Some(ctx) = self.context(fd) else {
            return;
        };
        let mut state = ctx.lock();

        let mut ready = Event::from_bits_truncate(raw);
        if raw & (EPOLLERR | EPOLLHUP) as u32 != 0 {
            ready |= state.events;
        }

        let fired = ready & state.events;
        if fired.is_empty() {
            return;
        }

        if let Err(err) = self.update_interest(fd, state.events - fired) {
            error!("{err}");
            return;
        }

        for event in [Event::READ, Event::WRITE] {
            if fired.contains(event) {
                state.trigger(ctx.fd(), event);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Dispatch for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        self.poller.wake();
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping()
    }

    fn idle(&self) {
        let me = thread::current().id();
        let mut events: Vec<epoll_event> = Vec::with_capacity(MAX_EVENTS);
        let mut expired: Vec<TimerCallback> = Vec::new();

        loop {
            let next_timer = self.timers.next_timer();
            if next_timer.is_none() && self.stopping() {
                debug!("io manager {}: idle fiber on {:?} exiting", self.name(), me);
                // Pass the wake-up on to the next worker still waiting.
                self.poller.wake();
                break;
            }

            let mut timeout = next_timer.map_or(MAX_TIMEOUT_MS, |ms| ms.min(MAX_TIMEOUT_MS));
            if self.scheduler.has_runnable(me) {
                timeout = 0;
            }

            if let Err(err) = self.poller.wait(&mut events, timeout as i32) {
                error!("io manager {}: epoll_wait failed: {err}", self.name());
            }

            self.timers.list_expired(&mut expired);
            if !expired.is_empty() {
                self.scheduler
                    .schedule_batch(expired.drain(..).map(|callback| Task::callback(move || callback())));
            }

            for event in events.iter().copied() {
                let (token, raw) = (event.u64, event.events);
                if token == WAKE_TOKEN {
                    self.poller.drain_wakeups();
                    continue;
                }
                self.dispatch_ready(token as RawFd, raw);
            }

            Fiber::yield_to_hold();
        }
    }

    fn io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        info!("io manager {} destroyed", self.scheduler.name());
    }
}

fn grow(contexts: &mut Vec<Arc<FdContext>>, len: usize) {
    while contexts.len() < len {
        let fd = contexts.len() as RawFd;
        contexts.push(Arc::new(FdContext::new(fd)));
    }
}
