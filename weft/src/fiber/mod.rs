//! Stackful user-space coroutines.
//!
//! A [`Fiber`] owns a private stack and a saved register set. Calling
//! [`Fiber::resume`] switches the current thread onto that stack; the fiber
//! runs until it calls [`Fiber::yield_to_ready`] or [`Fiber::yield_to_hold`],
//! or until its body returns. Control then comes back to whoever resumed it.
//!
//! Each thread also has a *root* fiber (id 0) standing for its native stack.
//! It is created on first use by [`Fiber::current`] and can never be resumed.
//!
//! The fiber body runs behind `catch_unwind`: a panic ends the fiber in
//! [`FiberState::Except`] and is logged, it never unwinds into the resumer.
//!
//! ## State protocol
//!
//! A suspending fiber records the state it wants (`READY`, `HOLD`, `TERM` or
//! `EXCEPT`) and switches away. The resumer publishes that state only after
//! the switch has fully completed, so another thread observing `READY` or
//! `HOLD` can never resume a half-saved context.

mod stack;
mod state;

pub use state::FiberState;

use crate::config;
use crate::error::Result;
use crate::runtime::context;

use stack::{Context, Machine};
use state::{EXCEPT, EXEC, HOLD, INIT, READY, TERM};

use log::{debug, error, warn};

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

type Callback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE: AtomicU64 = AtomicU64::new(0);

/// A stackful coroutine.
pub struct Fiber {
    id: u64,
    root: bool,
    state: AtomicU8,
    inner: UnsafeCell<Inner>,
}

struct Inner {
    /// `None` for root fibers, which run on the thread's native stack.
    machine: Option<Machine>,
    /// Where control goes when the fiber suspends.
    caller: Context,
    callback: Option<Callback>,
    /// State requested by the last suspension, published by the resumer.
    parked_as: u8,
}

// `inner` is only touched by the thread that currently owns the fiber: the
// one running it, or the one that resumed it once the switch back is done.
// The atomic state CAS in `resume` serializes ownership transfers.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with the configured default stack size.
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be mapped. Use
    /// [`Fiber::try_with_stack_size`] to handle that case.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(f, 0)
    }

    /// Creates a fiber with an explicit stack size. `0` selects the default
    /// from [`config::FIBER_STACK_SIZE`].
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be mapped.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_with_stack_size(f, stack_size) {
            Ok(fiber) => fiber,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_with_stack_size<F>(f: F, stack_size: usize) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::FIBER_STACK_SIZE.get()
        } else {
            stack_size
        };

        let machine = Machine::new(size, trampoline)?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE.fetch_add(1, Ordering::Relaxed);

        debug!("fiber {} created with a {} byte stack", id, machine.stack.size());

        Ok(Arc::new(Fiber {
            id,
            root: false,
            state: AtomicU8::new(INIT),
            inner: UnsafeCell::new(Inner {
                machine: Some(machine),
                caller: Context::new(),
                callback: Some(Box::new(f)),
                parked_as: HOLD,
            }),
        }))
    }

    pub(crate) fn root() -> Arc<Fiber> {
        LIVE.fetch_add(1, Ordering::Relaxed);
        debug!("root fiber created for {:?}", std::thread::current().id());

        Arc::new(Fiber {
            id: 0,
            root: true,
            state: AtomicU8::new(EXEC),
            inner: UnsafeCell::new(Inner {
                machine: None,
                caller: Context::new(),
                callback: None,
                parked_as: EXEC,
            }),
        })
    }

    /// Returns the fiber running on this thread, or the thread's root fiber.
    pub fn current() -> Arc<Fiber> {
        context::current_fiber().unwrap_or_else(context::root_fiber)
    }

    /// Id of the running fiber, `0` on a thread's native stack.
    pub fn current_id() -> u64 {
        let current = context::current_fiber_ptr();
        if current.is_null() {
            0
        } else {
            unsafe { (*current).id }
        }
    }

    /// `true` when called from a fiber body rather than a native stack.
    pub fn in_fiber() -> bool {
        !context::current_fiber_ptr().is_null()
    }

    /// Number of fibers currently alive, root fibers included.
    pub fn total() -> u64 {
        LIVE.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Switches the current thread onto this fiber until it suspends.
    ///
    /// Returns the state the fiber suspended in. Once published the fiber may
    /// already be running elsewhere, so callers must branch on this value
    /// rather than on a later [`state`](Fiber::state).
    ///
    /// # Panics
    ///
    /// Panics if the fiber is a root fiber or is not in `INIT`, `READY` or
    /// `HOLD`. A terminated fiber must be [`reset`](Fiber::reset) first.
    pub fn resume(self: &Arc<Self>) -> FiberState {
        assert!(!self.root, "the root fiber cannot be resumed");

        let state = self.state();
        assert!(
            state.is_resumable(),
            "fiber {} cannot be resumed from {}",
            self.id,
            state
        );
        if self
            .state
            .compare_exchange(state as u8, EXEC, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("fiber {} was resumed concurrently", self.id);
        }

        let previous = context::replace_current_fiber(Some(self.clone()));

        let inner = self.inner.get();
        unsafe {
            let target: *const Context = match &(*inner).machine {
                Some(machine) => &machine.context,
                None => unreachable!("non-root fiber without a stack"),
            };
            Context::switch(ptr::addr_of_mut!((*inner).caller), target);
        }

        context::replace_current_fiber(previous);

        let next = unsafe { (*inner).parked_as };
        self.state.store(next, Ordering::Release);
        FiberState::from_raw(next)
    }

    /// Suspends the running fiber and asks to be scheduled again.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn yield_to_ready() {
        Self::yield_with(READY);
    }

    /// Suspends the running fiber until something external resumes it.
    ///
    /// The caller must already have arranged a wake-up (an I/O event, a
    /// timer) or the fiber will stay parked forever.
    ///
    /// # Panics
    ///
    /// Panics when called outside a fiber.
    pub fn yield_to_hold() {
        Self::yield_with(HOLD);
    }

    fn yield_with(state: u8) {
        let current = context::current_fiber_ptr();
        assert!(!current.is_null(), "cannot yield outside of a fiber");

        // The resumer holds a strong reference for as long as we run.
        let fiber = unsafe { &*current };
        fiber.suspend(state);
    }

    fn suspend(&self, state: u8) {
        let inner = self.inner.get();
        unsafe {
            (*inner).parked_as = state;
            let save: *mut Context = match &mut (*inner).machine {
                Some(machine) => &mut machine.context,
                None => unreachable!("root fiber cannot suspend"),
            };
            Context::switch(save, ptr::addr_of!((*inner).caller));
        }
    }

    /// Rearms a finished (or never started) fiber with a new body, reusing
    /// its stack.
    ///
    /// Must not race with [`resume`](Fiber::resume) on the same fiber.
    ///
    /// # Panics
    ///
    /// Panics on root fibers and on fibers in `READY`, `EXEC` or `HOLD`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(!self.root, "the root fiber cannot be reset");

        let state = self.state();
        assert!(
            state == FiberState::Init || state.is_terminal(),
            "fiber {} cannot be reset from {}",
            self.id,
            state
        );

        let inner = unsafe { &mut *self.inner.get() };
        inner.callback = Some(Box::new(f));
        if let Some(machine) = inner.machine.as_mut() {
            machine.rearm(trampoline);
        }

        self.state.store(INIT, Ordering::Release);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("root", &self.root)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);

        let state = self.state();
        if let Some(machine) = self.inner.get_mut().machine.take() {
            if state == FiberState::Init || state.is_terminal() {
                drop(machine);
            } else {
                // Frames on this stack were never unwound.
                warn!(
                    "fiber {} dropped while {}, leaking its {} byte stack",
                    self.id,
                    state,
                    machine.stack.size()
                );
                std::mem::forget(machine);
            }
        }

        debug!("fiber {} destroyed", self.id);
    }
}

/// First frame of every fiber stack.
extern "C" fn trampoline() {
    let current = context::current_fiber_ptr();
    // Only reachable through `resume`, which installed the fiber and keeps it
    // alive until the final switch below.
    let fiber = unsafe { &*current };

    let callback = unsafe { (*fiber.inner.get()).callback.take() };
    let outcome = match callback {
        Some(callback) => panic::catch_unwind(AssertUnwindSafe(callback)),
        None => Ok(()),
    };

    let next = match outcome {
        Ok(()) => TERM,
        Err(payload) => {
            error!(
                "fiber {} panicked: {}",
                fiber.id,
                panic_message(payload.as_ref())
            );
            EXCEPT
        }
    };

    fiber.suspend(next);

    error!("terminated fiber {} was resumed", fiber.id);
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
