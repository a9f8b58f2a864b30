//! Fiber stacks and saved machine contexts.
//!
//! Stacks are anonymous private mappings with a `PROT_NONE` guard page at
//! the low end, so an overflow faults instead of silently corrupting the
//! neighbouring allocation. Contexts wrap `ucontext_t` behind a `Box`: glibc
//! stores pointers into the structure itself, so it must never move once a
//! context has been captured into it.

use crate::error::{Error, Result};

use libc::{c_void, ucontext_t};

use std::{io, mem, ptr};

/// Smallest usable stack the runtime will map, whatever the configuration says.
const MIN_STACK_SIZE: usize = 16 * 1024;

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// An mmap-backed fiber stack.
pub(crate) struct Stack {
    base: *mut c_void,
    len: usize,
    guard: usize,
}

// The mapping is plain memory owned by exactly one fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    pub(crate) fn new(size: usize) -> Result<Self> {
        let guard = page_size();
        let usable = size.max(MIN_STACK_SIZE).next_multiple_of(guard);
        let len = usable + guard;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackAllocation(io::Error::last_os_error()));
        }

        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(Error::StackAllocation(err));
        }

        Ok(Self { base, len, guard })
    }

    /// Lowest usable address, just above the guard page.
    fn bottom(&self) -> *mut c_void {
        unsafe { self.base.cast::<u8>().add(self.guard).cast() }
    }

    /// Usable size in bytes, guard page excluded.
    pub(crate) fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base, self.len) };
    }
}

/// A saved register set.
pub(crate) struct Context(Box<ucontext_t>);

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub(crate) fn new() -> Self {
        Self(Box::new(unsafe { mem::zeroed() }))
    }

    /// Prepares the context to start executing `entry` on `stack`.
    ///
    /// `entry` must never return: nothing is linked after it.
    pub(crate) fn prepare(&mut self, stack: &Stack, entry: extern "C" fn()) {
        let ctx: *mut ucontext_t = &mut *self.0;
        unsafe {
            let rc = libc::getcontext(ctx);
            assert_eq!(rc, 0, "getcontext failed: {}", io::Error::last_os_error());

            (*ctx).uc_link = ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.bottom();
            (*ctx).uc_stack.ss_size = stack.size();
            (*ctx).uc_stack.ss_flags = 0;

            libc::makecontext(ctx, entry, 0);
        }
    }

    /// Saves the running context into `save` and jumps to `target`.
    ///
    /// # Safety
    ///
    /// Both pointers must stay valid until the saved context is resumed, and
    /// `target` must hold a context captured by [`Context::prepare`] or by a
    /// previous `switch`.
    pub(crate) unsafe fn switch(save: *mut Context, target: *const Context) {
        let rc = unsafe { libc::swapcontext(&mut *(*save).0, &*(*target).0) };
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }
}

/// A stack paired with the context that runs on it.
pub(crate) struct Machine {
    pub(crate) stack: Stack,
    pub(crate) context: Context,
}

impl Machine {
    pub(crate) fn new(stack_size: usize, entry: extern "C" fn()) -> Result<Self> {
        let stack = Stack::new(stack_size)?;
        let mut context = Context::new();
        context.prepare(&stack, entry);
        Ok(Self { stack, context })
    }

    /// Rewinds the context to the start of `entry`, reusing the same stack.
    pub(crate) fn rearm(&mut self, entry: extern "C" fn()) {
        self.context.prepare(&self.stack, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_size_is_rounded_to_whole_pages() {
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn tiny_requests_get_the_minimum() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.size() >= MIN_STACK_SIZE);
    }
}
