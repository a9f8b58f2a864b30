use std::os::fd::RawFd;

/// Wake-up channel for threads blocked in `epoll_wait`.
///
/// Wraps a non-blocking `eventfd`. Writing makes it readable until someone
/// drains it, so a wake sent just before a thread starts waiting is not lost.
pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    /// Makes the eventfd readable.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(self.0, &buf as *const u64 as *const _, 8);
        }
    }

    /// Resets the eventfd counter.
    pub(crate) fn drain(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.0, &mut buf as *mut u64 as *mut _, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
