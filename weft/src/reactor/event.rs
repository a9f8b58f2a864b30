use bitflags::bitflags;

bitflags! {
    /// I/O interest on a file descriptor.
    ///
    /// The bit values are the epoll ones, so a set converts to and from the
    /// kernel mask without translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        /// The descriptor is readable (`EPOLLIN`).
        const READ = libc::EPOLLIN as u32;

        /// The descriptor is writable (`EPOLLOUT`).
        const WRITE = libc::EPOLLOUT as u32;
    }
}

impl Event {
    /// `true` for exactly one of [`Event::READ`] and [`Event::WRITE`].
    pub fn is_single(self) -> bool {
        self == Event::READ || self == Event::WRITE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bits_are_dropped_when_truncating() {
        let raw = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;
        assert_eq!(Event::from_bits_truncate(raw), Event::READ);
    }

    #[test]
    fn single_interest() {
        assert!(Event::READ.is_single());
        assert!(Event::WRITE.is_single());
        assert!(!(Event::READ | Event::WRITE).is_single());
        assert!(!Event::empty().is_single());
    }
}
