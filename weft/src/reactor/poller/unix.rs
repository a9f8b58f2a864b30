use libc::{F_GETFL, F_SETFL, O_NONBLOCK, SO_ERROR, SOL_SOCKET, c_int, fcntl, socklen_t};
use std::os::fd::RawFd;
use std::{io, mem};

/// Reads the calling thread's `errno`.
pub(crate) fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Overwrites the calling thread's `errno`.
pub(crate) fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Returns the file status flags of a descriptor.
pub(crate) fn sys_get_flags(fd: RawFd) -> io::Result<c_int> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(flags)
    }
}

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = sys_get_flags(fd)?;
    if flags & O_NONBLOCK != 0 {
        return Ok(());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Returns `true` if `fd` refers to a socket.
pub(crate) fn sys_is_socket(fd: RawFd) -> io::Result<bool> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
}

/// Reads and clears the pending error of a socket (`SO_ERROR`).
pub(crate) fn sys_socket_error(fd: RawFd) -> io::Result<c_int> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut error as *mut c_int as *mut _,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(error)
    }
}
