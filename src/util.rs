use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{c_int, c_void, nfds_t, pollfd, POLLIN};

use crate::errors::{Error, Result};

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Number of bytes currently queued for reading on `fd` (the FIONREAD
/// probe). The value is a hint: it can change before a subsequent read
/// observes the descriptor.
pub(crate) fn buffered_bytes(fd: RawFd) -> Result<usize> {
    let mut pending: c_int = 0;
    let result = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut pending) };
    match result {
        -1 => Err(match errno() {
            libc::EBADF => Error::InvalidState("handle is not open"),
            other => Error::Unknown(other),
        }),
        _ => Ok(pending as usize),
    }
}

pub(crate) fn read_into_buffer(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len()) }
}

/// Blocks until `fd` is readable. Returns `false` if the timeout expired
/// first; a timeout of `None` waits indefinitely.
pub(crate) fn await_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        Some(timeout) => timeout.as_millis().min(c_int::MAX as u128) as c_int,
        None => -1,
    };

    let mut fds = [pollfd {
        fd,
        events: POLLIN,
        revents: 0,
    }];

    let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
    match result {
        -1 => Err(match errno() {
            libc::EBADF => Error::InvalidState("handle is not open"),
            libc::ENOMEM => Error::InsufficientMemory,
            other => Error::Unknown(other),
        }),
        0 => Ok(false),
        _ => Ok(true),
    }
}
