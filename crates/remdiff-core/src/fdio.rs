//! Descriptor-level I/O helpers.
//!
//! The comparison driver hands `diff` the reader end of a pipe as
//! `/dev/fd/N`, which requires working below `std::io`: the reader end
//! must stay inheritable while the writer end must not leak into any
//! child. Feeder writes go straight to the raw descriptor.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Create an anonymous pipe, returning (reader, writer).
///
/// Neither end is close-on-exec; callers decide which end children may
/// inherit.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::io("pipe", io::Error::last_os_error()));
    }
    // SAFETY: pipe(2) returned two fresh descriptors that we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Set FD_CLOEXEC so the descriptor does not leak into spawned children.
pub fn close_on_exec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::io("fcntl F_GETFD", io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::io("fcntl F_SETFD", io::Error::last_os_error()));
    }
    Ok(())
}

/// Write the whole buffer to a raw descriptor, restarting on EINTR.
///
/// Returns the raw `io::Error` so callers can distinguish broken pipes
/// (the normal way a feeder learns that diff stopped reading).
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}
