//! Thin wrappers over socket options and syscalls not exposed by `std`.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// Sets or clears `TCP_CORK`. A no-op where the option does not exist.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn set_cork(fd: RawFd, cork: bool) -> io::Result<()> {
    let optval: libc::c_int = cork as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_cork(_fd: RawFd, _cork: bool) -> io::Result<()> {
    Ok(())
}

/// Sends up to `len` bytes of `file` starting at `offset` straight to `fd`.
///
/// Returns `ErrorKind::Unsupported` when the platform has no usable
/// `sendfile`, so the caller can fall back to read + write.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn sendfile(fd: RawFd, file: &File, offset: u64, len: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    let ret = unsafe { libc::sendfile(fd, file.as_raw_fd(), &mut off, len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::ENOSYS) => {
                Err(io::Error::new(io::ErrorKind::Unsupported, err))
            }
            _ => Err(err),
        };
    }
    Ok(ret as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn sendfile(_fd: RawFd, _file: &File, _offset: u64, _len: usize) -> io::Result<usize> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
