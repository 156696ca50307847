//! Zero-copy file transmission.
//!
//! The source picks between `sendfile(2)` and a `mmap`+`write` fallback at configure time
//! (`src/PLATFORM NOTES`); this crate makes the same choice per write attempt, since `sendfile`
//! can fail with `EINVAL` on filesystems that don't support it (tmpfs on some kernels) and the
//! mmap path is always available as a fallback.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use memmap2::Mmap;
use support::error::WaitError;

/// Outcome of one attempt to push more of a file to a socket.
pub enum Progress {
    /// `n` bytes were transferred; not yet at `total`.
    Advanced(u64),
    /// The transfer reached `total` bytes.
    Complete,
    /// The socket isn't writable right now; try again once the reactor says it is.
    WouldBlock,
}

/// In-flight zero-copy transfer of one file's contents to one socket.
pub struct SendfileState {
    file: File,
    offset: u64,
    total: u64,
    mmap: Option<Mmap>,
}

impl SendfileState {
    pub fn new(file: File, offset: u64, total: u64) -> SendfileState {
        SendfileState { file, offset, total, mmap: None }
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.offset
    }

    /// Attempts to push as much of the remaining range as the kernel or the socket will take in
    /// one call. `dst` is the destination socket's raw fd.
    pub fn advance(&mut self, dst: RawFd) -> io::Result<Progress> {
        if self.remaining() == 0 {
            return Ok(Progress::Complete);
        }

        match platform_sendfile(dst, self.file.as_raw_fd(), self.offset, self.remaining()) {
            Ok(0) => self.advance_via_mmap(dst),
            Ok(n) => {
                self.offset += n;
                if self.remaining() == 0 {
                    Ok(Progress::Complete)
                } else {
                    Ok(Progress::Advanced(n))
                }
            }
            Err(err) if err.is_wait() => Ok(Progress::WouldBlock),
            Err(err) if is_unsupported(&err) => self.advance_via_mmap(dst),
            Err(err) => Err(err),
        }
    }

    fn advance_via_mmap(&mut self, dst: RawFd) -> io::Result<Progress> {
        if self.mmap.is_none() {
            self.mmap = Some(unsafe { Mmap::map(&self.file)? });
        }
        let mmap = self.mmap.as_ref().expect("just populated");

        let start = self.offset as usize;
        let end = (start + self.remaining() as usize).min(mmap.len());
        let chunk = &mmap[start..end];

        match write_raw(dst, chunk) {
            Ok(0) => Ok(Progress::WouldBlock),
            Ok(n) => {
                self.offset += n as u64;
                if self.remaining() == 0 {
                    Ok(Progress::Complete)
                } else {
                    Ok(Progress::Advanced(n as u64))
                }
            }
            Err(err) if err.is_wait() => Ok(Progress::WouldBlock),
            Err(err) => Err(err),
        }
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS))
}

fn write_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(target_os = "linux")]
fn platform_sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: u64) -> io::Result<u64> {
    let mut off = offset as libc::off_t;
    let ret = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count as libc::size_t) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as u64)
    }
}

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn platform_sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: u64) -> io::Result<u64> {
    let mut sbytes: libc::off_t = 0;
    let ret = unsafe {
        libc::sendfile(
            in_fd,
            out_fd,
            offset as libc::off_t,
            count as libc::size_t,
            std::ptr::null_mut(),
            &mut sbytes,
            0,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock && sbytes > 0 {
            Ok(sbytes as u64)
        } else {
            Err(err)
        }
    } else {
        Ok(sbytes as u64)
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn platform_sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: u64) -> io::Result<u64> {
    let mut len: libc::off_t = count as libc::off_t;
    let ret = unsafe {
        libc::sendfile(
            in_fd,
            out_fd,
            offset as libc::off_t,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock && len > 0 {
            Ok(len as u64)
        } else {
            Err(err)
        }
    } else {
        Ok(len as u64)
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "macos",
    target_os = "ios"
)))]
fn platform_sendfile(_out_fd: RawFd, _in_fd: RawFd, _offset: u64, _count: u64) -> io::Result<u64> {
    // No native sendfile encapsulated for this target; report "wrote nothing" so the caller
    // falls straight through to the mmap path.
    Ok(0)
}
