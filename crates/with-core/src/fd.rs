//! Owning file descriptor handle

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::error::WithError;
use crate::Result;

const INVALID_FD: RawFd = -1;

/// Scoped ownership of one file descriptor.
///
/// At most one live owner per fd. Drop closes silently; [`Fd::reset`] is the
/// reporting path for callers that care about close errors.
#[derive(Debug)]
pub struct Fd {
    raw: RawFd,
}

impl Fd {
    /// A handle holding no descriptor
    #[must_use]
    pub const fn invalid() -> Self {
        Self { raw: INVALID_FD }
    }

    /// Take ownership of `raw`
    #[must_use]
    pub const fn from_raw(raw: RawFd) -> Self {
        Self { raw }
    }

    /// Create a pipe pair (read end, write end), optionally close-on-exec
    pub fn pipe(cloexec: bool) -> Result<(Self, Self)> {
        let mut fds = [0 as RawFd; 2];
        let flags = if cloexec { libc::O_CLOEXEC } else { 0 };
        // SAFETY: pipe2 fills the two-element array we hand it
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), flags) };
        if ret != 0 {
            return Err(WithError::sys("pipe2"));
        }
        Ok((Self::from_raw(fds[0]), Self::from_raw(fds[1])))
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.raw != INVALID_FD
    }

    /// The raw descriptor; an error if the handle is empty
    pub fn raw(&self) -> Result<RawFd> {
        if self.is_open() {
            Ok(self.raw)
        } else {
            Err(WithError::Setup("use of invalid fd".into()))
        }
    }

    /// Close any current descriptor (reporting close errors) and hold `new`
    /// instead.
    pub fn reset_to(&mut self, new: RawFd) -> Result<()> {
        let old = std::mem::replace(&mut self.raw, new);
        if old != INVALID_FD {
            // SAFETY: we owned `old` and forget it regardless of the outcome
            let ret = unsafe { libc::close(old) };
            if ret != 0 {
                return Err(WithError::sys("close"));
            }
        }
        Ok(())
    }

    /// Close any current descriptor, leaving the handle empty
    pub fn reset(&mut self) -> Result<()> {
        self.reset_to(INVALID_FD)
    }

    /// Destructively transfer the descriptor out of `src` into `self`
    pub fn move_from(&mut self, src: &mut Self) -> Result<()> {
        let raw = std::mem::replace(&mut src.raw, INVALID_FD);
        self.reset_to(raw)
    }

    /// Mark the descriptor close-on-exec
    pub fn set_cloexec(&self) -> Result<()> {
        let fd = self.raw()?;
        // SAFETY: fd is owned and open
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(WithError::sys("fcntl(F_GETFD)"));
        }
        // SAFETY: as above
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(WithError::sys("fcntl(F_SETFD)"));
        }
        Ok(())
    }

    /// Put the descriptor into non-blocking mode
    pub fn set_nonblocking(&self) -> Result<()> {
        let fd = self.raw()?;
        // SAFETY: fd is owned and open
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(WithError::sys("fcntl(F_GETFL)"));
        }
        // SAFETY: as above
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(WithError::sys("fcntl(F_SETFL)"));
        }
        Ok(())
    }
}

impl Default for Fd {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.raw != INVALID_FD {
            // SAFETY: we own the descriptor; errors cannot be reported here
            let ret = unsafe { libc::close(self.raw) };
            if ret != 0 {
                tracing::warn!(fd = self.raw, errno = ?Errno::last(), "close failed in drop");
            }
            self.raw = INVALID_FD;
        }
    }
}

/// Deliver the whole buffer to `fd` in one write(2), retrying only a
/// fruitless EINTR. A short write is a failure: the caller falls back
/// rather than retrying, so a stalled consumer cannot end up with part of
/// the buffer while the fallback path carries all of it.
pub fn write_once(fd: RawFd, buf: &[u8]) -> Result<()> {
    loop {
        // SAFETY: buf is a live slice; write reads at most buf.len() bytes
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return Err(WithError::sys("write"));
        }
        if (n as usize) < buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {n} of {} bytes", buf.len()),
            )
            .into());
        }
        return Ok(());
    }
}

/// Write the whole buffer to `fd`, looping on partial writes and EINTR.
/// A write that makes no progress is a failure.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        // SAFETY: buf is a live slice; write reads at most buf.len() bytes
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return Err(WithError::sys("write"));
        }
        if n == 0 {
            return Err(WithError::Sys {
                call: "write".into(),
                errno: Errno::EIO,
            });
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloexec_set(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn pipe_pair_round_trips_bytes() {
        let (rd, wr) = Fd::pipe(false).unwrap();
        assert!(!cloexec_set(rd.raw().unwrap()));
        write_all(wr.raw().unwrap(), b"ping").unwrap();
        drop(wr);

        let mut buf = [0u8; 16];
        let n = unsafe {
            libc::read(rd.raw().unwrap(), buf.as_mut_ptr().cast(), buf.len())
        };
        assert_eq!(&buf[..n as usize], b"ping");
    }

    #[test]
    fn pipe_cloexec_marks_both_ends() {
        let (rd, wr) = Fd::pipe(true).unwrap();
        assert!(cloexec_set(rd.raw().unwrap()));
        assert!(cloexec_set(wr.raw().unwrap()));
    }

    #[test]
    fn invalid_fd_is_reported() {
        let fd = Fd::invalid();
        assert!(!fd.is_open());
        assert!(fd.raw().is_err());
    }

    #[test]
    fn move_from_empties_the_source() {
        let (rd, _wr) = Fd::pipe(false).unwrap();
        let mut rd = rd;
        let mut dst = Fd::invalid();
        dst.move_from(&mut rd).unwrap();
        assert!(!rd.is_open());
        assert!(dst.is_open());
    }
}
