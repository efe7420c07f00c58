//! Exclusive pidfile lock for single-instance daemons

use std::path::{Path, PathBuf};

use nix::errno::Errno;

use crate::argv::path_to_cstring;
use crate::error::WithError;
use crate::fd::{write_all, Fd};
use crate::Result;

/// Holds an exclusive `flock` on a pidfile for the duration of a run.
///
/// The file keeps the owner's pid while locked and is truncated on drop so
/// no stale pid survives. It is never unlinked, since another process may
/// have renamed it in the meantime.
#[derive(Debug, Default)]
pub struct LockFile {
    fd: Fd,
    path: Option<PathBuf>,
}

impl LockFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.fd.is_open()
    }

    /// Open, lock and stamp the pidfile. `EWOULDBLOCK` from `flock` means
    /// another instance is alive.
    pub fn acquire(&mut self, path: &Path) -> Result<()> {
        let cpath = path_to_cstring(path)?;
        // SAFETY: cpath is a valid NUL-terminated string
        let raw = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o666 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(WithError::Lock {
                path: path.to_path_buf(),
                reason: format!("unable to open for writing: {}", Errno::last()),
            });
        }
        self.fd.reset_to(raw)?;
        self.fd.set_cloexec()?;

        // SAFETY: raw is owned and open
        let ret = unsafe { libc::flock(raw, libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let errno = Errno::last();
            // close now so drop doesn't truncate the live owner's pidfile
            let _ = self.fd.reset();
            if errno == Errno::EWOULDBLOCK {
                return Err(WithError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(WithError::Lock {
                path: path.to_path_buf(),
                reason: format!("unable to lock: {errno}"),
            });
        }

        // SAFETY: raw is owned, open and locked
        if unsafe { libc::ftruncate(raw, 0) } != 0 {
            return Err(WithError::Lock {
                path: path.to_path_buf(),
                reason: format!("unable to truncate: {}", Errno::last()),
            });
        }
        write_all(raw, format!("{}\n", std::process::id()).as_bytes())?;

        tracing::debug!(?path, "pidfile locked");
        self.path = Some(path.to_path_buf());
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Ok(raw) = self.fd.raw() {
            // SAFETY: we hold the lock; the result cannot be acted on here
            if unsafe { libc::ftruncate(raw, 0) } != 0 {
                tracing::warn!(path = ?self.path, "failed to truncate pidfile");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_stamps_pid_and_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");

        let mut first = LockFile::new();
        first.acquire(&path).unwrap();
        assert!(first.is_held());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );

        // flock is per open-file-description, so a second open in the same
        // process contends like another process would
        let mut second = LockFile::new();
        match second.acquire(&path) {
            Err(WithError::AlreadyRunning(p)) => assert_eq!(p, path),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert!(!second.is_held());

        drop(first);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let mut third = LockFile::new();
        third.acquire(&path).unwrap();
    }
}
