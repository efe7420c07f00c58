//! Error type for with-core

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WithError {
    /// Bad pipeline or launcher description from the caller
    #[error("setup error: {0}")]
    Setup(String),

    /// A system call failed in this process
    #[error("{call} failed: {errno}")]
    Sys { call: String, errno: Errno },

    /// A child reported failure over the error pipe before exec
    #[error("{0}")]
    ChildSetup(String),

    /// Another instance holds the pidfile lock
    #[error("process is already running (pidfile {} is locked)", .0.display())]
    AlreadyRunning(PathBuf),

    /// Pidfile handling failed for a reason other than contention
    #[error("pidfile {}: {reason}", path.display())]
    Lock { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl WithError {
    /// Build a [`WithError::Sys`] from the current errno
    pub(crate) fn sys(call: impl Into<String>) -> Self {
        Self::Sys {
            call: call.into(),
            errno: Errno::last(),
        }
    }
}
