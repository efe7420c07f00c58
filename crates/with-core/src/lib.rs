//! # with-core
//!
//! Ad-hoc per-process filesystem views and disciplined process pipelines.
//!
//! This crate provides the core mechanisms:
//! - a pipeline orchestrator that wires child processes to pipes, files and
//!   the caller's standard streams, runs them as one process group, and
//!   reaps them with signal forwarding
//! - a declarative request layer for script front ends
//! - the client side of the setuid `with-namespace` launcher, which builds
//!   a symlink view under [`defs::MOUNTPOINT`] in a fresh mount namespace

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod argv;
pub mod defs;
pub mod endpoint;
pub mod error;
pub mod fd;
pub mod harvest;
pub mod lockfile;
pub mod namespace;
pub mod pipeline;
pub mod process;
pub mod protocol;
pub mod signal;

pub use argv::ExecArgs;
pub use endpoint::FileSpec;
pub use error::WithError;
pub use pipeline::Pipeline;
pub use process::ProcSpec;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, WithError>;
