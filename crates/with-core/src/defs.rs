//! Shared definitions for the `with` tooling

/// Mountpoint of the per-namespace tmpfs holding the symlink view
pub const MOUNTPOINT: &str = "/with";

/// Marker file written at boot once the shared tmpfs has been primed
pub const RUNFILE: &str = "/var/run/with.inited";

/// Directory holding the setuid launcher binary
pub const NAMESPACE_DIR: &str = "/usr/bin";

/// Name of the setuid launcher binary under [`NAMESPACE_DIR`]
pub const NAMESPACE_HELPER: &str = "with-namespace";

/// Metadata file listing the namespace args, relative to [`MOUNTPOINT`]
pub const NS_FILE: &str = ".ns";

/// Metadata file listing the environment, relative to [`MOUNTPOINT`]
pub const ENV_FILE: &str = ".env";

/// Interface version exposed to script front ends
pub const VERSION: u32 = 1;

pub use libc::{EEXIST, ENOENT, SIGTERM};

/// Absolute path of the setuid launcher binary
#[must_use]
pub fn namespace_helper_path() -> String {
    format!("{NAMESPACE_DIR}/{NAMESPACE_HELPER}")
}
