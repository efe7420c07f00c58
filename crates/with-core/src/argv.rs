//! Argv carrier for execvp/execve

use std::convert::Infallible;
use std::ffi::{c_char, CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;

use crate::error::WithError;
use crate::Result;

/// An argv array for passing to `execvp` and friends.
///
/// Owns copies of all argument strings; the pointer array handed to the
/// kernel is rebuilt on demand and is always null-terminated.
#[derive(Debug, Default)]
pub struct ExecArgs {
    args: Vec<CString>,
}

impl ExecArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an ordered list of arguments
    pub fn from_iter<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut out = Self::new();
        for arg in args {
            out.push(arg)?;
        }
        Ok(out)
    }

    /// Append a copy of `arg`. Interior NUL bytes cannot be represented in
    /// an argv entry and are reported as a setup error.
    pub fn push(&mut self, arg: impl AsRef<OsStr>) -> Result<()> {
        let arg = arg.as_ref();
        let copy = CString::new(arg.as_bytes()).map_err(|_| {
            WithError::Setup(format!("argument {:?} contains a NUL byte", arg))
        })?;
        self.args.push(copy);
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// The program name (first slot), if any
    #[must_use]
    pub fn exec_name(&self) -> Option<&CStr> {
        self.args.first().map(CString::as_c_str)
    }

    #[must_use]
    pub fn as_cstrings(&self) -> &[CString] {
        &self.args
    }

    /// Null-terminated pointer array for raw `libc::execvp`.
    ///
    /// The pointers borrow from `self`; the vector must be built before
    /// fork and used before `self` is dropped.
    #[must_use]
    pub fn exec_ptrs(&self) -> Vec<*const c_char> {
        let mut ptrs: Vec<*const c_char> =
            self.args.iter().map(|a| a.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        ptrs
    }

    /// Execute via `execvp` (PATH search). Only returns on failure.
    pub fn do_execvp(&self) -> Result<Infallible> {
        let name = self
            .exec_name()
            .ok_or_else(|| WithError::Setup("cmd_argv is empty".into()))?;
        match nix::unistd::execvp(name, &self.args) {
            Ok(never) => match never {},
            Err(errno) => Err(WithError::Sys {
                call: format!("execvp {}", name.to_string_lossy()),
                errno,
            }),
        }
    }

    /// Execute via `execve` with an explicit environment. Only returns on
    /// failure.
    pub fn do_execve(&self, env: &[CString]) -> Result<Infallible> {
        let name = self
            .exec_name()
            .ok_or_else(|| WithError::Setup("cmd_argv is empty".into()))?;
        match nix::unistd::execve(name, &self.args, env) {
            Ok(never) => match never {},
            Err(errno) => Err(WithError::Sys {
                call: format!("execve {}", name.to_string_lossy()),
                errno,
            }),
        }
    }
}

/// NUL-safe conversion of a path for raw libc calls
pub(crate) fn path_to_cstring(path: impl AsRef<std::path::Path>) -> Result<CString> {
    let path = path.as_ref();
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        WithError::Setup(format!("path {} contains a NUL byte", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_order_and_terminator() {
        let mut args = ExecArgs::new();
        assert!(args.is_empty());
        args.push("/bin/echo").unwrap();
        args.push("hello").unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.exec_name().unwrap().to_bytes(), b"/bin/echo");

        let ptrs = args.exec_ptrs();
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn rejects_interior_nul() {
        let mut args = ExecArgs::new();
        assert!(matches!(
            args.push("a\0b"),
            Err(WithError::Setup(_))
        ));
    }

    #[test]
    fn execvp_of_missing_binary_reports_name() {
        let args = ExecArgs::from_iter(["/nonexistent/surely-not-here"]).unwrap();
        let err = args.do_execvp().unwrap_err();
        assert!(err.to_string().contains("surely-not-here"));
    }
}
