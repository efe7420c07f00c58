//! Process specifications and the safe fork/exec path

use std::cell::RefCell;
use std::ffi::c_char;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use libc::{c_int, pid_t};
use nix::errno::Errno;
use nix::unistd::{fork, ForkResult};

use crate::argv::ExecArgs;
use crate::endpoint::{FileMap, FileSpec};
use crate::error::WithError;
use crate::fd::Fd;
use crate::signal::SignalBlocker;
use crate::Result;

const NO_PID: pid_t = -1;

/// Shared handle to a process specification.
///
/// The caller keeps the handle across runs and reads the result fields back
/// after each one.
pub type ProcHandle = Rc<RefCell<ProcSpec>>;

/// A caller's declarative process request plus its per-run results
#[derive(Debug)]
pub struct ProcSpec {
    /// Command to execute
    pub cmd: ExecArgs,
    /// Forward SIGTERM/SIGINT/SIGQUIT received by the parent to this child
    pub forward_signals: bool,
    /// Endpoint for the child's stdin
    pub stdin: Option<Rc<FileSpec>>,
    /// Endpoint for the child's stdout
    pub stdout: Option<Rc<FileSpec>>,
    /// Endpoint for the child's stderr
    pub stderr: Option<Rc<FileSpec>>,
    pid: pid_t,
    status: c_int,
    exited: bool,
}

impl ProcSpec {
    #[must_use]
    pub fn new(cmd: ExecArgs) -> Self {
        Self {
            cmd,
            forward_signals: false,
            stdin: None,
            stdout: None,
            stderr: None,
            pid: NO_PID,
            status: 0,
            exited: false,
        }
    }

    /// Wrap a new spec in the shared handle form the pipeline consumes
    #[must_use]
    pub fn handle(cmd: ExecArgs) -> ProcHandle {
        Rc::new(RefCell::new(Self::new(cmd)))
    }

    pub(crate) fn reset_status(&mut self) {
        self.pid = NO_PID;
        self.status = 0;
        self.exited = false;
    }

    pub(crate) fn set_pid(&mut self, pid: pid_t) {
        self.pid = pid;
    }

    pub(crate) fn record_exit(&mut self, status: c_int) {
        self.exited = true;
        self.status = status;
    }

    pub(crate) const fn pid_raw(&self) -> pid_t {
        self.pid
    }

    /// Fork has succeeded and a pid was recorded
    #[must_use]
    pub const fn started(&self) -> bool {
        self.pid != NO_PID
    }

    /// Started and not yet reaped
    #[must_use]
    pub const fn running(&self) -> bool {
        self.started() && !self.exited
    }

    /// Started and reaped
    #[must_use]
    pub const fn finished(&self) -> bool {
        self.started() && self.exited
    }

    #[must_use]
    pub const fn pid(&self) -> Option<pid_t> {
        if self.started() {
            Some(self.pid)
        } else {
            None
        }
    }

    /// Raw wait status, once finished
    #[must_use]
    pub const fn raw_status(&self) -> Option<c_int> {
        if self.finished() {
            Some(self.status)
        } else {
            None
        }
    }

    /// WIFEXITED, once finished
    #[must_use]
    pub fn exited(&self) -> Option<bool> {
        self.raw_status().map(|s| libc::WIFEXITED(s))
    }

    /// WIFSIGNALED, once finished
    #[must_use]
    pub fn signaled(&self) -> Option<bool> {
        self.raw_status().map(|s| libc::WIFSIGNALED(s))
    }

    /// WEXITSTATUS, when the child exited normally
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        self.raw_status()
            .filter(|&s| libc::WIFEXITED(s))
            .map(|s| libc::WEXITSTATUS(s))
    }

    /// WTERMSIG, when the child was killed by a signal
    #[must_use]
    pub fn term_signal(&self) -> Option<i32> {
        self.raw_status()
            .filter(|&s| libc::WIFSIGNALED(s))
            .map(|s| libc::WTERMSIG(s))
    }
}

/// Runtime handle for one child during a single pipeline run
pub struct Proc {
    pub(crate) spec: ProcHandle,
    pub(crate) stdin: Option<usize>,
    pub(crate) stdout: Option<usize>,
    pub(crate) stderr: Option<usize>,
    /// Process group: -1 leaves the child in the parent's group, 0 makes it
    /// a new group leader, anything else joins that group
    pub(crate) new_pgid: pid_t,
}

impl Proc {
    pub(crate) fn new(spec: ProcHandle) -> Self {
        Self {
            spec,
            stdin: None,
            stdout: None,
            stderr: None,
            new_pgid: NO_PID,
        }
    }

    /// Fork and exec, propagating child-side failures back to the parent
    /// over a close-on-exec pipe.
    ///
    /// The child establishes its process group, redirects its standard
    /// descriptors, restores the pre-blocker signal mask (SIGHUP stays
    /// ignored) and execs. EOF on the error pipe is the success signal;
    /// any bytes are a failure message from the child, which is reaped
    /// before the error propagates.
    pub(crate) fn safe_fork_exec(
        &self,
        files: &FileMap,
        blocker: &SignalBlocker,
    ) -> Result<pid_t> {
        // Everything the child touches is prepared before fork: no
        // allocation happens between fork and exec.
        let (argv_ptrs, fail_prefix, stdin_fd, stdout_fd, stderr_fd) = {
            let spec = self.spec.borrow();
            let name = spec
                .cmd
                .exec_name()
                .ok_or_else(|| WithError::Setup("cmd_argv is empty".into()))?;
            let prefix = format!("execvp {} failed: ", name.to_string_lossy()).into_bytes();
            (
                spec.cmd.exec_ptrs(),
                prefix,
                self.stdin
                    .map(|idx| files.file(idx).read_raw())
                    .transpose()?,
                self.stdout
                    .map(|idx| files.file(idx).write_raw())
                    .transpose()?,
                self.stderr
                    .map(|idx| files.file(idx).write_raw())
                    .transpose()?,
            )
        };

        let (err_read, err_write) = Fd::pipe(true)?;
        err_write.set_nonblocking()?;
        let err_write_raw = err_write.raw()?;

        // SAFETY: the parent is single-threaded here and the child touches
        // only the async-signal-safe exec path prepared above
        match unsafe { fork() }.map_err(|errno| WithError::Sys {
            call: "fork".into(),
            errno,
        })? {
            ForkResult::Child => child_exec(
                err_write_raw,
                self.new_pgid,
                stdin_fd,
                stdout_fd,
                stderr_fd,
                blocker,
                &argv_ptrs,
                &fail_prefix,
            ),
            ForkResult::Parent { child } => {
                let pid = child.as_raw();
                drop(err_write);
                match drain_error_pipe(&err_read) {
                    Ok(msg) if msg.is_empty() => {
                        self.spec.borrow_mut().set_pid(pid);
                        tracing::debug!(pid, "child exec'd");
                        Ok(pid)
                    }
                    Ok(msg) => {
                        terminate_and_reap(pid);
                        Err(WithError::ChildSetup(
                            String::from_utf8_lossy(&msg).into_owned(),
                        ))
                    }
                    Err(e) => {
                        terminate_and_reap(pid);
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Child-side setup between fork and exec. Never returns; on failure the
/// message lands on the error pipe and the child exits 1.
fn child_exec(
    err_fd: RawFd,
    new_pgid: pid_t,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    stderr_fd: Option<RawFd>,
    blocker: &SignalBlocker,
    argv: &[*const c_char],
    fail_prefix: &[u8],
) -> ! {
    // SAFETY: post-fork child; only async-signal-safe calls until exec
    unsafe {
        if new_pgid >= 0 && libc::setpgid(0, new_pgid) != 0 {
            child_fail(err_fd, b"setpgid failed: ");
        }
        if let Some(fd) = stdin_fd {
            if libc::dup2(fd, libc::STDIN_FILENO) < 0 {
                child_fail(err_fd, b"dup2 failed: ");
            }
        }
        if let Some(fd) = stdout_fd {
            if libc::dup2(fd, libc::STDOUT_FILENO) < 0 {
                child_fail(err_fd, b"dup2 failed: ");
            }
        }
        if let Some(fd) = stderr_fd {
            if libc::dup2(fd, libc::STDERR_FILENO) < 0 {
                child_fail(err_fd, b"dup2 failed: ");
            }
        }
        if blocker.unblock().is_err() {
            child_fail(err_fd, b"sigprocmask failed: ");
        }
        libc::execvp(argv[0], argv.as_ptr());
        child_fail(err_fd, fail_prefix);
    }
}

/// Write `prefix` + strerror(errno) to the error pipe and _exit(1)
fn child_fail(err_fd: RawFd, prefix: &[u8]) -> ! {
    // SAFETY: write/strerror/_exit only; errno is read before anything
    // else can clobber it
    unsafe {
        let errno = *libc::__errno_location();
        let _ = libc::write(err_fd, prefix.as_ptr().cast(), prefix.len());
        let msg = libc::strerror(errno);
        if !msg.is_null() {
            let _ = libc::write(err_fd, msg.cast(), libc::strlen(msg));
        }
        libc::_exit(1);
    }
}

/// Read the error pipe to EOF. Empty means the child exec'd (close-on-exec
/// closed its end); bytes are the child's failure message.
fn drain_error_pipe(err_read: &Fd) -> Result<Vec<u8>> {
    let fd = err_read.raw()?;
    let mut msg = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        // SAFETY: buf is a live stack buffer
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return Err(WithError::sys("read from error pipe"));
        }
        if n == 0 {
            return Ok(msg);
        }
        msg.extend_from_slice(&buf[..n as usize]);
    }
}

/// Best-effort SIGTERM + blocking reap, used when parent-side setup fails
/// after the fork
fn terminate_and_reap(pid: pid_t) {
    // SAFETY: pid is our direct child; a failed kill (already dead) is fine
    unsafe {
        let _ = libc::kill(pid, libc::SIGTERM);
        let _ = libc::waitpid(pid, std::ptr::null_mut(), 0);
    }
}
