//! Non-blocking reaping interleaved with a sigwait signal pump

use libc::c_int;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::WithError;
use crate::process::{Proc, ProcHandle};
use crate::Result;

/// Owns the runtime [`Proc`]s of one run and guarantees they get reaped.
///
/// Construct the harvester *before* the file map: the map must be gone
/// (parent pipe ends closed, consumers seeing EOF) by the time the wait
/// happens, whether that is the explicit [`harvest`] call or the
/// best-effort one in drop on an unwind path.
///
/// [`harvest`]: Harvester::harvest
pub struct Harvester {
    sigset: SigSet,
    procs: Vec<Proc>,
}

impl Harvester {
    #[must_use]
    pub fn new(sigset: SigSet) -> Self {
        Self {
            sigset,
            procs: Vec::new(),
        }
    }

    /// Register a spec for this run, resetting its previous results.
    /// Returns the slot index.
    pub fn add_proc(&mut self, spec: ProcHandle) -> usize {
        spec.borrow_mut().reset_status();
        self.procs.push(Proc::new(spec));
        self.procs.len() - 1
    }

    pub(crate) fn proc_mut(&mut self, idx: usize) -> &mut Proc {
        &mut self.procs[idx]
    }

    /// Reap until every started proc has finished.
    ///
    /// Each round WNOHANG-polls the running children, then sigwaits on the
    /// blocked set: termination signals are forwarded to children that
    /// asked for them, SIGCHLD triggers the next poll, everything else is
    /// ignored.
    pub fn harvest(&mut self) -> Result<()> {
        loop {
            let mut something_left = false;
            for proc in &self.procs {
                let mut spec = proc.spec.borrow_mut();
                if !spec.running() {
                    continue;
                }
                let mut status: c_int = 0;
                // SAFETY: polling our own child
                let ret = unsafe { libc::waitpid(spec.pid_raw(), &mut status, libc::WNOHANG) };
                if ret < 0 {
                    return Err(WithError::sys("waitpid"));
                }
                if ret > 0 {
                    tracing::debug!(pid = ret, status, "child reaped");
                    spec.record_exit(status);
                } else {
                    something_left = true;
                }
            }
            if !something_left {
                return Ok(());
            }

            let sig = self.sigset.wait().map_err(|errno| WithError::Sys {
                call: "sigwait".into(),
                errno,
            })?;
            match sig {
                Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT => {
                    self.forward(sig)?;
                }
                // SIGCHLD reloops into the poll; SIGHUP and SIGPIPE are
                // deliberately swallowed (a dead logger shows up as EPIPE
                // on write instead)
                _ => {}
            }
        }
    }

    fn forward(&self, sig: Signal) -> Result<()> {
        for proc in &self.procs {
            let spec = proc.spec.borrow();
            if spec.running() && spec.forward_signals {
                tracing::debug!(pid = spec.pid_raw(), ?sig, "forwarding signal");
                kill(Pid::from_raw(spec.pid_raw()), sig).map_err(|errno| WithError::Sys {
                    call: format!("kill pid={} sig={sig:?}", spec.pid_raw()),
                    errno,
                })?;
            }
        }
        Ok(())
    }

    fn any_running(&self) -> bool {
        self.procs.iter().any(|p| p.spec.borrow().running())
    }
}

impl Drop for Harvester {
    fn drop(&mut self) {
        if self.any_running() {
            if let Err(e) = self.harvest() {
                tracing::warn!(error = %e, "harvest during drop failed");
            }
        }
    }
}
