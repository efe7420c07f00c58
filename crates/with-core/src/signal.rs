//! Process-wide signal masking for the pipeline's active region

use nix::errno::Errno;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use crate::error::WithError;
use crate::Result;

/// The signals held back while children are alive
const BLOCKED: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
];

/// Blocks the pipeline signal set and ignores SIGHUP for its lifetime.
///
/// The saved mask is restored on drop, and by children via [`unblock`]
/// right before exec. SIGHUP's SIG_IGN disposition is inherited across
/// exec, so children stay immune to it; only the drop path reinstates the
/// original action.
///
/// [`unblock`]: SignalBlocker::unblock
pub struct SignalBlocker {
    blocked: SigSet,
    old_mask: SigSet,
    old_hup: SigAction,
}

impl SignalBlocker {
    pub fn new() -> Result<Self> {
        let mut blocked = SigSet::empty();
        for sig in BLOCKED {
            blocked.add(sig);
        }

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_IGN installs no handler code
        let old_hup = unsafe { sigaction(Signal::SIGHUP, &ignore) }
            .map_err(|errno| sys("sigaction", errno))?;

        let mut old_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut old_mask))
            .map_err(|errno| sys("sigprocmask", errno))?;

        Ok(Self {
            blocked,
            old_mask,
            old_hup,
        })
    }

    /// The set to hand to `sigwait`
    #[must_use]
    pub const fn blocked_set(&self) -> SigSet {
        self.blocked
    }

    /// Restore the saved mask. Children call this between fork and exec;
    /// SIGHUP stays ignored.
    pub fn unblock(&self) -> Result<()> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None)
            .map_err(|errno| sys("sigprocmask", errno))
    }
}

impl Drop for SignalBlocker {
    fn drop(&mut self) {
        if let Err(e) = self.unblock() {
            tracing::warn!(error = %e, "failed to restore signal mask");
        }
        // SAFETY: reinstalling the action we saved at construction
        if let Err(errno) = unsafe { sigaction(Signal::SIGHUP, &self.old_hup) } {
            tracing::warn!(?errno, "failed to restore SIGHUP action");
        }
    }
}

fn sys(call: &str, errno: Errno) -> WithError {
    WithError::Sys {
        call: call.into(),
        errno,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_installed_and_restored() {
        let before = SigSet::thread_get_mask().unwrap();
        assert!(!before.contains(Signal::SIGTERM));

        {
            let blocker = SignalBlocker::new().unwrap();
            let during = SigSet::thread_get_mask().unwrap();
            for sig in BLOCKED {
                assert!(during.contains(sig), "{sig:?} should be blocked");
            }
            blocker.unblock().unwrap();
            assert!(!SigSet::thread_get_mask().unwrap().contains(Signal::SIGTERM));
            // re-establish so drop exercises the restore path from a
            // blocked state
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocker.blocked_set()), None).unwrap();
        }

        let after = SigSet::thread_get_mask().unwrap();
        assert!(!after.contains(Signal::SIGTERM));
        assert!(!after.contains(Signal::SIGCHLD));
    }
}
