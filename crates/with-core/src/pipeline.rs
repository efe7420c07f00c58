//! The pipeline orchestrator: endpoint resolution, group launch, harvest

use std::path::PathBuf;
use std::rc::Rc;

use crate::endpoint::{FileMap, FileSpec};
use crate::error::WithError;
use crate::fd::{write_all, write_once};
use crate::harvest::Harvester;
use crate::lockfile::LockFile;
use crate::process::ProcHandle;
use crate::signal::SignalBlocker;
use crate::Result;

/// A caller-declared graph of processes and endpoints, run as one unit.
///
/// Endpoints are minted by the pipeline ([`pipe`], [`file`], the caller
/// stream accessors) and shared between [`ProcSpec`] slots by handle
/// identity: two procs naming the same handle share one pipe.
///
/// [`pipe`]: Pipeline::pipe
/// [`file`]: Pipeline::file
/// [`ProcSpec`]: crate::process::ProcSpec
#[derive(Debug, Default)]
pub struct Pipeline {
    specs: Vec<ProcHandle>,
    /// Pidfile to hold for the duration of the run; `None` for no locking
    pub lock_file: Option<PathBuf>,
    devnull: Option<Rc<FileSpec>>,
    caller_stdin: Option<Rc<FileSpec>>,
    caller_stdout: Option<Rc<FileSpec>>,
    caller_stderr: Option<Rc<FileSpec>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh anonymous pipe endpoint
    #[must_use]
    pub fn pipe(&self) -> Rc<FileSpec> {
        FileSpec::pipe()
    }

    /// An on-disk file endpoint
    #[must_use]
    pub fn file(&self, path: impl Into<PathBuf>) -> Rc<FileSpec> {
        FileSpec::file(path, false)
    }

    /// An on-disk file endpoint opened for appending
    #[must_use]
    pub fn file_append(&self, path: impl Into<PathBuf>) -> Rc<FileSpec> {
        FileSpec::file(path, true)
    }

    /// The shared `/dev/null` endpoint
    pub fn devnull(&mut self) -> Rc<FileSpec> {
        Self::special(&mut self.devnull, "/dev/null")
    }

    /// The caller's stdin; read side only
    pub fn caller_stdin(&mut self) -> Rc<FileSpec> {
        Self::special(&mut self.caller_stdin, "/dev/stdin")
    }

    /// The caller's stdout; write side only
    pub fn caller_stdout(&mut self) -> Rc<FileSpec> {
        Self::special(&mut self.caller_stdout, "/dev/stdout")
    }

    /// The caller's stderr; write side only
    pub fn caller_stderr(&mut self) -> Rc<FileSpec> {
        Self::special(&mut self.caller_stderr, "/dev/stderr")
    }

    fn special(slot: &mut Option<Rc<FileSpec>>, name: &str) -> Rc<FileSpec> {
        Rc::clone(slot.get_or_insert_with(|| FileSpec::file(name, false)))
    }

    pub fn add_proc(&mut self, spec: ProcHandle) {
        self.specs.push(spec);
    }

    #[must_use]
    pub fn procs(&self) -> &[ProcHandle] {
        &self.specs
    }

    /// Run the pipeline to completion.
    ///
    /// Strict order: block signals, register procs and aggregate endpoint
    /// intent, take the pidfile lock, open every endpoint once, fork the
    /// children into one process group (first child is the leader), close
    /// the parent's copies of every descriptor, then reap with signal
    /// forwarding. The parent must shed its pipe ends before waiting or a
    /// child blocked on a pipe would never see EOF.
    pub fn run(&mut self) -> Result<()> {
        if self.specs.is_empty() {
            return Err(WithError::Setup("no procs to execute".into()));
        }

        let signals = SignalBlocker::new()?;
        let mut lock = LockFile::new();
        let mut harvester = Harvester::new(signals.blocked_set());
        {
            let mut files = FileMap::default();

            for spec in &self.specs {
                let idx = harvester.add_proc(Rc::clone(spec));
                let (stdin, stdout, stderr) = {
                    let s = spec.borrow();
                    (
                        s.stdin.as_ref().map(|f| files.get(f, true, false)),
                        s.stdout.as_ref().map(|f| files.get(f, false, true)),
                        s.stderr.as_ref().map(|f| files.get(f, false, true)),
                    )
                };
                let proc = harvester.proc_mut(idx);
                proc.stdin = stdin;
                proc.stdout = stdout;
                proc.stderr = stderr;
            }

            if let Some(path) = self.lock_file.clone() {
                lock.acquire(&path)?;
            }

            files.open_all()?;

            tracing::debug!(procs = self.specs.len(), files = files.len(), "starting pipeline");
            let mut pgid = 0;
            for idx in 0..self.specs.len() {
                let proc = harvester.proc_mut(idx);
                proc.new_pgid = pgid;
                let pid = proc.safe_fork_exec(&files, &signals)?;
                if pgid == 0 {
                    pgid = pid;
                }
            }
        }

        harvester.harvest()?;
        Ok(())
    }

    /// Write `input` to the single configured proc's stdin, falling back to
    /// the caller's stderr if anything goes wrong.
    ///
    /// The child must exit zero for the write to count; a short write, a
    /// dead child (EPIPE, since SIGPIPE is blocked for the whole call,
    /// fallback included) or a nonzero exit all engage the fallback.
    /// Nothing propagates to the caller.
    pub fn try_error_write(&mut self, input: &[u8]) {
        let signals = match SignalBlocker::new() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot block signals for error write");
                let _ = write_all(libc::STDERR_FILENO, input);
                return;
            }
        };

        if let Err(e) = self.error_write_inner(input, &signals) {
            tracing::warn!(error = %e, "error write failed, falling back to stderr");
            let _ = write_all(libc::STDERR_FILENO, input);
        }
    }

    fn error_write_inner(&mut self, input: &[u8], signals: &SignalBlocker) -> Result<()> {
        if self.specs.len() != 1 {
            return Err(WithError::Setup("specs must have 1 element".into()));
        }
        let spec = Rc::clone(&self.specs[0]);

        {
            let mut harvester = Harvester::new(signals.blocked_set());
            let mut files = FileMap::default();

            let pipe_spec = FileSpec::pipe();
            let file_idx = files.get(&pipe_spec, true, false);
            files.open_all()?;
            files.file(file_idx).set_write_nonblocking()?;

            let idx = harvester.add_proc(Rc::clone(&spec));
            let proc = harvester.proc_mut(idx);
            proc.stdin = Some(file_idx);
            proc.new_pgid = 0;
            proc.safe_fork_exec(&files, signals)?;

            // one shot on the non-blocking pipe: a short write fails here
            // and the whole buffer goes to the fallback instead
            files.file_mut(file_idx).close_read();
            write_once(files.file(file_idx).write_raw()?, input)?;
            files.file_mut(file_idx).close_write();

            drop(files);
            harvester.harvest()?;
        }

        let s = spec.borrow();
        if !(s.finished() && s.exited() == Some(true) && s.exit_status() == Some(0)) {
            return Err(WithError::ChildSetup("proc failed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pipeline_is_rejected() {
        let mut pipeline = Pipeline::new();
        let err = pipeline.run().unwrap_err();
        assert!(err.to_string().contains("no procs"));
    }

    #[test]
    fn special_endpoints_are_cached() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.caller_stdout();
        let b = pipeline.caller_stdout();
        assert!(Rc::ptr_eq(&a, &b));

        let p1 = pipeline.pipe();
        let p2 = pipeline.pipe();
        assert!(!Rc::ptr_eq(&p1, &p2));
    }
}
