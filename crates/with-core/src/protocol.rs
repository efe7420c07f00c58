//! Declarative pipeline descriptions for script front ends
//!
//! A front end hands in a [`PipelineRequest`] (JSON on disk or over a
//! socket); unknown keys are rejected, `cmd` is required, and endpoint
//! tokens with the same `pipe` id resolve to the same shared pipe. The
//! result comes back as a [`PipelineReport`] projecting the wait-status
//! macros per proc.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::argv::ExecArgs;
use crate::endpoint::FileSpec;
use crate::error::WithError;
use crate::pipeline::Pipeline;
use crate::process::{ProcHandle, ProcSpec};
use crate::Result;

/// One pipeline run: its processes and an optional single-instance lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineRequest {
    /// Pidfile path; absent or empty means no locking
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    pub procs: Vec<ProcRequest>,
}

/// One process in a [`PipelineRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcRequest {
    /// Command and arguments; must be non-empty
    pub cmd: Vec<String>,
    /// Forward SIGTERM/SIGINT/SIGQUIT from the parent to this child
    #[serde(default)]
    pub forward_signals: bool,
    #[serde(default)]
    pub stdin: Option<Endpoint>,
    #[serde(default)]
    pub stdout: Option<Endpoint>,
    #[serde(default)]
    pub stderr: Option<Endpoint>,
}

/// An endpoint token in a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// Anonymous pipe; the same id anywhere in the request is the same pipe
    Pipe { id: u32 },
    /// On-disk file, optionally opened for append
    File {
        path: PathBuf,
        #[serde(default)]
        append: bool,
    },
    Devnull,
    CallerStdin,
    CallerStdout,
    CallerStderr,
}

/// A built pipeline plus the spec handles to read results from
#[derive(Debug)]
pub struct BoundPipeline {
    pub pipeline: Pipeline,
    pub handles: Vec<ProcHandle>,
}

/// Resolve a request into a runnable [`Pipeline`]
pub fn build_pipeline(request: &PipelineRequest) -> Result<BoundPipeline> {
    let mut pipeline = Pipeline::new();
    pipeline.lock_file = request
        .lock_file
        .clone()
        .filter(|p| !p.as_os_str().is_empty());

    let mut pipes: HashMap<u32, Rc<FileSpec>> = HashMap::new();
    let mut files: HashMap<(PathBuf, bool), Rc<FileSpec>> = HashMap::new();
    let mut handles = Vec::new();

    for (i, proc) in request.procs.iter().enumerate() {
        if proc.cmd.is_empty() {
            return Err(WithError::Setup(format!("proc {}: cmd is required", i + 1)));
        }
        let mut spec = ProcSpec::new(ExecArgs::from_iter(&proc.cmd)?);
        spec.forward_signals = proc.forward_signals;
        spec.stdin = proc
            .stdin
            .as_ref()
            .map(|e| resolve(&mut pipeline, &mut pipes, &mut files, e));
        spec.stdout = proc
            .stdout
            .as_ref()
            .map(|e| resolve(&mut pipeline, &mut pipes, &mut files, e));
        spec.stderr = proc
            .stderr
            .as_ref()
            .map(|e| resolve(&mut pipeline, &mut pipes, &mut files, e));

        let handle = Rc::new(std::cell::RefCell::new(spec));
        pipeline.add_proc(Rc::clone(&handle));
        handles.push(handle);
    }

    Ok(BoundPipeline { pipeline, handles })
}

fn resolve(
    pipeline: &mut Pipeline,
    pipes: &mut HashMap<u32, Rc<FileSpec>>,
    files: &mut HashMap<(PathBuf, bool), Rc<FileSpec>>,
    endpoint: &Endpoint,
) -> Rc<FileSpec> {
    match endpoint {
        Endpoint::Pipe { id } => Rc::clone(pipes.entry(*id).or_insert_with(FileSpec::pipe)),
        Endpoint::File { path, append } => Rc::clone(
            files
                .entry((path.clone(), *append))
                .or_insert_with(|| FileSpec::file(path, *append)),
        ),
        Endpoint::Devnull => pipeline.devnull(),
        Endpoint::CallerStdin => pipeline.caller_stdin(),
        Endpoint::CallerStdout => pipeline.caller_stdout(),
        Endpoint::CallerStderr => pipeline.caller_stderr(),
    }
}

/// Per-proc outcome, projecting the wait-status macros
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcReport {
    pub pid: Option<i32>,
    pub finished: bool,
    /// WIFEXITED, once finished
    pub exited: Option<bool>,
    /// WIFSIGNALED, once finished
    pub signaled: Option<bool>,
    /// WEXITSTATUS, when exited normally
    pub exit_status: Option<i32>,
    /// WTERMSIG, when killed by a signal
    pub term_signal: Option<i32>,
}

impl ProcReport {
    fn from_spec(spec: &ProcSpec) -> Self {
        Self {
            pid: spec.pid(),
            finished: spec.finished(),
            exited: spec.exited(),
            signaled: spec.signaled(),
            exit_status: spec.exit_status(),
            term_signal: spec.term_signal(),
        }
    }
}

/// Outcome of a whole request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub procs: Vec<ProcReport>,
}

/// Build, run and report a request in one step.
///
/// A nonzero child exit is *not* a pipeline failure; callers judge the
/// per-proc reports themselves.
pub fn run_request(request: &PipelineRequest) -> Result<PipelineReport> {
    let BoundPipeline {
        mut pipeline,
        handles,
    } = build_pipeline(request)?;
    pipeline.run()?;
    Ok(PipelineReport {
        procs: handles
            .iter()
            .map(|h| ProcReport::from_spec(&h.borrow()))
            .collect(),
    })
}

/// Run `cmd` with `input` on its stdin, falling back to the caller's
/// stderr on any failure (the scripted try-write helper).
pub fn error_write_request(cmd: &[String], input: &[u8]) -> Result<()> {
    if cmd.is_empty() {
        return Err(WithError::Setup("cmd is required".into()));
    }
    let mut spec = ProcSpec::new(ExecArgs::from_iter(cmd)?);
    spec.forward_signals = true;

    let mut pipeline = Pipeline::new();
    pipeline.add_proc(Rc::new(std::cell::RefCell::new(spec)));
    pipeline.try_error_write(input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<PipelineRequest>(
            r#"{"procs": [{"cmd": ["/bin/true"], "nonsense": 1}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nonsense"));
    }

    #[test]
    fn cmd_is_required() {
        assert!(serde_json::from_str::<PipelineRequest>(r#"{"procs": [{}]}"#).is_err());

        let request =
            serde_json::from_str::<PipelineRequest>(r#"{"procs": [{"cmd": []}]}"#).unwrap();
        let err = build_pipeline(&request).unwrap_err();
        assert!(err.to_string().contains("cmd is required"));
    }

    #[test]
    fn equal_pipe_ids_share_one_spec() {
        let request = serde_json::from_str::<PipelineRequest>(
            r#"{
                "procs": [
                    {"cmd": ["/bin/echo", "hi"], "stdout": {"type": "pipe", "id": 7}},
                    {"cmd": ["/bin/cat"], "stdin": {"type": "pipe", "id": 7}}
                ]
            }"#,
        )
        .unwrap();

        let bound = build_pipeline(&request).unwrap();
        let a = bound.handles[0].borrow().stdout.clone().unwrap();
        let b = bound.handles[1].borrow().stdin.clone().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn empty_lock_file_means_no_locking() {
        let request = serde_json::from_str::<PipelineRequest>(
            r#"{"lock_file": "", "procs": [{"cmd": ["/bin/true"]}]}"#,
        )
        .unwrap();
        let bound = build_pipeline(&request).unwrap();
        assert!(bound.pipeline.lock_file.is_none());
    }

    #[test]
    fn endpoint_tokens_round_trip() {
        let tokens = vec![
            Endpoint::Pipe { id: 1 },
            Endpoint::File {
                path: "/tmp/out".into(),
                append: true,
            },
            Endpoint::Devnull,
            Endpoint::CallerStderr,
        ];
        let json = serde_json::to_string(&tokens).unwrap();
        let back: Vec<Endpoint> = serde_json::from_str(&json).unwrap();
        assert_eq!(tokens, back);
    }

    #[test]
    fn unknown_endpoint_type_is_rejected() {
        assert!(serde_json::from_str::<Endpoint>(r#"{"type": "socket"}"#).is_err());
    }
}
