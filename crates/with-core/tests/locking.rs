//! Single-instance locking via the pidfile.

use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use with_core::{ExecArgs, Pipeline, ProcSpec, WithError};

fn one_proc_pipeline(lock: &std::path::Path) -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline.lock_file = Some(lock.to_path_buf());
    let spec = ProcSpec::new(ExecArgs::from_iter(["/bin/true"]).unwrap());
    pipeline.add_proc(Rc::new(std::cell::RefCell::new(spec)));
    pipeline
}

#[test]
fn contended_pidfile_fails_with_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.pid");

    // another instance: an open descriptor holding the exclusive lock
    let holder = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .unwrap();
    // SAFETY: locking a descriptor we own
    let ret = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    assert_eq!(ret, 0);

    let mut pipeline = one_proc_pipeline(&path);
    match pipeline.run() {
        Err(WithError::AlreadyRunning(p)) => {
            assert_eq!(p, path);
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    // release and the pipeline can run; the pidfile is stamped during the
    // run and truncated afterwards
    drop(holder);
    let mut pipeline = one_proc_pipeline(&path);
    pipeline.run().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}
