//! The try-write helper: deliver a buffer to a logger's stdin, fall back
//! to stderr when the logger is gone or unhappy.

use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use with_core::{ExecArgs, Pipeline, ProcSpec};

#[test]
fn error_write_paths() {
    delivered_to_the_child_stdin();
    failing_child_engages_the_fallback();
    two_procs_are_a_setup_error_and_still_fall_back();
    oversized_buffer_falls_back_whole_for_a_draining_child();
    oversized_buffer_falls_back_whole_for_an_unreading_child();
}

fn one_proc_pipeline(cmd: &[&str]) -> (Pipeline, with_core::process::ProcHandle) {
    let mut pipeline = Pipeline::new();
    let spec = ProcSpec::new(ExecArgs::from_iter(cmd).unwrap());
    let handle = Rc::new(std::cell::RefCell::new(spec));
    pipeline.add_proc(Rc::clone(&handle));
    (pipeline, handle)
}

/// Redirect this process's stderr into a file around `f` and return what
/// landed there.
fn with_captured_stderr(f: impl FnOnce()) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stderr");
    let file = std::fs::File::create(&path).unwrap();

    // SAFETY: swapping our own fd 2 around the call and restoring it after
    let saved = unsafe { libc::dup(libc::STDERR_FILENO) };
    assert!(saved >= 0);
    // SAFETY: as above
    unsafe {
        assert!(libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) >= 0);
    }

    f();

    // SAFETY: as above
    unsafe {
        libc::dup2(saved, libc::STDERR_FILENO);
        libc::close(saved);
    }
    std::fs::read(&path).unwrap()
}

fn delivered_to_the_child_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let (mut pipeline, handle) =
        one_proc_pipeline(&["/bin/sh", "-c", &format!("cat > {}", out.display())]);
    handle.borrow_mut().forward_signals = true;

    pipeline.try_error_write(b"abc\n");

    let spec = handle.borrow();
    assert!(spec.finished());
    assert_eq!(spec.exit_status(), Some(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "abc\n");
}

fn failing_child_engages_the_fallback() {
    let (mut pipeline, handle) = one_proc_pipeline(&["/bin/false"]);

    // must not panic or propagate; the buffer lands on our stderr instead
    let captured = with_captured_stderr(|| pipeline.try_error_write(b"err\n"));
    assert_eq!(captured, b"err\n");

    let spec = handle.borrow();
    assert!(spec.finished());
    assert_ne!(spec.exit_status(), Some(0));
}

fn two_procs_are_a_setup_error_and_still_fall_back() {
    let mut pipeline = Pipeline::new();
    for _ in 0..2 {
        let spec = ProcSpec::new(ExecArgs::from_iter(["/bin/true"]).unwrap());
        pipeline.add_proc(Rc::new(std::cell::RefCell::new(spec)));
    }
    let captured = with_captured_stderr(|| pipeline.try_error_write(b"ignored\n"));
    assert_eq!(captured, b"ignored\n");
}

fn oversized_buffer_falls_back_whole_for_a_draining_child() {
    // 1 MiB dwarfs the default 64 KiB pipe capacity, so the one-shot
    // non-blocking write is guaranteed to come up short even though cat
    // would eventually drain everything. The short write must count as
    // failure: the fallback carries the whole buffer, not a remainder.
    let input: Vec<u8> = (0..(1usize << 20)).map(|i| b'a' + (i % 23) as u8).collect();

    let (mut pipeline, _handle) = one_proc_pipeline(&["/bin/sh", "-c", "cat > /dev/null"]);

    let captured = with_captured_stderr(|| pipeline.try_error_write(&input));
    assert!(
        captured == input,
        "fallback must carry the whole buffer exactly once ({} of {} bytes captured)",
        captured.len(),
        input.len()
    );
}

fn oversized_buffer_falls_back_whole_for_an_unreading_child() {
    // a child that exits without ever touching stdin: the pipe fills, the
    // write fails, and again the full buffer must land on stderr
    let input = vec![b'x'; 1 << 20];

    let (mut pipeline, handle) = one_proc_pipeline(&["/bin/true"]);

    let captured = with_captured_stderr(|| pipeline.try_error_write(&input));
    assert!(
        captured == input,
        "fallback must carry the whole buffer exactly once ({} of {} bytes captured)",
        captured.len(),
        input.len()
    );
    assert!(handle.borrow().finished());
}
