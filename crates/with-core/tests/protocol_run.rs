//! Driving the orchestrator through the declarative request layer.

use with_core::protocol::{run_request, PipelineRequest};

#[test]
fn request_round_trip() {
    wires_a_two_stage_pipeline();
    misdirected_caller_stream_is_an_error();
}

fn wires_a_two_stage_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let request: PipelineRequest = serde_json::from_str(&format!(
        r#"{{
            "procs": [
                {{"cmd": ["/bin/echo", "hello"], "stdout": {{"type": "pipe", "id": 1}}}},
                {{
                    "cmd": ["/bin/cat"],
                    "stdin": {{"type": "pipe", "id": 1}},
                    "stdout": {{"type": "file", "path": {out:?}}}
                }}
            ]
        }}"#
    ))
    .unwrap();

    let report = run_request(&request).unwrap();

    assert_eq!(report.procs.len(), 2);
    for proc in &report.procs {
        assert!(proc.finished);
        assert!(proc.pid.is_some());
        assert_eq!(proc.exited, Some(true));
        assert_eq!(proc.exit_status, Some(0));
        assert_eq!(proc.signaled, Some(false));
        assert_eq!(proc.term_signal, None);
    }
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
}

fn misdirected_caller_stream_is_an_error() {
    let request: PipelineRequest = serde_json::from_str(
        r#"{"procs": [{"cmd": ["/bin/cat"], "stdin": {"type": "caller_stdout"}}]}"#,
    )
    .unwrap();

    let err = run_request(&request).unwrap_err();
    assert!(err
        .to_string()
        .contains("caller_stdout cannot be used for reading"));
}
