//! End-to-end runs of the `tether` binary: every call spawns a real child
//! through the bootstrap handshake.

use std::process::{Command, Output};

fn tether(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tether"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run tether")
}

#[test]
fn test_call_in_spawned_child() {
    let output = tether(&["call", "example.add", "2", "3"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "5");
}

#[test]
fn test_remote_failure_reaches_caller() {
    let output = tether(&["call", "example.fail"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("boom"));
}

#[test]
fn test_child_runs_in_another_process() {
    let output = tether(&["call", "example.pid"]);
    assert!(output.status.success());
    let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
    assert_ne!(pid, std::process::id());
}

#[test]
fn test_in_process_child() {
    let output = tether(&["call", "--in-process", "example.echo", "a", "1"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), r#"["a", 1]"#);
}

#[test]
fn test_ping_reports_each_round_trip() {
    let output = tether(&["ping", "--count", "2"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("seq=0"));
    assert!(stdout.contains("seq=1"));
}

#[test]
fn test_first_stage_rejects_garbage_preamble() {
    let output = Command::new(env!("CARGO_BIN_EXE_tether"))
        .args(["first-stage", "4"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            use std::io::Write;
            child.stdin.take().unwrap().write_all(b"junk")?;
            child.wait_with_output()
        })
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.starts_with(b"MITO000\n"));
}
