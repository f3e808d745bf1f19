//! Start failures of the wrapper runner, driven by stand-in wrapper programs.
#![cfg(unix)]

use procwire_core::{LoopActivity, ProcessError, ProcessRunner, RunnerConfig, StartRequest};
use procwire_windows::WindowsProcessRunner;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

fn runner_with(wrapper_path: PathBuf, connect_timeout_ms: u64) -> WindowsProcessRunner {
    let config = RunnerConfig {
        wrapper_path: Some(wrapper_path),
        connect_timeout_ms,
        client_handshake_timeout_ms: connect_timeout_ms.min(1000),
        ..RunnerConfig::default()
    };
    WindowsProcessRunner::new(&config, LoopActivity::new()).unwrap()
}

#[tokio::test]
async fn test_wrapper_exit_reports_its_stderr() {
    init_tracing();
    // sh rejects the wrapper switches, prints a complaint and exits.
    let runner = runner_with(PathBuf::from("/bin/sh"), 5000);

    let started = Instant::now();
    let error = runner
        .start(&StartRequest::new("echo never"))
        .await
        .unwrap_err();

    assert!(matches!(error, ProcessError::StartFailed(_)));
    assert!(!error.to_string().contains("timeout"), "{error}");
    assert!(error.to_string().to_lowercase().contains("option"), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(runner.connector().pending_count(), 0);
}

#[tokio::test]
async fn test_silent_wrapper_times_out() {
    init_tracing();
    let script = std::env::temp_dir().join(format!("procwire-silent-wrapper-{}", std::process::id()));
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let runner = runner_with(script.clone(), 300);
    let error = runner
        .start(&StartRequest::new("echo never"))
        .await
        .unwrap_err();
    let _ = std::fs::remove_file(&script);

    assert_eq!(
        error.to_string(),
        "Could not start process: Process did not connect to server before timeout elapsed"
    );
    assert_eq!(runner.connector().pending_count(), 0);
    assert!(!runner.connector().is_accepting_referenced());
}

#[tokio::test]
async fn test_missing_wrapper_fails_start() {
    init_tracing();
    let runner = runner_with(PathBuf::from("/nonexistent/ProcessWrapper.exe"), 1000);
    let error = runner
        .start(&StartRequest::new("echo never"))
        .await
        .unwrap_err();
    assert!(error.is_start_failure());
}

#[tokio::test]
async fn test_failed_starts_leave_nothing_pending() {
    init_tracing();
    let runner = runner_with(PathBuf::from("/bin/sh"), 2000);
    let result = runner.start(&StartRequest::new("echo never")).await;
    assert!(result.is_err());
    assert_eq!(runner.connector().pending_count(), 0);

    // A rejected command never reaches the wrapper at all.
    let error = runner
        .start(&StartRequest::new("a\0b"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("null bytes"));
}
