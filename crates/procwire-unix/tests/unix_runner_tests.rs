#![cfg(unix)]

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use procwire_core::{
    LoopActivity, ProcessError, ProcessRunner, ProcessRunnerFactory, ProcessStatus, RunnerConfig,
    RunnerHandle, StartRequest,
};
use procwire_unix::{UnixProcessRunner, UnixRunnerFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DOT_WORKER: &str = r#"read line; case "$line" in "exit "*) n=${line#exit }; i=0; while [ "$i" -lt "$n" ]; do printf .; i=$((i+1)); done;; esac"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .try_init();
}

fn runner() -> Arc<UnixProcessRunner> {
    init_tracing();
    Arc::new(UnixRunnerFactory::create_runner(&RunnerConfig::default(), LoopActivity::new()).unwrap())
}

async fn wait_until_gone(pid: u32) {
    let proc_entry = format!("/proc/{pid}");
    if !Path::new("/proc/self").exists() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        return;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while Path::new(&proc_entry).exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let runner = runner();
    let handle = runner.start(&StartRequest::new("exit 42")).await.unwrap();

    assert!(handle.process().pid().is_some());
    assert_eq!(runner.join(&handle, None).await.unwrap(), 42);
    assert_eq!(handle.process().status(), ProcessStatus::Ended);

    runner.destroy(&handle);
}

#[tokio::test]
async fn test_worker_reads_stdin_and_writes_stdout() {
    let runner = runner();
    let handle = runner.start(&StartRequest::new(DOT_WORKER)).await.unwrap();
    let process = handle.process();

    process.stdin().write("exit 5\n").await.unwrap();
    let output = process.stdout().read_to_end().await.unwrap();

    assert_eq!(&output[..], b".....");
    assert_eq!(runner.join(&handle, None).await.unwrap(), 0);
    runner.destroy(&handle);
}

#[tokio::test]
async fn test_kill_fails_join_and_stdout_ends() {
    let runner = runner();
    let handle = runner
        .start(&StartRequest::new("exec sleep 10"))
        .await
        .unwrap();

    runner.kill(&handle).await.unwrap();
    assert_eq!(handle.process().status(), ProcessStatus::Ended);

    let outcome = runner.join(&handle, None).await;
    assert!(matches!(outcome, Err(ProcessError::Killed)));

    let output = tokio::time::timeout(
        Duration::from_secs(5),
        handle.process().stdout().read_to_end(),
    )
    .await
    .expect("stdout should reach end of stream after kill")
    .unwrap();
    assert!(output.is_empty());

    runner.destroy(&handle);
}

#[tokio::test]
async fn test_concurrent_processes_report_their_own_codes() {
    let runner = runner();

    let mut joins = Vec::new();
    for code in 0..10 {
        let runner = runner.clone();
        joins.push(tokio::spawn(async move {
            let request = StartRequest::new(format!("sleep 0.{}; exit {code}", 9 - code));
            let handle = runner.start(&request).await?;
            let exit = runner.join(&handle, None).await;
            runner.destroy(&handle);
            exit
        }));
    }

    let mut codes = Vec::new();
    for join in joins {
        codes.push(join.await.unwrap().unwrap());
    }
    assert_eq!(codes, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_wrapper_shells_are_reaped() {
    let runner = runner();

    let mut shells = Vec::new();
    for code in 0..5 {
        let handle = runner
            .start(&StartRequest::new(format!("exit {code}")))
            .await
            .unwrap();
        assert_eq!(runner.join(&handle, None).await.unwrap(), code);
        shells.push(handle.shell_pid());
        runner.destroy(&handle);
    }

    for shell_pid in shells {
        wait_until_gone(shell_pid).await;
        let status = waitpid(Pid::from_raw(shell_pid as i32), Some(WaitPidFlag::WNOHANG));
        assert!(
            matches!(status, Err(Errno::ECHILD)),
            "shell {shell_pid} was not reaped: {status:?}"
        );
    }
}

#[tokio::test]
async fn test_stdout_after_silent_exit_is_end_of_stream() {
    let runner = runner();
    let handle = runner.start(&StartRequest::new("exit 0")).await.unwrap();

    assert_eq!(runner.join(&handle, None).await.unwrap(), 0);
    assert!(handle.process().stdout().read().await.unwrap().is_none());
    assert!(handle.process().stderr().read_to_end().await.unwrap().is_empty());

    runner.destroy(&handle);
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let runner = runner();
    let handle = runner
        .start(&StartRequest::new("echo oops >&2; exit 3"))
        .await
        .unwrap();

    let stderr = handle.process().stderr().read_to_end().await.unwrap();
    assert_eq!(&stderr[..], b"oops\n");
    assert_eq!(runner.join(&handle, None).await.unwrap(), 3);
    runner.destroy(&handle);
}

#[tokio::test]
async fn test_signal_targets_user_command() {
    let runner = runner();
    let handle = runner
        .start(&StartRequest::new("exec sleep 10"))
        .await
        .unwrap();

    runner.signal(&handle, 0).unwrap();
    runner.signal(&handle, 15).unwrap();

    // The shell reports 128 + SIGTERM for the terminated job.
    assert_eq!(runner.join(&handle, None).await.unwrap(), 143);
    runner.destroy(&handle);
}

#[tokio::test]
async fn test_invalid_signal_number_is_rejected() {
    let runner = runner();
    let handle = runner
        .start(&StartRequest::new("exec sleep 10"))
        .await
        .unwrap();

    let error = runner.signal(&handle, 9999).unwrap_err();
    assert!(matches!(error, ProcessError::Signal { signo: 9999, .. }));

    runner.destroy(&handle);
    assert!(matches!(
        runner.join(&handle, None).await,
        Err(ProcessError::Killed)
    ));
}

#[tokio::test]
async fn test_environment_and_working_directory() {
    let runner = runner();
    let dir = std::env::temp_dir().canonicalize().unwrap();

    let request = StartRequest::builder()
        .command(r#"printf '%s:' "$PROCWIRE_TEST"; pwd -P"#)
        .working_directory(dir.clone())
        .env("PROCWIRE_TEST", "wired")
        .build()
        .unwrap();

    let handle = runner.start(&request).await.unwrap();
    let output = handle.process().stdout().read_to_end().await.unwrap();
    let output = String::from_utf8(output.to_vec()).unwrap();

    assert_eq!(output.trim_end(), format!("wired:{}", dir.display()));
    assert_eq!(runner.join(&handle, None).await.unwrap(), 0);
    runner.destroy(&handle);
}

#[tokio::test]
async fn test_syntax_error_fails_start() {
    let runner = runner();
    let error = runner.start(&StartRequest::new("(")).await.unwrap_err();

    assert!(error.is_start_failure());
    assert!(error.to_string().contains("Could not determine PID"));
}

#[tokio::test]
async fn test_missing_shell_fails_start() {
    init_tracing();
    let config = RunnerConfig {
        shell: "/nonexistent/procwire-sh".to_string(),
        ..RunnerConfig::default()
    };
    let runner = UnixProcessRunner::new(&config, LoopActivity::new()).unwrap();

    let error = runner.start(&StartRequest::new("exit 0")).await.unwrap_err();
    assert!(error.is_start_failure());
}

#[tokio::test]
async fn test_destroy_kills_running_process_once() {
    let runner = runner();
    let handle = runner
        .start(&StartRequest::new("exec sleep 10"))
        .await
        .unwrap();

    runner.destroy(&handle);
    runner.destroy(&handle);

    assert!(handle.process().is_destroyed());
    assert_eq!(handle.process().status(), ProcessStatus::Ended);
    assert!(matches!(
        runner.join(&handle, None).await,
        Err(ProcessError::Killed)
    ));
    assert!(matches!(
        handle.process().stdin().write("late").await,
        Err(ProcessError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_stdin_is_closed_after_exit() {
    let runner = runner();
    let handle = runner.start(&StartRequest::new("exit 1")).await.unwrap();

    assert_eq!(runner.join(&handle, None).await.unwrap(), 1);
    assert!(handle.process().stdin().is_closed());
    assert!(!handle.process().stdout().is_closed());

    runner.destroy(&handle);
}
