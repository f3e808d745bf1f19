//! Termination of the wrapper's whole process tree.

use procwire_core::{ProcessError, Result};
use tracing::{debug, info, warn};

/// `taskkill` exit code for "no such process".
const TASKKILL_NOT_FOUND: i32 = 128;

/// How a tree kill ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKill {
    Terminated,
    AlreadyExited,
}

/// Maps a `taskkill /F /T` exit code. `wrapper_exited` rescues unknown codes.
pub fn interpret_taskkill(code: Option<i32>, wrapper_exited: bool, stderr: &str) -> Result<TreeKill> {
    match code {
        Some(0) => Ok(TreeKill::Terminated),
        Some(TASKKILL_NOT_FOUND) => Ok(TreeKill::AlreadyExited),
        _ if wrapper_exited => Ok(TreeKill::AlreadyExited),
        other => Err(ProcessError::KillFailed(format!(
            "taskkill exited with {:?}: {}",
            other,
            stderr.trim()
        ))),
    }
}

#[cfg(windows)]
pub async fn kill_tree<F>(root_pid: u32, wrapper_exited: F) -> Result<TreeKill>
where
    F: Fn() -> bool + Send + 'static,
{
    let output = tokio::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &root_pid.to_string()])
        .output()
        .await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let result = interpret_taskkill(output.status.code(), wrapper_exited(), &stderr);
    log_result(root_pid, &result);
    result
}

/// Blocking variant for callers without a runtime.
#[cfg(windows)]
pub fn kill_tree_blocking<F>(root_pid: u32, wrapper_exited: F) -> Result<TreeKill>
where
    F: Fn() -> bool + Send + 'static,
{
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &root_pid.to_string()])
        .output()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let result = interpret_taskkill(output.status.code(), wrapper_exited(), &stderr);
    log_result(root_pid, &result);
    result
}

/// Runs the process-table walk on the blocking pool.
#[cfg(not(windows))]
pub async fn kill_tree<F>(root_pid: u32, wrapper_exited: F) -> Result<TreeKill>
where
    F: Fn() -> bool + Send + 'static,
{
    tokio::task::spawn_blocking(move || kill_tree_blocking(root_pid, wrapper_exited))
        .await
        .map_err(|e| ProcessError::KillFailed(e.to_string()))?
}

/// Freezes the tree with SIGSTOP, then kills the root before its descendants.
///
/// A stopped tree cannot reap, exit or fork between the two steps.
#[cfg(not(windows))]
pub fn kill_tree_blocking<F>(root_pid: u32, wrapper_exited: F) -> Result<TreeKill>
where
    F: Fn() -> bool + Send + 'static,
{
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};

    let refresh = |system: &mut System| {
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
    };

    let mut system = System::new();
    refresh(&mut system);
    if let Some(root) = system.process(Pid::from_u32(root_pid)) {
        root.kill_with(Signal::Stop);
    }

    // Walk again now that the root can no longer fork.
    refresh(&mut system);
    let mut victims = vec![root_pid];
    find_children_recursive(&system, root_pid, &mut victims);

    for pid in &victims[1..] {
        if let Some(process) = system.process(Pid::from_u32(*pid)) {
            process.kill_with(Signal::Stop);
        }
    }

    let mut any_killed = false;
    for pid in &victims {
        if let Some(process) = system.process(Pid::from_u32(*pid)) {
            any_killed |= process.kill();
        }
    }

    let result = if any_killed {
        Ok(TreeKill::Terminated)
    } else if wrapper_exited() || system.process(Pid::from_u32(root_pid)).is_none() {
        Ok(TreeKill::AlreadyExited)
    } else {
        Err(ProcessError::KillFailed(format!(
            "could not kill process tree rooted at {root_pid}"
        )))
    };
    log_result(root_pid, &result);
    result
}

/// Collects descendants of `parent_pid`, parents before their children.
#[cfg(not(windows))]
fn find_children_recursive(system: &sysinfo::System, parent_pid: u32, result: &mut Vec<u32>) {
    for (pid, process) in system.processes() {
        if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
            let child_pid = pid.as_u32();
            result.push(child_pid);
            find_children_recursive(system, child_pid, result);
        }
    }
}

fn log_result(root_pid: u32, result: &Result<TreeKill>) {
    match result {
        Ok(TreeKill::Terminated) => info!(wrapper_pid = root_pid, "Terminated process tree"),
        Ok(TreeKill::AlreadyExited) => debug!(wrapper_pid = root_pid, "Process tree had already exited"),
        Err(e) => warn!(wrapper_pid = root_pid, error = %e, "Failed to terminate process tree"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskkill_exit_codes() {
        assert_eq!(interpret_taskkill(Some(0), false, "").unwrap(), TreeKill::Terminated);
        assert_eq!(
            interpret_taskkill(Some(128), false, "").unwrap(),
            TreeKill::AlreadyExited
        );
        assert_eq!(
            interpret_taskkill(Some(1), true, "access denied").unwrap(),
            TreeKill::AlreadyExited
        );

        let error = interpret_taskkill(Some(1), false, "access denied\r\n").unwrap_err();
        assert!(error.to_string().contains("access denied"));
        assert!(interpret_taskkill(None, false, "").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_terminates_descendants() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .spawn()
            .unwrap();
        let root = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let outcome = kill_tree(root, || false).await.unwrap();
        assert_eq!(outcome, TreeKill::Terminated);

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        // The root itself was killed, not left to exit after its children.
        assert_eq!(status.signal(), Some(9));
    }
}
