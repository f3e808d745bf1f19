use crate::shell;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use procwire_core::{
    HandleController, LoopActivity, ProcessError, ProcessHandle, ProcessRunner, ProcessStatus,
    Result, RunnerConfig, RunnerHandle, StartRequest, Watcher, join_exit,
};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ShellSlot = Arc<Mutex<Option<Child>>>;

/// A process started through the shell wrapper.
pub struct UnixProcessHandle {
    process: ProcessHandle,
    controller: Arc<HandleController>,
    command: String,
    shell_pid: u32,
    shell: ShellSlot,
    exit_watcher: Watcher,
}

impl UnixProcessHandle {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Pid of the `sh` wrapper, not of the user command.
    pub fn shell_pid(&self) -> u32 {
        self.shell_pid
    }
}

impl RunnerHandle for UnixProcessHandle {
    fn process(&self) -> &ProcessHandle {
        &self.process
    }
}

impl std::fmt::Debug for UnixProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixProcessHandle")
            .field("pid", &self.process.pid())
            .field("shell_pid", &self.shell_pid)
            .field("status", &self.process.status())
            .field("command", &self.command)
            .finish()
    }
}

/// POSIX runner: shell wrapper plus a side channel pipe on fd 3
#[derive(Debug)]
pub struct UnixProcessRunner {
    config: RunnerConfig,
    activity: LoopActivity,
}

impl UnixProcessRunner {
    fn spawn_shell(&self, request: &StartRequest) -> Result<(Child, pipe::Receiver)> {
        let (side_reader, side_writer) = std::io::pipe()?;
        let inherited = shell::open_descriptors();
        let side_fd = side_writer.as_raw_fd();

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(shell::wrap_command(&request.command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &request.working_directory {
            cmd.current_dir(dir);
        }

        if !request.inherits_env() {
            cmd.env_clear();
            cmd.envs(&request.env);
        }

        // SAFETY: the hook only issues async-signal-safe descriptor syscalls.
        unsafe {
            cmd.pre_exec(move || shell::prepare_child_descriptors(side_fd, &inherited));
        }

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::StartFailed(e.to_string()))?;

        // The child holds its own copy on fd 3; ours must go or EOF never arrives.
        drop(side_writer);

        let side_channel = pipe::Receiver::from_owned_fd(OwnedFd::from(side_reader))?;
        Ok((child, side_channel))
    }

    fn kill_now(&self, handle: &UnixProcessHandle) -> Result<()> {
        if handle.process.status() == ProcessStatus::Ended {
            return Ok(());
        }

        if let Some(pid) = handle.process.pid() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => info!(pid = %pid, "Sent SIGKILL to process"),
                Err(Errno::ESRCH) => debug!(pid = %pid, "Process already exited before kill"),
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to send SIGKILL");
                    return Err(ProcessError::KillFailed(e.to_string()));
                }
            }
        }

        handle.exit_watcher.cancel();
        handle.controller.close_stdin();
        handle.controller.mark_ended(Err(ProcessError::Killed));
        spawn_reaper(&handle.shell, self.config.reap_interval());
        Ok(())
    }
}

#[async_trait]
impl ProcessRunner for UnixProcessRunner {
    type Handle = UnixProcessHandle;

    fn new(config: &RunnerConfig, activity: LoopActivity) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProcessError::Config(e.to_string()))?;

        debug!(shell = %config.shell, "Initializing Unix process runner");
        Ok(Self {
            config: config.clone(),
            activity,
        })
    }

    async fn start(&self, request: &StartRequest) -> Result<Arc<Self::Handle>> {
        let (process, controller) = ProcessHandle::starting();
        let controller = Arc::new(controller);

        let (mut child, side_channel) = match self.spawn_shell(request) {
            Ok(spawned) => spawned,
            Err(e) => {
                controller.fail_start(&e);
                return Err(e);
            }
        };
        let shell_pid = child.id().unwrap_or_default();

        let stdio = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let shell_slot: ShellSlot = Arc::new(Mutex::new(Some(child)));

        let mut side_channel = BufReader::new(side_channel);
        let pid = match shell::read_pid(&mut side_channel).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(shell_pid, command = %request.command, error = %e, "Wrapper shell did not report a pid");
                terminate_shell(&shell_slot);
                spawn_reaper(&shell_slot, self.config.reap_interval());
                controller.fail_start(&e);
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) = stdio else {
            let e = ProcessError::StartFailed("stdio pipes were not created".to_string());
            terminate_shell(&shell_slot);
            spawn_reaper(&shell_slot, self.config.reap_interval());
            controller.fail_start(&e);
            return Err(e);
        };

        controller.mark_running(pid, Box::new(stdin), Box::new(stdout), Box::new(stderr))?;
        info!(pid = %pid, shell_pid, command = %request.command, "Started process");

        let exit_watcher = {
            let controller = controller.clone();
            let shell_slot = shell_slot.clone();
            let reap_interval = self.config.reap_interval();
            Watcher::spawn(&self.activity, "exit-code", async move {
                let outcome = shell::read_exit_code(&mut side_channel).await;
                match &outcome {
                    Ok(code) => info!(pid = %pid, exit_code = code, "Process exited"),
                    Err(e) => warn!(pid = %pid, error = %e, "Process ended without an exit code"),
                }
                controller.close_stdin();
                controller.mark_ended(outcome);
                spawn_reaper(&shell_slot, reap_interval);
            })
        };

        Ok(Arc::new(UnixProcessHandle {
            process,
            controller,
            command: request.command.clone(),
            shell_pid,
            shell: shell_slot,
            exit_watcher,
        }))
    }

    async fn join(
        &self,
        handle: &Self::Handle,
        cancellation: Option<&CancellationToken>,
    ) -> Result<i32> {
        join_exit(&handle.process, Some(&handle.exit_watcher), cancellation).await
    }

    async fn kill(&self, handle: &Self::Handle) -> Result<()> {
        self.kill_now(handle)
    }

    fn signal(&self, handle: &Self::Handle, signo: i32) -> Result<()> {
        let pid = handle.process.pid().ok_or_else(|| ProcessError::Signal {
            signo,
            reason: "process has no pid".to_string(),
        })?;

        let signal = if signo == 0 {
            None
        } else {
            Some(Signal::try_from(signo).map_err(|e| ProcessError::Signal {
                signo,
                reason: e.to_string(),
            })?)
        };

        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {
                debug!(pid = %pid, signo, "Sent signal to process");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                signo,
                reason: e.to_string(),
            }),
        }
    }

    fn destroy(&self, handle: &Self::Handle) {
        if !handle.controller.begin_destroy() {
            return;
        }

        if handle.process.status() != ProcessStatus::Ended
            && handle.process.is_owned_by_current_process()
        {
            if let Err(e) = self.kill_now(handle) {
                debug!(pid = ?handle.process.pid(), error = %e, "Ignoring kill failure during destroy");
            }
        }

        handle.exit_watcher.cancel();
        handle.controller.close_all_streams();
        spawn_reaper(&handle.shell, self.config.reap_interval());
    }
}

fn terminate_shell(shell: &Mutex<Option<Child>>) {
    let mut slot = shell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(child) = slot.as_mut() {
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Wrapper shell was already gone");
        }
    }
}

/// Polls the wrapper shell with non-blocking waits until it is reaped.
///
/// Its exit status is irrelevant; the user command's code came over the side
/// channel. Only the first caller gets the child. Without a runtime (e.g. a
/// handle dropped from sync code) a single `try_wait` is attempted and tokio's
/// orphan queue takes over the rest.
fn spawn_reaper(shell: &Mutex<Option<Child>>, interval: Duration) {
    let Some(mut child) = shell
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
    else {
        return;
    };

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        match child.try_wait() {
            Ok(Some(status)) => debug!(?status, "Reaped wrapper shell"),
            Ok(None) => debug!("Wrapper shell still running; leaving it to the orphan reaper"),
            Err(e) => warn!(error = %e, "Failed to reap wrapper shell"),
        }
        return;
    };

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "Reaped wrapper shell");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to reap wrapper shell");
                    break;
                }
            }
        }
    });
}
