use crate::connector::{ConnectedSockets, SocketConnector};
use crate::protocol::{self, PACKET_LEN, SIGNAL_CHILD_PID, SIGNAL_EXIT_CODE};
use crate::tokens::SecurityTokens;
use crate::tree;
use async_trait::async_trait;
use procwire_core::{
    ExitOutcome, HandleController, LoopActivity, ProcessError, ProcessHandle, ProcessRunner,
    ProcessStatus, Result, RunnerConfig, RunnerHandle, StartRequest, Watcher, join_exit,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_MESSAGE: &str = "Process did not connect to server before timeout elapsed";
const WRAPPER_EXIT_GRACE: Duration = Duration::from_millis(200);

/// A process started through the wrapper executable.
pub struct WindowsProcessHandle {
    process: ProcessHandle,
    controller: Arc<HandleController>,
    command: String,
    wrapper_pid: u32,
    wrapper: Arc<Mutex<Child>>,
    exit_watcher: Watcher,
}

impl WindowsProcessHandle {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Pid of the wrapper executable, root of the killed tree.
    pub fn wrapper_pid(&self) -> u32 {
        self.wrapper_pid
    }

    /// Tree-kill fallback check that owns its own reference to the wrapper.
    fn wrapper_exited_check(&self) -> impl Fn() -> bool + Send + 'static + use<> {
        let wrapper = Arc::clone(&self.wrapper);
        move || wrapper_exited(&wrapper)
    }
}

fn wrapper_exited(wrapper: &Mutex<Child>) -> bool {
    let mut wrapper = wrapper
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    matches!(wrapper.try_wait(), Ok(Some(_)))
}

impl RunnerHandle for WindowsProcessHandle {
    fn process(&self) -> &ProcessHandle {
        &self.process
    }
}

impl std::fmt::Debug for WindowsProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsProcessHandle")
            .field("pid", &self.process.pid())
            .field("wrapper_pid", &self.wrapper_pid)
            .field("status", &self.process.status())
            .field("command", &self.command)
            .finish()
    }
}

/// Windows runner: a wrapper executable bridges child stdio to loopback sockets
#[derive(Debug)]
pub struct WindowsProcessRunner {
    config: RunnerConfig,
    activity: LoopActivity,
    connector: SocketConnector,
    wrapper_path: PathBuf,
}

/// Command line switches understood by the wrapper executable.
pub fn wrapper_arguments(
    connector_address: std::net::SocketAddr,
    token_size: usize,
    working_directory: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        format!("--address={}", connector_address.ip()),
        format!("--port={}", connector_address.port()),
        format!("--token-size={token_size}"),
    ];

    if let Some(dir) = working_directory {
        let dir = dir.to_string_lossy();
        args.push(format!("--cwd={}", dir.trim_end_matches('\\')));
    }

    args
}

impl WindowsProcessRunner {
    pub fn connector(&self) -> &SocketConnector {
        &self.connector
    }

    fn spawn_wrapper(&self, request: &StartRequest) -> Result<Child> {
        let mut cmd = Command::new(&self.wrapper_path);
        cmd.args(wrapper_arguments(
            self.connector.address(),
            self.config.token_size,
            request.working_directory.as_deref(),
        ))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        if !request.inherits_env() {
            cmd.env_clear();
            cmd.envs(&request.env);
        }

        #[cfg(windows)]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        cmd.spawn()
            .map_err(|e| ProcessError::StartFailed(format!("Could not start process wrapper: {e}")))
    }

    /// Hands tokens and command to the wrapper, then closes its stdin and stdout.
    async fn send_payload(wrapper: &mut Child, tokens: &SecurityTokens, command: &str) -> Result<()> {
        let payload = tokens.wrapper_payload(command);
        let mut stdin = wrapper.stdin.take().ok_or_else(|| {
            ProcessError::StartFailed("Process wrapper has no stdin".to_string())
        })?;

        stdin.write_all(&payload).await.map_err(|_| {
            ProcessError::StartFailed(
                "Could not send security tokens / command to process wrapper".to_string(),
            )
        })?;
        drop(stdin);
        drop(wrapper.stdout.take());
        Ok(())
    }

    /// Explains a failed start, preferring what the wrapper printed.
    async fn describe_start_failure(wrapper: &mut Child, error: Option<ProcessError>) -> ProcessError {
        let exited = tokio::time::timeout(WRAPPER_EXIT_GRACE, wrapper.wait()).await;
        if let Ok(Ok(status)) = exited {
            let mut message = String::new();
            if let Some(mut stderr) = wrapper.stderr.take() {
                let _ = tokio::time::timeout(
                    Duration::from_millis(500),
                    stderr.read_to_string(&mut message),
                )
                .await;
            }

            let message = message.trim();
            return ProcessError::StartFailed(if message.is_empty() {
                format!("Process wrapper exited with {status}")
            } else {
                message.to_string()
            });
        }

        error.unwrap_or_else(|| ProcessError::StartFailed(CONNECT_TIMEOUT_MESSAGE.to_string()))
    }

    async fn connect(
        &self,
        wrapper: &mut Child,
        wrapper_pid: u32,
        tokens: Arc<SecurityTokens>,
        command: &str,
    ) -> Result<(u32, ConnectedSockets)> {
        let mut pending = self.connector.register(wrapper_pid, tokens.clone());
        Self::send_payload(wrapper, &tokens, command).await?;

        let mut sockets = tokio::select! {
            connected = pending.connected() => connected?,
            status = wrapper.wait() => {
                return Err(ProcessError::StartFailed(format!(
                    "Process wrapper exited with {}",
                    status?
                )));
            }
        };
        let mut packet = [0u8; PACKET_LEN];
        sockets[0]
            .read_exact(&mut packet)
            .await
            .map_err(|e| ProcessError::Handshake(format!("Failed to read child pid: {e}")))?;
        let pid = protocol::decode_packet(packet, SIGNAL_CHILD_PID)?;
        Ok((pid, sockets))
    }

    fn kill_now_blocking(&self, handle: &WindowsProcessHandle) -> Result<()> {
        if handle.process.status() == ProcessStatus::Ended {
            return Ok(());
        }

        tree::kill_tree_blocking(handle.wrapper_pid, handle.wrapper_exited_check())?;
        Self::mark_killed(handle);
        Ok(())
    }

    fn mark_killed(handle: &WindowsProcessHandle) {
        handle.exit_watcher.cancel();
        handle.controller.close_stdin();
        handle.controller.mark_ended(Err(ProcessError::Killed));
    }
}

async fn read_exit_code(exit_channel: &mut OwnedReadHalf) -> ExitOutcome {
    let mut packet = [0u8; PACKET_LEN];
    exit_channel
        .read_exact(&mut packet)
        .await
        .map_err(|e| ProcessError::ExitCodeUnavailable(e.to_string()))?;

    protocol::decode_packet(packet, SIGNAL_EXIT_CODE)
        .map(|code| code as i32)
        .map_err(|e| ProcessError::ExitCodeUnavailable(e.to_string()))
}

#[async_trait]
impl ProcessRunner for WindowsProcessRunner {
    type Handle = WindowsProcessHandle;

    fn new(config: &RunnerConfig, activity: LoopActivity) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProcessError::Config(e.to_string()))?;

        let connector = SocketConnector::bind(&activity, config)?;
        let wrapper_path = config.resolve_wrapper_path();
        debug!(wrapper = %wrapper_path.display(), "Initializing Windows process runner");

        Ok(Self {
            config: config.clone(),
            activity,
            connector,
            wrapper_path,
        })
    }

    async fn start(&self, request: &StartRequest) -> Result<Arc<Self::Handle>> {
        let (process, controller) = ProcessHandle::starting();
        let controller = Arc::new(controller);

        if request.command.contains('\0') {
            let e = ProcessError::StartFailed("Can't spawn commands with null bytes".to_string());
            controller.fail_start(&e);
            return Err(e);
        }

        let mut wrapper = match self.spawn_wrapper(request) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                controller.fail_start(&e);
                return Err(e);
            }
        };
        let wrapper_pid = wrapper.id().unwrap_or_default();
        let tokens = Arc::new(SecurityTokens::generate(self.config.token_size));

        let connected = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connect(&mut wrapper, wrapper_pid, tokens, &request.command),
        )
        .await;

        let (pid, [stdin_socket, stdout, stderr]) = match connected {
            Ok(Ok(connected)) => connected,
            failed => {
                let cause = failed.ok().and_then(std::result::Result::err);
                let e = Self::describe_start_failure(&mut wrapper, cause).await;
                warn!(wrapper_pid, command = %request.command, error = %e, "Process wrapper failed to start");
                if let Err(kill_error) = wrapper.start_kill() {
                    debug!(wrapper_pid, error = %kill_error, "Process wrapper was already gone");
                }
                controller.fail_start(&e);
                return Err(e);
            }
        };

        let (mut exit_channel, stdin) = stdin_socket.into_split();
        controller.mark_running(pid, Box::new(stdin), Box::new(stdout), Box::new(stderr))?;
        info!(pid = %pid, wrapper_pid, command = %request.command, "Started process");

        let exit_watcher = {
            let controller = controller.clone();
            Watcher::spawn(&self.activity, "exit-code", async move {
                let outcome = read_exit_code(&mut exit_channel).await;
                match &outcome {
                    Ok(code) => info!(pid = %pid, exit_code = code, "Process exited"),
                    Err(e) => warn!(pid = %pid, error = %e, "Process ended without an exit code"),
                }
                controller.close_stdin();
                controller.mark_ended(outcome);
            })
        };

        Ok(Arc::new(WindowsProcessHandle {
            process,
            controller,
            command: request.command.clone(),
            wrapper_pid,
            wrapper: Arc::new(Mutex::new(wrapper)),
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
        if handle.process.status() == ProcessStatus::Ended {
            return Ok(());
        }

        tree::kill_tree(handle.wrapper_pid, handle.wrapper_exited_check()).await?;
        Self::mark_killed(handle);
        Ok(())
    }

    fn signal(&self, _handle: &Self::Handle, _signo: i32) -> Result<()> {
        Err(ProcessError::Unsupported(
            "Signals are not supported on Windows",
        ))
    }

    fn destroy(&self, handle: &Self::Handle) {
        if !handle.controller.begin_destroy() {
            return;
        }

        if handle.process.status() != ProcessStatus::Ended
            && handle.process.is_owned_by_current_process()
        {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let wrapper_pid = handle.wrapper_pid;
                    let wrapper_exited = handle.wrapper_exited_check();
                    runtime.spawn(async move {
                        if let Err(e) = tree::kill_tree(wrapper_pid, wrapper_exited).await {
                            debug!(wrapper_pid, error = %e, "Ignoring kill failure during destroy");
                        }
                    });
                    Self::mark_killed(handle);
                }
                Err(_) => {
                    if let Err(e) = self.kill_now_blocking(handle) {
                        debug!(pid = ?handle.process.pid(), error = %e, "Ignoring kill failure during destroy");
                    }
                }
            }
        }

        handle.exit_watcher.cancel();
        handle.controller.close_all_streams();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn test_wrapper_arguments() {
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, 50123));
        assert_eq!(
            wrapper_arguments(address, 16, None),
            vec!["--address=127.0.0.1", "--port=50123", "--token-size=16"]
        );

        let args = wrapper_arguments(address, 32, Some(Path::new("C:\\work\\dir\\\\")));
        assert_eq!(args.last().unwrap(), "--cwd=C:\\work\\dir");
    }

    #[tokio::test]
    async fn test_null_bytes_are_rejected() {
        let runner = WindowsProcessRunner::new(&RunnerConfig::default(), LoopActivity::new()).unwrap();
        let error = runner
            .start(&StartRequest::new("echo \0 oops"))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("null bytes"));
        assert_eq!(runner.connector().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_is_unsupported() {
        let (process, controller) = ProcessHandle::starting();
        let runner = WindowsProcessRunner::new(&RunnerConfig::default(), LoopActivity::new()).unwrap();
        let activity = LoopActivity::new();
        // Any short-lived child will do; the runner never looks at it here.
        let mut child = Command::new(std::env::current_exe().unwrap());
        child.arg("--list").stdout(Stdio::null()).stderr(Stdio::null());
        let handle = WindowsProcessHandle {
            process,
            controller: Arc::new(controller),
            command: "noop".to_string(),
            wrapper_pid: 0,
            wrapper: Arc::new(Mutex::new(child.spawn().unwrap())),
            exit_watcher: Watcher::spawn(&activity, "exit-code", async {}),
        };

        let error = runner.signal(&handle, 15).unwrap_err();
        assert!(matches!(error, ProcessError::Unsupported(_)));
        assert_eq!(error.to_string(), "Signals are not supported on Windows");
    }
}
