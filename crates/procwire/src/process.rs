use crate::context::ProcessContext;
use crate::factory::PlatformRunner;
use procwire_core::{
    ExitOutcome, ProcHolder, ProcessHandle, ProcessRunner, ProcessStatus, ReadableProcessStream,
    Result, StartRequest, WritableProcessStream,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A started child process.
///
/// Dropping the value destroys the process: it is killed if still running
/// and its streams are closed.
#[derive(Debug)]
pub struct Process {
    holder: ProcHolder<PlatformRunner>,
    request: StartRequest,
    working_directory: PathBuf,
}

impl Process {
    /// Starts `request` on the context's runner.
    pub async fn start(context: &ProcessContext, request: StartRequest) -> Result<Self> {
        let runner = context.runner().await?;
        let handle = runner.start(&request).await?;

        let working_directory = request
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            holder: ProcHolder::new(runner, handle),
            request,
            working_directory,
        })
    }

    /// Starts `command` with the inherited environment and working directory.
    pub async fn spawn(context: &ProcessContext, command: impl Into<String>) -> Result<Self> {
        Self::start(context, StartRequest::new(command)).await
    }

    fn handle(&self) -> &ProcessHandle {
        self.holder.process()
    }

    /// Waits for the exit code.
    pub async fn join(&self) -> Result<i32> {
        self.holder.runner().join(self.holder.handle(), None).await
    }

    /// Waits for the exit code until `cancellation` fires.
    pub async fn join_with_cancellation(&self, cancellation: &CancellationToken) -> Result<i32> {
        self.holder
            .runner()
            .join(self.holder.handle(), Some(cancellation))
            .await
    }

    /// Kills the process and waits until its outcome is recorded.
    pub async fn kill(&self) -> Result<()> {
        if !self.is_running() {
            debug!(pid = ?self.pid(), "Process is not running; nothing to kill");
            return Ok(());
        }

        self.holder.runner().kill(self.holder.handle()).await?;
        let _ = self.handle().wait(None).await;
        Ok(())
    }

    /// Sends `signo`. Does nothing once the process has ended.
    pub fn signal(&self, signo: i32) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.holder.runner().signal(self.holder.handle(), signo)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle().pid()
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_running()
    }

    pub fn status(&self) -> ProcessStatus {
        self.handle().status()
    }

    /// The recorded outcome, once the process has ended.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.handle().exit_outcome()
    }

    pub fn command(&self) -> &str {
        &self.request.command
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Explicit environment of the process; empty when it inherited ours.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.request.env
    }

    pub fn stdin(&self) -> &WritableProcessStream {
        self.handle().stdin()
    }

    pub fn stdout(&self) -> &ReadableProcessStream {
        self.handle().stdout()
    }

    pub fn stderr(&self) -> &ReadableProcessStream {
        self.handle().stderr()
    }
}
