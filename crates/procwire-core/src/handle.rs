use crate::error::{ProcessError, Result};
use crate::exit::{ExitOutcome, ExitSignal};
use crate::status::{ProcessStatus, StatusCell};
use crate::streams::{
    BoxedReader, BoxedWriter, ReadableProcessStream, StreamResolver, WritableProcessStream,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct HandleInner {
    status: StatusCell,
    pid: OnceLock<u32>,
    original_parent_pid: u32,
    stdin: WritableProcessStream,
    stdout: ReadableProcessStream,
    stderr: ReadableProcessStream,
    exit: ExitSignal,
    destroyed: AtomicBool,
}

/// Read-only view of one spawned process.
///
/// All state changes go through the [`HandleController`] owned by the runner
/// that created the handle.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    /// Creates a handle in [`ProcessStatus::Starting`] with deferred stdio.
    pub fn starting() -> (ProcessHandle, HandleController) {
        let (stdin_resolver, stdin) = WritableProcessStream::pending();
        let (stdout_resolver, stdout) = ReadableProcessStream::pending();
        let (stderr_resolver, stderr) = ReadableProcessStream::pending();

        let inner = Arc::new(HandleInner {
            status: StatusCell::default(),
            pid: OnceLock::new(),
            original_parent_pid: std::process::id(),
            stdin,
            stdout,
            stderr,
            exit: ExitSignal::new(),
            destroyed: AtomicBool::new(false),
        });

        let controller = HandleController {
            inner: inner.clone(),
            resolvers: Mutex::new(Some(StdioResolvers {
                stdin: stdin_resolver,
                stdout: stdout_resolver,
                stderr: stderr_resolver,
            })),
        };

        (ProcessHandle { inner }, controller)
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Known once the process has left `Starting`.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    /// Pid of the OS process that created this handle.
    pub fn original_parent_pid(&self) -> u32 {
        self.inner.original_parent_pid
    }

    /// False in a forked copy of the creating process.
    pub fn is_owned_by_current_process(&self) -> bool {
        std::process::id() == self.inner.original_parent_pid
    }

    pub fn stdin(&self) -> &WritableProcessStream {
        &self.inner.stdin
    }

    pub fn stdout(&self) -> &ReadableProcessStream {
        &self.inner.stdout
    }

    pub fn stderr(&self) -> &ReadableProcessStream {
        &self.inner.stderr
    }

    /// Waits for the exit outcome without touching any watcher reference.
    pub async fn wait(&self, cancellation: Option<&CancellationToken>) -> ExitOutcome {
        self.inner.exit.wait(cancellation).await
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.inner.exit.peek()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct StdioResolvers {
    stdin: StreamResolver<BoxedWriter>,
    stdout: StreamResolver<BoxedReader>,
    stderr: StreamResolver<BoxedReader>,
}

/// Mutating side of a [`ProcessHandle`], held only by its runner.
#[derive(Debug)]
pub struct HandleController {
    inner: Arc<HandleInner>,
    resolvers: Mutex<Option<StdioResolvers>>,
}

impl HandleController {
    fn take_resolvers(&self) -> Option<StdioResolvers> {
        self.resolvers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Starting -> Running: records the pid and connects stdio.
    ///
    /// Fails if the process has already left `Starting`.
    pub fn mark_running(
        &self,
        pid: u32,
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: BoxedReader,
    ) -> Result<()> {
        let resolvers = self
            .take_resolvers()
            .ok_or_else(|| ProcessError::StartFailed("process was already started".into()))?;

        if self.inner.pid.set(pid).is_err() {
            return Err(ProcessError::StartFailed("pid was already recorded".into()));
        }

        // Status first: whoever sees a live stream must also see `Running`.
        let previous = self.inner.status.advance(ProcessStatus::Running);
        if previous != ProcessStatus::Starting {
            return Err(ProcessError::StartFailed(format!(
                "process was {previous} before it started running"
            )));
        }

        resolvers.stdin.resolve(stdin);
        resolvers.stdout.resolve(stdout);
        resolvers.stderr.resolve(stderr);
        Ok(())
    }

    /// Fails every deferred stream of a process that never reached `Running`.
    pub fn fail_start(&self, error: &ProcessError) {
        if let Some(resolvers) = self.take_resolvers() {
            resolvers.stdin.fail(error.clone());
            resolvers.stdout.fail(error.clone());
            resolvers.stderr.fail(error.clone());
        }
        self.inner.exit.complete(Err(error.clone()));
        self.inner.status.advance(ProcessStatus::Ended);
    }

    /// Records the exit outcome, then moves to `Ended`.
    ///
    /// Returns false if an outcome was already recorded.
    pub fn mark_ended(&self, outcome: ExitOutcome) -> bool {
        let first = self.inner.exit.complete(outcome);
        self.inner.status.advance(ProcessStatus::Ended);
        first
    }

    /// Flags the handle as destroyed. True only for the first caller.
    pub fn begin_destroy(&self) -> bool {
        !self.inner.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn close_stdin(&self) {
        self.inner.stdin.close();
    }

    pub fn close_all_streams(&self) {
        self.inner.stdin.close();
        self.inner.stdout.close();
        self.inner.stderr.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_starting_handle_has_no_pid() {
        let (handle, _controller) = ProcessHandle::starting();
        assert_eq!(handle.status(), ProcessStatus::Starting);
        assert_eq!(handle.pid(), None);
        assert!(handle.is_owned_by_current_process());
        assert!(handle.exit_outcome().is_none());
    }

    #[tokio::test]
    async fn test_mark_running_connects_stdio() {
        let (handle, controller) = ProcessHandle::starting();
        let (stdin, mut stdin_child) = duplex(32);
        let (stdout, mut stdout_child) = duplex(32);
        let (stderr, _stderr_child) = duplex(32);

        controller
            .mark_running(42, Box::new(stdin), Box::new(stdout), Box::new(stderr))
            .unwrap();
        assert_eq!(handle.status(), ProcessStatus::Running);
        assert_eq!(handle.pid(), Some(42));

        handle.stdin().write("ping").await.unwrap();
        let mut buf = [0u8; 4];
        stdin_child.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stdout_child.write_all(b"pong").await.unwrap();
        drop(stdout_child);
        assert_eq!(&handle.stdout().read_to_end().await.unwrap()[..], b"pong");

        let again = controller.mark_running(
            43,
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::empty()),
        );
        assert!(again.is_err());
        assert_eq!(handle.pid(), Some(42));
    }

    #[tokio::test]
    async fn test_resolved_stream_observes_running_status() {
        let (handle, controller) = ProcessHandle::starting();

        let reader = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let chunk = handle.stdout().read().await;
                (handle.status(), chunk)
            })
        };
        tokio::task::yield_now().await;

        controller
            .mark_running(
                5,
                Box::new(tokio::io::sink()),
                Box::new(std::io::Cursor::new(b"up".to_vec())),
                Box::new(tokio::io::empty()),
            )
            .unwrap();

        let (status, chunk) = reader.await.unwrap();
        assert_eq!(status, ProcessStatus::Running);
        assert_eq!(&chunk.unwrap().unwrap()[..], b"up");
    }

    #[tokio::test]
    async fn test_ended_implies_outcome() {
        let (handle, controller) = ProcessHandle::starting();
        assert!(controller.mark_ended(Ok(7)));
        assert_eq!(handle.status(), ProcessStatus::Ended);
        assert!(matches!(handle.exit_outcome(), Some(Ok(7))));

        assert!(!controller.mark_ended(Err(ProcessError::Killed)));
        assert_eq!(handle.wait(None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fail_start_propagates_to_streams() {
        let (handle, controller) = ProcessHandle::starting();
        controller.fail_start(&ProcessError::StartFailed("no shell".into()));

        assert_eq!(handle.status(), ProcessStatus::Ended);
        assert!(handle.wait(None).await.unwrap_err().is_start_failure());
        assert!(matches!(
            handle.stdin().write("x").await,
            Err(ProcessError::LaunchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_flag_is_set_once() {
        let (handle, controller) = ProcessHandle::starting();
        assert!(controller.begin_destroy());
        assert!(!controller.begin_destroy());
        assert!(handle.is_destroyed());
    }
}
