use crate::config::{RunnerConfig, StartRequest};
use crate::error::Result;
use crate::handle::ProcessHandle;
use crate::watcher::{LoopActivity, Watcher, WatcherRef};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Platform state wrapped around a [`ProcessHandle`].
///
/// Runners return their own handle type so they can keep the OS resources
/// (child, side channel, sockets, watchers) next to the shared state without
/// exposing them to callers.
pub trait RunnerHandle: Send + Sync + 'static {
    fn process(&self) -> &ProcessHandle;
}

/// Platform strategy for spawning and supervising child processes
///
/// A runner owns every handle it creates: it is the only component that
/// moves a handle through `Starting -> Running -> Ended` and completes its
/// exit signal. Callers only read the handle and pass it back to the same
/// runner for `join`/`kill`/`signal`/`destroy`.
///
/// # Implementation Notes
///
/// Implementations should:
/// - Resolve every start failure before `start()` returns, so callers never
///   see a handle in an inconsistent state
/// - Keep exit watchers unreferenced except while a `join()` waits on them
/// - Deliver errors that happen after `Running` only through the exit signal
/// - Make `destroy()` idempotent and swallow any error of its internal kill
///
/// # Example Usage
///
/// ```rust,ignore
/// let runner = SomePlatformRunner::new(&RunnerConfig::default(), LoopActivity::new())?;
/// let handle = runner.start(&StartRequest::new("exit 42")).await?;
/// assert_eq!(runner.join(&handle, None).await?, 42);
/// runner.destroy(&handle);
/// ```
#[async_trait]
pub trait ProcessRunner: Send + Sync + 'static {
    /// The type of handle returned by this runner
    type Handle: RunnerHandle;

    /// Create a runner bound to one context's [`LoopActivity`]
    fn new(config: &RunnerConfig, activity: LoopActivity) -> Result<Self>
    where
        Self: Sized;

    /// Spawn `request` and wait until its pid and stdio are known
    async fn start(&self, request: &StartRequest) -> Result<Arc<Self::Handle>>;

    /// Wait for the exit code
    ///
    /// The exit watcher is referenced for the duration of the wait.
    /// Cancelling only stops this caller from waiting; the process and any
    /// other joiners are unaffected.
    async fn join(
        &self,
        handle: &Self::Handle,
        cancellation: Option<&CancellationToken>,
    ) -> Result<i32>;

    /// Forcibly terminate the process. Its exit signal fails with `Killed`
    async fn kill(&self, handle: &Self::Handle) -> Result<()>;

    /// Send `signo` to the process
    fn signal(&self, handle: &Self::Handle, signo: i32) -> Result<()>;

    /// Release the process, killing it first if still running. Idempotent.
    fn destroy(&self, handle: &Self::Handle);
}

/// Factory trait for creating the runner of one platform
pub trait ProcessRunnerFactory {
    /// The type of runner this factory creates
    type Runner: ProcessRunner;

    fn create_runner(config: &RunnerConfig, activity: LoopActivity) -> Result<Self::Runner>;
}

/// Waits on `handle`'s exit signal with `watcher` referenced for the duration.
pub async fn join_exit(
    handle: &ProcessHandle,
    watcher: Option<&Watcher>,
    cancellation: Option<&CancellationToken>,
) -> Result<i32> {
    let _reference = watcher
        .map(Watcher::reference)
        .unwrap_or_else(WatcherRef::detached);
    handle.wait(cancellation).await
}
