use crate::handle::ProcessHandle;
use crate::runner::{ProcessRunner, RunnerHandle};
use std::sync::Arc;
use tracing::debug;

/// Owns a runner handle and destroys it exactly once on drop.
pub struct ProcHolder<R: ProcessRunner> {
    runner: Arc<R>,
    handle: Arc<R::Handle>,
}

impl<R: ProcessRunner> ProcHolder<R> {
    pub fn new(runner: Arc<R>, handle: Arc<R::Handle>) -> Self {
        Self { runner, handle }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn handle(&self) -> &R::Handle {
        &self.handle
    }

    pub fn process(&self) -> &ProcessHandle {
        self.handle.process()
    }
}

impl<R: ProcessRunner> std::fmt::Debug for ProcHolder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcHolder")
            .field("process", self.process())
            .finish()
    }
}

impl<R: ProcessRunner> Drop for ProcHolder<R> {
    fn drop(&mut self) {
        debug!(pid = ?self.process().pid(), "Releasing process holder");
        self.runner.destroy(&self.handle);
    }
}
