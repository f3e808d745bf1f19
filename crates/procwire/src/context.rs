use crate::factory::{PlatformRunner, PlatformRunnerFactory};
use procwire_core::{LoopActivity, ProcessRunnerFactory, Result, RunnerConfig};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Execution context that owns at most one runner.
///
/// The runner is created on first use and shared by every process started
/// through this context. Contexts are cheap to clone; clones share the runner.
#[derive(Clone, Debug)]
pub struct ProcessContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    config: RunnerConfig,
    activity: LoopActivity,
    runner: OnceCell<Arc<PlatformRunner>>,
}

impl ProcessContext {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                activity: LoopActivity::new(),
                runner: OnceCell::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Watchers of this context; referenced ones keep it busy.
    pub fn activity(&self) -> &LoopActivity {
        &self.inner.activity
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.runner.initialized()
    }

    /// Returns the context's runner, creating it on the first call.
    pub async fn runner(&self) -> Result<Arc<PlatformRunner>> {
        self.inner
            .runner
            .get_or_try_init(|| async {
                debug!(
                    platform = PlatformRunnerFactory::platform_name(),
                    "Creating process runner"
                );
                PlatformRunnerFactory::create_runner(&self.inner.config, self.inner.activity.clone())
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Resolves once no watcher of this context is referenced.
    pub async fn idle(&self) {
        self.inner.activity.idle().await
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}
