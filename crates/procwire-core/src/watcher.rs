//! Background watchers with explicit loop referencing.
//!
//! A tokio task does not by itself say whether it should keep its owner alive.
//! `Watcher` adds that bit: every watcher starts *unreferenced*, callers that
//! need it to finish (e.g. `join()`) take a [`WatcherRef`] for the duration of
//! their wait, and [`LoopActivity`] reports how many watchers are currently
//! referenced so the owning context can tell whether it is idle.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::debug;

/// Count of referenced watchers belonging to one context.
#[derive(Clone, Debug, Default)]
pub struct LoopActivity {
    inner: Arc<ActivityInner>,
}

#[derive(Debug, Default)]
struct ActivityInner {
    referenced: AtomicUsize,
    idle: Notify,
}

impl LoopActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watchers that currently keep the context alive.
    pub fn referenced(&self) -> usize {
        self.inner.referenced.load(Ordering::Acquire)
    }

    /// Resolves once no watcher is referenced.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.referenced() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn acquire(&self) {
        self.inner.referenced.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.inner.referenced.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[derive(Debug, Default)]
struct WatcherState {
    refs: usize,
    cancelled: bool,
}

#[derive(Debug)]
struct WatcherShared {
    label: &'static str,
    activity: LoopActivity,
    state: Mutex<WatcherState>,
}

impl WatcherShared {
    fn state(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reference(&self) -> bool {
        let mut state = self.state();
        if state.cancelled {
            return false;
        }
        state.refs += 1;
        if state.refs == 1 {
            self.activity.acquire();
        }
        true
    }

    fn unreference(&self) {
        let mut state = self.state();
        if state.cancelled || state.refs == 0 {
            return;
        }
        state.refs -= 1;
        if state.refs == 0 {
            self.activity.release();
        }
    }

    /// Drops every outstanding reference and marks the watcher dead.
    fn retire(&self) -> bool {
        let mut state = self.state();
        if state.cancelled {
            return false;
        }
        state.cancelled = true;
        if state.refs > 0 {
            state.refs = 0;
            self.activity.release();
        }
        true
    }
}

/// A spawned background task tied to a [`LoopActivity`].
#[derive(Debug)]
pub struct Watcher {
    shared: Arc<WatcherShared>,
    task: AbortHandle,
}

impl Watcher {
    /// Spawns `future` as an unreferenced watcher.
    ///
    /// When the future completes the watcher retires itself, releasing any
    /// references still held on it.
    pub fn spawn<F>(activity: &LoopActivity, label: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(WatcherShared {
            label,
            activity: activity.clone(),
            state: Mutex::new(WatcherState::default()),
        });

        let on_exit = shared.clone();
        let task = tokio::spawn(async move {
            future.await;
            on_exit.retire();
        });

        Self {
            shared,
            task: task.abort_handle(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.shared.label
    }

    /// References the watcher until the returned guard is dropped.
    ///
    /// Referencing a finished or cancelled watcher is a no-op.
    pub fn reference(&self) -> WatcherRef {
        let active = self.shared.reference();
        WatcherRef {
            shared: active.then(|| self.shared.clone()),
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.shared.state().refs > 0
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unreferences, then aborts the task. Idempotent.
    pub fn cancel(&self) {
        if self.shared.retire() {
            debug!(watcher = self.shared.label, "Cancelled watcher");
        }
        self.task.abort();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Keeps a [`Watcher`] referenced while alive.
#[derive(Debug)]
#[must_use = "the watcher is unreferenced again as soon as the guard is dropped"]
pub struct WatcherRef {
    shared: Option<Arc<WatcherShared>>,
}

impl WatcherRef {
    /// A guard that references nothing, for waits that have no watcher.
    pub fn detached() -> Self {
        Self { shared: None }
    }
}

impl Drop for WatcherRef {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.unreference();
        }
    }
}
