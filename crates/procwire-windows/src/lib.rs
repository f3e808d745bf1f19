//! Windows process runner
//!
//! Commands run under an external wrapper executable. The wrapper connects
//! the child's stdio to three loopback sockets, authenticated by one-time
//! tokens, and reports the child's pid and exit code over the stdin socket.
//!
//! Nothing here is Windows-only except the tree kill and creation flags, so
//! the handshake is exercised on every platform.

pub mod connector;
pub mod protocol;
pub mod tokens;
pub mod tree;
mod windows_runner;

pub use connector::{ConnectedSockets, PendingConnection, SocketConnector};
pub use tokens::SecurityTokens;
pub use windows_runner::{WindowsProcessHandle, WindowsProcessRunner, wrapper_arguments};

use procwire_core::{LoopActivity, ProcessRunner, ProcessRunnerFactory, Result, RunnerConfig};

/// Factory for creating Windows process runners
pub struct WindowsRunnerFactory;

impl WindowsRunnerFactory {
    pub fn platform_name() -> &'static str {
        "Windows"
    }
}

impl ProcessRunnerFactory for WindowsRunnerFactory {
    type Runner = WindowsProcessRunner;

    fn create_runner(config: &RunnerConfig, activity: LoopActivity) -> Result<Self::Runner> {
        WindowsProcessRunner::new(config, activity)
    }
}
