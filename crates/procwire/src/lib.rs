//! procwire - asynchronous child processes with wired-up stdio
//!
//! Picks the runner of the current platform at compile time and exposes it
//! through [`Process`], started within a [`ProcessContext`].
//!
//! ```rust,ignore
//! let context = ProcessContext::default();
//! let process = Process::spawn(&context, "exit 42").await?;
//! assert_eq!(process.join().await?, 42);
//! ```

mod context;
mod factory;
mod process;

pub use context::ProcessContext;
pub use factory::{PlatformRunner, PlatformRunnerFactory};
pub use process::Process;

// Re-export core functionality
pub use procwire_core::*;
