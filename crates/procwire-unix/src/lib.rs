//! POSIX process runner
//!
//! Runs every command as a background job of `sh -c` and learns the job's
//! pid and exit code through a side channel pipe on fd 3.

#[cfg(unix)]
mod shell;
#[cfg(unix)]
mod unix_runner;

#[cfg(unix)]
pub use unix_runner::{UnixProcessHandle, UnixProcessRunner};

#[cfg(unix)]
pub use unix_factory::UnixRunnerFactory;

#[cfg(unix)]
mod unix_factory {
    use crate::UnixProcessRunner;
    use procwire_core::{LoopActivity, ProcessRunner, ProcessRunnerFactory, Result, RunnerConfig};

    /// Factory for creating Unix process runners
    pub struct UnixRunnerFactory;

    impl UnixRunnerFactory {
        pub fn platform_name() -> &'static str {
            "Unix"
        }
    }

    impl ProcessRunnerFactory for UnixRunnerFactory {
        type Runner = UnixProcessRunner;

        fn create_runner(config: &RunnerConfig, activity: LoopActivity) -> Result<Self::Runner> {
            UnixProcessRunner::new(config, activity)
        }
    }
}
