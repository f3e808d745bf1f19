use procwire_core::{LoopActivity, ProcessRunnerFactory, Result, RunnerConfig};

#[cfg(unix)]
pub type PlatformRunner = procwire_unix::UnixProcessRunner;

#[cfg(windows)]
pub type PlatformRunner = procwire_windows::WindowsProcessRunner;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformRunnerFactory;

impl PlatformRunnerFactory {
    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        return procwire_unix::UnixRunnerFactory::platform_name();

        #[cfg(windows)]
        return procwire_windows::WindowsRunnerFactory::platform_name();
    }
}

impl ProcessRunnerFactory for PlatformRunnerFactory {
    type Runner = PlatformRunner;

    fn create_runner(config: &RunnerConfig, activity: LoopActivity) -> Result<Self::Runner> {
        #[cfg(unix)]
        return procwire_unix::UnixRunnerFactory::create_runner(config, activity);

        #[cfg(windows)]
        return procwire_windows::WindowsRunnerFactory::create_runner(config, activity);
    }
}
