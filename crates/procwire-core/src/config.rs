use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the Windows wrapper location.
pub const WRAPPER_PATH_ENV: &str = "PROCWIRE_WRAPPER_PATH";

/// Tunables shared by the platform runners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Upper bound for the whole wrapper handshake (in milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for a single connected client to finish its handshake (in milliseconds)
    #[serde(default = "default_client_handshake_timeout_ms")]
    pub client_handshake_timeout_ms: u64,

    /// Length in bytes of each security token
    #[serde(default = "default_token_size")]
    pub token_size: usize,

    /// Interval between non-blocking reap attempts on the wrapper shell (in milliseconds)
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// POSIX shell used to run the wrapper command
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Windows wrapper executable; located next to the current executable when unset
    #[serde(default)]
    pub wrapper_path: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            client_handshake_timeout_ms: default_client_handshake_timeout_ms(),
            token_size: default_token_size(),
            reap_interval_ms: default_reap_interval_ms(),
            shell: default_shell(),
            wrapper_path: None,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("connect_timeout_ms must be greater than 0"));
        }

        if self.client_handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "client_handshake_timeout_ms must be greater than 0"
            ));
        }

        if self.client_handshake_timeout_ms > self.connect_timeout_ms {
            return Err(anyhow::anyhow!(
                "client_handshake_timeout_ms cannot be greater than connect_timeout_ms"
            ));
        }

        if !(8..=255).contains(&self.token_size) {
            return Err(anyhow::anyhow!("token_size must be between 8 and 255"));
        }

        if self.reap_interval_ms == 0 {
            return Err(anyhow::anyhow!("reap_interval_ms must be greater than 0"));
        }

        if self.shell.trim().is_empty() {
            return Err(anyhow::anyhow!("shell cannot be empty"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn client_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.client_handshake_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Wrapper executable to launch: config, then environment, then the
    /// platform-sized binary beside the current executable.
    pub fn resolve_wrapper_path(&self) -> PathBuf {
        if let Some(path) = &self.wrapper_path {
            return path.clone();
        }

        if let Some(path) = std::env::var_os(WRAPPER_PATH_ENV).filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }

        let name = if cfg!(target_pointer_width = "64") {
            "ProcessWrapper64.exe"
        } else {
            "ProcessWrapper.exe"
        };

        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// What to run. An empty `env` inherits the parent environment.
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct StartRequest {
    pub command: String,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
}

impl StartRequest {
    pub fn builder() -> StartRequestBuilder {
        StartRequestBuilder::default()
    }

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn inherits_env(&self) -> bool {
        self.env.is_empty()
    }
}

impl StartRequestBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde
fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_client_handshake_timeout_ms() -> u64 {
    1_000
}

fn default_token_size() -> usize {
    16
}

fn default_reap_interval_ms() -> u64 {
    100
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}
