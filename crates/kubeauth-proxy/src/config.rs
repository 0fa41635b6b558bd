//! Supervisor configuration
//!
//! Loaded from an optional TOML file, then overridden by `KUBEAUTH_*`
//! environment variables (`__` separates nested keys, e.g.
//! `KUBEAUTH_PROBE__TIMEOUT_MS=20000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AuthProxyError;

/// Default proxy binary, resolved through `PATH`
pub const DEFAULT_PROXY_BIN: &str = "lens-k8s-proxy";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KUBEAUTH";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<ConfigError> for AuthProxyError {
    fn from(err: ConfigError) -> Self {
        AuthProxyError::Config(err.to_string())
    }
}

/// Readiness probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Delay between connection attempts
    pub interval_ms: u64,
    /// Overall budget for the port to start accepting connections
    pub timeout_ms: u64,
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            timeout_ms: 10_000,
        }
    }
}

/// What to do when the readiness probe times out
///
/// The default restarts forever without delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Maximum restarts per `run()`; `None` means unbounded
    pub max_restarts: Option<u32>,
    /// Pause before each restart
    pub backoff_ms: u64,
}

impl RestartPolicy {
    /// Bounded policy with a fixed backoff
    pub fn limited(max_restarts: u32, backoff: Duration) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Whether another restart is allowed after `restarts` have happened
    pub fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts < max)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Top-level supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthProxyConfig {
    /// Path to the proxy binary
    pub proxy_bin_path: PathBuf,
    /// Extra arguments for the proxy binary
    pub args: Vec<String>,
    pub probe: ProbeConfig,
    pub restart: RestartPolicy,
    /// How long a stopping proxy gets between SIGTERM and SIGKILL
    pub stop_grace_ms: u64,
}

impl Default for AuthProxyConfig {
    fn default() -> Self {
        Self {
            proxy_bin_path: PathBuf::from(DEFAULT_PROXY_BIN),
            args: Vec::new(),
            probe: ProbeConfig::default(),
            restart: RestartPolicy::default(),
            stop_grace_ms: 5_000,
        }
    }
}

impl AuthProxyConfig {
    /// Load from an optional TOML file plus `KUBEAUTH_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: AuthProxyConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the supervisor cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_bin_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "proxy_bin_path must not be empty".to_string(),
            ));
        }
        if self.probe.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "probe.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.probe.timeout_ms < self.probe.interval_ms {
            return Err(ConfigError::Validation(format!(
                "probe.timeout_ms ({}) must be at least probe.interval_ms ({})",
                self.probe.timeout_ms, self.probe.interval_ms
            )));
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
