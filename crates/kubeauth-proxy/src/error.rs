//! Error types for the auth proxy supervisor

use thiserror::Error;

/// Errors surfaced by a proxy instance
///
/// Cloneable so a single failed attempt can be handed to every caller
/// waiting on the same `run()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthProxyError {
    /// The proxy binary could not be started
    #[error("failed to start proxy: {0}")]
    Spawn(String),

    /// Stdout ended before the startup line was seen
    #[error("proxy output closed before a port was announced")]
    StreamClosed,

    /// Reading the proxy's output failed
    #[error("proxy disconnected communications: {0}")]
    Disconnected(String),

    /// The OS reported an error while waiting on the process
    #[error("proxy process failed: {0}")]
    ProcessFailed(String),

    /// The process exited on its own
    #[error("proxy exited with code: {}", fmt_code(.code))]
    Exited { code: Option<i32> },

    /// The announced port never accepted a connection
    #[error("port {port} was not used within {timeout_ms}ms")]
    ProbeTimeout { port: u16, timeout_ms: u64 },

    /// The restart budget ran out after repeated probe timeouts
    #[error("proxy gave up after {restarts} restarts")]
    RestartLimitExceeded { restarts: u32 },

    /// `port()` was read before discovery
    #[error("port has not yet been initialized")]
    PortNotInitialized,

    /// `exit()` was called while the caller was waiting
    #[error("proxy was stopped")]
    Stopped,

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl From<kubeauth_process::ProcessError> for AuthProxyError {
    fn from(err: kubeauth_process::ProcessError) -> Self {
        match err {
            kubeauth_process::ProcessError::SpawnFailed(e) => AuthProxyError::Spawn(e.to_string()),
            other => AuthProxyError::ProcessFailed(other.to_string()),
        }
    }
}

/// Result type for auth proxy operations
pub type Result<T> = std::result::Result<T, AuthProxyError>;
