//! # kubeauth-process
//!
//! **Purpose**: Child process lifecycle primitives for the kube auth proxy supervisor
//!
//! Provides async process spawning with environment injection, stdio capture,
//! graceful SIGTERM→SIGKILL termination, optionally across a process group.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kubeauth_process::{ProcessManager, ProcessConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProcessManager::new();
//!
//! let config = ProcessConfig::new("lens-k8s-proxy")
//!     .env("KUBECONFIG", "/home/me/.kube/config")
//!     .env("KUBECONFIG_CONTEXT", "minikube");
//!
//! let mut child = manager.spawn(config).await?;
//! let stdout = child.take_stdout();
//!
//! child.terminate(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod manager;

pub use child::ManagedChild;
pub use config::ProcessConfig;
pub use error::{ProcessError, Result};
pub use manager::ProcessManager;
