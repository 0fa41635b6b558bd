//! Process manager - spawning

use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::ManagedChild,
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Spawns managed processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self
    }

    /// Spawn a managed process
    ///
    /// The child inherits the parent environment with `config.env` layered on
    /// top. Stdin is null; stdout and stderr are always piped.
    /// The child is killed if the returned handle is dropped.
    ///
    /// # Examples
    /// ```no_run
    /// use kubeauth_process::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("echo").args(["hello"]);
    /// let child = manager.spawn(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        debug!(
            command = %config.command,
            args = ?config.args,
            "Spawning process"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        if config.new_process_group {
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        let pid = child.id().ok_or(ProcessError::MissingPid)?;

        info!(pid = %pid, command = %config.command, "Process spawned");

        Ok(ManagedChild::new(child, config))
    }
}
