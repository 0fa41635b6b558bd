//! Managed child process wrapper

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Wrapper around tokio::process::Child with lifecycle management
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    config: ProcessConfig,
    pid: u32,
}

impl ManagedChild {
    pub(crate) fn new(child: Child, config: ProcessConfig) -> Self {
        let pid = child.id().unwrap_or(0);
        Self { child, config, pid }
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(Into::into)
    }

    /// Ask the process to stop, escalating to SIGKILL after `grace`
    ///
    /// On unix the first signal is SIGTERM. When the child leads its own
    /// process group both signals go to the whole group, so descendants are
    /// stopped too. Elsewhere the process is killed outright. Returns once the
    /// process has been reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        debug!(pid = %self.pid, group = self.config.new_process_group, "Terminating process");

        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;

            match self.signal(Signal::SIGTERM) {
                Err(e) => warn!(pid = %self.pid, error = %e, "Failed to send SIGTERM"),
                Ok(()) => match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(waited) => {
                        waited.map_err(|e| ProcessError::KillFailed(e.to_string()))?;
                        debug!(pid = %self.pid, "Process exited after SIGTERM");
                        // Group members that outlived the leader
                        self.kill_group();
                        return Ok(());
                    }
                    Err(_) => {
                        warn!(pid = %self.pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
                    }
                },
            }
            self.kill_group();
        }

        #[cfg(not(unix))]
        let _ = grace;

        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Reaped between the checks above and the kill
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(ProcessError::KillFailed(e.to_string())),
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> nix::Result<()> {
        use nix::sys::signal::{kill, killpg};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.pid as i32);
        if self.config.new_process_group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        }
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        if !self.config.new_process_group {
            return;
        }
        if let Err(e) = self.signal(nix::sys::signal::Signal::SIGKILL) {
            debug!(pid = %self.pid, error = %e, "Process group already gone");
        }
    }

    /// Take stdout handle
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take stderr handle
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}
