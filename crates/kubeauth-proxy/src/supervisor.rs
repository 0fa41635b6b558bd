//! Proxy process supervision
//!
//! Spawns the proxy binary with its connection environment and wires its
//! output and lifecycle to status updates. Three tasks run per process:
//!
//! - **stdout**: feeds [`PortDiscovery`]; after the port is known every line
//!   is broadcast at info level
//! - **stderr**: every line except TLS handshake noise is broadcast at error level
//! - **watcher**: owns the child, reports how it ended, or terminates it when
//!   the handle is torn down
//!
//! Tearing down a [`ProcessHandle`] detaches all three first, so nothing is
//! broadcast for a process the controller already let go of.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kubeauth_process::{ManagedChild, ProcessConfig, ProcessManager};
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::{OutputLines, PortDiscovery};
use crate::error::{AuthProxyError, Result};
use crate::status::StatusReporter;
use crate::types::{ApiPrefix, ProxyCertificate, StatusLevel};

pub const ENV_KUBECONFIG: &str = "KUBECONFIG";
pub const ENV_KUBECONFIG_CONTEXT: &str = "KUBECONFIG_CONTEXT";
pub const ENV_API_PREFIX: &str = "API_PREFIX";
pub const ENV_PROXY_KEY: &str = "PROXY_KEY";
pub const ENV_PROXY_CERT: &str = "PROXY_CERT";

/// Benign stderr noise from clients probing the proxy without TLS
pub const TLS_HANDSHAKE_NOISE: &str = "http: TLS handshake error";

pub const PROXY_STARTED: &str = "Authentication proxy started";
pub const PROXY_DISCONNECTED: &str = "Proxy disconnected communications";

/// Starts OS processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, config: ProcessConfig) -> kubeauth_process::Result<ManagedChild>;
}

#[async_trait]
impl ProcessSpawner for ProcessManager {
    async fn spawn(&self, config: ProcessConfig) -> kubeauth_process::Result<ManagedChild> {
        ProcessManager::spawn(self, config).await
    }
}

/// Environment handed to the proxy binary
#[derive(Debug, Clone)]
pub struct ProxyEnvironment {
    /// Caller-supplied entries; the connection variables below win on conflict
    pub base: BTreeMap<String, String>,
    pub kube_config_path: PathBuf,
    pub context_name: String,
    pub api_prefix: ApiPrefix,
    pub certificate: ProxyCertificate,
}

impl ProxyEnvironment {
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.base.clone();
        vars.insert(
            ENV_KUBECONFIG.to_string(),
            self.kube_config_path.to_string_lossy().into_owned(),
        );
        vars.insert(ENV_KUBECONFIG_CONTEXT.to_string(), self.context_name.clone());
        vars.insert(ENV_API_PREFIX.to_string(), self.api_prefix.path());
        vars.insert(ENV_PROXY_KEY.to_string(), self.certificate.private_key.clone());
        vars.insert(ENV_PROXY_CERT.to_string(), self.certificate.cert.clone());
        vars
    }
}

/// How a supervised process ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited { code: Option<i32> },
    Failed(String),
    Disconnected(String),
}

impl From<ProcessEvent> for AuthProxyError {
    fn from(event: ProcessEvent) -> Self {
        match event {
            ProcessEvent::Exited { code } => AuthProxyError::Exited { code },
            ProcessEvent::Failed(msg) => AuthProxyError::ProcessFailed(msg),
            ProcessEvent::Disconnected(msg) => AuthProxyError::Disconnected(msg),
        }
    }
}

/// A freshly spawned proxy
///
/// The handle goes to whoever owns the process slot; the two receivers go to
/// whoever drives the startup attempt.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub handle: ProcessHandle,
    /// Resolves with the discovered port, or why discovery failed
    pub port: oneshot::Receiver<Result<u16>>,
    /// Lifecycle events, already broadcast by the time they arrive
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Owning handle to a live proxy process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    detach: CancellationToken,
    reaped: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Detach all listeners and signal the process to stop
    ///
    /// Returns immediately; await the [`Teardown`] to know the process is gone.
    pub fn terminate(mut self) -> Teardown {
        self.detach_all();
        Teardown(Some(self.reaped.clone()))
    }

    fn detach_all(&mut self) {
        self.detach.cancel();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.detach_all();
    }
}

/// Completion of a process teardown, shareable between waiters
#[derive(Debug, Clone, Default)]
pub struct Teardown(Option<CancellationToken>);

impl Teardown {
    /// Wait until the process has been reaped
    pub async fn wait(&self) {
        if let Some(reaped) = &self.0 {
            reaped.cancelled().await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.0.as_ref().map_or(true, CancellationToken::is_cancelled)
    }
}

/// Status reporting that goes quiet once the process is detached
#[derive(Clone)]
struct Listener {
    reporter: StatusReporter,
    detach: CancellationToken,
}

impl Listener {
    /// A pump racing a detach on another worker may still get one line out
    fn broadcast(&self, message: &str, level: StatusLevel) {
        if !self.detach.is_cancelled() {
            self.reporter.broadcast(message, level);
        }
    }
}

/// Spawns proxy processes and wires their output to status updates
#[derive(Clone)]
pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    discovery: PortDiscovery,
    reporter: StatusReporter,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        discovery: PortDiscovery,
        reporter: StatusReporter,
        stop_grace: Duration,
    ) -> Self {
        Self {
            spawner,
            discovery,
            reporter,
            stop_grace,
        }
    }

    /// Start `binary` and begin supervising it
    ///
    /// A spawn failure is broadcast at error level before it is returned.
    pub async fn spawn(
        &self,
        binary: &Path,
        args: &[String],
        env: &ProxyEnvironment,
    ) -> Result<SupervisedProcess> {
        // Own group, so credential helpers the proxy forks are stopped with it
        let config = ProcessConfig::new(binary.to_string_lossy())
            .args(args.iter().cloned())
            .envs(env.vars())
            .new_process_group(true);

        let mut child = match self.spawner.spawn(config).await {
            Ok(child) => child,
            Err(e) => {
                let err = AuthProxyError::from(e);
                self.reporter.error(&err.to_string());
                return Err(err);
            }
        };

        let pid = child.pid();
        let (stdout, stderr) = match (child.take_stdout(), child.take_stderr()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let err = AuthProxyError::Spawn("proxy stdio was not captured".to_string());
                self.reporter.error(&err.to_string());
                return Err(err);
            }
        };

        let detach = CancellationToken::new();
        let reaped = CancellationToken::new();
        let listener = Listener {
            reporter: self.reporter.clone(),
            detach: detach.clone(),
        };
        let (port_tx, port_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pumps = vec![
            tokio::spawn(pump_stdout(
                stdout,
                self.discovery.clone(),
                listener.clone(),
                port_tx,
                events_tx.clone(),
            )),
            tokio::spawn(pump_stderr(stderr, listener.clone())),
        ];
        tokio::spawn(watch_lifecycle(
            child,
            self.stop_grace,
            listener,
            events_tx,
            reaped.clone(),
        ));

        debug!(pid, binary = %binary.display(), "Supervising proxy process");

        Ok(SupervisedProcess {
            handle: ProcessHandle {
                pid,
                detach,
                reaped,
                pumps,
            },
            port: port_rx,
            events: events_rx,
        })
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("discovery", &self.discovery)
            .field("reporter", &self.reporter)
            .field("stop_grace", &self.stop_grace)
            .finish()
    }
}

async fn pump_stdout<R>(
    reader: R,
    discovery: PortDiscovery,
    listener: Listener,
    port_tx: oneshot::Sender<Result<u16>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = OutputLines::new(BufReader::new(reader));

    let found = discovery
        .discover(&mut lines, |_| listener.broadcast(PROXY_STARTED, StatusLevel::Info))
        .await;
    let failure = found.as_ref().err().cloned();
    let _ = port_tx.send(found);

    match failure {
        Some(AuthProxyError::Disconnected(_)) => {
            listener.broadcast(PROXY_DISCONNECTED, StatusLevel::Error);
            return;
        }
        Some(_) => return,
        None => {}
    }

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => listener.broadcast(&line, StatusLevel::Info),
            Ok(None) => break,
            Err(e) => {
                listener.broadcast(PROXY_DISCONNECTED, StatusLevel::Error);
                let _ = events.send(ProcessEvent::Disconnected(e.to_string()));
                break;
            }
        }
    }
}

async fn pump_stderr<R>(reader: R, listener: Listener)
where
    R: AsyncRead + Unpin,
{
    let mut lines = OutputLines::new(BufReader::new(reader));

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() || line.contains(TLS_HANDSHAKE_NOISE) {
                    continue;
                }
                listener.broadcast(&line, StatusLevel::Error);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Proxy stderr closed with an error");
                break;
            }
        }
    }
}

async fn watch_lifecycle(
    mut child: ManagedChild,
    stop_grace: Duration,
    listener: Listener,
    events: mpsc::UnboundedSender<ProcessEvent>,
    reaped: CancellationToken,
) {
    // Fires however this task ends, abort included
    let _reaped = reaped.drop_guard();
    let pid = child.pid();
    let outcome = tokio::select! {
        biased;
        _ = listener.detach.cancelled() => None,
        status = child.wait() => Some(status),
    };

    let Some(status) = outcome else {
        if let Err(e) = child.terminate(stop_grace).await {
            warn!(pid, error = %e, "Failed to stop proxy process");
        }
        return;
    };

    let event = match status {
        Ok(status) => {
            let code = status.code();
            let level = if code == Some(0) {
                StatusLevel::Info
            } else {
                StatusLevel::Error
            };
            listener.broadcast(&AuthProxyError::Exited { code }.to_string(), level);
            ProcessEvent::Exited { code }
        }
        Err(e) => {
            listener.broadcast(&e.to_string(), StatusLevel::Error);
            ProcessEvent::Failed(e.to_string())
        }
    };
    debug!(pid, ?event, "Proxy process ended");
    let _ = events.send(event);
}
