//! Auth proxy controller
//!
//! One [`AuthProxy`] per cluster connection. `run()` brings the proxy up and
//! resolves once its port accepts connections; `exit()` tears it down. The
//! startup attempt runs in its own task so that any number of `run()` callers
//! can wait on it, and so that dropping a caller never strands the process.
//!
//! Phases move `Idle → Starting → DiscoveringPort → ProbingReadiness → Ready`.
//! A readiness timeout goes through `Restarting` back to `Starting`; anything
//! the process does on its own (exit, crash, disconnect) and `exit()` lead to
//! `Stopped`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use kubeauth_process::ProcessManager;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AuthProxyConfig;
use crate::discovery::PortDiscovery;
use crate::error::{AuthProxyError, Result};
use crate::probe::{PortProbe, TcpReadinessProbe};
use crate::status::{ClusterContext, StatusReporter};
use crate::supervisor::{
    ProcessHandle, ProcessSpawner, ProcessSupervisor, ProxyEnvironment, SupervisedProcess,
    Teardown,
};
use crate::types::{ApiPrefix, ProxyCertificate};

pub const PORT_TIMEOUT_RESTARTING: &str =
    "Proxy port failed to be used within time limit, restarting...";
pub const PORT_TIMEOUT_GIVING_UP: &str =
    "Proxy port failed to be used within time limit, giving up";

/// How long to wait for an exit status after stdout closes early
const EXIT_SETTLE: Duration = Duration::from_millis(250);

/// Where a proxy instance is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPhase {
    Idle,
    Starting,
    DiscoveringPort,
    ProbingReadiness { port: u16 },
    Ready { port: u16 },
    Restarting { attempt: u32 },
    /// `None` when stopped through `exit()`
    Stopped(Option<AuthProxyError>),
}

impl ProxyPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProxyPhase::Ready { .. })
    }

    fn is_settled(&self) -> bool {
        matches!(self, ProxyPhase::Ready { .. } | ProxyPhase::Stopped(_))
    }
}

/// Why a startup attempt stopped driving
enum Halt {
    /// `exit()` or a newer `run()` took over
    Superseded,
    Failed(AuthProxyError),
}

#[derive(Default)]
struct Slot {
    /// Bumped by every `run()` that starts an attempt and by `exit()`
    generation: u64,
    driver: Option<CancellationToken>,
    process: Option<ProcessHandle>,
    port: Option<u16>,
    /// Processes still being reaped; a new spawn waits for all of them
    teardowns: Vec<Teardown>,
}

impl Slot {
    fn release_process(&mut self) -> Option<Teardown> {
        self.port = None;
        let process = self.process.take()?;
        let teardown = process.terminate();
        self.teardowns.retain(|t| !t.is_finished());
        self.teardowns.push(teardown.clone());
        Some(teardown)
    }
}

struct Inner {
    api_prefix: ApiPrefix,
    config: AuthProxyConfig,
    env: ProxyEnvironment,
    supervisor: ProcessSupervisor,
    probe: Arc<dyn PortProbe>,
    reporter: StatusReporter,
    slot: Mutex<Slot>,
    phase: watch::Sender<ProxyPhase>,
}

impl Inner {
    fn cluster_id(&self) -> &str {
        self.reporter.cluster().id()
    }

    /// Run `f` on the slot unless this attempt has been superseded
    fn update<R>(&self, generation: u64, f: impl FnOnce(&mut Slot) -> R) -> std::result::Result<R, Halt> {
        let mut slot = self.slot.lock();
        if slot.generation != generation || slot.driver.is_none() {
            return Err(Halt::Superseded);
        }
        Ok(f(&mut slot))
    }

    fn publish(&self, phase: ProxyPhase) {
        self.phase.send_replace(phase);
    }

    /// End the attempt for good after a failure
    fn finish(&self, generation: u64, err: AuthProxyError) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return;
        }
        slot.driver = None;
        if let Some(pid) = slot.process.as_ref().map(ProcessHandle::pid) {
            debug!(cluster = %self.cluster_id(), pid, "Stopping local proxy");
        }
        slot.release_process();
        self.publish(ProxyPhase::Stopped(Some(err)));
    }

    async fn drive(self: Arc<Self>, generation: u64, cancel: CancellationToken, pending: Vec<Teardown>) {
        let halt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Halt::Superseded,
            outcome = self.supervise(generation, pending) => match outcome {
                Ok(never) => match never {},
                Err(halt) => halt,
            },
        };

        match halt {
            Halt::Failed(err) => self.finish(generation, err),
            Halt::Superseded => debug!(cluster = %self.cluster_id(), generation, "Proxy attempt superseded"),
        }
    }

    async fn supervise(
        &self,
        generation: u64,
        mut pending: Vec<Teardown>,
    ) -> std::result::Result<Infallible, Halt> {
        let mut restarts: u32 = 0;

        loop {
            for teardown in pending.drain(..) {
                teardown.wait().await;
            }
            self.update(generation, |_| self.publish(ProxyPhase::Starting))?;

            let SupervisedProcess {
                handle,
                port: mut port_rx,
                mut events,
            } = self
                .supervisor
                .spawn(&self.config.proxy_bin_path, &self.config.args, &self.env)
                .await
                .map_err(Halt::Failed)?;

            self.update(generation, move |slot| {
                slot.process = Some(handle);
                self.publish(ProxyPhase::DiscoveringPort);
            })?;

            let discovered = tokio::select! {
                biased;
                Some(event) = events.recv() => return Err(Halt::Failed(event.into())),
                found = &mut port_rx => found.unwrap_or(Err(AuthProxyError::StreamClosed)),
            };

            let port = match discovered {
                Ok(port) => port,
                Err(AuthProxyError::StreamClosed) => {
                    // Prefer the exit status as the one status update, if it comes
                    if !matches!(timeout(EXIT_SETTLE, events.recv()).await, Ok(Some(_))) {
                        self.reporter.error(&AuthProxyError::StreamClosed.to_string());
                    }
                    return Err(Halt::Failed(AuthProxyError::StreamClosed));
                }
                Err(err) => return Err(Halt::Failed(err)),
            };

            info!(cluster = %self.cluster_id(), port, "Found auth proxy port");
            self.update(generation, |slot| {
                slot.port = Some(port);
                self.publish(ProxyPhase::ProbingReadiness { port });
            })?;

            let probe = self.config.probe;
            let probed = tokio::select! {
                biased;
                Some(event) = events.recv() => return Err(Halt::Failed(event.into())),
                probed = self.probe.wait_until_used(port, probe.interval(), probe.timeout()) => probed,
            };

            match probed {
                Ok(()) => {
                    self.update(generation, |_| self.publish(ProxyPhase::Ready { port }))?;
                    // Ready; stay around to see the process end
                    return match events.recv().await {
                        Some(event) => Err(Halt::Failed(event.into())),
                        None => Err(Halt::Superseded),
                    };
                }
                Err(err) => {
                    warn!(cluster = %self.cluster_id(), port, error = %err, "Proxy port readiness probe failed");

                    let policy = self.config.restart;
                    if !policy.allows(restarts) {
                        self.reporter.error(PORT_TIMEOUT_GIVING_UP);
                        return Err(Halt::Failed(AuthProxyError::RestartLimitExceeded {
                            restarts,
                        }));
                    }
                    self.reporter.error(PORT_TIMEOUT_RESTARTING);

                    restarts += 1;
                    let teardown = self.update(generation, |slot| {
                        debug!(cluster = %self.cluster_id(), "Stopping local proxy for restart");
                        let teardown = slot.release_process();
                        self.publish(ProxyPhase::Restarting { attempt: restarts });
                        teardown
                    })?;
                    pending.extend(teardown);

                    if !policy.backoff().is_zero() {
                        sleep(policy.backoff()).await;
                    }
                }
            }
        }
    }
}

/// Supervisor for one cluster connection's auth proxy
///
/// Dropping the proxy stops the process.
pub struct AuthProxy {
    inner: Arc<Inner>,
}

impl AuthProxy {
    pub fn builder(cluster: Arc<dyn ClusterContext>, certificate: ProxyCertificate) -> AuthProxyBuilder {
        AuthProxyBuilder::new(cluster, certificate)
    }

    pub fn new(
        cluster: Arc<dyn ClusterContext>,
        certificate: ProxyCertificate,
        config: AuthProxyConfig,
    ) -> Self {
        Self::builder(cluster, certificate).config(config).build()
    }

    /// Random path segment namespacing this proxy's endpoints; never changes
    pub fn api_prefix(&self) -> &ApiPrefix {
        &self.inner.api_prefix
    }

    /// Port the proxy announced
    ///
    /// Fails with [`AuthProxyError::PortNotInitialized`] until discovery has
    /// completed for the current process.
    pub fn port(&self) -> Result<u16> {
        self.inner
            .slot
            .lock()
            .port
            .ok_or(AuthProxyError::PortNotInitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.phase.borrow().is_ready()
    }

    pub fn phase(&self) -> ProxyPhase {
        self.inner.phase.borrow().clone()
    }

    /// Watch phase transitions
    pub fn subscribe(&self) -> watch::Receiver<ProxyPhase> {
        self.inner.phase.subscribe()
    }

    /// PID of the live proxy process, if any
    pub fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().process.as_ref().map(ProcessHandle::pid)
    }

    /// Bring the proxy up and wait until its port accepts connections
    ///
    /// Calls made while an attempt is in flight (or already ready) join it
    /// rather than spawning another process. Resolves with the error that
    /// ended the attempt, or [`AuthProxyError::Stopped`] if `exit()` was called.
    pub async fn run(&self) -> Result<()> {
        let mut phase = {
            let mut slot = self.inner.slot.lock();
            if slot.driver.is_none() {
                slot.generation += 1;
                slot.teardowns.retain(|t| !t.is_finished());

                let cancel = CancellationToken::new();
                slot.driver = Some(cancel.clone());
                self.inner.publish(ProxyPhase::Starting);

                debug!(cluster = %self.inner.cluster_id(), generation = slot.generation, "Starting auth proxy");
                tokio::spawn(self.inner.clone().drive(
                    slot.generation,
                    cancel,
                    slot.teardowns.clone(),
                ));
            }
            self.inner.phase.subscribe()
        };

        let settled = phase.wait_for(ProxyPhase::is_settled).await;
        match settled.as_deref() {
            Ok(ProxyPhase::Ready { .. }) => Ok(()),
            Ok(ProxyPhase::Stopped(Some(err))) => Err(err.clone()),
            _ => Err(AuthProxyError::Stopped),
        }
    }

    /// Stop the proxy; a no-op when nothing is running
    ///
    /// Any attempt in flight is cancelled and its `run()` callers resolve with
    /// [`AuthProxyError::Stopped`].
    pub fn exit(&self) {
        let mut slot = self.inner.slot.lock();
        let active = slot.driver.is_some() || slot.process.is_some();

        if let Some(cancel) = slot.driver.take() {
            cancel.cancel();
        }
        if let Some(pid) = slot.process.as_ref().map(ProcessHandle::pid) {
            debug!(cluster = %self.inner.cluster_id(), pid, "Stopping local proxy");
        }
        slot.release_process();

        if active {
            slot.generation += 1;
            self.inner.publish(ProxyPhase::Stopped(None));
        }
    }

    /// `exit()`, then wait until every proxy process has been reaped
    pub async fn shutdown(&self) {
        self.exit();
        let pending = self.inner.slot.lock().teardowns.clone();
        for teardown in &pending {
            teardown.wait().await;
        }
    }
}

impl Drop for AuthProxy {
    fn drop(&mut self) {
        self.exit();
    }
}

impl std::fmt::Debug for AuthProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthProxy")
            .field("cluster", &self.inner.cluster_id())
            .field("api_prefix", &self.inner.api_prefix)
            .field("phase", &*self.inner.phase.borrow())
            .finish()
    }
}

/// Builds an [`AuthProxy`], with every collaborator replaceable
pub struct AuthProxyBuilder {
    cluster: Arc<dyn ClusterContext>,
    certificate: ProxyCertificate,
    config: AuthProxyConfig,
    env: BTreeMap<String, String>,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    probe: Option<Arc<dyn PortProbe>>,
    discovery: Option<PortDiscovery>,
    api_prefix: Option<ApiPrefix>,
}

impl AuthProxyBuilder {
    fn new(cluster: Arc<dyn ClusterContext>, certificate: ProxyCertificate) -> Self {
        Self {
            cluster,
            certificate,
            config: AuthProxyConfig::default(),
            env: BTreeMap::new(),
            spawner: None,
            probe: None,
            discovery: None,
            api_prefix: None,
        }
    }

    pub fn config(mut self, config: AuthProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Extra environment for the proxy process
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn discovery(mut self, discovery: PortDiscovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Draw the api prefix from `rng` instead of the OS
    pub fn rng<R: RngCore + ?Sized>(mut self, rng: &mut R) -> Self {
        self.api_prefix = Some(ApiPrefix::generate(rng));
        self
    }

    pub fn build(self) -> AuthProxy {
        let api_prefix = self
            .api_prefix
            .unwrap_or_else(|| ApiPrefix::generate(&mut OsRng));
        let reporter = StatusReporter::new(self.cluster.clone());

        let env = ProxyEnvironment {
            base: self.env,
            kube_config_path: self.cluster.kube_config_path().to_path_buf(),
            context_name: self.cluster.context_name().to_string(),
            api_prefix: api_prefix.clone(),
            certificate: self.certificate,
        };
        let supervisor = ProcessSupervisor::new(
            self.spawner
                .unwrap_or_else(|| Arc::new(ProcessManager::new())),
            self.discovery.unwrap_or_default(),
            reporter.clone(),
            self.config.stop_grace(),
        );
        let (phase, _) = watch::channel(ProxyPhase::Idle);

        AuthProxy {
            inner: Arc::new(Inner {
                api_prefix,
                config: self.config,
                env,
                supervisor,
                probe: self
                    .probe
                    .unwrap_or_else(|| Arc::new(TcpReadinessProbe::default())),
                reporter,
                slot: Mutex::new(Slot::default()),
                phase,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StaticCluster;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn proxy() -> AuthProxy {
        let (cluster, _rx) = StaticCluster::new("/tmp/kubeconfig", "dev");
        AuthProxy::builder(Arc::new(cluster), ProxyCertificate::new("CERT", "KEY"))
            .rng(&mut StdRng::seed_from_u64(42))
            .build()
    }

    #[test]
    fn test_api_prefix_available_at_construction() {
        let proxy = proxy();
        assert_eq!(proxy.api_prefix().as_str().len(), 16);
        assert_eq!(proxy.api_prefix(), &ApiPrefix::generate(&mut StdRng::seed_from_u64(42)));
    }

    #[test]
    fn test_port_before_discovery_fails() {
        let proxy = proxy();
        assert_eq!(proxy.port(), Err(AuthProxyError::PortNotInitialized));
    }

    #[test]
    fn test_exit_when_idle_is_noop() {
        let proxy = proxy();
        proxy.exit();
        proxy.exit();
        assert!(!proxy.is_ready());
        assert_eq!(proxy.phase(), ProxyPhase::Idle);
        assert_eq!(proxy.pid(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restarts_do_not_accumulate_teardowns() {
        use std::sync::atomic::{AtomicU32, Ordering};

        /// Times out `failures` times, then reports the port as used
        struct ReadyAfter {
            failures: u32,
            calls: AtomicU32,
        }

        #[async_trait::async_trait]
        impl PortProbe for ReadyAfter {
            async fn wait_until_used(&self, port: u16, _interval: Duration, limit: Duration) -> Result<()> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                    return Err(AuthProxyError::ProbeTimeout {
                        port,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
                Ok(())
            }
        }

        let probe = Arc::new(ReadyAfter {
            failures: 20,
            calls: AtomicU32::new(0),
        });
        let mut config = AuthProxyConfig::default();
        config.proxy_bin_path = "sh".into();
        config.args = vec![
            "-c".to_string(),
            "echo 'starting to serve on 127.0.0.1:1'; exec sleep 30".to_string(),
        ];
        config.stop_grace_ms = 1_000;

        let (cluster, _rx) = StaticCluster::new("/tmp/kubeconfig", "dev");
        let proxy = AuthProxy::builder(Arc::new(cluster), ProxyCertificate::new("CERT", "KEY"))
            .config(config)
            .probe(probe.clone())
            .build();

        timeout(Duration::from_secs(30), proxy.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(probe.calls.load(Ordering::SeqCst), 21);
        assert!(proxy.inner.slot.lock().teardowns.len() <= 1);

        proxy.shutdown().await;
        assert!(proxy.inner.slot.lock().teardowns.iter().all(Teardown::is_finished));
    }

    #[test]
    fn test_settled_phases() {
        assert!(ProxyPhase::Ready { port: 1 }.is_settled());
        assert!(ProxyPhase::Stopped(None).is_settled());
        assert!(!ProxyPhase::Restarting { attempt: 1 }.is_settled());
        assert!(!ProxyPhase::ProbingReadiness { port: 1 }.is_ready());
    }
}
