//! Connection status reporting

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{StatusEvent, StatusLevel};

/// The cluster connection that owns a proxy instance
pub trait ClusterContext: Send + Sync {
    /// Identifier used in log fields
    fn id(&self) -> &str;

    /// Kubeconfig file the proxy authenticates with
    fn kube_config_path(&self) -> &Path;

    /// Context inside the kubeconfig
    fn context_name(&self) -> &str;

    /// Publish a connection status update to the user
    fn broadcast(&self, message: &str, level: StatusLevel);
}

/// A cluster with fixed coordinates whose status updates go to a channel
#[derive(Debug, Clone)]
pub struct StaticCluster {
    id: String,
    kube_config_path: PathBuf,
    context_name: String,
    updates: mpsc::UnboundedSender<StatusEvent>,
}

impl StaticCluster {
    /// Create the cluster and the receiving end of its status channel
    pub fn new(
        kube_config_path: impl Into<PathBuf>,
        context_name: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let context_name = context_name.into();
        let cluster = Self {
            id: context_name.clone(),
            kube_config_path: kube_config_path.into(),
            context_name,
            updates,
        };
        (cluster, rx)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl ClusterContext for StaticCluster {
    fn id(&self) -> &str {
        &self.id
    }

    fn kube_config_path(&self) -> &Path {
        &self.kube_config_path
    }

    fn context_name(&self) -> &str {
        &self.context_name
    }

    fn broadcast(&self, message: &str, level: StatusLevel) {
        // Receiver gone means nobody is listening any more
        let _ = self.updates.send(StatusEvent {
            message: message.to_string(),
            level,
        });
    }
}

/// Forwards status updates to the owning cluster
#[derive(Clone)]
pub struct StatusReporter {
    cluster: Arc<dyn ClusterContext>,
}

impl StatusReporter {
    pub fn new(cluster: Arc<dyn ClusterContext>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterContext> {
        &self.cluster
    }

    pub fn broadcast(&self, message: &str, level: StatusLevel) {
        debug!(cluster = %self.cluster.id(), %level, status = message, "Broadcasting proxy status");
        self.cluster.broadcast(message, level);
    }

    pub fn info(&self, message: &str) {
        self.broadcast(message, StatusLevel::Info);
    }

    pub fn error(&self, message: &str) {
        self.broadcast(message, StatusLevel::Error);
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("cluster", &self.cluster.id())
            .finish()
    }
}
