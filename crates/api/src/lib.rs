//! Tether public API facade (in-process).
//!
//! `Tether` is the application root: it owns the cluster registry, the per-operation
//! interceptor chains and the dispatcher, and is passed to frontends (CLI, services)
//! explicitly. There is no process-wide state.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use tether_core::{
    ClientTunables, ClusterConfig, ClusterId, ClusterRecord, ClusterSource, ClusterStatus, HealthTunables, ListOptions,
    OperationType, PatchKind, ResolvedKind, TetherError, TetherResult,
};
pub use tether_dispatch::{Output, ResourceRequest, ResourceStatement};
pub use tether_kubehub::{Connector, KubeConnector};
pub use tether_pipeline::{interceptor_fn, Interceptor, RegisterOptions, WILDCARD};
pub use tether_registry::{ClusterEvent, ClusterRegistry, ClusterStatusReport, WorkerKind};

use tether_dispatch::{Dispatcher, Interceptors};
use tether_kubehub::kubeconfig;

pub struct Tether {
    registry: ClusterRegistry,
    dispatcher: Dispatcher,
}

impl Tether {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let registry = ClusterRegistry::new(connector);
        let dispatcher = Dispatcher::new(Arc::new(registry.clone()), Arc::new(Interceptors::new()));
        Self { registry, dispatcher }
    }

    /// Root object backed by real kube-rs clients.
    pub fn with_kube() -> Self {
        Self::new(Arc::new(KubeConnector::new()))
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    // ----------------- clusters -----------------

    pub fn register_cluster(&self, config: ClusterConfig) -> TetherResult<ClusterId> {
        self.registry.register(config)
    }

    /// Register every context of a kubeconfig document under `file_label`, with health tunables
    /// from the environment. Contexts that are already registered are skipped.
    pub fn register_kubeconfig(&self, file_label: &str, content: &str) -> TetherResult<Vec<ClusterId>> {
        let health = HealthTunables::from_env();
        let mut ids = Vec::new();
        for cfg in kubeconfig::configs_for_all_contexts(file_label, content)? {
            match self.registry.register(cfg.with_health(health.clone())) {
                Ok(id) => ids.push(id),
                Err(TetherError::AlreadyRegistered(id)) => info!(cluster = %id, "api: context already registered"),
                Err(e) => return Err(e),
            }
        }
        info!(file = %file_label, count = ids.len(), "api: kubeconfig registered");
        Ok(ids)
    }

    /// Register a row handed over by a persistence collaborator.
    pub fn register_record(&self, record: ClusterRecord) -> TetherResult<ClusterId> {
        self.registry.register(ClusterConfig::try_from(record)?)
    }

    pub async fn remove_cluster(&self, id: &ClusterId) -> TetherResult<()> {
        self.registry.remove(id).await
    }

    pub async fn connect(&self, id: &ClusterId) -> TetherResult<()> {
        let t0 = Instant::now();
        let res = self.registry.connect(id).await;
        match &res {
            Ok(()) => info!(cluster = %id, took_ms = %t0.elapsed().as_millis(), "api: connect ok"),
            Err(e) => warn!(cluster = %id, took_ms = %t0.elapsed().as_millis(), error = %e, "api: connect failed"),
        }
        res
    }

    /// Connect every registered cluster concurrently. Failures are reported per cluster.
    pub async fn connect_all(&self) -> Vec<(ClusterId, TetherResult<()>)> {
        let ids: Vec<ClusterId> = self.registry.list_clusters().into_iter().map(|s| s.id).collect();
        let results = join_all(ids.iter().map(|id| self.registry.connect(id))).await;
        ids.into_iter().zip(results).collect()
    }

    pub async fn disconnect(&self, id: &ClusterId) -> TetherResult<()> {
        self.registry.disconnect(id).await
    }

    pub fn is_connected(&self, id: &ClusterId) -> bool {
        self.registry.is_connected(id)
    }

    pub fn cluster_status(&self, id: &ClusterId) -> TetherResult<ClusterStatusReport> {
        self.registry.cluster_status(id)
    }

    pub fn list_clusters(&self) -> Vec<ClusterStatusReport> {
        self.registry.list_clusters()
    }

    pub fn update_cluster_tunables(&self, id: &ClusterId, tunables: ClientTunables) -> TetherResult<()> {
        self.registry.update_cluster_tunables(id, tunables)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.registry.subscribe()
    }

    /// Rerun API discovery on a connected cluster.
    pub async fn rediscover(&self, id: &ClusterId) -> TetherResult<usize> {
        use tether_kubehub::ConnectionSource;
        self.registry.connection(id)?.resolver.rediscover().await
    }

    // ----------------- interceptors -----------------

    pub fn register_interceptor(
        &self,
        op: OperationType,
        name: &str,
        handler: Arc<dyn Interceptor<ResourceStatement>>,
        opts: RegisterOptions,
    ) -> TetherResult<()> {
        self.dispatcher.interceptors().register(op, name, Some(handler), opts)
    }

    pub fn remove_interceptor(&self, op: OperationType, name: &str) -> TetherResult<()> {
        self.dispatcher.interceptors().register(op, name, None, RegisterOptions::default().remove())
    }

    /// Compiled order for one operation category.
    pub fn interceptor_order(&self, op: OperationType) -> Vec<String> {
        self.dispatcher.interceptors().names(op)
    }

    // ----------------- resources -----------------

    pub async fn resolve(&self, id: &ClusterId, kind: &str, group: Option<&str>) -> TetherResult<ResolvedKind> {
        self.dispatcher.resolve(id, kind, group).await
    }

    pub async fn execute(&self, req: ResourceRequest) -> TetherResult<Output> {
        self.dispatcher.execute(req).await
    }

    pub async fn execute_with_cancel(&self, req: ResourceRequest, token: CancellationToken) -> TetherResult<Output> {
        self.dispatcher.execute_with_cancel(req, token).await
    }

    /// Create-or-update one object document.
    pub async fn apply_document(&self, id: &ClusterId, doc: Value) -> TetherResult<Output> {
        self.dispatcher.apply_document(id, doc).await
    }

    /// Create-or-update every document in a (multi-document) YAML stream, in order.
    pub async fn apply_yaml(&self, id: &ClusterId, yaml: &str) -> TetherResult<Vec<Output>> {
        let mut out = Vec::new();
        for de in serde_yaml::Deserializer::from_str(yaml) {
            let doc: Value = serde::Deserialize::deserialize(de).map_err(|e| TetherError::InvalidRequest(format!("yaml: {}", e)))?;
            if doc.is_null() {
                continue;
            }
            out.push(self.apply_document(id, doc).await?);
        }
        Ok(out)
    }

    /// Stop every background worker. Terminal: later connects fail with `TetherError::ShutDown`.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        info!("api: shutdown");
    }
}
