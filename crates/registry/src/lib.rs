//! Tether registry: owns every registered cluster, its connectivity state machine and the
//! per-cluster heartbeat / reconnect workers.
//!
//! Status moves only along the edges `ClusterStatus::can_transition_to` allows. Each cluster
//! has at most one worker of each `WorkerKind`; starting one supersedes the previous one and
//! stopping is idempotent. Workers hold a `Weak` reference to the registry and exit once it
//! is dropped.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::histogram;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{
    ClientTunables, ClusterConfig, ClusterId, ClusterStatus, HealthTunables, HeartbeatRecord, TetherError, TetherResult,
};
use tether_kubehub::{ClusterBackend, Connection, ConnectionSource, Connector};

mod workers;

pub use workers::{Backoff, WorkerKind};
use workers::WorkerHandle;

const EVENT_CAPACITY: usize = 256;

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Connectivity notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClusterEvent {
    StatusChanged { id: ClusterId, from: ClusterStatus, to: ClusterStatus },
    HeartbeatFailed { id: ClusterId, consecutive: u32 },
    ReconnectStarted { id: ClusterId },
    ReconnectSucceeded { id: ClusterId, attempt: u32 },
    ReconnectExhausted { id: ClusterId, attempts: u32 },
}

impl ClusterEvent {
    pub fn cluster(&self) -> &ClusterId {
        match self {
            ClusterEvent::StatusChanged { id, .. }
            | ClusterEvent::HeartbeatFailed { id, .. }
            | ClusterEvent::ReconnectStarted { id }
            | ClusterEvent::ReconnectSucceeded { id, .. }
            | ClusterEvent::ReconnectExhausted { id, .. } => id,
        }
    }
}

/// Point-in-time view of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatusReport {
    pub id: ClusterId,
    pub status: ClusterStatus,
    pub endpoint: Option<String>,
    pub server_version: Option<String>,
    pub last_error: Option<String>,
    pub heartbeat_history: Vec<HeartbeatRecord>,
    pub consecutive_failures: u32,
    pub heartbeat_active: bool,
    pub reconnect_active: bool,
}

struct ClusterState {
    status: ClusterStatus,
    server_version: Option<String>,
    last_error: Option<String>,
    history: VecDeque<HeartbeatRecord>,
    consecutive_failures: u32,
}

pub(crate) struct ClusterEntry {
    id: ClusterId,
    endpoint: Option<String>,
    config: RwLock<ClusterConfig>,
    state: RwLock<ClusterState>,
    connection: RwLock<Option<Connection>>,
    /// Serializes connect and teardown for this cluster.
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClusterEntry {
    fn status(&self) -> ClusterStatus {
        read(&self.state).status
    }

    pub(crate) fn health(&self) -> HealthTunables {
        read(&self.config).health.clone()
    }

    pub(crate) fn client_timeout(&self) -> Duration {
        read(&self.config).client.timeout()
    }

    pub(crate) fn backend(&self) -> Option<Arc<dyn ClusterBackend>> {
        read(&self.connection).as_ref().map(|c| Arc::clone(&c.backend))
    }

    pub(crate) fn drop_connection(&self) {
        write(&self.connection).take();
    }

    /// Append to the bounded history and return the consecutive failure count.
    pub(crate) fn record_probe(&self, success: bool, capacity: usize, error: Option<String>) -> u32 {
        let mut st = write(&self.state);
        st.history.push_back(HeartbeatRecord { at: Utc::now(), success });
        while st.history.len() > capacity {
            st.history.pop_front();
        }
        if success {
            st.consecutive_failures = 0;
        } else {
            st.consecutive_failures += 1;
            st.last_error = error;
        }
        st.consecutive_failures
    }

    pub(crate) fn set_server_version(&self, version: String) {
        write(&self.state).server_version = Some(version);
    }

    pub(crate) fn set_last_error(&self, message: String) {
        write(&self.state).last_error = Some(message);
    }
}

pub(crate) struct Inner {
    connector: Arc<dyn Connector>,
    clusters: RwLock<HashMap<ClusterId, Arc<ClusterEntry>>>,
    workers: Mutex<HashMap<(ClusterId, WorkerKind), WorkerHandle>>,
    generation: AtomicU64,
    events: broadcast::Sender<ClusterEvent>,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    pub(crate) fn workers(&self) -> MutexGuard<'_, HashMap<(ClusterId, WorkerKind), WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn entry(&self, id: &ClusterId) -> TetherResult<Arc<ClusterEntry>> {
        read(&self.clusters).get(id).cloned().ok_or_else(|| TetherError::UnknownCluster(id.clone()))
    }

    pub(crate) fn emit(&self, ev: ClusterEvent) {
        // no subscribers is fine
        let _ = self.events.send(ev);
    }

    pub(crate) fn is_connected(&self, id: &ClusterId) -> bool {
        self.entry(id).map(|e| e.status() == ClusterStatus::Connected).unwrap_or(false)
    }

    /// Move along a state-machine edge. Self-transitions are no-ops; illegal edges are refused.
    pub(crate) fn transition(&self, entry: &ClusterEntry, to: ClusterStatus) -> bool {
        let from = {
            let mut st = write(&entry.state);
            let from = st.status;
            if from == to {
                return false;
            }
            if !from.can_transition_to(to) {
                warn!(cluster = %entry.id, from = %from, to = %to, "refusing illegal status transition");
                return false;
            }
            st.status = to;
            from
        };
        debug!(cluster = %entry.id, from = %from, to = %to, "status changed");
        self.emit(ClusterEvent::StatusChanged { id: entry.id.clone(), from, to });
        true
    }

    /// `cancel` belongs to the worker driving this connect, if any. It is checked once the
    /// connect lock is held so a teardown that cancelled the worker wins over the attempt.
    pub(crate) async fn connect(self: &Arc<Self>, id: &ClusterId, cancel: Option<&CancellationToken>) -> TetherResult<()> {
        let entry = self.entry(id)?;
        let _guard = entry.connect_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(TetherError::ShutDown);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(TetherError::Cancelled);
        }
        if entry.status() == ClusterStatus::Connected {
            return Ok(());
        }
        self.transition(&entry, ClusterStatus::Connecting);

        let config = read(&entry.config).clone();
        let limit = config.client.timeout();
        let t0 = Instant::now();
        let attempt = async {
            let backend = self.connector.connect(&config).await?;
            let version = backend.server_version().await?;
            Ok::<_, TetherError>((backend, version))
        };
        let result = tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
            Err(TetherError::Connection { cluster: id.clone(), message: format!("timed out after {}s", limit.as_secs()) })
        });

        match result {
            Ok((backend, version)) => {
                histogram!("connect_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "cluster" => id.to_string());
                *write(&entry.connection) = Some(Connection::new(backend));
                {
                    let mut st = write(&entry.state);
                    st.server_version = Some(version.clone());
                    st.last_error = None;
                    st.consecutive_failures = 0;
                }
                entry.record_probe(true, config.health.history_capacity, None);
                self.transition(&entry, ClusterStatus::Connected);
                workers::spawn_heartbeat(self, id);
                info!(cluster = %id, version = %version, took_ms = %t0.elapsed().as_millis(), "connected");
                Ok(())
            }
            Err(e) => {
                entry.set_last_error(e.to_string());
                self.transition(&entry, ClusterStatus::Failed);
                warn!(cluster = %id, error = %e, "connect failed");
                Err(match e {
                    TetherError::Connection { .. } => e,
                    other => TetherError::Connection { cluster: id.clone(), message: other.to_string() },
                })
            }
        }
    }

    /// Stop workers (all but `keep`), drop the connection and settle on Disconnected.
    ///
    /// Workers are stopped while the connect lock is held, so a connect that was in flight has
    /// already installed its heartbeat and that heartbeat is stopped too.
    pub(crate) async fn teardown(&self, id: &ClusterId, keep: Option<WorkerKind>) {
        let entry = self.entry(id).ok();
        let _guard = match &entry {
            Some(e) => Some(e.connect_lock.lock().await),
            None => None,
        };
        for kind in WorkerKind::ALL {
            if Some(kind) != keep {
                self.stop_worker(id, kind);
            }
        }
        if let Some(entry) = &entry {
            entry.drop_connection();
            self.transition(entry, ClusterStatus::Disconnected);
        }
    }
}

/// The application's cluster registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<Inner>,
}

impl ClusterRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                clusters: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Add a cluster in the Disconnected state.
    pub fn register(&self, mut config: ClusterConfig) -> TetherResult<ClusterId> {
        config.client.validate()?;
        config.health = config.health.sanitized();
        let endpoint = self.inner.connector.endpoint(&config)?;
        let id = config.id.clone();
        let mut clusters = write(&self.inner.clusters);
        if clusters.contains_key(&id) {
            return Err(TetherError::AlreadyRegistered(id));
        }
        clusters.insert(
            id.clone(),
            Arc::new(ClusterEntry {
                id: id.clone(),
                endpoint: endpoint.clone(),
                config: RwLock::new(config),
                state: RwLock::new(ClusterState {
                    status: ClusterStatus::Disconnected,
                    server_version: None,
                    last_error: None,
                    history: VecDeque::new(),
                    consecutive_failures: 0,
                }),
                connection: RwLock::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        );
        info!(cluster = %id, endpoint = ?endpoint, "cluster registered");
        Ok(id)
    }

    /// Disconnect and forget a cluster.
    pub async fn remove(&self, id: &ClusterId) -> TetherResult<()> {
        self.inner.entry(id)?;
        self.inner.teardown(id, None).await;
        write(&self.inner.clusters).remove(id);
        info!(cluster = %id, "cluster removed");
        Ok(())
    }

    pub fn contains(&self, id: &ClusterId) -> bool {
        read(&self.inner.clusters).contains_key(id)
    }

    /// Build a client, probe the server and start the heartbeat. No-op when already connected.
    /// Fails with `TetherError::ShutDown` once `shutdown` has been called.
    pub async fn connect(&self, id: &ClusterId) -> TetherResult<()> {
        self.inner.connect(id, None).await
    }

    /// Stop every worker for the cluster and drop its connection. Idempotent.
    pub async fn disconnect(&self, id: &ClusterId) -> TetherResult<()> {
        self.inner.entry(id)?;
        self.inner.teardown(id, None).await;
        info!(cluster = %id, "disconnected");
        Ok(())
    }

    pub fn is_connected(&self, id: &ClusterId) -> bool {
        self.inner.is_connected(id)
    }

    fn ensure_running(&self) -> TetherResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TetherError::ShutDown);
        }
        Ok(())
    }

    /// Start (or restart) the heartbeat worker. Must run inside a Tokio runtime.
    pub fn start_heartbeat(&self, id: &ClusterId) -> TetherResult<()> {
        self.ensure_running()?;
        self.inner.entry(id)?;
        workers::spawn_heartbeat(&self.inner, id);
        Ok(())
    }

    pub fn stop_heartbeat(&self, id: &ClusterId) -> bool {
        self.inner.stop_worker(id, WorkerKind::Heartbeat)
    }

    /// Start (or restart) the reconnect worker. Must run inside a Tokio runtime.
    pub fn start_reconnect(&self, id: &ClusterId) -> TetherResult<()> {
        self.ensure_running()?;
        self.inner.entry(id)?;
        workers::spawn_reconnect(&self.inner, id);
        Ok(())
    }

    pub fn stop_reconnect(&self, id: &ClusterId) -> bool {
        self.inner.stop_worker(id, WorkerKind::Reconnect)
    }

    /// Worker kinds currently running for a cluster.
    pub fn active_workers(&self, id: &ClusterId) -> Vec<WorkerKind> {
        WorkerKind::ALL.into_iter().filter(|k| self.inner.worker_active(id, *k)).collect()
    }

    /// Store new client tunables. A connected cluster reconnects with them after the
    /// retune delay; a newer update within that delay supersedes this one.
    pub fn update_cluster_tunables(&self, id: &ClusterId, client: ClientTunables) -> TetherResult<()> {
        client.validate()?;
        let entry = self.inner.entry(id)?;
        let delay = {
            let mut cfg = write(&entry.config);
            cfg.client = client;
            cfg.health.retune_delay
        };
        info!(cluster = %id, "client tunables updated");
        if entry.status() == ClusterStatus::Connected && !self.inner.shutdown.is_cancelled() {
            workers::spawn_retune(&self.inner, id, delay);
        }
        Ok(())
    }

    pub fn cluster_config(&self, id: &ClusterId) -> TetherResult<ClusterConfig> {
        let entry = self.inner.entry(id)?;
        let cfg = read(&entry.config).clone();
        Ok(cfg)
    }

    pub fn cluster_status(&self, id: &ClusterId) -> TetherResult<ClusterStatusReport> {
        let entry = self.inner.entry(id)?;
        let st = read(&entry.state);
        Ok(ClusterStatusReport {
            id: id.clone(),
            status: st.status,
            endpoint: entry.endpoint.clone(),
            server_version: st.server_version.clone(),
            last_error: st.last_error.clone(),
            heartbeat_history: st.history.iter().cloned().collect(),
            consecutive_failures: st.consecutive_failures,
            heartbeat_active: self.inner.worker_active(id, WorkerKind::Heartbeat),
            reconnect_active: self.inner.worker_active(id, WorkerKind::Reconnect),
        })
    }

    /// Every registered cluster, disconnected ones included, ordered by id.
    pub fn list_clusters(&self) -> Vec<ClusterStatusReport> {
        let mut ids: Vec<ClusterId> = read(&self.inner.clusters).keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.cluster_status(id).ok()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel every worker. Terminal: afterwards `connect` and the worker starters fail with
    /// `TetherError::ShutDown`. Clusters stay registered with their current status and
    /// `disconnect` / `remove` keep working.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.workers().clear();
        debug!("registry workers cancelled");
    }
}

impl ConnectionSource for ClusterRegistry {
    fn connection(&self, id: &ClusterId) -> TetherResult<Connection> {
        let entry = self.inner.entry(id)?;
        let conn = read(&entry.connection).clone();
        conn.ok_or_else(|| TetherError::NotConnected(id.clone()))
    }
}
