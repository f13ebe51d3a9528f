//! Cluster configuration and tunables.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ClusterId, TetherError};

/// Parse straight into the target type so out-of-range values fall back instead of wrapping.
fn parse_var<T: std::str::FromStr>(raw: Result<String, std::env::VarError>) -> Option<T> {
    raw.ok().and_then(|s| s.parse::<T>().ok())
}

fn env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    parse_var(std::env::var(key))
}

/// Heartbeat and recovery knobs for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTunables {
    pub heartbeat_interval: Duration,
    /// Consecutive failed probes that mark the cluster Disconnected.
    pub failure_threshold: u32,
    /// Capacity of the heartbeat history ring.
    pub history_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    /// Delay between a tunables update and the reconnect it triggers.
    pub retune_delay: Duration,
}

impl Default for HealthTunables {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            failure_threshold: 3,
            history_capacity: 10,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(3600),
            max_reconnect_attempts: 100,
            retune_delay: Duration::from_secs(1),
        }
    }
}

impl HealthTunables {
    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heartbeat_interval: env_var("TETHER_HEARTBEAT_SECS").map(Duration::from_secs).unwrap_or(d.heartbeat_interval),
            failure_threshold: env_var("TETHER_HEARTBEAT_FAILURES").unwrap_or(d.failure_threshold),
            history_capacity: env_var("TETHER_HEARTBEAT_HISTORY").unwrap_or(d.history_capacity),
            backoff_initial: env_var("TETHER_RECONNECT_INITIAL_SECS").map(Duration::from_secs).unwrap_or(d.backoff_initial),
            backoff_max: env_var("TETHER_RECONNECT_MAX_BACKOFF_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            max_reconnect_attempts: env_var("TETHER_RECONNECT_MAX_ATTEMPTS").unwrap_or(d.max_reconnect_attempts),
            retune_delay: env_var("TETHER_RETUNE_DELAY_MS").map(Duration::from_millis).unwrap_or(d.retune_delay),
        }
        .sanitized()
    }

    /// Clamp values that would make the workers spin or never trip.
    pub fn sanitized(mut self) -> Self {
        if self.heartbeat_interval.is_zero() { self.heartbeat_interval = Duration::from_secs(1); }
        self.failure_threshold = self.failure_threshold.max(1);
        self.history_capacity = self.history_capacity.max(1);
        self.max_reconnect_attempts = self.max_reconnect_attempts.max(1);
        if self.backoff_max < self.backoff_initial { self.backoff_max = self.backoff_initial; }
        self
    }
}

/// Client-side connection knobs, adjustable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTunables {
    pub proxy_url: Option<String>,
    pub timeout_secs: u64,
    pub qps: f32,
    pub burst: u32,
}

impl Default for ClientTunables {
    fn default() -> Self {
        Self { proxy_url: None, timeout_secs: 30, qps: 100.0, burst: 200 }
    }
}

impl ClientTunables {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        if self.timeout_secs == 0 {
            return Err(TetherError::InvalidConfig("timeout must be positive".into()));
        }
        if !(self.qps > 0.0) {
            return Err(TetherError::InvalidConfig(format!("qps must be positive, got {}", self.qps)));
        }
        if self.burst == 0 {
            return Err(TetherError::InvalidConfig("burst must be positive".into()));
        }
        if let Some(p) = &self.proxy_url {
            if p.trim().is_empty() {
                return Err(TetherError::InvalidConfig("proxy url is empty".into()));
            }
        }
        Ok(())
    }
}

/// How to reach the cluster's API server.
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterSource {
    /// A kubeconfig document (file-based or produced by a cloud credential helper) and the context to use.
    Kubeconfig { content: String, context: String },
    /// The pod's service account.
    InCluster,
}

impl fmt::Debug for ClusterSource {
    // Kubeconfig content carries credentials; keep it out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSource::Kubeconfig { context, content } => f
                .debug_struct("Kubeconfig")
                .field("context", context)
                .field("content_bytes", &content.len())
                .finish(),
            ClusterSource::InCluster => f.write_str("InCluster"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub id: ClusterId,
    pub source: ClusterSource,
    pub health: HealthTunables,
    pub client: ClientTunables,
}

impl ClusterConfig {
    pub fn from_kubeconfig(file: impl Into<String>, context: impl Into<String>, content: impl Into<String>) -> Self {
        let context = context.into();
        Self {
            id: ClusterId::new(file, context.clone()),
            source: ClusterSource::Kubeconfig { content: content.into(), context },
            health: HealthTunables::default(),
            client: ClientTunables::default(),
        }
    }

    pub fn in_cluster() -> Self {
        Self {
            id: ClusterId::new("InCluster", "InCluster"),
            source: ClusterSource::InCluster,
            health: HealthTunables::default(),
            client: ClientTunables::default(),
        }
    }

    pub fn with_health(mut self, health: HealthTunables) -> Self {
        self.health = health.sanitized();
        self
    }

    pub fn with_client(mut self, client: ClientTunables) -> Self {
        self.client = client;
        self
    }
}

/// Row shape a persistence collaborator stores; convertible into a `ClusterConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub file_name: String,
    pub context_name: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub in_cluster: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub qps: Option<f32>,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl TryFrom<ClusterRecord> for ClusterConfig {
    type Error = TetherError;

    fn try_from(r: ClusterRecord) -> Result<Self, Self::Error> {
        let id = ClusterId::new(r.file_name, r.context_name.clone());
        let source = match (r.in_cluster, r.kubeconfig) {
            (true, _) => ClusterSource::InCluster,
            (false, Some(content)) => ClusterSource::Kubeconfig { content, context: r.context_name },
            (false, None) => return Err(TetherError::InvalidConfig(format!("cluster {} has neither kubeconfig nor in-cluster flag", id))),
        };
        let d = ClientTunables::default();
        let client = ClientTunables {
            proxy_url: r.proxy_url.filter(|p| !p.is_empty()),
            timeout_secs: r.timeout_secs.unwrap_or(d.timeout_secs),
            qps: r.qps.unwrap_or(d.qps),
            burst: r.burst.unwrap_or(d.burst),
        };
        client.validate()?;
        Ok(ClusterConfig { id, source, health: HealthTunables::from_env(), client })
    }
}
