//! Tether kubehub: the seam between the registry/dispatcher and a cluster's API server.
//!
//! `ClusterBackend` is one live connection speaking untyped JSON documents; `Connector`
//! builds backends from a `ClusterConfig`. The kube-rs implementations live in `client`,
//! an in-memory pair for tests in `mock` (behind the `mock` feature).

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{ClusterConfig, ClusterId, ListOptions, PatchKind, ResolvedKind, TetherResult};

mod client;
pub mod kubeconfig;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod resolver;

pub use client::{KubeBackend, KubeConnector};
pub use resolver::GvrResolver;

/// One served version of a CustomResourceDefinition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdVersion {
    pub name: String,
    pub served: bool,
    pub storage: bool,
}

/// The parts of a CustomResourceDefinition needed to address its objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdInfo {
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub versions: Vec<CrdVersion>,
}

impl CrdInfo {
    /// Storage version if served, else the first served one.
    pub fn preferred_version(&self) -> Option<&str> {
        self.versions
            .iter()
            .find(|v| v.storage && v.served)
            .or_else(|| self.versions.iter().find(|v| v.served))
            .map(|v| v.name.as_str())
    }
}

/// A live connection to one cluster. Documents are untyped JSON objects.
#[async_trait::async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Cheap reachability probe; returns the server's git version.
    async fn server_version(&self) -> TetherResult<String>;
    /// Every resource kind the server advertises, at its preferred version.
    async fn api_resources(&self) -> TetherResult<Vec<ResolvedKind>>;
    async fn custom_resource_definitions(&self) -> TetherResult<Vec<CrdInfo>>;

    async fn get(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<Value>;
    async fn list(&self, target: &ResolvedKind, namespace: Option<&str>, opts: &ListOptions) -> TetherResult<Vec<Value>>;
    async fn create(&self, target: &ResolvedKind, namespace: Option<&str>, doc: &Value) -> TetherResult<Value>;
    async fn update(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str, doc: &Value) -> TetherResult<Value>;
    async fn patch(
        &self,
        target: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        patch: &Value,
    ) -> TetherResult<Value>;
    async fn delete(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<()>;
}

/// Builds backends for cluster configs.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ClusterConfig) -> TetherResult<Arc<dyn ClusterBackend>>;

    /// API server address the config points at, if it can be told without connecting.
    fn endpoint(&self, config: &ClusterConfig) -> TetherResult<Option<String>>;
}

/// A connected cluster as seen by the dispatcher: its backend plus the kind cache built on it.
#[derive(Clone)]
pub struct Connection {
    pub backend: Arc<dyn ClusterBackend>,
    pub resolver: Arc<GvrResolver>,
}

impl Connection {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        let resolver = Arc::new(GvrResolver::new(Arc::clone(&backend)));
        Self { backend, resolver }
    }
}

/// Hands out the current connection for a cluster.
pub trait ConnectionSource: Send + Sync {
    fn connection(&self, id: &ClusterId) -> TetherResult<Connection>;
}

pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn creation_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.pointer("/metadata/creationTimestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Newest first; objects without a parseable creation timestamp go last. Stable.
pub fn sort_by_creation_desc(items: &mut [Value]) {
    items.sort_by(|a, b| match (creation_timestamp(a), creation_timestamp(b)) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Stamp `apiVersion`/`kind` onto list items; list responses omit them per item.
pub fn with_type_meta(mut v: Value, target: &ResolvedKind) -> Value {
    if let Value::Object(ref mut map) = v {
        map.entry("apiVersion").or_insert_with(|| Value::String(target.gvr.api_version()));
        map.entry("kind").or_insert_with(|| Value::String(target.kind.clone()));
    }
    v
}
