//! Tether core types: cluster identity, connectivity status, resource addressing and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::{ClientTunables, ClusterConfig, ClusterRecord, ClusterSource, HealthTunables};
pub use error::{TetherError, TetherResult};

pub mod prelude {
    pub use super::{
        ClientTunables, ClusterConfig, ClusterId, ClusterSource, ClusterStatus, Gvr, HealthTunables, HeartbeatRecord,
        KindSource, ListOptions, OperationType, PatchKind, ResolvedKind, TetherError, TetherResult,
    };
}

/// Namespace used when a namespaced kind is addressed without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies one managed cluster: the kubeconfig file label plus the context inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId {
    pub file: String,
    pub context: String,
}

impl ClusterId {
    pub fn new(file: impl Into<String>, context: impl Into<String>) -> Self {
        Self { file: file.into(), context: context.into() }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.context)
    }
}

impl FromStr for ClusterId {
    type Err = TetherError;

    /// Parses `file/context`. Context names may themselves contain `/` (EKS ARNs do),
    /// so only the first separator splits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((file, context)) if !file.is_empty() && !context.is_empty() => Ok(Self::new(file, context)),
            _ => Err(TetherError::InvalidConfig(format!("invalid cluster id: {} (expect file/context)", s))),
        }
    }
}

/// Connectivity status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ClusterStatus {
    /// Allowed edges of the connectivity state machine. Self-transitions are not edges.
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Disconnected => "Disconnected",
            ClusterStatus::Connecting => "Connecting",
            ClusterStatus::Connected => "Connected",
            ClusterStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One heartbeat probe outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Operation category; each has its own interceptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Get,
    List,
    Create,
    Update,
    Delete,
    Patch,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::Get,
        OperationType::List,
        OperationType::Create,
        OperationType::Update,
        OperationType::Delete,
        OperationType::Patch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Get => "get",
            OperationType::List => "list",
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Patch => "patch",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group/Version/Resource triple. `group` is empty for the core API group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Where a kind's addressing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindSource {
    /// Server discovery (covers built-ins and any CRDs served at discovery time).
    Builtin,
    /// Read from a CustomResourceDefinition object.
    Crd,
}

/// A kind name resolved to its addressing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedKind {
    pub kind: String,
    pub gvr: Gvr,
    pub namespaced: bool,
    pub source: KindSource,
}

impl ResolvedKind {
    pub fn builtin(kind: impl Into<String>, gvr: Gvr, namespaced: bool) -> Self {
        Self { kind: kind.into(), gvr, namespaced, source: KindSource::Builtin }
    }

    pub fn crd(kind: impl Into<String>, gvr: Gvr, namespaced: bool) -> Self {
        Self { kind: kind.into(), gvr, namespaced, source: KindSource::Crd }
    }
}

/// Options carried by List statements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    /// List across every namespace instead of defaulting to `default`.
    pub all_namespaces: bool,
}

impl ListOptions {
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn all_namespaces(mut self) -> Self {
        self.all_namespaces = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    Merge,
    Strategic,
    /// Server-side apply.
    Apply,
}
