//! Tether dispatch: turns a resource request into a `ResourceStatement`, runs it through the
//! interceptor chain of its operation category and makes the call at the chain's end.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_core::{
    ClusterId, ListOptions, OperationType, PatchKind, ResolvedKind, TetherError, TetherResult, DEFAULT_NAMESPACE,
};
use tether_kubehub::ConnectionSource;
use tether_pipeline::{Interceptor, Pipeline, RegisterOptions, WILDCARD};

mod statement;

pub use statement::{Output, ResourceStatement};
use statement::DispatchHandler;

/// Name of the terminal handler present in every chain.
pub const DISPATCH: &str = "dispatch";

/// One interceptor pipeline per operation category.
pub struct Interceptors {
    pipelines: [Pipeline<ResourceStatement>; 6],
}

fn slot(op: OperationType) -> usize {
    match op {
        OperationType::Get => 0,
        OperationType::List => 1,
        OperationType::Create => 2,
        OperationType::Update => 3,
        OperationType::Delete => 4,
        OperationType::Patch => 5,
    }
}

impl Interceptors {
    pub fn new() -> Self {
        let pipelines = OperationType::ALL.map(|op| {
            let p = Pipeline::new(op.as_str());
            let terminal: Arc<dyn Interceptor<ResourceStatement>> = Arc::new(DispatchHandler);
            if let Err(e) = p.register_with(DISPATCH, terminal, RegisterOptions::default().after(WILDCARD)) {
                // a single entry cannot conflict
                warn!(op = %op, error = %e, "terminal handler rejected");
            }
            p
        });
        Self { pipelines }
    }

    pub fn pipeline(&self, op: OperationType) -> &Pipeline<ResourceStatement> {
        &self.pipelines[slot(op)]
    }

    /// Register, replace or remove (per `opts`) a named interceptor for one category.
    /// The terminal `dispatch` handler cannot be touched.
    pub fn register(
        &self,
        op: OperationType,
        name: &str,
        handler: Option<Arc<dyn Interceptor<ResourceStatement>>>,
        opts: RegisterOptions,
    ) -> TetherResult<()> {
        if name == DISPATCH {
            return Err(TetherError::InvalidRequest(format!("interceptor name '{}' is reserved", DISPATCH)));
        }
        if name.trim().is_empty() || name == WILDCARD {
            return Err(TetherError::InvalidRequest(format!("invalid interceptor name '{}'", name)));
        }
        self.pipeline(op).apply(name, handler, opts).map_err(|e| TetherError::Ordering(e.to_string()))
    }

    /// Compiled order for one category.
    pub fn names(&self, op: OperationType) -> Vec<String> {
        self.pipeline(op).names()
    }
}

impl Default for Interceptors {
    fn default() -> Self {
        Self::new()
    }
}

/// A resource operation as a caller describes it, before kind resolution.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub cluster: ClusterId,
    pub kind: String,
    /// API group, to disambiguate kinds served by several groups.
    pub group: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub operation: OperationType,
    pub list_options: ListOptions,
    pub payload: Option<Value>,
    pub patch_kind: PatchKind,
}

impl ResourceRequest {
    pub fn new(cluster: ClusterId, kind: impl Into<String>, operation: OperationType) -> Self {
        Self {
            cluster,
            kind: kind.into(),
            group: None,
            namespace: None,
            name: None,
            operation,
            list_options: ListOptions::default(),
            payload: None,
            patch_kind: PatchKind::Merge,
        }
    }

    pub fn get(cluster: ClusterId, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(cluster, kind, OperationType::Get).name(name)
    }

    pub fn list(cluster: ClusterId, kind: impl Into<String>) -> Self {
        Self::new(cluster, kind, OperationType::List)
    }

    pub fn create(cluster: ClusterId, kind: impl Into<String>, doc: Value) -> Self {
        Self::new(cluster, kind, OperationType::Create).payload(doc)
    }

    pub fn update(cluster: ClusterId, kind: impl Into<String>, doc: Value) -> Self {
        Self::new(cluster, kind, OperationType::Update).payload(doc)
    }

    pub fn patch(cluster: ClusterId, kind: impl Into<String>, name: impl Into<String>, patch_kind: PatchKind, patch: Value) -> Self {
        let mut r = Self::new(cluster, kind, OperationType::Patch).name(name).payload(patch);
        r.patch_kind = patch_kind;
        r
    }

    pub fn delete(cluster: ClusterId, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(cluster, kind, OperationType::Delete).name(name)
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn list_options(mut self, opts: ListOptions) -> Self {
        self.list_options = opts;
        self
    }

    pub fn payload(mut self, doc: Value) -> Self {
        self.payload = Some(doc);
        self
    }

    /// Namespace the statement will use once the kind's scope is known.
    fn effective_namespace(&self, target: &ResolvedKind) -> Option<String> {
        if !target.namespaced {
            return None;
        }
        if self.operation == OperationType::List && self.list_options.all_namespaces {
            return None;
        }
        let from_payload = self.payload.as_ref().and_then(|p| p.pointer("/metadata/namespace")).and_then(Value::as_str);
        Some(
            self.namespace
                .as_deref()
                .or(from_payload)
                .filter(|ns| !ns.is_empty())
                .unwrap_or(DEFAULT_NAMESPACE)
                .to_string(),
        )
    }
}

/// Splits a document's `apiVersion` into its group (empty for core).
fn group_of(api_version: &str) -> &str {
    api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("")
}

pub struct Dispatcher {
    source: Arc<dyn ConnectionSource>,
    interceptors: Arc<Interceptors>,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn ConnectionSource>, interceptors: Arc<Interceptors>) -> Self {
        Self { source, interceptors }
    }

    pub fn interceptors(&self) -> &Arc<Interceptors> {
        &self.interceptors
    }

    /// Resolve a kind on a connected cluster.
    pub async fn resolve(&self, cluster: &ClusterId, kind: &str, group: Option<&str>) -> TetherResult<ResolvedKind> {
        self.source.connection(cluster)?.resolver.resolve(kind, group).await
    }

    pub async fn execute(&self, req: ResourceRequest) -> TetherResult<Output> {
        let op = req.operation;
        let cluster = req.cluster.to_string();
        let t0 = Instant::now();
        let res = self.run(req).await;
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        counter!("dispatch_total", 1u64, "op" => op.as_str());
        histogram!("dispatch_latency_ms", ms, "op" => op.as_str());
        if let Err(e) = &res {
            counter!("dispatch_err_total", 1u64, "op" => op.as_str());
            info!(cluster = %cluster, op = %op, took_ms = %(ms as u64), error = %e, "dispatch: failed");
        } else {
            info!(cluster = %cluster, op = %op, took_ms = %(ms as u64), "dispatch: ok");
        }
        res
    }

    /// Like `execute`, but gives up with `Cancelled` as soon as `token` fires.
    pub async fn execute_with_cancel(&self, req: ResourceRequest, token: CancellationToken) -> TetherResult<Output> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TetherError::Cancelled),
            res = self.execute(req) => res,
        }
    }

    async fn run(&self, req: ResourceRequest) -> TetherResult<Output> {
        let conn = self.source.connection(&req.cluster)?;
        let target = conn.resolver.resolve(&req.kind, req.group.as_deref()).await?;
        let namespace = req.effective_namespace(&target);

        let mut stmt = ResourceStatement::new(req.cluster, target, req.operation, conn.backend);
        stmt.namespace = namespace;
        stmt.name = req.name.filter(|n| !n.is_empty());
        stmt.list_options = req.list_options;
        stmt.payload = req.payload;
        stmt.patch_kind = req.patch_kind;

        self.interceptors.pipeline(stmt.operation).execute(&mut stmt).await.map_err(TetherError::from_anyhow)?;
        stmt.result
            .take()
            .ok_or_else(|| TetherError::InvalidRequest(format!("{} chain finished without a result", stmt.operation)))
    }

    /// Create the object described by `doc`, or update it with the live resourceVersion if it exists.
    pub async fn apply_document(&self, cluster: &ClusterId, mut doc: Value) -> TetherResult<Output> {
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| TetherError::InvalidRequest("document has no kind".into()))?
            .to_string();
        let name = doc
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| TetherError::InvalidRequest("document has no metadata.name".into()))?
            .to_string();
        let group = doc.get("apiVersion").and_then(Value::as_str).map(|v| group_of(v).to_string());
        let namespace = doc.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string);

        let scoped = |mut r: ResourceRequest| {
            r.group = group.clone();
            r.namespace = namespace.clone();
            r
        };

        match self.execute(scoped(ResourceRequest::get(cluster.clone(), &kind, &name))).await {
            Ok(live) => {
                let rv = live.into_object().and_then(|o| o.pointer("/metadata/resourceVersion").cloned());
                if let (Some(rv), Some(meta)) = (rv, doc.get_mut("metadata").and_then(Value::as_object_mut)) {
                    meta.insert("resourceVersion".into(), rv);
                }
                self.execute(scoped(ResourceRequest::update(cluster.clone(), &kind, doc).name(&name))).await
            }
            Err(e) if e.is_not_found() => self.execute(scoped(ResourceRequest::create(cluster.clone(), &kind, doc))).await,
            Err(e) => Err(e),
        }
    }
}
