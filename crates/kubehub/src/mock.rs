//! In-memory backend and connector for tests and demos.
//!
//! `MockBackend` keeps objects in a map keyed by GVR, namespace and name, honours label
//! selectors of the `k=v`/`k` form and can be flipped unreachable to simulate an outage.
//! Clones share state, so a test can keep a handle while the registry owns another.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use tether_core::{ClusterConfig, ClusterId, Gvr, ListOptions, PatchKind, ResolvedKind, TetherError, TetherResult};

use crate::{with_type_meta, ClusterBackend, Connector, CrdInfo, CrdVersion};

type ObjectKey = (String, Option<String>, String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockState {
    reachable: AtomicBool,
    version: Mutex<String>,
    resources: Mutex<Vec<ResolvedKind>>,
    crds: Mutex<Vec<CrdInfo>>,
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    resource_version: AtomicU64,
    probes: AtomicUsize,
    discoveries: AtomicUsize,
    crd_lists: AtomicUsize,
}

#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A reachable cluster serving Pod, ConfigMap, Namespace and apps/v1 Deployment.
    pub fn new() -> Self {
        let resources = vec![
            ResolvedKind::builtin("Pod", Gvr::new("", "v1", "pods"), true),
            ResolvedKind::builtin("ConfigMap", Gvr::new("", "v1", "configmaps"), true),
            ResolvedKind::builtin("Namespace", Gvr::new("", "v1", "namespaces"), false),
            ResolvedKind::builtin("Deployment", Gvr::new("apps", "v1", "deployments"), true),
        ];
        Self {
            state: Arc::new(MockState {
                reachable: AtomicBool::new(true),
                version: Mutex::new("v1.29.0".into()),
                resources: Mutex::new(resources),
                crds: Mutex::new(Vec::new()),
                objects: Mutex::new(BTreeMap::new()),
                resource_version: AtomicU64::new(0),
                probes: AtomicUsize::new(0),
                discoveries: AtomicUsize::new(0),
                crd_lists: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::SeqCst)
    }

    pub fn set_version(&self, version: impl Into<String>) {
        *lock(&self.state.version) = version.into();
    }

    pub fn with_resource(self, kind: ResolvedKind) -> Self {
        lock(&self.state.resources).push(kind);
        self
    }

    /// Register a CRD served at a single storage version.
    pub fn with_crd(self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        lock(&self.state.crds).push(CrdInfo {
            group: group.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
            versions: vec![CrdVersion { name: version.into(), served: true, storage: true }],
        });
        self
    }

    /// Seed an object without going through `create`; the document is stored as given.
    pub fn insert_object(&self, target: &ResolvedKind, namespace: Option<&str>, doc: Value) {
        let name = doc.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string();
        let ns = if target.namespaced { namespace.map(str::to_string) } else { None };
        lock(&self.state.objects).insert((target.gvr.to_string(), ns, name), with_type_meta(doc, target));
    }

    pub fn object_count(&self) -> usize {
        lock(&self.state.objects).len()
    }

    /// Number of `server_version` calls, reachable or not.
    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn discoveries(&self) -> usize {
        self.state.discoveries.load(Ordering::SeqCst)
    }

    pub fn crd_lists(&self) -> usize {
        self.state.crd_lists.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> TetherResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(TetherError::transport(io::Error::new(io::ErrorKind::ConnectionRefused, "mock cluster unreachable")))
        }
    }

    fn key(target: &ResolvedKind, namespace: Option<&str>, name: &str) -> ObjectKey {
        let ns = if target.namespaced { namespace.map(str::to_string) } else { None };
        (target.gvr.to_string(), ns, name.to_string())
    }

    fn next_resource_version(&self) -> String {
        (self.state.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, doc: &mut Value, target: &ResolvedKind, namespace: Option<&str>) {
        let rv = self.next_resource_version();
        if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".into(), Value::String(rv));
            if target.namespaced {
                if let Some(ns) = namespace {
                    meta.insert("namespace".into(), Value::String(ns.to_string()));
                }
            }
            meta.entry("creationTimestamp")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
    }
}

fn labels_match(doc: &Value, selector: &str) -> bool {
    let labels = doc.pointer("/metadata/labels").and_then(Value::as_object);
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        let (key, want, negate) = if let Some((k, v)) = term.split_once("!=") {
            (k.trim(), Some(v.trim()), true)
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            (k.trim(), Some(v.trim()), false)
        } else {
            (term, None, false)
        };
        let got = labels.and_then(|m| m.get(key)).and_then(Value::as_str);
        match (want, negate) {
            (None, _) => got.is_some(),
            (Some(w), false) => got == Some(w),
            (Some(w), true) => got != Some(w),
        }
    })
}

/// JSON merge patch (RFC 7386).
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[async_trait::async_trait]
impl ClusterBackend for MockBackend {
    async fn server_version(&self) -> TetherResult<String> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(lock(&self.state.version).clone())
    }

    async fn api_resources(&self) -> TetherResult<Vec<ResolvedKind>> {
        self.state.discoveries.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(lock(&self.state.resources).clone())
    }

    async fn custom_resource_definitions(&self) -> TetherResult<Vec<CrdInfo>> {
        self.state.crd_lists.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(lock(&self.state.crds).clone())
    }

    async fn get(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<Value> {
        self.check_reachable()?;
        lock(&self.state.objects)
            .get(&Self::key(target, namespace, name))
            .cloned()
            .ok_or_else(|| TetherError::NotFound(format!("{} {}", target.gvr, name)))
    }

    async fn list(&self, target: &ResolvedKind, namespace: Option<&str>, opts: &ListOptions) -> TetherResult<Vec<Value>> {
        self.check_reachable()?;
        let gvr = target.gvr.to_string();
        let objects = lock(&self.state.objects);
        let mut out: Vec<Value> = objects
            .iter()
            .filter(|((g, ns, _), _)| *g == gvr && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, doc)| opts.label_selector.as_deref().map_or(true, |s| labels_match(doc, s)))
            .map(|(_, doc)| doc.clone())
            .collect();
        if let Some(n) = opts.limit {
            out.truncate(n as usize);
        }
        Ok(out)
    }

    async fn create(&self, target: &ResolvedKind, namespace: Option<&str>, doc: &Value) -> TetherResult<Value> {
        self.check_reachable()?;
        let name = doc
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| TetherError::InvalidRequest("metadata.name is required".into()))?;
        let key = Self::key(target, namespace, name);
        let mut objects = lock(&self.state.objects);
        if objects.contains_key(&key) {
            return Err(TetherError::Api { code: 409, message: format!("{} {} already exists", target.gvr, name) });
        }
        let mut stored = with_type_meta(doc.clone(), target);
        self.stamp(&mut stored, target, namespace);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str, doc: &Value) -> TetherResult<Value> {
        self.check_reachable()?;
        let key = Self::key(target, namespace, name);
        let mut objects = lock(&self.state.objects);
        let live = objects.get(&key).ok_or_else(|| TetherError::NotFound(format!("{} {}", target.gvr, name)))?;
        let live_rv = live.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        let sent_rv = doc.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if sent_rv.is_some() && sent_rv != live_rv {
            return Err(TetherError::Api { code: 409, message: format!("{} {}: resourceVersion conflict", target.gvr, name) });
        }
        let created = live.pointer("/metadata/creationTimestamp").cloned();
        let mut stored = with_type_meta(doc.clone(), target);
        if let (Some(ts), Some(meta)) = (created, stored.get_mut("metadata").and_then(Value::as_object_mut)) {
            meta.insert("creationTimestamp".into(), ts);
        }
        self.stamp(&mut stored, target, namespace);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(
        &self,
        target: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        kind: PatchKind,
        patch: &Value,
    ) -> TetherResult<Value> {
        self.check_reachable()?;
        let key = Self::key(target, namespace, name);
        let mut objects = lock(&self.state.objects);
        let mut doc = match (objects.get(&key), kind) {
            (Some(live), _) => live.clone(),
            (None, PatchKind::Apply) => {
                let mut meta = Map::new();
                meta.insert("name".into(), Value::String(name.to_string()));
                with_type_meta(Value::Object(Map::from_iter([("metadata".to_string(), Value::Object(meta))])), target)
            }
            (None, _) => return Err(TetherError::NotFound(format!("{} {}", target.gvr, name))),
        };
        merge(&mut doc, patch);
        self.stamp(&mut doc, target, namespace);
        objects.insert(key, doc.clone());
        Ok(doc)
    }

    async fn delete(&self, target: &ResolvedKind, namespace: Option<&str>, name: &str) -> TetherResult<()> {
        self.check_reachable()?;
        lock(&self.state.objects)
            .remove(&Self::key(target, namespace, name))
            .map(|_| ())
            .ok_or_else(|| TetherError::NotFound(format!("{} {}", target.gvr, name)))
    }
}

/// Hands out `MockBackend`s. Connecting fails while the chosen backend is unreachable.
#[derive(Clone)]
pub struct MockConnector {
    default: MockBackend,
    per_cluster: Arc<Mutex<HashMap<ClusterId, MockBackend>>>,
    connects: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(backend: MockBackend) -> Self {
        Self { default: backend, per_cluster: Arc::new(Mutex::new(HashMap::new())), connects: Arc::new(AtomicUsize::new(0)) }
    }

    /// Route one cluster to its own backend.
    pub fn with_cluster(self, id: ClusterId, backend: MockBackend) -> Self {
        lock(&self.per_cluster).insert(id, backend);
        self
    }

    pub fn backend(&self) -> &MockBackend {
        &self.default
    }

    pub fn backend_for(&self, id: &ClusterId) -> MockBackend {
        lock(&self.per_cluster).get(id).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// Connection attempts so far, successful or not.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ClusterConfig) -> TetherResult<Arc<dyn ClusterBackend>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let backend = self.backend_for(&config.id);
        if !backend.is_reachable() {
            return Err(TetherError::Connection { cluster: config.id.clone(), message: "connection refused".into() });
        }
        Ok(Arc::new(backend))
    }

    fn endpoint(&self, config: &ClusterConfig) -> TetherResult<Option<String>> {
        Ok(Some(format!("mock://{}", config.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pods() -> ResolvedKind {
        ResolvedKind::builtin("Pod", Gvr::new("", "v1", "pods"), true)
    }

    #[test]
    fn label_selector_forms() {
        let doc = json!({"metadata": {"labels": {"app": "web", "tier": "front"}}});
        assert!(labels_match(&doc, "app=web"));
        assert!(labels_match(&doc, "app==web,tier"));
        assert!(labels_match(&doc, "app!=db"));
        assert!(!labels_match(&doc, "app=db"));
        assert!(!labels_match(&doc, "missing"));
    }

    #[tokio::test]
    async fn update_checks_resource_version() {
        let b = MockBackend::new();
        let created = b.create(&pods(), Some("default"), &json!({"metadata": {"name": "p"}})).await.unwrap();
        let rv = created["metadata"]["resourceVersion"].as_str().unwrap().to_string();

        let stale = json!({"metadata": {"name": "p", "resourceVersion": "999"}});
        assert!(matches!(b.update(&pods(), Some("default"), "p", &stale).await, Err(TetherError::Api { code: 409, .. })));

        let fresh = json!({"metadata": {"name": "p", "resourceVersion": rv}, "spec": {"x": 1}});
        let updated = b.update(&pods(), Some("default"), "p", &fresh).await.unwrap();
        assert_eq!(updated["spec"]["x"], 1);
        assert_eq!(updated["metadata"]["creationTimestamp"], created["metadata"]["creationTimestamp"]);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_with_transport() {
        let b = MockBackend::new();
        b.set_reachable(false);
        assert!(matches!(b.server_version().await, Err(TetherError::Transport(_))));
        assert_eq!(b.probes(), 1);
    }

    #[tokio::test]
    async fn merge_patch_removes_nulls() {
        let b = MockBackend::new();
        b.insert_object(&pods(), Some("default"), json!({"metadata": {"name": "p", "labels": {"a": "1", "b": "2"}}}));
        let out = b
            .patch(&pods(), Some("default"), "p", PatchKind::Merge, &json!({"metadata": {"labels": {"a": null, "c": "3"}}}))
            .await
            .unwrap();
        assert_eq!(out["metadata"]["labels"], json!({"b": "2", "c": "3"}));
    }
}
