use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use tether_core::{Gvr, ResolvedKind, TetherError, TetherResult};

use crate::{ClusterBackend, CrdInfo};

type CrdKey = (String, Option<String>);

/// Per-connection kind cache.
///
/// Server discovery runs once, on first use, and is only repeated by `rediscover`. Kinds the
/// discovery snapshot does not know are looked up among CustomResourceDefinitions; those hits
/// are cached as well.
pub struct GvrResolver {
    backend: Arc<dyn ClusterBackend>,
    builtin: Mutex<Option<Arc<Vec<ResolvedKind>>>>,
    crds: RwLock<HashMap<CrdKey, ResolvedKind>>,
}

fn exact(r: &ResolvedKind, kind: &str) -> bool {
    r.kind == kind
}

fn loose(r: &ResolvedKind, kind: &str) -> bool {
    r.kind.eq_ignore_ascii_case(kind) || r.gvr.resource.eq_ignore_ascii_case(kind)
}

fn crd_matches(c: &CrdInfo, kind: &str) -> bool {
    c.kind == kind || c.kind.eq_ignore_ascii_case(kind) || c.plural.eq_ignore_ascii_case(kind)
}

impl GvrResolver {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend, builtin: Mutex::new(None), crds: RwLock::new(HashMap::new()) }
    }

    async fn builtin(&self) -> TetherResult<Arc<Vec<ResolvedKind>>> {
        let mut slot = self.builtin.lock().await;
        if let Some(cached) = slot.as_ref() {
            return Ok(Arc::clone(cached));
        }
        let kinds = Arc::new(self.backend.api_resources().await?);
        *slot = Some(Arc::clone(&kinds));
        Ok(kinds)
    }

    /// Drop both caches and rerun discovery. Returns the number of discovered kinds.
    pub async fn rediscover(&self) -> TetherResult<usize> {
        self.crds.write().unwrap_or_else(PoisonError::into_inner).clear();
        let mut slot = self.builtin.lock().await;
        let kinds = Arc::new(self.backend.api_resources().await?);
        let n = kinds.len();
        *slot = Some(kinds);
        info!(kinds = n, "rediscovered api resources");
        Ok(n)
    }

    /// Whether discovery has run on this connection.
    pub async fn is_warm(&self) -> bool {
        self.builtin.lock().await.is_some()
    }

    /// Resolve `kind` (optionally restricted to `group`) to its addressing information.
    ///
    /// Matching is exact on the kind name first, then case-insensitive on kind or plural.
    /// Among several discovered groups the core group wins.
    pub async fn resolve(&self, kind: &str, group: Option<&str>) -> TetherResult<ResolvedKind> {
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(TetherError::InvalidRequest("kind is required".into()));
        }
        let builtin = self.builtin().await?;
        let in_group = |r: &&ResolvedKind| group.map_or(true, |g| r.gvr.group == g);
        let mut hits: Vec<&ResolvedKind> = builtin.iter().filter(|r| exact(r, kind)).filter(in_group).collect();
        if hits.is_empty() {
            hits = builtin.iter().filter(|r| loose(r, kind)).filter(in_group).collect();
        }
        if let Some(hit) = hits.iter().find(|r| r.gvr.group.is_empty()).or_else(|| hits.first()) {
            return Ok((*hit).clone());
        }
        self.resolve_crd(kind, group).await
    }

    async fn resolve_crd(&self, kind: &str, group: Option<&str>) -> TetherResult<ResolvedKind> {
        let key: CrdKey = (kind.to_ascii_lowercase(), group.map(str::to_string));
        let cached = self.crds.read().unwrap_or_else(PoisonError::into_inner).get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let crds = self.backend.custom_resource_definitions().await?;
        let candidates: Vec<(&CrdInfo, &str)> = crds
            .iter()
            .filter(|c| crd_matches(c, kind) && group.map_or(true, |g| c.group == g))
            .filter_map(|c| c.preferred_version().map(|v| (c, v)))
            .collect();

        let groups: BTreeSet<&str> = candidates.iter().map(|(c, _)| c.group.as_str()).collect();
        if groups.len() > 1 {
            return Err(TetherError::AmbiguousKind { kind: kind.to_string(), groups: groups.into_iter().map(str::to_string).collect() });
        }
        let Some((crd, version)) = candidates.first() else {
            let what = match group {
                Some(g) => format!("{}.{}", kind, g),
                None => kind.to_string(),
            };
            return Err(TetherError::UnsupportedResource(what));
        };

        let resolved = ResolvedKind::crd(crd.kind.clone(), Gvr::new(crd.group.clone(), *version, crd.plural.clone()), crd.namespaced);
        debug!(kind = %kind, gvr = %resolved.gvr, namespaced = resolved.namespaced, "resolved via crd");
        self.crds.write().unwrap_or_else(PoisonError::into_inner).insert(key, resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use tether_core::KindSource;

    fn resolver(b: &MockBackend) -> GvrResolver {
        GvrResolver::new(Arc::new(b.clone()))
    }

    #[tokio::test]
    async fn builtin_lookup_discovers_once() {
        let b = MockBackend::new();
        let r = resolver(&b);
        let pod = r.resolve("Pod", None).await.unwrap();
        assert_eq!(pod.gvr, Gvr::new("", "v1", "pods"));
        assert!(pod.namespaced);
        assert_eq!(r.resolve("deployments", None).await.unwrap().gvr.group, "apps");
        assert_eq!(r.resolve("namespace", None).await.unwrap().namespaced, false);
        assert_eq!(b.discoveries(), 1);
        assert_eq!(b.crd_lists(), 0);
    }

    #[tokio::test]
    async fn core_group_wins_among_builtins() {
        let b = MockBackend::new()
            .with_resource(ResolvedKind::builtin("Event", Gvr::new("events.k8s.io", "v1", "events"), true))
            .with_resource(ResolvedKind::builtin("Event", Gvr::new("", "v1", "events"), true));
        let r = resolver(&b);
        assert_eq!(r.resolve("Event", None).await.unwrap().gvr.group, "");
        assert_eq!(r.resolve("Event", Some("events.k8s.io")).await.unwrap().gvr.group, "events.k8s.io");
    }

    #[tokio::test]
    async fn crd_fallback_reads_scope_and_plural() {
        let b = MockBackend::new().with_crd("example.io", "v1", "Widget", "widgets", true);
        let r = resolver(&b);
        let w = r.resolve("Widget", None).await.unwrap();
        assert_eq!(w.source, KindSource::Crd);
        assert_eq!(w.gvr, Gvr::new("example.io", "v1", "widgets"));
        assert!(w.namespaced);
        r.resolve("Widget", None).await.unwrap();
        assert_eq!(b.crd_lists(), 1);
    }

    #[tokio::test]
    async fn crd_in_two_groups_needs_a_group() {
        let b = MockBackend::new()
            .with_crd("b.io", "v1", "Widget", "widgets", true)
            .with_crd("a.io", "v1beta1", "Widget", "widgets", false);
        let r = resolver(&b);
        match r.resolve("Widget", None).await {
            Err(TetherError::AmbiguousKind { groups, .. }) => assert_eq!(groups, vec!["a.io", "b.io"]),
            other => panic!("expected ambiguity, got {:?}", other),
        }
        let w = r.resolve("Widget", Some("a.io")).await.unwrap();
        assert_eq!(w.gvr.version, "v1beta1");
        assert!(!w.namespaced);
    }

    #[tokio::test]
    async fn unknown_kind_is_unsupported() {
        let b = MockBackend::new();
        let r = resolver(&b);
        assert!(matches!(r.resolve("Gadget", None).await, Err(TetherError::UnsupportedResource(_))));
        assert!(matches!(r.resolve("  ", None).await, Err(TetherError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn rediscover_picks_up_new_kinds() {
        let b = MockBackend::new();
        let r = resolver(&b);
        r.resolve("Pod", None).await.unwrap();
        let b = b.with_resource(ResolvedKind::builtin("Lease", Gvr::new("coordination.k8s.io", "v1", "leases"), true));
        assert!(r.resolve("Lease", None).await.is_err());
        r.rediscover().await.unwrap();
        assert_eq!(r.resolve("Lease", None).await.unwrap().gvr.group, "coordination.k8s.io");
        assert_eq!(b.discoveries(), 2);
    }
}
