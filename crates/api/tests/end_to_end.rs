#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_api::*;
use tether_kubehub::mock::{MockBackend, MockConnector};

const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: a
  cluster:
    server: https://a.example.com
- name: b
  cluster:
    server: https://b.example.com
contexts:
- name: ctx-a
  context:
    cluster: a
    user: u
- name: ctx-b
  context:
    cluster: b
    user: u
users:
- name: u
  user:
    token: t
"#;

fn widget() -> ResolvedKind {
    ResolvedKind {
        kind: "Widget".into(),
        gvr: tether_core::Gvr::new("example.io", "v1", "widgets"),
        namespaced: true,
        source: tether_core::KindSource::Crd,
    }
}

async fn connected(backend: MockBackend) -> (Tether, MockConnector, ClusterId) {
    let connector = MockConnector::new(backend);
    let tether = Tether::new(Arc::new(connector.clone()));
    let id = tether.register_cluster(ClusterConfig::from_kubeconfig("home.yaml", "kind-dev", "")).unwrap();
    tether.connect(&id).await.unwrap();
    (tether, connector, id)
}

#[tokio::test]
async fn crd_list_example() {
    let backend = MockBackend::new().with_crd("example.io", "v1", "Widget", "widgets", true);
    backend.insert_object(&widget(), Some("default"), json!({"metadata": {"name": "first", "creationTimestamp": "2024-01-01T10:00:00Z"}}));
    backend.insert_object(&widget(), Some("default"), json!({"metadata": {"name": "second", "creationTimestamp": "2024-01-02T10:00:00Z"}}));
    let (tether, _c, id) = connected(backend).await;

    let resolved = tether.resolve(&id, "Widget", None).await.unwrap();
    assert_eq!(resolved.gvr.resource, "widgets");
    assert!(resolved.namespaced);

    let req = ResourceRequest::list(id.clone(), "Widget").namespace("default");
    let items = tether.execute(req).await.unwrap().into_list().unwrap();
    let names: Vec<_> = items.iter().map(|w| w["metadata"]["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["second", "first"]);
}

#[tokio::test]
async fn kubeconfig_contexts_register_and_connect_independently() {
    let up = MockBackend::new();
    let down = MockBackend::new();
    down.set_reachable(false);
    let connector = MockConnector::new(up).with_cluster(ClusterId::new("work.yaml", "ctx-b"), down);
    let tether = Tether::new(Arc::new(connector));

    let ids = tether.register_kubeconfig("work.yaml", KUBECONFIG).unwrap();
    assert_eq!(ids.len(), 2);
    // registering twice skips known contexts
    assert!(tether.register_kubeconfig("work.yaml", KUBECONFIG).unwrap().is_empty());

    let results = tether.connect_all().await;
    let ok: Vec<_> = results.iter().map(|(id, r)| (id.context.as_str(), r.is_ok())).collect();
    assert_eq!(ok, vec![("ctx-a", true), ("ctx-b", false)]);

    let list = tether.list_clusters();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1].status, ClusterStatus::Failed);
    assert!(list[1].last_error.is_some());
}

#[tokio::test]
async fn dispatch_requires_a_connection() {
    let connector = MockConnector::new(MockBackend::new());
    let tether = Tether::new(Arc::new(connector));
    let id = tether.register_cluster(ClusterConfig::from_kubeconfig("home.yaml", "kind-dev", "")).unwrap();
    let err = tether.execute(ResourceRequest::list(id.clone(), "Pod")).await.unwrap_err();
    assert!(matches!(err, TetherError::NotConnected(_)));

    tether.connect(&id).await.unwrap();
    tether.execute(ResourceRequest::list(id.clone(), "Pod")).await.unwrap();
    tether.disconnect(&id).await.unwrap();
    assert!(matches!(tether.execute(ResourceRequest::list(id, "Pod")).await, Err(TetherError::NotConnected(_))));
}

#[tokio::test(start_paused = true)]
async fn outage_and_recovery_end_to_end() {
    let backend = MockBackend::new();
    let mut cfg = ClusterConfig::from_kubeconfig("home.yaml", "kind-dev", "");
    cfg.health.heartbeat_interval = Duration::from_secs(5);
    cfg.health.failure_threshold = 2;
    let connector = MockConnector::new(backend.clone());
    let tether = Tether::new(Arc::new(connector));
    let id = tether.register_cluster(cfg).unwrap();
    tether.connect(&id).await.unwrap();

    backend.set_reachable(false);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(!tether.is_connected(&id));
    assert!(matches!(tether.execute(ResourceRequest::list(id.clone(), "Pod")).await, Err(TetherError::NotConnected(_))));

    backend.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(tether.is_connected(&id));
    let st = tether.cluster_status(&id).unwrap();
    assert!(st.heartbeat_active);
    assert!(!st.reconnect_active);
    tether.execute(ResourceRequest::list(id, "Pod")).await.unwrap();
}

#[tokio::test]
async fn interceptor_chain_shared_across_clusters() {
    let backend = MockBackend::new();
    let (tether, _c, id) = connected(backend).await;
    tether
        .register_interceptor(
            OperationType::Delete,
            "protect-kube-system",
            interceptor_fn(|st: &mut ResourceStatement| {
                if st.namespace.as_deref() == Some("kube-system") {
                    return Err(TetherError::InvalidRequest("kube-system is protected".into()).into());
                }
                Ok(())
            }),
            RegisterOptions::default().before(WILDCARD),
        )
        .unwrap();
    assert_eq!(tether.interceptor_order(OperationType::Delete), vec!["protect-kube-system", "dispatch"]);

    let err = tether.execute(ResourceRequest::delete(id.clone(), "Pod", "coredns").namespace("kube-system")).await.unwrap_err();
    // typed errors raised by interceptors come back unchanged
    assert!(matches!(err, TetherError::InvalidRequest(ref m) if m == "kube-system is protected"));

    tether.remove_interceptor(OperationType::Delete, "protect-kube-system").unwrap();
    assert_eq!(tether.interceptor_order(OperationType::Delete), vec!["dispatch"]);
}

#[tokio::test]
async fn apply_yaml_creates_then_updates() {
    let (tether, connector, id) = connected(MockBackend::new()).await;
    let yaml = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: apps
data:
  mode: blue
---
apiVersion: v1
kind: Namespace
metadata:
  name: apps
"#;
    let out = tether.apply_yaml(&id, yaml).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(connector.backend().object_count(), 2);

    let again = tether.apply_yaml(&id, &yaml.replace("blue", "green")).await.unwrap();
    let cm = again.into_iter().next().and_then(Output::into_object).unwrap();
    assert_eq!(cm["data"]["mode"], "green");
    assert_eq!(connector.backend().object_count(), 2);
}

#[tokio::test]
async fn records_from_persistence_register() {
    let connector = MockConnector::new(MockBackend::new());
    let tether = Tether::new(Arc::new(connector));
    let rec: ClusterRecord = serde_json::from_value(json!({
        "file_name": "saved.yaml",
        "context_name": "prod",
        "kubeconfig": "apiVersion: v1\nkind: Config\n",
        "qps": 50.0
    }))
    .unwrap();
    let id = tether.register_record(rec).unwrap();
    assert_eq!(id.to_string(), "saved.yaml/prod");
    assert_eq!(tether.registry().cluster_config(&id).unwrap().client.qps, 50.0);
}

#[tokio::test]
async fn rediscover_counts_kinds() {
    let backend = MockBackend::new();
    let (tether, _c, id) = connected(backend.clone()).await;
    assert_eq!(tether.rediscover(&id).await.unwrap(), 4);
    assert_eq!(backend.discoveries(), 1);
}
