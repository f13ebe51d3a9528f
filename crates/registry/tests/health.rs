#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tether_core::{ClientTunables, ClusterConfig, ClusterId, ClusterStatus, HealthTunables, TetherError, TetherResult};
use tether_kubehub::mock::{MockBackend, MockConnector};
use tether_kubehub::{ClusterBackend, Connector};
use tether_registry::{ClusterEvent, ClusterRegistry, WorkerKind};
use tokio::sync::broadcast::Receiver;
use tokio::time::sleep;

fn health() -> HealthTunables {
    HealthTunables {
        heartbeat_interval: Duration::from_secs(10),
        failure_threshold: 3,
        history_capacity: 10,
        backoff_initial: Duration::from_secs(1),
        backoff_max: Duration::from_secs(4),
        max_reconnect_attempts: 4,
        retune_delay: Duration::from_secs(1),
    }
}

fn setup() -> (ClusterRegistry, MockConnector, ClusterId) {
    let connector = MockConnector::new(MockBackend::new());
    let registry = ClusterRegistry::new(Arc::new(connector.clone()));
    let id = registry.register(ClusterConfig::from_kubeconfig("test.yaml", "kind-test", "").with_health(health())).unwrap();
    (registry, connector, id)
}

/// Takes `delay` to build every backend.
struct SlowConnector {
    inner: MockConnector,
    delay: Duration,
}

#[async_trait::async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, config: &ClusterConfig) -> TetherResult<Arc<dyn ClusterBackend>> {
        sleep(self.delay).await;
        self.inner.connect(config).await
    }

    fn endpoint(&self, config: &ClusterConfig) -> TetherResult<Option<String>> {
        self.inner.endpoint(config)
    }
}

fn setup_slow(delay: Duration) -> (ClusterRegistry, MockConnector, ClusterId) {
    let connector = MockConnector::new(MockBackend::new());
    let registry = ClusterRegistry::new(Arc::new(SlowConnector { inner: connector.clone(), delay }));
    let id = registry.register(ClusterConfig::from_kubeconfig("test.yaml", "kind-test", "").with_health(health())).unwrap();
    (registry, connector, id)
}

fn drain(rx: &mut Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn threshold_trips_exactly_once_and_starts_reconnect() {
    let (registry, connector, id) = setup();
    registry.connect(&id).await.unwrap();
    assert!(registry.is_connected(&id));
    let mut rx = registry.subscribe();

    connector.backend().set_reachable(false);
    sleep(Duration::from_secs(29)).await;
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.status, ClusterStatus::Connected);
    assert_eq!(st.consecutive_failures, 2);

    // third failure at t=30, first reconnect attempt right after
    sleep(Duration::from_millis(1500)).await;
    let events = drain(&mut rx);
    let disconnects = events
        .iter()
        .filter(|e| matches!(e, ClusterEvent::StatusChanged { from: ClusterStatus::Connected, to: ClusterStatus::Disconnected, .. }))
        .count();
    let reconnects = events.iter().filter(|e| matches!(e, ClusterEvent::ReconnectStarted { .. })).count();
    assert_eq!(disconnects, 1, "{events:?}");
    assert_eq!(reconnects, 1, "{events:?}");
    assert!(connector.connects() >= 2);

    let st = registry.cluster_status(&id).unwrap();
    assert!(!st.heartbeat_active);
    assert!(st.reconnect_active);
    assert_ne!(st.status, ClusterStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn success_resets_failure_count() {
    let (registry, connector, id) = setup();
    registry.connect(&id).await.unwrap();

    connector.backend().set_reachable(false);
    sleep(Duration::from_secs(21)).await;
    assert_eq!(registry.cluster_status(&id).unwrap().consecutive_failures, 2);

    connector.backend().set_reachable(true);
    sleep(Duration::from_secs(10)).await;
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.consecutive_failures, 0);
    assert!(st.heartbeat_history.last().unwrap().success);

    connector.backend().set_reachable(false);
    sleep(Duration::from_secs(20)).await;
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.consecutive_failures, 2);
    assert_eq!(st.status, ClusterStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn restarting_heartbeat_keeps_a_single_worker() {
    let (registry, connector, id) = setup();
    registry.connect(&id).await.unwrap();
    registry.start_heartbeat(&id).unwrap();
    registry.start_heartbeat(&id).unwrap();
    assert_eq!(registry.active_workers(&id), vec![WorkerKind::Heartbeat]);

    sleep(Duration::from_secs(31)).await;
    // one probe while connecting, then one per tick
    assert_eq!(connector.backend().probes(), 4);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    let mut rx = registry.subscribe();

    registry.start_reconnect(&id).unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.connects(), 4);
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.status, ClusterStatus::Disconnected);
    assert!(!st.reconnect_active);
    assert!(st.last_error.unwrap().contains("gave up after 4 attempts"));
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ClusterEvent::ReconnectExhausted { attempts: 4, .. })));
}

#[tokio::test(start_paused = true)]
async fn restarting_reconnect_supersedes_the_running_loop() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    let mut rx = registry.subscribe();

    registry.start_reconnect(&id).unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.connects(), 1);
    registry.start_reconnect(&id).unwrap();
    assert_eq!(registry.active_workers(&id), vec![WorkerKind::Reconnect]);

    sleep(Duration::from_secs(60)).await;
    // the first loop never retries; the second runs its own four attempts
    assert_eq!(connector.connects(), 5);
    assert!(registry.active_workers(&id).is_empty());
    let exhausted = drain(&mut rx).iter().filter(|e| matches!(e, ClusterEvent::ReconnectExhausted { .. })).count();
    assert_eq!(exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_between_attempts() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    registry.start_reconnect(&id).unwrap();

    // attempts at t=0, 1, 3, 7
    sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.connects(), 1);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.connects(), 2);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.connects(), 3);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.connects(), 3);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.connects(), 4);
}

#[tokio::test(start_paused = true)]
async fn reconnect_stops_once_attempt_succeeds() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    let mut rx = registry.subscribe();
    registry.start_reconnect(&id).unwrap();

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(connector.connects(), 2);
    connector.backend().set_reachable(true);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(connector.connects(), 3);
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.status, ClusterStatus::Connected);
    assert!(!st.reconnect_active);
    assert!(st.heartbeat_active);
    assert!(drain(&mut rx).iter().any(|e| matches!(e, ClusterEvent::ReconnectSucceeded { attempt: 3, .. })));
}

#[tokio::test(start_paused = true)]
async fn reconnect_exits_when_connected_elsewhere() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    registry.start_reconnect(&id).unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(connector.connects(), 2);

    connector.backend().set_reachable(true);
    registry.connect(&id).await.unwrap();
    assert_eq!(connector.connects(), 3);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.connects(), 3);
    assert!(!registry.cluster_status(&id).unwrap().reconnect_active);
}

#[tokio::test(start_paused = true)]
async fn stopping_is_idempotent() {
    let (registry, _connector, id) = setup();
    assert!(!registry.stop_heartbeat(&id));
    assert!(!registry.stop_reconnect(&id));
    registry.connect(&id).await.unwrap();
    assert!(registry.stop_heartbeat(&id));
    assert!(!registry.stop_heartbeat(&id));
    registry.disconnect(&id).await.unwrap();
    registry.disconnect(&id).await.unwrap();
    assert_eq!(registry.cluster_status(&id).unwrap().status, ClusterStatus::Disconnected);
    assert!(registry.active_workers(&id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_connect_leaves_no_worker_behind() {
    let (registry, connector, id) = setup_slow(Duration::from_secs(5));
    let pending = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.connect(&id).await })
    };
    sleep(Duration::from_secs(1)).await;
    registry.disconnect(&id).await.unwrap();
    pending.await.unwrap().unwrap();

    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.status, ClusterStatus::Disconnected);
    assert!(registry.active_workers(&id).is_empty());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(registry.cluster_status(&id).unwrap().status, ClusterStatus::Disconnected);
    assert!(registry.active_workers(&id).is_empty());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_attempt_stays_disconnected() {
    let (registry, connector, id) = setup_slow(Duration::from_secs(5));
    connector.backend().set_reachable(false);
    registry.start_reconnect(&id).unwrap();

    // second attempt starts at t=6 and is still building its backend at t=8
    sleep(Duration::from_secs(8)).await;
    assert_eq!(connector.connects(), 1);
    connector.backend().set_reachable(true);
    registry.disconnect(&id).await.unwrap();

    sleep(Duration::from_secs(60)).await;
    assert_eq!(registry.cluster_status(&id).unwrap().status, ClusterStatus::Disconnected);
    assert!(registry.active_workers(&id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_after_shutdown_is_refused() {
    let (registry, connector, id) = setup();
    registry.shutdown();

    assert!(matches!(registry.connect(&id).await, Err(TetherError::ShutDown)));
    assert!(matches!(registry.start_heartbeat(&id), Err(TetherError::ShutDown)));
    assert!(matches!(registry.start_reconnect(&id), Err(TetherError::ShutDown)));
    assert_eq!(connector.connects(), 0);
    assert_eq!(registry.cluster_status(&id).unwrap().status, ClusterStatus::Disconnected);
    registry.disconnect(&id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn tunables_updates_are_debounced() {
    let (registry, connector, id) = setup();
    registry.connect(&id).await.unwrap();
    assert_eq!(connector.connects(), 1);

    for timeout_secs in [10, 20, 30] {
        let t = ClientTunables { timeout_secs, ..Default::default() };
        registry.update_cluster_tunables(&id, t).unwrap();
        sleep(Duration::from_millis(200)).await;
    }
    sleep(Duration::from_secs(2)).await;

    assert_eq!(connector.connects(), 2);
    assert!(registry.is_connected(&id));
    assert_eq!(registry.cluster_config(&id).unwrap().client.timeout_secs, 30);
    assert_eq!(registry.active_workers(&id), vec![WorkerKind::Heartbeat]);
}

#[tokio::test(start_paused = true)]
async fn tunables_on_disconnected_cluster_do_not_reconnect() {
    let (registry, connector, id) = setup();
    registry.update_cluster_tunables(&id, ClientTunables { proxy_url: Some("http://proxy:3128".into()), ..Default::default() }).unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.connects(), 0);
    let bad = ClientTunables { qps: 0.0, ..Default::default() };
    assert!(matches!(registry.update_cluster_tunables(&id, bad), Err(TetherError::InvalidConfig(_))));
}

#[tokio::test]
async fn failed_connect_is_recorded() {
    let (registry, connector, id) = setup();
    connector.backend().set_reachable(false);
    let err = registry.connect(&id).await.unwrap_err();
    assert!(matches!(err, TetherError::Connection { .. }));
    let st = registry.cluster_status(&id).unwrap();
    assert_eq!(st.status, ClusterStatus::Failed);
    assert!(st.last_error.is_some());
    assert!(st.heartbeat_history.is_empty());
}

#[tokio::test]
async fn registration_errors() {
    let (registry, _connector, id) = setup();
    let dup = ClusterConfig::from_kubeconfig("test.yaml", "kind-test", "");
    assert!(matches!(registry.register(dup), Err(TetherError::AlreadyRegistered(_))));
    let ghost = ClusterId::new("x", "y");
    assert!(matches!(registry.connect(&ghost).await, Err(TetherError::UnknownCluster(_))));
    assert!(registry.cluster_status(&ghost).is_err());

    registry.remove(&id).await.unwrap();
    assert!(registry.list_clusters().is_empty());
}

#[tokio::test]
async fn disconnected_clusters_stay_listed() {
    let connector = MockConnector::new(MockBackend::new());
    let registry = ClusterRegistry::new(Arc::new(connector.clone()));
    for ctx in ["b", "a"] {
        registry.register(ClusterConfig::from_kubeconfig("f.yaml", ctx, "")).unwrap();
    }
    registry.connect(&ClusterId::new("f.yaml", "a")).await.unwrap();
    let list = registry.list_clusters();
    let summary: Vec<_> = list.iter().map(|s| (s.id.context.as_str(), s.status)).collect();
    assert_eq!(summary, vec![("a", ClusterStatus::Connected), ("b", ClusterStatus::Disconnected)]);
    assert_eq!(list[0].endpoint.as_deref(), Some("mock://f.yaml/a"));
}
