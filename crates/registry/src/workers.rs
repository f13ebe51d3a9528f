//! Per-cluster background workers and the handle map that keeps at most one of each kind alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{ClusterId, ClusterStatus, TetherError};

use crate::{ClusterEvent, Inner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum WorkerKind {
    Heartbeat,
    Reconnect,
    /// Delayed reconnect after a tunables update.
    Retune,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Heartbeat, WorkerKind::Reconnect, WorkerKind::Retune];
}

pub(crate) struct WorkerHandle {
    pub token: CancellationToken,
    pub generation: u64,
}

/// Doubling delay, capped. No jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self { next: initial.min(cap), cap }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        d
    }
}

impl Inner {
    /// Store a new handle for `(id, kind)`, cancelling whatever it replaces. Returns its generation.
    pub(crate) fn install_worker(&self, id: &ClusterId, kind: WorkerKind, token: CancellationToken) -> u64 {
        let generation = self.next_generation();
        let prev = self.workers().insert((id.clone(), kind), WorkerHandle { token, generation });
        if let Some(prev) = prev {
            debug!(cluster = %id, worker = ?kind, "superseding running worker");
            prev.token.cancel();
        }
        generation
    }

    /// Remove and cancel. Returns whether a worker was running.
    pub(crate) fn stop_worker(&self, id: &ClusterId, kind: WorkerKind) -> bool {
        match self.workers().remove(&(id.clone(), kind)) {
            Some(h) => {
                h.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Compare-and-delete: a finishing worker removes its own handle, never a successor's.
    pub(crate) fn release_worker(&self, id: &ClusterId, kind: WorkerKind, generation: u64) {
        let mut workers = self.workers();
        let key = (id.clone(), kind);
        if workers.get(&key).map(|h| h.generation) == Some(generation) {
            workers.remove(&key);
        }
    }

    pub(crate) fn worker_active(&self, id: &ClusterId, kind: WorkerKind) -> bool {
        self.workers().contains_key(&(id.clone(), kind))
    }

    /// Swap the heartbeat of `generation` for a fresh reconnect handle under one lock. `None`
    /// when that heartbeat was already stopped or superseded.
    pub(crate) fn hand_over(&self, id: &ClusterId, generation: u64) -> Option<(CancellationToken, u64)> {
        let mut workers = self.workers();
        let key = (id.clone(), WorkerKind::Heartbeat);
        if workers.get(&key).map(|h| h.generation) != Some(generation) {
            return None;
        }
        workers.remove(&key);
        let token = self.shutdown.child_token();
        let next = self.next_generation();
        if let Some(prev) = workers.insert((id.clone(), WorkerKind::Reconnect), WorkerHandle { token: token.clone(), generation: next }) {
            prev.token.cancel();
        }
        Some((token, next))
    }
}

pub(crate) fn spawn_heartbeat(inner: &Arc<Inner>, id: &ClusterId) {
    let token = inner.shutdown.child_token();
    let generation = inner.install_worker(id, WorkerKind::Heartbeat, token.clone());
    tokio::spawn(heartbeat_loop(Arc::downgrade(inner), id.clone(), token, generation));
}

pub(crate) fn spawn_reconnect(inner: &Arc<Inner>, id: &ClusterId) {
    let token = inner.shutdown.child_token();
    let generation = inner.install_worker(id, WorkerKind::Reconnect, token.clone());
    inner.emit(ClusterEvent::ReconnectStarted { id: id.clone() });
    tokio::spawn(reconnect_loop(Arc::downgrade(inner), id.clone(), token, generation));
}

pub(crate) fn spawn_retune(inner: &Arc<Inner>, id: &ClusterId, delay: Duration) {
    let token = inner.shutdown.child_token();
    let generation = inner.install_worker(id, WorkerKind::Retune, token.clone());
    tokio::spawn(retune_task(Arc::downgrade(inner), id.clone(), token, generation, delay));
}

async fn heartbeat_loop(weak: Weak<Inner>, id: ClusterId, token: CancellationToken, generation: u64) {
    let Some(period) = weak.upgrade().and_then(|i| i.entry(&id).ok()).map(|e| e.health().heartbeat_interval) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(cluster = %id, every_ms = %period.as_millis(), "heartbeat started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        let Ok(entry) = inner.entry(&id) else { break };
        let health = entry.health();
        let backend = entry.backend();
        let probe_timeout = entry.client_timeout();

        let result = match backend {
            None => Err(TetherError::NotConnected(id.clone())),
            Some(b) => tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = timeout(probe_timeout, b.server_version()) => r.unwrap_or_else(|_| {
                    Err(TetherError::Connection { cluster: id.clone(), message: format!("probe timed out after {}s", probe_timeout.as_secs()) })
                }),
            },
        };

        match result {
            Ok(version) => {
                counter!("heartbeat_ok_total", 1u64, "cluster" => id.to_string());
                entry.record_probe(true, health.history_capacity, None);
                entry.set_server_version(version);
            }
            Err(e) => {
                counter!("heartbeat_fail_total", 1u64, "cluster" => id.to_string());
                let consecutive = entry.record_probe(false, health.history_capacity, Some(e.to_string()));
                warn!(cluster = %id, consecutive, threshold = health.failure_threshold, error = %e, "heartbeat failed");
                inner.emit(ClusterEvent::HeartbeatFailed { id: id.clone(), consecutive });
                if consecutive >= health.failure_threshold {
                    if token.is_cancelled() {
                        break;
                    }
                    inner.heartbeat_tripped(&id, generation);
                    return;
                }
            }
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.release_worker(&id, WorkerKind::Heartbeat, generation);
    }
    debug!(cluster = %id, "heartbeat stopped");
}

impl Inner {
    /// Threshold reached: drop the connection, go Disconnected and hand over to a reconnect worker.
    fn heartbeat_tripped(self: &Arc<Self>, id: &ClusterId, generation: u64) {
        let Ok(entry) = self.entry(id) else { return };
        let Some((token, next)) = self.hand_over(id, generation) else {
            debug!(cluster = %id, "heartbeat stopped before tripping");
            return;
        };
        counter!("cluster_disconnects_total", 1u64, "cluster" => id.to_string());
        entry.drop_connection();
        self.transition(&entry, ClusterStatus::Disconnected);
        info!(cluster = %id, "heartbeat threshold reached; reconnecting");
        self.emit(ClusterEvent::ReconnectStarted { id: id.clone() });
        tokio::spawn(reconnect_loop(Arc::downgrade(self), id.clone(), token, next));
    }
}

async fn reconnect_loop(weak: Weak<Inner>, id: ClusterId, token: CancellationToken, generation: u64) {
    let Some(health) = weak.upgrade().and_then(|i| i.entry(&id).ok()).map(|e| e.health()) else {
        return;
    };
    let mut backoff = Backoff::new(health.backoff_initial, health.backoff_max);
    let max = health.max_reconnect_attempts;

    for attempt in 1..=max {
        if token.is_cancelled() {
            return;
        }
        let Some(inner) = weak.upgrade() else { return };
        if inner.is_connected(&id) {
            debug!(cluster = %id, attempt, "already connected; reconnect done");
            inner.release_worker(&id, WorkerKind::Reconnect, generation);
            return;
        }

        counter!("reconnect_attempts_total", 1u64, "cluster" => id.to_string());
        inner.stop_worker(&id, WorkerKind::Heartbeat);
        if let Ok(entry) = inner.entry(&id) {
            entry.drop_connection();
        }
        match inner.connect(&id, Some(&token)).await {
            Err(TetherError::Cancelled) => return,
            Ok(()) => {
                info!(cluster = %id, attempt, "reconnected");
                inner.emit(ClusterEvent::ReconnectSucceeded { id: id.clone(), attempt });
                inner.release_worker(&id, WorkerKind::Reconnect, generation);
                return;
            }
            Err(e) => warn!(cluster = %id, attempt, max, error = %e, "reconnect attempt failed"),
        }
        drop(inner);

        if attempt == max {
            break;
        }
        let delay = backoff.next_delay();
        debug!(cluster = %id, delay_ms = %delay.as_millis(), "reconnect backoff");
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }

    let Some(inner) = weak.upgrade() else { return };
    if token.is_cancelled() {
        return;
    }
    counter!("reconnect_exhausted_total", 1u64, "cluster" => id.to_string());
    if let Ok(entry) = inner.entry(&id) {
        entry.set_last_error(TetherError::ReconnectExhausted { cluster: id.clone(), attempts: max }.to_string());
        inner.transition(&entry, ClusterStatus::Disconnected);
    }
    warn!(cluster = %id, attempts = max, "reconnect gave up");
    inner.emit(ClusterEvent::ReconnectExhausted { id: id.clone(), attempts: max });
    inner.release_worker(&id, WorkerKind::Reconnect, generation);
}

async fn retune_task(weak: Weak<Inner>, id: ClusterId, token: CancellationToken, generation: u64, delay: Duration) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = sleep(delay) => {}
    }
    let Some(inner) = weak.upgrade() else { return };
    info!(cluster = %id, "applying new client tunables");
    inner.teardown(&id, Some(WorkerKind::Retune)).await;
    match inner.connect(&id, Some(&token)).await {
        Ok(()) | Err(TetherError::Cancelled) => {}
        Err(e) => {
            warn!(cluster = %id, error = %e, "reconnect with new tunables failed");
            if !token.is_cancelled() && !inner.shutdown.is_cancelled() {
                spawn_reconnect(&inner, &id);
            }
        }
    }
    inner.release_worker(&id, WorkerKind::Retune, generation);
}
