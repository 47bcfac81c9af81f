//! The Load Balancer: a dual-ROUTER proxy that couples JSON
//! clients to DEALER-connected workers, tracking worker availability and
//! in-flight request routing.
//!
//! Backend traffic is always drained before frontend traffic on each tick:
//! a worker freed by a backend reply must be visible to the very next
//! frontend assignment in the same iteration, or it sits idle needlessly
//! until the next poll.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

use crate::envelope::{ServiceRequest, ServiceResponse};
use crate::error::TacoreError;
use crate::metrics::MetricsCollector;
use crate::store::Store;
use crate::transport::Transport;

const REGISTER: &[u8] = b"REGISTER";
const HEARTBEAT: &[u8] = b"HEARTBEAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Unhealthy,
}

impl WorkerState {
    fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerInfo {
    /// The raw ROUTER-observed identity for this worker's current DEALER
    /// connection. The application-level `worker_id` (carried in the
    /// REGISTER/HEARTBEAT JSON payload) is the stable key; this identity is
    /// only the current routing address and is refreshed on every control
    /// frame, so a worker reconnecting with a new DEALER socket is still
    /// reachable under the same `worker_id`.
    identity: Bytes,
    state: WorkerState,
    last_heartbeat: Instant,
    processed_requests: u64,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    client_id: Bytes,
    expects_empty: bool,
    method: String,
}

/// Mutable broker state, owned exclusively by the single scheduler loop
/// so no additional locking is required around it.
#[derive(Default)]
struct BrokerState {
    workers: HashMap<String, WorkerInfo>,
    available: VecDeque<String>,
    pending_requests: HashMap<String, PendingRequest>,
    pending_assignments: HashMap<String, String>,
}

impl BrokerState {
    fn register_worker(&mut self, worker_id: &str, identity: Bytes) {
        let is_new = !self.workers.contains_key(worker_id);
        self.workers.insert(
            worker_id.to_string(),
            WorkerInfo {
                identity,
                state: WorkerState::Idle,
                last_heartbeat: Instant::now(),
                processed_requests: 0,
            },
        );
        if !self.available.contains(&worker_id.to_string()) {
            self.available.push_back(worker_id.to_string());
        }
        if is_new {
            info!(worker_id, "worker registered");
        } else {
            debug!(worker_id, "duplicate REGISTER, idempotent");
        }
    }

    fn heartbeat(&mut self, worker_id: &str, identity: Bytes, processed_requests: Option<u64>) {
        match self.workers.get_mut(worker_id) {
            Some(info) => {
                info.identity = identity;
                info.last_heartbeat = Instant::now();
                if let Some(n) = processed_requests {
                    info.processed_requests = n;
                }
            }
            None => warn!(worker_id, "heartbeat from unregistered worker"),
        }
    }

    fn identity_of(&self, worker_id: &str) -> Option<Bytes> {
        self.workers.get(worker_id).map(|w| w.identity.clone())
    }

    fn assign_next(&mut self) -> Option<String> {
        let worker_id = self.available.pop_front()?;
        if let Some(info) = self.workers.get_mut(&worker_id) {
            info.state = WorkerState::Busy;
            info.processed_requests += 1;
        }
        Some(worker_id)
    }

    fn release_to_idle(&mut self, worker_id: &str) {
        if let Some(info) = self.workers.get_mut(worker_id) {
            if info.state != WorkerState::Unhealthy {
                info.state = WorkerState::Idle;
                if !self.available.contains(&worker_id.to_string()) {
                    self.available.push_back(worker_id.to_string());
                }
            }
        } else {
            warn!(worker_id, "unknown worker returned from assignment");
        }
    }

    /// Remove workers whose heartbeat is older than `stale_threshold`.
    fn evict_stale(&mut self, stale_threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        for (id, info) in self.workers.iter_mut() {
            if info.state != WorkerState::Unhealthy
                && now.duration_since(info.last_heartbeat) > stale_threshold
            {
                info.state = WorkerState::Unhealthy;
                evicted.push(id.clone());
            }
        }
        for id in &evicted {
            self.available.retain(|w| w != id);
        }
        evicted
    }
}

/// The ROUTER/ROUTER load-balancing broker.
pub struct LoadBalancer {
    frontend: Mutex<RouterSocket>,
    backend: Mutex<RouterSocket>,
    state: Mutex<BrokerState>,
    store: Store,
    metrics: MetricsCollector,
    stale_threshold: Duration,
    shutdown: AtomicBool,
}

impl LoadBalancer {
    #[instrument(skip_all, fields(frontend = %frontend_transport, backend = %backend_transport))]
    pub async fn bind(
        frontend_transport: &Transport,
        backend_transport: &Transport,
        store: Store,
        metrics: MetricsCollector,
        stale_threshold: Duration,
    ) -> Result<Self, TacoreError> {
        let mut frontend = RouterSocket::new();
        frontend
            .bind(&frontend_transport.bind_endpoint())
            .await
            .map_err(TacoreError::Zmq)?;

        let mut backend = RouterSocket::new();
        backend
            .bind(&backend_transport.bind_endpoint())
            .await
            .map_err(TacoreError::Zmq)?;

        info!("load balancer bound");

        Ok(Self {
            frontend: Mutex::new(frontend),
            backend: Mutex::new(backend),
            state: Mutex::new(BrokerState::default()),
            store,
            metrics,
            stale_threshold,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Snapshot of worker state for the monitoring API.
    pub async fn worker_snapshot(&self) -> Vec<(String, WorkerState, u64)> {
        let state = self.state.lock().await;
        state
            .workers
            .iter()
            .map(|(id, info)| (id.clone(), info.state, info.processed_requests))
            .collect()
    }

    /// Main scheduler loop: poll both sockets, drain the
    /// backend completely, then drain the frontend completely, repeating
    /// until neither has pending events, then block again.
    ///
    /// The `select!` below only detects that *some* socket has a message
    /// ready — it does not decide processing order. `tokio::select!` picks
    /// pseudo-randomly among simultaneously-ready branches, so whichever
    /// branch resolves first is carried as a seed into the drain phase
    /// rather than dispatched immediately: the backend phase always runs to
    /// completion (consuming its seed message first, if it has one) before
    /// the frontend phase starts, so a response is always routed and its
    /// worker freed before that worker could be reassigned to a
    /// simultaneously-arrived frontend request.
    pub async fn run(&self) -> Result<(), TacoreError> {
        let poll_timeout = Duration::from_millis(1000);
        let drain_timeout = Duration::from_millis(0);

        while !self.shutdown.load(Ordering::SeqCst) {
            let woke = tokio::select! {
                r = tokio::time::timeout(poll_timeout, self.recv_backend()) => r.ok().map(|m| (true, m)),
                r = tokio::time::timeout(poll_timeout, self.recv_frontend()) => r.ok().map(|m| (false, m)),
            };

            let Some((from_backend, first)) = woke else {
                continue;
            };

            let (backend_seed, frontend_seed) = if from_backend { (first, None) } else { (None, first) };
            self.drain_backend(backend_seed, drain_timeout).await;
            self.drain_frontend(frontend_seed, drain_timeout).await;
        }

        info!("load balancer loop exiting");
        Ok(())
    }

    async fn recv_backend(&self) -> Option<ZmqMessage> {
        self.backend.lock().await.recv().await.ok()
    }

    async fn recv_frontend(&self) -> Option<ZmqMessage> {
        self.frontend.lock().await.recv().await.ok()
    }

    /// Handle `seed` (if any), then keep handling backend messages until the
    /// socket has nothing ready within `timeout`.
    async fn drain_backend(&self, seed: Option<ZmqMessage>, timeout: Duration) {
        if let Some(msg) = seed {
            self.handle_backend_message(msg).await;
        }
        loop {
            match tokio::time::timeout(timeout, self.recv_backend()).await {
                Ok(Some(msg)) => self.handle_backend_message(msg).await,
                _ => break,
            }
        }
    }

    /// Handle `seed` (if any), then keep handling frontend messages until
    /// the socket has nothing ready within `timeout`.
    async fn drain_frontend(&self, seed: Option<ZmqMessage>, timeout: Duration) {
        if let Some(msg) = seed {
            self.handle_frontend_message(msg).await;
        }
        loop {
            match tokio::time::timeout(timeout, self.recv_frontend()).await {
                Ok(Some(msg)) => self.handle_frontend_message(msg).await,
                _ => break,
            }
        }
    }

    /// Request ingress. ROUTER prepends the
    /// client identity; the remaining frame count tells us whether the
    /// client used a DEALER (explicit empty delimiter) or REQ-style socket.
    async fn handle_frontend_message(&self, msg: ZmqMessage) {
        let frames: Vec<Bytes> = msg.iter().cloned().collect();
        if frames.is_empty() {
            return;
        }
        let client_id = frames[0].clone();

        let (expects_empty, payload) = match frames.len() {
            2 => (false, frames[1].clone()),
            3 => (true, frames[2].clone()),
            n if n > 3 => {
                let expects_empty = frames[n - 2].is_empty();
                (expects_empty, frames[n - 1].clone())
            }
            _ => {
                warn!(frame_count = frames.len(), "malformed frontend frame, dropping");
                return;
            }
        };

        let request = match ServiceRequest::parse(&payload) {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "invalid request from client");
                let resp = ServiceResponse::from_error("unknown", &err);
                self.reply_to_client(&client_id, expects_empty, &resp).await;
                return;
            }
        };

        let request_id = request.request_id.clone();

        let mut state = self.state.lock().await;
        if state.available.is_empty() {
            drop(state);
            warn!(request_id = %request_id, "no workers available");
            let resp = ServiceResponse::error(&request_id, "no_workers", "No workers available");
            self.reply_to_client(&client_id, expects_empty, &resp).await;
            self.metrics
                .record_request(&request.method, false, 0, Some("no_workers"))
                .await;
            return;
        }

        let worker_id = state.assign_next().expect("checked non-empty above");
        let worker_identity = state
            .identity_of(&worker_id)
            .expect("assigned worker must be registered");
        state.pending_requests.insert(
            request_id.clone(),
            PendingRequest {
                client_id: client_id.clone(),
                expects_empty,
                method: request.method.clone(),
            },
        );
        state
            .pending_assignments
            .insert(request_id.clone(), worker_id.clone());
        drop(state);

        if let Ok(bytes) = serde_json::to_vec(&request) {
            let _ = self
                .store
                .log_request(
                    &request_id,
                    &request.method,
                    &String::from_utf8_lossy(&bytes),
                    &String::from_utf8_lossy(&client_id),
                    Some(&worker_id),
                )
                .await;
        }

        self.forward_to_worker(&worker_id, &worker_identity, &client_id, &payload).await;
    }

    /// Forward `[worker_identity, empty, client_id, empty, payload]` to the
    /// backend ROUTER; it strips `worker_identity` as routing identity and
    /// delivers `[empty, client_id, empty, payload]` to the worker's DEALER.
    /// `worker_identity` is the raw ZeroMQ identity the backend ROUTER
    /// observed for this worker's connection (tracked in `WorkerInfo`), not
    /// the application-level `worker_id` carried in the JSON envelope.
    async fn forward_to_worker(&self, worker_id: &str, worker_identity: &Bytes, client_id: &Bytes, payload: &[u8]) {
        let mut zmq_msg = ZmqMessage::from(worker_identity.to_vec());
        zmq_msg.push_back(Bytes::new());
        zmq_msg.push_back(client_id.clone());
        zmq_msg.push_back(Bytes::new());
        zmq_msg.push_back(Bytes::copy_from_slice(payload));

        let mut backend = self.backend.lock().await;
        if let Err(e) = backend.send(zmq_msg).await {
            warn!(error = %e, worker_id, "failed to forward request to worker");
        }
    }

    async fn reply_to_client(&self, client_id: &Bytes, expects_empty: bool, response: &ServiceResponse) {
        let Ok(payload) = response.to_bytes() else {
            return;
        };
        let mut zmq_msg = ZmqMessage::from(client_id.to_vec());
        if expects_empty {
            zmq_msg.push_back(Bytes::new());
        }
        zmq_msg.push_back(Bytes::from(payload));

        let mut frontend = self.frontend.lock().await;
        if let Err(e) = frontend.send(zmq_msg).await {
            warn!(error = %e, "failed to send response to client");
        }
    }

    /// Backend message classification: REGISTER/HEARTBEAT
    /// control frames, or a worker response to route back to its client.
    async fn handle_backend_message(&self, msg: ZmqMessage) {
        let frames: Vec<Bytes> = msg.iter().cloned().collect();
        if frames.is_empty() {
            return;
        }
        let identity = frames[0].clone();

        let mut idx = 1;
        if frames.len() > idx && frames[idx].is_empty() {
            idx += 1;
        }

        if idx < frames.len() && (frames[idx].as_ref() == REGISTER || frames[idx].as_ref() == HEARTBEAT) {
            self.handle_control_frame(&identity, &frames, idx).await;
            return;
        }

        self.handle_worker_response(&identity, &frames, idx).await;
    }

    async fn handle_control_frame(&self, identity: &Bytes, frames: &[Bytes], idx: usize) {
        let control = frames[idx].clone();
        let payload: Option<Value> = frames.get(idx + 1).and_then(|b| serde_json::from_slice(b).ok());

        let worker_id = if !identity.is_empty() {
            String::from_utf8_lossy(identity).to_string()
        } else {
            payload
                .as_ref()
                .and_then(|p| p.get("worker_id"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        if control.as_ref() == REGISTER {
            let mut state = self.state.lock().await;
            state.register_worker(&worker_id, identity.clone());
            drop(state);
            let _ = self.store.upsert_worker(&worker_id, "idle", Some(0), None, None).await;
        } else {
            let processed = payload
                .as_ref()
                .and_then(|p| p.get("processed_requests"))
                .and_then(Value::as_u64);
            let cpu = payload.as_ref().and_then(|p| p.get("cpu_usage")).and_then(Value::as_f64);
            let mem = payload.as_ref().and_then(|p| p.get("memory_usage")).and_then(Value::as_f64);

            let mut state = self.state.lock().await;
            state.heartbeat(&worker_id, identity.clone(), processed);
            let current_state = state
                .workers
                .get(&worker_id)
                .map(|w| w.state.as_str())
                .unwrap_or("idle");
            drop(state);

            let _ = self
                .store
                .upsert_worker(&worker_id, current_state, processed.map(|n| n as i64), cpu, mem)
                .await;
            self.metrics
                .record_worker_activity(&worker_id, processed.unwrap_or(0))
                .await;
        }
    }

    async fn handle_worker_response(&self, _worker_identity: &Bytes, frames: &[Bytes], idx: usize) {
        let rest = &frames[idx.min(frames.len())..];
        let Some(payload) = rest.last() else {
            warn!("empty backend response, dropping");
            return;
        };

        let response: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to decode worker response");
                return;
            }
        };

        let request_id = response.get("request_id").and_then(Value::as_str).map(str::to_string);
        let status = response.get("status").and_then(Value::as_str).unwrap_or("error").to_string();
        let error_type = response.get("type").and_then(Value::as_str).map(str::to_string);

        let (client_id, expects_empty, method) = {
            let mut state = self.state.lock().await;

            // request_id → pending_requests is authoritative; the
            // frame-carried client_id (when present) is only a fallback.
            let from_pending = request_id
                .as_ref()
                .and_then(|id| state.pending_requests.remove(id));

            let resolved = from_pending.or_else(|| {
                if rest.len() >= 2 {
                    Some(PendingRequest {
                        client_id: rest[0].clone(),
                        expects_empty: rest.len() >= 3 && rest[1].is_empty(),
                        method: "unknown".to_string(),
                    })
                } else {
                    None
                }
            });

            if let Some(request_id) = &request_id {
                if let Some(assigned_worker) = state.pending_assignments.remove(request_id) {
                    state.release_to_idle(&assigned_worker);
                } else {
                    warn!(request_id, "response for unknown assignment, worker not returned to pool");
                }
            }

            match resolved {
                Some(p) => (Some(p.client_id), p.expects_empty, p.method),
                None => (None, false, "unknown".to_string()),
            }
        };

        let Some(client_id) = client_id else {
            warn!(request_id = ?request_id, "response dropped: no client_id resolvable");
            return;
        };

        let Ok(payload_bytes) = serde_json::to_vec(&response) else {
            return;
        };
        let mut zmq_msg = ZmqMessage::from(client_id.to_vec());
        if expects_empty {
            zmq_msg.push_back(Bytes::new());
        }
        zmq_msg.push_back(Bytes::from(payload_bytes));

        {
            let mut frontend = self.frontend.lock().await;
            if let Err(e) = frontend.send(zmq_msg).await {
                warn!(error = %e, "failed to route worker response to client");
            }
        }

        if let Some(request_id) = &request_id {
            let success = status == "success";
            let processing_time_ms = response
                .get("processing_time_ms")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if let Ok(response_str) = serde_json::to_string(&response) {
                let _ = self
                    .store
                    .log_response(request_id, &response_str, processing_time_ms, &status)
                    .await;
            }
            self.metrics
                .record_request(&method, success, processing_time_ms.max(0) as u64, error_type.as_deref())
                .await;
        }
    }

    /// Health monitor: periodic task that
    /// evicts stale workers from the available pool.
    pub async fn health_check_tick(&self) {
        let evicted = {
            let mut state = self.state.lock().await;
            state.evict_stale(self.stale_threshold)
        };
        for worker_id in evicted {
            warn!(worker_id, "worker marked unhealthy (stale heartbeat)");
            let _ = self.store.upsert_worker(&worker_id, "unhealthy", None, None, None).await;
        }
    }
}

/// Spawn the periodic health-check task.
pub fn spawn_health_monitor(
    broker: std::sync::Arc<LoadBalancer>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => broker.health_check_tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> BrokerState {
        BrokerState::default()
    }

    fn id(tag: &'static str) -> Bytes {
        Bytes::from_static(tag.as_bytes())
    }

    #[test]
    fn register_is_idempotent() {
        let mut state = fresh_state();
        state.register_worker("w1", id(b"id1"));
        state.register_worker("w1", id(b"id1"));
        assert_eq!(state.available.iter().filter(|w| *w == "w1").count(), 1);
    }

    #[test]
    fn assign_next_marks_worker_busy_and_removes_from_pool() {
        let mut state = fresh_state();
        state.register_worker("w1", id(b"id1"));
        let assigned = state.assign_next().unwrap();
        assert_eq!(assigned, "w1");
        assert!(state.available.is_empty());
        assert_eq!(state.workers["w1"].state, WorkerState::Busy);
    }

    #[test]
    fn release_to_idle_requeues_worker() {
        let mut state = fresh_state();
        state.register_worker("w1", id(b"id1"));
        state.assign_next();
        state.release_to_idle("w1");
        assert_eq!(state.workers["w1"].state, WorkerState::Idle);
        assert!(state.available.contains(&"w1".to_string()));
    }

    #[test]
    fn evict_stale_removes_from_available_and_marks_unhealthy() {
        let mut state = fresh_state();
        state.register_worker("w1", id(b"id1"));
        state.workers.get_mut("w1").unwrap().last_heartbeat =
            Instant::now() - Duration::from_secs(100);
        let evicted = state.evict_stale(Duration::from_secs(1));
        assert_eq!(evicted, vec!["w1".to_string()]);
        assert!(state.available.is_empty());
        assert_eq!(state.workers["w1"].state, WorkerState::Unhealthy);
    }

    #[test]
    fn fresh_heartbeat_is_not_evicted() {
        let mut state = fresh_state();
        state.register_worker("w1", id(b"id1"));
        let evicted = state.evict_stale(Duration::from_secs(15));
        assert!(evicted.is_empty());
    }

    #[test]
    fn heartbeat_ignores_unknown_worker() {
        let mut state = fresh_state();
        state.heartbeat("ghost", id(b"ghost-id"), Some(5));
        assert!(state.workers.is_empty());
    }

    #[test]
    fn no_duplicate_worker_ids_across_concurrent_registrations() {
        let mut state = fresh_state();
        for _ in 0..5 {
            state.register_worker("w1", id(b"id1"));
        }
        let count = state.available.iter().filter(|w| *w == "w1").count();
        assert_eq!(count, 1);
    }
}
