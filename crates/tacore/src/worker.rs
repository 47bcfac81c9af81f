//! The DEALER-connected worker process. A [`TacoreWorker`]
//! connects to the broker's backend ROUTER, registers, heartbeats on an
//! independent schedule, and dispatches incoming requests to a
//! [`MethodHandler`].
//!
//! Heartbeats must never stall behind a slow handler call. All outbound
//! frames (heartbeats and computed responses alike) funnel through a single
//! mpsc channel so only one place ever calls `socket.send()`; each inbound
//! request is handled on its own spawned task so the main loop's
//! `tokio::select!` keeps polling the heartbeat ticker and the socket
//! regardless of how long a handler takes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::cache::{Cache, Namespace};
use crate::envelope::{validate_params, ServiceRequest, ServiceResponse};
use crate::error::TacoreError;
use crate::store::Store;
use crate::traits::MethodHandler;
use crate::transport::Transport;

const REGISTER: &[u8] = b"REGISTER";
const HEARTBEAT: &[u8] = b"HEARTBEAT";

/// A single DEALER-connected worker. `worker_id` is the application-level
/// identity carried in REGISTER/HEARTBEAT payloads; the broker maps it to
/// whatever raw ZeroMQ identity its ROUTER observes for this connection.
pub struct TacoreWorker {
    worker_id: String,
    backend: Transport,
    heartbeat_interval: Duration,
    handler: Arc<dyn MethodHandler>,
    store: Store,
    cache: Arc<Cache>,
    started_at: Instant,
    sys: Mutex<System>,
}

impl TacoreWorker {
    pub fn new(
        worker_id: impl Into<String>,
        backend: Transport,
        heartbeat_interval: Duration,
        handler: Arc<dyn MethodHandler>,
        store: Store,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            backend,
            heartbeat_interval,
            handler,
            store,
            cache,
            started_at: Instant::now(),
            sys: Mutex::new(System::new()),
        }
    }

    /// Refresh and report current process-wide CPU/memory usage, for the
    /// optional fields on a HEARTBEAT payload. Cheap enough to call on every
    /// heartbeat tick; never blocks the request-handling path since it never
    /// touches `sys` from there.
    async fn resource_usage(&self) -> (f64, f64) {
        let mut sys = self.sys.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu = sys.global_cpu_usage() as f64;
        let mem = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        (cpu, mem)
    }

    /// Connect, register, and run until `shutdown` fires or the socket
    /// errors out.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), TacoreError> {
        let mut socket = DealerSocket::new();
        socket
            .connect(&self.backend.endpoint())
            .await
            .map_err(TacoreError::Zmq)?;
        info!(worker_id = %self.worker_id, endpoint = %self.backend.endpoint(), "worker connected to backend");

        let (out_tx, mut out_rx) = mpsc::channel::<ZmqMessage>(64);
        let processed = Arc::new(AtomicU64::new(0));

        let _ = out_tx.send(self.control_frame(REGISTER, 0, None, None)).await;
        let _ = self.store.upsert_worker(&self.worker_id, "idle", Some(0), None, None).await;

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await; // first tick is immediate; REGISTER already announced us

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (cpu, mem) = self.resource_usage().await;
                    let frame = self.control_frame(HEARTBEAT, processed.load(Ordering::Relaxed), Some(cpu), Some(mem));
                    if let Err(e) = socket.send(frame).await {
                        warn!(worker_id = %self.worker_id, error = %e, "failed to send heartbeat");
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = socket.send(frame).await {
                        warn!(worker_id = %self.worker_id, error = %e, "failed to send outbound frame");
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Ok(msg) => {
                            let handler = self.handler.clone();
                            let store = self.store.clone();
                            let cache = self.cache.clone();
                            let worker_id = self.worker_id.clone();
                            let out_tx = out_tx.clone();
                            let processed = processed.clone();
                            let started_at = self.started_at;
                            tokio::spawn(async move {
                                handle_request(handler, store, cache, worker_id, started_at, msg, out_tx, processed).await;
                            });
                        }
                        Err(e) => {
                            warn!(worker_id = %self.worker_id, error = %e, "worker recv failed, stopping");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = self
            .store
            .upsert_worker(&self.worker_id, "stopped", Some(processed.load(Ordering::Relaxed) as i64), None, None)
            .await;
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Build a REGISTER/HEARTBEAT control frame. DEALER never prepends its
    /// own identity, so this is exactly `[control, json]`; the backend
    /// ROUTER prepends whatever raw identity it observed for this peer.
    fn control_frame(
        &self,
        control: &'static [u8],
        processed_requests: u64,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
    ) -> ZmqMessage {
        let payload = json!({
            "worker_id": self.worker_id,
            "processed_requests": processed_requests,
            "cpu_usage": cpu_usage,
            "memory_usage": memory_usage,
        });
        let mut msg = ZmqMessage::from(control.to_vec());
        msg.push_back(Bytes::from(serde_json::to_vec(&payload).unwrap_or_default()));
        msg
    }
}

/// Handle one inbound request end to end: parse, validate, dispatch, log,
/// and reply. Runs on its own spawned task so a slow handler never blocks
/// the worker's heartbeat or recv loop.
async fn handle_request(
    handler: Arc<dyn MethodHandler>,
    store: Store,
    cache: Arc<Cache>,
    worker_id: String,
    started_at: Instant,
    msg: ZmqMessage,
    out_tx: mpsc::Sender<ZmqMessage>,
    processed: Arc<AtomicU64>,
) {
    // Incoming frames may carry 3, 4, or 5 parts depending on path
    // (backend-forwarded vs. direct); the payload is always the last one.
    let frames: Vec<Bytes> = msg.iter().cloned().collect();
    let Some(payload) = frames.last() else {
        warn!(worker_id, "empty frame received by worker, dropping");
        return;
    };

    let started = Instant::now();

    let request = match ServiceRequest::parse(payload) {
        Ok(req) => req,
        Err(err) => {
            let response = ServiceResponse::from_error("unknown", &err);
            send_reply(&out_tx, &response).await;
            return;
        }
    };

    let request_json = String::from_utf8_lossy(payload).to_string();
    let _ = store
        .log_request(&request.request_id, &request.method, &request_json, "", Some(&worker_id))
        .await;

    let _ = store
        .upsert_worker(&worker_id, "busy", Some(processed.load(Ordering::Relaxed) as i64), None, None)
        .await;

    let response = match validate_params(&request.method, &request.params) {
        Err(err) => ServiceResponse::from_error(&request.request_id, &err),
        Ok(validated) => {
            let cache_entry = cache_key_for(&request.method, &validated);

            let cached = match &cache_entry {
                Some((namespace, key)) => cache.get::<Value>(*namespace, key).await,
                None => None,
            };

            let dispatched = if let Some(data) = cached {
                Ok(data)
            } else if request.method == "health.check" {
                Ok(builtin_health_check(&worker_id, &validated, &processed, started_at))
            } else {
                handler.dispatch(&request.method, &worker_id, validated).await
            };

            match dispatched {
                Ok(data) => {
                    if let Some((namespace, key)) = &cache_entry {
                        cache.set(*namespace, key, &data, None).await;
                    }
                    let elapsed = started.elapsed().as_millis() as u64;
                    ServiceResponse::success(&request.request_id, data, elapsed)
                }
                Err(err) => ServiceResponse::from_error(&request.request_id, &err),
            }
        }
    };

    let status = match response.status {
        crate::envelope::ResponseStatus::Success => "success",
        crate::envelope::ResponseStatus::Error => "error",
    };
    let processing_time_ms = response.processing_time_ms.unwrap_or(0) as i64;
    if let Ok(body) = serde_json::to_string(&response) {
        let _ = store
            .log_response(&request.request_id, &body, processing_time_ms, status)
            .await;
    }

    processed.fetch_add(1, Ordering::Relaxed);
    let _ = store
        .upsert_worker(&worker_id, "idle", Some(processed.load(Ordering::Relaxed) as i64), None, None)
        .await;
    send_reply(&out_tx, &response).await;
}

/// Map a dispatched method to its read-through cache slot, if any. Only
/// methods whose results are meaningfully reusable across callers (market
/// data snapshots, stock analyses) are cached; orders and risk evaluations
/// are never cached since they must always run fresh.
fn cache_key_for(method: &str, params: &Value) -> Option<(Namespace, String)> {
    match method {
        "get.market_data" => {
            let symbols = params.get("symbols")?.as_array()?;
            let mut symbols: Vec<&str> = symbols.iter().filter_map(Value::as_str).collect();
            symbols.sort_unstable();
            Some((Namespace::MarketData, symbols.join(",")))
        }
        "analyze.stock" => {
            let symbol = params.get("symbol")?.as_str()?;
            Some((Namespace::Analysis, symbol.to_string()))
        }
        _ => None,
    }
}

/// `health.check` is answered by the worker itself regardless of the
/// configured [`MethodHandler`]: it reports the worker's own
/// liveness, not anything handler-specific.
fn builtin_health_check(
    worker_id: &str,
    params: &Value,
    processed: &AtomicU64,
    started_at: Instant,
) -> Value {
    let detailed = params.get("detailed").and_then(Value::as_bool).unwrap_or(false);
    let mut body = json!({
        "worker_id": worker_id,
        "health": "ok",
        "processed_requests": processed.load(Ordering::Relaxed),
        "uptime_secs": started_at.elapsed().as_secs(),
    });
    if detailed {
        if let Value::Object(map) = &mut body {
            map.insert("pid".into(), json!(std::process::id()));
        }
    }
    body
}

/// Always reply in the 2-frame DEALER shape `[empty, payload]`; the backend
/// ROUTER prepends the worker's own routing identity, and the broker
/// resolves the client to route to from its `request_id`-keyed pending-request
/// table, not from any client-identity frame echoed here.
async fn send_reply(out_tx: &mpsc::Sender<ZmqMessage>, response: &ServiceResponse) {
    let Ok(body) = response.to_bytes() else {
        return;
    };
    let mut msg = ZmqMessage::from(Bytes::new());
    msg.push_back(Bytes::from(body));
    let _ = out_tx.send(msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl MethodHandler for EchoHandler {
        async fn scan_market(&self, _w: &str, params: Value) -> Result<Value, TacoreError> {
            Ok(params)
        }
        async fn execute_order(&self, _w: &str, params: Value) -> Result<Value, TacoreError> {
            Ok(params)
        }
        async fn evaluate_risk(&self, _w: &str, params: Value) -> Result<Value, TacoreError> {
            Ok(params)
        }
        async fn analyze_stock(&self, _w: &str, params: Value) -> Result<Value, TacoreError> {
            Ok(params)
        }
        async fn get_market_data(&self, _w: &str, params: Value) -> Result<Value, TacoreError> {
            Ok(params)
        }
        async fn health_check(&self, worker_id: &str, _params: Value) -> Result<Value, TacoreError> {
            Ok(json!({ "health": "ok", "worker_id": worker_id }))
        }
    }

    #[tokio::test]
    async fn handle_request_replies_with_two_frame_shape() {
        let store = Store::open_in_memory().await.unwrap();
        let handler: Arc<dyn MethodHandler> = Arc::new(EchoHandler);
        let (tx, mut rx) = mpsc::channel(4);
        let processed = Arc::new(AtomicU64::new(0));

        let raw = br#"{"method":"health.check","request_id":"r1","params":{}}"#;
        let mut msg = ZmqMessage::from(Bytes::new());
        msg.push_back(Bytes::new());
        msg.push_back(Bytes::copy_from_slice(raw));

        handle_request(
            handler,
            store,
            Arc::new(Cache::disabled()),
            "w1".into(),
            Instant::now(),
            msg,
            tx,
            processed.clone(),
        )
        .await;

        let reply = rx.recv().await.unwrap();
        let frames: Vec<Bytes> = reply.iter().cloned().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
        let response: ServiceResponse = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(response.request_id, "r1");
        assert_eq!(processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn handle_request_rejects_unsupported_method() {
        let store = Store::open_in_memory().await.unwrap();
        let handler: Arc<dyn MethodHandler> = Arc::new(EchoHandler);
        let (tx, mut rx) = mpsc::channel(4);
        let processed = Arc::new(AtomicU64::new(0));

        let raw = br#"{"method":"delete.everything","request_id":"r1"}"#;
        let mut msg = ZmqMessage::from(Bytes::from_static(b""));
        msg.push_back(Bytes::copy_from_slice(raw));

        handle_request(
            handler,
            store,
            Arc::new(Cache::disabled()),
            "w1".into(),
            Instant::now(),
            msg,
            tx,
            processed,
        )
        .await;

        let reply = rx.recv().await.unwrap();
        let frames: Vec<Bytes> = reply.iter().cloned().collect();
        let response: ServiceResponse = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(response.error_type.as_deref(), Some("unsupported_method"));
    }

    #[tokio::test]
    async fn handle_request_rejects_invalid_params() {
        let store = Store::open_in_memory().await.unwrap();
        let handler: Arc<dyn MethodHandler> = Arc::new(EchoHandler);
        let (tx, mut rx) = mpsc::channel(4);
        let processed = Arc::new(AtomicU64::new(0));

        let raw = br#"{"method":"analyze.stock","request_id":"r1","params":{}}"#;
        let mut msg = ZmqMessage::from(Bytes::from_static(b""));
        msg.push_back(Bytes::copy_from_slice(raw));

        handle_request(
            handler,
            store,
            Arc::new(Cache::disabled()),
            "w1".into(),
            Instant::now(),
            msg,
            tx,
            processed,
        )
        .await;

        let reply = rx.recv().await.unwrap();
        let frames: Vec<Bytes> = reply.iter().cloned().collect();
        let response: ServiceResponse = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(response.error_type.as_deref(), Some("validation"));
    }

    #[tokio::test]
    async fn resource_usage_reports_bounded_percentages() {
        let store = Store::open_in_memory().await.unwrap();
        let worker = TacoreWorker::new(
            "w1",
            Transport::tcp("127.0.0.1", 0),
            Duration::from_secs(5),
            Arc::new(EchoHandler),
            store,
            Arc::new(Cache::disabled()),
        );
        let (cpu, mem) = worker.resource_usage().await;
        assert!(cpu >= 0.0);
        assert!((0.0..=100.0).contains(&mem));
    }

    #[tokio::test]
    async fn control_frame_carries_optional_resource_fields() {
        let store = Store::open_in_memory().await.unwrap();
        let worker = TacoreWorker::new(
            "w1",
            Transport::tcp("127.0.0.1", 0),
            Duration::from_secs(5),
            Arc::new(EchoHandler),
            store,
            Arc::new(Cache::disabled()),
        );
        let frame = worker.control_frame(HEARTBEAT, 3, Some(12.5), Some(40.0));
        let frames: Vec<Bytes> = frame.iter().cloned().collect();
        let payload: Value = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(payload["cpu_usage"], 12.5);
        assert_eq!(payload["memory_usage"], 40.0);
    }
}
