//! The Monitoring API: an HTTP surface on its own port that
//! reads from the [`Store`] and [`MetricsCollector`] only — it never talks
//! to the broker's sockets or worker registry directly.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::cache::Cache;
use crate::metrics::MetricsCollector;
use crate::store::{RequestFilter, Store};

/// Shared state behind every monitoring endpoint.
#[derive(Clone)]
pub struct MonitoringState {
    pub store: Store,
    pub metrics: MetricsCollector,
    pub cache: Arc<Cache>,
    pub service_name: String,
    pub started_at: Instant,
}

pub fn router(state: MonitoringState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/live", get(health))
        .route("/api/status", get(status))
        .route("/api/workers", get(workers))
        .route("/api/metrics", get(metrics))
        .route("/api/requests", get(list_requests))
        .route("/api/requests/{request_id}", get(get_request))
        .route("/api/stats", get(stats))
        .route("/api/cleanup", post(cleanup))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Uniform JSON error body for every endpoint failure.
fn api_error(status: StatusCode, name: &str, description: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "error": {
                "code": status.as_u16(),
                "name": name,
                "description": description.into(),
                "timestamp": chrono::Utc::now(),
                "request_id": Uuid::new_v4().to_string(),
            }
        })),
    )
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!(context, error = %err, "monitoring API request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Internal server error")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    module: &'static str,
    version: &'static str,
    cache_available: bool,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn health(State(state): State<Arc<MonitoringState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        module: "tacoreservice",
        version: env!("CARGO_PKG_VERSION"),
        cache_available: state.cache.is_available().await,
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    service_name: String,
    status: &'static str,
    uptime: u64,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn status(State(state): State<Arc<MonitoringState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service_name: state.service_name.clone(),
        status: "running",
        uptime: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
struct WorkerStatusResponse {
    worker_id: String,
    status: String,
    processed_requests: i64,
    last_seen: Option<String>,
}

#[instrument(skip(state))]
async fn workers(
    State(state): State<Arc<MonitoringState>>,
) -> Result<Json<Vec<WorkerStatusResponse>>, (StatusCode, Json<Value>)> {
    let rows = state
        .store
        .worker_status()
        .await
        .map_err(|e| internal_error("list workers", e))?;

    Ok(Json(
        rows.into_iter()
            .map(|row| WorkerStatusResponse {
                worker_id: row.worker_id,
                status: row.state,
                processed_requests: row.processed_requests,
                last_seen: row.last_heartbeat,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct MetricsResponse {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    average_response_time: f64,
    requests_per_minute: f64,
    active_workers: i64,
    cache_available: bool,
}

#[instrument(skip(state))]
async fn metrics(
    State(state): State<Arc<MonitoringState>>,
) -> Result<Json<MetricsResponse>, (StatusCode, Json<Value>)> {
    let snap = state.metrics.snapshot().await;
    let stats = state
        .store
        .service_stats(24)
        .await
        .map_err(|e| internal_error("load metrics", e))?;

    Ok(Json(MetricsResponse {
        total_requests: snap.total_requests,
        successful_requests: snap.successful_requests,
        failed_requests: snap.failed_requests,
        average_response_time: stats.avg_response_time,
        requests_per_minute: stats.requests_per_minute,
        active_workers: stats.active_workers,
        cache_available: state.cache.is_available().await,
    }))
}

#[derive(Deserialize)]
struct ListRequestsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    method: Option<String>,
    status: Option<String>,
}

#[instrument(skip(state))]
async fn list_requests(
    State(state): State<Arc<MonitoringState>>,
    Query(q): Query<ListRequestsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = q.limit.unwrap_or(100);
    if !(1..=1000).contains(&limit) {
        return Err(api_error(StatusCode::BAD_REQUEST, "bad_request", "limit must be between 1 and 1000"));
    }
    let offset = q.offset.unwrap_or(0);
    if offset < 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "bad_request", "offset must be >= 0"));
    }

    let filter = RequestFilter {
        method: q.method,
        status: q.status,
        hours_back: None,
        limit,
        offset,
    };
    let rows = state
        .store
        .list_requests(&filter)
        .await
        .map_err(|e| internal_error("list requests", e))?;

    Ok(Json(json!({
        "requests": rows.iter().map(|r| json!({
            "request_id": r.request_id,
            "method": r.method,
            "client_id": r.client_id,
            "worker_id": r.worker_id,
            "processing_time_ms": r.processing_time_ms,
            "status": r.status,
            "timestamp": r.created_at,
        })).collect::<Vec<_>>(),
        "limit": limit,
        "offset": offset,
    })))
}

#[instrument(skip(state))]
async fn get_request(
    State(state): State<Arc<MonitoringState>>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let row = state
        .store
        .get_request(&request_id)
        .await
        .map_err(|e| internal_error("get request", e))?;

    match row {
        Some(r) => Ok(Json(json!({
            "request_id": r.request_id,
            "method": r.method,
            "client_id": r.client_id,
            "worker_id": r.worker_id,
            "request_data": r.request_data,
            "response_data": r.response_data,
            "processing_time_ms": r.processing_time_ms,
            "status": r.status,
            "created_at": r.created_at,
            "completed_at": r.completed_at,
        }))),
        None => Err(api_error(StatusCode::NOT_FOUND, "not_found", format!("no request with id '{request_id}'"))),
    }
}

#[instrument(skip(state))]
async fn stats(
    State(state): State<Arc<MonitoringState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let service_stats = state
        .store
        .service_stats(24)
        .await
        .map_err(|e| internal_error("load stats", e))?;
    let method_stats = state
        .store
        .method_stats()
        .await
        .map_err(|e| internal_error("load method stats", e))?;
    let hourly = state
        .store
        .hourly_stats(24)
        .await
        .map_err(|e| internal_error("load hourly stats", e))?;

    let uptime_seconds = state.started_at.elapsed().as_secs();

    Ok(Json(json!({
        "uptime_seconds": uptime_seconds,
        "uptime_formatted": format_uptime(uptime_seconds),
        "total_requests": service_stats.total_requests,
        "successful_requests": service_stats.successful_requests,
        "failed_requests": service_stats.failed_requests,
        "average_response_time": service_stats.avg_response_time,
        "requests_per_minute": service_stats.requests_per_minute,
        "active_workers": service_stats.active_workers,
        "method_statistics": method_stats,
        "hourly_distribution": hourly,
    })))
}

fn format_uptime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[derive(Deserialize)]
struct CleanupQuery {
    days: Option<i64>,
}

#[instrument(skip(state))]
async fn cleanup(
    State(state): State<Arc<MonitoringState>>,
    Query(q): Query<CleanupQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let days = q.days.unwrap_or(7);
    if !(1..=365).contains(&days) {
        return Err(api_error(StatusCode::BAD_REQUEST, "bad_request", "days must be between 1 and 365"));
    }

    let deleted = state
        .store
        .cleanup(days)
        .await
        .map_err(|e| internal_error("cleanup", e))?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("purged rows older than {days} days"),
        "deleted_records": deleted,
        "timestamp": chrono::Utc::now(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(store: Store) -> MonitoringState {
        MonitoringState {
            store,
            metrics: MetricsCollector::new(),
            cache: Arc::new(Cache::disabled()),
            service_name: "TACoreService".into(),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let store = Store::open_in_memory().await.unwrap();
        let state = Arc::new(test_state(store));
        let resp = health(State(state)).await;
        assert_eq!(resp.0.status, "ok");
        assert!(!resp.0.cache_available);
    }

    #[tokio::test]
    async fn list_requests_rejects_limit_out_of_range() {
        let store = Store::open_in_memory().await.unwrap();
        let state = Arc::new(test_state(store));
        let err = list_requests(State(state), Query(ListRequestsQuery { limit: Some(0), offset: None, method: None, status: None }))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_request_404_when_missing() {
        let store = Store::open_in_memory().await.unwrap();
        let state = Arc::new(test_state(store));
        let err = get_request(State(state), Path("missing".into())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_request_returns_logged_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.log_request("r1", "health.check", "{}", "c1", None).await.unwrap();
        let state = Arc::new(test_state(store));
        let resp = get_request(State(state), Path("r1".into())).await.unwrap();
        assert_eq!(resp.0["request_id"], "r1");
    }

    #[tokio::test]
    async fn cleanup_rejects_days_out_of_range() {
        let store = Store::open_in_memory().await.unwrap();
        let state = Arc::new(test_state(store));
        let err = cleanup(State(state), Query(CleanupQuery { days: Some(400) })).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn uptime_formats_hours_and_minutes() {
        assert_eq!(format_uptime(8040), "2h 14m");
        assert_eq!(format_uptime(120), "2m");
    }
}
