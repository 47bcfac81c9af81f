//! Embedded SQL persistence for request logs, worker status, and metrics.
//!
//! Backed by a single SQLite file opened once at startup and shared via a
//! pool; writes serialize through SQLite's own locking so no additional
//! mutex is needed at this layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::TacoreError;

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub method: Option<String>,
    pub status: Option<String>,
    pub hours_back: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRow {
    pub request_id: String,
    pub method: String,
    pub worker_id: Option<String>,
    pub client_id: Option<String>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusRow {
    pub worker_id: String,
    pub state: String,
    pub last_heartbeat: Option<String>,
    pub processed_requests: i64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ServiceStats {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub avg_response_time: f64,
    pub requests_per_minute: f64,
    pub active_workers: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodStat {
    pub method: String,
    pub request_count: i64,
    pub avg_processing_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlyStat {
    pub hour: String,
    pub request_count: i64,
}

impl Store {
    /// Open (creating if absent) the SQLite file at `path` and run the
    /// idempotent schema migration.
    pub async fn open(path: &str) -> Result<Self, TacoreError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, TacoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), TacoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_logs (
                request_id VARCHAR(100) PRIMARY KEY,
                method VARCHAR(50) NOT NULL,
                worker_id VARCHAR(50),
                client_id VARCHAR(100),
                request_data TEXT,
                response_data TEXT,
                processing_time_ms INTEGER,
                status VARCHAR(20) DEFAULT 'pending',
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                completed_at TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric_name VARCHAR(50) NOT NULL,
                metric_value REAL NOT NULL,
                metric_data TEXT,
                timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_status (
                worker_id VARCHAR(50) PRIMARY KEY,
                state VARCHAR(20) NOT NULL,
                last_heartbeat TIMESTAMP,
                processed_requests INTEGER DEFAULT 0,
                cpu_usage REAL,
                memory_usage REAL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_config (
                key VARCHAR(100) PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_logs_method ON request_logs(method)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_service_metrics_timestamp ON service_metrics(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn log_request(
        &self,
        request_id: &str,
        method: &str,
        request_data: &str,
        client_id: &str,
        worker_id: Option<&str>,
    ) -> Result<(), TacoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO request_logs (request_id, method, worker_id, client_id, request_data, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'processing')",
        )
        .bind(request_id)
        .bind(method)
        .bind(worker_id)
        .bind(client_id)
        .bind(request_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_response(
        &self,
        request_id: &str,
        response_data: &str,
        processing_time_ms: i64,
        status: &str,
    ) -> Result<(), TacoreError> {
        sqlx::query(
            "UPDATE request_logs SET response_data = ?1, processing_time_ms = ?2, status = ?3, \
             completed_at = CURRENT_TIMESTAMP WHERE request_id = ?4",
        )
        .bind(response_data)
        .bind(processing_time_ms)
        .bind(status)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_worker(
        &self,
        worker_id: &str,
        state: &str,
        processed_requests: Option<i64>,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
    ) -> Result<(), TacoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_status (worker_id, state, last_heartbeat, processed_requests, cpu_usage, memory_usage)
            VALUES (?1, ?2, CURRENT_TIMESTAMP, ?3, ?4, ?5)
            ON CONFLICT(worker_id) DO UPDATE SET
                state = excluded.state,
                last_heartbeat = CURRENT_TIMESTAMP,
                processed_requests = excluded.processed_requests,
                cpu_usage = excluded.cpu_usage,
                memory_usage = excluded.memory_usage,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(worker_id)
        .bind(state)
        .bind(processed_requests.unwrap_or(0))
        .bind(cpu_usage)
        .bind(memory_usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_metric(
        &self,
        name: &str,
        value: f64,
        data: Option<&str>,
    ) -> Result<(), TacoreError> {
        sqlx::query("INSERT INTO service_metrics (metric_name, metric_value, metric_data) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(value)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<RequestLogRow>, TacoreError> {
        let mut sql = String::from("SELECT * FROM request_logs WHERE 1=1");
        if filter.method.is_some() {
            sql.push_str(" AND method = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.hours_back.is_some() {
            sql.push_str(" AND created_at >= datetime('now', ?)");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(method) = &filter.method {
            query = query.bind(method);
        }
        if let Some(status) = &filter.status {
            query = query.bind(status);
        }
        if let Some(hours) = filter.hours_back {
            query = query.bind(format!("-{hours} hours"));
        }
        query = query.bind(filter.limit).bind(filter.offset);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_request_log).collect())
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Option<RequestLogRow>, TacoreError> {
        let row = sqlx::query("SELECT * FROM request_logs WHERE request_id = ?1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_request_log))
    }

    pub async fn worker_status(&self) -> Result<Vec<WorkerStatusRow>, TacoreError> {
        let rows = sqlx::query("SELECT * FROM worker_status ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| WorkerStatusRow {
                worker_id: row.get("worker_id"),
                state: row.get("state"),
                last_heartbeat: row.get("last_heartbeat"),
                processed_requests: row.get("processed_requests"),
                cpu_usage: row.get("cpu_usage"),
                memory_usage: row.get("memory_usage"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    pub async fn service_stats(&self, hours: i64) -> Result<ServiceStats, TacoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) as successful,
                SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) as failed,
                AVG(processing_time_ms) as avg_time
            FROM request_logs
            WHERE created_at >= datetime('now', ?1)
            "#,
        )
        .bind(format!("-{hours} hours"))
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let successful: i64 = row.try_get("successful").unwrap_or(0);
        let failed: i64 = row.try_get("failed").unwrap_or(0);
        let avg_time: Option<f64> = row.try_get("avg_time").unwrap_or(None);

        let active_workers: i64 =
            sqlx::query("SELECT COUNT(*) as n FROM worker_status WHERE state != 'unhealthy'")
                .fetch_one(&self.pool)
                .await?
                .get("n");

        let minutes = (hours * 60).max(1) as f64;

        Ok(ServiceStats {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            avg_response_time: avg_time.unwrap_or(0.0),
            requests_per_minute: total as f64 / minutes,
            active_workers,
        })
    }

    pub async fn method_stats(&self) -> Result<Vec<MethodStat>, TacoreError> {
        let rows = sqlx::query(
            "SELECT method, COUNT(*) as request_count, AVG(processing_time_ms) as avg_time \
             FROM request_logs GROUP BY method ORDER BY request_count DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MethodStat {
                method: row.get("method"),
                request_count: row.get("request_count"),
                avg_processing_time_ms: row.try_get::<Option<f64>, _>("avg_time").ok().flatten().unwrap_or(0.0),
            })
            .collect())
    }

    pub async fn hourly_stats(&self, hours: i64) -> Result<Vec<HourlyStat>, TacoreError> {
        let rows = sqlx::query(
            r#"
            SELECT strftime('%Y-%m-%d %H:00', created_at) as hour, COUNT(*) as request_count
            FROM request_logs
            WHERE created_at >= datetime('now', ?1)
            GROUP BY hour
            ORDER BY hour ASC
            "#,
        )
        .bind(format!("-{hours} hours"))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| HourlyStat {
                hour: row.get("hour"),
                request_count: row.get("request_count"),
            })
            .collect())
    }

    /// Delete `request_logs`/`service_metrics` rows older than `days`.
    /// Returns the total number of deleted rows.
    pub async fn cleanup(&self, days: i64) -> Result<u64, TacoreError> {
        let horizon = format!("-{days} days");
        let r1 = sqlx::query("DELETE FROM request_logs WHERE created_at < datetime('now', ?1)")
            .bind(&horizon)
            .execute(&self.pool)
            .await?;
        let r2 = sqlx::query("DELETE FROM service_metrics WHERE timestamp < datetime('now', ?1)")
            .bind(&horizon)
            .execute(&self.pool)
            .await?;
        Ok(r1.rows_affected() + r2.rows_affected())
    }
}

fn row_to_request_log(row: &sqlx::sqlite::SqliteRow) -> RequestLogRow {
    RequestLogRow {
        request_id: row.get("request_id"),
        method: row.get("method"),
        worker_id: row.get("worker_id"),
        client_id: row.get("client_id"),
        request_data: row.get("request_data"),
        response_data: row.get("response_data"),
        processing_time_ms: row.get("processing_time_ms"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    }
}

/// Last time the store clock was observed; kept for the monitoring API's
/// "as of" reporting without adding a dependency on wall-clock calls deep
/// inside query helpers.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_created_idempotently() {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn log_request_then_response_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .log_request("r1", "health.check", "{}", "client-a", None)
            .await
            .unwrap();
        store
            .log_response("r1", r#"{"status":"success"}"#, 12, "success")
            .await
            .unwrap();

        let row = store.get_request("r1").await.unwrap().unwrap();
        assert_eq!(row.status, "success");
        assert_eq!(row.processing_time_ms, Some(12));
    }

    #[tokio::test]
    async fn log_response_is_idempotent_by_request_id() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .log_request("r1", "health.check", "{}", "client-a", None)
            .await
            .unwrap();
        store.log_response("r1", "a", 1, "success").await.unwrap();
        store.log_response("r1", "b", 2, "success").await.unwrap();

        let filter = RequestFilter {
            limit: 10,
            ..Default::default()
        };
        let rows = store.list_requests(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].response_data.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn upsert_worker_updates_in_place() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_worker("w1", "idle", Some(0), None, None)
            .await
            .unwrap();
        store
            .upsert_worker("w1", "busy", Some(5), Some(0.3), Some(0.1))
            .await
            .unwrap();

        let rows = store.worker_status().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "busy");
        assert_eq!(rows[0].processed_requests, 5);
    }

    #[tokio::test]
    async fn cleanup_deletes_nothing_when_nothing_is_old() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .log_request("r1", "health.check", "{}", "client-a", None)
            .await
            .unwrap();
        let deleted = store.cleanup(7).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn list_requests_filters_by_method() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .log_request("r1", "health.check", "{}", "c", None)
            .await
            .unwrap();
        store
            .log_request("r2", "scan.market", "{}", "c", None)
            .await
            .unwrap();

        let filter = RequestFilter {
            method: Some("scan.market".into()),
            limit: 10,
            ..Default::default()
        };
        let rows = store.list_requests(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "r2");
    }
}
