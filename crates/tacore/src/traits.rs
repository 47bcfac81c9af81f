//! The method-handler boundary: a worker process owns one
//! [`MethodHandler`] and dispatches each validated request to it by method
//! name. The registry is closed — [`crate::envelope::SUPPORTED_METHODS`] is
//! rejected at parse time, so `dispatch` only ever sees a known method.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::TacoreError;

/// One async method per supported operation, plus a `dispatch` entry point
/// that a worker calls after envelope parsing and parameter validation have
/// already run. Implementors report domain failures through
/// [`TacoreError::handler`] so the wire `type` tag reflects the failure
/// (`market_closed`, `execution`, `evaluation`, `scanner_error`,
/// `executor_error`) rather than collapsing to `internal_error`.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn scan_market(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    async fn execute_order(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    async fn evaluate_risk(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    async fn analyze_stock(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    async fn get_market_data(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    async fn health_check(&self, worker_id: &str, params: Value) -> Result<Value, TacoreError>;

    /// Route a validated request to the matching method. `method` is
    /// guaranteed to be one of [`crate::envelope::SUPPORTED_METHODS`] by the
    /// time a worker calls this, since unsupported methods are rejected
    /// during envelope parsing.
    async fn dispatch(&self, method: &str, worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        match method {
            "scan.market" => self.scan_market(worker_id, params).await,
            "execute.order" => self.execute_order(worker_id, params).await,
            "evaluate.risk" => self.evaluate_risk(worker_id, params).await,
            "analyze.stock" => self.analyze_stock(worker_id, params).await,
            "get.market_data" => self.get_market_data(worker_id, params).await,
            "health.check" => self.health_check(worker_id, params).await,
            other => Err(TacoreError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Minimal reference handler returning deterministic placeholder results for
/// every trading method. A deployment wires up its own [`MethodHandler`]
/// backed by the actual scanner/executor/risk engines; this one exists so a
/// worker binary runs standalone. Its `health_check` is never reached in
/// practice — a worker always intercepts `health.check` itself before
/// dispatch — but the trait still requires an implementation.
pub struct DefaultMethodHandler;

#[async_trait]
impl MethodHandler for DefaultMethodHandler {
    async fn scan_market(&self, _worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        let market_type = params
            .get("market_type")
            .and_then(Value::as_str)
            .unwrap_or("stock");
        Ok(json!({ "market_type": market_type, "matches": [] }))
    }

    async fn execute_order(&self, _worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        let symbol = params.get("symbol").and_then(Value::as_str).unwrap_or("");
        Ok(json!({ "symbol": symbol, "order_status": "accepted" }))
    }

    async fn evaluate_risk(&self, _worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        let tolerance = params
            .get("risk_tolerance")
            .and_then(Value::as_str)
            .unwrap_or("moderate");
        Ok(json!({ "risk_tolerance": tolerance, "risk_score": 0.0 }))
    }

    async fn analyze_stock(&self, _worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        let symbol = params
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| TacoreError::handler("evaluation", "symbol missing from validated params"))?;
        Ok(json!({ "symbol": symbol, "analysis": {} }))
    }

    async fn get_market_data(&self, _worker_id: &str, params: Value) -> Result<Value, TacoreError> {
        let symbols = params
            .get("symbols")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(json!({ "symbols": symbols, "quotes": {} }))
    }

    async fn health_check(&self, worker_id: &str, _params: Value) -> Result<Value, TacoreError> {
        Ok(json!({ "health": "ok", "worker_id": worker_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn health_check_reports_ok_and_worker_id() {
        let handler = DefaultMethodHandler;
        let result = handler.health_check("w1", json!({})).await.unwrap();
        assert_eq!(result["health"], "ok");
        assert_eq!(result["worker_id"], "w1");
    }

    #[tokio::test]
    async fn dispatch_routes_to_matching_method() {
        let handler = DefaultMethodHandler;
        let result = handler
            .dispatch("health.check", "w1", json!({}))
            .await
            .unwrap();
        assert_eq!(result["worker_id"], "w1");
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_method() {
        let handler = DefaultMethodHandler;
        let err = handler.dispatch("delete.everything", "w1", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "unsupported_method");
    }

    #[tokio::test]
    async fn analyze_stock_reports_handler_error_kind_when_symbol_missing() {
        let handler = DefaultMethodHandler;
        let err = handler.analyze_stock("w1", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "evaluation");
    }
}
