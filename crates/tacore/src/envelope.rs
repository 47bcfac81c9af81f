//! The JSON request/response envelope exchanged between clients, the
//! broker, and workers, plus per-method parameter validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TacoreError;

/// Methods a worker is allowed to dispatch. Closed at parse time: an
/// envelope naming any other method is rejected before it ever reaches a
/// handler.
pub const SUPPORTED_METHODS: &[&str] = &[
    "scan.market",
    "execute.order",
    "evaluate.risk",
    "analyze.stock",
    "get.market_data",
    "health.check",
];

/// A request as carried in the envelope payload (in-flight; `client_id`
/// is the transport identity and is never part of the JSON body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub method: String,

    #[serde(default = "default_params")]
    pub params: Value,

    pub request_id: String,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ServiceRequest {
    /// Parse a raw frame into a request, assigning a fresh `request_id`
    /// when the client omitted one, and rejecting methods outside
    /// [`SUPPORTED_METHODS`].
    pub fn parse(raw: &[u8]) -> Result<Self, TacoreError> {
        let mut value: Value = serde_json::from_slice(raw)
            .map_err(|e| TacoreError::InvalidJson(e.to_string()))?;

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| TacoreError::InvalidJson("missing 'method' field".into()))?
            .to_string();

        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            return Err(TacoreError::UnsupportedMethod(method));
        }

        let needs_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true);
        if needs_id {
            let generated = Uuid::new_v4().to_string();
            if let Value::Object(map) = &mut value {
                map.insert("request_id".into(), Value::String(generated));
            }
        }

        serde_json::from_value(value).map_err(|e| TacoreError::InvalidJson(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TacoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A response as carried in the envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub status: ResponseStatus,
    pub request_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,

    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ServiceResponse {
    pub fn success(request_id: impl Into<String>, data: Value, processing_time_ms: u64) -> Self {
        Self {
            status: ResponseStatus::Success,
            request_id: request_id.into(),
            data: Some(data),
            error: None,
            error_type: None,
            processing_time_ms: Some(processing_time_ms),
            timestamp: Utc::now(),
        }
    }

    pub fn error(
        request_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            request_id: request_id.into(),
            data: None,
            error: Some(message.into()),
            error_type: Some(error_type.into()),
            processing_time_ms: None,
            timestamp: Utc::now(),
        }
    }

    /// Build an error response from a [`TacoreError`], tagging it with the
    /// error's wire `kind()`.
    pub fn from_error(request_id: impl Into<String>, err: &TacoreError) -> Self {
        Self::error(request_id, err.kind(), err.to_string())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TacoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Validate a request's `params` against the per-method rules below.
/// Returns the (possibly normalized) params on success, or a `Validation`
/// error naming the first failing field.
pub fn validate_params(method: &str, params: &Value) -> Result<Value, TacoreError> {
    match method {
        "scan.market" => validate_scan_market(params),
        "execute.order" => validate_execute_order(params),
        "evaluate.risk" => validate_evaluate_risk(params),
        "analyze.stock" => validate_analyze_stock(params),
        "get.market_data" => validate_get_market_data(params),
        "health.check" => validate_health_check(params),
        other => Err(TacoreError::UnsupportedMethod(other.to_string())),
    }
}

fn field_error(field: &str, message: impl Into<String>) -> TacoreError {
    TacoreError::Validation {
        field: field.into(),
        message: message.into(),
    }
}

fn as_object(params: &Value) -> &serde_json::Map<String, Value> {
    static EMPTY: std::sync::OnceLock<serde_json::Map<String, Value>> = std::sync::OnceLock::new();
    params
        .as_object()
        .unwrap_or_else(|| EMPTY.get_or_init(serde_json::Map::new))
}

fn validate_scan_market(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);
    let market_type = obj
        .get("market_type")
        .and_then(Value::as_str)
        .ok_or_else(|| field_error("market_type", "market_type is required"))?;

    let normalized = match market_type {
        "US" | "CN" => "stock",
        other => other,
    };

    let mut out = obj.clone();
    out.insert("market_type".into(), Value::String(normalized.to_string()));
    Ok(Value::Object(out))
}

fn validate_execute_order(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);

    if obj.get("symbol").and_then(Value::as_str).is_none() {
        return Err(field_error("symbol", "symbol is required"));
    }

    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .or_else(|| obj.get("side").and_then(Value::as_str));
    let action = action.ok_or_else(|| {
        field_error("action", "either 'action' or 'side' is required")
    })?;
    if action != "buy" && action != "sell" {
        return Err(field_error("action", "action/side must be 'buy' or 'sell'"));
    }

    let quantity = obj
        .get("quantity")
        .or_else(|| obj.get("amount"))
        .ok_or_else(|| {
            field_error("quantity", "either 'quantity' or 'amount' is required")
        })?;
    let quantity = positive_number(quantity)
        .ok_or_else(|| field_error("quantity", "quantity/amount must be a positive number"))?;
    let _ = quantity;

    if let Some(price) = obj.get("price") {
        if positive_number(price).is_none() {
            return Err(field_error("price", "price must be a positive number"));
        }
    }

    Ok(params.clone())
}

fn validate_evaluate_risk(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);

    if obj.get("portfolio").and_then(Value::as_object).is_none() {
        return Err(field_error("portfolio", "portfolio object is required"));
    }

    if obj.get("market_data").is_none() && obj.get("market_conditions").is_none() {
        return Err(field_error(
            "market_data",
            "either 'market_data' or the legacy 'market_conditions' is required",
        ));
    }

    if let Some(tolerance) = obj.get("risk_tolerance").and_then(Value::as_str) {
        if !["conservative", "moderate", "aggressive"].contains(&tolerance) {
            return Err(field_error(
                "risk_tolerance",
                "risk_tolerance must be one of conservative, moderate, aggressive",
            ));
        }
    }

    let mut out = obj.clone();
    out.entry("risk_tolerance")
        .or_insert_with(|| Value::String("moderate".into()));
    Ok(Value::Object(out))
}

fn validate_analyze_stock(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);
    if obj.get("symbol").and_then(Value::as_str).is_none() {
        return Err(field_error("symbol", "symbol is required"));
    }
    Ok(params.clone())
}

fn validate_get_market_data(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);
    let symbols = obj
        .get("symbols")
        .and_then(Value::as_array)
        .ok_or_else(|| field_error("symbols", "symbols must be a non-empty list"))?;
    if symbols.is_empty() {
        return Err(field_error("symbols", "symbols must be a non-empty list"));
    }
    Ok(params.clone())
}

fn validate_health_check(params: &Value) -> Result<Value, TacoreError> {
    let obj = as_object(params);
    if let Some(detailed) = obj.get("detailed") {
        if !detailed.is_boolean() {
            return Err(field_error("detailed", "detailed must be a boolean"));
        }
    }
    Ok(params.clone())
}

fn positive_number(value: &Value) -> Option<f64> {
    let n = value.as_f64().or_else(|| value.as_str()?.parse::<f64>().ok())?;
    (n > 0.0).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_assigns_request_id_when_missing() {
        let raw = br#"{"method":"health.check","params":{}}"#;
        let req = ServiceRequest::parse(raw).unwrap();
        assert!(!req.request_id.is_empty());
    }

    #[test]
    fn parse_preserves_client_supplied_request_id() {
        let raw = br#"{"method":"health.check","request_id":"r1"}"#;
        let req = ServiceRequest::parse(raw).unwrap();
        assert_eq!(req.request_id, "r1");
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let err = ServiceRequest::parse(b"not json").unwrap_err();
        assert_eq!(err.kind(), "invalid_json");
    }

    #[test]
    fn parse_rejects_unsupported_method() {
        let raw = br#"{"method":"delete.everything","request_id":"r1"}"#;
        let err = ServiceRequest::parse(raw).unwrap_err();
        assert_eq!(err.kind(), "unsupported_method");
    }

    #[test]
    fn scan_market_aliases_us_and_cn_to_stock() {
        let out = validate_params("scan.market", &json!({"market_type": "US"})).unwrap();
        assert_eq!(out["market_type"], "stock");
        let out = validate_params("scan.market", &json!({"market_type": "CN"})).unwrap();
        assert_eq!(out["market_type"], "stock");
    }

    #[test]
    fn execute_order_requires_symbol_and_action_side() {
        let err = validate_params("execute.order", &json!({"symbol": "AAPL", "action": "hold", "quantity": 10}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let ok = validate_params(
            "execute.order",
            &json!({"symbol": "AAPL", "side": "buy", "amount": 100}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn execute_order_requires_positive_quantity() {
        let err = validate_params(
            "execute.order",
            &json!({"symbol": "AAPL", "action": "buy", "quantity": -5}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn evaluate_risk_accepts_legacy_market_conditions() {
        let ok = validate_params(
            "evaluate.risk",
            &json!({"portfolio": {}, "market_conditions": {}}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn evaluate_risk_defaults_risk_tolerance_to_moderate() {
        let out = validate_params(
            "evaluate.risk",
            &json!({"portfolio": {}, "market_data": {}}),
        )
        .unwrap();
        assert_eq!(out["risk_tolerance"], "moderate");
    }

    #[test]
    fn get_market_data_rejects_empty_symbols() {
        let err = validate_params("get.market_data", &json!({"symbols": []})).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn health_check_has_no_required_params() {
        let ok = validate_params("health.check", &json!({}));
        assert!(ok.is_ok());
    }

    #[test]
    fn response_round_trips_through_json() {
        let resp = ServiceResponse::success("r1", json!({"ok": true}), 12);
        let bytes = resp.to_bytes().unwrap();
        let back: ServiceResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.request_id, "r1");
        assert_eq!(back.status, ResponseStatus::Success);
    }

    #[test]
    fn error_response_carries_type_tag() {
        let resp = ServiceResponse::error("r2", "no_workers", "No workers available");
        assert_eq!(resp.error_type.as_deref(), Some("no_workers"));
        assert_eq!(resp.status, ResponseStatus::Error);
    }
}
