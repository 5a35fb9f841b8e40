//! JSON-RPC 2.0 envelope for the control plane
//!
//! One call per line: `{"jsonrpc": "2.0", "method": "...", "params": {...},
//! "id": N}`. Every call gets a terminal response carrying the same id, even
//! on failure; notifications carry a method and params but no id.

use serde_json::{json, Map, Value};
use thiserror::Error;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Structured error surfaced to the control caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".to_string(),
        }
    }

    pub fn invalid_request() -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "Invalid request".to_string(),
        }
    }

    pub fn method_not_found() -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

/// One parsed remote call
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub method: String,
    pub id: Value,
    pub params: Map<String, Value>,
}

impl RpcRequest {
    /// Parse one line. On failure the best-effort id is returned alongside
    /// the error so even a broken call can be answered with its own id.
    pub fn parse(line: &str) -> Result<Self, (Value, RpcError)> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return Err((Value::Null, RpcError::parse_error())),
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return Err((id, RpcError::invalid_request()));
        };
        let params = match value.get("params") {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err((id, RpcError::invalid_request())),
        };
        Ok(Self {
            method: method.to_string(),
            id,
            params,
        })
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn str_param(&self, key: &str) -> Result<String, RpcError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::invalid_params(format!("Missing string parameter '{}'", key)))
    }

    pub fn bool_param(&self, key: &str) -> Result<bool, RpcError> {
        self.params
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcError::invalid_params(format!("Missing boolean parameter '{}'", key)))
    }

    /// Integer parameter with an inclusive range; out-of-range values are
    /// rejected, not clamped
    pub fn int_param(&self, key: &str, min: i64, max: i64) -> Result<i64, RpcError> {
        let value = self
            .params
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::invalid_params(format!("Missing integer parameter '{}'", key)))?;
        if value < min || value > max {
            return Err(RpcError::invalid_params(format!(
                "Parameter '{}' out of range [{}, {}]",
                key, min, max
            )));
        }
        Ok(value)
    }

    /// Success response for this call
    pub fn response(&self, result: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "result": result,
        })
    }
}

/// Error response carrying the originating call's id (null if none was read)
pub fn error_response(id: &Value, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message,
        },
    })
}

/// Unsolicited server-to-observer message; never correlated to a request
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_call() {
        let request = RpcRequest::parse(
            r#"{"jsonrpc": "2.0", "method": "Client.SetVolume", "params": {"client": "AA:BB", "volume": 83}, "id": 2}"#,
        )
        .unwrap();
        assert_eq!(request.method, "Client.SetVolume");
        assert_eq!(request.id, json!(2));
        assert_eq!(request.str_param("client").unwrap(), "AA:BB");
        assert_eq!(request.int_param("volume", 0, 100).unwrap(), 83);
    }

    #[test]
    fn test_parse_garbage() {
        let (id, error) = RpcRequest::parse("this is not json").unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(error.code, PARSE_ERROR);
    }

    #[test]
    fn test_missing_method_keeps_id() {
        let (id, error) = RpcRequest::parse(r#"{"jsonrpc": "2.0", "id": 7}"#).unwrap_err();
        assert_eq!(id, json!(7));
        assert_eq!(error.code, INVALID_REQUEST);
    }

    #[test]
    fn test_int_param_rejects_out_of_range() {
        let request = RpcRequest::parse(
            r#"{"method": "Client.SetVolume", "params": {"volume": 150}, "id": 1}"#,
        )
        .unwrap();
        let error = request.int_param("volume", 0, 100).unwrap_err();
        assert_eq!(error.code, INVALID_PARAMS);
    }

    #[test]
    fn test_missing_params_object_is_empty() {
        let request = RpcRequest::parse(r#"{"method": "System.GetStatus", "id": 1}"#).unwrap();
        assert!(!request.has_param("client"));
        assert!(request.str_param("client").is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let value = error_response(&json!(4), &RpcError::method_not_found());
        assert_eq!(value["id"], 4);
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());
    }
}
