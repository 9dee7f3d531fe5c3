//! JSON-RPC 2.0 message model and line framing
//!
//! The adapter speaks JSON-RPC 2.0 in both directions: the client sends
//! requests and notifications, and the adapter sends responses plus its own
//! client-direction requests (`session/request_permission`, fs/terminal
//! passthrough). Inbound values are classified into [`Inbound`]; outbound
//! frames are built by the serializer helpers below and carry no embedded
//! newlines, so one frame is always exactly one line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ErrorCode;

/// A JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error object from an adapter error code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Parse error (`-32700`)
    pub fn parse_error() -> Self {
        Self::new(ErrorCode::ParseError, "Parse error")
    }

    /// Invalid request (`-32600`)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Method not found (`-32601`)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Method not found: {method}"))
    }
}

/// One classified inbound JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A request carrying an id; exactly one response must be emitted for it
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// A notification; no response may be emitted
    Notification { method: String, params: Value },
    /// A response to one of the adapter's own client-direction requests
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<RpcError>,
    },
}

/// Classify one parsed JSON value as a JSON-RPC message
///
/// Returns `Err` with the error object to send back when the value is not a
/// valid single JSON-RPC 2.0 object. Batches are not accepted. Unknown
/// members are ignored for forward compatibility.
pub fn classify(value: Value) -> Result<Inbound, RpcError> {
    let Value::Object(obj) = value else {
        return Err(RpcError::invalid_request("Expected a JSON-RPC object"));
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcError::invalid_request("Missing jsonrpc version"));
    }

    let id = obj.get("id").cloned();
    let method = obj.get("method").and_then(Value::as_str).map(str::to_owned);

    match method {
        Some(method) => {
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            match id {
                Some(id) if !id.is_null() => Ok(Inbound::Request { id, method, params }),
                _ => Ok(Inbound::Notification { method, params }),
            }
        }
        None => {
            // No method: must be a response to one of our requests.
            let has_result = obj.contains_key("result");
            let error = match obj.get("error") {
                Some(e) if !e.is_null() => Some(
                    serde_json::from_value::<RpcError>(e.clone())
                        .map_err(|_| RpcError::invalid_request("Malformed error object"))?,
                ),
                _ => None,
            };
            if !has_result && error.is_none() {
                return Err(RpcError::invalid_request(
                    "Message has neither method nor result/error",
                ));
            }
            let id = id.ok_or_else(|| RpcError::invalid_request("Response without id"))?;
            Ok(Inbound::Response {
                id,
                result: obj.get("result").cloned(),
                error,
            })
        }
    }
}

/// Parse one line (or text frame payload) into a classified message
///
/// Invalid JSON maps to a `-32700` error object per the protocol contract.
pub fn parse_message(raw: &str) -> Result<Inbound, RpcError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| RpcError::parse_error())?;
    classify(value)
}

// === Outbound frame builders ===
//
// serde_json never emits raw newline bytes inside a compact serialization,
// which keeps the one-frame-one-line invariant.

/// Serialize a success response frame
pub fn response_ok(id: &Value, result: Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
    .to_string()
}

/// Serialize an error response frame
pub fn response_err(id: &Value, error: &RpcError) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
    .to_string()
}

/// Serialize a notification frame
pub fn notification(method: &str, params: Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Serialize a request frame (agent-to-client direction)
pub fn request(id: i64, method: &str, params: Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}
