//! JSON-RPC 2.0 message model.
//!
//! Outbound messages are plain serializable structs. Inbound payloads are
//! classified into [`Message`] by the presence of `method` and `id`.

use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol version stamped on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// A request id. Local requests always use numbers; peers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a new JSON-RPC request.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response we send back to a peer request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// A successful response. A `null` result is still written out.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unhandled method {method}"))
    }
}

/// An inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request originated by the peer; it expects a reply keyed by `id`.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// A one-way message from the peer.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A response to one of our requests.
    Response {
        id: Option<RequestId>,
        outcome: Result<Value, ResponseError>,
    },
}

impl Message {
    /// Classify a parsed payload.
    ///
    /// `method` + `id` is a request, `method` alone is a notification, and
    /// anything without `method` is a response that must carry `result` or
    /// `error`.
    pub fn classify(value: Value) -> Result<Self, RpcError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                return Err(RpcError::Unclassifiable(format!(
                    "expected a JSON object, got {}",
                    value_kind(&other)
                )));
            }
        };

        match map.remove("method") {
            Some(Value::String(method)) => {
                let params = map.remove("params");
                match map.remove("id") {
                    Some(id) => Ok(Message::Request {
                        id: parse_id(id)?,
                        method,
                        params,
                    }),
                    None => Ok(Message::Notification { method, params }),
                }
            }
            Some(other) => Err(RpcError::Unclassifiable(format!(
                "method must be a string, got {}",
                value_kind(&other)
            ))),
            None => classify_response(map),
        }
    }

    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }
}

fn classify_response(mut map: Map<String, Value>) -> Result<Message, RpcError> {
    let id = match map.remove("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(parse_id(id)?),
    };

    // Some servers send `"error": null` alongside a result.
    let error = map.remove("error").filter(|e| !e.is_null());
    let outcome = if let Some(error) = error {
        let error: ResponseError = serde_json::from_value(error)
            .map_err(|e| RpcError::Unclassifiable(format!("malformed error object: {e}")))?;
        Err(error)
    } else if let Some(result) = map.remove("result") {
        Ok(result)
    } else {
        return Err(RpcError::Unclassifiable(
            "message has neither method nor result/error".to_string(),
        ));
    };

    Ok(Message::Response { id, outcome })
}

fn parse_id(id: Value) -> Result<RequestId, RpcError> {
    serde_json::from_value(id.clone())
        .map_err(|_| RpcError::Unclassifiable(format!("invalid id {id}")))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_field_order() {
        let req = Request::new(RequestId::Number(0), "someMethod", Some(json!({"param1": "value1"})));
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(
            s,
            r#"{"jsonrpc":"2.0","id":0,"method":"someMethod","params":{"param1":"value1"}}"#
        );
    }

    #[test]
    fn serialize_request_without_params() {
        let req = Request::new(RequestId::Number(2), "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 2);
        assert!(json.get("params").is_none());
    }

    #[test]
    fn serialize_notification_has_no_id() {
        let notif = Notification::new("initialized", Some(json!({})));
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "initialized");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn serialize_success_response_keeps_null_result() {
        let resp = Response::success(RequestId::Number(7), Value::Null);
        let s = serde_json::to_string(&resp).unwrap();
        assert_eq!(s, r#"{"jsonrpc":"2.0","id":7,"result":null}"#);
    }

    #[test]
    fn serialize_failure_response() {
        let resp = Response::failure("abc".into(), ResponseError::method_not_found("x/y"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["error"]["code"], METHOD_NOT_FOUND);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn classify_peer_request() {
        let msg = Message::classify(json!({
            "jsonrpc": "2.0",
            "id": 100,
            "method": "workspace/configuration",
            "params": {"items": [{"section": "typescript"}]}
        }))
        .unwrap();
        match msg {
            Message::Request { id, method, params } => {
                assert_eq!(id, RequestId::Number(100));
                assert_eq!(method, "workspace/configuration");
                assert_eq!(params.unwrap()["items"][0]["section"], "typescript");
            }
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn classify_peer_request_with_string_id() {
        let msg = Message::classify(json!({"id": "req-1", "method": "window/workDoneProgress/create"}))
            .unwrap();
        assert!(matches!(msg, Message::Request { id: RequestId::String(ref s), .. } if s == "req-1"));
    }

    #[test]
    fn classify_notification() {
        let msg = Message::classify(json!({
            "jsonrpc": "2.0",
            "method": "telemetry/event",
            "params": {"measures": {"ExecutionTime": 2673}}
        }))
        .unwrap();
        assert_eq!(msg.method(), Some("telemetry/event"));
        assert!(matches!(msg, Message::Notification { .. }));
    }

    #[test]
    fn classify_success_response() {
        let msg = Message::classify(json!({"jsonrpc": "2.0", "id": 0, "result": {}})).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: Some(RequestId::Number(0)),
                outcome: Ok(json!({})),
            }
        );
    }

    #[test]
    fn classify_null_result_is_a_response() {
        let msg = Message::classify(json!({"id": 3, "result": null})).unwrap();
        assert!(matches!(msg, Message::Response { outcome: Ok(Value::Null), .. }));
    }

    #[test]
    fn classify_null_error_next_to_result() {
        let msg = Message::classify(json!({"id": 3, "result": [], "error": null})).unwrap();
        assert!(matches!(msg, Message::Response { outcome: Ok(Value::Array(_)), .. }));
    }

    #[test]
    fn classify_error_response() {
        let msg = Message::classify(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found", "data": "extra"}
        }))
        .unwrap();
        match msg {
            Message::Response { id, outcome: Err(err) } => {
                assert_eq!(id, Some(RequestId::Number(1)));
                assert_eq!(err.code, METHOD_NOT_FOUND);
                assert_eq!(err.data.unwrap(), "extra");
            }
            other => panic!("Expected error Response, got {other:?}"),
        }
    }

    #[test]
    fn classify_error_response_with_null_id() {
        let msg = Message::classify(json!({
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        assert!(matches!(msg, Message::Response { id: None, outcome: Err(_) }));
    }

    #[test]
    fn classify_rejects_shapeless_object() {
        let err = Message::classify(json!({"jsonrpc": "2.0", "id": 4})).unwrap_err();
        assert!(matches!(err, RpcError::Unclassifiable(_)));
    }

    #[test]
    fn classify_rejects_peer_request_with_null_id() {
        let err = Message::classify(json!({"jsonrpc": "2.0", "method": "x", "id": null})).unwrap_err();
        assert!(matches!(err, RpcError::Unclassifiable(_)));
        assert!(err.to_string().contains("invalid id null"));
    }

    #[test]
    fn classify_rejects_non_object() {
        let err = Message::classify(json!([1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn classify_rejects_non_string_method() {
        let err = Message::classify(json!({"method": 5})).unwrap_err();
        assert!(err.to_string().contains("method must be a string"));
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::Number(10).to_string(), "10");
        assert_eq!(RequestId::from("a").to_string(), "\"a\"");
    }
}
