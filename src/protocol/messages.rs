//! JSON-RPC 2.0 message types
//!
//! Defines the four-way message union exchanged over every transport:
//! requests, notifications, successful responses, and error responses.
//! One serialized message never contains an embedded newline, so the
//! newline-delimited framing used by stream transports stays unambiguous.

use crate::error::Result;
use crate::types::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request: carries an id and expects a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Request id, unique among this side's outstanding requests
    pub id: RequestId,

    /// Method name to invoke
    pub method: String,

    /// Structured parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC notification: fire-and-forget, no id, no response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Structured parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Id of the request being answered
    pub id: RequestId,

    /// Result payload
    pub result: Value,
}

/// A JSON-RPC error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Id of the request being answered
    pub id: RequestId,

    /// The error
    pub error: ErrorObject,
}

/// Error object carried by an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message that can travel over a transport
///
/// Untagged: a request is distinguished by carrying both `id` and `method`,
/// a notification by `method` without `id`, and responses by `result` or
/// `error`. Variant order matters for deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request expecting a response
    Request(JsonRpcRequest),
    /// Fire-and-forget notification
    Notification(JsonRpcNotification),
    /// Successful response
    Response(JsonRpcResponse),
    /// Error response
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Build a request message.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        })
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        })
    }

    /// Build a successful response message.
    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        })
    }

    /// Build an error response message.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        })
    }
}

/// Serialize a message to a single line of UTF-8 JSON (no trailing newline).
pub fn serialize_message(message: &JsonRpcMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Deserialize one message from a line of UTF-8 JSON.
pub fn deserialize_message(line: &str) -> Result<JsonRpcMessage> {
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let msg = JsonRpcMessage::request(
            RequestId::Number(1),
            "tools/list",
            Some(json!({"cursor": null})),
        );

        let line = serialize_message(&msg).unwrap();
        assert!(line.contains("\"jsonrpc\":\"2.0\""));
        assert!(!line.contains('\n'));

        let back = deserialize_message(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = JsonRpcMessage::notification("notifications/initialized", None);
        let line = serialize_message(&msg).unwrap();
        assert!(!line.contains("\"id\""));

        match deserialize_message(&line).unwrap() {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, "notifications/initialized");
                assert_eq!(n.params, None);
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_request_not_classified_as_notification() {
        // Both carry "method"; the id must tip classification to Request.
        let line = r#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#;
        match deserialize_message(line).unwrap() {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(42));
                assert_eq!(r.method, "ping");
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_response_round_trip() {
        let msg = JsonRpcMessage::response(RequestId::String("a1".into()), json!({"ok": true}));
        let back = deserialize_message(&serialize_message(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_error_response_round_trip() {
        let msg = JsonRpcMessage::error(
            RequestId::Number(3),
            ErrorObject {
                code: -32601,
                message: "Method not found".to_string(),
                data: Some(json!({"method": "bogus"})),
            },
        );

        let line = serialize_message(&msg).unwrap();
        assert!(line.contains("-32601"));
        assert!(!line.contains("\"result\""));
        assert_eq!(deserialize_message(&line).unwrap(), msg);
    }

    #[test]
    fn test_string_and_number_ids() {
        let line = r#"{"jsonrpc":"2.0","id":"req-9","method":"ping"}"#;
        match deserialize_message(line).unwrap() {
            JsonRpcMessage::Request(r) => assert_eq!(r.id, RequestId::String("req-9".into())),
            other => panic!("expected request, got {:?}", other),
        }
    }
}
