//! Error types for the MCP wire engine
//!
//! This module provides structured error handling using thiserror, covering
//! transport lifecycle misuse, framing failures, RPC-level errors carried in
//! responses, and the local failure modes of requests (timeout, cancellation,
//! connection loss).

use crate::protocol::messages::ErrorObject;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC 2.0 defined error codes plus the SDK extension codes.
pub mod codes {
    /// Invalid JSON was received by the peer.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The connection closed before the request completed.
    pub const CONNECTION_CLOSED: i32 = -32000;
    /// The request did not complete within its deadline.
    pub const REQUEST_TIMEOUT: i32 = -32001;
}

/// Main error type for MCP protocol and transport operations
#[derive(Error, Debug)]
pub enum McpError {
    /// Underlying stream or socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `start()` called on a transport that is already running
    #[error("transport already started")]
    TransportAlreadyStarted,

    /// `send()` called before `start()`
    #[error("transport not started")]
    TransportNotStarted,

    /// Operation attempted on a closed transport
    #[error("transport closed")]
    TransportClosed,

    /// The connection closed while a request was still pending
    #[error("connection closed")]
    ConnectionClosed,

    /// A request did not receive its response within the deadline
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// A request was cancelled before completing
    #[error("request cancelled: {reason}")]
    RequestCancelled {
        /// Free-text reason forwarded to the peer
        reason: String,
    },

    /// The peer answered a request with an error response
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code from the peer
        code: i32,
        /// Human-readable message from the peer
        message: String,
        /// Optional structured error payload
        data: Option<Value>,
    },

    /// No handler is registered for the requested method
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Request parameters were missing or malformed
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Operation requires a capability that was not declared or negotiated
    #[error("capability not supported: {0}")]
    CapabilityUnsupported(String),

    /// The peer negotiated a protocol version this crate does not speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    /// A response arrived whose id matches no pending request
    #[error("received response for unknown request id: {0}")]
    UnmatchedResponse(String),

    /// HTTP request failed (SSE POST side)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket handshake or frame-level failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// SSE stream-level failure
    #[error("SSE error: {0}")]
    Sse(String),

    /// Handler or engine failure with no more specific classification
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for MCP operations
pub type Result<T> = std::result::Result<T, McpError>;

impl McpError {
    /// The JSON-RPC error code used when this error is sent as a response.
    pub fn code(&self) -> i32 {
        match self {
            McpError::Serialization(_) => codes::PARSE_ERROR,
            McpError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => codes::INVALID_PARAMS,
            McpError::ConnectionClosed | McpError::TransportClosed => codes::CONNECTION_CLOSED,
            McpError::RequestTimeout(_) => codes::REQUEST_TIMEOUT,
            McpError::Rpc { code, .. } => *code,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Render this error as the error object of an outgoing response.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            McpError::Rpc {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ErrorObject {
                code: other.code(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<ErrorObject> for McpError {
    fn from(err: ErrorObject) -> Self {
        McpError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
