//! Protocol layer: JSON-RPC message types and the bidirectional engine
//!
//! [`messages`] defines the wire-level message union; [`engine`] implements
//! request/response correlation, handler dispatch, timeouts, and
//! cancellation on top of any [`crate::transport::Transport`].

pub mod engine;
pub mod messages;

pub use engine::{Protocol, ProtocolOptions, RequestContext, RequestOptions};
pub use messages::{
    deserialize_message, serialize_message, ErrorObject, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
};
