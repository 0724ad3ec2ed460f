//! Bidirectional JSON-RPC engine for the Model Context Protocol
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol::messages`]: the four-way JSON-RPC message union and its
//!   single-line wire form
//! - [`transport`]: the lifecycle contract plus four bindings — standard
//!   streams, SSE + HTTP POST, WebSocket, and an in-process linked pair
//! - [`protocol::engine`]: request/response correlation, handler dispatch,
//!   deadlines, and cancellation, symmetric in both directions
//! - [`client`] / [`server`]: the two MCP roles, layering the `initialize`
//!   handshake, capability negotiation, and typed feature methods over the
//!   engine
//!
//! A minimal in-process session:
//!
//! ```no_run
//! use mcp_wire::transport::InMemoryTransport;
//! use mcp_wire::types::{ClientCapabilities, Implementation, ServerCapabilities};
//! use mcp_wire::{Client, Server};
//! use std::sync::Arc;
//!
//! # async fn run() -> mcp_wire::Result<()> {
//! let (client_end, server_end) = InMemoryTransport::create_linked_pair();
//!
//! let server = Server::new(
//!     Implementation { name: "demo".into(), version: "0.1.0".into() },
//!     ServerCapabilities::default(),
//! );
//! server.connect(Arc::new(server_end)).await?;
//!
//! let client = Client::new(
//!     Implementation { name: "demo-client".into(), version: "0.1.0".into() },
//!     ClientCapabilities::default(),
//! );
//! client.connect(Arc::new(client_end)).await?;
//! client.ping().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

/// Most recent protocol revision this crate speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2024-11-05";

/// Protocol revisions this crate accepts during negotiation, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2024-10-07"];

pub use client::Client;
pub use error::{McpError, Result};
pub use protocol::{Protocol, ProtocolOptions, RequestContext, RequestOptions, JSONRPC_VERSION};
pub use server::Server;
pub use transport::Transport;
