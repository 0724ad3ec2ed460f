//! Transport contract and bindings
//!
//! Every transport carries whole JSON-RPC messages between two peers and
//! satisfies the same lifecycle: `start` at most once, `send` only while
//! running, `close` exactly once. Inbound messages are delivered through a
//! registered callback in wire arrival order; transport-level failures go to
//! the error callback; the close callback fires exactly once no matter how
//! the transport dies.
//!
//! Four bindings are provided: standard streams ([`stdio`]), Server-Sent
//! Events plus HTTP POST ([`sse`]), WebSocket ([`websocket`]), and an
//! in-process linked pair ([`memory`]) for testing and intra-process
//! bridging.

pub mod memory;
pub mod read_buffer;
pub mod sse;
pub mod stdio;
pub mod websocket;

use crate::error::{McpError, Result};
use crate::protocol::messages::JsonRpcMessage;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

pub use memory::InMemoryTransport;
pub use read_buffer::ReadBuffer;
pub use sse::{SseClientTransport, SseServerTransport, SseSessionRegistry};
pub use stdio::StdioTransport;
pub use websocket::{WebSocketTransport, MCP_SUBPROTOCOL};

/// Async callback invoked once per decoded inbound message.
pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked for transport- or framing-level failures.
pub type ErrorCallback = Arc<dyn Fn(McpError) + Send + Sync>;

/// Callback invoked exactly once when the transport reaches `Closed`.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created but not yet started
    Unstarted,
    /// Background work running, sends accepted
    Running,
    /// Terminal; no further operations accepted
    Closed,
}

/// Single mutation point for the transport lifecycle
///
/// Illegal transitions surface as typed usage errors instead of racing on a
/// boolean flag.
#[derive(Debug)]
pub struct LifecycleGate {
    state: Mutex<TransportState>,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleGate {
    /// New gate in the `Unstarted` state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Unstarted),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    /// Transition `Unstarted -> Running`. Errors on a second start or after
    /// close.
    pub fn begin_start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            TransportState::Unstarted => {
                *state = TransportState::Running;
                Ok(())
            }
            TransportState::Running => Err(McpError::TransportAlreadyStarted),
            TransportState::Closed => Err(McpError::TransportClosed),
        }
    }

    /// Require the `Running` state (for `send`).
    pub fn require_running(&self) -> Result<()> {
        match self.state() {
            TransportState::Running => Ok(()),
            TransportState::Unstarted => Err(McpError::TransportNotStarted),
            TransportState::Closed => Err(McpError::TransportClosed),
        }
    }

    /// Transition to `Closed` from either live state. A second close is a
    /// caller error.
    pub fn begin_close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            TransportState::Closed => Err(McpError::TransportClosed),
            _ => {
                *state = TransportState::Closed;
                Ok(())
            }
        }
    }

    /// Force the `Closed` state (remote disconnect, I/O error). Returns true
    /// when this call performed the transition.
    pub fn force_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == TransportState::Closed {
            false
        } else {
            *state = TransportState::Closed;
            true
        }
    }
}

/// Callback bookkeeping shared by every transport binding
///
/// The close callback is latched: however many paths race to close the
/// transport, it is invoked at most once.
#[derive(Default)]
pub struct TransportEvents {
    on_message: RwLock<Option<MessageCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    on_close: RwLock<Option<CloseCallback>>,
    close_emitted: AtomicBool,
}

impl TransportEvents {
    /// Register the inbound message callback, replacing any previous one.
    pub fn set_on_message<F>(&self, callback: F)
    where
        F: Fn(JsonRpcMessage) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.on_message.write().unwrap() = Some(Arc::new(callback));
    }

    /// Register the error callback, replacing any previous one.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(McpError) + Send + Sync + 'static,
    {
        *self.on_error.write().unwrap() = Some(Arc::new(callback));
    }

    /// Register the close callback, replacing any previous one.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_close.write().unwrap() = Some(Arc::new(callback));
    }

    /// Deliver one inbound message, awaiting the handler so per-transport
    /// wire order is preserved.
    pub async fn emit_message(&self, message: JsonRpcMessage) {
        let callback = self.on_message.read().unwrap().clone();
        match callback {
            Some(callback) => callback(message).await,
            None => warn!("inbound message dropped: no message callback registered"),
        }
    }

    /// Report a transport- or framing-level failure.
    pub fn emit_error(&self, error: McpError) {
        let callback = self.on_error.read().unwrap().clone();
        match callback {
            Some(callback) => callback(error),
            None => warn!("transport error with no error callback: {}", error),
        }
    }

    /// Fire the close callback; every call after the first is a no-op.
    pub fn emit_close(&self) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self.on_close.read().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("close_emitted", &self.close_emitted.load(Ordering::SeqCst))
            .finish()
    }
}

/// The capability set every transport binding satisfies
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin whatever background work is needed to receive messages.
    /// Fails if called twice on the same instance.
    async fn start(&self) -> Result<()>;

    /// Enqueue or transmit one message. Fails before `start()` and after
    /// `close()`.
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Stop background work and release the underlying I/O resource. The
    /// close callback fires exactly once; a second `close()` is an error.
    async fn close(&self) -> Result<()>;

    /// Callback registration for this instance.
    fn events(&self) -> &TransportEvents;
}
