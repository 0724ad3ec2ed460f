//! In-process linked transport pair
//!
//! Two instances wired directly together: one side's `send` delivers to the
//! peer's message callback, or queues on the peer's inbox until the peer has
//! started. No wire format is involved; messages pass as values. Used for
//! testing and intra-process bridging.

use super::{LifecycleGate, Transport, TransportEvents, TransportState};
use crate::error::{McpError, Result};
use crate::protocol::messages::JsonRpcMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};

struct Inner {
    gate: LifecycleGate,
    events: TransportEvents,
    /// Messages sent to this side before it started.
    inbox: Mutex<VecDeque<JsonRpcMessage>>,
    peer: OnceLock<Weak<Inner>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: LifecycleGate::new(),
            events: TransportEvents::default(),
            inbox: Mutex::new(VecDeque::new()),
            peer: OnceLock::new(),
        })
    }

    fn peer(&self) -> Option<Arc<Inner>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    /// Close initiated by the peer side; idempotent against a racing local
    /// close.
    fn close_from_peer(&self) {
        if self.gate.force_close() {
            self.events.emit_close();
        }
    }
}

/// One side of an in-process transport pair
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Create two linked transports; messages sent on one arrive at the
    /// other.
    pub fn create_linked_pair() -> (InMemoryTransport, InMemoryTransport) {
        let a = Inner::new();
        let b = Inner::new();
        // The pair is constructed atomically; both sets succeed.
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (
            InMemoryTransport { inner: a },
            InMemoryTransport { inner: b },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self) -> Result<()> {
        self.inner.gate.begin_start()?;

        // Deliver anything queued before start, in arrival order.
        loop {
            let next = self.inner.inbox.lock().unwrap().pop_front();
            let Some(message) = next else { break };
            self.inner.events.emit_message(message).await;
        }
        Ok(())
    }

    /// Unlike stream transports, sending before `start()` is allowed here:
    /// the message queues on the peer until the peer starts.
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.inner.gate.state() == TransportState::Closed {
            return Err(McpError::TransportClosed);
        }

        let peer = self.inner.peer().ok_or(McpError::ConnectionClosed)?;
        match peer.gate.state() {
            TransportState::Running => peer.events.emit_message(message).await,
            TransportState::Unstarted => peer.inbox.lock().unwrap().push_back(message),
            TransportState::Closed => return Err(McpError::ConnectionClosed),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.gate.begin_close()?;
        self.inner.inbox.lock().unwrap().clear();
        self.inner.events.emit_close();

        // Closing one side closes the other.
        if let Some(peer) = self.inner.peer() {
            peer.close_from_peer();
        }
        Ok(())
    }

    fn events(&self) -> &TransportEvents {
        &self.inner.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    fn collect_messages(
        transport: &InMemoryTransport,
    ) -> tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage> {
        let (tx, rx) = unbounded_channel();
        transport.events().set_on_message(move |message| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(message);
            })
        });
        rx
    }

    #[tokio::test]
    async fn test_send_message_both_directions() {
        let (client, server) = InMemoryTransport::create_linked_pair();
        let mut server_rx = collect_messages(&server);
        let mut client_rx = collect_messages(&client);

        client.start().await.unwrap();
        server.start().await.unwrap();

        let notification = JsonRpcMessage::notification("notifications/initialized", None);
        client.send(notification.clone()).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), notification);

        let ping = JsonRpcMessage::notification("ping", None);
        server.send(ping.clone()).await.unwrap();
        assert_eq!(client_rx.recv().await.unwrap(), ping);
    }

    #[tokio::test]
    async fn test_queues_messages_sent_before_start() {
        let (client, server) = InMemoryTransport::create_linked_pair();
        let mut server_rx = collect_messages(&server);

        let message = JsonRpcMessage::notification("notifications/initialized", None);
        client.send(message.clone()).await.unwrap();

        // Nothing delivered until the receiving side starts.
        assert!(server_rx.try_recv().is_err());

        server.start().await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_close_fires_on_both_sides_exactly_once() {
        let (client, server) = InMemoryTransport::create_linked_pair();

        let client_closes = Arc::new(AtomicUsize::new(0));
        let server_closes = Arc::new(AtomicUsize::new(0));
        let counter = client_closes.clone();
        client.events().set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = server_closes.clone();
        server.events().set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.start().await.unwrap();
        server.start().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client_closes.load(Ordering::SeqCst), 1);
        assert_eq!(server_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = InMemoryTransport::create_linked_pair();
        client.start().await.unwrap();
        client.close().await.unwrap();

        let err = client
            .send(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed));
    }

    #[tokio::test]
    async fn test_double_close_is_an_error() {
        let (client, _server) = InMemoryTransport::create_linked_pair();
        client.start().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(
            client.close().await.unwrap_err(),
            McpError::TransportClosed
        ));
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let (client, _server) = InMemoryTransport::create_linked_pair();
        client.start().await.unwrap();
        assert!(matches!(
            client.start().await.unwrap_err(),
            McpError::TransportAlreadyStarted
        ));
    }
}
