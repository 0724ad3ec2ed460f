//! WebSocket transport
//!
//! A single bidirectional socket session. Frames are already message-aligned,
//! so no line framer is involved: each text (or binary) frame decodes
//! directly to one JSON-RPC message, and each outbound message is sent as one
//! discrete text frame.
//!
//! Both peers speak the `mcp` subprotocol. The client offers it during the
//! handshake; [`accept`] echoes it back and, in strict mode, rejects
//! sessions that fail to offer it.

use super::{LifecycleGate, Transport, TransportEvents};
use crate::error::{McpError, Result};
use crate::protocol::messages::{deserialize_message, serialize_message, JsonRpcMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Subprotocol token advertised during the WebSocket handshake.
pub const MCP_SUBPROTOCOL: &str = "mcp";

/// WebSocket transport over any upgraded stream
pub struct WebSocketTransport<S> {
    gate: Arc<LifecycleGate>,
    events: Arc<TransportEvents>,
    stream: Mutex<Option<WebSocketStream<S>>>,
    outbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side WebSocket transport type.
pub type WebSocketClientTransport = WebSocketTransport<MaybeTlsStream<TcpStream>>;

/// Connect to a WebSocket MCP server, offering the `mcp` subprotocol.
pub async fn connect(url: &str) -> Result<WebSocketClientTransport> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MCP_SUBPROTOCOL));

    debug!("connecting WebSocket transport to {}", url);
    let (stream, _response) = connect_async(request).await?;
    Ok(WebSocketTransport::new(stream))
}

/// Accept an inbound WebSocket MCP session on an already-connected stream.
///
/// Echoes the `mcp` subprotocol when the client offers it. With `strict`
/// set, sessions that omit the subprotocol are rejected during the
/// handshake; otherwise they are accepted as-is.
pub async fn accept<S>(stream: S, strict: bool) -> Result<WebSocketTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = accept_hdr_async(
        stream,
        move |request: &HandshakeRequest, mut response: HandshakeResponse| {
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(',').any(|p| p.trim() == MCP_SUBPROTOCOL))
                .unwrap_or(false);

            if offered {
                response.headers_mut().insert(
                    SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(MCP_SUBPROTOCOL),
                );
                Ok(response)
            } else if strict {
                let mut rejection =
                    ErrorResponse::new(Some("missing required subprotocol".to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            } else {
                Ok(response)
            }
        },
    )
    .await?;

    Ok(WebSocketTransport::new(ws))
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-established WebSocket session.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            gate: Arc::new(LifecycleGate::new()),
            events: Arc::new(TransportEvents::default()),
            stream: Mutex::new(Some(stream)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    fn decode_frame(frame: &Message) -> Option<Result<JsonRpcMessage>> {
        match frame {
            Message::Text(text) => Some(deserialize_message(text)),
            Message::Binary(bytes) => {
                Some(serde_json::from_slice(bytes).map_err(McpError::from))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self) -> Result<()> {
        self.gate.begin_start()?;

        let stream = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or(McpError::TransportAlreadyStarted)?;
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(McpError::TransportAlreadyStarted)?;

        let (mut sink, mut source) = stream.split();

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let gate = self.gate.clone();
        let read_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.next() => match frame {
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("WebSocket session ended by peer");
                            break;
                        }
                        Some(Ok(frame)) => match Self::decode_frame(&frame) {
                            Some(Ok(message)) => events.emit_message(message).await,
                            Some(Err(e)) => events.emit_error(e),
                            // Ping/pong frames are handled by the library.
                            None => {}
                        },
                        Some(Err(e)) => {
                            error!("WebSocket read failed: {}", e);
                            events.emit_error(e.into());
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
            gate.force_close();
            events.emit_close();
        });

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let text = match serialize_message(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                events.emit_error(e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            error!("WebSocket write failed: {}", e);
                            events.emit_error(e.into());
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        self.tasks.lock().await.extend([read_task, write_task]);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.gate.require_running()?;
        self.outbound_tx
            .send(message)
            .map_err(|_| McpError::TransportClosed)
    }

    async fn close(&self) -> Result<()> {
        self.gate.begin_close()?;
        debug!("closing WebSocket transport");

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.events.emit_close();
        Ok(())
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio_tungstenite::client_async;

    async fn handshake_pair(
        strict: bool,
    ) -> (
        WebSocketTransport<tokio::io::DuplexStream>,
        WebSocketTransport<tokio::io::DuplexStream>,
    ) {
        let (client_end, server_end) = duplex(16 * 1024);
        let server = tokio::spawn(accept(server_end, strict));

        let mut request = "ws://localhost/".into_client_request().unwrap();
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(MCP_SUBPROTOCOL),
        );
        let (client_ws, response) = client_async(request, client_end).await.unwrap();

        // The server must echo the negotiated subprotocol.
        assert_eq!(
            response
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some(MCP_SUBPROTOCOL)
        );

        let server_transport = server.await.unwrap().unwrap();
        (WebSocketTransport::new(client_ws), server_transport)
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (client, server) = handshake_pair(true).await;

        let (server_tx, mut server_rx) = unbounded_channel();
        server.events().set_on_message(move |message| {
            let server_tx = server_tx.clone();
            Box::pin(async move {
                let _ = server_tx.send(message);
            })
        });
        let (client_tx, mut client_rx) = unbounded_channel();
        client.events().set_on_message(move |message| {
            let client_tx = client_tx.clone();
            Box::pin(async move {
                let _ = client_tx.send(message);
            })
        });

        client.start().await.unwrap();
        server.start().await.unwrap();

        let hello = JsonRpcMessage::notification("notifications/initialized", None);
        client.send(hello.clone()).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), hello);

        let pong = JsonRpcMessage::notification("ping", None);
        server.send(pong.clone()).await.unwrap();
        assert_eq!(client_rx.recv().await.unwrap(), pong);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_accept_rejects_missing_subprotocol() {
        let (client_end, server_end) = duplex(16 * 1024);
        let server = tokio::spawn(accept(server_end, true));

        // No Sec-WebSocket-Protocol header offered.
        let request = "ws://localhost/".into_client_request().unwrap();
        let client_result = client_async(request, client_end).await;

        assert!(client_result.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_lenient_accept_allows_missing_subprotocol() {
        let (client_end, server_end) = duplex(16 * 1024);
        let server = tokio::spawn(accept(server_end, false));

        let request = "ws://localhost/".into_client_request().unwrap();
        let (_client_ws, response) = client_async(request, client_end).await.unwrap();
        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());

        let _server_transport = server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let (client, _server) = handshake_pair(true).await;
        assert!(matches!(
            client
                .send(JsonRpcMessage::notification("ping", None))
                .await
                .unwrap_err(),
            McpError::TransportNotStarted
        ));
    }
}
