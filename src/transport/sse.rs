//! Server-Sent Events + HTTP POST transport
//!
//! The server pushes messages to each connected client over a dedicated SSE
//! stream; the client sends messages back with plain HTTP POSTs. Each SSE
//! stream is keyed by an opaque session token issued at stream
//! establishment: the first event on the stream is an `endpoint` event
//! carrying the POST URL (token included), and every subsequent `message`
//! event carries one serialized JSON-RPC object.
//!
//! The token→transport association lives in an [`SseSessionRegistry`] owned
//! by the hosting HTTP layer and passed into each transport, not in global
//! state. [`sse_router`] provides axum glue wiring both routes to the
//! registry.

use super::{LifecycleGate, Transport, TransportEvents};
use crate::error::{McpError, Result};
use crate::protocol::messages::{deserialize_message, serialize_message, JsonRpcMessage};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::Router;
use eventsource_client as es;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One event queued for a client's SSE stream
#[derive(Debug, Clone, PartialEq)]
pub struct SsePayload {
    /// SSE event type: `endpoint` or `message`
    pub event: &'static str,
    /// Event data line
    pub data: String,
}

/// Concurrent-safe session token → transport map
///
/// Owned by the hosting HTTP layer; the POST route resolves inbound request
/// bodies to the matching client's transport through it.
#[derive(Clone, Default)]
pub struct SseSessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<SseServerTransport>>>>,
}

impl SseSessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its session token.
    pub fn register(&self, transport: Arc<SseServerTransport>) {
        self.sessions
            .write()
            .unwrap()
            .insert(transport.session_id(), transport);
    }

    /// Resolve a session token.
    pub fn get(&self, session_id: &Uuid) -> Option<Arc<SseServerTransport>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Remove a session, returning its transport if it was present.
    pub fn remove(&self, session_id: &Uuid) -> Option<Arc<SseServerTransport>> {
        self.sessions.write().unwrap().remove(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server side of one SSE session
pub struct SseServerTransport {
    session_id: Uuid,
    message_endpoint: String,
    gate: LifecycleGate,
    events: TransportEvents,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<SsePayload>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SsePayload>>>,
    registry: SseSessionRegistry,
}

impl SseServerTransport {
    /// Create a transport for a newly connected SSE client.
    ///
    /// `message_endpoint` is the path the client must POST to; the session
    /// token is appended as a query parameter in the initial `endpoint`
    /// event.
    pub fn new(message_endpoint: impl Into<String>, registry: SseSessionRegistry) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            session_id: Uuid::new_v4(),
            message_endpoint: message_endpoint.into(),
            gate: LifecycleGate::new(),
            events: TransportEvents::default(),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            registry,
        }
    }

    /// Opaque token identifying this session.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Take the outbound event stream. Yields the `endpoint` event first,
    /// then one `message` event per sent message. Can be taken once.
    pub fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<SsePayload>> {
        self.outbound_rx.lock().unwrap().take()
    }

    /// Feed one POSTed request body into this session's inbound path.
    pub async fn handle_post_message(&self, body: &[u8]) -> Result<()> {
        self.gate.require_running()?;

        let text = String::from_utf8_lossy(body);
        match deserialize_message(&text) {
            Ok(message) => {
                self.events.emit_message(message).await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .emit_error(McpError::Sse(format!("invalid POST body: {}", e)));
                Err(e)
            }
        }
    }

    fn push(&self, payload: SsePayload) -> Result<()> {
        let sender = self.outbound_tx.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(McpError::TransportClosed);
        };
        sender
            .send(payload)
            .map_err(|_| McpError::Sse("event stream receiver dropped".to_string()))
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self) -> Result<()> {
        self.gate.begin_start()?;

        // Advertise the POST endpoint, session token included, as the very
        // first event on the stream.
        self.push(SsePayload {
            event: "endpoint",
            data: format!("{}?sessionId={}", self.message_endpoint, self.session_id),
        })
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.gate.require_running()?;
        self.push(SsePayload {
            event: "message",
            data: serialize_message(&message)?,
        })
    }

    async fn close(&self) -> Result<()> {
        self.gate.begin_close()?;
        debug!("closing SSE session {}", self.session_id);

        self.registry.remove(&self.session_id);
        // Dropping the sender ends the client's event stream.
        self.outbound_tx.lock().unwrap().take();
        self.events.emit_close();
        Ok(())
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}

type ConnectCallback = Arc<dyn Fn(Arc<SseServerTransport>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct SseAppState {
    registry: SseSessionRegistry,
    message_endpoint: String,
    on_connect: ConnectCallback,
}

/// Build the axum router hosting the SSE binding: `GET /sse` establishes a
/// session and `POST /message?sessionId=...` routes request bodies to it.
///
/// `on_connect` receives each freshly registered transport; it is expected
/// to wire the transport to a protocol engine (which starts it).
pub fn sse_router<F, Fut>(registry: SseSessionRegistry, on_connect: F) -> Router
where
    F: Fn(Arc<SseServerTransport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let on_connect: ConnectCallback = Arc::new(move |transport| Box::pin(on_connect(transport)));
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(post_handler))
        .with_state(SseAppState {
            registry,
            message_endpoint: "/message".to_string(),
            on_connect,
        })
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn sse_handler(
    State(state): State<SseAppState>,
) -> Sse<BoxStream<'static, std::result::Result<Event, Infallible>>> {
    let transport = Arc::new(SseServerTransport::new(
        state.message_endpoint.clone(),
        state.registry.clone(),
    ));
    state.registry.register(transport.clone());
    debug!("new SSE session {}", transport.session_id());

    let stream: BoxStream<'static, std::result::Result<Event, Infallible>> =
        match transport.take_event_stream() {
            Some(rx) => UnboundedReceiverStream::new(rx)
                .map(|payload| Ok(Event::default().event(payload.event).data(payload.data)))
                .boxed(),
            None => futures::stream::empty().boxed(),
        };

    tokio::spawn((state.on_connect)(transport));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_handler(
    State(state): State<SseAppState>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> StatusCode {
    let Some(session_id) = query
        .get("sessionId")
        .and_then(|raw| Uuid::parse_str(raw).ok())
    else {
        return StatusCode::BAD_REQUEST;
    };

    let Some(transport) = state.registry.get(&session_id) else {
        warn!("POST for unknown SSE session {}", session_id);
        return StatusCode::NOT_FOUND;
    };

    match transport.handle_post_message(body.as_bytes()).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

/// Client side of the SSE binding
///
/// Subscribes to the server's SSE stream, learns the POST URL from the
/// initial `endpoint` event, then POSTs each outbound message there.
pub struct SseClientTransport {
    url: String,
    http: reqwest::Client,
    gate: Arc<LifecycleGate>,
    events: Arc<TransportEvents>,
    post_url: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseClientTransport {
    /// Create a transport that will subscribe to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            gate: Arc::new(LifecycleGate::new()),
            events: Arc::new(TransportEvents::default()),
            post_url: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }
}

/// Resolve the endpoint-event value against the subscription URL.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> Result<String> {
    let base = reqwest::Url::parse(base_url)
        .map_err(|e| McpError::Sse(format!("invalid SSE url {}: {}", base_url, e)))?;
    let resolved = base
        .join(endpoint)
        .map_err(|e| McpError::Sse(format!("invalid endpoint {}: {}", endpoint, e)))?;
    Ok(resolved.to_string())
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn start(&self) -> Result<()> {
        self.gate.begin_start()?;

        let url = self.url.clone();
        let events = self.events.clone();
        let gate = self.gate.clone();
        let post_url = self.post_url.clone();
        let cancel = self.cancel.clone();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<()>>();

        let task = tokio::spawn(async move {
            use es::Client as _;

            let client = match es::ClientBuilder::for_url(&url) {
                Ok(builder) => builder.build(),
                Err(e) => {
                    let _ = endpoint_tx.send(Err(McpError::Sse(e.to_string())));
                    return;
                }
            };

            let mut stream = client.stream();
            let mut endpoint_tx = Some(endpoint_tx);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(es::SSE::Connected(_))) => {
                            debug!("SSE client connected to {}", url);
                        }
                        Some(Ok(es::SSE::Event(event))) => match event.event_type.as_str() {
                            "endpoint" => match resolve_endpoint(&url, &event.data) {
                                Ok(resolved) => {
                                    debug!("SSE client will POST to {}", resolved);
                                    *post_url.write().unwrap() = Some(resolved);
                                    if let Some(tx) = endpoint_tx.take() {
                                        let _ = tx.send(Ok(()));
                                    }
                                }
                                Err(e) => {
                                    match endpoint_tx.take() {
                                        Some(tx) => {
                                            let _ = tx.send(Err(e));
                                        }
                                        None => events.emit_error(e),
                                    }
                                    break;
                                }
                            },
                            "message" => match deserialize_message(&event.data) {
                                Ok(message) => events.emit_message(message).await,
                                Err(e) => events.emit_error(e),
                            },
                            other => debug!("ignoring SSE event type {:?}", other),
                        },
                        Some(Ok(es::SSE::Comment(_))) => {
                            // Keepalive comment.
                        }
                        Some(Err(e)) => {
                            error!("SSE stream error: {}", e);
                            let error = McpError::Sse(e.to_string());
                            match endpoint_tx.take() {
                                Some(tx) => {
                                    let _ = tx.send(Err(error));
                                }
                                None => events.emit_error(error),
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }

            cancel.cancel();
            gate.force_close();
            events.emit_close();
        });

        *self.task.lock().await = Some(task);

        // The transport is not usable until the endpoint event arrives.
        match endpoint_rx.await {
            Ok(result) => result,
            Err(_) => Err(McpError::Sse(
                "stream ended before endpoint event".to_string(),
            )),
        }
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        self.gate.require_running()?;

        let target = self
            .post_url
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| McpError::Sse("no endpoint received yet".to_string()))?;

        let body = serialize_message(&message)?;
        let response = self
            .http
            .post(&target)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(McpError::Sse(format!(
                "POST to {} failed with status {}",
                target,
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.gate.begin_close()?;
        debug!("closing SSE client transport");

        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
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
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("http://localhost:3000/sse", "/message?sessionId=x").unwrap(),
            "http://localhost:3000/message?sessionId=x"
        );
        assert_eq!(
            resolve_endpoint("https://mcp.example.com/sse", "message").unwrap(),
            "https://mcp.example.com/message"
        );
        assert_eq!(
            resolve_endpoint("http://localhost/sse", "http://other/message").unwrap(),
            "http://other/message"
        );
        assert!(resolve_endpoint("not a url", "/message").is_err());
    }

    #[tokio::test]
    async fn test_endpoint_event_emitted_first() {
        let registry = SseSessionRegistry::new();
        let transport = SseServerTransport::new("/message", registry);
        let mut stream = transport.take_event_stream().unwrap();

        transport.start().await.unwrap();
        transport
            .send(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap();

        let endpoint = stream.recv().await.unwrap();
        assert_eq!(endpoint.event, "endpoint");
        assert_eq!(
            endpoint.data,
            format!("/message?sessionId={}", transport.session_id())
        );

        let message = stream.recv().await.unwrap();
        assert_eq!(message.event, "message");
        assert!(message.data.contains("\"method\":\"ping\""));
    }

    #[tokio::test]
    async fn test_post_body_reaches_message_callback() {
        let registry = SseSessionRegistry::new();
        let transport = Arc::new(SseServerTransport::new("/message", registry.clone()));
        registry.register(transport.clone());

        let (tx, mut rx) = unbounded_channel();
        transport.events().set_on_message(move |message| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(message);
            })
        });

        transport.start().await.unwrap();

        let resolved = registry.get(&transport.session_id()).unwrap();
        resolved
            .handle_post_message(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}")
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, "notifications/initialized")
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_post_body_reports_error() {
        let registry = SseSessionRegistry::new();
        let transport = SseServerTransport::new("/message", registry);

        let (tx, mut rx) = unbounded_channel();
        transport.events().set_on_error(move |error| {
            let _ = tx.send(error.to_string());
        });

        transport.start().await.unwrap();
        assert!(transport.handle_post_message(b"not json").await.is_err());
        assert!(rx.recv().await.unwrap().contains("invalid POST body"));
    }

    #[tokio::test]
    async fn test_close_deregisters_session() {
        let registry = SseSessionRegistry::new();
        let transport = Arc::new(SseServerTransport::new("/message", registry.clone()));
        registry.register(transport.clone());
        assert_eq!(registry.len(), 1);

        transport.start().await.unwrap();
        transport.close().await.unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            transport.close().await.unwrap_err(),
            McpError::TransportClosed
        ));
    }
}
