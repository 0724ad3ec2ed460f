//! Bidirectional JSON-RPC engine
//!
//! Sits between a role (client or server) and a transport. Either peer can
//! issue requests at any time; the engine correlates responses to callers
//! through a pending-request table, dispatches inbound requests and
//! notifications to registered handlers, and enforces per-request deadlines.
//!
//! Inbound requests run on their own tasks so a slow handler never blocks
//! the delivery of other messages. Each in-flight inbound request carries a
//! `CancellationToken` that fires when the peer sends
//! `notifications/cancelled` for it; a cancelled request produces no
//! response.

use crate::error::{McpError, Result};
use crate::protocol::messages::JsonRpcMessage;
use crate::transport::Transport;
use crate::types::{CancelledParams, Method, ProgressParams, ProgressToken, RequestId};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default deadline applied to outgoing requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handler for one inbound request method.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handler for one inbound notification method.
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Deadline for outgoing requests that do not override it
    pub default_request_timeout: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Per-request overrides for [`Protocol::request`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline for this request; falls back to the engine default
    pub timeout: Option<Duration>,
    /// Token that abandons the request when cancelled; the peer is told via
    /// `notifications/cancelled`
    pub cancel: Option<CancellationToken>,
}

/// Context handed to inbound request handlers
#[derive(Clone)]
pub struct RequestContext {
    /// Id of the request being handled
    pub request_id: RequestId,
    /// Progress token from the request's `_meta.progressToken`, when present
    pub progress_token: Option<ProgressToken>,
    /// Fires when the peer cancels this request
    pub cancel: CancellationToken,
    transport: Arc<dyn Transport>,
}

impl RequestContext {
    /// Report progress to the requester. A no-op when the request carried no
    /// progress token.
    pub async fn send_progress(&self, progress: f64, total: Option<f64>) -> Result<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
        };
        self.transport
            .send(JsonRpcMessage::notification(
                Method::NotificationProgress.as_str(),
                Some(serde_json::to_value(params)?),
            ))
            .await
    }
}

struct ProtocolInner {
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    /// Outgoing requests awaiting a response, keyed by id.
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value>>>>,
    request_handlers: RwLock<HashMap<Method, RequestHandler>>,
    notification_handlers: RwLock<HashMap<Method, NotificationHandler>>,
    /// Inbound requests currently being handled, keyed by the peer's id.
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    options: ProtocolOptions,
}

/// Bidirectional JSON-RPC engine bound to one transport
///
/// Cheap to clone; all clones share the same session state.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<ProtocolInner>,
}

impl Protocol {
    /// Create an engine with the given options, not yet bound to a
    /// transport.
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            inner: Arc::new(ProtocolInner {
                transport: RwLock::new(None),
                next_id: AtomicI64::new(0),
                pending: Mutex::new(HashMap::new()),
                request_handlers: RwLock::new(HashMap::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    /// Register the handler for an inbound request method, replacing any
    /// previous one.
    pub fn set_request_handler<F, Fut>(&self, method: Method, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        self.inner
            .request_handlers
            .write()
            .unwrap()
            .insert(method, handler);
    }

    /// Remove the handler for a request method.
    pub fn remove_request_handler(&self, method: &Method) {
        self.inner.request_handlers.write().unwrap().remove(method);
    }

    /// Register the handler for an inbound notification method, replacing
    /// any previous one.
    pub fn set_notification_handler<F, Fut>(&self, method: Method, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .notification_handlers
            .write()
            .unwrap()
            .insert(method, handler);
    }

    /// Remove the handler for a notification method.
    pub fn remove_notification_handler(&self, method: &Method) {
        self.inner
            .notification_handlers
            .write()
            .unwrap()
            .remove(method);
    }

    /// Bind to a transport and start it. Inbound traffic begins flowing to
    /// the registered handlers once this returns.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        {
            let mut slot = self.inner.transport.write().unwrap();
            if slot.is_some() {
                return Err(McpError::Internal(
                    "protocol already connected to a transport".to_string(),
                ));
            }
            *slot = Some(transport.clone());
        }

        // Weak references keep the transport's task from pinning the
        // session alive after every user handle is dropped.
        let weak = Arc::downgrade(&self.inner);
        transport.events().set_on_message(move |message| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Protocol { inner }.handle_message(message).await;
                }
            })
        });

        let weak = Arc::downgrade(&self.inner);
        transport.events().set_on_error(move |error| {
            if weak.upgrade().is_some() {
                warn!("transport error: {}", error);
            }
        });

        let weak: Weak<ProtocolInner> = Arc::downgrade(&self.inner);
        transport.events().set_on_close(move || {
            if let Some(inner) = weak.upgrade() {
                Protocol { inner }.handle_transport_close();
            }
        });

        transport.start().await
    }

    /// Issue a request and await its response.
    ///
    /// Fails with [`McpError::RequestTimeout`] when the deadline passes,
    /// [`McpError::RequestCancelled`] when the caller's token fires, or
    /// [`McpError::ConnectionClosed`] when the transport dies first. In the
    /// timeout and cancellation cases a best-effort
    /// `notifications/cancelled` is sent so the peer can stop working.
    pub async fn request(
        &self,
        method: Method,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let transport = self.transport()?;
        let timeout = options
            .timeout
            .unwrap_or(self.inner.options.default_request_timeout);
        let cancel = options.cancel.unwrap_or_default();

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        let message = JsonRpcMessage::request(id.clone(), method.as_str(), params);
        if let Err(e) = transport.send(message).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        tokio::select! {
            response = rx => match response {
                Ok(result) => result,
                // Sender dropped without a verdict; the table was torn down.
                Err(_) => Err(McpError::ConnectionClosed),
            },
            _ = tokio::time::sleep(timeout) => {
                self.inner.pending.lock().unwrap().remove(&id);
                self.notify_cancelled(&id, "request timed out").await;
                Err(McpError::RequestTimeout(timeout))
            }
            _ = cancel.cancelled() => {
                self.inner.pending.lock().unwrap().remove(&id);
                self.notify_cancelled(&id, "cancelled by requester").await;
                Err(McpError::RequestCancelled {
                    reason: "cancelled by requester".to_string(),
                })
            }
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notification(&self, method: Method, params: Option<Value>) -> Result<()> {
        self.transport()?
            .send(JsonRpcMessage::notification(method.as_str(), params))
            .await
    }

    /// Close the underlying transport. Pending requests fail with
    /// [`McpError::ConnectionClosed`] via the close callback.
    pub async fn close(&self) -> Result<()> {
        let transport = self.inner.transport.write().unwrap().take();
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap()
            .clone()
            .ok_or(McpError::ConnectionClosed)
    }

    async fn notify_cancelled(&self, id: &RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        // Best effort; the transport may already be gone.
        if let Ok(transport) = self.transport() {
            let _ = transport
                .send(JsonRpcMessage::notification(
                    Method::NotificationCancelled.as_str(),
                    Some(params),
                ))
                .await;
        }
    }

    async fn handle_message(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await
            }
            JsonRpcMessage::Response(response) => {
                self.settle_pending(&response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(error) => {
                self.settle_pending(&error.id, Err(error.error.into()));
            }
        }
    }

    async fn handle_request(&self, request: crate::protocol::messages::JsonRpcRequest) {
        let method = Method::from(request.method.as_str());
        let handler = self
            .inner
            .request_handlers
            .read()
            .unwrap()
            .get(&method)
            .cloned();

        let Some(handler) = handler else {
            debug!("no handler for request method {}", request.method);
            let error = McpError::MethodNotFound(request.method);
            self.respond(JsonRpcMessage::error(request.id, error.to_error_object()))
                .await;
            return;
        };

        let Ok(transport) = self.transport() else {
            return;
        };

        let cancel = CancellationToken::new();
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .insert(request.id.clone(), cancel.clone());

        let context = RequestContext {
            request_id: request.id.clone(),
            progress_token: extract_progress_token(request.params.as_ref()),
            cancel: cancel.clone(),
            transport,
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = handler(request.params, context) => Some(result),
                // Cancelled requests get no response at all.
                _ = cancel.cancelled() => None,
            };
            engine
                .inner
                .in_flight
                .lock()
                .unwrap()
                .remove(&request.id);

            match outcome {
                Some(Ok(result)) => {
                    engine
                        .respond(JsonRpcMessage::response(request.id, result))
                        .await
                }
                Some(Err(e)) => {
                    engine
                        .respond(JsonRpcMessage::error(request.id, e.to_error_object()))
                        .await
                }
                None => debug!("request {} cancelled by peer", request.id),
            }
        });
    }

    async fn handle_notification(
        &self,
        notification: crate::protocol::messages::JsonRpcNotification,
    ) {
        let method = Method::from(notification.method.as_str());

        // Cancellation is engine-level: resolve the in-flight token before
        // any user handler sees the notification.
        if method == Method::NotificationCancelled {
            if let Some(params) = notification
                .params
                .clone()
                .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
            {
                let token = self
                    .inner
                    .in_flight
                    .lock()
                    .unwrap()
                    .remove(&params.request_id);
                match token {
                    Some(token) => {
                        debug!(
                            "peer cancelled request {}: {}",
                            params.request_id,
                            params.reason.as_deref().unwrap_or("no reason given")
                        );
                        token.cancel();
                    }
                    None => debug!(
                        "cancellation for unknown request {}",
                        params.request_id
                    ),
                }
            }
        }

        let handler = self
            .inner
            .notification_handlers
            .read()
            .unwrap()
            .get(&method)
            .cloned();
        match handler {
            Some(handler) => {
                if let Err(e) = handler(notification.params).await {
                    warn!("notification handler for {} failed: {}", method, e);
                }
            }
            None => debug!("dropping unhandled notification {}", notification.method),
        }
    }

    fn settle_pending(&self, id: &RequestId, result: Result<Value>) {
        let sender = self.inner.pending.lock().unwrap().remove(id);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            // A response nobody asked for is a protocol error, not noise.
            None => {
                let error = McpError::UnmatchedResponse(id.to_string());
                match self.transport() {
                    Ok(transport) => transport.events().emit_error(error),
                    Err(_) => warn!("{}", error),
                }
            }
        }
    }

    async fn respond(&self, message: JsonRpcMessage) {
        if let Ok(transport) = self.transport() {
            if let Err(e) = transport.send(message).await {
                warn!("failed to send response: {}", e);
            }
        }
    }

    fn handle_transport_close(&self) {
        debug!("transport closed; failing pending requests");
        self.inner.transport.write().unwrap().take();
        self.inner.request_handlers.write().unwrap().clear();
        self.inner.notification_handlers.write().unwrap().clear();

        let pending: Vec<_> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, sender) in pending {
            let _ = sender.send(Err(McpError::ConnectionClosed));
        }

        let in_flight: Vec<_> = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            in_flight.drain().collect()
        };
        for (_, token) in in_flight {
            token.cancel();
        }
    }
}

/// Pull `_meta.progressToken` out of request params, if present.
fn extract_progress_token(params: Option<&Value>) -> Option<ProgressToken> {
    let token = params?.get("_meta")?.get("progressToken")?;
    serde_json::from_value(token.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use serde_json::json;

    async fn connected_pair() -> (Protocol, Protocol) {
        let (client_end, server_end) = InMemoryTransport::create_linked_pair();
        let client = Protocol::new(ProtocolOptions::default());
        let server = Protocol::new(ProtocolOptions::default());
        client.connect(Arc::new(client_end)).await.unwrap();
        server.connect(Arc::new(server_end)).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (client, server) = connected_pair().await;

        server.set_request_handler(Method::Ping, |_params, _ctx| async {
            Ok(json!({"pong": true}))
        });

        let result = client
            .request(Method::Ping, None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let (client, _server) = connected_pair().await;

        let err = client
            .request(
                Method::Custom("nope/nothing".to_string()),
                None,
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, McpError::Rpc { code, .. } if code == crate::error::codes::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let (client, server) = connected_pair().await;

        server.set_request_handler(Method::ToolsCall, |_params, _ctx| async {
            Err(McpError::InvalidParams("missing 'name'".to_string()))
        });

        let err = client
            .request(Method::ToolsCall, None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, McpError::Rpc { code, .. } if code == crate::error::codes::INVALID_PARAMS)
        );
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (client, server) = connected_pair().await;

        // A handler that never answers until cancelled.
        server.set_request_handler(Method::Ping, |_params, ctx: RequestContext| async move {
            ctx.cancel.cancelled().await;
            Err(McpError::Internal("never reached".to_string()))
        });

        let err = client
            .request(
                Method::Ping,
                None,
                RequestOptions {
                    timeout: Some(Duration::from_millis(50)),
                    cancel: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout(_)));
    }

    #[tokio::test]
    async fn test_explicit_cancellation() {
        let (client, server) = connected_pair().await;

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let started_tx = Mutex::new(Some(started_tx));
        server.set_request_handler(Method::ToolsCall, move |_params, ctx: RequestContext| {
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            async move {
                ctx.cancel.cancelled().await;
                Err(McpError::Internal("never reached".to_string()))
            }
        });

        let cancel = CancellationToken::new();
        let requester = client.clone();
        let token = cancel.clone();
        let pending = tokio::spawn(async move {
            requester
                .request(
                    Method::ToolsCall,
                    None,
                    RequestOptions {
                        timeout: None,
                        cancel: Some(token),
                    },
                )
                .await
        });

        started_rx.await.unwrap();
        cancel.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::RequestCancelled { .. }));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (client, server) = connected_pair().await;

        server.set_request_handler(Method::Ping, |_params, ctx: RequestContext| async move {
            ctx.cancel.cancelled().await;
            Err(McpError::Internal("never reached".to_string()))
        });

        let requester = client.clone();
        let pending = tokio::spawn(async move {
            requester
                .request(Method::Ping, None, RequestOptions::default())
                .await
        });

        // Let the request get onto the wire before tearing down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        let (client, server) = connected_pair().await;

        let (tx, rx) = oneshot::channel::<Option<Value>>();
        let tx = Mutex::new(Some(tx));
        server.set_notification_handler(Method::NotificationInitialized, move |params| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(params);
            }
            async { Ok(()) }
        });

        client
            .notification(Method::NotificationInitialized, None)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_progress_forwarded_to_requester() {
        let (client, server) = connected_pair().await;

        let (progress_tx, progress_rx) = oneshot::channel::<ProgressParams>();
        let progress_tx = Mutex::new(Some(progress_tx));
        client.set_notification_handler(Method::NotificationProgress, move |params| {
            let parsed = params
                .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok())
                .expect("progress params");
            if let Some(tx) = progress_tx.lock().unwrap().take() {
                let _ = tx.send(parsed);
            }
            async { Ok(()) }
        });

        server.set_request_handler(Method::ToolsCall, |_params, ctx: RequestContext| async move {
            ctx.send_progress(0.5, Some(1.0)).await?;
            Ok(json!({"done": true}))
        });

        let result = client
            .request(
                Method::ToolsCall,
                Some(json!({"_meta": {"progressToken": "tok-1"}})),
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"done": true}));

        let progress = progress_rx.await.unwrap();
        assert_eq!(progress.progress_token, RequestId::String("tok-1".into()));
        assert_eq!(progress.progress, 0.5);
        assert_eq!(progress.total, Some(1.0));
    }

    #[tokio::test]
    async fn test_unmatched_response_reported_through_error_callback() {
        let (client_end, server_end) = InMemoryTransport::create_linked_pair();
        let client_end = Arc::new(client_end);

        let client = Protocol::new(ProtocolOptions::default());
        client.connect(client_end.clone()).await.unwrap();

        let (error_tx, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
        client_end.events().set_on_error(move |error| {
            let _ = error_tx.send(error);
        });

        // A response whose id was never issued by this side.
        server_end
            .send(JsonRpcMessage::response(RequestId::Number(99), json!({})))
            .await
            .unwrap();

        let err = error_rx.recv().await.unwrap();
        assert!(matches!(err, McpError::UnmatchedResponse(id) if id == "99"));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_per_connection() {
        let (client, server) = connected_pair().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        server.set_request_handler(Method::Ping, move |_params, ctx: RequestContext| {
            record.lock().unwrap().push(ctx.request_id.clone());
            async { Ok(json!(null)) }
        });

        for _ in 0..3 {
            client
                .request(Method::Ping, None, RequestOptions::default())
                .await
                .unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                RequestId::Number(0),
                RequestId::Number(1),
                RequestId::Number(2)
            ]
        );
    }
}
