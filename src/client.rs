//! Client role
//!
//! Wraps a [`Protocol`] engine with the client side of the MCP handshake
//! and typed accessors for the standard server features. Connecting runs
//! `initialize`, validates the negotiated protocol version, and announces
//! readiness with `notifications/initialized`; after that the typed helpers
//! are available, each gated on the capability the server declared.

use crate::error::{McpError, Result};
use crate::protocol::{Protocol, ProtocolOptions, RequestOptions};
use crate::transport::Transport;
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, EmptyResult, GetPromptParams,
    GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListRootsResult, ListToolsResult, LoggingLevel, Method,
    ReadResourceParams, ReadResourceResult, Root, ServerCapabilities, SetLevelParams,
};
use crate::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// MCP client
///
/// One instance drives one connection. Cheap to clone; clones share the
/// session.
#[derive(Clone)]
pub struct Client {
    protocol: Protocol,
    client_info: Implementation,
    capabilities: ClientCapabilities,
    roots: Arc<RwLock<Vec<Root>>>,
    server_info: Arc<RwLock<Option<Implementation>>>,
    server_capabilities: Arc<RwLock<Option<ServerCapabilities>>>,
    negotiated_version: Arc<RwLock<Option<String>>>,
}

impl Client {
    /// Create a client that will introduce itself as `client_info` and
    /// declare `capabilities` during the handshake.
    pub fn new(client_info: Implementation, capabilities: ClientCapabilities) -> Self {
        Self::with_options(client_info, capabilities, ProtocolOptions::default())
    }

    /// Like [`Client::new`] with explicit engine options.
    pub fn with_options(
        client_info: Implementation,
        capabilities: ClientCapabilities,
        options: ProtocolOptions,
    ) -> Self {
        let protocol = Protocol::new(options);
        let roots: Arc<RwLock<Vec<Root>>> = Arc::new(RwLock::new(Vec::new()));

        // Servers may ping clients.
        protocol.set_request_handler(Method::Ping, |_params, _ctx| async {
            Ok(serde_json::to_value(EmptyResult::default())?)
        });

        if capabilities.roots.is_some() {
            let registry = roots.clone();
            protocol.set_request_handler(Method::RootsList, move |_params, _ctx| {
                let roots = registry.read().unwrap().clone();
                async move { Ok(serde_json::to_value(ListRootsResult { roots })?) }
            });
        }

        Self {
            protocol,
            client_info,
            capabilities,
            roots,
            server_info: Arc::new(RwLock::new(None)),
            server_capabilities: Arc::new(RwLock::new(None)),
            negotiated_version: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect over `transport` and perform the `initialize` handshake.
    ///
    /// Fails with [`McpError::UnsupportedProtocolVersion`] (closing the
    /// transport) when the server settles on a version this crate does not
    /// speak.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<InitializeResult> {
        self.protocol.connect(transport).await?;

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };
        let raw = self
            .protocol
            .request(
                Method::Initialize,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(raw)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            let version = result.protocol_version.clone();
            let _ = self.protocol.close().await;
            return Err(McpError::UnsupportedProtocolVersion(version));
        }

        info!(
            "connected to {} {} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );
        *self.server_info.write().unwrap() = Some(result.server_info.clone());
        *self.server_capabilities.write().unwrap() = Some(result.capabilities.clone());
        *self.negotiated_version.write().unwrap() = Some(result.protocol_version.clone());

        self.protocol
            .notification(Method::NotificationInitialized, None)
            .await?;

        Ok(result)
    }

    /// Capabilities the server declared, once connected.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().unwrap().clone()
    }

    /// Implementation info the server declared, once connected.
    pub fn server_info(&self) -> Option<Implementation> {
        self.server_info.read().unwrap().clone()
    }

    /// Protocol version settled during the handshake, once connected.
    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version.read().unwrap().clone()
    }

    /// Direct access to the underlying engine, for custom methods and
    /// notification subscriptions.
    pub fn engine(&self) -> &Protocol {
        &self.protocol
    }

    /// Register the handler servicing `sampling/createMessage` requests
    /// from the server. Requires the declared `sampling` capability.
    pub fn set_sampling_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Option<Value>, crate::protocol::RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        if self.capabilities.sampling.is_none() {
            return Err(McpError::CapabilityUnsupported("sampling".to_string()));
        }
        self.protocol
            .set_request_handler(Method::SamplingCreateMessage, handler);
        Ok(())
    }

    /// Add a filesystem root, notifying the server when the declared roots
    /// capability includes `listChanged`.
    pub async fn add_root(&self, root: Root) -> Result<()> {
        let declared = self
            .capabilities
            .roots
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("roots".to_string()))?
            .clone();

        self.roots.write().unwrap().push(root);
        self.notify_roots_changed(declared.list_changed == Some(true))
            .await;
        Ok(())
    }

    /// Remove a root by URI. Returns whether anything was removed.
    pub async fn remove_root(&self, uri: &str) -> Result<bool> {
        let declared = self
            .capabilities
            .roots
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("roots".to_string()))?
            .clone();

        let removed = {
            let mut roots = self.roots.write().unwrap();
            let before = roots.len();
            roots.retain(|r| r.uri != uri);
            roots.len() != before
        };

        self.notify_roots_changed(removed && declared.list_changed == Some(true))
            .await;
        Ok(removed)
    }

    /// Best effort: root mutations are legal before connecting, when there
    /// is no one to notify yet.
    async fn notify_roots_changed(&self, should_notify: bool) {
        if !should_notify {
            return;
        }
        if let Err(e) = self
            .protocol
            .notification(Method::NotificationRootsListChanged, None)
            .await
        {
            debug!("roots/list_changed not delivered: {}", e);
        }
    }

    /// Health-check the server.
    pub async fn ping(&self) -> Result<()> {
        self.protocol
            .request(Method::Ping, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// List the server's tools. Requires the server's `tools` capability.
    pub async fn list_tools(&self) -> Result<ListToolsResult> {
        self.checked_request(Method::ToolsList, None).await
    }

    /// Invoke a tool. Requires the server's `tools` capability.
    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.into(),
            arguments,
        };
        self.checked_request(Method::ToolsCall, Some(serde_json::to_value(params)?))
            .await
    }

    /// List the server's prompts. Requires the server's `prompts`
    /// capability.
    pub async fn list_prompts(&self) -> Result<ListPromptsResult> {
        self.checked_request(Method::PromptsList, None).await
    }

    /// Render a prompt. Requires the server's `prompts` capability.
    pub async fn get_prompt(
        &self,
        name: impl Into<String>,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.into(),
            arguments,
        };
        self.checked_request(Method::PromptsGet, Some(serde_json::to_value(params)?))
            .await
    }

    /// List the server's resources. Requires the server's `resources`
    /// capability.
    pub async fn list_resources(&self) -> Result<ListResourcesResult> {
        self.checked_request(Method::ResourcesList, None).await
    }

    /// Read a resource by URI. Requires the server's `resources`
    /// capability.
    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<ReadResourceResult> {
        let params = ReadResourceParams { uri: uri.into() };
        self.checked_request(Method::ResourcesRead, Some(serde_json::to_value(params)?))
            .await
    }

    /// Set the minimum severity of `notifications/message` the server
    /// sends. Requires the server's `logging` capability.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        let params = SetLevelParams { level };
        let _: Value = self
            .checked_request(Method::LoggingSetLevel, Some(serde_json::to_value(params)?))
            .await?;
        Ok(())
    }

    /// Tear down the connection.
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await
    }

    /// Issue a request after checking that the server declared the
    /// capability backing `method`. Fails locally, with no wire traffic,
    /// when it did not.
    async fn checked_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T> {
        self.assert_server_capability(&method)?;
        let raw = self
            .protocol
            .request(method, params, RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    fn assert_server_capability(&self, method: &Method) -> Result<()> {
        let caps = self.server_capabilities.read().unwrap();
        let Some(caps) = caps.as_ref() else {
            return Err(McpError::CapabilityUnsupported(
                "not connected: no server capabilities negotiated".to_string(),
            ));
        };

        let supported = match method {
            Method::ToolsList | Method::ToolsCall => caps.tools.is_some(),
            Method::PromptsList | Method::PromptsGet => caps.prompts.is_some(),
            Method::ResourcesList | Method::ResourcesRead => caps.resources.is_some(),
            Method::LoggingSetLevel => caps.logging.is_some(),
            Method::CompletionComplete => caps.completions.is_some(),
            _ => true,
        };

        if supported {
            Ok(())
        } else {
            debug!("capability check failed for {}", method);
            Err(McpError::CapabilityUnsupported(format!(
                "server does not support {}",
                method
            )))
        }
    }
}
