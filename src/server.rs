//! Server role
//!
//! Wraps a [`Protocol`] engine with the server side of the MCP handshake
//! and registries for tools, prompts, and resources. Feature handlers are
//! installed at construction time based on the declared capabilities:
//! a server that never declared `tools` answers `tools/list` with
//! method-not-found rather than an empty list.

use crate::error::{McpError, Result};
use crate::protocol::{Protocol, ProtocolOptions, RequestContext, RequestOptions};
use crate::transport::Transport;
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, EmptyResult, GetPromptParams,
    GetPromptResult, Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListRootsResult, ListToolsResult, LoggingLevel, LoggingMessageParams,
    Method, Prompt, ReadResourceParams, ReadResourceResult, Resource, ServerCapabilities,
    SetLevelParams, Tool,
};
use crate::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Handler invoked for `tools/call` on one registered tool.
pub type ToolHandler = Arc<
    dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<CallToolResult>>
        + Send
        + Sync,
>;

/// Handler invoked for `prompts/get` on one registered prompt.
pub type PromptHandler = Arc<
    dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<GetPromptResult>>
        + Send
        + Sync,
>;

/// Handler invoked for `resources/read` on one registered resource.
pub type ResourceHandler = Arc<
    dyn Fn(RequestContext) -> BoxFuture<'static, Result<ReadResourceResult>> + Send + Sync,
>;

struct RegisteredTool {
    tool: Tool,
    handler: ToolHandler,
}

struct RegisteredPrompt {
    prompt: Prompt,
    handler: PromptHandler,
}

struct RegisteredResource {
    resource: Resource,
    handler: ResourceHandler,
}

type ToolRegistry = Arc<RwLock<HashMap<String, RegisteredTool>>>;
type PromptRegistry = Arc<RwLock<HashMap<String, RegisteredPrompt>>>;
type ResourceRegistry = Arc<RwLock<HashMap<String, RegisteredResource>>>;

/// MCP server
///
/// One instance drives one connection. Cheap to clone; clones share the
/// session and registries.
#[derive(Clone)]
pub struct Server {
    protocol: Protocol,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    tools: ToolRegistry,
    prompts: PromptRegistry,
    resources: ResourceRegistry,
    client_info: Arc<RwLock<Option<Implementation>>>,
    client_capabilities: Arc<RwLock<Option<ClientCapabilities>>>,
    min_log_level: Arc<RwLock<Option<LoggingLevel>>>,
    initialized: Arc<AtomicBool>,
}

impl Server {
    /// Create a server that will introduce itself as `server_info` and
    /// declare `capabilities` during the handshake.
    pub fn new(server_info: Implementation, capabilities: ServerCapabilities) -> Self {
        Self::with_options(server_info, capabilities, ProtocolOptions::default())
    }

    /// Like [`Server::new`] with explicit engine options.
    pub fn with_options(
        server_info: Implementation,
        capabilities: ServerCapabilities,
        options: ProtocolOptions,
    ) -> Self {
        let protocol = Protocol::new(options);
        let tools: ToolRegistry = Arc::default();
        let prompts: PromptRegistry = Arc::default();
        let resources: ResourceRegistry = Arc::default();
        let client_info: Arc<RwLock<Option<Implementation>>> = Arc::default();
        let client_capabilities: Arc<RwLock<Option<ClientCapabilities>>> = Arc::default();
        let min_log_level: Arc<RwLock<Option<LoggingLevel>>> = Arc::default();
        let initialized = Arc::new(AtomicBool::new(false));

        {
            let info = server_info.clone();
            let caps = capabilities.clone();
            let client_info = client_info.clone();
            let client_capabilities = client_capabilities.clone();
            protocol.set_request_handler(Method::Initialize, move |params, _ctx| {
                let info = info.clone();
                let caps = caps.clone();
                let client_info = client_info.clone();
                let client_capabilities = client_capabilities.clone();
                async move {
                    let params: InitializeParams = parse_params(params)?;
                    info!(
                        "initialize from {} {} requesting protocol {}",
                        params.client_info.name,
                        params.client_info.version,
                        params.protocol_version
                    );

                    // Echo a version we speak; otherwise counter with the
                    // latest and let the client decide.
                    let version = if SUPPORTED_PROTOCOL_VERSIONS
                        .contains(&params.protocol_version.as_str())
                    {
                        params.protocol_version.clone()
                    } else {
                        LATEST_PROTOCOL_VERSION.to_string()
                    };

                    *client_info.write().unwrap() = Some(params.client_info);
                    *client_capabilities.write().unwrap() = Some(params.capabilities);

                    Ok(serde_json::to_value(InitializeResult {
                        protocol_version: version,
                        capabilities: caps,
                        server_info: info,
                    })?)
                }
            });
        }

        {
            let flag = initialized.clone();
            protocol.set_notification_handler(Method::NotificationInitialized, move |_params| {
                flag.store(true, Ordering::SeqCst);
                debug!("client reported initialized");
                async { Ok(()) }
            });
        }

        protocol.set_request_handler(Method::Ping, |_params, _ctx| async {
            Ok(serde_json::to_value(EmptyResult::default())?)
        });

        if capabilities.tools.is_some() {
            let registry = tools.clone();
            protocol.set_request_handler(Method::ToolsList, move |_params, _ctx| {
                let mut listed: Vec<Tool> = registry
                    .read()
                    .unwrap()
                    .values()
                    .map(|t| t.tool.clone())
                    .collect();
                listed.sort_by(|a, b| a.name.cmp(&b.name));
                async move { Ok(serde_json::to_value(ListToolsResult { tools: listed })?) }
            });

            let registry = tools.clone();
            protocol.set_request_handler(Method::ToolsCall, move |params, ctx| {
                let registry = registry.clone();
                async move {
                    let params: CallToolParams = parse_params(params)?;
                    let handler = registry
                        .read()
                        .unwrap()
                        .get(&params.name)
                        .map(|t| t.handler.clone())
                        .ok_or_else(|| {
                            McpError::InvalidParams(format!("unknown tool: {}", params.name))
                        })?;
                    let result = handler(params.arguments, ctx).await?;
                    Ok(serde_json::to_value(result)?)
                }
            });
        }

        if capabilities.prompts.is_some() {
            let registry = prompts.clone();
            protocol.set_request_handler(Method::PromptsList, move |_params, _ctx| {
                let mut listed: Vec<Prompt> = registry
                    .read()
                    .unwrap()
                    .values()
                    .map(|p| p.prompt.clone())
                    .collect();
                listed.sort_by(|a, b| a.name.cmp(&b.name));
                async move { Ok(serde_json::to_value(ListPromptsResult { prompts: listed })?) }
            });

            let registry = prompts.clone();
            protocol.set_request_handler(Method::PromptsGet, move |params, ctx| {
                let registry = registry.clone();
                async move {
                    let params: GetPromptParams = parse_params(params)?;
                    let handler = registry
                        .read()
                        .unwrap()
                        .get(&params.name)
                        .map(|p| p.handler.clone())
                        .ok_or_else(|| {
                            McpError::InvalidParams(format!("unknown prompt: {}", params.name))
                        })?;
                    let result = handler(params.arguments, ctx).await?;
                    Ok(serde_json::to_value(result)?)
                }
            });
        }

        if capabilities.resources.is_some() {
            let registry = resources.clone();
            protocol.set_request_handler(Method::ResourcesList, move |_params, _ctx| {
                let mut listed: Vec<Resource> = registry
                    .read()
                    .unwrap()
                    .values()
                    .map(|r| r.resource.clone())
                    .collect();
                listed.sort_by(|a, b| a.uri.cmp(&b.uri));
                async move {
                    Ok(serde_json::to_value(ListResourcesResult { resources: listed })?)
                }
            });

            let registry = resources.clone();
            protocol.set_request_handler(Method::ResourcesRead, move |params, ctx| {
                let registry = registry.clone();
                async move {
                    let params: ReadResourceParams = parse_params(params)?;
                    let handler = registry
                        .read()
                        .unwrap()
                        .get(&params.uri)
                        .map(|r| r.handler.clone())
                        .ok_or_else(|| {
                            McpError::InvalidParams(format!("unknown resource: {}", params.uri))
                        })?;
                    let result = handler(ctx).await?;
                    Ok(serde_json::to_value(result)?)
                }
            });
        }

        if capabilities.logging.is_some() {
            let level_slot = min_log_level.clone();
            protocol.set_request_handler(Method::LoggingSetLevel, move |params, _ctx| {
                let level_slot = level_slot.clone();
                async move {
                    let params: SetLevelParams = parse_params(params)?;
                    debug!("client set logging level to {:?}", params.level);
                    *level_slot.write().unwrap() = Some(params.level);
                    Ok(serde_json::to_value(EmptyResult::default())?)
                }
            });
        }

        Self {
            protocol,
            server_info,
            capabilities,
            tools,
            prompts,
            resources,
            client_info,
            client_capabilities,
            min_log_level,
            initialized,
        }
    }

    /// Bind to a transport and start serving.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.protocol.connect(transport).await
    }

    /// Implementation info this server declares.
    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// Capabilities the client declared, once the handshake has happened.
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.read().unwrap().clone()
    }

    /// Implementation info the client declared, once the handshake has
    /// happened.
    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().unwrap().clone()
    }

    /// Whether the client has sent `notifications/initialized`.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Direct access to the underlying engine, for custom methods and
    /// notification subscriptions.
    pub fn engine(&self) -> &Protocol {
        &self.protocol
    }

    /// Register a tool. Returns `true` when the name was new, `false` when
    /// an existing registration was replaced. Requires the declared `tools`
    /// capability.
    pub async fn add_tool<F, Fut>(&self, tool: Tool, handler: F) -> Result<bool>
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        let declared = self
            .capabilities
            .tools
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("tools".to_string()))?
            .clone();

        let handler: ToolHandler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        let replaced = self
            .tools
            .write()
            .unwrap()
            .insert(tool.name.clone(), RegisteredTool { tool, handler })
            .is_some();

        self.notify_list_changed(
            Method::NotificationToolsListChanged,
            declared.list_changed == Some(true),
        )
        .await;
        Ok(!replaced)
    }

    /// Remove a tool by name. Returns whether it was registered.
    pub async fn remove_tool(&self, name: &str) -> Result<bool> {
        let declared = self
            .capabilities
            .tools
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("tools".to_string()))?
            .clone();

        let removed = self.tools.write().unwrap().remove(name).is_some();
        self.notify_list_changed(
            Method::NotificationToolsListChanged,
            removed && declared.list_changed == Some(true),
        )
        .await;
        Ok(removed)
    }

    /// Register a prompt. Returns `true` when the name was new. Requires
    /// the declared `prompts` capability.
    pub async fn add_prompt<F, Fut>(&self, prompt: Prompt, handler: F) -> Result<bool>
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult>> + Send + 'static,
    {
        let declared = self
            .capabilities
            .prompts
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("prompts".to_string()))?
            .clone();

        let handler: PromptHandler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        let replaced = self
            .prompts
            .write()
            .unwrap()
            .insert(prompt.name.clone(), RegisteredPrompt { prompt, handler })
            .is_some();

        self.notify_list_changed(
            Method::NotificationPromptsListChanged,
            declared.list_changed == Some(true),
        )
        .await;
        Ok(!replaced)
    }

    /// Remove a prompt by name. Returns whether it was registered.
    pub async fn remove_prompt(&self, name: &str) -> Result<bool> {
        let declared = self
            .capabilities
            .prompts
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("prompts".to_string()))?
            .clone();

        let removed = self.prompts.write().unwrap().remove(name).is_some();
        self.notify_list_changed(
            Method::NotificationPromptsListChanged,
            removed && declared.list_changed == Some(true),
        )
        .await;
        Ok(removed)
    }

    /// Register a resource. Returns `true` when the URI was new. Requires
    /// the declared `resources` capability.
    pub async fn add_resource<F, Fut>(&self, resource: Resource, handler: F) -> Result<bool>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult>> + Send + 'static,
    {
        let declared = self
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("resources".to_string()))?
            .clone();

        let handler: ResourceHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        let replaced = self
            .resources
            .write()
            .unwrap()
            .insert(
                resource.uri.clone(),
                RegisteredResource { resource, handler },
            )
            .is_some();

        self.notify_list_changed(
            Method::NotificationResourcesListChanged,
            declared.list_changed == Some(true),
        )
        .await;
        Ok(!replaced)
    }

    /// Remove a resource by URI. Returns whether it was registered.
    pub async fn remove_resource(&self, uri: &str) -> Result<bool> {
        let declared = self
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| McpError::CapabilityUnsupported("resources".to_string()))?
            .clone();

        let removed = self.resources.write().unwrap().remove(uri).is_some();
        self.notify_list_changed(
            Method::NotificationResourcesListChanged,
            removed && declared.list_changed == Some(true),
        )
        .await;
        Ok(removed)
    }

    /// Health-check the client.
    pub async fn ping(&self) -> Result<()> {
        self.protocol
            .request(Method::Ping, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Ask the client for its filesystem roots. Requires the client's
    /// declared `roots` capability.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        let supported = self
            .client_capabilities
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|caps| caps.roots.is_some());
        if !supported {
            return Err(McpError::CapabilityUnsupported(
                "client does not support roots".to_string(),
            ));
        }

        let raw = self
            .protocol
            .request(Method::RootsList, None, RequestOptions::default())
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Emit a `notifications/message` log entry. Requires the declared
    /// `logging` capability; entries below the client-selected minimum
    /// level are dropped silently.
    pub async fn send_log_message(&self, params: LoggingMessageParams) -> Result<()> {
        if self.capabilities.logging.is_none() {
            return Err(McpError::CapabilityUnsupported("logging".to_string()));
        }
        if let Some(min) = *self.min_log_level.read().unwrap() {
            if params.level < min {
                return Ok(());
            }
        }
        self.protocol
            .notification(
                Method::NotificationMessage,
                Some(serde_json::to_value(params)?),
            )
            .await
    }

    /// Tear down the connection.
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await
    }

    /// Best effort: registry mutations are legal before a client connects,
    /// when there is no one to notify yet.
    async fn notify_list_changed(&self, method: Method, should_notify: bool) {
        if !should_notify {
            return;
        }
        if let Err(e) = self.protocol.notification(method.clone(), None).await {
            debug!("{} not delivered: {}", method, e);
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))
}
