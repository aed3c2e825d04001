//! JSON-RPC method dispatch
//!
//! Routes requests and notifications to their handlers, negotiates the
//! protocol version at initialize, and owns the per-request cancellation
//! envelope around tools/call.

use crate::auth::ResolvedAuth;
use crate::mcp::context::RequestContextRegistry;
use crate::mcp::errors::McpError;
use crate::mcp::registry::{PromptRegistry, ResourceRegistry, ToolInvocation, ToolMeta, ToolRegistry};
use crate::mcp::types::{
    negotiate_protocol_version, LogLevel, McpRequest, McpResponse, ServerCapabilities, ToolResult,
};
use crate::storage::session_store::{SessionPatch, SessionStore};
use crate::utils::pagination::paginate_array;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Page size for prompts/list
pub const PROMPTS_PAGE_SIZE: usize = 50;

/// Page size for resources/templates/list
pub const RESOURCE_TEMPLATES_PAGE_SIZE: usize = 100;

/// Page size for resources/list
pub const RESOURCES_PAGE_SIZE: usize = 100;

/// Server identity advertised at initialize
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    /// Server name
    pub title: String,
    /// Server version
    pub version: String,
    /// Optional usage instructions
    pub instructions: Option<String>,
}

/// The MCP dispatcher
pub struct McpDispatcher {
    tools: Arc<ToolRegistry>,
    prompts: Arc<PromptRegistry>,
    resources: Arc<ResourceRegistry>,
    contexts: Arc<RequestContextRegistry>,
    sessions: Arc<dyn SessionStore>,
    identity: ServerIdentity,
    log_level: RwLock<LogLevel>,
}

impl McpDispatcher {
    /// Create a dispatcher
    pub fn new(
        tools: Arc<ToolRegistry>,
        prompts: Arc<PromptRegistry>,
        resources: Arc<ResourceRegistry>,
        contexts: Arc<RequestContextRegistry>,
        sessions: Arc<dyn SessionStore>,
        identity: ServerIdentity,
    ) -> Self {
        Self {
            tools,
            prompts,
            resources,
            contexts,
            sessions,
            identity,
            log_level: RwLock::new(LogLevel::Info),
        }
    }

    /// The request-context registry (shared with the HTTP façade)
    pub fn contexts(&self) -> Arc<RequestContextRegistry> {
        Arc::clone(&self.contexts)
    }

    /// Dispatch one message; notifications return None (acknowledged with 202)
    pub async fn dispatch(
        &self,
        request: &McpRequest,
        session_id: &str,
        auth: &ResolvedAuth,
    ) -> Option<McpResponse> {
        if request.is_notification() {
            self.handle_notification(request, session_id).await;
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        debug!("Dispatching {} (id {})", request.method, id);

        let outcome = match request.method.as_str() {
            "initialize" => self.handle_initialize(request, session_id).await,
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list().await,
            "tools/call" => self.handle_tools_call(request, session_id, auth).await,
            "prompts/list" => self.handle_prompts_list(request).await,
            "resources/list" => self.handle_resources_list(request).await,
            "resources/templates/list" => self.handle_resource_templates_list(request).await,
            "logging/setLevel" => self.handle_set_level(request).await,
            method => Err(McpError::method_not_found(method.to_string())),
        };

        Some(match outcome {
            Ok(result) => McpResponse::success(id, result),
            Err(error) => McpResponse::error(id, error),
        })
    }

    async fn handle_notification(&self, request: &McpRequest, session_id: &str) {
        match request.method.as_str() {
            "notifications/initialized" => {
                let patch = SessionPatch {
                    initialized: Some(true),
                    ..Default::default()
                };
                if let Err(e) = self.sessions.update(session_id, patch).await {
                    warn!("Failed to flag session {} initialized: {}", session_id, e);
                } else {
                    info!("Session {} initialized", session_id);
                }
            }
            "notifications/cancelled" => {
                let params = request.params.as_ref();
                let request_id = params
                    .and_then(|p| p.get("requestId"))
                    .map(|id| match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                let reason = params
                    .and_then(|p| p.get("reason"))
                    .and_then(|r| r.as_str())
                    .map(String::from);

                match request_id {
                    Some(request_id) => {
                        if self.contexts.cancel(&request_id, reason).await {
                            info!("Cancelled in-flight request {}", request_id);
                        } else {
                            // Unknown ids are accepted silently: the request
                            // may have already completed
                            debug!("Cancellation for unknown request id {}", request_id);
                        }
                    }
                    None => debug!("notifications/cancelled without requestId"),
                }
            }
            method => {
                debug!("Ignoring unknown notification {}", method);
            }
        }
    }

    async fn handle_initialize(
        &self,
        request: &McpRequest,
        session_id: &str,
    ) -> Result<Value, McpError> {
        let params = request.params.as_ref();
        let client_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or(crate::mcp::types::LATEST_PROTOCOL_VERSION);

        let negotiated = negotiate_protocol_version(client_version);
        let client_info = params.and_then(|p| p.get("clientInfo")).cloned();

        // On the first initialize the session record does not exist yet
        // (creation is deferred to the façade, which re-applies these fields);
        // this update takes effect only on re-initialization.
        let patch = SessionPatch {
            protocol_version: Some(negotiated.to_string()),
            client_info: client_info.clone(),
            ..Default::default()
        };
        if let Err(e) = self.sessions.update(session_id, patch).await {
            warn!("Failed to record initialize on session {}: {}", session_id, e);
        }

        info!(
            "Session {} initializing (client offered {}, negotiated {})",
            session_id, client_version, negotiated
        );

        Ok(json!({
            "protocolVersion": negotiated,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": {
                "name": self.identity.title,
                "version": self.identity.version,
            },
            "instructions": self.identity.instructions,
        }))
    }

    async fn handle_tools_list(&self) -> Result<Value, McpError> {
        let tools = self.tools.list().await;
        Ok(json!({ "tools": tools }))
    }

    async fn handle_tools_call(
        &self,
        request: &McpRequest,
        session_id: &str,
        auth: &ResolvedAuth,
    ) -> Result<Value, McpError> {
        let params = request
            .params
            .as_ref()
            .ok_or_else(|| McpError::invalid_params("tools/call requires params".to_string()))?;

        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| McpError::invalid_params("tools/call requires a tool name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let progress_token = params
            .get("_meta")
            .and_then(|m| m.get("progressToken"))
            .cloned();

        let (tool, handler) = self
            .tools
            .get(name)
            .await
            .ok_or_else(|| McpError::invalid_params(format!("Unknown tool: {}", name)))?;

        let request_id = request.id_string().unwrap_or_default();

        // The façade seeds the context before dispatch; fall back to creating
        // one here so an out-of-band notifications/cancelled can always find
        // the handle.
        let context = match self.contexts.get(&request_id).await {
            Some(context) => context,
            None => self.contexts.create(&request_id, session_id, auth.clone()).await,
        };

        let result = self
            .run_tool(tool, handler, arguments, context.token.clone(), auth, progress_token, &request_id)
            .await;

        // Teardown happens on every path out of the invocation
        self.contexts.delete(&request_id).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool(
        &self,
        tool: crate::mcp::types::Tool,
        handler: Arc<dyn crate::mcp::registry::ToolHandler>,
        arguments: Value,
        token: crate::mcp::context::CancellationToken,
        auth: &ResolvedAuth,
        progress_token: Option<Value>,
        request_id: &str,
    ) -> Result<Value, McpError> {
        if let Err(e) = tool.validate_arguments(&arguments) {
            let result = ToolResult::error(format!("Invalid input: {}", e));
            return serde_json::to_value(result)
                .map_err(|e| McpError::internal_error(e.to_string()));
        }

        let invocation = ToolInvocation {
            auth: auth.clone(),
            cancellation: token.clone(),
            meta: ToolMeta {
                progress_token,
                request_id: request_id.to_string(),
            },
        };

        let handler_future = handler.call(arguments, invocation);
        tokio::pin!(handler_future);

        let outcome = tokio::select! {
            // Completion wins the race against a simultaneous cancel: a
            // handler that already finished must not report cancellation.
            biased;
            result = &mut handler_future => Some(result),
            _ = token.cancelled() => None,
        };

        let result = match outcome {
            None => {
                info!("Tool call {} cancelled ({:?})", request_id, token.reason());
                return Err(McpError::cancelled());
            }
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                if token.is_cancelled() {
                    return Err(McpError::cancelled());
                }
                error!("Tool '{}' failed: {}", tool.name, e);
                ToolResult::error(format!("Tool execution failed: {}", e))
            }
        };

        // A declared output schema requires structured content
        let result = if tool.output_schema.is_some() && result.structured_content.is_none() {
            ToolResult::error(format!(
                "Tool '{}' declares an output schema but returned no structuredContent",
                tool.name
            ))
        } else {
            result
        };

        serde_json::to_value(result).map_err(|e| McpError::internal_error(e.to_string()))
    }

    async fn handle_prompts_list(&self, request: &McpRequest) -> Result<Value, McpError> {
        let prompts = self.prompts.list().await;
        self.paginated(&prompts, request, PROMPTS_PAGE_SIZE, "prompts")
    }

    async fn handle_resources_list(&self, request: &McpRequest) -> Result<Value, McpError> {
        let resources = self.resources.list().await;
        self.paginated(&resources, request, RESOURCES_PAGE_SIZE, "resources")
    }

    async fn handle_resource_templates_list(&self, request: &McpRequest) -> Result<Value, McpError> {
        let templates = self.resources.list_templates().await;
        self.paginated(&templates, request, RESOURCE_TEMPLATES_PAGE_SIZE, "resourceTemplates")
    }

    fn paginated<T: serde::Serialize + Clone>(
        &self,
        items: &[T],
        request: &McpRequest,
        page_size: usize,
        field: &str,
    ) -> Result<Value, McpError> {
        let cursor = request
            .params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(|c| c.as_str())
            .map(String::from);

        let page = paginate_array(items, cursor.as_deref(), page_size)
            .map_err(|e| McpError::invalid_params(e.to_string()))?;

        let items_value =
            serde_json::to_value(page.items).map_err(|e| McpError::internal_error(e.to_string()))?;
        let mut result = serde_json::Map::new();
        result.insert(field.to_string(), items_value);
        if let Some(next) = page.next_cursor {
            result.insert("nextCursor".to_string(), Value::String(next));
        }
        Ok(Value::Object(result))
    }

    async fn handle_set_level(&self, request: &McpRequest) -> Result<Value, McpError> {
        let level = request
            .params
            .as_ref()
            .and_then(|p| p.get("level"))
            .and_then(|l| l.as_str())
            .ok_or_else(|| McpError::invalid_params("logging/setLevel requires a level".to_string()))?;

        let parsed = LogLevel::parse(level)
            .map_err(|e| McpError::invalid_params(e.to_string()))?;

        *self.log_level.write().await = parsed;
        info!("Log level set to {}", level);
        Ok(json!({}))
    }

    /// The current client-requested log level
    pub async fn log_level(&self) -> LogLevel {
        *self.log_level.read().await
    }
}
