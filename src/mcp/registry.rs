//! Tool, prompt and resource registries
//!
//! Thin registries that the dispatcher routes into. Handlers receive the
//! ambient credential snapshot, their cancellation handle, and request
//! metadata; long-running handlers must check the handle around suspension
//! points.

use crate::auth::ResolvedAuth;
use crate::error::Result;
use crate::mcp::context::CancellationToken;
use crate::mcp::types::{Prompt, Resource, ResourceTemplate, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Request metadata passed to tool handlers
#[derive(Debug, Clone)]
pub struct ToolMeta {
    /// Client-supplied progress token, if any
    pub progress_token: Option<Value>,
    /// The JSON-RPC request id driving this invocation
    pub request_id: String,
}

/// Everything a tool handler receives besides its arguments
#[derive(Clone)]
pub struct ToolInvocation {
    /// Credential snapshot resolved for this request
    pub auth: ResolvedAuth,
    /// Cancellation handle installed by the dispatcher
    pub cancellation: CancellationToken,
    /// Request metadata
    pub meta: ToolMeta,
}

/// A registered tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with validated arguments
    async fn call(&self, arguments: Value, invocation: ToolInvocation) -> Result<ToolResult>;
}

struct RegisteredTool {
    definition: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of callable tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<RegisteredTool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry carrying the built-in tools
    pub async fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        registry
            .register(
                Tool::new(
                    "echo".to_string(),
                    "Echo a message back to the caller".to_string(),
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "message": {"type": "string", "description": "Message to echo"}
                        },
                        "required": ["message"]
                    }),
                )?,
                Arc::new(EchoTool),
            )
            .await;
        registry
            .register(
                Tool::new(
                    "wait".to_string(),
                    "Wait for a duration; useful for exercising cancellation".to_string(),
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "duration_ms": {"type": "integer", "minimum": 0, "maximum": 60000}
                        },
                        "required": ["duration_ms"]
                    }),
                )?,
                Arc::new(WaitTool),
            )
            .await;
        Ok(registry)
    }

    /// Register a tool, replacing any existing definition with the same name
    pub async fn register(&self, definition: Tool, handler: Arc<dyn ToolHandler>) {
        let mut tools = self.tools.write().await;
        tools.retain(|t| t.definition.name != definition.name);
        tools.push(RegisteredTool { definition, handler });
    }

    /// All tool definitions in registration order
    pub async fn list(&self) -> Vec<Tool> {
        self.tools.read().await.iter().map(|t| t.definition.clone()).collect()
    }

    /// Look up a tool and its handler by name
    pub async fn get(&self, name: &str) -> Option<(Tool, Arc<dyn ToolHandler>)> {
        self.tools
            .read()
            .await
            .iter()
            .find(|t| t.definition.name == name)
            .map(|t| (t.definition.clone(), Arc::clone(&t.handler)))
    }
}

/// Registry of prompts (list-only dispatch contract)
#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<Vec<Prompt>>,
}

impl PromptRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt
    pub async fn register(&self, prompt: Prompt) {
        self.prompts.write().await.push(prompt);
    }

    /// All prompts in registration order
    pub async fn list(&self) -> Vec<Prompt> {
        self.prompts.read().await.clone()
    }
}

/// Registry of resources and resource templates (list-only dispatch contract)
#[derive(Default)]
pub struct ResourceRegistry {
    resources: RwLock<Vec<Resource>>,
    templates: RwLock<Vec<ResourceTemplate>>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource
    pub async fn register(&self, resource: Resource) {
        self.resources.write().await.push(resource);
    }

    /// Register a resource template
    pub async fn register_template(&self, template: ResourceTemplate) {
        self.templates.write().await.push(template);
    }

    /// All resources in registration order
    pub async fn list(&self) -> Vec<Resource> {
        self.resources.read().await.clone()
    }

    /// All resource templates in registration order
    pub async fn list_templates(&self) -> Vec<ResourceTemplate> {
        self.templates.read().await.clone()
    }
}

/// Built-in echo tool
struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, arguments: Value, _invocation: ToolInvocation) -> Result<ToolResult> {
        let message = arguments
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        Ok(ToolResult::text(message.to_string()))
    }
}

/// Built-in wait tool; checks its cancellation handle around the sleep
struct WaitTool;

#[async_trait]
impl ToolHandler for WaitTool {
    async fn call(&self, arguments: Value, invocation: ToolInvocation) -> Result<ToolResult> {
        let duration_ms = arguments
            .get("duration_ms")
            .and_then(|d| d.as_u64())
            .unwrap_or(0);

        invocation.cancellation.throw_if_cancelled()?;
        tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;
        invocation.cancellation.throw_if_cancelled()?;

        Ok(ToolResult::text(format!("Waited {}ms", duration_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            auth: ResolvedAuth::passthrough(),
            cancellation: CancellationToken::new(),
            meta: ToolMeta {
                progress_token: None,
                request_id: "1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_builtins_are_registered() {
        let registry = ToolRegistry::with_builtins().await.unwrap();
        let names: Vec<String> = registry.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["echo", "wait"]);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let registry = ToolRegistry::with_builtins().await.unwrap();
        let (_, handler) = registry.get("echo").await.unwrap();
        let result = handler
            .call(serde_json::json!({"message": "hello"}), invocation())
            .await
            .unwrap();
        assert!(!result.is_error);
        match &result.content[0] {
            crate::mcp::types::ToolContent::Text { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_respects_pre_cancelled_token() {
        let registry = ToolRegistry::with_builtins().await.unwrap();
        let (_, handler) = registry.get("wait").await.unwrap();

        let inv = invocation();
        inv.cancellation.cancel(Some("abort".to_string()));

        let result = handler.call(serde_json::json!({"duration_ms": 0}), inv).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let registry = ToolRegistry::new();
        let tool = Tool::new("t".to_string(), "v1".to_string(), serde_json::json!({"type": "object"})).unwrap();
        registry.register(tool, Arc::new(EchoTool)).await;

        let tool2 = Tool::new("t".to_string(), "v2".to_string(), serde_json::json!({"type": "object"})).unwrap();
        registry.register(tool2, Arc::new(EchoTool)).await;

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description.as_deref(), Some("v2"));
    }
}
