//! MCP protocol types
//!
//! JSON-RPC message shapes, tool/prompt/resource definitions, server
//! capabilities, and the protocol version tables.

use crate::error::{BridgeError, Result};
use crate::mcp::errors::McpError;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol versions the dispatcher negotiates at `initialize`, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-06-18", "2025-03-26", "2024-11-05", "2024-10-07"];

/// Latest (default) protocol version
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Versions accepted in the `Mcp-Protocol-Version` header check
///
/// `2025-11-25` is recognized here but negotiated down at `initialize`;
/// both tables derive from one place so they cannot drift.
pub const ACCEPTED_HEADER_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05", "2024-10-07"];

/// Negotiate a protocol version: unknown offers fall back to the latest
pub fn negotiate_protocol_version(client_version: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == client_version)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

/// JSON-RPC request or notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request id; absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Whether this message is a notification (no id)
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Stringified request id for registry keys and logs
    pub fn id_string(&self) -> Option<String> {
        self.id.as_ref().map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request id this responds to
    pub id: Value,
    /// Result (if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    /// Build a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Incoming `/mcp` body: one message or a batch
#[derive(Debug, Clone)]
pub enum McpBody {
    /// A single request or notification
    Single(McpRequest),
    /// A batch of requests/notifications
    Batch(Vec<McpRequest>),
}

impl McpBody {
    /// Parse raw bytes into a tagged single/batch variant
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::validation(format!("Invalid JSON: {}", e)))?;

        match value {
            Value::Array(items) => {
                let messages = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<Vec<McpRequest>, _>>()
                    .map_err(|e| BridgeError::validation(format!("Invalid JSON-RPC batch: {}", e)))?;
                Ok(McpBody::Batch(messages))
            }
            single => {
                let message = serde_json::from_value(single)
                    .map_err(|e| BridgeError::validation(format!("Invalid JSON-RPC request: {}", e)))?;
                Ok(McpBody::Single(message))
            }
        }
    }

    /// All messages in submission order
    pub fn messages(&self) -> Vec<&McpRequest> {
        match self {
            McpBody::Single(message) => vec![message],
            McpBody::Batch(messages) => messages.iter().collect(),
        }
    }

    /// Whether any message is the given method
    pub fn contains_method(&self, method: &str) -> bool {
        self.messages().iter().any(|m| m.method == method)
    }
}

/// MCP tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (unique identifier)
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    /// JSON Schema for input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Optional JSON Schema for structured output validation
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Optional MCP annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

impl Tool {
    /// Create a new tool, validating the input schema compiles
    pub fn new(name: String, description: String, input_schema: Value) -> Result<Self> {
        let tool = Tool {
            name,
            description: Some(description),
            input_schema,
            output_schema: None,
            annotations: None,
        };
        tool.validate_input_schema()?;
        Ok(tool)
    }

    /// Attach an output schema
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Attach annotations
    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Validate that the input schema is a valid JSON Schema
    pub fn validate_input_schema(&self) -> Result<()> {
        match JSONSchema::compile(&self.input_schema) {
            Ok(_) => Ok(()),
            Err(e) => Err(BridgeError::validation(format!(
                "Invalid JSON Schema for tool '{}': {}",
                self.name, e
            ))),
        }
    }

    /// Validate arguments against the input schema
    pub fn validate_arguments(&self, arguments: &Value) -> Result<()> {
        let schema = JSONSchema::compile(&self.input_schema).map_err(|e| {
            BridgeError::validation(format!("Failed to compile schema for tool '{}': {}", self.name, e))
        })?;

        let result = match schema.validate(arguments) {
            Ok(_) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
                Err(BridgeError::validation(messages.join("; ")))
            }
        };
        result
    }
}

/// MCP tool annotations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnnotations {
    /// Display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Indicates if tool is read-only
    #[serde(rename = "readOnlyHint", skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    /// Indicates if tool is destructive
    #[serde(rename = "destructiveHint", skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    /// Indicates if tool is idempotent
    #[serde(rename = "idempotentHint", skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

/// MCP prompt definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Prompt name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Prompt arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

/// One prompt argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument is required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// MCP resource definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Resource URI (unique identifier)
    pub uri: String,
    /// Human-readable name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource content
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// MCP resource template definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// URI template (RFC 6570)
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    /// Human-readable name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of resolved resources
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Content item in a tool result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    /// Text content
    #[serde(rename = "text")]
    Text {
        /// Text payload
        text: String,
    },
    /// Image content (base64 encoded)
    #[serde(rename = "image")]
    Image {
        /// Base64 encoded image data
        data: String,
        /// MIME type
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ToolContent {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content items
    pub content: Vec<ToolContent>,
    /// Structured content matching the declared output schema
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Whether this result represents an error
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    /// Build a plain text success result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            structured_content: None,
            is_error: false,
        }
    }

    /// Build a plain text error result
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            structured_content: None,
            is_error: true,
        }
    }
}

/// MCP log levels following RFC 5424 syslog severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    /// Parse a log level from its wire name
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "notice" => Ok(LogLevel::Notice),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "alert" => Ok(LogLevel::Alert),
            "emergency" => Ok(LogLevel::Emergency),
            other => Err(BridgeError::validation(format!("Invalid log level: {}", other))),
        }
    }
}

/// Server capabilities advertised at initialize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Logging capability
    pub logging: Value,
    /// Prompt capability
    pub prompts: ListChangedCapability,
    /// Resource capability
    pub resources: ResourcesCapability,
    /// Tool capability
    pub tools: ListChangedCapability,
}

/// Capability advertising list_changed notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChangedCapability {
    /// Whether list_changed notifications are emitted
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Resource capability with subscribe support
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesCapability {
    /// Whether list_changed notifications are emitted
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
    /// Whether per-resource subscription is supported
    pub subscribe: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            logging: serde_json::json!({}),
            prompts: ListChangedCapability { list_changed: true },
            resources: ResourcesCapability {
                list_changed: true,
                subscribe: true,
            },
            tools: ListChangedCapability { list_changed: true },
        }
    }
}
