//! MCP protocol implementation
//!
//! JSON-RPC 2.0 over Streamable HTTP: message types, dispatch, per-request
//! cancellation, and the tool/prompt/resource registries.

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod types;

pub use context::{CancellationToken, RequestContext, RequestContextRegistry, CONTEXT_MAX_AGE};
pub use dispatcher::{McpDispatcher, ServerIdentity};
pub use errors::{McpError, McpErrorCode};
pub use registry::{
    PromptRegistry, ResourceRegistry, ToolHandler, ToolInvocation, ToolMeta, ToolRegistry,
};
pub use types::{
    negotiate_protocol_version, LogLevel, McpBody, McpRequest, McpResponse, Prompt, Resource,
    ResourceTemplate, ServerCapabilities, Tool, ToolContent, ToolResult,
    ACCEPTED_HEADER_VERSIONS, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
