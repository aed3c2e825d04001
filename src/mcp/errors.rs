//! JSON-RPC 2.0 compliant error handling for the MCP surface

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error codes used by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpErrorCode {
    // Standard JSON-RPC error codes
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,

    // Auth/session envelope errors
    ServerError = -32000,
}

impl McpErrorCode {
    /// Get the error code as i32
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Get a default message for this error code
    pub fn default_message(&self) -> &'static str {
        match self {
            McpErrorCode::ParseError => "Parse error",
            McpErrorCode::InvalidRequest => "Invalid request",
            McpErrorCode::MethodNotFound => "Method not found",
            McpErrorCode::InvalidParams => "Invalid params",
            McpErrorCode::InternalError => "Internal error",
            McpErrorCode::ServerError => "Server error",
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    /// Create a new error
    pub fn new(code: McpErrorCode, message: String) -> Self {
        Self {
            code: code.code(),
            message,
            data: None,
        }
    }

    /// Create a new error with additional data
    pub fn with_data(code: McpErrorCode, message: String, data: Value) -> Self {
        Self {
            code: code.code(),
            message,
            data: Some(data),
        }
    }

    /// Create a parse error
    pub fn parse_error(message: String) -> Self {
        Self::new(McpErrorCode::ParseError, message)
    }

    /// Create an invalid request error
    pub fn invalid_request(message: String) -> Self {
        Self::new(McpErrorCode::InvalidRequest, message)
    }

    /// Create a method not found error
    pub fn method_not_found(method: String) -> Self {
        Self::with_data(
            McpErrorCode::MethodNotFound,
            format!("Method '{}' not found", method),
            serde_json::json!({ "method": method }),
        )
    }

    /// Create an invalid params error
    pub fn invalid_params(message: String) -> Self {
        Self::new(McpErrorCode::InvalidParams, message)
    }

    /// Create an internal error
    pub fn internal_error(message: String) -> Self {
        Self::new(McpErrorCode::InternalError, message)
    }

    /// Create a server (envelope) error
    pub fn server_error(message: String) -> Self {
        Self::new(McpErrorCode::ServerError, message)
    }

    /// The canonical cancellation error
    pub fn cancelled() -> Self {
        Self::new(McpErrorCode::InternalError, "Request was cancelled".to_string())
    }
}

impl From<BridgeError> for McpError {
    fn from(error: BridgeError) -> Self {
        match &error {
            BridgeError::Validation { message } => McpError::invalid_params(message.clone()),
            BridgeError::Auth { message } => McpError::server_error(message.clone()),
            BridgeError::Security { message } => McpError::server_error(message.clone()),
            BridgeError::Mcp { message } => McpError::internal_error(message.clone()),
            // Details are logged at the dispatch boundary; clients get a generic message
            _ => McpError::internal_error("Internal error".to_string()),
        }
    }
}
