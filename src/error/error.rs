//! Error types and handling for AuthBridge

use thiserror::Error;

/// Result type alias for AuthBridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for AuthBridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// MCP protocol errors
    #[error("MCP protocol error: {message}")]
    Mcp { message: String },

    /// Authentication errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Security errors (origin validation, SSRF guard)
    #[error("Security error: {message}")]
    Security { message: String },

    /// Token / session storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// OAuth flow errors carrying an OAuth 2.1 error code
    #[error("OAuth error: {message}")]
    OAuth { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Connection errors (transport, upstream provider)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an MCP protocol error
    pub fn mcp<S: Into<String>>(message: S) -> Self {
        Self::Mcp {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a security error
    pub fn security<S: Into<String>>(message: S) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an OAuth flow error
    pub fn oauth<S: Into<String>>(message: S) -> Self {
        Self::OAuth {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error (using connection error type)
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: format!("Timeout: {}", message.into()),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Http(_) | BridgeError::Io(_) | BridgeError::Connection { .. }
        )
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Config { .. } => "config",
            BridgeError::Mcp { .. } => "mcp",
            BridgeError::Auth { .. } => "auth",
            BridgeError::Security { .. } => "security",
            BridgeError::Storage { .. } => "storage",
            BridgeError::OAuth { .. } => "oauth",
            BridgeError::Validation { .. } => "validation",
            BridgeError::Connection { .. } => "connection",
            BridgeError::Io(_) => "io",
            BridgeError::Serde(_) => "serialization",
            BridgeError::Yaml(_) => "yaml",
            BridgeError::Http(_) => "http",
            BridgeError::Internal(_) => "internal",
        }
    }
}

impl Clone for BridgeError {
    fn clone(&self) -> Self {
        match self {
            BridgeError::Config { message } => BridgeError::Config { message: message.clone() },
            BridgeError::Mcp { message } => BridgeError::Mcp { message: message.clone() },
            BridgeError::Auth { message } => BridgeError::Auth { message: message.clone() },
            BridgeError::Security { message } => BridgeError::Security { message: message.clone() },
            BridgeError::Storage { message } => BridgeError::Storage { message: message.clone() },
            BridgeError::OAuth { message } => BridgeError::OAuth { message: message.clone() },
            BridgeError::Validation { message } => BridgeError::Validation { message: message.clone() },
            BridgeError::Connection { message } => BridgeError::Connection { message: message.clone() },

            // For non-cloneable source types, fall back to the string form
            BridgeError::Io(e) => BridgeError::storage(format!("IO error: {}", e)),
            BridgeError::Serde(e) => BridgeError::storage(format!("Serialization error: {}", e)),
            BridgeError::Yaml(e) => BridgeError::config(format!("YAML error: {}", e)),
            BridgeError::Http(e) => BridgeError::connection(format!("HTTP error: {}", e)),
            BridgeError::Internal(e) => BridgeError::mcp(format!("Internal error: {}", e)),
        }
    }
}
