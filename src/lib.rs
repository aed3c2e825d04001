//! AuthBridge - MCP server and OAuth 2.1 resource server
//!
//! Exposes a JSON-RPC MCP surface over Streamable HTTP while brokering
//! access to an upstream identity provider: clients present either a direct
//! credential or a bridge-issued RS token that is mapped to a live upstream
//! token and refreshed transparently.

pub mod auth;
pub mod config;
pub mod error;
pub mod mcp;
pub mod oauth;
pub mod server;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{BridgeError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "authbridge.yaml";
