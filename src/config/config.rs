//! Configuration management for AuthBridge

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_title() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_protocol_version() -> String {
    "2025-06-18".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_cimd_timeout_ms() -> u64 {
    5_000
}

fn default_cimd_max_bytes() -> usize {
    64 * 1024
}

fn default_rps_limit() -> f64 {
    10.0
}

fn default_concurrency_limit() -> usize {
    5
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication strategy configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Downstream-facing OAuth endpoints configuration
    #[serde(default)]
    pub oauth: OAuthClientConfig,
    /// Client-ID-as-Metadata-Document configuration
    #[serde(default)]
    pub cimd: CimdConfig,
    /// Upstream identity provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Token storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upstream HTTP throttling configuration
    #[serde(default)]
    pub throttling: ThrottlingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deployment environment ("development" or "production")
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Server title advertised at initialize
    #[serde(default = "default_title")]
    pub title: String,
    /// Server version advertised at initialize
    #[serde(default = "default_version")]
    pub version: String,
    /// Preferred MCP protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Instructions string returned at initialize
    #[serde(default)]
    pub instructions: Option<String>,
    /// Extra request headers forwarded to resolved auth headers
    #[serde(default)]
    pub accept_headers: Vec<String>,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            title: default_title(),
            version: default_version(),
            protocol_version: default_protocol_version(),
            instructions: None,
            accept_headers: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Whether the server runs in development mode
    pub fn is_development(&self) -> bool {
        self.environment != "production"
    }

    /// Base URL of this server as seen by local clients
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Authentication strategy enumeration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Identity pass-through
    #[default]
    None,
    /// Static API key injected from configuration
    ApiKey,
    /// Static bearer token injected from configuration
    Bearer,
    /// Arbitrary static headers injected from configuration
    Custom,
    /// RS-token brokering against the upstream provider
    OAuth,
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::None => write!(f, "none"),
            AuthStrategy::ApiKey => write!(f, "api_key"),
            AuthStrategy::Bearer => write!(f, "bearer"),
            AuthStrategy::Custom => write!(f, "custom"),
            AuthStrategy::OAuth => write!(f, "oauth"),
        }
    }
}

impl std::str::FromStr for AuthStrategy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AuthStrategy::None),
            "api_key" => Ok(AuthStrategy::ApiKey),
            "bearer" => Ok(AuthStrategy::Bearer),
            "custom" => Ok(AuthStrategy::Custom),
            "oauth" => Ok(AuthStrategy::OAuth),
            other => Err(BridgeError::config(format!("Unknown auth strategy: {}", other))),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Enable authentication enforcement
    #[serde(default)]
    pub enabled: bool,
    /// Credential strategy
    #[serde(default)]
    pub strategy: AuthStrategy,
    /// Require a resolvable RS token under the oauth strategy
    #[serde(default = "default_true")]
    pub require_rs: bool,
    /// Allow direct (non-RS) bearer tokens to pass through
    #[serde(default)]
    pub allow_direct_bearer: bool,
    /// Resource URI advertised in protected-resource metadata
    #[serde(default)]
    pub resource_uri: Option<String>,
    /// External discovery URL override for authorization-server metadata
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Static API key (api_key strategy)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// Static bearer token (bearer strategy)
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Static custom headers (custom strategy)
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: AuthStrategy::None,
            require_rs: true,
            allow_direct_bearer: false,
            resource_uri: None,
            discovery_url: None,
            api_key: None,
            api_key_header: default_api_key_header(),
            bearer_token: None,
            custom_headers: HashMap::new(),
        }
    }
}

/// Downstream OAuth endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    /// Client ID used against the upstream provider in the authorize URL
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret used against the upstream provider
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Scopes requested from the upstream provider
    #[serde(default)]
    pub scopes: Option<String>,
    /// Upstream authorization URL
    #[serde(default)]
    pub authorization_url: Option<String>,
    /// Upstream token URL
    #[serde(default)]
    pub token_url: Option<String>,
    /// Upstream revocation URL
    #[serde(default)]
    pub revocation_url: Option<String>,
    /// This server's callback redirect URI override
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Allowlisted client redirect URIs
    #[serde(default)]
    pub redirect_allowlist: Vec<String>,
    /// Disable the redirect allowlist entirely
    #[serde(default)]
    pub redirect_allow_all: bool,
    /// Extra query parameters attached to the upstream authorize URL
    #[serde(default)]
    pub extra_auth_params: HashMap<String, String>,
}

/// CIMD (Client ID Metadata Document) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CimdConfig {
    /// Enable CIMD client resolution
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Metadata fetch timeout in milliseconds
    #[serde(default = "default_cimd_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Maximum metadata document size in bytes
    #[serde(default = "default_cimd_max_bytes")]
    pub max_response_bytes: usize,
    /// Allowed metadata domains (exact or leading-dot suffix match); empty allows any public host
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for CimdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_timeout_ms: default_cimd_timeout_ms(),
            max_response_bytes: default_cimd_max_bytes(),
            allowed_domains: Vec::new(),
        }
    }
}

/// Upstream identity provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider OAuth client id
    #[serde(default)]
    pub client_id: Option<String>,
    /// Provider OAuth client secret
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Provider API base URL
    #[serde(default)]
    pub api_url: Option<String>,
    /// Provider accounts (token endpoint) base URL
    #[serde(default)]
    pub accounts_url: Option<String>,
    /// Token endpoint path appended to accounts_url
    #[serde(default)]
    pub token_endpoint_path: Option<String>,
}

impl ProviderConfig {
    /// Whether client credentials for the upstream provider are configured
    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

/// Token storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// File path for the persisted RS token store; unset keeps tokens in memory
    #[serde(default)]
    pub rs_tokens_file: Option<String>,
    /// 32-byte url-safe-base64 AES-256-GCM key for the persisted file
    #[serde(default)]
    pub rs_tokens_enc_key: Option<String>,
    /// Remote KV namespace base URL; unset disables the KV backend
    #[serde(default)]
    pub kv_url: Option<String>,
    /// Bearer token for the remote KV namespace
    #[serde(default)]
    pub kv_token: Option<String>,
}

/// Upstream HTTP throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    /// Sustained upstream requests per second
    #[serde(default = "default_rps_limit")]
    pub rps_limit: f64,
    /// Maximum concurrent upstream requests
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            rps_limit: default_rps_limit(),
            concurrency_limit: default_concurrency_limit(),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&content)?
            }
            _ => Config::default(),
        };

        super::environment::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(BridgeError::config("Server port must be non-zero"));
        }

        match self.auth.strategy {
            AuthStrategy::ApiKey if self.auth.api_key.is_none() => {
                return Err(BridgeError::config("api_key strategy requires an API key"));
            }
            AuthStrategy::Bearer if self.auth.bearer_token.is_none() => {
                return Err(BridgeError::config("bearer strategy requires a bearer token"));
            }
            AuthStrategy::Custom if self.auth.custom_headers.is_empty() => {
                return Err(BridgeError::config("custom strategy requires custom headers"));
            }
            _ => {}
        }

        if let Some(key) = &self.storage.rs_tokens_enc_key {
            crate::storage::crypto::validate_key(key)?;
        }

        if self.throttling.rps_limit <= 0.0 {
            return Err(BridgeError::config("RPS limit must be positive"));
        }
        if self.throttling.concurrency_limit == 0 {
            return Err(BridgeError::config("Concurrency limit must be non-zero"));
        }

        Ok(())
    }

    /// Provider refresh settings for the token refresher, if configured
    pub fn refresher_provider(&self) -> Option<crate::auth::RefreshProviderConfig> {
        match (&self.provider.client_id, &self.provider.client_secret, &self.provider.accounts_url) {
            (Some(id), Some(secret), Some(accounts)) => Some(crate::auth::RefreshProviderConfig {
                client_id: id.clone(),
                client_secret: secret.clone(),
                accounts_url: accounts.clone(),
                token_endpoint_path: self.provider.token_endpoint_path.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.server.is_development());
    }

    #[test]
    fn test_api_key_strategy_requires_key() {
        let mut config = Config::default();
        config.auth.strategy = AuthStrategy::ApiKey;
        assert!(config.validate().is_err());

        config.auth.api_key = Some("k-123".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("oauth".parse::<AuthStrategy>().unwrap(), AuthStrategy::OAuth);
        assert_eq!("api_key".parse::<AuthStrategy>().unwrap(), AuthStrategy::ApiKey);
        assert!("saml".parse::<AuthStrategy>().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.auth.strategy, config.auth.strategy);
    }
}
