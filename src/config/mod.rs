//! Configuration module for AuthBridge
//!
//! Provides configuration loading from YAML with environment-variable
//! overrides layered on top.

mod config;
mod environment;

pub use config::{
    AuthConfig, AuthStrategy, CimdConfig, Config, OAuthClientConfig, ProviderConfig, ServerConfig,
    StorageConfig, ThrottlingConfig,
};
pub use environment::apply_env_overrides;
