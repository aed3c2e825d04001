//! Environment variable resolution for configuration
//!
//! Environment variables take precedence over YAML file values. The
//! recognized keys mirror the deployment surface of the original service.

use crate::config::Config;
use crate::error::Result;
use std::env;
use tracing::debug;

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Apply recognized environment variables on top of `config`
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    // Server
    if let Some(host) = env_string("HOST") {
        config.server.host = host;
    }
    if let Some(port) = env_string("PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| crate::error::BridgeError::config(format!("Invalid PORT: {}", port)))?;
    }
    if let Some(node_env) = env_string("NODE_ENV") {
        config.server.environment = node_env;
    }
    if let Some(title) = env_string("MCP_TITLE") {
        config.server.title = title;
    }
    if let Some(version) = env_string("MCP_VERSION") {
        config.server.version = version;
    }
    if let Some(protocol) = env_string("MCP_PROTOCOL_VERSION") {
        config.server.protocol_version = protocol;
    }
    if let Some(instructions) = env_string("MCP_INSTRUCTIONS") {
        config.server.instructions = Some(instructions);
    }
    if let Some(headers) = env_string("MCP_ACCEPT_HEADERS") {
        config.server.accept_headers = headers
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
    }
    if let Some(level) = env_string("LOG_LEVEL") {
        config.server.log_level = level;
    }

    // Auth
    if let Some(strategy) = env_string("AUTH_STRATEGY") {
        config.auth.strategy = strategy.parse()?;
    }
    if let Some(enabled) = env_bool("AUTH_ENABLED") {
        config.auth.enabled = enabled;
    }
    if let Some(require_rs) = env_bool("AUTH_REQUIRE_RS") {
        config.auth.require_rs = require_rs;
    }
    if let Some(allow_direct) = env_bool("AUTH_ALLOW_DIRECT_BEARER") {
        config.auth.allow_direct_bearer = allow_direct;
    }
    if let Some(uri) = env_string("AUTH_RESOURCE_URI") {
        config.auth.resource_uri = Some(uri);
    }
    if let Some(url) = env_string("AUTH_DISCOVERY_URL") {
        config.auth.discovery_url = Some(url);
    }
    if let Some(key) = env_string("API_KEY") {
        config.auth.api_key = Some(key);
    }
    if let Some(header) = env_string("API_KEY_HEADER") {
        config.auth.api_key_header = header.to_lowercase();
    }
    if let Some(token) = env_string("BEARER_TOKEN") {
        config.auth.bearer_token = Some(token);
    }
    if let Some(raw) = env_string("CUSTOM_HEADERS") {
        // Comma-separated k:v pairs
        config.auth.custom_headers = raw
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once(':')?;
                let k = k.trim().to_lowercase();
                let v = v.trim().to_string();
                if k.is_empty() || v.is_empty() {
                    None
                } else {
                    Some((k, v))
                }
            })
            .collect();
    }

    // OAuth endpoints
    if let Some(id) = env_string("OAUTH_CLIENT_ID") {
        config.oauth.client_id = Some(id);
    }
    if let Some(secret) = env_string("OAUTH_CLIENT_SECRET") {
        config.oauth.client_secret = Some(secret);
    }
    if let Some(scopes) = env_string("OAUTH_SCOPES") {
        config.oauth.scopes = Some(scopes);
    }
    if let Some(url) = env_string("OAUTH_AUTHORIZATION_URL") {
        config.oauth.authorization_url = Some(url);
    }
    if let Some(url) = env_string("OAUTH_TOKEN_URL") {
        config.oauth.token_url = Some(url);
    }
    if let Some(url) = env_string("OAUTH_REVOCATION_URL") {
        config.oauth.revocation_url = Some(url);
    }
    if let Some(uri) = env_string("OAUTH_REDIRECT_URI") {
        config.oauth.redirect_uri = Some(uri);
    }
    if let Some(list) = env_string("OAUTH_REDIRECT_ALLOWLIST") {
        config.oauth.redirect_allowlist = list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(allow_all) = env_bool("OAUTH_REDIRECT_ALLOW_ALL") {
        config.oauth.redirect_allow_all = allow_all;
    }
    if let Some(raw) = env_string("OAUTH_EXTRA_AUTH_PARAMS") {
        config.oauth.extra_auth_params = raw
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once(':')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
    }

    // CIMD
    if let Some(enabled) = env_bool("CIMD_ENABLED") {
        config.cimd.enabled = enabled;
    }
    if let Some(timeout) = env_string("CIMD_FETCH_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse() {
            config.cimd.fetch_timeout_ms = ms;
        }
    }
    if let Some(bytes) = env_string("CIMD_MAX_RESPONSE_BYTES") {
        if let Ok(b) = bytes.parse() {
            config.cimd.max_response_bytes = b;
        }
    }
    if let Some(domains) = env_string("CIMD_ALLOWED_DOMAINS") {
        config.cimd.allowed_domains = domains
            .split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
    }

    // Provider
    if let Some(id) = env_string("PROVIDER_CLIENT_ID") {
        config.provider.client_id = Some(id);
    }
    if let Some(secret) = env_string("PROVIDER_CLIENT_SECRET") {
        config.provider.client_secret = Some(secret);
    }
    if let Some(url) = env_string("PROVIDER_API_URL") {
        config.provider.api_url = Some(url);
    }
    if let Some(url) = env_string("PROVIDER_ACCOUNTS_URL") {
        config.provider.accounts_url = Some(url);
    }

    // Storage
    if let Some(path) = env_string("RS_TOKENS_FILE") {
        config.storage.rs_tokens_file = Some(path);
    }
    if let Some(key) = env_string("RS_TOKENS_ENC_KEY") {
        config.storage.rs_tokens_enc_key = Some(key);
    }

    // Throttling
    if let Some(rps) = env_string("RPS_LIMIT") {
        if let Ok(limit) = rps.parse() {
            config.throttling.rps_limit = limit;
        }
    }
    if let Some(concurrency) = env_string("CONCURRENCY_LIMIT") {
        if let Ok(limit) = concurrency.parse() {
            config.throttling.concurrency_limit = limit;
        }
    }

    debug!("Applied environment overrides to configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_headers_parsing() {
        // Exercise the parsing logic directly rather than mutating process env
        let raw = "x-tenant: acme, x-region:eu-west-1, malformed";
        let headers: std::collections::HashMap<String, String> = raw
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once(':')?;
                let k = k.trim().to_lowercase();
                let v = v.trim().to_string();
                if k.is_empty() || v.is_empty() {
                    None
                } else {
                    Some((k, v))
                }
            })
            .collect();

        assert_eq!(headers.get("x-tenant"), Some(&"acme".to_string()));
        assert_eq!(headers.get("x-region"), Some(&"eu-west-1".to_string()));
        assert_eq!(headers.len(), 2);
    }
}
