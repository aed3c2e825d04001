//! OAuth discovery documents (RFC 8414 and RFC 9728)

use crate::config::Config;
use serde_json::{json, Value};

/// RFC 8414 authorization-server metadata
pub fn authorization_server_metadata(config: &Config, base_url: &str) -> Value {
    if let Some(discovery_url) = &config.auth.discovery_url {
        return json!({
            "issuer": base_url,
            "authorization_endpoint": format!("{}/authorize", base_url),
            "token_endpoint": format!("{}/token", base_url),
            "registration_endpoint": format!("{}/register", base_url),
            "revocation_endpoint": format!("{}/revoke", base_url),
            "external_discovery": discovery_url,
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["none"],
        });
    }

    json!({
        "issuer": base_url,
        "authorization_endpoint": format!("{}/authorize", base_url),
        "token_endpoint": format!("{}/token", base_url),
        "registration_endpoint": format!("{}/register", base_url),
        "revocation_endpoint": format!("{}/revoke", base_url),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
    })
}

/// RFC 9728 protected-resource metadata
///
/// `sid` correlates the challenge that pointed the client here back to its
/// MCP session.
pub fn protected_resource_metadata(config: &Config, base_url: &str, sid: Option<&str>) -> Value {
    let resource = config
        .auth
        .resource_uri
        .clone()
        .unwrap_or_else(|| format!("{}/mcp", base_url));

    let mut doc = json!({
        "resource": resource,
        "authorization_servers": [base_url],
        "bearer_methods_supported": ["header"],
        "resource_documentation": format!("{}/health", base_url),
    });

    if let Some(sid) = sid {
        doc["mcp_session_id"] = json!(sid);
    }
    doc
}
