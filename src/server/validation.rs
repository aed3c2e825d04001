//! Request validation for the MCP façade
//!
//! Origin checks, protocol-version header checks, and construction of the
//! 401 challenge response.

use crate::error::{BridgeError, Result};
use crate::mcp::types::ACCEPTED_HEADER_VERSIONS;
use actix_web::{HttpRequest, HttpResponse};
use url::Url;

/// Hostname suffixes treated as local in development origin checks
const LOCAL_SUFFIXES: &[&str] = &[".local", ".localhost", ".internal", ".lan"];

fn is_loopback_or_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
    }
    LOCAL_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}

/// Production origin policy hook; deployments substitute an allowlist
fn production_origin_allowed(_origin: &str) -> bool {
    true
}

/// Validate the `Origin` header
///
/// Development: the header must be absent or name a loopback/private/local
/// host. Production: delegated to the policy hook (default allow).
pub fn validate_origin(req: &HttpRequest, development: bool) -> Result<()> {
    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        Some(origin) if !origin.is_empty() && origin != "null" => origin,
        _ => return Ok(()),
    };

    if !development {
        if production_origin_allowed(origin) {
            return Ok(());
        }
        return Err(BridgeError::security(format!("Origin not allowed: {}", origin)));
    }

    let host = Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(String::from))
        .ok_or_else(|| BridgeError::security(format!("Unparseable Origin: {}", origin)))?;

    if is_loopback_or_private_host(&host) {
        Ok(())
    } else {
        Err(BridgeError::security(format!(
            "Origin {} rejected in development mode",
            origin
        )))
    }
}

/// Validate the `Mcp-Protocol-Version` header (either casing)
///
/// The header may carry a comma-separated list; at least one entry must be
/// in the accepted set. An absent header passes.
pub fn validate_protocol_version(req: &HttpRequest) -> Result<()> {
    let header = match req
        .headers()
        .get("mcp-protocol-version")
        .and_then(|v| v.to_str().ok())
    {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(()),
    };

    let any_supported = header
        .split(',')
        .map(str::trim)
        .any(|version| ACCEPTED_HEADER_VERSIONS.contains(&version));

    if any_supported {
        Ok(())
    } else {
        Err(BridgeError::security(format!(
            "Unsupported MCP protocol version: {}",
            header
        )))
    }
}

/// Build the 401 challenge response
///
/// Carries the protected-resource pointer in `WWW-Authenticate` and echoes
/// the session id so the client can resume after authorizing.
pub fn challenge_response(base_url: &str, session_id: &str, message: &str) -> HttpResponse {
    let authorization_uri = format!(
        "{}/.well-known/oauth-protected-resource?sid={}",
        base_url, session_id
    );

    HttpResponse::Unauthorized()
        .insert_header((
            "WWW-Authenticate",
            format!(
                "Bearer realm=\"MCP\", authorization_uri=\"{}\"",
                authorization_uri
            ),
        ))
        .insert_header(("Mcp-Session-Id", session_id.to_string()))
        .json(serde_json::json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": message},
            "id": null
        }))
}
