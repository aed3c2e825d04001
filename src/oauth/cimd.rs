//! Client ID Metadata Document (CIMD) resolution
//!
//! A URL-shaped client_id is dereferenced to a metadata document listing the
//! client's permitted redirect URIs. The fetch is SSRF-guarded: HTTPS only,
//! no loopback/private/link-local hosts, no internal-suffix hostnames, no
//! redirects, bounded size and time.

use crate::config::CimdConfig;
use crate::oauth::OAuthFlowError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Hostnames rejected outright
const BLOCKED_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "0.0.0.0"];

/// Hostname suffixes that indicate internal infrastructure
const BLOCKED_SUFFIXES: &[&str] = &[".local", ".internal", ".localhost", ".localdomain", ".corp", ".lan"];

/// Client metadata document shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Must match the fetched URL exactly
    pub client_id: String,
    /// Permitted redirect URIs
    pub redirect_uris: Vec<String>,
    /// Optional display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Optional grant types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,
    /// Optional token endpoint auth method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
}

/// Whether a client_id should be treated as a CIMD URL
///
/// Requires an https scheme and a non-root path.
pub fn looks_like_cimd(client_id: &str) -> bool {
    match Url::parse(client_id) {
        Ok(url) => url.scheme() == "https" && url.path() != "/" && !url.path().is_empty(),
        Err(_) => false,
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    matches!(octets, [10, ..])
        || matches!(octets, [172, b, ..] if (16..=31).contains(&b))
        || matches!(octets, [192, 168, ..])
        || matches!(octets, [169, 254, ..])
        || ip.is_loopback()
        || ip.is_unspecified()
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
}

/// Validate a CIMD URL against the SSRF policy
///
/// Returns the blocked reason; a rejected URL must not open a connection.
pub fn check_ssrf_safe(url: &Url, allowed_domains: &[String]) -> Result<(), OAuthFlowError> {
    if url.scheme() != "https" {
        return Err(OAuthFlowError::InvalidClient(format!(
            "ssrf_blocked:scheme_{}",
            url.scheme()
        )));
    }

    let host = match url.host_str() {
        Some(host) => host.to_lowercase(),
        None => return Err(OAuthFlowError::InvalidClient("ssrf_blocked:no_host".to_string())),
    };

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');

    if BLOCKED_HOSTS.contains(&bare_host) {
        return Err(OAuthFlowError::InvalidClient(format!("ssrf_blocked:host_{}", bare_host)));
    }

    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        let private = match ip {
            IpAddr::V4(v4) => is_private_ipv4(v4),
            IpAddr::V6(v6) => is_private_ipv6(v6),
        };
        if private {
            return Err(OAuthFlowError::InvalidClient("ssrf_blocked:private_ip".to_string()));
        }
    }

    for suffix in BLOCKED_SUFFIXES {
        if host.ends_with(suffix) {
            return Err(OAuthFlowError::InvalidClient(format!("ssrf_blocked:suffix_{}", suffix)));
        }
    }

    if url.path() == "/" || url.path().is_empty() {
        return Err(OAuthFlowError::InvalidClient("ssrf_blocked:root_path".to_string()));
    }

    if !allowed_domains.is_empty() {
        let allowed = allowed_domains.iter().any(|domain| {
            let domain = domain.to_lowercase();
            if let Some(suffix) = domain.strip_prefix('.') {
                host == suffix || host.ends_with(&domain)
            } else {
                host == domain
            }
        });
        if !allowed {
            return Err(OAuthFlowError::InvalidClient("domain_not_allowed".to_string()));
        }
    }

    Ok(())
}

/// SSRF-guarded CIMD metadata fetcher
pub struct CimdFetcher {
    config: CimdConfig,
    client: reqwest::Client,
}

impl CimdFetcher {
    /// Create a fetcher; redirects are forbidden at the client level
    pub fn new(config: CimdConfig) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(config.fetch_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { config, client }
    }

    /// Whether CIMD resolution is enabled
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Fetch and validate the metadata document at `client_id`
    pub async fn fetch(&self, client_id: &str) -> Result<ClientMetadata, OAuthFlowError> {
        let url = Url::parse(client_id)
            .map_err(|_| OAuthFlowError::InvalidClient("invalid_metadata:client_id_not_a_url".to_string()))?;

        check_ssrf_safe(&url, &self.config.allowed_domains)?;

        debug!("Fetching CIMD metadata from {}", url);
        let mut response = self
            .client
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OAuthFlowError::InvalidClient("fetch_timeout".to_string())
                } else {
                    warn!("CIMD fetch failed for {}: {}", url, e);
                    OAuthFlowError::FetchFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(OAuthFlowError::FetchFailed(format!(
                "metadata fetch returned HTTP {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.contains("application/json") && !content_type.contains("text/json") {
            return Err(OAuthFlowError::InvalidClient("invalid_content_type".to_string()));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.config.max_response_bytes {
                return Err(OAuthFlowError::InvalidClient("metadata_too_large".to_string()));
            }
        }

        // Chunked responses carry no Content-Length; the cap must hold while
        // streaming, before the body is ever buffered whole.
        let mut body: Vec<u8> = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    OAuthFlowError::InvalidClient("fetch_timeout".to_string())
                } else {
                    OAuthFlowError::FetchFailed(e.to_string())
                }
            })?;
            let chunk = match chunk {
                Some(chunk) => chunk,
                None => break,
            };
            if body.len() + chunk.len() > self.config.max_response_bytes {
                return Err(OAuthFlowError::InvalidClient("metadata_too_large".to_string()));
            }
            body.extend_from_slice(&chunk);
        }

        let metadata: ClientMetadata = serde_json::from_slice(&body)
            .map_err(|_| OAuthFlowError::InvalidClient("invalid_json".to_string()))?;

        Self::validate_metadata(&metadata, client_id)?;
        Ok(metadata)
    }

    /// Validate the parsed document against the CIMD schema
    fn validate_metadata(metadata: &ClientMetadata, requested_url: &str) -> Result<(), OAuthFlowError> {
        if metadata.client_id != requested_url {
            return Err(OAuthFlowError::InvalidClient("client_id_mismatch".to_string()));
        }

        if metadata.redirect_uris.is_empty() {
            return Err(OAuthFlowError::InvalidClient(
                "invalid_metadata:redirect_uris_empty".to_string(),
            ));
        }

        for uri in &metadata.redirect_uris {
            if Url::parse(uri).is_err() {
                return Err(OAuthFlowError::InvalidClient(format!(
                    "invalid_metadata:bad_redirect_uri_{}",
                    uri
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_looks_like_cimd() {
        assert!(looks_like_cimd("https://app.example.com/cimd.json"));
        assert!(!looks_like_cimd("https://app.example.com/"));
        assert!(!looks_like_cimd("http://app.example.com/cimd.json"));
        assert!(!looks_like_cimd("my-opaque-client-id"));
    }

    #[test]
    fn test_ssrf_rejects_http() {
        let err = check_ssrf_safe(&url("http://example.com/meta.json"), &[]).unwrap_err();
        assert!(err.description().starts_with("ssrf_blocked:scheme"));
    }

    #[test]
    fn test_ssrf_rejects_loopback_hosts() {
        for bad in [
            "https://localhost/meta.json",
            "https://127.0.0.1/meta.json",
            "https://[::1]/meta.json",
            "https://0.0.0.0/meta.json",
        ] {
            assert!(check_ssrf_safe(&url(bad), &[]).is_err(), "{} should be blocked", bad);
        }
    }

    #[test]
    fn test_ssrf_rejects_private_ranges() {
        for bad in [
            "https://10.0.0.5/meta.json",
            "https://172.16.1.1/meta.json",
            "https://172.31.255.255/meta.json",
            "https://192.168.1.1/meta.json",
            "https://169.254.169.254/meta.json",
            "https://[fc00::1]/meta.json",
            "https://[fe80::1]/meta.json",
        ] {
            let err = check_ssrf_safe(&url(bad), &[]).unwrap_err();
            assert_eq!(err.description(), "ssrf_blocked:private_ip", "{}", bad);
        }
    }

    #[test]
    fn test_ssrf_allows_public_boundary_addresses() {
        // 172.32.* is outside the 172.16-31 private block
        assert!(check_ssrf_safe(&url("https://172.32.0.1/meta.json"), &[]).is_ok());
        assert!(check_ssrf_safe(&url("https://8.8.8.8/meta.json"), &[]).is_ok());
    }

    #[test]
    fn test_ssrf_rejects_internal_suffixes() {
        for bad in [
            "https://printer.local/meta.json",
            "https://db.internal/meta.json",
            "https://svc.localdomain/meta.json",
            "https://git.corp/meta.json",
            "https://nas.lan/meta.json",
        ] {
            let err = check_ssrf_safe(&url(bad), &[]).unwrap_err();
            assert!(err.description().starts_with("ssrf_blocked:suffix"), "{}", bad);
        }
    }

    #[test]
    fn test_ssrf_rejects_root_path() {
        let err = check_ssrf_safe(&url("https://app.example.com/"), &[]).unwrap_err();
        assert_eq!(err.description(), "ssrf_blocked:root_path");
    }

    #[test]
    fn test_domain_allowlist() {
        let allowed = vec!["app.example.com".to_string(), ".trusted.io".to_string()];
        assert!(check_ssrf_safe(&url("https://app.example.com/meta.json"), &allowed).is_ok());
        assert!(check_ssrf_safe(&url("https://sub.trusted.io/meta.json"), &allowed).is_ok());
        assert!(check_ssrf_safe(&url("https://trusted.io/meta.json"), &allowed).is_ok());

        let err = check_ssrf_safe(&url("https://evil.example.net/meta.json"), &allowed).unwrap_err();
        assert_eq!(err.description(), "domain_not_allowed");
    }

    #[test]
    fn test_metadata_validation() {
        let metadata = ClientMetadata {
            client_id: "https://app.example.com/cimd.json".to_string(),
            redirect_uris: vec!["https://app.example.com/cb".to_string()],
            client_name: None,
            grant_types: None,
            token_endpoint_auth_method: None,
        };

        assert!(CimdFetcher::validate_metadata(&metadata, "https://app.example.com/cimd.json").is_ok());

        let err = CimdFetcher::validate_metadata(&metadata, "https://other.example.com/cimd.json")
            .unwrap_err();
        assert_eq!(err.description(), "client_id_mismatch");

        let empty = ClientMetadata {
            redirect_uris: vec![],
            ..metadata.clone()
        };
        assert!(CimdFetcher::validate_metadata(&empty, "https://app.example.com/cimd.json").is_err());
    }
}
