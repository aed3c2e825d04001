//! OAuth 2.1 flow engine
//!
//! Authorization-code and refresh flows with PKCE S256, CIMD client
//! resolution with an SSRF-guarded metadata fetch, and the token endpoint
//! grants. Flow errors are a result variant; the HTTP envelope maps kinds
//! to OAuth 2.1 error bodies.

pub mod cimd;
pub mod engine;
pub mod pkce;

pub use cimd::{check_ssrf_safe, looks_like_cimd, CimdFetcher, ClientMetadata};
pub use engine::{
    AuthorizeInput, AuthorizeOutcome, OAuthFlowEngine, RegisterRequest, RegisterResponse,
    TokenRequest, TokenResponse,
};

use thiserror::Error;

/// OAuth flow error kinds
///
/// Each kind carries enough detail for the HTTP envelope to emit the OAuth
/// 2.1 error body; messages never include token material.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OAuthFlowError {
    /// Missing or malformed request parameter
    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    /// Unknown, expired or mismatched grant material
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    /// Client identification failed (includes all CIMD rejections)
    #[error("invalid_client: {0}")]
    InvalidClient(String),

    /// Unsupported grant_type value
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),

    /// The composite state referenced no live transaction
    #[error("unknown_txn")]
    UnknownTransaction,

    /// The provider callback produced no access token
    #[error("provider_no_token")]
    ProviderNoToken,

    /// The upstream refresh failed during the refresh_token grant
    #[error("provider_refresh_failed: {0}")]
    ProviderRefreshFailed(String),

    /// The provider token expired and cannot be refreshed
    #[error("provider_token_expired")]
    ProviderTokenExpired,

    /// The upstream token endpoint returned an error body
    #[error("provider_token_error: {code} {description}")]
    ProviderTokenError {
        /// Upstream error code
        code: String,
        /// Upstream error description
        description: String,
    },

    /// Network failure talking to the provider
    #[error("fetch_failed: {0}")]
    FetchFailed(String),

    /// Anything else; details are logged, clients get a generic body
    #[error("server_error: {0}")]
    Internal(String),
}

impl OAuthFlowError {
    /// The OAuth 2.1 `error` field value
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthFlowError::InvalidRequest(_) => "invalid_request",
            OAuthFlowError::InvalidGrant(_) => "invalid_grant",
            OAuthFlowError::InvalidClient(_) => "invalid_client",
            OAuthFlowError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthFlowError::UnknownTransaction => "unknown_txn",
            OAuthFlowError::ProviderNoToken => "provider_no_token",
            OAuthFlowError::ProviderRefreshFailed(_) => "provider_refresh_failed",
            OAuthFlowError::ProviderTokenExpired => "provider_token_expired",
            OAuthFlowError::ProviderTokenError { .. } => "provider_token_error",
            OAuthFlowError::FetchFailed(_) => "fetch_failed",
            OAuthFlowError::Internal(_) => "server_error",
        }
    }

    /// The OAuth 2.1 `error_description` field value
    pub fn description(&self) -> String {
        match self {
            OAuthFlowError::InvalidRequest(detail)
            | OAuthFlowError::InvalidGrant(detail)
            | OAuthFlowError::InvalidClient(detail)
            | OAuthFlowError::UnsupportedGrantType(detail)
            | OAuthFlowError::ProviderRefreshFailed(detail)
            | OAuthFlowError::FetchFailed(detail) => detail.clone(),
            OAuthFlowError::ProviderTokenError { code, description } => {
                format!("{} {}", code, description)
            }
            OAuthFlowError::Internal(_) => "Internal server error".to_string(),
            _ => String::new(),
        }
    }

    /// HTTP status for the error body
    pub fn http_status(&self) -> u16 {
        match self {
            OAuthFlowError::Internal(_) => 500,
            OAuthFlowError::InvalidClient(_) => 401,
            _ => 400,
        }
    }
}

impl From<crate::error::BridgeError> for OAuthFlowError {
    fn from(error: crate::error::BridgeError) -> Self {
        OAuthFlowError::Internal(error.to_string())
    }
}
