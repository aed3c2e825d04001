//! OAuth flow engine: authorize, provider callback, token grants, registration
//!
//! The engine is transport-agnostic: it consumes parsed inputs and returns
//! either values or `OAuthFlowError` kinds. The HTTP layer performs the
//! final mapping to OAuth 2.1 error bodies and redirects.

use crate::auth::TokenRefresher;
use crate::config::{OAuthClientConfig, ProviderConfig};
use crate::oauth::cimd::{looks_like_cimd, CimdFetcher};
use crate::oauth::{pkce, OAuthFlowError};
use crate::storage::token_store::{
    mint_opaque_token, now_ms, ProviderToken, TokenStore, Transaction,
};
use crate::utils::b64::{decode_json_b64url, encode_json_b64url, random_token};
use crate::utils::redact_token;
use crate::utils::throttle::ThrottledClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

type FlowResult<T> = std::result::Result<T, OAuthFlowError>;

/// Default upstream token lifetime when expires_in is absent
const DEFAULT_EXPIRES_IN_SECS: u64 = 3_600;

/// Parsed `/authorize` query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeInput {
    /// OAuth response type; only "code" is meaningful here
    pub response_type: Option<String>,
    /// Opaque client id or CIMD URL
    pub client_id: Option<String>,
    /// Client redirect URI
    pub redirect_uri: Option<String>,
    /// PKCE S256 challenge
    pub code_challenge: Option<String>,
    /// PKCE method; must be "S256"
    pub code_challenge_method: Option<String>,
    /// Client CSRF state
    pub state: Option<String>,
    /// Requested scope
    pub scope: Option<String>,
    /// MCP session correlation
    pub sid: Option<String>,
}

/// Result of `/authorize`
#[derive(Debug, Clone)]
pub struct AuthorizeOutcome {
    /// Where to send the user agent
    pub redirect_to: String,
    /// The created transaction id
    pub txn_id: String,
}

/// Composite state round-tripped through the provider
///
/// Encoded as url-safe base64 JSON with short field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CompositeState {
    /// Transaction id
    tid: String,
    /// Client-supplied state
    #[serde(skip_serializing_if = "Option::is_none")]
    cs: Option<String>,
    /// Client redirect URI
    #[serde(skip_serializing_if = "Option::is_none")]
    cr: Option<String>,
    /// MCP session correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
}

/// Parsed `/token` form body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// Grant type
    pub grant_type: Option<String>,
    /// Authorization code (authorization_code grant)
    pub code: Option<String>,
    /// PKCE verifier (authorization_code grant)
    pub code_verifier: Option<String>,
    /// RS refresh token (refresh_token grant)
    pub refresh_token: Option<String>,
}

/// `/token` success body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// RS access token
    pub access_token: String,
    /// RS refresh token
    pub refresh_token: String,
    /// Always "bearer"
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Space-joined granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// `/register` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    /// Requested redirect URIs
    pub redirect_uris: Option<Vec<String>>,
    /// Requested grant types
    pub grant_types: Option<Vec<String>>,
    /// Requested response types
    pub response_types: Option<Vec<String>>,
    /// Client display name
    pub client_name: Option<String>,
}

/// `/register` response body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    /// Freshly minted opaque client id
    pub client_id: String,
    /// Echoed or default redirect URIs
    pub redirect_uris: Vec<String>,
    /// Echoed or default grant types
    pub grant_types: Vec<String>,
    /// Echoed or default response types
    pub response_types: Vec<String>,
    /// Always "none"
    pub token_endpoint_auth_method: String,
}

/// Upstream token endpoint response for the callback exchange
#[derive(Debug, Deserialize)]
struct ProviderExchangeResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// The OAuth flow engine
pub struct OAuthFlowEngine {
    store: Arc<dyn TokenStore>,
    refresher: Arc<TokenRefresher>,
    oauth: OAuthClientConfig,
    provider: ProviderConfig,
    cimd: CimdFetcher,
    http: ThrottledClient,
    base_url: String,
    dev_mode: bool,
}

impl OAuthFlowEngine {
    /// Create an engine
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<TokenRefresher>,
        oauth: OAuthClientConfig,
        provider: ProviderConfig,
        cimd: CimdFetcher,
        http: ThrottledClient,
        base_url: String,
        dev_mode: bool,
    ) -> Self {
        Self {
            store,
            refresher,
            oauth,
            provider,
            cimd,
            http,
            base_url,
            dev_mode,
        }
    }

    /// Whether upstream provider credentials are configured
    fn has_provider_credentials(&self) -> bool {
        self.provider.has_credentials()
            || (self.oauth.client_id.is_some() && self.oauth.authorization_url.is_some())
    }

    /// This server's provider callback URI
    fn callback_uri(&self) -> String {
        self.oauth
            .redirect_uri
            .clone()
            .unwrap_or_else(|| format!("{}/oauth/callback", self.base_url))
    }

    fn is_loopback_redirect(uri: &str) -> bool {
        Url::parse(uri)
            .ok()
            .and_then(|url| url.host_str().map(String::from))
            .map(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]" | "::1"))
            .unwrap_or(false)
    }

    /// Enforce the redirect allowlist; dev mode always allows loopback
    fn check_redirect_allowed(&self, uri: &str) -> FlowResult<()> {
        if self.oauth.redirect_allow_all {
            return Ok(());
        }
        if self.oauth.redirect_allowlist.iter().any(|allowed| allowed == uri) {
            return Ok(());
        }
        if self.dev_mode && Self::is_loopback_redirect(uri) {
            return Ok(());
        }
        Err(OAuthFlowError::InvalidRequest(format!(
            "redirect_uri not allowed: {}",
            uri
        )))
    }

    /// Handle `/authorize`
    pub async fn authorize(&self, input: AuthorizeInput) -> FlowResult<AuthorizeOutcome> {
        let redirect_uri = input
            .redirect_uri
            .clone()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| OAuthFlowError::InvalidRequest("redirect_uri is required".to_string()))?;

        let code_challenge = input
            .code_challenge
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthFlowError::InvalidRequest("code_challenge is required".to_string()))?;

        match input.code_challenge_method.as_deref() {
            Some("S256") => {}
            _ => {
                return Err(OAuthFlowError::InvalidRequest(
                    "code_challenge_method must be S256".to_string(),
                ))
            }
        }

        // URL-shaped client ids are CIMD clients: the metadata document must
        // be fetched and the redirect URI validated against it before the
        // transaction is created.
        if let Some(client_id) = input.client_id.as_deref() {
            if self.cimd.enabled() && looks_like_cimd(client_id) {
                let metadata = self.cimd.fetch(client_id).await?;
                if !metadata.redirect_uris.iter().any(|uri| uri == &redirect_uri) {
                    return Err(OAuthFlowError::InvalidRequest(
                        "redirect_uri not present in client metadata".to_string(),
                    ));
                }
                debug!("CIMD client {} validated", client_id);
            }
        }

        let txn_id = random_token(16);
        let txn = Transaction::new(
            code_challenge,
            input.state.clone(),
            input.scope.clone(),
            input.sid.clone(),
        );
        self.store.save_transaction(&txn_id, txn).await?;

        if self.has_provider_credentials() {
            let redirect_to = self.build_provider_authorize_url(&input, &txn_id)?;
            return Ok(AuthorizeOutcome { redirect_to, txn_id });
        }

        // Dev shortcut: no provider configured, mint the code immediately
        self.check_redirect_allowed(&redirect_uri)?;
        let code = mint_opaque_token();
        self.store.save_code(&code, &txn_id).await?;

        let mut redirect = Url::parse(&redirect_uri)
            .map_err(|_| OAuthFlowError::InvalidRequest("redirect_uri is not a URL".to_string()))?;
        redirect.query_pairs_mut().append_pair("code", &code);
        if let Some(state) = &input.state {
            redirect.query_pairs_mut().append_pair("state", state);
        }

        info!("Dev authorize shortcut minted code for txn {}", txn_id);
        Ok(AuthorizeOutcome {
            redirect_to: redirect.to_string(),
            txn_id,
        })
    }

    fn build_provider_authorize_url(&self, input: &AuthorizeInput, txn_id: &str) -> FlowResult<String> {
        let authorization_url = self
            .oauth
            .authorization_url
            .clone()
            .ok_or_else(|| OAuthFlowError::Internal("authorization_url not configured".to_string()))?;
        let client_id = self
            .oauth
            .client_id
            .clone()
            .or_else(|| self.provider.client_id.clone())
            .ok_or_else(|| OAuthFlowError::Internal("client_id not configured".to_string()))?;

        let composite = CompositeState {
            tid: txn_id.to_string(),
            cs: input.state.clone(),
            cr: input.redirect_uri.clone(),
            sid: input.sid.clone(),
        };
        let state = encode_json_b64url(&composite)
            .map_err(|e| OAuthFlowError::Internal(e.to_string()))?;

        let mut url = Url::parse(&authorization_url)
            .map_err(|_| OAuthFlowError::Internal("authorization_url is not a URL".to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &client_id);
            query.append_pair("redirect_uri", &self.callback_uri());
            if let Some(scope) = input.scope.as_deref().or(self.oauth.scopes.as_deref()) {
                query.append_pair("scope", scope);
            }
            query.append_pair("state", &state);
            for (key, value) in &self.oauth.extra_auth_params {
                query.append_pair(key, value);
            }
        }

        Ok(url.to_string())
    }

    /// Handle the provider redirect at `/oauth/callback`
    ///
    /// Returns the client redirect URL carrying the freshly minted RS
    /// authorization code and the echoed client state.
    pub async fn callback(&self, state: &str, provider_code: &str) -> FlowResult<String> {
        let composite: CompositeState = decode_json_b64url(state)
            .map_err(|_| OAuthFlowError::InvalidRequest("state is not decodable".to_string()))?;

        let mut txn = self
            .store
            .get_transaction(&composite.tid)
            .await?
            .ok_or(OAuthFlowError::UnknownTransaction)?;

        let provider_token = self.exchange_provider_code(provider_code).await?;
        txn.provider = Some(provider_token);
        self.store.save_transaction(&composite.tid, txn.clone()).await?;

        let code = mint_opaque_token();
        self.store.save_code(&code, &composite.tid).await?;

        let client_redirect = composite
            .cr
            .ok_or_else(|| OAuthFlowError::InvalidRequest("state carries no client redirect".to_string()))?;
        self.check_redirect_allowed(&client_redirect)?;

        let mut redirect = Url::parse(&client_redirect)
            .map_err(|_| OAuthFlowError::InvalidRequest("client redirect is not a URL".to_string()))?;
        redirect.query_pairs_mut().append_pair("code", &code);
        if let Some(cs) = &composite.cs {
            redirect.query_pairs_mut().append_pair("state", cs);
        }

        info!("Provider callback completed for txn {}", composite.tid);
        Ok(redirect.to_string())
    }

    /// Exchange the provider authorization code using client-secret-basic auth
    async fn exchange_provider_code(&self, code: &str) -> FlowResult<ProviderToken> {
        let token_url = self
            .oauth
            .token_url
            .clone()
            .or_else(|| {
                self.provider
                    .accounts_url
                    .as_ref()
                    .map(|base| format!("{}/token", base.trim_end_matches('/')))
            })
            .ok_or_else(|| OAuthFlowError::Internal("token_url not configured".to_string()))?;

        let client_id = self
            .oauth
            .client_id
            .clone()
            .or_else(|| self.provider.client_id.clone())
            .ok_or_else(|| OAuthFlowError::Internal("client_id not configured".to_string()))?;
        let client_secret = self
            .oauth
            .client_secret
            .clone()
            .or_else(|| self.provider.client_secret.clone())
            .unwrap_or_default();

        let callback = self.callback_uri();
        let code = code.to_string();

        let response = self
            .http
            .execute(move |client| {
                client
                    .post(&token_url)
                    .basic_auth(&client_id, Some(&client_secret))
                    .header("Accept", "application/json")
                    .form(&[
                        ("grant_type", "authorization_code"),
                        ("code", code.as_str()),
                        ("redirect_uri", callback.as_str()),
                    ])
            })
            .await
            .map_err(|e| OAuthFlowError::FetchFailed(e.to_string()))?;

        let status = response.status();
        let parsed: ProviderExchangeResponse = response
            .json()
            .await
            .map_err(|e| OAuthFlowError::FetchFailed(format!("unparseable provider response: {}", e)))?;

        if let Some(error) = parsed.error {
            return Err(OAuthFlowError::ProviderTokenError {
                code: error,
                description: parsed.error_description.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            return Err(OAuthFlowError::FetchFailed(format!("provider returned HTTP {}", status)));
        }

        let access_token = parsed.access_token.ok_or(OAuthFlowError::ProviderNoToken)?;
        Ok(ProviderToken::from_response(
            access_token,
            parsed.refresh_token,
            Some(parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
            parsed.scope.as_deref(),
        ))
    }

    /// Handle `/token`
    pub async fn token(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        match request.grant_type.as_deref() {
            Some("authorization_code") => self.token_authorization_code(request).await,
            Some("refresh_token") => self.token_refresh(request).await,
            Some(other) => Err(OAuthFlowError::UnsupportedGrantType(other.to_string())),
            None => Err(OAuthFlowError::InvalidRequest("grant_type is required".to_string())),
        }
    }

    async fn token_authorization_code(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        let code = request
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthFlowError::InvalidRequest("code is required".to_string()))?;
        let code_verifier = request
            .code_verifier
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthFlowError::InvalidRequest("code_verifier is required".to_string()))?;

        let txn_id = self
            .store
            .get_txn_id_by_code(&code)
            .await?
            .ok_or_else(|| OAuthFlowError::InvalidGrant("unknown or expired code".to_string()))?;

        let txn = match self.store.get_transaction(&txn_id).await? {
            Some(txn) => txn,
            None => {
                self.store.delete_code(&code).await?;
                return Err(OAuthFlowError::InvalidGrant("transaction expired".to_string()));
            }
        };

        if !pkce::verify_s256(&code_verifier, &txn.code_challenge) {
            warn!("PKCE verification failed for txn {}", txn_id);
            return Err(OAuthFlowError::InvalidGrant("code_verifier mismatch".to_string()));
        }

        let rs_access = mint_opaque_token();
        let rs_refresh = mint_opaque_token();

        let scope = match &txn.provider {
            Some(provider) => {
                self.store
                    .store_rs_mapping(&rs_access, provider.clone(), Some(&rs_refresh))
                    .await?;
                provider
                    .scopes
                    .as_ref()
                    .map(|scopes| scopes.join(" "))
                    .or_else(|| txn.scope.clone())
            }
            None if !self.has_provider_credentials() => {
                // Dev shortcut transactions never see the provider; the RS
                // token pair is issued unmapped.
                warn!("Issuing unmapped RS tokens for txn {} (no provider configured)", txn_id);
                txn.scope.clone()
            }
            None => {
                self.store.delete_code(&code).await?;
                self.store.delete_transaction(&txn_id).await?;
                return Err(OAuthFlowError::InvalidGrant(
                    "transaction has no provider token".to_string(),
                ));
            }
        };

        // Codes are single-use
        self.store.delete_transaction(&txn_id).await?;
        self.store.delete_code(&code).await?;

        info!("Issued RS token pair {} for txn {}", redact_token(&rs_access), txn_id);
        Ok(TokenResponse {
            access_token: rs_access,
            refresh_token: rs_refresh,
            token_type: "bearer".to_string(),
            expires_in: DEFAULT_EXPIRES_IN_SECS,
            scope,
        })
    }

    async fn token_refresh(&self, request: TokenRequest) -> FlowResult<TokenResponse> {
        let rs_refresh = request
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OAuthFlowError::InvalidRequest("refresh_token is required".to_string()))?;

        let record = self
            .store
            .get_by_rs_refresh(&rs_refresh)
            .await?
            .ok_or_else(|| OAuthFlowError::InvalidGrant("unknown refresh token".to_string()))?;

        let needs_refresh = record.provider.needs_refresh(60_000);
        let can_refresh =
            record.provider.refresh_token.is_some() && self.refresher.provider_config().is_some();

        if needs_refresh && can_refresh {
            let upstream_refresh = record
                .provider
                .refresh_token
                .clone()
                .unwrap_or_default();

            let response = self
                .refresher
                .refresh_upstream(&upstream_refresh)
                .await
                .map_err(|e| OAuthFlowError::ProviderRefreshFailed(e.to_string()))?;

            let rotated = response
                .refresh_token
                .as_ref()
                .map(|new| *new != upstream_refresh)
                .unwrap_or(false);

            let new_provider = ProviderToken {
                access_token: response.access_token,
                refresh_token: response.refresh_token.or(Some(upstream_refresh)),
                expires_at: Some(
                    now_ms() + (response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) as i64) * 1000,
                ),
                scopes: response
                    .scope
                    .as_deref()
                    .map(|s| s.split_whitespace().map(String::from).collect())
                    .or(record.provider.scopes.clone()),
            };

            // Upstream rotation invalidates the old RS access token too
            let new_rs_access = if rotated { Some(mint_opaque_token()) } else { None };
            let updated = self
                .store
                .update_by_rs_refresh(&rs_refresh, new_provider, new_rs_access.as_deref())
                .await?
                .ok_or_else(|| OAuthFlowError::InvalidGrant("refresh token vanished".to_string()))?;

            let expires_in = updated
                .provider
                .expires_at
                .map(|at| ((at - now_ms()) / 1000).max(1) as u64)
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

            return Ok(TokenResponse {
                access_token: updated.rs_access_token,
                refresh_token: rs_refresh,
                token_type: "bearer".to_string(),
                expires_in,
                scope: updated.provider.scopes.as_ref().map(|s| s.join(" ")),
            });
        }

        if needs_refresh && !can_refresh {
            return Err(OAuthFlowError::ProviderTokenExpired);
        }

        let expires_in = record
            .provider
            .expires_at
            .map(|at| ((at - now_ms()) / 1000).max(1) as u64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        Ok(TokenResponse {
            access_token: record.rs_access_token,
            refresh_token: rs_refresh,
            token_type: "bearer".to_string(),
            expires_in,
            scope: record.provider.scopes.as_ref().map(|s| s.join(" ")),
        })
    }

    /// Handle `/register`
    ///
    /// Registration is an opaque confirmation: a fresh client id with echoed
    /// or default metadata. No persistent registration record is kept.
    pub fn register(&self, request: RegisterRequest) -> RegisterResponse {
        RegisterResponse {
            client_id: random_token(12),
            redirect_uris: request.redirect_uris.unwrap_or_default(),
            grant_types: request
                .grant_types
                .unwrap_or_else(|| vec!["authorization_code".to_string(), "refresh_token".to_string()]),
            response_types: request.response_types.unwrap_or_else(|| vec!["code".to_string()]),
            token_endpoint_auth_method: "none".to_string(),
        }
    }

    /// Handle the dev-path end-to-end issuance used by tests: authorize with
    /// a provider token already attached to the transaction
    #[cfg(test)]
    pub async fn attach_provider_for_test(
        &self,
        txn_id: &str,
        token: ProviderToken,
    ) -> crate::error::Result<()> {
        if let Some(mut txn) = self.store.get_transaction(txn_id).await? {
            txn.provider = Some(token);
            self.store.save_transaction(txn_id, txn).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CimdConfig;
    use crate::storage::InMemoryTokenStore;
    use crate::utils::throttle::{ThrottleConfig, ThrottledClient};

    fn engine_with(oauth: OAuthClientConfig, dev_mode: bool) -> (OAuthFlowEngine, Arc<dyn TokenStore>) {
        let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&store),
            None,
            ThrottledClient::new(ThrottleConfig::default()),
        ));
        let engine = OAuthFlowEngine::new(
            Arc::clone(&store),
            refresher,
            oauth,
            ProviderConfig::default(),
            CimdFetcher::new(CimdConfig::default()),
            ThrottledClient::new(ThrottleConfig::default()),
            "http://localhost:3001".to_string(),
            dev_mode,
        );
        (engine, store)
    }

    fn dev_engine() -> (OAuthFlowEngine, Arc<dyn TokenStore>) {
        engine_with(OAuthClientConfig::default(), true)
    }

    fn authorize_input(verifier: &str) -> AuthorizeInput {
        AuthorizeInput {
            response_type: Some("code".to_string()),
            client_id: Some("test-client".to_string()),
            redirect_uri: Some("http://localhost:5173/cb".to_string()),
            code_challenge: Some(pkce::compute_s256(verifier)),
            code_challenge_method: Some("S256".to_string()),
            state: Some("client-state".to_string()),
            scope: Some("profile".to_string()),
            sid: None,
        }
    }

    #[tokio::test]
    async fn test_authorize_requires_pkce_fields() {
        let (engine, _) = dev_engine();

        let mut input = authorize_input("v");
        input.code_challenge = None;
        let err = engine.authorize(input).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");

        let mut input = authorize_input("v");
        input.code_challenge_method = Some("plain".to_string());
        let err = engine.authorize(input).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");

        let mut input = authorize_input("v");
        input.redirect_uri = None;
        let err = engine.authorize(input).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_dev_authorize_mints_code_and_echoes_state() {
        let (engine, store) = dev_engine();
        let outcome = engine.authorize(authorize_input("verifier-1")).await.unwrap();

        let redirect = Url::parse(&outcome.redirect_to).unwrap();
        assert_eq!(redirect.host_str(), Some("localhost"));

        let params: std::collections::HashMap<_, _> = redirect.query_pairs().into_owned().collect();
        assert_eq!(params.get("state").map(String::as_str), Some("client-state"));
        let code = params.get("code").expect("code param");

        let txn_id = store.get_txn_id_by_code(code).await.unwrap().unwrap();
        assert_eq!(txn_id, outcome.txn_id);
    }

    #[tokio::test]
    async fn test_full_dev_code_exchange() {
        let (engine, _) = dev_engine();
        let outcome = engine.authorize(authorize_input("verifier-xyz")).await.unwrap();

        let redirect = Url::parse(&outcome.redirect_to).unwrap();
        let params: std::collections::HashMap<_, _> = redirect.query_pairs().into_owned().collect();
        let code = params.get("code").cloned().unwrap();

        let response = engine
            .token(TokenRequest {
                grant_type: Some("authorization_code".to_string()),
                code: Some(code),
                code_verifier: Some("verifier-xyz".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.token_type, "bearer");
        assert_eq!(response.expires_in, 3600);
        assert!(!response.access_token.is_empty());
        assert!(!response.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn test_pkce_mismatch_is_invalid_grant() {
        let (engine, _) = dev_engine();
        let outcome = engine.authorize(authorize_input("right-verifier")).await.unwrap();

        let redirect = Url::parse(&outcome.redirect_to).unwrap();
        let params: std::collections::HashMap<_, _> = redirect.query_pairs().into_owned().collect();
        let code = params.get("code").cloned().unwrap();

        let err = engine
            .token(TokenRequest {
                grant_type: Some("authorization_code".to_string()),
                code: Some(code),
                code_verifier: Some("wrong".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let (engine, _) = dev_engine();
        let outcome = engine.authorize(authorize_input("verifier-1")).await.unwrap();

        let redirect = Url::parse(&outcome.redirect_to).unwrap();
        let params: std::collections::HashMap<_, _> = redirect.query_pairs().into_owned().collect();
        let code = params.get("code").cloned().unwrap();

        let request = TokenRequest {
            grant_type: Some("authorization_code".to_string()),
            code: Some(code),
            code_verifier: Some("verifier-1".to_string()),
            ..Default::default()
        };
        engine.token(request.clone()).await.unwrap();

        let err = engine.token(request).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_mapped_exchange_stores_rs_record() {
        let (engine, store) = dev_engine();
        let outcome = engine.authorize(authorize_input("verifier-1")).await.unwrap();

        engine
            .attach_provider_for_test(
                &outcome.txn_id,
                ProviderToken {
                    access_token: "upstream-at".to_string(),
                    refresh_token: Some("upstream-rt".to_string()),
                    expires_at: Some(now_ms() + 3_600_000),
                    scopes: Some(vec!["read".to_string(), "write".to_string()]),
                },
            )
            .await
            .unwrap();

        let redirect = Url::parse(&outcome.redirect_to).unwrap();
        let params: std::collections::HashMap<_, _> = redirect.query_pairs().into_owned().collect();
        let code = params.get("code").cloned().unwrap();

        let response = engine
            .token(TokenRequest {
                grant_type: Some("authorization_code".to_string()),
                code: Some(code),
                code_verifier: Some("verifier-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.scope.as_deref(), Some("read write"));
        let record = store.get_by_rs_access(&response.access_token).await.unwrap().unwrap();
        assert_eq!(record.provider.access_token, "upstream-at");
        assert_eq!(record.rs_refresh_token, response.refresh_token);
    }

    #[tokio::test]
    async fn test_refresh_grant_with_fresh_provider_token() {
        let (engine, store) = dev_engine();
        store
            .store_rs_mapping(
                "rs-acc",
                ProviderToken {
                    access_token: "upstream".to_string(),
                    refresh_token: Some("upstream-rt".to_string()),
                    expires_at: Some(now_ms() + 1_800_000),
                    scopes: Some(vec!["read".to_string()]),
                },
                Some("rs-ref"),
            )
            .await
            .unwrap();

        let response = engine
            .token(TokenRequest {
                grant_type: Some("refresh_token".to_string()),
                refresh_token: Some("rs-ref".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.access_token, "rs-acc");
        assert_eq!(response.refresh_token, "rs-ref");
        // expires_in reflects the remaining provider lifetime
        assert!(response.expires_in <= 1800 && response.expires_in >= 1795);
        assert_eq!(response.scope.as_deref(), Some("read"));
    }

    #[tokio::test]
    async fn test_refresh_grant_unknown_token() {
        let (engine, _) = dev_engine();
        let err = engine
            .token(TokenRequest {
                grant_type: Some("refresh_token".to_string()),
                refresh_token: Some("nope".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_unsupported_grant_type() {
        let (engine, _) = dev_engine();
        let err = engine
            .token(TokenRequest {
                grant_type: Some("client_credentials".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "unsupported_grant_type");
    }

    #[tokio::test]
    async fn test_expired_provider_without_refresh_path() {
        let (engine, store) = dev_engine();
        store
            .store_rs_mapping(
                "rs-acc",
                ProviderToken {
                    access_token: "upstream".to_string(),
                    refresh_token: None,
                    expires_at: Some(now_ms() - 1_000),
                    scopes: None,
                },
                Some("rs-ref"),
            )
            .await
            .unwrap();

        let err = engine
            .token(TokenRequest {
                grant_type: Some("refresh_token".to_string()),
                refresh_token: Some("rs-ref".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "provider_token_expired");
    }

    #[test]
    fn test_register_defaults() {
        let (engine, _) = dev_engine();
        let response = engine.register(RegisterRequest::default());
        assert_eq!(response.token_endpoint_auth_method, "none");
        assert_eq!(response.grant_types, vec!["authorization_code", "refresh_token"]);
        assert_eq!(response.response_types, vec!["code"]);
        // 12 random bytes -> 16 base64url chars
        assert_eq!(response.client_id.len(), 16);
    }

    #[test]
    fn test_composite_state_round_trip() {
        let state = CompositeState {
            tid: "txn-1".to_string(),
            cs: Some("cs".to_string()),
            cr: Some("http://localhost/cb".to_string()),
            sid: None,
        };
        let encoded = encode_json_b64url(&state).unwrap();
        let decoded: CompositeState = decode_json_b64url(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[tokio::test]
    async fn test_callback_with_unknown_txn() {
        let (engine, _) = dev_engine();
        let state = encode_json_b64url(&CompositeState {
            tid: "missing".to_string(),
            cs: None,
            cr: Some("http://localhost/cb".to_string()),
            sid: None,
        })
        .unwrap();

        let err = engine.callback(&state, "provider-code").await.unwrap_err();
        assert_eq!(err, OAuthFlowError::UnknownTransaction);
    }

    #[tokio::test]
    async fn test_redirect_allowlist_enforced_outside_dev() {
        let config = OAuthClientConfig {
            redirect_allowlist: vec!["https://app.example.com/cb".to_string()],
            ..Default::default()
        };
        let (engine, _) = engine_with(config, false);

        let mut input = authorize_input("v");
        input.redirect_uri = Some("https://evil.example.net/cb".to_string());
        let err = engine.authorize(input).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_request");

        let mut input = authorize_input("v");
        input.redirect_uri = Some("https://app.example.com/cb".to_string());
        assert!(engine.authorize(input).await.is_ok());
    }
}
