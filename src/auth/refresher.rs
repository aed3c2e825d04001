//! Upstream token refresh service
//!
//! Detects near-expiry provider tokens behind RS tokens, performs the RFC
//! 6749 refresh_token grant against the upstream provider, and rotates
//! storage atomically. A per-process cooldown map deduplicates refresh
//! bursts; it is advisory and does not prevent storms across processes.

use crate::error::{BridgeError, Result};
use crate::storage::token_store::{mint_opaque_token, now_ms, ProviderToken, TokenStore};
use crate::utils::redact_token;
use crate::utils::throttle::ThrottledClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Refresh this long before upstream expiry
const REFRESH_LEEWAY_MS: i64 = 60_000;

/// Per-process refresh cooldown window
const DEDUP_WINDOW_MS: i64 = 30_000;

/// Bound on the cooldown map before it is swept
const DEDUP_MAX_ENTRIES: usize = 1_000;

/// Default token endpoint path on the provider accounts host
const DEFAULT_TOKEN_ENDPOINT_PATH: &str = "/token";

/// Default upstream token lifetime when the response omits expires_in
const DEFAULT_EXPIRES_IN_SECS: u64 = 3_600;

/// Upstream provider settings needed for the refresh grant
#[derive(Debug, Clone)]
pub struct RefreshProviderConfig {
    /// OAuth client id registered with the provider
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Provider accounts base URL
    pub accounts_url: String,
    /// Token endpoint path; defaults to `/token`
    pub token_endpoint_path: Option<String>,
}

impl RefreshProviderConfig {
    /// Full token endpoint URL
    pub fn token_url(&self) -> String {
        let path = self
            .token_endpoint_path
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_ENDPOINT_PATH);
        format!("{}{}", self.accounts_url.trim_end_matches('/'), path)
    }
}

/// Token endpoint response per RFC 6749 §5.1
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamTokenResponse {
    /// New access token
    pub access_token: String,
    /// Rotated refresh token, if the provider rotates
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    pub expires_in: Option<u64>,
    /// Granted scope
    pub scope: Option<String>,
}

/// Result of `ensure_fresh`
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// The upstream access token handlers should use (possibly unchanged)
    pub access_token: String,
    /// Whether an upstream refresh actually happened
    pub was_refreshed: bool,
}

/// Refresher for provider tokens behind RS access tokens
pub struct TokenRefresher {
    store: Arc<dyn TokenStore>,
    provider: Option<RefreshProviderConfig>,
    http: ThrottledClient,
    /// rs_access_token -> last refresh time (epoch ms)
    recently_refreshed: Mutex<HashMap<String, i64>>,
}

impl TokenRefresher {
    /// Create a refresher over the given store and provider settings
    pub fn new(
        store: Arc<dyn TokenStore>,
        provider: Option<RefreshProviderConfig>,
        http: ThrottledClient,
    ) -> Self {
        Self {
            store,
            provider,
            http,
            recently_refreshed: Mutex::new(HashMap::new()),
        }
    }

    /// Provider settings, if configured
    pub fn provider_config(&self) -> Option<&RefreshProviderConfig> {
        self.provider.as_ref()
    }

    /// Ensure the provider token behind `rs_access_token` is fresh
    ///
    /// Never fails the caller on upstream errors: a stale token is returned
    /// with `was_refreshed: false` instead of logging the user out.
    pub async fn ensure_fresh(&self, rs_access_token: &str) -> Result<RefreshOutcome> {
        let record = match self.store.get_by_rs_access(rs_access_token).await? {
            Some(record) if !record.provider.access_token.is_empty() => record,
            _ => {
                return Ok(RefreshOutcome {
                    access_token: String::new(),
                    was_refreshed: false,
                })
            }
        };

        if !record.provider.needs_refresh(REFRESH_LEEWAY_MS) {
            return Ok(RefreshOutcome {
                access_token: record.provider.access_token,
                was_refreshed: false,
            });
        }

        // Soft per-process dedup: a refresh in the last 30 s short-circuits
        if self.recently_refreshed(rs_access_token).await {
            debug!(
                "Skipping refresh for {}: refreshed within the cooldown window",
                redact_token(rs_access_token)
            );
            return Ok(RefreshOutcome {
                access_token: record.provider.access_token,
                was_refreshed: false,
            });
        }

        let refresh_token = match &record.provider.refresh_token {
            Some(token) => token.clone(),
            None => {
                warn!(
                    "Provider token behind {} is expiring but has no refresh token",
                    redact_token(rs_access_token)
                );
                return Ok(RefreshOutcome {
                    access_token: record.provider.access_token,
                    was_refreshed: false,
                });
            }
        };

        if self.provider.is_none() {
            warn!("Provider token is expiring but no provider credentials are configured");
            return Ok(RefreshOutcome {
                access_token: record.provider.access_token,
                was_refreshed: false,
            });
        }

        let response = match self.refresh_upstream(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                // Transient upstream failure: keep serving the existing token
                warn!(
                    "Upstream refresh failed for {}: {}; serving existing token",
                    redact_token(rs_access_token),
                    e
                );
                return Ok(RefreshOutcome {
                    access_token: record.provider.access_token,
                    was_refreshed: false,
                });
            }
        };

        let rotated = response
            .refresh_token
            .as_ref()
            .map(|new| *new != refresh_token)
            .unwrap_or(false);

        let new_provider = ProviderToken {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone().or(Some(refresh_token)),
            expires_at: Some(
                now_ms() + (response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) as i64) * 1000,
            ),
            scopes: response
                .scope
                .as_deref()
                .map(|s| s.split_whitespace().map(String::from).collect()),
        };

        // When the upstream rotated the refresh token, rotate the RS access
        // token too so a captured old access token stops working.
        let new_rs_access = if rotated { Some(mint_opaque_token()) } else { None };

        self.store
            .update_by_rs_refresh(
                &record.rs_refresh_token,
                new_provider,
                new_rs_access.as_deref(),
            )
            .await?;

        self.mark_refreshed(rs_access_token).await;
        info!(
            "Refreshed provider token behind {} (rs access rotated: {})",
            redact_token(rs_access_token),
            rotated
        );

        Ok(RefreshOutcome {
            access_token: response.access_token,
            was_refreshed: true,
        })
    }

    /// Perform the raw RFC 6749 refresh_token grant against the provider
    ///
    /// Used by `ensure_fresh` and by the token endpoint's refresh grant,
    /// which surfaces failures instead of degrading.
    pub async fn refresh_upstream(&self, refresh_token: &str) -> Result<UpstreamTokenResponse> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| BridgeError::config("No provider credentials configured"))?;

        let token_url = provider.token_url();
        let refresh_token = refresh_token.to_string();
        let client_id = provider.client_id.clone();
        let client_secret = provider.client_secret.clone();

        let response = self
            .http
            .execute(move |client| {
                client
                    .post(&token_url)
                    .basic_auth(&client_id, Some(&client_secret))
                    .header("Accept", "application/json")
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token.as_str()),
                    ])
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::connection(format!(
                "Provider refresh failed: HTTP {} - {}",
                status, body
            )));
        }

        let parsed: UpstreamTokenResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::connection(format!("Invalid provider token response: {}", e)))?;
        Ok(parsed)
    }

    async fn recently_refreshed(&self, rs_access_token: &str) -> bool {
        let map = self.recently_refreshed.lock().await;
        match map.get(rs_access_token) {
            Some(ts) => now_ms() - ts < DEDUP_WINDOW_MS,
            None => false,
        }
    }

    async fn mark_refreshed(&self, rs_access_token: &str) {
        let mut map = self.recently_refreshed.lock().await;
        if map.len() >= DEDUP_MAX_ENTRIES {
            let cutoff = now_ms() - DEDUP_WINDOW_MS;
            map.retain(|_, ts| *ts >= cutoff);
        }
        map.insert(rs_access_token.to_string(), now_ms());
    }
}
