//! Credential resolution for incoming requests
//!
//! Classifies the request's credential according to the configured strategy
//! and produces the header set that tool handlers forward upstream. Under
//! the oauth strategy, RS bearer tokens are exchanged for a live provider
//! token via the token store and refresher.

use crate::auth::refresher::TokenRefresher;
use crate::config::{AuthConfig, AuthStrategy};
use crate::error::Result;
use crate::storage::token_store::{ProviderToken, TokenStore};
use crate::utils::redact_token;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Headers always eligible for forwarding, beyond the configured accept list
const BASE_FORWARD_HEADERS: &[&str] = &["authorization", "x-api-key", "x-auth-token"];

/// Outcome of credential resolution for one request
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    /// Strategy that produced this resolution
    pub strategy: AuthStrategy,
    /// Incoming, lowercased, allowlisted header subset
    pub auth_headers: HashMap<String, String>,
    /// auth_headers plus static-strategy headers, with `authorization`
    /// possibly rewritten to the upstream provider bearer
    pub resolved_headers: HashMap<String, String>,
    /// The outbound token tool handlers should use
    pub provider_token: Option<String>,
    /// Full upstream record, if available
    pub provider: Option<ProviderToken>,
    /// The incoming RS bearer, unmodified, if present
    pub rs_token: Option<String>,
}

impl ResolvedAuth {
    /// Identity pass-through resolution (none strategy, tests)
    pub fn passthrough() -> Self {
        Self::default()
    }
}

/// Resolver for incoming request credentials
pub struct AuthResolver {
    config: AuthConfig,
    accept_headers: Vec<String>,
    token_store: Arc<dyn TokenStore>,
    refresher: Arc<TokenRefresher>,
}

impl AuthResolver {
    /// Create a resolver
    ///
    /// `accept_headers` is the configured extra forward list; entries are
    /// matched case-insensitively against incoming header names.
    pub fn new(
        config: AuthConfig,
        accept_headers: Vec<String>,
        token_store: Arc<dyn TokenStore>,
        refresher: Arc<TokenRefresher>,
    ) -> Self {
        let accept_headers = accept_headers.into_iter().map(|h| h.to_lowercase()).collect();
        Self {
            config,
            accept_headers,
            token_store,
            refresher,
        }
    }

    /// The configured strategy
    pub fn strategy(&self) -> AuthStrategy {
        self.config.strategy
    }

    fn is_forwardable(&self, name: &str) -> bool {
        BASE_FORWARD_HEADERS.contains(&name)
            || self.accept_headers.iter().any(|h| h == name)
            || name == self.config.api_key_header
    }

    /// Extract the bearer token from an `authorization` value, if present
    fn bearer_token(headers: &HashMap<String, String>) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    /// Resolve the credential for one request
    ///
    /// `incoming` must carry lowercased header names.
    pub async fn resolve(&self, incoming: &HashMap<String, String>) -> Result<ResolvedAuth> {
        let auth_headers: HashMap<String, String> = incoming
            .iter()
            .filter(|(name, _)| self.is_forwardable(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut resolved = ResolvedAuth {
            strategy: self.config.strategy,
            resolved_headers: auth_headers.clone(),
            auth_headers,
            ..Default::default()
        };

        match self.config.strategy {
            AuthStrategy::None => {}

            AuthStrategy::ApiKey => {
                if let Some(key) = &self.config.api_key {
                    resolved
                        .resolved_headers
                        .insert(self.config.api_key_header.clone(), key.clone());
                    resolved.provider_token = Some(key.clone());
                }
            }

            AuthStrategy::Bearer => {
                if let Some(token) = &self.config.bearer_token {
                    resolved
                        .resolved_headers
                        .insert("authorization".to_string(), format!("Bearer {}", token));
                    resolved.provider_token = Some(token.clone());
                }
            }

            AuthStrategy::Custom => {
                for (name, value) in &self.config.custom_headers {
                    resolved.resolved_headers.insert(name.clone(), value.clone());
                }
            }

            AuthStrategy::OAuth => {
                self.resolve_oauth(&mut resolved).await?;
            }
        }

        Ok(resolved)
    }

    async fn resolve_oauth(&self, resolved: &mut ResolvedAuth) -> Result<()> {
        let rs_token = match Self::bearer_token(&resolved.auth_headers) {
            Some(token) => token,
            None => return Ok(()),
        };
        resolved.rs_token = Some(rs_token.clone());

        let record = self.token_store.get_by_rs_access(&rs_token).await?;
        match record {
            Some(record) => {
                // Transparently refresh a near-expiry provider token
                let outcome = self.refresher.ensure_fresh(&rs_token).await?;
                let access_token = if outcome.access_token.is_empty() {
                    record.provider.access_token.clone()
                } else {
                    outcome.access_token
                };

                debug!(
                    "Resolved RS token {} to upstream credential (refreshed: {})",
                    redact_token(&rs_token),
                    outcome.was_refreshed
                );

                resolved
                    .resolved_headers
                    .insert("authorization".to_string(), format!("Bearer {}", access_token));
                resolved.provider_token = Some(access_token);
                resolved.provider = Some(record.provider);
            }
            None => {
                if self.config.require_rs && !self.config.allow_direct_bearer {
                    // Strip the credential so downstream handlers see none
                    warn!(
                        "Unresolvable RS token {}; stripping Authorization",
                        redact_token(&rs_token)
                    );
                    resolved.resolved_headers.remove("authorization");
                } else {
                    debug!(
                        "Passing through direct bearer {} (allow_direct_bearer)",
                        redact_token(&rs_token)
                    );
                    resolved.provider_token = Some(rs_token);
                }
            }
        }

        Ok(())
    }
}
