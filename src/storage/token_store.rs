//! Token store contract and record types
//!
//! The token store owns the bidirectional mapping between bridge-issued RS
//! tokens and upstream provider tokens, plus the short-lived OAuth
//! transaction and authorization-code entries.

use crate::error::Result;
use crate::utils::b64::random_token;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default RS record lifetime: 7 days
pub const RS_RECORD_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// OAuth transaction lifetime: 10 minutes
pub const TRANSACTION_TTL_MS: i64 = 10 * 60 * 1000;

/// Authorization code lifetime: 10 minutes
pub const CODE_TTL_MS: i64 = 10 * 60 * 1000;

/// Maximum RS records kept before cap eviction kicks in
pub const MAX_RS_RECORDS: usize = 10_000;

/// Number of oldest records evicted when the cap is crossed
pub const RS_EVICTION_BATCH: usize = 10;

/// Current epoch time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Mint an opaque url-safe token from 24 random bytes
pub fn mint_opaque_token() -> String {
    random_token(24)
}

/// Upstream identity provider credential
///
/// Immutable record; a refresh replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderToken {
    /// Opaque upstream access token
    pub access_token: String,
    /// Upstream refresh token, if issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as epoch milliseconds, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl ProviderToken {
    /// Create a provider token from token-endpoint response fields
    pub fn from_response(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: Option<u64>,
        scope: Option<&str>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_in_secs.map(|s| now_ms() + (s as i64) * 1000),
            scopes: scope.map(|s| s.split_whitespace().map(String::from).collect()),
        }
    }

    /// Whether the token is expired or expires within `leeway_ms`
    pub fn needs_refresh(&self, leeway_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms() >= expires_at - leeway_ms,
            None => false,
        }
    }

    /// Whether the token is already past its expiry
    pub fn is_expired(&self) -> bool {
        self.needs_refresh(0)
    }
}

/// RS record: a bridge-issued token pair mapped to an upstream credential
///
/// Invariant: exactly one live access key and one live refresh key address a
/// record at any instant. Rotation deletes the stale index entry before the
/// new one is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsRecord {
    /// Opaque RS access token (24+ random url-safe bytes)
    pub rs_access_token: String,
    /// Opaque RS refresh token
    pub rs_refresh_token: String,
    /// Mapped upstream provider credential
    pub provider: ProviderToken,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Record-level expiry, epoch milliseconds
    pub expires_at: i64,
}

impl RsRecord {
    /// Create a record with the default 7-day TTL
    pub fn new(rs_access_token: String, rs_refresh_token: String, provider: ProviderToken) -> Self {
        let now = now_ms();
        Self {
            rs_access_token,
            rs_refresh_token,
            provider,
            created_at: now,
            expires_at: now + RS_RECORD_TTL_MS,
        }
    }

    /// Whether the record itself (not the provider token) is expired
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

/// In-flight OAuth authorization transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// PKCE S256 code challenge supplied by the client
    pub code_challenge: String,
    /// Client-supplied state echoed on redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Requested scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Correlated MCP session id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Provider token populated after the provider callback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderToken>,
}

impl Transaction {
    /// Create a transaction stamped at the current time
    pub fn new(code_challenge: String, state: Option<String>, scope: Option<String>, sid: Option<String>) -> Self {
        Self {
            code_challenge,
            state,
            scope,
            created_at: now_ms(),
            sid,
            provider: None,
        }
    }

    /// Whether the transaction is past its 10-minute TTL
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.created_at + TRANSACTION_TTL_MS
    }
}

/// Token store contract
///
/// All operations are asynchronous and may fail with backend I/O errors.
/// Read misses are `Ok(None)`, not errors.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Create or replace an RS mapping
    ///
    /// If `rs_refresh` matches an existing record, the record is updated in
    /// place and the old access key is re-indexed to `rs_access`.
    async fn store_rs_mapping(
        &self,
        rs_access: &str,
        provider: ProviderToken,
        rs_refresh: Option<&str>,
    ) -> Result<RsRecord>;

    /// Look up a record by RS access token; expired records are deleted on read
    async fn get_by_rs_access(&self, token: &str) -> Result<Option<RsRecord>>;

    /// Look up a record by RS refresh token; expired records are deleted on read
    async fn get_by_rs_refresh(&self, token: &str) -> Result<Option<RsRecord>>;

    /// Atomically replace the provider token for the record addressed by `rs_refresh`
    ///
    /// When `new_rs_access` differs from the current access key, the old
    /// access index entry is deleted before the new one is published so two
    /// access tokens never address the record simultaneously.
    async fn update_by_rs_refresh(
        &self,
        rs_refresh: &str,
        new_provider: ProviderToken,
        new_rs_access: Option<&str>,
    ) -> Result<Option<RsRecord>>;

    /// Save an OAuth transaction
    async fn save_transaction(&self, txn_id: &str, txn: Transaction) -> Result<()>;

    /// Fetch an OAuth transaction; expired entries read as absent
    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>>;

    /// Delete an OAuth transaction
    async fn delete_transaction(&self, txn_id: &str) -> Result<()>;

    /// Map an authorization code to a transaction id
    async fn save_code(&self, code: &str, txn_id: &str) -> Result<()>;

    /// Resolve an authorization code; expired entries read as absent
    async fn get_txn_id_by_code(&self, code: &str) -> Result<Option<String>>;

    /// Delete an authorization code (codes are single-use)
    async fn delete_code(&self, code: &str) -> Result<()>;

    /// Remove expired records, transactions and codes; returns eviction count
    async fn cleanup_expired(&self) -> Result<usize>;

    /// Flush pending writes (file-backed stores persist on shutdown)
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
