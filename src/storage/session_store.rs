//! Session store contract and backends
//!
//! Sessions are keyed by the UUID carried in `Mcp-Session-Id`. Each session
//! is softly bound to the credential fingerprint that created it; at most
//! five sessions may exist per fingerprint, with the least recently accessed
//! evicted to make room.

use crate::error::Result;
use crate::storage::kv::KvClient;
use crate::storage::token_store::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Session lifetime: 24 hours, refreshed on every access
pub const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Maximum sessions per credential fingerprint
pub const MAX_SESSIONS_PER_API_KEY: usize = 5;

/// Global session cap; oldest-by-creation evicted on overflow
pub const MAX_SESSIONS: usize = 10_000;

/// One MCP session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Server-chosen session id (UUID)
    pub session_id: String,
    /// Credential fingerprint first bound to this session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last access time, epoch milliseconds
    pub last_accessed: i64,
    /// Whether notifications/initialized has arrived
    pub initialized: bool,
    /// Negotiated protocol version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Client info captured at initialize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Value>,
}

impl SessionRecord {
    fn new(session_id: &str, api_key: Option<&str>) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.to_string(),
            api_key: api_key.map(String::from),
            created_at: now,
            last_accessed: now,
            initialized: false,
            protocol_version: None,
            client_info: None,
        }
    }

    /// Whether the session is past its TTL relative to last access
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.last_accessed + SESSION_TTL_MS
    }
}

/// Partial update merged into a session
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// Bind a credential fingerprint (append-only; ignored once set)
    pub api_key: Option<String>,
    /// Set the initialized flag
    pub initialized: Option<bool>,
    /// Set the negotiated protocol version
    pub protocol_version: Option<String>,
    /// Set client info
    pub client_info: Option<Value>,
}

/// Session store contract
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session, pre-evicting the oldest one for `api_key` at the cap
    async fn create(&self, session_id: &str, api_key: Option<&str>) -> Result<SessionRecord>;

    /// Fetch a session, bumping `last_accessed`; expired sessions read as absent
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Merge a patch into a session, bumping `last_accessed`
    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<Option<SessionRecord>>;

    /// Delete a session
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// All live sessions bound to `api_key`
    async fn get_by_api_key(&self, api_key: &str) -> Result<Vec<SessionRecord>>;

    /// Count of live sessions bound to `api_key`
    async fn count_by_api_key(&self, api_key: &str) -> Result<usize>;

    /// Delete the session with the smallest `last_accessed` for `api_key`
    async fn delete_oldest_by_api_key(&self, api_key: &str) -> Result<bool>;

    /// Remove expired sessions; returns eviction count
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// In-memory session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_patch(record: &mut SessionRecord, patch: SessionPatch) {
        // The api_key binding is append-only
        if record.api_key.is_none() {
            record.api_key = patch.api_key;
        }
        if let Some(initialized) = patch.initialized {
            record.initialized = initialized;
        }
        if let Some(version) = patch.protocol_version {
            record.protocol_version = Some(version);
        }
        if let Some(info) = patch.client_info {
            record.client_info = Some(info);
        }
        record.last_accessed = now_ms();
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session_id: &str, api_key: Option<&str>) -> Result<SessionRecord> {
        if let Some(key) = api_key {
            while self.count_by_api_key(key).await? >= MAX_SESSIONS_PER_API_KEY {
                if !self.delete_oldest_by_api_key(key).await? {
                    break;
                }
                info!(
                    "Evicted oldest session for credential {} at the per-key cap",
                    crate::utils::redact_token(key)
                );
            }
        }

        let mut sessions = self.sessions.write().await;

        // Global cap: evict oldest by creation
        if sessions.len() >= MAX_SESSIONS {
            if let Some(oldest) = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.session_id.clone())
            {
                sessions.remove(&oldest);
                warn!("Global session cap reached; evicted oldest session {}", oldest);
            }
        }

        let record = SessionRecord::new(session_id, api_key);
        sessions.insert(session_id.to_string(), record.clone());
        debug!("Created session {}", session_id);
        Ok(record)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(record) if record.is_expired() => {
                sessions.remove(session_id);
                Ok(None)
            }
            Some(record) => {
                record.last_accessed = now_ms();
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<Option<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(record) => {
                Self::apply_patch(record, patch);
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(session_id).is_some() {
            debug!("Deleted session {}", session_id);
        }
        Ok(())
    }

    async fn get_by_api_key(&self, api_key: &str) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.api_key.as_deref() == Some(api_key) && !s.is_expired())
            .cloned()
            .collect())
    }

    async fn count_by_api_key(&self, api_key: &str) -> Result<usize> {
        Ok(self.get_by_api_key(api_key).await?.len())
    }

    async fn delete_oldest_by_api_key(&self, api_key: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let oldest = sessions
            .values()
            .filter(|s| s.api_key.as_deref() == Some(api_key))
            .min_by_key(|s| s.last_accessed)
            .map(|s| s.session_id.clone());

        match oldest {
            Some(session_id) => {
                sessions.remove(&session_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|session_id, record| {
            let expired = record.is_expired();
            if expired {
                debug!("Removing expired session {}", session_id);
            }
            !expired
        });
        Ok(before - sessions.len())
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn apikey_index_key(api_key: &str) -> String {
    format!("session:apikey:{}", api_key)
}

/// KV-backed session store layered over the in-memory backend
///
/// The api-key index is stored as a JSON array of session ids under
/// `session:apikey:{key}` with last-writer-wins semantics.
pub struct KvSessionStore {
    inner: InMemorySessionStore,
    kv: Arc<dyn KvClient>,
}

impl KvSessionStore {
    /// Create a store writing through to the given KV client
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            kv,
        }
    }

    async fn write_through(&self, record: &SessionRecord) {
        let ttl = (SESSION_TTL_MS / 1000) as u64;
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(e) = self.kv.put(&session_key(&record.session_id), &json, Some(ttl)).await {
                    warn!("KV write-through failed (session): {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize session for KV: {}", e),
        }

        if let Some(api_key) = &record.api_key {
            if let Err(e) = self.update_apikey_index(api_key).await {
                warn!("KV write-through failed (apikey index): {}", e);
            }
        }
    }

    async fn update_apikey_index(&self, api_key: &str) -> Result<()> {
        let ids: Vec<String> = self
            .inner
            .get_by_api_key(api_key)
            .await?
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        let json = serde_json::to_string(&ids)?;
        self.kv
            .put(&apikey_index_key(api_key), &json, Some((SESSION_TTL_MS / 1000) as u64))
            .await
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn create(&self, session_id: &str, api_key: Option<&str>) -> Result<SessionRecord> {
        let record = self.inner.create(session_id, api_key).await?;
        self.write_through(&record).await;
        Ok(record)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        if let Some(record) = self.inner.get(session_id).await? {
            return Ok(Some(record));
        }

        match self.kv.get(&session_key(session_id)).await {
            Ok(Some(json)) => match serde_json::from_str::<SessionRecord>(&json) {
                Ok(record) if !record.is_expired() => {
                    // Rebuild the mirror entry then bump last_accessed through it
                    {
                        let mut sessions = self.inner.sessions.write().await;
                        sessions.insert(session_id.to_string(), record);
                    }
                    self.inner.get(session_id).await
                }
                _ => Ok(None),
            },
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("KV read failed for session: {}", e);
                Ok(None)
            }
        }
    }

    async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<Option<SessionRecord>> {
        // Hydrate first so updates work across replicas
        if self.inner.get(session_id).await?.is_none() {
            let _ = self.get(session_id).await?;
        }

        let result = self.inner.update(session_id, patch).await?;
        if let Some(record) = &result {
            self.write_through(record).await;
        }
        Ok(result)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let api_key = self
            .inner
            .get(session_id)
            .await?
            .and_then(|record| record.api_key);

        self.inner.delete(session_id).await?;
        if let Err(e) = self.kv.delete(&session_key(session_id)).await {
            warn!("KV delete failed (session): {}", e);
        }
        if let Some(key) = api_key {
            let _ = self.update_apikey_index(&key).await;
        }
        Ok(())
    }

    async fn get_by_api_key(&self, api_key: &str) -> Result<Vec<SessionRecord>> {
        self.inner.get_by_api_key(api_key).await
    }

    async fn count_by_api_key(&self, api_key: &str) -> Result<usize> {
        self.inner.count_by_api_key(api_key).await
    }

    async fn delete_oldest_by_api_key(&self, api_key: &str) -> Result<bool> {
        let deleted = self.inner.delete_oldest_by_api_key(api_key).await?;
        if deleted {
            let _ = self.update_apikey_index(api_key).await;
        }
        Ok(deleted)
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        self.inner.cleanup_expired().await
    }
}
