//! Storage layer: token store, session store, and their backends
//!
//! Stores own their records exclusively; callers receive immutable
//! snapshots. Three token-store backends share one contract: in-memory
//! (reference), file-backed (encrypted write-through), and KV-backed
//! (remote namespace with memory fallback).

pub mod crypto;
pub mod file;
pub mod kv;
pub mod memory;
pub mod session_store;
pub mod token_store;

pub use file::FileTokenStore;
pub use kv::{HttpKvClient, KvClient, KvTokenStore};
pub use memory::InMemoryTokenStore;
pub use session_store::{
    InMemorySessionStore, KvSessionStore, SessionPatch, SessionRecord, SessionStore,
    MAX_SESSIONS, MAX_SESSIONS_PER_API_KEY, SESSION_TTL_MS,
};
pub use token_store::{
    mint_opaque_token, now_ms, ProviderToken, RsRecord, TokenStore, Transaction, CODE_TTL_MS,
    MAX_RS_RECORDS, RS_RECORD_TTL_MS, TRANSACTION_TTL_MS,
};

use crate::config::StorageConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sweep interval shared by the storage background tasks
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the token store selected by configuration
///
/// Precedence: KV namespace, then file-backed, then plain in-memory.
pub async fn build_token_store(config: &StorageConfig) -> Result<Arc<dyn TokenStore>> {
    if let Some(kv_url) = &config.kv_url {
        info!("Using KV-backed token store at {}", kv_url);
        let client = Arc::new(HttpKvClient::new(kv_url.clone(), config.kv_token.clone()));
        return Ok(Arc::new(KvTokenStore::new(client)));
    }

    if let Some(path) = &config.rs_tokens_file {
        info!("Using file-backed token store at {}", path);
        let store = FileTokenStore::new(path, config.rs_tokens_enc_key.as_deref()).await?;
        return Ok(Arc::new(store));
    }

    info!("Using in-memory token store");
    Ok(Arc::new(InMemoryTokenStore::new()))
}

/// Build the session store selected by configuration
pub fn build_session_store(config: &StorageConfig) -> Arc<dyn SessionStore> {
    if let Some(kv_url) = &config.kv_url {
        let client = Arc::new(HttpKvClient::new(kv_url.clone(), config.kv_token.clone()));
        return Arc::new(KvSessionStore::new(client));
    }
    Arc::new(InMemorySessionStore::new())
}

/// Spawn the 60-second sweep tasks for both stores
///
/// Returns join handles so shutdown can abort them before flushing.
pub fn spawn_sweepers(
    token_store: Arc<dyn TokenStore>,
    session_store: Arc<dyn SessionStore>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let token_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match token_store.cleanup_expired().await {
                Ok(evicted) if evicted > 0 => {
                    tracing::debug!("Token store sweep evicted {} entries", evicted)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Token store sweep failed: {}", e),
            }
        }
    });

    let session_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match session_store.cleanup_expired().await {
                Ok(evicted) if evicted > 0 => {
                    tracing::info!("Session sweep removed {} expired sessions", evicted)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Session sweep failed: {}", e),
            }
        }
    });

    vec![token_handle, session_handle]
}
