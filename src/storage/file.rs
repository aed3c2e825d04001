//! File-backed token store
//!
//! Layers encrypted-at-rest persistence over the in-memory backend.
//! Mutations mark the store dirty; a background task coalesces writes in a
//! 100 ms debounce window before persisting the full snapshot. The persist
//! document is `{version: 1, encrypted: bool, records: [RsRecord...]}`;
//! when a key is configured the entire document is AES-256-GCM encrypted
//! with a 12-byte nonce prefix.

use crate::error::{BridgeError, Result};
use crate::storage::crypto;
use crate::storage::memory::InMemoryTokenStore;
use crate::storage::token_store::{ProviderToken, RsRecord, TokenStore, Transaction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Write coalescing window
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Persisted document shape
#[derive(Debug, Serialize, Deserialize)]
struct PersistDoc {
    version: u32,
    encrypted: bool,
    records: Vec<RsRecord>,
}

/// File-backed token store layered over the in-memory backend
pub struct FileTokenStore {
    inner: Arc<InMemoryTokenStore>,
    path: PathBuf,
    key: Option<[u8; 32]>,
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl FileTokenStore {
    /// Open (or create) a file-backed store
    ///
    /// A configured encryption key must be a 32-byte url-safe-base64 string;
    /// a bad key length fails construction. An existing encrypted file with
    /// no key configured is left untouched and the store starts empty.
    pub async fn new(path: impl AsRef<Path>, enc_key: Option<&str>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let key = match enc_key {
            Some(encoded) => Some(crypto::validate_key(encoded)?),
            None => None,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mut permissions = std::fs::metadata(parent)?.permissions();
                    permissions.set_mode(0o700);
                    std::fs::set_permissions(parent, permissions)?;
                }
            }
        }

        let inner = Arc::new(InMemoryTokenStore::new());

        if path.exists() {
            match Self::load_document(&path, key.as_ref()) {
                Ok(Some(records)) => {
                    let loaded = inner.hydrate(records).await;
                    info!("Hydrated {} RS records from {}", loaded, path.display());
                }
                Ok(None) => {
                    warn!(
                        "Token file {} is encrypted but no key is configured; starting empty",
                        path.display()
                    );
                }
                Err(e) => {
                    warn!("Failed to load token file {}: {}; starting empty", path.display(), e);
                }
            }
        }

        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let store = Self {
            inner,
            path,
            key,
            dirty_tx,
        };
        store.spawn_persist_task(dirty_rx);
        Ok(store)
    }

    /// Read and decode the persisted document
    ///
    /// Returns `Ok(None)` when the file is encrypted and no key is available.
    fn load_document(path: &Path, key: Option<&[u8; 32]>) -> Result<Option<Vec<RsRecord>>> {
        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Some(Vec::new()));
        }

        // Plaintext documents parse directly; anything else is ciphertext
        if let Ok(doc) = serde_json::from_slice::<PersistDoc>(&bytes) {
            return Ok(Some(doc.records));
        }

        match key {
            Some(k) => {
                let plaintext = crypto::decrypt(&bytes, k)?;
                let doc: PersistDoc = serde_json::from_slice(&plaintext)?;
                Ok(Some(doc.records))
            }
            None => Ok(None),
        }
    }

    fn spawn_persist_task(&self, mut dirty_rx: mpsc::UnboundedReceiver<()>) {
        let inner = Arc::clone(&self.inner);
        let path = self.path.clone();
        let key = self.key;

        tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                // Coalesce further dirty signals inside the debounce window
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                while dirty_rx.try_recv().is_ok() {}

                if let Err(e) = persist_snapshot(&inner, &path, key.as_ref()).await {
                    warn!("Failed to persist token store to {}: {}", path.display(), e);
                }
            }
            debug!("Token store persist task stopped");
        });
    }

    fn mark_dirty(&self) {
        // Receiver only drops on shutdown, after the final flush
        let _ = self.dirty_tx.send(());
    }
}

/// Write the current record snapshot to disk with owner-only permissions
async fn persist_snapshot(
    inner: &InMemoryTokenStore,
    path: &Path,
    key: Option<&[u8; 32]>,
) -> Result<()> {
    let records = inner.snapshot_records().await;
    let doc = PersistDoc {
        version: 1,
        encrypted: key.is_some(),
        records,
    };

    let json = serde_json::to_vec(&doc)?;
    let payload = match key {
        Some(k) => crypto::encrypt(&json, k)?,
        None => json,
    };

    std::fs::write(path, &payload)
        .map_err(|e| BridgeError::storage(format!("Failed to write token file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        std::fs::set_permissions(path, permissions)?;
    }

    debug!("Persisted {} bytes to {}", payload.len(), path.display());
    Ok(())
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn store_rs_mapping(
        &self,
        rs_access: &str,
        provider: ProviderToken,
        rs_refresh: Option<&str>,
    ) -> Result<RsRecord> {
        let record = self.inner.store_rs_mapping(rs_access, provider, rs_refresh).await?;
        self.mark_dirty();
        Ok(record)
    }

    async fn get_by_rs_access(&self, token: &str) -> Result<Option<RsRecord>> {
        self.inner.get_by_rs_access(token).await
    }

    async fn get_by_rs_refresh(&self, token: &str) -> Result<Option<RsRecord>> {
        self.inner.get_by_rs_refresh(token).await
    }

    async fn update_by_rs_refresh(
        &self,
        rs_refresh: &str,
        new_provider: ProviderToken,
        new_rs_access: Option<&str>,
    ) -> Result<Option<RsRecord>> {
        let result = self
            .inner
            .update_by_rs_refresh(rs_refresh, new_provider, new_rs_access)
            .await?;
        if result.is_some() {
            self.mark_dirty();
        }
        Ok(result)
    }

    async fn save_transaction(&self, txn_id: &str, txn: Transaction) -> Result<()> {
        self.inner.save_transaction(txn_id, txn).await
    }

    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>> {
        self.inner.get_transaction(txn_id).await
    }

    async fn delete_transaction(&self, txn_id: &str) -> Result<()> {
        self.inner.delete_transaction(txn_id).await
    }

    async fn save_code(&self, code: &str, txn_id: &str) -> Result<()> {
        self.inner.save_code(code, txn_id).await
    }

    async fn get_txn_id_by_code(&self, code: &str) -> Result<Option<String>> {
        self.inner.get_txn_id_by_code(code).await
    }

    async fn delete_code(&self, code: &str) -> Result<()> {
        self.inner.delete_code(code).await
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let evicted = self.inner.cleanup_expired().await?;
        if evicted > 0 {
            self.mark_dirty();
        }
        Ok(evicted)
    }

    /// Persist the current snapshot immediately (graceful shutdown path)
    async fn flush(&self) -> Result<()> {
        persist_snapshot(&self.inner, &self.path, self.key.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::token_store::now_ms;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn provider() -> ProviderToken {
        ProviderToken {
            access_token: "upstream".to_string(),
            refresh_token: Some("upstream-refresh".to_string()),
            expires_at: Some(now_ms() + 3_600_000),
            scopes: None,
        }
    }

    fn test_key() -> String {
        URL_SAFE_NO_PAD.encode([42u8; 32])
    }

    #[tokio::test]
    async fn test_persist_and_reload_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        {
            let store = FileTokenStore::new(&path, None).await.unwrap();
            store
                .store_rs_mapping("acc-1", provider(), Some("ref-1"))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let reloaded = FileTokenStore::new(&path, None).await.unwrap();
        let record = reloaded.get_by_rs_access("acc-1").await.unwrap().unwrap();
        assert_eq!(record.rs_refresh_token, "ref-1");
    }

    #[tokio::test]
    async fn test_persist_and_reload_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.enc");
        let key = test_key();

        {
            let store = FileTokenStore::new(&path, Some(&key)).await.unwrap();
            store
                .store_rs_mapping("acc-1", provider(), Some("ref-1"))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        // The on-disk bytes must not be valid JSON
        let raw = std::fs::read(&path).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());

        let reloaded = FileTokenStore::new(&path, Some(&key)).await.unwrap();
        assert!(reloaded.get_by_rs_access("acc-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_encrypted_file_without_key_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.enc");
        let key = test_key();

        {
            let store = FileTokenStore::new(&path, Some(&key)).await.unwrap();
            store
                .store_rs_mapping("acc-1", provider(), Some("ref-1"))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        // No key configured: the file is not consumed and the store is empty
        let reloaded = FileTokenStore::new(&path, None).await.unwrap();
        assert!(reloaded.get_by_rs_access("acc-1").await.unwrap().is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bad_key_length_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.enc");
        let short_key = URL_SAFE_NO_PAD.encode([1u8; 8]);
        assert!(FileTokenStore::new(&path, Some(&short_key)).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::new(&path, None).await.unwrap();
        store
            .store_rs_mapping("acc-1", provider(), Some("ref-1"))
            .await
            .unwrap();
        store.flush().await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_debounced_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::new(&path, None).await.unwrap();

        store
            .store_rs_mapping("acc-1", provider(), Some("ref-1"))
            .await
            .unwrap();

        // The debounce window should elapse and the file appear without flush
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(path.exists());
        let doc: PersistDoc = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc.version, 1);
        assert!(!doc.encrypted);
        assert_eq!(doc.records.len(), 1);
    }
}
