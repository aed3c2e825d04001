//! KV-backed token store
//!
//! Write-through to a remote key-value namespace with server-side TTLs,
//! layered over the in-memory backend. KV failures degrade to the memory
//! mirror: readers in this process still see the value (read-your-writes),
//! but other replicas may not.

use crate::error::{BridgeError, Result};
use crate::storage::memory::InMemoryTokenStore;
use crate::storage::token_store::{
    now_ms, ProviderToken, RsRecord, TokenStore, Transaction, CODE_TTL_MS, TRANSACTION_TTL_MS,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimal remote key-value client contract
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Get a value by key; misses are `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Put a value, optionally with a server-side TTL in seconds
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Delete a key (idempotent)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// HTTP implementation of `KvClient` against a REST-style namespace
///
/// Layout: `GET/PUT/DELETE {base}/values/{key}`, TTL passed as
/// `?expiration_ttl=` on writes, bearer-token authentication.
pub struct HttpKvClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpKvClient {
    /// Create a client for the given namespace base URL
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into(),
            token,
            client,
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!(
            "{}/values/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(key)
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl KvClient for HttpKvClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .authorize(self.client.get(self.value_url(key)))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BridgeError::storage(format!(
                "KV get failed with status {}",
                response.status()
            )));
        }
        Ok(Some(response.text().await?))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut url = self.value_url(key);
        if let Some(ttl) = ttl_secs {
            url.push_str(&format!("?expiration_ttl={}", ttl));
        }

        let response = self
            .authorize(self.client.put(url))
            .body(value.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BridgeError::storage(format!(
                "KV put failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.value_url(key)))
            .send()
            .await?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::storage(format!(
                "KV delete failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn access_key(token: &str) -> String {
    format!("rs:access:{}", token)
}

fn refresh_key(token: &str) -> String {
    format!("rs:refresh:{}", token)
}

fn txn_key(txn_id: &str) -> String {
    format!("txn:{}", txn_id)
}

fn code_key(code: &str) -> String {
    format!("code:{}", code)
}

/// KV-backed token store layered over the in-memory backend
pub struct KvTokenStore {
    inner: InMemoryTokenStore,
    kv: Arc<dyn KvClient>,
}

impl KvTokenStore {
    /// Create a store writing through to the given KV client
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self {
            inner: InMemoryTokenStore::new(),
            kv,
        }
    }

    fn record_ttl_secs(record: &RsRecord) -> u64 {
        ((record.expires_at - now_ms()).max(1000) / 1000) as u64
    }

    /// Write a record and both index entries through to KV; errors degrade
    async fn write_through_record(&self, record: &RsRecord) {
        let ttl = Self::record_ttl_secs(record);
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize RS record for KV: {}", e);
                return;
            }
        };

        if let Err(e) = self.kv.put(&access_key(&record.rs_access_token), &json, Some(ttl)).await {
            warn!("KV write-through failed (access index): {}; serving from memory", e);
            return;
        }
        if let Err(e) = self
            .kv
            .put(&refresh_key(&record.rs_refresh_token), &record.rs_access_token, Some(ttl))
            .await
        {
            warn!("KV write-through failed (refresh index): {}; serving from memory", e);
        }
    }

    async fn kv_delete_quiet(&self, key: &str) {
        if let Err(e) = self.kv.delete(key).await {
            warn!("KV delete failed for {}: {}", key, e);
        }
    }
}

#[async_trait]
impl TokenStore for KvTokenStore {
    async fn store_rs_mapping(
        &self,
        rs_access: &str,
        provider: ProviderToken,
        rs_refresh: Option<&str>,
    ) -> Result<RsRecord> {
        // Re-keying an existing refresh token must drop the old KV access entry
        if let Some(refresh) = rs_refresh {
            if let Some(old) = self.inner.get_by_rs_refresh(refresh).await? {
                if old.rs_access_token != rs_access {
                    self.kv_delete_quiet(&access_key(&old.rs_access_token)).await;
                }
            }
        }

        let record = self.inner.store_rs_mapping(rs_access, provider, rs_refresh).await?;
        self.write_through_record(&record).await;
        Ok(record)
    }

    async fn get_by_rs_access(&self, token: &str) -> Result<Option<RsRecord>> {
        if let Some(record) = self.inner.get_by_rs_access(token).await? {
            return Ok(Some(record));
        }

        // Memory miss: another replica may have written the record
        match self.kv.get(&access_key(token)).await {
            Ok(Some(json)) => match serde_json::from_str::<RsRecord>(&json) {
                Ok(record) if !record.is_expired() => {
                    self.inner.hydrate(vec![record.clone()]).await;
                    Ok(Some(record))
                }
                Ok(_) => Ok(None),
                Err(e) => {
                    warn!("Discarding malformed KV record: {}", e);
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("KV read failed, falling back to memory miss: {}", e);
                Ok(None)
            }
        }
    }

    async fn get_by_rs_refresh(&self, token: &str) -> Result<Option<RsRecord>> {
        if let Some(record) = self.inner.get_by_rs_refresh(token).await? {
            return Ok(Some(record));
        }

        match self.kv.get(&refresh_key(token)).await {
            Ok(Some(access)) => self.get_by_rs_access(&access).await,
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("KV read failed, falling back to memory miss: {}", e);
                Ok(None)
            }
        }
    }

    async fn update_by_rs_refresh(
        &self,
        rs_refresh: &str,
        new_provider: ProviderToken,
        new_rs_access: Option<&str>,
    ) -> Result<Option<RsRecord>> {
        // Hydrate from KV first so cross-replica updates find the record
        let existing = match self.get_by_rs_refresh(rs_refresh).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        let updated = match self
            .inner
            .update_by_rs_refresh(rs_refresh, new_provider, new_rs_access)
            .await?
        {
            Some(record) => record,
            None => return Ok(None),
        };

        // Old access index entry is deleted before the new record is published
        if updated.rs_access_token != existing.rs_access_token {
            self.kv_delete_quiet(&access_key(&existing.rs_access_token)).await;
        }
        self.write_through_record(&updated).await;
        Ok(Some(updated))
    }

    async fn save_transaction(&self, txn_id: &str, txn: Transaction) -> Result<()> {
        self.inner.save_transaction(txn_id, txn.clone()).await?;
        let json = serde_json::to_string(&txn)?;
        if let Err(e) = self
            .kv
            .put(&txn_key(txn_id), &json, Some((TRANSACTION_TTL_MS / 1000) as u64))
            .await
        {
            warn!("KV write-through failed (transaction): {}", e);
        }
        Ok(())
    }

    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>> {
        if let Some(txn) = self.inner.get_transaction(txn_id).await? {
            return Ok(Some(txn));
        }

        match self.kv.get(&txn_key(txn_id)).await {
            Ok(Some(json)) => match serde_json::from_str::<Transaction>(&json) {
                Ok(txn) if !txn.is_expired() => {
                    self.inner.save_transaction(txn_id, txn.clone()).await?;
                    Ok(Some(txn))
                }
                _ => Ok(None),
            },
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("KV read failed for transaction: {}", e);
                Ok(None)
            }
        }
    }

    async fn delete_transaction(&self, txn_id: &str) -> Result<()> {
        self.inner.delete_transaction(txn_id).await?;
        self.kv_delete_quiet(&txn_key(txn_id)).await;
        Ok(())
    }

    async fn save_code(&self, code: &str, txn_id: &str) -> Result<()> {
        self.inner.save_code(code, txn_id).await?;
        if let Err(e) = self
            .kv
            .put(&code_key(code), txn_id, Some((CODE_TTL_MS / 1000) as u64))
            .await
        {
            warn!("KV write-through failed (code): {}", e);
        }
        Ok(())
    }

    async fn get_txn_id_by_code(&self, code: &str) -> Result<Option<String>> {
        if let Some(txn_id) = self.inner.get_txn_id_by_code(code).await? {
            return Ok(Some(txn_id));
        }

        match self.kv.get(&code_key(code)).await {
            Ok(Some(txn_id)) => {
                self.inner.save_code(code, &txn_id).await?;
                Ok(Some(txn_id))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("KV read failed for code: {}", e);
                Ok(None)
            }
        }
    }

    async fn delete_code(&self, code: &str) -> Result<()> {
        self.inner.delete_code(code).await?;
        self.kv_delete_quiet(&code_key(code)).await;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        // KV entries expire server-side via TTL; only the mirror needs sweeping
        self.inner.cleanup_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-process KV fake recording puts/deletes
    #[derive(Default)]
    struct FakeKv {
        data: Mutex<HashMap<String, String>>,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KvClient for FakeKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.data.lock().await.get(key).cloned())
        }

        async fn put(&self, key: &str, value: &str, _ttl_secs: Option<u64>) -> Result<()> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(BridgeError::storage("KV unavailable"));
            }
            self.data.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.data.lock().await.remove(key);
            Ok(())
        }
    }

    fn provider() -> ProviderToken {
        ProviderToken {
            access_token: "upstream".to_string(),
            refresh_token: Some("upstream-refresh".to_string()),
            expires_at: Some(now_ms() + 3_600_000),
            scopes: None,
        }
    }

    #[tokio::test]
    async fn test_write_through_and_cross_replica_read() {
        let kv = Arc::new(FakeKv::default());
        let store = KvTokenStore::new(kv.clone());
        store
            .store_rs_mapping("acc-1", provider(), Some("ref-1"))
            .await
            .unwrap();

        assert!(kv.data.lock().await.contains_key("rs:access:acc-1"));
        assert!(kv.data.lock().await.contains_key("rs:refresh:ref-1"));

        // A second store sharing the namespace sees the record
        let replica = KvTokenStore::new(kv.clone());
        let record = replica.get_by_rs_refresh("ref-1").await.unwrap().unwrap();
        assert_eq!(record.rs_access_token, "acc-1");
    }

    #[tokio::test]
    async fn test_rotation_deletes_old_kv_access_entry() {
        let kv = Arc::new(FakeKv::default());
        let store = KvTokenStore::new(kv.clone());
        store
            .store_rs_mapping("acc-old", provider(), Some("ref-1"))
            .await
            .unwrap();

        store
            .update_by_rs_refresh("ref-1", provider(), Some("acc-new"))
            .await
            .unwrap()
            .unwrap();

        let data = kv.data.lock().await;
        assert!(!data.contains_key("rs:access:acc-old"));
        assert!(data.contains_key("rs:access:acc-new"));
        assert_eq!(data.get("rs:refresh:ref-1").unwrap(), "acc-new");
    }

    #[tokio::test]
    async fn test_kv_failure_degrades_to_memory() {
        let kv = Arc::new(FakeKv::default());
        kv.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        let store = KvTokenStore::new(kv.clone());

        // Write-through fails but the memory mirror accepted the change
        store
            .store_rs_mapping("acc-1", provider(), Some("ref-1"))
            .await
            .unwrap();
        assert!(store.get_by_rs_access("acc-1").await.unwrap().is_some());
        assert!(kv.data.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_codes_and_transactions_round_trip() {
        let kv = Arc::new(FakeKv::default());
        let store = KvTokenStore::new(kv.clone());

        let txn = Transaction::new("challenge".to_string(), None, None, None);
        store.save_transaction("t-1", txn).await.unwrap();
        store.save_code("c-1", "t-1").await.unwrap();

        let replica = KvTokenStore::new(kv);
        assert_eq!(
            replica.get_txn_id_by_code("c-1").await.unwrap().as_deref(),
            Some("t-1")
        );
        assert!(replica.get_transaction("t-1").await.unwrap().is_some());
    }
}
