//! In-memory token store backend
//!
//! The reference implementation of the `TokenStore` contract. Records live
//! in maps guarded by a single lock so index rotation is observable as one
//! atomic step; a periodic sweep lazily deletes expired entries.

use crate::error::Result;
use crate::storage::token_store::{
    now_ms, ProviderToken, RsRecord, TokenStore, Transaction, CODE_TTL_MS, MAX_RS_RECORDS,
    RS_EVICTION_BATCH,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Authorization code entry with its creation time
#[derive(Debug, Clone)]
struct CodeEntry {
    txn_id: String,
    created_at: i64,
}

/// All maps behind one lock: rotation must delete the stale index entry and
/// publish the new one in the same critical section.
#[derive(Debug, Default)]
struct TokenMaps {
    /// RS access token -> record
    records: HashMap<String, RsRecord>,
    /// RS refresh token -> RS access token
    refresh_index: HashMap<String, String>,
    /// Transaction id -> transaction
    transactions: HashMap<String, Transaction>,
    /// Authorization code -> transaction id
    codes: HashMap<String, CodeEntry>,
}

/// In-memory token store
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    maps: RwLock<TokenMaps>,
}

impl InMemoryTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot all live RS records (for persistence layers)
    pub async fn snapshot_records(&self) -> Vec<RsRecord> {
        let maps = self.maps.read().await;
        maps.records.values().cloned().collect()
    }

    /// Rebuild the record maps from persisted records, skipping entries whose
    /// provider token is already expired
    pub async fn hydrate(&self, records: Vec<RsRecord>) -> usize {
        let mut maps = self.maps.write().await;
        let mut loaded = 0;
        for record in records {
            if record.is_expired() || record.provider.is_expired() {
                continue;
            }
            maps.refresh_index
                .insert(record.rs_refresh_token.clone(), record.rs_access_token.clone());
            maps.records.insert(record.rs_access_token.clone(), record);
            loaded += 1;
        }
        loaded
    }

    /// Number of live RS records
    pub async fn record_count(&self) -> usize {
        self.maps.read().await.records.len()
    }

    fn evict_oldest_locked(maps: &mut TokenMaps) {
        if maps.records.len() <= MAX_RS_RECORDS {
            return;
        }

        let mut by_age: Vec<(String, i64)> = maps
            .records
            .iter()
            .map(|(access, rec)| (access.clone(), rec.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);

        for (access, _) in by_age.into_iter().take(RS_EVICTION_BATCH) {
            if let Some(record) = maps.records.remove(&access) {
                maps.refresh_index.remove(&record.rs_refresh_token);
                debug!("Evicted RS record over capacity: {}", crate::utils::redact_token(&access));
            }
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn store_rs_mapping(
        &self,
        rs_access: &str,
        provider: ProviderToken,
        rs_refresh: Option<&str>,
    ) -> Result<RsRecord> {
        let mut maps = self.maps.write().await;

        // An existing refresh token means update-in-place with access re-indexing
        if let Some(refresh) = rs_refresh {
            if let Some(old_access) = maps.refresh_index.get(refresh).cloned() {
                if let Some(mut record) = maps.records.remove(&old_access) {
                    record.rs_access_token = rs_access.to_string();
                    record.provider = provider;
                    maps.refresh_index
                        .insert(refresh.to_string(), rs_access.to_string());
                    maps.records.insert(rs_access.to_string(), record.clone());
                    return Ok(record);
                }
            }
        }

        let refresh = rs_refresh
            .map(String::from)
            .unwrap_or_else(crate::storage::token_store::mint_opaque_token);
        let record = RsRecord::new(rs_access.to_string(), refresh.clone(), provider);

        maps.refresh_index.insert(refresh, rs_access.to_string());
        maps.records.insert(rs_access.to_string(), record.clone());

        Self::evict_oldest_locked(&mut maps);
        Ok(record)
    }

    async fn get_by_rs_access(&self, token: &str) -> Result<Option<RsRecord>> {
        {
            let maps = self.maps.read().await;
            match maps.records.get(token) {
                Some(record) if !record.is_expired() => return Ok(Some(record.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Lazy eviction: drop the expired record and both index entries
        let mut maps = self.maps.write().await;
        if let Some(record) = maps.records.get(token).cloned() {
            if record.is_expired() {
                maps.records.remove(token);
                maps.refresh_index.remove(&record.rs_refresh_token);
                return Ok(None);
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    async fn get_by_rs_refresh(&self, token: &str) -> Result<Option<RsRecord>> {
        let access = {
            let maps = self.maps.read().await;
            match maps.refresh_index.get(token) {
                Some(access) => access.clone(),
                None => return Ok(None),
            }
        };
        self.get_by_rs_access(&access).await
    }

    async fn update_by_rs_refresh(
        &self,
        rs_refresh: &str,
        new_provider: ProviderToken,
        new_rs_access: Option<&str>,
    ) -> Result<Option<RsRecord>> {
        let mut maps = self.maps.write().await;

        let old_access = match maps.refresh_index.get(rs_refresh) {
            Some(access) => access.clone(),
            None => return Ok(None),
        };

        let mut record = match maps.records.remove(&old_access) {
            Some(record) => record,
            None => {
                // Dangling index entry; repair and report a miss
                maps.refresh_index.remove(rs_refresh);
                warn!("Repaired dangling refresh index entry");
                return Ok(None);
            }
        };

        record.provider = new_provider;

        // The old access entry was removed above, before the new key is
        // published, so there is no window with two valid access tokens.
        if let Some(new_access) = new_rs_access {
            if new_access != old_access {
                record.rs_access_token = new_access.to_string();
                maps.refresh_index
                    .insert(rs_refresh.to_string(), new_access.to_string());
            }
        }

        maps.records
            .insert(record.rs_access_token.clone(), record.clone());
        Ok(Some(record))
    }

    async fn save_transaction(&self, txn_id: &str, txn: Transaction) -> Result<()> {
        let mut maps = self.maps.write().await;
        maps.transactions.insert(txn_id.to_string(), txn);
        Ok(())
    }

    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>> {
        let mut maps = self.maps.write().await;
        match maps.transactions.get(txn_id) {
            Some(txn) if txn.is_expired() => {
                maps.transactions.remove(txn_id);
                Ok(None)
            }
            Some(txn) => Ok(Some(txn.clone())),
            None => Ok(None),
        }
    }

    async fn delete_transaction(&self, txn_id: &str) -> Result<()> {
        let mut maps = self.maps.write().await;
        maps.transactions.remove(txn_id);
        Ok(())
    }

    async fn save_code(&self, code: &str, txn_id: &str) -> Result<()> {
        let mut maps = self.maps.write().await;
        maps.codes.insert(
            code.to_string(),
            CodeEntry {
                txn_id: txn_id.to_string(),
                created_at: now_ms(),
            },
        );
        Ok(())
    }

    async fn get_txn_id_by_code(&self, code: &str) -> Result<Option<String>> {
        let mut maps = self.maps.write().await;
        match maps.codes.get(code) {
            Some(entry) if now_ms() >= entry.created_at + CODE_TTL_MS => {
                maps.codes.remove(code);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.txn_id.clone())),
            None => Ok(None),
        }
    }

    async fn delete_code(&self, code: &str) -> Result<()> {
        let mut maps = self.maps.write().await;
        maps.codes.remove(code);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut maps = self.maps.write().await;
        let now = now_ms();
        let before = maps.records.len() + maps.transactions.len() + maps.codes.len();

        let expired_access: Vec<String> = maps
            .records
            .iter()
            .filter(|(_, rec)| rec.is_expired())
            .map(|(access, _)| access.clone())
            .collect();
        for access in expired_access {
            if let Some(record) = maps.records.remove(&access) {
                maps.refresh_index.remove(&record.rs_refresh_token);
            }
        }

        maps.transactions.retain(|_, txn| !txn.is_expired());
        maps.codes.retain(|_, entry| now < entry.created_at + CODE_TTL_MS);

        let after = maps.records.len() + maps.transactions.len() + maps.codes.len();
        Ok(before - after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(expires_at: Option<i64>) -> ProviderToken {
        ProviderToken {
            access_token: "upstream-access".to_string(),
            refresh_token: Some("upstream-refresh".to_string()),
            expires_at,
            scopes: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_lookup_both_keys() {
        let store = InMemoryTokenStore::new();
        let record = store
            .store_rs_mapping("acc-1", provider(None), Some("ref-1"))
            .await
            .unwrap();

        let by_access = store.get_by_rs_access("acc-1").await.unwrap().unwrap();
        let by_refresh = store.get_by_rs_refresh("ref-1").await.unwrap().unwrap();
        assert_eq!(by_access.rs_access_token, record.rs_access_token);
        assert_eq!(by_refresh.rs_access_token, record.rs_access_token);
        assert_eq!(by_access.rs_refresh_token, by_refresh.rs_refresh_token);
    }

    #[tokio::test]
    async fn test_update_rotates_access_key_atomically() {
        let store = InMemoryTokenStore::new();
        store
            .store_rs_mapping("acc-old", provider(None), Some("ref-1"))
            .await
            .unwrap();

        let updated = store
            .update_by_rs_refresh("ref-1", provider(Some(now_ms() + 60_000)), Some("acc-new"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.rs_access_token, "acc-new");

        // Old access key must be gone in the same observable step
        assert!(store.get_by_rs_access("acc-old").await.unwrap().is_none());
        assert!(store.get_by_rs_access("acc-new").await.unwrap().is_some());
        let by_refresh = store.get_by_rs_refresh("ref-1").await.unwrap().unwrap();
        assert_eq!(by_refresh.rs_access_token, "acc-new");
    }

    #[tokio::test]
    async fn test_update_without_rotation_keeps_access_key() {
        let store = InMemoryTokenStore::new();
        store
            .store_rs_mapping("acc-1", provider(None), Some("ref-1"))
            .await
            .unwrap();

        let new_provider = ProviderToken {
            access_token: "upstream-2".to_string(),
            refresh_token: Some("upstream-refresh-2".to_string()),
            expires_at: Some(now_ms() + 60_000),
            scopes: None,
        };
        let updated = store
            .update_by_rs_refresh("ref-1", new_provider, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.rs_access_token, "acc-1");
        assert_eq!(updated.provider.access_token, "upstream-2");
    }

    #[tokio::test]
    async fn test_unknown_refresh_is_a_miss() {
        let store = InMemoryTokenStore::new();
        let result = store
            .update_by_rs_refresh("nope", provider(None), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_store_with_existing_refresh_reindexes() {
        let store = InMemoryTokenStore::new();
        store
            .store_rs_mapping("acc-1", provider(None), Some("ref-1"))
            .await
            .unwrap();
        store
            .store_rs_mapping("acc-2", provider(None), Some("ref-1"))
            .await
            .unwrap();

        assert!(store.get_by_rs_access("acc-1").await.unwrap().is_none());
        let record = store.get_by_rs_refresh("ref-1").await.unwrap().unwrap();
        assert_eq!(record.rs_access_token, "acc-2");
    }

    #[tokio::test]
    async fn test_transaction_ttl() {
        let store = InMemoryTokenStore::new();
        let mut txn = Transaction::new("challenge".to_string(), None, None, None);
        txn.created_at = now_ms() - crate::storage::token_store::TRANSACTION_TTL_MS - 1;
        store.save_transaction("t-1", txn).await.unwrap();
        assert!(store.get_transaction("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_code_single_use_flow() {
        let store = InMemoryTokenStore::new();
        store.save_code("code-1", "txn-1").await.unwrap();
        assert_eq!(
            store.get_txn_id_by_code("code-1").await.unwrap().as_deref(),
            Some("txn-1")
        );
        store.delete_code("code-1").await.unwrap();
        assert!(store.get_txn_id_by_code("code-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_records() {
        let store = InMemoryTokenStore::new();
        store
            .store_rs_mapping("acc-live", provider(None), Some("ref-live"))
            .await
            .unwrap();

        // Force one record past its TTL
        {
            let mut maps = store.maps.write().await;
            let mut record = RsRecord::new(
                "acc-dead".to_string(),
                "ref-dead".to_string(),
                provider(None),
            );
            record.expires_at = now_ms() - 1;
            maps.refresh_index
                .insert("ref-dead".to_string(), "acc-dead".to_string());
            maps.records.insert("acc-dead".to_string(), record);
        }

        let evicted = store.cleanup_expired().await.unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get_by_rs_access("acc-live").await.unwrap().is_some());
        assert!(store.get_by_rs_refresh("ref-dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hydrate_skips_expired_provider_tokens() {
        let store = InMemoryTokenStore::new();
        let live = RsRecord::new("acc-1".to_string(), "ref-1".to_string(), provider(None));
        let dead = RsRecord::new(
            "acc-2".to_string(),
            "ref-2".to_string(),
            provider(Some(now_ms() - 1000)),
        );
        let loaded = store.hydrate(vec![live, dead]).await;
        assert_eq!(loaded, 1);
        assert!(store.get_by_rs_access("acc-1").await.unwrap().is_some());
        assert!(store.get_by_rs_access("acc-2").await.unwrap().is_none());
    }
}
