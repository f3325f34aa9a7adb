//! In-memory key-value backend for tests and single-node deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::KvBackend;

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// HashMap behind an async RwLock. TTLs are honored on read and reclaimed
/// by `purge_expired`.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryBackend::new();
        kv.set("a", json!({"x": 1}), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert!(kv.delete("a").await.unwrap());
        assert!(!kv.delete("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_read() {
        let kv = MemoryBackend::new();
        kv.set("gone", json!(1), Some(Duration::ZERO)).await.unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_skips_expired() {
        let kv = MemoryBackend::new();
        kv.set("job:1", json!(1), None).await.unwrap();
        kv.set("job:2", json!(2), Some(Duration::ZERO)).await.unwrap();
        kv.set("session:1", json!(3), None).await.unwrap();

        let hits = kv.scan_prefix("job:").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "job:1");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let kv = MemoryBackend::new();
        kv.set("keep", json!(1), None).await.unwrap();
        kv.set("drop", json!(2), Some(Duration::ZERO)).await.unwrap();

        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert_eq!(kv.len().await, 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_ttl() {
        let kv = MemoryBackend::new();
        kv.set("k", json!(1), Some(Duration::ZERO)).await.unwrap();
        kv.set("k", json!(2), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(json!(2)));
    }
}
