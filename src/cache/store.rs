//! Key-value store behind the prediction cache.
//!
//! The store is usually external (a key-value service), so every method is
//! async and fallible. [`MemoryStore`] is the in-process implementation.

use crate::error::CacheError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `GET key`; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// `SETEX key ttl value`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// `SCAN` + `DEL` of every key starting with `prefix`. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    /// `SCAN` + `DEL` of every key ending with `suffix`. Returns the number deleted.
    async fn delete_suffix(&self, suffix: &str) -> Result<usize, CacheError>;
}

struct StoredValue {
    bytes: Vec<u8>,
    /// `None` when the TTL is too large to represent
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store with per-entry expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, v| v.is_live(now));
        before - entries.len()
    }

    /// Remove `key` if it is still expired at `now`. A value written after
    /// the caller saw the expired one is kept.
    fn remove_if_expired(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(v) if !v.is_live(now) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    fn delete_where<F: Fn(&str) -> bool>(&self, matches: F) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !matches(k));
        before - entries.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(v) if v.is_live(now) => return Ok(Some(v.bytes.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.remove_if_expired(key, now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let stored = StoredValue {
            bytes: value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.write().insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        Ok(self.delete_where(|k| k.starts_with(prefix)))
    }

    async fn delete_suffix(&self, suffix: &str) -> Result<usize, CacheError> {
        Ok(self.delete_where(|k| k.ends_with(suffix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_expire() {
        let store = MemoryStore::new();
        store
            .set_ex("k", b"v".to_vec(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix_and_suffix() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for key in ["aa:v1", "ab:v1", "aa:v2", "bb:v2"] {
            store.set_ex(key, vec![1], ttl).await.unwrap();
        }

        assert_eq!(store.delete_prefix("aa").await.unwrap(), 2);
        assert_eq!(store.delete_suffix(":v2").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("ab:v1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_removal_keeps_fresh_write() {
        let store = MemoryStore::new();
        store.set_ex("k", b"old".to_vec(), Duration::ZERO).await.unwrap();
        let seen_expired_at = Instant::now();

        // a writer refreshes the key before the reader takes the write lock
        store
            .set_ex("k", b"new".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.remove_if_expired("k", seen_expired_at));
        assert_eq!(store.get("k").await.unwrap(), Some(b"new".to_vec()));

        store.set_ex("k", b"old".to_vec(), Duration::ZERO).await.unwrap();
        assert!(store.remove_if_expired("k", Instant::now()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set_ex("k", vec![7], Duration::MAX).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![7]));
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set_ex("short", vec![1], Duration::ZERO).await.unwrap();
        store
            .set_ex("long", vec![1], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
