//! Time-bounded cache in front of a [`SessionStore`].
//!
//! Relays resolve a session on every connection; the cache keeps that off
//! the registry's hot path. Negative results are cached as well, so a
//! guessed or revoked token costs one registry lookup per TTL window.
//! Ids that are not shaped like a generated token are answered without a
//! lookup and never cached, and the entry count is capped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{is_well_formed_id, JobRank, SessionStore, SessionType};

const DEFAULT_MAX_ENTRIES: usize = 10_000;

struct CacheEntry {
    value: Option<JobRank>,
    expires_at: Instant,
}

/// Cloneable; all clones share the same entries.
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    max_entries: usize,
    entries: Arc<Mutex<HashMap<(String, SessionType), CacheEntry>>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self::with_capacity(store, ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(store: Arc<dyn SessionStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            ttl,
            max_entries: max_entries.max(1),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The store behind this cache, for session creation.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Resolve `session_id` to the job replica it grants access to.
    ///
    /// Never fails: registry errors are logged and reported as `None`
    /// (without being cached).
    pub async fn resolve(&self, session_id: &str, expected: SessionType) -> Option<JobRank> {
        if !is_well_formed_id(session_id) {
            return None;
        }
        let key = (session_id.to_string(), expected);
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&key) {
                if entry.expires_at > Instant::now() {
                    return entry.value.clone();
                }
            }
        }

        let value = match self.store.find(session_id, expected).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Session lookup failed for {expected} session: {e}");
                return None;
            }
        };

        debug!(
            "Caching {expected} session lookup (found={})",
            value.is_some()
        );
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        value
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{Error, Result};
    use crate::sessions::{generate_session_id, MemoryStore};

    /// Counts lookups that reach the store.
    struct CountingStore {
        inner: MemoryStore,
        finds: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        async fn create(&self, job_id: &str, rank: u32, t: SessionType) -> Result<String> {
            self.inner.create(job_id, rank, t).await
        }

        async fn find(&self, id: &str, t: SessionType) -> Result<Option<JobRank>> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Io(std::io::Error::other("disk gone")));
            }
            self.inner.find(id, t).await
        }
    }

    fn counting(fail: bool) -> Arc<CountingStore> {
        Arc::new(CountingStore {
            inner: MemoryStore::new(),
            finds: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_hits_do_not_reach_store() {
        let store = counting(false);
        let id = store.create("job-1", 0, SessionType::Vnc).await.unwrap();
        let cache = SessionCache::new(store.clone(), Duration::from_secs(60));

        for _ in 0..5 {
            let hit = cache.resolve(&id, SessionType::Vnc).await.unwrap();
            assert_eq!(hit.job_id, "job-1");
        }
        assert_eq!(store.finds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached() {
        let store = counting(false);
        let cache = SessionCache::new(store.clone(), Duration::from_secs(60));

        let missing = generate_session_id();
        assert!(cache.resolve(&missing, SessionType::Web).await.is_none());
        assert!(cache.resolve(&missing, SessionType::Web).await.is_none());
        assert_eq!(store.finds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched_and_purged() {
        let store = counting(false);
        let id = store.create("job-1", 0, SessionType::Shell).await.unwrap();
        let cache = SessionCache::new(store.clone(), Duration::from_millis(20));

        assert!(cache.resolve(&id, SessionType::Shell).await.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);

        assert!(cache.resolve(&id, SessionType::Shell).await.is_some());
        assert_eq!(store.finds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_errors_are_not_cached() {
        let store = counting(true);
        let cache = SessionCache::new(store.clone(), Duration::from_secs(60));

        let any = generate_session_id();
        assert!(cache.resolve(&any, SessionType::Vnc).await.is_none());
        assert!(cache.resolve(&any, SessionType::Vnc).await.is_none());
        assert_eq!(store.finds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_ids_skip_store_and_cache() {
        let store = counting(false);
        let cache = SessionCache::new(store.clone(), Duration::from_secs(60));

        for i in 0..100 {
            let bogus = format!("bogus{i}");
            assert!(cache.resolve(&bogus, SessionType::Web).await.is_none());
        }
        assert_eq!(store.finds.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_entry_count_is_capped() {
        let store = counting(false);
        let id = store.create("job-1", 0, SessionType::Web).await.unwrap();
        let cache = SessionCache::with_capacity(store.clone(), Duration::from_secs(60), 8);

        assert!(cache.resolve(&id, SessionType::Web).await.is_some());
        for _ in 0..50 {
            assert!(cache
                .resolve(&generate_session_id(), SessionType::Web)
                .await
                .is_none());
        }
        assert_eq!(cache.len().await, 8);
        assert!(cache.resolve(&id, SessionType::Web).await.is_some());
        assert_eq!(cache.len().await, 8);
    }
}
