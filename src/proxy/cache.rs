use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// How often the background sweeper scans for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A cached downstream response. Headers and body are owned copies.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Entry {
    response: CachedResponse,
    expiry: Instant,
}

/// In-memory response cache with per-entry TTL and a background sweeper.
///
/// Readers never observe torn entries; `set` is last-writer-wins and
/// `clear` atomically replaces the map. An entry is a miss once
/// `now > expiry`; `get` deletes expired entries lazily, the sweeper
/// removes the rest.
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    default_ttl: Duration,
    shutdown: watch::Sender<bool>,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        let entries: Arc<RwLock<HashMap<String, Entry>>> = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown, mut rx) = watch::channel(false);

        let sweep_entries = entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let mut entries = sweep_entries.write().await;
                        let before = entries.len();
                        entries.retain(|_, entry| now <= entry.expiry);
                        let removed = before - entries.len();
                        if removed > 0 {
                            debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        });

        Self { entries, default_ttl, shutdown }
    }

    /// Fetch a cached response, treating anything past its expiry as a miss.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if Instant::now() <= entry.expiry => {
                    return Some(entry.response.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: delete lazily under the write lock, re-checking in case a
        // writer replaced the entry in between.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() <= entry.expiry {
                return Some(entry.response.clone());
            }
            entries.remove(key);
        }
        None
    }

    /// Store a response. A zero `ttl` falls back to the default TTL.
    pub async fn set(&self, key: String, response: CachedResponse, ttl: Duration) {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let entry = Entry { response, expiry: Instant::now() + ttl };

        let mut entries = self.entries.write().await;
        entries.insert(key, entry);
    }

    pub async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Drop every entry by swapping in a fresh map.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        *entries = HashMap::new();
    }

    /// Stop the background sweeper.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn response(body: &str) -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        CachedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn get_returns_stored_value_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let stored = response("A");
        cache.set("k".to_string(), stored.clone(), Duration::from_secs(5)).await;

        let fetched = cache.get("k").await.unwrap();
        assert_eq!(fetched, stored);
        cache.close();
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("k".to_string(), response("A"), Duration::from_millis(30)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("k").await.is_none());

        // The expired entry was lazily deleted.
        assert!(cache.is_empty().await);
        cache.close();
    }

    #[tokio::test]
    async fn zero_ttl_uses_default() {
        let cache = ResponseCache::new(Duration::from_millis(40));
        cache.set("k".to_string(), response("A"), Duration::ZERO).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.is_none());
        cache.close();
    }

    #[tokio::test]
    async fn set_delete_get_is_a_miss() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("k".to_string(), response("A"), Duration::from_secs(5)).await;
        cache.delete("k").await;
        assert!(cache.get("k").await.is_none());
        cache.close();
    }

    #[tokio::test]
    async fn set_is_last_writer_wins() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("k".to_string(), response("old"), Duration::from_secs(5)).await;
        cache.set("k".to_string(), response("new"), Duration::from_secs(5)).await;

        assert_eq!(cache.get("k").await.unwrap().body, Bytes::from_static(b"new"));
        cache.close();
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("a".to_string(), response("A"), Duration::from_secs(5)).await;
        cache.set("b".to_string(), response("B"), Duration::from_secs(5)).await;
        assert_eq!(cache.len().await, 2);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert!(cache.get("a").await.is_none());
        cache.close();
    }
}
