//! Versioned cache store.
//!
//! A store holds named caches ("generations"); each cache maps a
//! [`CacheKey`] to the [`CacheEntry`] captured when the response was stored.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use harbor_net::{Request, Response, ResponseType};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{now_millis, ServiceWorkerError};

// ==================== Keys ====================

/// Normalized request identity: method plus URL without fragment.
///
/// Only GET requests have a key; nothing else is ever cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET,
            url: url.into(),
        }
    }

    /// Key for a request, or `None` if the request is not a GET.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Response URL.
    pub url: Url,

    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body().clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        Response::new(
            self.url.clone(),
            self.status,
            self.headers.clone(),
            self.body.clone(),
        )
        .with_type(ResponseType::Basic)
    }
}

// ==================== Cache ====================

/// A single cache generation.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous entry for the key.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Store ====================

/// Storage for cache generations.
///
/// Every operation is fallible so that a backing store with real I/O can
/// report failures; callers decide whether a failure is fatal.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// All cache names.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up a key in one cache.
    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store one entry, creating the cache if needed.
    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError>;

    /// Store a batch of entries; either all are stored or none are.
    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError>;
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = name, "Created cache");
                Cache::new(name)
            });
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let existed = self.caches.write().await.remove(name).is_some();
        if existed {
            debug!(cache = name, "Deleted cache");
        }
        Ok(existed)
    }

    async fn match_in(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let entry = caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned();
        trace!(cache = name, key = %key, hit = entry.is_some(), "Cache lookup");
        Ok(entry)
    }

    async fn put(
        &self,
        name: &str,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(key, entry);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(CacheKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        // A single write guard makes the batch atomic for readers.
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for (key, entry) in entries {
            cache.put(key, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &'static str) -> CacheEntry {
        CacheEntry {
            url: Url::parse(url).unwrap(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            cached_at: 0,
        }
    }

    #[test]
    fn test_key_strips_fragment() {
        let a = CacheKey::get(&Url::parse("https://example.com/page#top").unwrap());
        let b = CacheKey::get(&Url::parse("https://example.com/page").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/page");
    }

    #[test]
    fn test_key_only_for_get() {
        let url = Url::parse("https://example.com/api").unwrap();
        assert!(CacheKey::for_request(&Request::get(url.clone())).is_some());
        assert!(CacheKey::for_request(&Request::post(url, Bytes::new())).is_none());
    }

    #[test]
    fn test_cache_put_overwrites() {
        let mut cache = Cache::new("v1");
        let key = CacheKey::get(&Url::parse("https://example.com/a.js").unwrap());

        cache.put(key.clone(), entry("https://example.com/a.js", "one"));
        cache.put(key.clone(), entry("https://example.com/a.js", "two"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.match_request(&key).unwrap().body, "two");
    }

    #[test]
    fn test_entry_round_trips_response() {
        let url = Url::parse("https://example.com/data.json").unwrap();
        let response = Response::new(url, StatusCode::OK, HeaderMap::new(), "{}");
        let stored = CacheEntry::from_response(&response);
        let served = stored.to_response();
        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(served.body(), response.body());
        assert_eq!(served.response_type, ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_storage_open_and_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(storage.keys().await.unwrap().is_empty());
        storage.open("v1").await.unwrap();
        storage.open("v1").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v1".to_string()]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_match_is_scoped_to_generation() {
        let storage = MemoryCacheStorage::new();
        let url = "https://example.com/app.css";
        let key = CacheKey::get(&Url::parse(url).unwrap());

        storage.put("v1", key.clone(), entry(url, "old")).await.unwrap();

        assert!(storage.match_in("v1", &key).await.unwrap().is_some());
        assert!(storage.match_in("v2", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_all_stores_every_entry() {
        let storage = MemoryCacheStorage::new();
        let urls = ["https://example.com/", "https://example.com/offline.html"];
        let batch = urls
            .iter()
            .map(|u| (CacheKey::get(&Url::parse(u).unwrap()), entry(u, "x")))
            .collect();

        storage.put_all("v1", batch).await.unwrap();

        for u in urls {
            let key = CacheKey::get(&Url::parse(u).unwrap());
            assert!(storage.match_in("v1", &key).await.unwrap().is_some());
        }
        assert_eq!(storage.keys().await.unwrap(), vec!["v1".to_string()]);
    }
}
