//! Cache storage.
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache (one per namespace)
//!             └── RequestKey (method + URL) → CacheEntry
//! ```
//!
//! Entries hold fully buffered responses. The store can be capped by a byte
//! quota and persisted to a JSON snapshot so it survives host restarts.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use shellcache_common::{retry_with_backoff, RetryConfig};
use shellcache_net::{strip_fragment, Fetcher, NetError, Request, Response, ResponseType};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys & Entries ====================

/// Identity of a cached request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            url: strip_fragment(&request.url),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: "GET".to_string(),
            url: strip_fragment(url),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request identity.
    pub key: RequestKey,

    /// Final response URL.
    pub response_url: Option<Url>,

    /// Response status.
    pub status: u16,

    /// Response reason phrase.
    pub status_text: String,

    /// Response headers, in order, repeated names allowed. Values are kept as
    /// raw bytes since obs-text is not UTF-8.
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    pub body: Bytes,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Whether the stored response followed a redirect.
    pub redirected: bool,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage.
    pub fn from_response(key: RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        Self {
            key,
            response_url: response.url.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: response.body.clone(),
            response_type: response.response_type,
            redirected: response.redirected,
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_maybe_shared(value.clone()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, key = %self.key, "Dropping unparseable cached header"),
            }
        }

        Response {
            url: self.response_url.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            body: self.body.clone(),
            response_type: self.response_type,
            redirected: self.redirected,
        }
    }

    /// Bytes counted against the quota.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

// ==================== Cache ====================

/// A single named cache.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    #[serde(with = "entry_list")]
    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, returning the one it replaced.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request keys, sorted.
    pub fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total body bytes.
    pub fn size(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

/// Entries are persisted as a list; JSON object keys must be strings.
mod entry_list {
    use super::{CacheEntry, RequestKey};
    use hashbrown::HashMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &HashMap<RequestKey, CacheEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<RequestKey, CacheEntry>, D::Error> {
        let list = Vec::<CacheEntry>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.key.clone(), e)).collect())
    }
}

// ==================== Cache Storage ====================

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    caches: Vec<Cache>,
}

/// Cache storage (the `caches` global), shared by every worker on a host.
///
/// Writes are serialized behind one lock; writes to different keys never
/// conflict and the same key is simply replaced.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
    quota: Option<u64>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage capped at `bytes` of response bodies.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::default()
        }
    }

    /// Open a cache, creating it if absent. Returns whether it was created.
    pub async fn open(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        if caches.contains_key(name) {
            return false;
        }
        debug!(cache = name, "Creating cache");
        caches.insert(name.to_string(), Cache::new(name));
        true
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `key` in the cache `name`.
    pub async fn match_in(&self, name: &str, key: &RequestKey) -> Option<Response> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .map(CacheEntry::to_response)
    }

    /// Request keys stored under `name`.
    pub async fn request_keys(&self, name: &str) -> Option<Vec<RequestKey>> {
        self.caches.read().await.get(name).map(Cache::keys)
    }

    /// Number of entries under `name` (0 when absent).
    pub async fn entry_count(&self, name: &str) -> usize {
        self.caches.read().await.get(name).map_or(0, Cache::len)
    }

    /// Total body bytes across all caches.
    pub async fn usage(&self) -> u64 {
        self.caches.read().await.values().map(Cache::size).sum()
    }

    /// Store one response under `key`, opening the cache if needed.
    pub async fn put(
        &self,
        name: &str,
        key: RequestKey,
        response: &Response,
    ) -> Result<(), ServiceWorkerError> {
        self.put_all(name, vec![CacheEntry::from_response(key, response)])
            .await
    }

    /// Store several entries at once: either all are written or none.
    pub async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;

        if let Some(quota) = self.quota {
            let used: u64 = caches.values().map(Cache::size).sum();
            let existing = caches.get(name);
            let replaced: u64 = entries
                .iter()
                .filter_map(|e| existing.and_then(|c| c.match_request(&e.key)))
                .map(CacheEntry::size)
                .sum();
            let needed: u64 = entries.iter().map(CacheEntry::size).sum();
            let available = quota.saturating_sub(used.saturating_sub(replaced));
            if needed > available {
                return Err(ServiceWorkerError::QuotaExceeded { needed, available });
            }
        }

        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    /// Delete one entry.
    pub async fn delete_entry(&self, name: &str, key: &RequestKey) -> bool {
        self.caches
            .write()
            .await
            .get_mut(name)
            .is_some_and(|cache| cache.delete(key))
    }

    /// Fetch every request and store the responses under `name`.
    ///
    /// All requests are fetched before anything is written; a network error or
    /// a non-2xx status on any of them fails the whole batch and leaves the
    /// cache untouched. Each fetch is retried per `retry` on network errors.
    pub async fn add_all(
        &self,
        name: &str,
        fetcher: &dyn Fetcher,
        requests: Vec<Request>,
        retry: &RetryConfig,
    ) -> Result<usize, ServiceWorkerError> {
        let mut entries = Vec::with_capacity(requests.len());

        for request in &requests {
            let response = retry_with_backoff(
                retry,
                |e: &NetError| !matches!(e, NetError::BadStatus { .. }),
                || async {
                    let response = fetcher.fetch(request).await?;
                    if !response.ok() {
                        return Err(NetError::BadStatus {
                            url: request.url.to_string(),
                            status: response.status,
                        });
                    }
                    Ok::<_, NetError>(response)
                },
            )
            .await
            .map_err(|source| ServiceWorkerError::Precache {
                url: request.url.to_string(),
                source,
            })?;

            debug!(url = %request.url, status = response.status, "Fetched for cache");
            entries.push(CacheEntry::from_response(
                RequestKey::for_request(request),
                &response,
            ));
        }

        let count = entries.len();
        self.put_all(name, entries).await?;
        Ok(count)
    }

    /// Write every cache to a JSON snapshot.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let snapshot = {
            let caches = self.caches.read().await;
            let mut caches: Vec<Cache> = caches.values().cloned().collect();
            caches.sort_by(|a, b| a.name.cmp(&b.name));
            Snapshot { caches }
        };

        let json = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), caches = snapshot.caches.len(), "Cache snapshot saved");
        Ok(())
    }

    /// Load a snapshot written by [`CacheStorage::save_snapshot`].
    ///
    /// A missing file yields empty storage.
    pub async fn load_snapshot(path: &Path, quota: Option<u64>) -> Result<Self, ServiceWorkerError> {
        let caches = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                snapshot
                    .caches
                    .into_iter()
                    .map(|cache| (cache.name.clone(), cache))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot yet");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), caches = caches.len(), "Cache snapshot loaded");
        Ok(Self {
            caches: RwLock::new(caches),
            quota,
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;
    use shellcache_net::MemoryFetcher;

    fn url(path: &str) -> Url {
        Url::parse("https://calc.example/").unwrap().join(path).unwrap()
    }

    fn html(body: &'static str) -> Response {
        Response::new(200, body).with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html"))
    }

    #[test]
    fn test_request_key_drops_fragment() {
        let key = RequestKey::get(&url("/index.html#result"));
        assert_eq!(key.url, "https://calc.example/index.html");
        assert_eq!(key.to_string(), "GET https://calc.example/index.html");
        assert_eq!(key, RequestKey::for_request(&Request::get(url("/index.html"))));
    }

    #[test]
    fn test_entry_round_trips_response() {
        let response = html("<p>hi</p>")
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        let entry = CacheEntry::from_response(RequestKey::get(&url("/")), &response);
        assert_eq!(entry.to_response(), response);
        assert_eq!(entry.size(), 9);
    }

    #[tokio::test]
    async fn test_non_utf8_header_survives_hit_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let disposition = HeaderValue::from_bytes(b"attachment; filename=\"\xe9.txt\"").unwrap();
        let response = html("csv").with_header(header::CONTENT_DISPOSITION, disposition.clone());
        let key = RequestKey::get(&url("/export"));

        let storage = CacheStorage::new();
        storage.put("calc-v1.0.0", key.clone(), &response).await.unwrap();
        let hit = storage.match_in("calc-v1.0.0", &key).await.unwrap();
        assert_eq!(hit, response);
        assert_eq!(hit.headers.get(header::CONTENT_DISPOSITION), Some(&disposition));

        storage.save_snapshot(&path).await.unwrap();
        let restored = CacheStorage::load_snapshot(&path, None).await.unwrap();
        assert_eq!(restored.match_in("calc-v1.0.0", &key).await, Some(response));
    }

    #[test]
    fn test_cache_put_and_delete() {
        let mut cache = Cache::new("calc-v1.0.0");
        let key = RequestKey::get(&url("/style.css"));
        cache.put(CacheEntry::from_response(key.clone(), &html("a")));

        assert!(cache.match_request(&key).is_some());
        assert!(cache
            .match_request(&RequestKey::get(&url("/other.css")))
            .is_none());
        assert!(cache.delete(&key));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_storage_open_has_delete() {
        let storage = CacheStorage::new();
        assert!(!storage.has("v1").await);

        assert!(storage.open("v1").await);
        assert!(!storage.open("v1").await);
        assert!(storage.has("v1").await);

        assert!(storage.delete("v1").await);
        assert!(!storage.has("v1").await);
        assert!(!storage.delete("v1").await);
    }

    #[tokio::test]
    async fn test_put_replaces_same_key() {
        let storage = CacheStorage::new();
        let key = RequestKey::get(&url("/app.js"));
        storage.put("v1", key.clone(), &html("old")).await.unwrap();
        storage.put("v1", key.clone(), &html("new")).await.unwrap();

        assert_eq!(storage.entry_count("v1").await, 1);
        let hit = storage.match_in("v1", &key).await.unwrap();
        assert_eq!(hit.text().unwrap(), "new");
        assert!(storage.match_in("v2", &key).await.is_none());
    }

    #[tokio::test]
    async fn test_quota_rejects_oversized_put() {
        let storage = CacheStorage::with_quota(8);
        storage
            .put("v1", RequestKey::get(&url("/a")), &html("12345"))
            .await
            .unwrap();

        let err = storage
            .put("v1", RequestKey::get(&url("/b")), &html("12345"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceWorkerError::QuotaExceeded { needed: 5, available: 3 }
        ));

        // Replacing an entry only counts the difference.
        storage
            .put("v1", RequestKey::get(&url("/a")), &html("1234567"))
            .await
            .unwrap();
        assert_eq!(storage.usage().await, 7);
    }

    #[tokio::test]
    async fn test_add_all_is_atomic() {
        let fetcher = MemoryFetcher::new(&url("/"));
        fetcher.route(&url("/index.html"), html("<html>"));
        fetcher.fail(&url("/manifest.json"));

        let storage = CacheStorage::new();
        storage.open("v1").await;
        let requests = vec![
            Request::get(url("/index.html")),
            Request::get(url("/manifest.json")),
        ];

        let err = storage
            .add_all("v1", &fetcher, requests, &RetryConfig::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Precache { .. }));
        assert_eq!(storage.entry_count("v1").await, 0);
    }

    #[tokio::test]
    async fn test_add_all_rejects_error_status() {
        let fetcher = MemoryFetcher::new(&url("/"));
        // Unrouted URLs answer 404.
        let storage = CacheStorage::new();
        let err = storage
            .add_all("v1", &fetcher, vec![Request::get(url("/gone"))], &RetryConfig::none())
            .await
            .unwrap_err();

        match err {
            ServiceWorkerError::Precache { source, .. } => {
                assert!(matches!(source, NetError::BadStatus { status: 404, .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches").join("snapshot.json");

        let storage = CacheStorage::new();
        let key = RequestKey::get(&url("/index.html"));
        storage.put("calc-v1.0.0", key.clone(), &html("<html>")).await.unwrap();
        storage.open("calc-v0.9.0").await;
        storage.save_snapshot(&path).await.unwrap();

        let restored = CacheStorage::load_snapshot(&path, None).await.unwrap();
        assert_eq!(restored.keys().await, vec!["calc-v0.9.0", "calc-v1.0.0"]);
        assert_eq!(
            restored.match_in("calc-v1.0.0", &key).await,
            storage.match_in("calc-v1.0.0", &key).await
        );
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load_snapshot(&dir.path().join("none.json"), None)
            .await
            .unwrap();
        assert!(storage.keys().await.is_empty());
    }
}
