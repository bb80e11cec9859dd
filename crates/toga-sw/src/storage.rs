//! Cache storage: process-wide named partitions of request → response entries.
//!
//! Partitions are shared behind `Arc` and guarded per partition. Each `put` is
//! atomic on its own; there are no multi-key transactions and concurrent writers
//! to the same key are last-write-wins.
//!
//! When opened on a directory every partition is mirrored to
//! `{dir}/{name}.json` and reloaded on the next start.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use toga_net::{Request, Response};
use tracing::{debug, info, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Canonical cache key: method plus the URL without its fragment.
pub fn request_key(method: &Method, url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{} {}", method, url)
}

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order. Values are kept as raw bytes.
    #[serde(with = "headers_base64")]
    pub headers: Vec<(String, Bytes)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn from_response(method: &Method, url: &Url, response: &Response) -> Self {
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
            method: method.to_string(),
            url: url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response flagged as served from cache.
    pub fn to_response(&self, url: &Url) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(n, v);
            }
        }

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response {
            url: url.clone(),
            status,
            headers,
            body: self.body.clone(),
            from_cache: true,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod headers_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        headers: &[(String, Bytes)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), STANDARD.encode(value)))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Bytes)>, D::Error> {
        Vec::<(String, String)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, value)| {
                STANDARD
                    .decode(value)
                    .map(|raw| (name, Bytes::from(raw)))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// On-disk form of a partition.
#[derive(Debug, Serialize, Deserialize)]
struct PartitionFile {
    name: String,
    entries: Vec<(String, CacheEntry)>,
}

// ==================== Cache ====================

/// A single named partition.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
    file: Option<PathBuf>,
    /// Serializes write-then-persist so the file never regresses.
    write_lock: Mutex<()>,
    writes: AtomicU64,
    /// Set once the partition is removed from storage; later writes are dropped.
    deleted: AtomicBool,
}

impl Cache {
    fn new(name: &str, file: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            file,
            write_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    /// A partition that is not part of any storage and never accepts writes.
    fn detached(name: &str) -> Self {
        let cache = Self::new(name, None);
        cache.deleted.store(true, Ordering::SeqCst);
        cache
    }

    /// Partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        self.lookup(&request.method, &request.url).await
    }

    /// Match a GET for `url`.
    pub async fn match_url(&self, url: &Url) -> Option<Response> {
        self.lookup(&Method::GET, url).await
    }

    async fn lookup(&self, method: &Method, url: &Url) -> Option<Response> {
        let key = request_key(method, url);
        let entries = self.entries.read().await;
        let hit = entries.get(&key).map(|entry| entry.to_response(url));
        trace!(partition = %self.name, key = %key, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Store `response` for `request`, replacing any previous entry.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        self.store(&request.method, &request.url, response).await
    }

    /// Store `response` as the GET entry for `url`.
    pub async fn put_url(&self, url: &Url, response: &Response) -> Result<()> {
        self.store(&Method::GET, url, response).await
    }

    async fn store(&self, method: &Method, url: &Url, response: &Response) -> Result<()> {
        let key = request_key(method, url);
        let entry = CacheEntry::from_response(method, url, response);

        let _guard = self.write_lock.lock().await;
        if self.is_deleted() {
            debug!(partition = %self.name, key = %key, "Dropping write to deleted partition");
            return Ok(());
        }
        self.entries.write().await.insert(key.clone(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.persist().await?;

        trace!(partition = %self.name, key = %key, status = %response.status, "Stored entry");
        Ok(())
    }

    /// Delete the GET entry for `url`.
    pub async fn delete(&self, url: &Url) -> Result<bool> {
        let key = request_key(&Method::GET, url);
        let _guard = self.write_lock.lock().await;
        if self.is_deleted() {
            return Ok(false);
        }
        let removed = self.entries.write().await.remove(&key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// All stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the partition has been removed from storage.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Number of successful writes since this partition was opened.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Mirror the partition to disk. Caller holds `write_lock`.
    async fn persist(&self) -> Result<()> {
        let Some(ref path) = self.file else {
            return Ok(());
        };
        if self.is_deleted() {
            return Ok(());
        }

        let entries = self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let file = PartitionFile {
            name: self.name.clone(),
            entries,
        };
        let raw = serde_json::to_vec(&file)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let file: PartitionFile = serde_json::from_slice(&raw)?;
        let cache = Cache::new(&file.name, Some(path.to_path_buf()));
        cache.entries.write().await.extend(file.entries);
        Ok(cache)
    }
}

// ==================== Cache Storage ====================

#[derive(Debug, Default)]
struct StorageInner {
    caches: RwLock<HashMap<String, Arc<Cache>>>,
    /// Deleted partition names. Only written while `caches` is write-locked.
    retired: RwLock<HashSet<String>>,
    dir: Option<PathBuf>,
}

/// Cache storage (the `caches` global). Cloning shares the same partitions.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    inner: Arc<StorageInner>,
}

impl CacheStorage {
    /// Create in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open durable storage rooted at `dir`, loading every partition found there.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut caches = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let cache = Cache::load(&path).await?;
            debug!(partition = %cache.name, path = %path.display(), "Loaded partition");
            caches.insert(cache.name.clone(), Arc::new(cache));
        }

        info!(dir = %dir.display(), partitions = caches.len(), "Cache storage opened");

        Ok(Self {
            inner: Arc::new(StorageInner {
                caches: RwLock::new(caches),
                retired: RwLock::new(HashSet::new()),
                dir: Some(dir),
            }),
        })
    }

    /// Open a partition, creating it if it doesn't exist. A deleted name is
    /// brought back.
    pub async fn open(&self, name: &str) -> Result<Arc<Cache>> {
        if let Some(cache) = self.get(name).await {
            return Ok(cache);
        }

        let mut caches = self.inner.caches.write().await;
        if let Some(cache) = caches.get(name) {
            return Ok(Arc::clone(cache));
        }
        self.inner.retired.write().await.remove(name);
        self.create(&mut caches, name).await
    }

    /// Open a partition for request handling. A name deleted by garbage
    /// collection is not recreated: a detached partition that drops every
    /// write is returned instead.
    pub async fn open_live(&self, name: &str) -> Result<Arc<Cache>> {
        if let Some(cache) = self.get(name).await {
            return Ok(cache);
        }

        let mut caches = self.inner.caches.write().await;
        if let Some(cache) = caches.get(name) {
            return Ok(Arc::clone(cache));
        }
        if self.inner.retired.read().await.contains(name) {
            debug!(partition = %name, "Partition was deleted, not recreating");
            return Ok(Arc::new(Cache::detached(name)));
        }
        self.create(&mut caches, name).await
    }

    /// Allow previously deleted partitions to be recreated by request handling.
    pub async fn revive(&self, names: &[String]) {
        let _caches = self.inner.caches.write().await;
        let mut retired = self.inner.retired.write().await;
        for name in names {
            retired.remove(name);
        }
    }

    /// An existing partition, without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Cache>> {
        self.inner.caches.read().await.get(name).cloned()
    }

    async fn create(
        &self,
        caches: &mut HashMap<String, Arc<Cache>>,
        name: &str,
    ) -> Result<Arc<Cache>> {
        let file = self.partition_path(name)?;
        let cache = Arc::new(Cache::new(name, file));
        {
            let _guard = cache.write_lock.lock().await;
            cache.persist().await?;
        }
        debug!(partition = %name, "Created partition");
        caches.insert(name.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    /// Check if a partition exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.caches.read().await.contains_key(name)
    }

    /// Delete a partition. Deleting a missing partition is a no-op returning `false`.
    ///
    /// Handles to the partition that are still held keep serving reads but
    /// drop writes, so the partition is never written back to disk.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut caches = self.inner.caches.write().await;
            let removed = caches.remove(name);
            if removed.is_some() {
                self.inner.retired.write().await.insert(name.to_string());
            }
            removed
        };
        let Some(cache) = removed else {
            return Ok(false);
        };

        let _guard = cache.write_lock.lock().await;
        cache.deleted.store(true, Ordering::SeqCst);
        if let Some(ref path) = cache.file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(partition = %name, "Deleted partition");
        Ok(true)
    }

    /// All partition names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn partition_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let Some(ref dir) = self.inner.dir else {
            return Ok(None);
        };
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ServiceWorkerError::CacheError(format!(
                "invalid partition name: {name:?}"
            )));
        }
        Ok(Some(dir.join(format!("{name}.json"))))
    }
}
