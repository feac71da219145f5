//! Two-tier response cache.
//!
//! Chromium mapping: net/http/http_cache.h (simplified)
//!
//! - Keys are the lowercase hex SHA-256 of `"{METHOD}-{url}"`.
//! - The memory tier sits behind one mutex so insertion, size accounting and
//!   eviction happen as a single step.
//! - The persistent tier ([`DiskCache`]) is written off the caller's thread;
//!   its failures are logged and never surface to callers.
//! - Reads hand out owned copies, so callers can never mutate stored state.

use crate::base::events::lock;
use crate::http::diskcache::DiskCache;
use crate::http::response::HttpResponse;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use url::Url;

/// Cached response entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Response status code
    pub status: u16,
    /// Response headers, names lowercased
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Bytes,
    /// ETag for conditional requests
    pub etag: Option<String>,
    /// When this entry was cached
    pub stored_at: OffsetDateTime,
    /// URL the entry was fetched from
    pub url: Option<String>,
}

impl CacheEntry {
    pub fn from_response(url: &Url, response: &HttpResponse) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
            body: response.body().clone(),
            etag: response.header("etag").map(str::to_string),
            stored_at: OffsetDateTime::now_utc(),
            url: Some(url.to_string()),
        }
    }

    /// Override the storage timestamp.
    pub fn stored_at(mut self, stored_at: OffsetDateTime) -> Self {
        self.stored_at = stored_at;
        self
    }

    /// An entry older than `max_age` is expired. `None` never expires.
    pub fn is_fresh(&self, max_age: Option<Duration>) -> bool {
        match max_age {
            Some(max_age) => {
                let age = OffsetDateTime::now_utc() - self.stored_at;
                age.whole_milliseconds() <= max_age.as_millis() as i128
            }
            None => true,
        }
    }

    /// Approximate memory footprint used for the size bound.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> HttpResponse {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        HttpResponse::new(status, headers, self.body.clone()).with_cached(true)
    }
}

/// Cache limits and location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_memory_bytes: usize,
    pub max_memory_entries: usize,
    /// Directory for the persistent tier. `None` keeps everything in memory.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50 * 1024 * 1024, // 50MB default
            max_memory_entries: 1000,
            directory: None,
        }
    }
}

#[derive(Default)]
struct MemoryTier {
    entries: HashMap<String, (CacheEntry, u64)>,
    bytes: usize,
    next_seq: u64,
}

impl MemoryTier {
    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.bytes += entry.size();
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some((old, _)) = self.entries.insert(key, (entry, seq)) {
            self.bytes -= old.size();
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some((old, _)) = self.entries.remove(key) {
            self.bytes -= old.size();
        }
    }

    /// Oldest entry by storage time, ties broken by insertion order.
    fn oldest_except(&self, keep: &str) -> Option<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .min_by_key(|(_, (entry, seq))| (entry.stored_at, *seq))
            .map(|(k, _)| k.clone())
    }

    /// Evict oldest-first once a bound is exceeded: size first, then count.
    /// The entry just written is never evicted, so a put is always visible to
    /// the next get.
    fn evict(&mut self, max_bytes: usize, max_entries: usize, keep: &str) {
        if self.bytes > max_bytes {
            let target = max_bytes / 2;
            self.evict_while(keep, |tier| tier.bytes > target);
        }
        if self.entries.len() > max_entries {
            self.evict_while(keep, |tier| tier.entries.len() >= max_entries);
        }
    }

    fn evict_while(&mut self, keep: &str, over: impl Fn(&Self) -> bool) {
        while over(self) {
            match self.oldest_except(keep) {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

/// In-memory cache with an optional persistent tier.
pub struct CacheStore {
    memory: Mutex<MemoryTier>,
    disk: Option<DiskCache>,
    max_bytes: usize,
    max_entries: usize,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::memory_only(CacheConfig::default())
    }
}

impl CacheStore {
    /// Create a store. A directory that cannot be created disables the
    /// persistent tier instead of failing.
    pub fn new(config: CacheConfig) -> Self {
        let disk = config.directory.as_ref().and_then(|dir| match DiskCache::new(dir) {
            Ok(disk) => Some(disk),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "persistent cache disabled");
                None
            }
        });
        Self {
            memory: Mutex::new(MemoryTier::default()),
            disk,
            max_bytes: config.max_memory_bytes,
            max_entries: config.max_memory_entries.max(1),
        }
    }

    pub fn memory_only(config: CacheConfig) -> Self {
        Self::new(CacheConfig {
            directory: None,
            ..config
        })
    }

    /// Cache key for a request.
    pub fn generate_key(method: &str, url: &str) -> String {
        use boring::hash::{hash, MessageDigest};
        use std::fmt::Write;

        let material = format!("{}-{}", method.to_uppercase(), url);
        match hash(MessageDigest::sha256(), material.as_bytes()) {
            Ok(digest) => digest.iter().fold(String::with_capacity(64), |mut out, b| {
                let _ = write!(out, "{:02x}", b);
                out
            }),
            // Digest failure is not expected; fall back to a filesystem-safe key.
            Err(_) => sanitize_key(&material),
        }
    }

    /// Look up `key`, honoring `max_age`. Expired entries are removed from
    /// the tier they were found in.
    pub fn get(&self, key: &str, max_age: Option<Duration>) -> Option<CacheEntry> {
        {
            let mut memory = lock(&self.memory);
            if let Some((entry, _)) = memory.entries.get(key) {
                if entry.is_fresh(max_age) {
                    tracing::debug!(key, "memory cache hit");
                    return Some(entry.clone());
                }
                memory.remove(key);
            }
        }

        let disk = self.disk.as_ref()?;
        let entry = disk.load(key)?;
        if !entry.is_fresh(max_age) {
            disk.remove(key);
            return None;
        }
        tracing::debug!(key, "disk cache hit");
        let mut memory = lock(&self.memory);
        memory.insert(key.to_string(), entry.clone());
        memory.evict(self.max_bytes, self.max_entries, key);
        Some(entry)
    }

    /// Store `entry`. The memory tier is updated before returning; the
    /// persistent write happens in the background.
    pub fn put(&self, key: &str, entry: CacheEntry) {
        {
            let mut memory = lock(&self.memory);
            memory.insert(key.to_string(), entry.clone());
            memory.evict(self.max_bytes, self.max_entries, key);
        }
        if let Some(disk) = &self.disk {
            disk.store_in_background(key.to_string(), entry);
        }
    }

    /// Clear the memory tier and persisted entries. With a domain, only
    /// persisted entries fetched from that domain (or its subdomains) go.
    pub fn clear(&self, domain: Option<&str>) {
        {
            let mut memory = lock(&self.memory);
            memory.entries.clear();
            memory.bytes = 0;
        }
        if let Some(disk) = &self.disk {
            match domain {
                Some(domain) => disk.clear_domain(domain),
                None => disk.clear(),
            }
        }
    }

    /// Number of entries in the memory tier.
    pub fn len(&self) -> usize {
        lock(&self.memory).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes accounted to the memory tier.
    pub fn memory_bytes(&self) -> usize {
        lock(&self.memory).bytes
    }

    pub fn has_persistent_tier(&self) -> bool {
        self.disk.is_some()
    }
}

/// Make a key safe to use as a file name.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | ':' | '?' | '\\' | '*' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &str) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: BTreeMap::new(),
            body: Bytes::from(body.to_string()),
            etag: None,
            stored_at: OffsetDateTime::now_utc(),
            url: Some("https://example.com/".to_string()),
        }
    }

    fn small_store(max_bytes: usize, max_entries: usize) -> CacheStore {
        CacheStore::memory_only(CacheConfig {
            max_memory_bytes: max_bytes,
            max_memory_entries: max_entries,
            directory: None,
        })
    }

    #[test]
    fn test_key_is_sha256_hex() {
        let key = CacheStore::generate_key("GET", "https://example.com/a");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key, CacheStore::generate_key("get", "https://example.com/a"));
        assert_ne!(key, CacheStore::generate_key("POST", "https://example.com/a"));
    }

    #[test]
    fn test_put_then_get_hits() {
        let store = CacheStore::default();
        store.put("k", entry("hello"));
        let hit = store.get("k", None).unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_expired_entry_is_evicted() {
        let store = CacheStore::default();
        let old = entry("stale").stored_at(OffsetDateTime::now_utc() - time::Duration::minutes(10));
        store.put("k", old);

        assert!(store.get("k", Some(Duration::from_secs(60))).is_none());
        assert!(store.is_empty());
        assert!(store.get("k", None).is_none());
    }

    #[test]
    fn test_reads_are_copies() {
        let store = CacheStore::default();
        store.put("k", entry("v"));

        let mut copy = store.get("k", None).unwrap();
        copy.headers.insert("x-mutated".into(), "1".into());
        copy.status = 500;

        let again = store.get("k", None).unwrap();
        assert!(again.headers.is_empty());
        assert_eq!(again.status, 200);
    }

    #[test]
    fn test_size_bound_evicts_to_half_oldest_first() {
        let store = small_store(100, 1000);
        let base = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        for i in 0..5 {
            let e = entry(&"x".repeat(20)).stored_at(base + time::Duration::seconds(i));
            store.put(&format!("k{}", i), e);
        }
        assert_eq!(store.memory_bytes(), 100);

        store.put("k5", entry(&"y".repeat(20)));
        assert!(store.memory_bytes() <= 50);
        assert!(store.get("k0", None).is_none());
        assert!(store.get("k1", None).is_none());
        assert!(store.get("k5", None).is_some());
    }

    #[test]
    fn test_count_bound() {
        let store = small_store(usize::MAX, 3);
        let base = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        for i in 0..4 {
            let e = entry("v").stored_at(base + time::Duration::seconds(i));
            store.put(&format!("k{}", i), e);
        }
        assert!(store.len() < 3);
        assert!(store.get("k3", None).is_some());
        assert!(store.get("k0", None).is_none());
    }

    #[test]
    fn test_both_bounds_hold_after_size_eviction() {
        let store = small_store(100, 3);
        let base = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        store.put("big", entry(&"x".repeat(60)).stored_at(base));
        store.put("a", entry("a").stored_at(base + time::Duration::seconds(1)));
        store.put("b", entry("b").stored_at(base + time::Duration::seconds(2)));

        store.put("new", entry(&"y".repeat(45)));
        assert_eq!(store.memory_bytes(), 47);
        assert!(store.len() <= 3);
        assert!(store.get("big", None).is_none());
        assert!(store.get("a", None).is_some());
        assert!(store.get("new", None).is_some());

        store.put("c", entry("c"));
        assert!(store.len() < 3);
        assert!(store.memory_bytes() <= 100);
        assert!(store.get("c", None).is_some());
    }

    #[test]
    fn test_replacing_key_keeps_accounting() {
        let store = CacheStore::default();
        store.put("k", entry("aaaa"));
        store.put("k", entry("bb"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.memory_bytes(), 2);
    }

    #[test]
    fn test_to_response_marks_cached() {
        let mut e = entry("body");
        e.headers.insert("content-type".into(), "text/plain".into());
        let response = e.to_response();
        assert!(response.is_cached());
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.duration(), Duration::ZERO);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("https://a.com/b?c"), "https---a.com-b-c");
    }
}
