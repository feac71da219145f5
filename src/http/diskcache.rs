//! Persistent cache tier: one JSON file per entry.

use crate::base::events::lock;
use crate::http::httpcache::{sanitize_key, CacheEntry};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use url::Url;

/// On-disk shape of a [`CacheEntry`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    url: Option<String>,
    status: u16,
    headers: BTreeMap<String, String>,
    /// Base64 body
    body: String,
    etag: Option<String>,
    /// Unix timestamp, milliseconds
    stored_at: i64,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            url: entry.url.clone(),
            status: entry.status,
            headers: entry.headers.clone(),
            body: STANDARD.encode(&entry.body),
            etag: entry.etag.clone(),
            stored_at: (entry.stored_at.unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }

    fn into_entry(self) -> Option<CacheEntry> {
        let body = STANDARD.decode(self.body).ok()?;
        let stored_at =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.stored_at) * 1_000_000)
                .ok()?;
        Some(CacheEntry {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(body),
            etag: self.etag,
            stored_at,
            url: self.url,
        })
    }
}

/// Files are only written or removed while holding `clears`, whose value
/// counts the clears so far. A background write scheduled before a clear is
/// dropped instead of landing after it.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    clears: Arc<Mutex<u64>>,
}

impl DiskCache {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            clears: Arc::new(Mutex::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(sanitize_key(key))
    }

    /// Read an entry. Missing or corrupt files read as a miss.
    pub fn load(&self, key: &str) -> Option<CacheEntry> {
        Self::read_file(&self.path_for(key))
    }

    fn read_file(path: &Path) -> Option<CacheEntry> {
        let raw = fs::read(path).ok()?;
        match serde_json::from_slice::<StoredEntry>(&raw) {
            Ok(stored) => stored.into_entry(),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "unreadable cache file");
                None
            }
        }
    }

    /// Write an entry atomically (temp file, then rename).
    pub fn store(&self, key: &str, entry: &CacheEntry) -> io::Result<()> {
        let _clears = lock(&self.clears);
        self.write_file(key, entry)
    }

    fn write_file(&self, key: &str, entry: &CacheEntry) -> io::Result<()> {
        let path = self.path_for(key);
        // one temp file per write
        let tmp = self.dir.join(format!(
            "{}.{}.tmp",
            sanitize_key(key),
            uuid::Uuid::new_v4().simple()
        ));
        let json = serde_json::to_vec(&StoredEntry::from_entry(entry))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            e
        })
    }

    /// Write off the calling thread. Failures are logged only. The write is
    /// skipped if the cache is cleared before it runs.
    pub fn store_in_background(&self, key: String, entry: CacheEntry) {
        let disk = self.clone();
        let scheduled_after = *lock(&self.clears);
        let write = move || {
            let clears = lock(&disk.clears);
            if *clears != scheduled_after {
                tracing::debug!(key = %key, "cache cleared before persist, write dropped");
                return;
            }
            if let Err(e) = disk.write_file(&key, &entry) {
                tracing::warn!(key = %key, error = %e, "cache persist failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    pub fn remove(&self, key: &str) {
        let _clears = lock(&self.clears);
        let _ = fs::remove_file(self.path_for(key));
    }

    /// Remove every entry file.
    pub fn clear(&self) {
        self.remove_where(|_| true);
    }

    /// Remove entries whose URL host is `domain` or a subdomain of it.
    pub fn clear_domain(&self, domain: &str) {
        let domain = domain.trim_start_matches('.').to_lowercase();
        let suffix = format!(".{}", domain);
        self.remove_where(|path| {
            Self::read_file(path)
                .and_then(|entry| entry.url)
                .and_then(|url| Url::parse(&url).ok())
                .and_then(|url| url.host_str().map(str::to_lowercase))
                .map_or(false, |host| host == domain || host.ends_with(&suffix))
        });
    }

    fn remove_where(&self, mut predicate: impl FnMut(&Path) -> bool) {
        let mut clears = lock(&self.clears);
        *clears += 1;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cache dir unreadable");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && predicate(&path) {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "cache file not removed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: BTreeMap::from([("etag".to_string(), "\"abc\"".to_string())]),
            body: Bytes::from_static(b"\x00\x01binary"),
            etag: Some("\"abc\"".to_string()),
            stored_at: OffsetDateTime::now_utc(),
            url: Some(url.to_string()),
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).unwrap();
        let original = entry("https://example.com/a");

        disk.store("key1", &original).unwrap();
        let loaded = disk.load("key1").unwrap();
        assert_eq!(loaded.body, original.body);
        assert_eq!(loaded.etag, original.etag);
        assert_eq!(
            loaded.stored_at.unix_timestamp(),
            original.stored_at.unix_timestamp()
        );
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).unwrap();
        fs::write(dir.path().join("broken"), b"{not json").unwrap();
        assert!(disk.load("broken").is_none());
    }

    #[test]
    fn test_clear_domain_matches_host() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).unwrap();
        disk.store("a", &entry("https://example.com/x")).unwrap();
        disk.store("b", &entry("https://api.example.com/y")).unwrap();
        disk.store("c", &entry("https://other.org/z")).unwrap();

        disk.clear_domain("example.com");
        assert!(disk.load("a").is_none());
        assert!(disk.load("b").is_none());
        assert!(disk.load("c").is_some());

        disk.clear();
        assert!(disk.load("c").is_none());
    }

    #[tokio::test]
    async fn test_clear_wins_over_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).unwrap();

        disk.store_in_background("k".to_string(), entry("https://example.com/k"));
        disk.clear();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(disk.load("k").is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_repeated_writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskCache::new(dir.path()).unwrap();
        disk.store("k", &entry("https://example.com/1")).unwrap();
        disk.store("k", &entry("https://example.com/2")).unwrap();

        assert_eq!(
            disk.load("k").unwrap().url.as_deref(),
            Some("https://example.com/2")
        );
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
