use crate::fetcher::FetchResponse;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Disk cache of successful GET responses, one JSON file per
/// `(method, url)` hash. Reads go straight to the filesystem; writes are
/// serialized under a lock.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
    write_lock: Mutex<()>,
}

impl ResponseCache {
    pub fn new(dir: &Path, ttl: Duration) -> Self {
        let _ = std::fs::create_dir_all(dir);
        Self {
            dir: dir.to_path_buf(),
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    pub fn one_hour(dir: &Path) -> Self {
        Self::new(dir, Duration::from_secs(3600))
    }

    fn cache_file(&self, method: &str, url: &str) -> PathBuf {
        let digest = Sha256::digest(format!("{method}:{url}").as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }

    /// Cached response if present and within TTL. Expired entries are
    /// unlinked on the way out.
    pub fn get(&self, method: &str, url: &str) -> Option<FetchResponse> {
        let path = self.cache_file(method, url);
        let raw = std::fs::read_to_string(&path).ok()?;
        let cached: FetchResponse = serde_json::from_str(&raw).ok()?;
        let stamped: DateTime<Utc> = cached.timestamp.parse().ok()?;
        let age = Utc::now().signed_duration_since(stamped);
        if age.num_seconds() < 0 || age.to_std().ok()? > self.ttl {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(cached)
    }

    /// Store under the URL that was requested, which can differ from
    /// `response.url` after redirects.
    pub fn put(&self, method: &str, url: &str, response: &FetchResponse) {
        let _guard = self.write_lock.lock().expect("cache write lock");
        let path = self.cache_file(method, url);
        if let Ok(json) = serde_json::to_string_pretty(response) {
            let _ = std::fs::write(path, json);
        }
    }

    pub fn file_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear(&self) -> usize {
        let _guard = self.write_lock.lock().expect("cache write lock");
        let mut removed = 0;
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json")
                    && std::fs::remove_file(&path).is_ok()
                {
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(url: &str) -> FetchResponse {
        FetchResponse {
            success: true,
            url: url.to_string(),
            domain: "example.com".to_string(),
            method: "GET".to_string(),
            status_code: Some(200),
            content: Some("<html>hi</html>".to_string()),
            content_length: Some(15),
            headers: None,
            encoding: Some("utf-8".to_string()),
            timestamp: Utc::now().to_rfc3339(),
            cached: false,
            error: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::one_hour(dir.path());
        let url = "https://example.com/a";
        cache.put("GET", url, &sample_response(url));

        let hit = cache.get("GET", url).expect("cached");
        assert_eq!(hit.content.as_deref(), Some("<html>hi</html>"));
        assert_eq!(cache.file_count(), 1);
        assert!(cache.get("GET", "https://example.com/other").is_none());
        assert!(cache.get("POST", url).is_none());
    }

    #[test]
    fn redirected_responses_are_keyed_by_the_requested_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::one_hour(dir.path());
        let requested = "https://example.com/old";
        let response = sample_response("https://example.com/new-location");
        cache.put("GET", requested, &response);

        let hit = cache.get("GET", requested).expect("cached under request url");
        assert_eq!(hit.url, "https://example.com/new-location");
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path(), Duration::from_secs(1));
        let url = "https://example.com/stale";
        let mut response = sample_response(url);
        response.timestamp = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        cache.put("GET", url, &response);

        assert!(cache.get("GET", url).is_none());
        assert_eq!(cache.file_count(), 0);
    }

    #[test]
    fn clear_removes_every_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::one_hour(dir.path());
        cache.put("GET", "https://example.com/a", &sample_response("https://example.com/a"));
        cache.put("GET", "https://example.com/b", &sample_response("https://example.com/b"));
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.file_count(), 0);
    }
}
