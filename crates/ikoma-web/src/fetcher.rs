use crate::cache::ResponseCache;
use crate::domain_filter::{DomainFilter, DomainFilterConfig};
use crate::rate_limit::{DomainStats, DomainStatsSnapshot, RateLimitConfig};
use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_MAX_CONTENT_BYTES: u64 = 5_000_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (compatible; ikoma-bot/1.0)",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Every fetch produces one of these, success or not. Callers branch on
/// `success` and read `error` instead of handling exceptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    pub url: String,
    pub domain: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub timestamp: String,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResponse {
    fn failure(url: &str, domain: &str, method: &str, error: String) -> Self {
        Self {
            success: false,
            url: url.to_string(),
            domain: domain.to_string(),
            method: method.to_string(),
            status_code: None,
            content: None,
            content_length: None,
            headers: None,
            encoding: None,
            timestamp: Utc::now().to_rfc3339(),
            cached: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub rate_limit: RateLimitConfig,
    pub filter: DomainFilterConfig,
    pub cache_dir: PathBuf,
    pub user_agents: Vec<String>,
    pub timeout_secs: u64,
    pub max_content_bytes: u64,
}

impl HttpFetcherConfig {
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            filter: DomainFilterConfig::default(),
            cache_dir,
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetcherStats {
    pub total_domains: usize,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub domains: Vec<DomainStatsSnapshot>,
    pub cache_files: usize,
    pub config: serde_json::Value,
}

struct FetcherState {
    domains: HashMap<String, DomainStats>,
    domain_configs: HashMap<String, RateLimitConfig>,
    ua_index: usize,
}

/// Outbound HTTP with three gates in front of the network: domain
/// filtering, a per-domain token bucket, and a 429/503 backoff window.
/// Successful GETs land in a one-hour disk cache.
///
/// Per-domain state sits behind a single mutex; this is the hot path if
/// the fetcher ever needs finer-grained locking, but the interface would
/// not change.
pub struct HttpFetcher {
    cfg: HttpFetcherConfig,
    client: Client,
    filter: DomainFilter,
    cache: ResponseCache,
    state: Mutex<FetcherState>,
}

impl HttpFetcher {
    pub fn new(cfg: HttpFetcherConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        let filter = DomainFilter::new(cfg.filter.clone());
        let cache = ResponseCache::one_hour(&cfg.cache_dir);
        // Start the rotation at a random offset so parallel processes do
        // not present identical agent sequences.
        let ua_index = if cfg.user_agents.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..cfg.user_agents.len())
        };
        Ok(Self {
            cfg,
            client,
            filter,
            cache,
            state: Mutex::new(FetcherState {
                domains: HashMap::new(),
                domain_configs: HashMap::new(),
                ua_index,
            }),
        })
    }

    pub fn get(
        &self,
        url: &str,
        headers: Option<&BTreeMap<String, String>>,
        use_cache: bool,
    ) -> FetchResponse {
        self.request("GET", url, None, headers, use_cache)
    }

    /// POST responses are never cached.
    pub fn post(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
        headers: Option<&BTreeMap<String, String>>,
    ) -> FetchResponse {
        self.request("POST", url, body, headers, false)
    }

    fn request(
        &self,
        method: &str,
        url: &str,
        body: Option<&serde_json::Value>,
        headers: Option<&BTreeMap<String, String>>,
        use_cache: bool,
    ) -> FetchResponse {
        let domain = extract_domain(url);

        let (allowed, reason) = self.filter.is_allowed(&domain);
        if !allowed {
            return FetchResponse::failure(url, &domain, method, format!("Domain blocked: {reason}"));
        }

        // Backoff window and token bucket, both under the state lock.
        {
            let mut state = self.state.lock().expect("fetcher state lock");
            let config = state
                .domain_configs
                .get(&domain)
                .cloned()
                .unwrap_or_else(|| self.cfg.rate_limit.clone());
            let stats = state
                .domains
                .entry(domain.clone())
                .or_insert_with(|| DomainStats::new(&domain, &config));
            if let Some(remaining) = stats.backoff_remaining() {
                return FetchResponse::failure(
                    url,
                    &domain,
                    method,
                    format!("Backoff: in backoff window for {remaining:.1} more seconds"),
                );
            }
            if !stats.try_consume(&config) {
                return FetchResponse::failure(
                    url,
                    &domain,
                    method,
                    "Rate limited: no tokens available".to_string(),
                );
            }
        }

        if method == "GET"
            && use_cache
            && let Some(mut cached) = self.cache.get(method, url)
        {
            cached.cached = true;
            return cached;
        }

        let mut request = match method {
            "POST" => self.client.post(url),
            _ => self.client.get(url),
        };
        request = request
            .header("User-Agent", self.next_user_agent())
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5");
        if let Some(extra) = headers {
            for (name, value) in extra {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send() {
            Ok(resp) => resp,
            Err(e) => {
                let kind = if e.is_timeout() {
                    format!("Request timeout after {} seconds", self.cfg.timeout_secs)
                } else if e.is_connect() {
                    format!("Connection error: {e}")
                } else {
                    format!("Request error: {e}")
                };
                return FetchResponse::failure(url, &domain, method, kind);
            }
        };

        let status = response.status();
        // Redirects are followed for GET; record where we actually landed.
        let final_url = response.url().to_string();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let backoff_secs = {
                let mut state = self.state.lock().expect("fetcher state lock");
                let config = state
                    .domain_configs
                    .get(&domain)
                    .cloned()
                    .unwrap_or_else(|| self.cfg.rate_limit.clone());
                state
                    .domains
                    .get_mut(&domain)
                    .map(|stats| stats.trigger_backoff(&config))
                    .unwrap_or(0.0)
            };
            let mut failed = FetchResponse::failure(
                &final_url,
                &domain,
                method,
                format!("HTTP {}: backing off for {backoff_secs:.1}s", status.as_u16()),
            );
            failed.status_code = Some(status.as_u16());
            return failed;
        }

        // Refuse oversize bodies before buffering them.
        if let Some(declared) = response.content_length()
            && declared > self.cfg.max_content_bytes
        {
            return FetchResponse::failure(
                &final_url,
                &domain,
                method,
                format!(
                    "Content too large: {declared} bytes > {}",
                    self.cfg.max_content_bytes
                ),
            );
        }

        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let content = match response.text() {
            Ok(text) => text,
            Err(e) => {
                return FetchResponse::failure(
                    &final_url,
                    &domain,
                    method,
                    format!("Request error: {e}"),
                );
            }
        };
        if content.len() as u64 > self.cfg.max_content_bytes {
            return FetchResponse::failure(
                &final_url,
                &domain,
                method,
                format!(
                    "Content too large: {} bytes > {}",
                    content.len(),
                    self.cfg.max_content_bytes
                ),
            );
        }

        {
            let mut state = self.state.lock().expect("fetcher state lock");
            if let Some(stats) = state.domains.get_mut(&domain) {
                stats.reset_backoff();
            }
        }

        let record = FetchResponse {
            success: true,
            url: final_url,
            domain,
            method: method.to_string(),
            status_code: Some(status.as_u16()),
            content_length: Some(content.len() as u64),
            content: Some(content),
            headers: Some(response_headers),
            encoding: Some("utf-8".to_string()),
            timestamp: Utc::now().to_rfc3339(),
            cached: false,
            error: None,
        };

        if method == "GET" && status == StatusCode::OK && use_cache {
            self.cache.put(method, url, &record);
        }

        record
    }

    fn next_user_agent(&self) -> String {
        let mut state = self.state.lock().expect("fetcher state lock");
        if self.cfg.user_agents.is_empty() {
            return DEFAULT_USER_AGENTS[0].to_string();
        }
        let agent = self.cfg.user_agents[state.ua_index % self.cfg.user_agents.len()].clone();
        state.ua_index = (state.ua_index + 1) % self.cfg.user_agents.len();
        agent
    }

    pub fn set_domain_rate_limit(&self, domain: &str, config: RateLimitConfig) {
        let mut state = self.state.lock().expect("fetcher state lock");
        state.domain_configs.insert(domain.to_string(), config);
    }

    pub fn stats(&self) -> FetcherStats {
        let mut state = self.state.lock().expect("fetcher state lock");
        let default_config = self.cfg.rate_limit.clone();
        let configs = state.domain_configs.clone();
        let mut snapshots = Vec::new();
        let mut total_requests = 0;
        let mut rate_limit_hits = 0;
        for (domain, stats) in state.domains.iter_mut() {
            let config = configs.get(domain).unwrap_or(&default_config);
            total_requests += stats.total_requests;
            rate_limit_hits += stats.rate_limit_hits;
            snapshots.push(stats.snapshot(config));
        }
        snapshots.sort_by(|a, b| a.domain.cmp(&b.domain));
        FetcherStats {
            total_domains: snapshots.len(),
            total_requests,
            rate_limit_hits,
            domains: snapshots,
            cache_files: self.cache.file_count(),
            config: json!({
                "requests_per_second": default_config.requests_per_second,
                "bucket_capacity": default_config.bucket_capacity,
                "backoff_base": default_config.backoff_base,
                "backoff_max": default_config.backoff_max,
                "backoff_multiplier": default_config.backoff_multiplier,
                "timeout_secs": self.cfg.timeout_secs,
                "max_content_bytes": self.cfg.max_content_bytes,
                "user_agents": self.cfg.user_agents.len(),
            }),
        }
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock().expect("fetcher state lock");
        state.domains.clear();
    }

    pub fn filter_status(&self) -> crate::domain_filter::FilterStatus {
        self.filter.status()
    }
}

/// Lowercased host of a URL, without port or userinfo.
pub fn extract_domain(url: &str) -> String {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let host = if authority.starts_with('[') {
        authority
            .split(']')
            .next()
            .map(|h| format!("{h}]"))
            .unwrap_or_else(|| authority.to_string())
    } else {
        authority
            .split(':')
            .next()
            .unwrap_or(authority)
            .to_string()
    };
    host.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_filter::DefaultPolicy;

    fn offline_fetcher(policy: DefaultPolicy) -> (tempfile::TempDir, HttpFetcher) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = HttpFetcherConfig::with_cache_dir(dir.path().join("cache"));
        cfg.filter.allow_file = dir.path().join("allow.txt");
        cfg.filter.deny_file = dir.path().join("deny.txt");
        cfg.filter.default_policy = policy;
        let fetcher = HttpFetcher::new(cfg).expect("fetcher");
        (dir, fetcher)
    }

    #[test]
    fn extract_domain_handles_ports_and_case() {
        assert_eq!(extract_domain("https://Example.COM:8443/a/b"), "example.com");
        assert_eq!(extract_domain("http://user@host.net/x"), "host.net");
        assert_eq!(extract_domain("http://[::1]:8080/x"), "[::1]");
    }

    #[test]
    fn blocked_domain_short_circuits_before_any_network_io() {
        let (_dir, fetcher) = offline_fetcher(DefaultPolicy::Deny);
        let response = fetcher.get("http://localhost/x", None, true);
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("Domain blocked"));
        assert_eq!(response.domain, "localhost");
        // Nothing was counted as an outbound request.
        assert_eq!(fetcher.stats().total_requests, 0);
    }

    #[test]
    fn deny_list_blocks_even_with_allow_default() {
        let (dir, _) = offline_fetcher(DefaultPolicy::Allow);
        let mut cfg = HttpFetcherConfig::with_cache_dir(dir.path().join("cache2"));
        cfg.filter.allow_file = dir.path().join("allow.txt");
        cfg.filter.deny_file = dir.path().join("deny.txt");
        cfg.filter.default_policy = DefaultPolicy::Allow;
        std::fs::write(&cfg.filter.deny_file, "evil.example\n").expect("deny file");
        let fetcher = HttpFetcher::new(cfg).expect("fetcher");

        let response = fetcher.get("http://evil.example/payload", None, true);
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("Domain blocked"));
    }

    #[test]
    fn stats_report_configuration() {
        let (_dir, fetcher) = offline_fetcher(DefaultPolicy::Deny);
        let stats = fetcher.stats();
        assert_eq!(stats.total_domains, 0);
        assert_eq!(stats.config["bucket_capacity"], 10.0);
        assert_eq!(stats.config["requests_per_second"], 5.0);
    }

    #[test]
    fn user_agents_rotate() {
        let (_dir, fetcher) = offline_fetcher(DefaultPolicy::Deny);
        let first = fetcher.next_user_agent();
        let second = fetcher.next_user_agent();
        let third = fetcher.next_user_agent();
        let fourth = fetcher.next_user_agent();
        assert_ne!(first, second);
        assert_eq!(first, fourth);
        assert_ne!(second, third);
    }
}
