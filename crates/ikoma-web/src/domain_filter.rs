use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct DomainFilterConfig {
    pub allow_file: PathBuf,
    pub deny_file: PathBuf,
    /// Applied when a domain matches neither list. Deny is the safe default.
    pub default_policy: DefaultPolicy,
    pub reload_interval: Duration,
}

impl Default for DomainFilterConfig {
    fn default() -> Self {
        Self {
            allow_file: PathBuf::from(".allow_domains.txt"),
            deny_file: PathBuf::from(".deny_domains.txt"),
            default_policy: DefaultPolicy::Deny,
            reload_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterStatus {
    pub allow_domains: usize,
    pub allow_wildcards: usize,
    pub deny_domains: usize,
    pub deny_wildcards: usize,
    pub default_policy: DefaultPolicy,
    pub cache_size: usize,
}

#[derive(Debug, Default)]
struct DomainLists {
    allow_exact: HashSet<String>,
    allow_wildcards: HashSet<String>,
    deny_exact: HashSet<String>,
    deny_wildcards: HashSet<String>,
}

#[derive(Debug)]
struct FilterState {
    lists: DomainLists,
    last_reload: Instant,
    decisions: HashMap<String, (bool, String)>,
}

/// Allow/deny list over domains, loaded from newline-delimited files with
/// `#` comments. Deny always wins; `*.suffix` entries match the bare suffix
/// and any subdomain. Files are re-read at most every `reload_interval`.
pub struct DomainFilter {
    cfg: DomainFilterConfig,
    state: Mutex<FilterState>,
}

impl DomainFilter {
    pub fn new(cfg: DomainFilterConfig) -> Self {
        let lists = load_lists(&cfg.allow_file, &cfg.deny_file);
        Self {
            cfg,
            state: Mutex::new(FilterState {
                lists,
                last_reload: Instant::now(),
                decisions: HashMap::new(),
            }),
        }
    }

    /// Decide whether `domain` may be contacted. Matching is
    /// case-insensitive and a leading `www.` on the candidate is ignored.
    pub fn is_allowed(&self, domain: &str) -> (bool, String) {
        if !is_valid_domain(domain) {
            return (false, format!("Invalid domain format: {domain}"));
        }
        let normalized = normalize_domain(domain);

        let mut state = self.state.lock().expect("domain filter lock");
        if state.last_reload.elapsed() > self.cfg.reload_interval {
            state.lists = load_lists(&self.cfg.allow_file, &self.cfg.deny_file);
            state.last_reload = Instant::now();
            state.decisions.clear();
        }
        if let Some(cached) = state.decisions.get(&normalized) {
            return cached.clone();
        }

        let decision = self.decide(&state.lists, &normalized);
        state.decisions.insert(normalized, decision.clone());
        decision
    }

    fn decide(&self, lists: &DomainLists, domain: &str) -> (bool, String) {
        if lists.deny_exact.contains(domain)
            || lists
                .deny_wildcards
                .iter()
                .any(|w| matches_wildcard(domain, w))
        {
            return (false, format!("Domain explicitly denied: {domain}"));
        }
        if lists.allow_exact.contains(domain)
            || lists
                .allow_wildcards
                .iter()
                .any(|w| matches_wildcard(domain, w))
        {
            return (true, format!("Domain explicitly allowed: {domain}"));
        }
        match self.cfg.default_policy {
            DefaultPolicy::Deny => (
                false,
                "Domain not in allow list, default policy: deny".to_string(),
            ),
            DefaultPolicy::Allow => (
                true,
                "Domain not in deny list, default policy: allow".to_string(),
            ),
        }
    }

    pub fn reload(&self) {
        let mut state = self.state.lock().expect("domain filter lock");
        state.lists = load_lists(&self.cfg.allow_file, &self.cfg.deny_file);
        state.last_reload = Instant::now();
        state.decisions.clear();
    }

    pub fn status(&self) -> FilterStatus {
        let state = self.state.lock().expect("domain filter lock");
        FilterStatus {
            allow_domains: state.lists.allow_exact.len(),
            allow_wildcards: state.lists.allow_wildcards.len(),
            deny_domains: state.lists.deny_exact.len(),
            deny_wildcards: state.lists.deny_wildcards.len(),
            default_policy: self.cfg.default_policy,
            cache_size: state.decisions.len(),
        }
    }
}

fn load_lists(allow_file: &Path, deny_file: &Path) -> DomainLists {
    let (allow_exact, allow_wildcards) = parse_domain_file(allow_file);
    let (deny_exact, deny_wildcards) = parse_domain_file(deny_file);
    DomainLists {
        allow_exact,
        allow_wildcards,
        deny_exact,
        deny_wildcards,
    }
}

fn parse_domain_file(path: &Path) -> (HashSet<String>, HashSet<String>) {
    let mut exact = HashSet::new();
    let mut wildcards = HashSet::new();
    let Ok(raw) = std::fs::read_to_string(path) else {
        return (exact, wildcards);
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = line.to_ascii_lowercase();
        if !is_valid_domain(&entry) {
            continue;
        }
        if entry.starts_with("*.") {
            wildcards.insert(entry);
        } else {
            exact.insert(entry);
        }
    }
    (exact, wildcards)
}

fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    domain
        .strip_prefix("www.")
        .map(str::to_string)
        .unwrap_or(domain)
}

/// `*.example.com` matches `example.com` and any subdomain of it.
fn matches_wildcard(domain: &str, wildcard: &str) -> bool {
    let Some(base) = wildcard.strip_prefix("*.") else {
        return false;
    };
    domain == base || domain.ends_with(&format!(".{base}"))
}

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
            .expect("domain regex")
    })
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let candidate = domain.strip_prefix("*.").unwrap_or(domain);
    domain_regex().is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn filter_with(allow: &str, deny: &str, policy: DefaultPolicy) -> (tempfile::TempDir, DomainFilter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let allow_file = dir.path().join("allow.txt");
        let deny_file = dir.path().join("deny.txt");
        std::fs::File::create(&allow_file)
            .and_then(|mut f| f.write_all(allow.as_bytes()))
            .expect("allow file");
        std::fs::File::create(&deny_file)
            .and_then(|mut f| f.write_all(deny.as_bytes()))
            .expect("deny file");
        let filter = DomainFilter::new(DomainFilterConfig {
            allow_file,
            deny_file,
            default_policy: policy,
            reload_interval: Duration::from_secs(300),
        });
        (dir, filter)
    }

    #[test]
    fn deny_wins_over_allow() {
        let (_dir, filter) = filter_with("example.com\n", "example.com\n", DefaultPolicy::Allow);
        let (allowed, reason) = filter.is_allowed("example.com");
        assert!(!allowed);
        assert!(reason.contains("explicitly denied"));
    }

    #[test]
    fn wildcard_matches_suffix_and_subdomains() {
        let (_dir, filter) = filter_with("*.example.com\n", "", DefaultPolicy::Deny);
        assert!(filter.is_allowed("example.com").0);
        assert!(filter.is_allowed("blog.example.com").0);
        assert!(!filter.is_allowed("example.org").0);
    }

    #[test]
    fn matching_is_case_insensitive_and_strips_www() {
        let (_dir, filter) = filter_with("example.com\n", "", DefaultPolicy::Deny);
        assert!(filter.is_allowed("WWW.Example.COM").0);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let (_dir, filter) = filter_with(
            "# comment line\n\nexample.com\n# another\n",
            "",
            DefaultPolicy::Deny,
        );
        assert!(filter.is_allowed("example.com").0);
        let status = filter.status();
        assert_eq!(status.allow_domains, 1);
    }

    #[test]
    fn empty_lists_fall_back_to_the_default_policy() {
        let (_dir, deny_filter) = filter_with("", "", DefaultPolicy::Deny);
        assert!(!deny_filter.is_allowed("example.com").0);

        let (_dir2, allow_filter) = filter_with("", "", DefaultPolicy::Allow);
        assert!(allow_filter.is_allowed("example.com").0);
    }

    #[test]
    fn invalid_domains_are_rejected_outright() {
        let (_dir, filter) = filter_with("", "", DefaultPolicy::Allow);
        let (allowed, reason) = filter.is_allowed("not a domain!");
        assert!(!allowed);
        assert!(reason.contains("Invalid domain format"));
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let (dir, filter) = filter_with("", "", DefaultPolicy::Deny);
        assert!(!filter.is_allowed("example.com").0);
        std::fs::write(dir.path().join("allow.txt"), "example.com\n").expect("rewrite");
        filter.reload();
        assert!(filter.is_allowed("example.com").0);
    }
}
