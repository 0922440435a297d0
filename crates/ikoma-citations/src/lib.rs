use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::OnceLock;

mod sanitize;

pub use sanitize::{SanitizeError, sanitize_domain, sanitize_preview, sanitize_title, sanitize_url};

/// Sentinel values substituted when citation metadata fails sanitization.
pub const INVALID_URL: &str = "https://example.com/invalid";
pub const INVALID_TITLE: &str = "Invalid Citation";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[(\d+)\]\]").expect("marker regex"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationSource {
    pub id: u32,
    pub url: String,
    pub title: String,
    pub timestamp: String,
    pub domain: String,
    pub confidence_score: f64,
    pub content_preview: String,
    pub source_type: String,
}

/// Serialized registry state, persisted with the run so citation ids
/// survive turns and restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationState {
    pub citations: Vec<CitationSource>,
    pub counter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStyle {
    /// Unicode superscript digits, e.g. `¹²`.
    Superscript,
    /// `[n]` for terminals without superscript glyph support.
    Bracketed,
}

/// Per-run citation registry. Ids are handed out from a monotonic counter
/// starting at 1 and are never reused within a run.
#[derive(Debug)]
pub struct CitationRegistry {
    sources: BTreeMap<u32, CitationSource>,
    counter: u32,
    style: MarkerStyle,
}

impl Default for CitationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            counter: 1,
            style: MarkerStyle::Superscript,
        }
    }

    pub fn with_style(style: MarkerStyle) -> Self {
        Self {
            style,
            ..Self::new()
        }
    }

    /// Register a source and return its id. Never fails: metadata that does
    /// not survive sanitization is replaced with explicit sentinel values
    /// and a warning goes to stderr.
    pub fn add_citation(
        &mut self,
        url: &str,
        title: &str,
        content_preview: &str,
        source_type: &str,
        domain: &str,
        confidence_score: f64,
    ) -> u32 {
        let citation = match sanitize_url(url) {
            Ok(clean_url) => {
                let domain = if domain.trim().is_empty() {
                    host_of(&clean_url).unwrap_or_else(|| "unknown".to_string())
                } else {
                    sanitize_domain(domain)
                };
                let confidence = if (0.0..=1.0).contains(&confidence_score) {
                    confidence_score
                } else {
                    0.5
                };
                CitationSource {
                    id: self.counter,
                    url: clean_url,
                    title: sanitize_title(title),
                    timestamp: Utc::now().to_rfc3339(),
                    domain,
                    confidence_score: confidence,
                    content_preview: sanitize_preview(content_preview),
                    source_type: sanitize_domain(source_type),
                }
            }
            Err(e) => {
                eprintln!("[ikoma WARN] citation validation failed: {e}");
                CitationSource {
                    id: self.counter,
                    url: INVALID_URL.to_string(),
                    title: INVALID_TITLE.to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                    domain: "unknown".to_string(),
                    confidence_score: 0.0,
                    content_preview: String::new(),
                    source_type: "unknown".to_string(),
                }
            }
        };
        let id = citation.id;
        self.sources.insert(id, citation);
        self.counter += 1;
        id
    }

    pub fn get(&self, id: u32) -> Option<&CitationSource> {
        self.sources.get(&id)
    }

    pub fn all(&self) -> Vec<&CitationSource> {
        self.sources.values().collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Replace every `[[n]]` marker with its display form and return the
    /// referenced ids in order of appearance.
    pub fn parse(&self, text: &str) -> (String, Vec<u32>) {
        let mut ids = Vec::new();
        let clean = marker_regex()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let id: u32 = caps[1].parse().unwrap_or(0);
                ids.push(id);
                self.display_marker(id)
            })
            .into_owned();
        (clean, ids)
    }

    /// Ids referenced by `[[n]]` markers, without rewriting the text.
    pub fn extract_ids(text: &str) -> Vec<u32> {
        marker_regex()
            .captures_iter(text)
            .filter_map(|caps| caps[1].parse().ok())
            .collect()
    }

    /// Like `parse`, but additionally appends a Sources block listing each
    /// referenced citation's title and URL.
    pub fn render(&self, text: &str) -> String {
        let (clean, ids) = self.parse(text);
        if ids.is_empty() {
            return clean;
        }
        let mut out = clean;
        out.push_str("\n\nSources:\n");
        let mut seen = Vec::new();
        for id in ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            match self.sources.get(&id) {
                Some(source) => {
                    out.push_str(&format!(
                        "  {} {}\n    {}\n",
                        self.display_marker(id),
                        source.title,
                        source.url
                    ));
                }
                None => {
                    out.push_str(&format!("  [{id}] Citation not found\n"));
                }
            }
        }
        out
    }

    fn display_marker(&self, id: u32) -> String {
        match self.style {
            MarkerStyle::Superscript => superscript(id),
            MarkerStyle::Bracketed => format!("[{id}]"),
        }
    }

    pub fn to_state(&self) -> CitationState {
        CitationState {
            citations: self.sources.values().cloned().collect(),
            counter: self.counter,
        }
    }

    pub fn from_state(state: CitationState) -> Self {
        let mut registry = Self::new();
        registry.counter = state.counter.max(1);
        for citation in state.citations {
            registry.sources.insert(citation.id, citation);
        }
        registry
    }
}

/// Number as Unicode superscript digits.
pub fn superscript(n: u32) -> String {
    const DIGITS: [char; 10] = ['⁰', '¹', '²', '³', '⁴', '⁵', '⁶', '⁷', '⁸', '⁹'];
    n.to_string()
        .chars()
        .map(|c| match c.to_digit(10) {
            Some(d) => DIGITS[d as usize],
            None => c,
        })
        .collect()
}

fn host_of(url: &str) -> Option<String> {
    sanitize::parse_host(url).map(|h| h.to_string())
}

/// Predicate shared with the sanitizer: loopback, private, link-local and
/// reserved addresses must never appear in a citation URL.
pub fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || octets[0] >= 240
        || octets[0] == 0
}

fn is_forbidden_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // unique-local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
}

/// True when the host names a local or internal target that must be
/// rejected without any DNS lookup.
pub fn is_forbidden_host(host: &str) -> bool {
    let host = host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase();
    if let Ok(ip) = IpAddr::from_str(&host) {
        return is_forbidden_ip(&ip);
    }
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}
