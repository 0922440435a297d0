use regex::Regex;
use std::sync::OnceLock;

const MAX_URL_LEN: usize = 2000;
const MAX_TITLE_LEN: usize = 500;
const MAX_PREVIEW_LEN: usize = 1000;
const MAX_DOMAIN_LEN: usize = 100;

const DANGEROUS_SCHEMES: [&str; 4] = ["javascript:", "data:", "vbscript:", "file:"];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SanitizeError {
    #[error("URL must be a non-empty string")]
    Empty,
    #[error("URL too long (max {MAX_URL_LEN} characters)")]
    TooLong,
    #[error("dangerous scheme detected: {0}")]
    DangerousScheme(String),
    #[error("only http and https schemes are allowed")]
    SchemeNotAllowed,
    #[error("URL must have a valid host")]
    MissingHost,
    #[error("local or private host not allowed: {0}")]
    ForbiddenHost(String),
}

/// Validate and normalize a citation URL. Scheme must be http/https, the
/// host must not be a loopback/private/link-local/reserved target, and the
/// whole URL is length-capped.
pub fn sanitize_url(url: &str) -> Result<String, SanitizeError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(SanitizeError::Empty);
    }
    if url.len() > MAX_URL_LEN {
        return Err(SanitizeError::TooLong);
    }

    let lower = url.to_ascii_lowercase();
    for scheme in DANGEROUS_SCHEMES {
        if lower.starts_with(scheme) {
            return Err(SanitizeError::DangerousScheme(
                scheme.trim_end_matches(':').to_string(),
            ));
        }
    }
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(SanitizeError::SchemeNotAllowed);
    }

    let host = parse_host(url).ok_or(SanitizeError::MissingHost)?;
    if crate::is_forbidden_host(host) {
        return Err(SanitizeError::ForbiddenHost(host.to_string()));
    }

    Ok(url.to_string())
}

/// Host portion of an http(s) URL: authority minus userinfo and port.
/// Returns the bracketed form for IPv6 literals.
pub(crate) fn parse_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .or_else(|| {
            // Schemes are case-insensitive.
            let lower = url.get(..8)?.to_ascii_lowercase();
            if lower.starts_with("https://") {
                url.get(8..)
            } else if lower.starts_with("http://") {
                url.get(7..)
            } else {
                None
            }
        })?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.starts_with('[') {
        // IPv6 literal, keep the brackets and drop any trailing port.
        let end = authority.find(']')?;
        return Some(&authority[..=end]);
    }
    Some(authority.split(':').next().unwrap_or(authority))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag regex"))
}

fn protocol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(javascript|vbscript|data):").expect("protocol regex"))
}

/// Strip markup and cap a citation title. Empty titles become "Untitled".
pub fn sanitize_title(title: &str) -> String {
    let stripped = tag_regex().replace_all(title, "");
    let stripped = protocol_regex().replace_all(&stripped, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return "Untitled".to_string();
    }
    ellipsize(trimmed, MAX_TITLE_LEN)
}

pub fn sanitize_preview(preview: &str) -> String {
    let stripped = tag_regex().replace_all(preview, "");
    let stripped = protocol_regex().replace_all(&stripped, "");
    ellipsize(stripped.trim(), MAX_PREVIEW_LEN)
}

pub fn sanitize_domain(domain: &str) -> String {
    let stripped = tag_regex().replace_all(domain, "");
    ellipsize(stripped.trim(), MAX_DOMAIN_LEN)
}

fn ellipsize(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let cut = text.floor_char_boundary(max.saturating_sub(3));
    format!("{}...", &text[..cut])
}
