use chrono::Utc;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Content below this many characters scores zero across the board.
const MIN_SCORABLE_CHARS: usize = 50;
/// Primary extraction must produce at least this much text to count.
const MIN_PRIMARY_CHARS: usize = 200;
const MIN_FALLBACK_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall: f64,
    pub readability: f64,
    pub length: f64,
    pub vocabulary: f64,
    pub structure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub extraction_method: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub chunk_count: usize,
    pub content_length: usize,
    pub quality_metrics: QualityMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub url: String,
    pub title: String,
    pub text_chunks: Vec<String>,
    pub quality_score: f64,
    pub readability_score: f64,
    pub metadata: ExtractionMetadata,
    pub timestamp: String,
}

/// HTML to scored, chunked text. Three passes: a precision-biased
/// main-content pass, a recall-biased paragraph sweep, and a last-resort
/// tag strip.
pub fn extract(url: &str, html: &str, chunk_size: usize) -> ExtractedContent {
    let cleaned = strip_noise(html);
    let doc = Html::parse_document(&cleaned);

    let mut extraction_method = "none";
    let mut text = main_content_text(&doc);
    if text.len() >= MIN_PRIMARY_CHARS {
        extraction_method = "main_content";
    } else {
        let recall = paragraph_text(&doc);
        if recall.len() >= MIN_FALLBACK_CHARS {
            text = recall;
            extraction_method = "paragraph_sweep";
        } else {
            let stripped = collapse_whitespace(&doc.root_element().text().collect::<String>());
            if !stripped.is_empty() {
                text = stripped;
                extraction_method = "strip_tags";
            } else {
                text = String::new();
            }
        }
    }

    let title = extract_title(&doc, url);
    let metrics = quality_metrics(&text);
    let chunks = chunk_text(&text, chunk_size);

    ExtractedContent {
        url: url.to_string(),
        title,
        quality_score: metrics.overall,
        readability_score: metrics.readability,
        metadata: ExtractionMetadata {
            extraction_method: extraction_method.to_string(),
            domain: crate::fetcher::extract_domain(url),
            language: None,
            chunk_count: chunks.len(),
            content_length: text.len(),
            quality_metrics: metrics,
        },
        text_chunks: chunks,
        timestamp: Utc::now().to_rfc3339(),
    }
}

fn noise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<nav[^>]*>.*?</nav>|<footer[^>]*>.*?</footer>|<header[^>]*>.*?</header>|<aside[^>]*>.*?</aside>|<!--.*?-->",
        )
        .expect("noise regex")
    })
}

fn strip_noise(html: &str) -> String {
    noise_regex().replace_all(html, " ").into_owned()
}

fn selector(raw: &str) -> Selector {
    Selector::parse(raw).expect("static selector")
}

/// Precision pass: the densest of the usual main-content containers.
fn main_content_text(doc: &Html) -> String {
    let candidates = ["article", "main", "[role=\"main\"]", "#content", ".content"];
    let mut best = String::new();
    for raw in candidates {
        let sel = selector(raw);
        for element in doc.select(&sel) {
            let text = collapse_whitespace(&element.text().collect::<String>());
            if text.len() > best.len() {
                best = text;
            }
        }
    }
    best
}

/// Recall pass: every paragraph and list item on the page.
fn paragraph_text(doc: &Html) -> String {
    let sel = selector("p, li");
    let mut parts = Vec::new();
    for element in doc.select(&sel) {
        let text = collapse_whitespace(&element.text().collect::<String>());
        if !text.is_empty() {
            parts.push(text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

/// Title preference order: Open Graph, `<title>`, first `<h1>`, the URL.
fn extract_title(doc: &Html, url: &str) -> String {
    let og = selector("meta[property=\"og:title\"]");
    if let Some(meta) = doc.select(&og).next()
        && let Some(content) = meta.value().attr("content")
    {
        let title = collapse_whitespace(content);
        if !title.is_empty() {
            return title;
        }
    }
    for raw in ["title", "h1"] {
        let sel = selector(raw);
        if let Some(element) = doc.select(&sel).next() {
            let title = collapse_whitespace(&element.text().collect::<String>());
            if !title.is_empty() {
                return title;
            }
        }
    }
    url.to_string()
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w+\b").expect("word regex"))
}

fn sentence_end_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+").expect("sentence regex"))
}

/// Weighted quality score: readability 30%, length 20%, vocabulary 20%,
/// sentence structure 15%, plus a 15% base.
pub fn quality_metrics(text: &str) -> QualityMetrics {
    if text.trim().len() < MIN_SCORABLE_CHARS {
        return QualityMetrics {
            overall: 0.0,
            readability: 0.0,
            length: 0.0,
            vocabulary: 0.0,
            structure: 0.0,
        };
    }

    let words: Vec<&str> = word_regex().find_iter(text).map(|m| m.as_str()).collect();
    let word_count = words.len() as f64;
    let sentence_count = sentence_end_regex().split(text).count().max(1) as f64;
    let avg_sentence_len = word_count / sentence_count;

    let readability = (1.0 - (avg_sentence_len - 15.0).abs() / 20.0).clamp(0.0, 1.0);

    // Optimal length is roughly 500-2000 chars.
    let length = text.len() as f64;
    let length_score = if length <= 2000.0 {
        (length / 2000.0).min(1.0)
    } else {
        (2000.0 / length).max(0.5)
    };

    let unique: std::collections::HashSet<String> =
        words.iter().map(|w| w.to_lowercase()).collect();
    let vocab_score = if word_count > 0.0 {
        ((unique.len() as f64 / word_count) * 2.0).min(1.0)
    } else {
        0.0
    };

    let structure_score = if (10.0..=20.0).contains(&avg_sentence_len) {
        1.0
    } else {
        (1.0 - (avg_sentence_len - 15.0).abs() / 15.0).max(0.3)
    };

    let overall = readability * 0.30
        + length_score * 0.20
        + vocab_score * 0.20
        + structure_score * 0.15
        + 0.15;

    QualityMetrics {
        overall: round3(overall),
        readability: round3(readability),
        length: round3(length_score),
        vocabulary: round3(vocab_score),
        structure: round3(structure_score),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Sentence-aware chunking: sentences are packed into chunks of at most
/// `chunk_size` characters; a single sentence longer than the budget is
/// hard-split so no chunk ever exceeds it.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        if sentence.len() > chunk_size {
            if !current.trim().is_empty() {
                chunks.push(current.trim().to_string());
                current.clear();
            }
            chunks.extend(hard_split(sentence, chunk_size));
            continue;
        }
        if current.len() + sentence.len() <= chunk_size {
            current.push_str(sentence);
            current.push(' ');
        } else {
            if !current.trim().is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = format!("{sentence} ");
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

/// Split on sentence-ending punctuation followed by whitespace, keeping
/// the punctuation with the sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'!' | b'?') {
                end += 1;
            }
            if end >= bytes.len() || bytes[end].is_ascii_whitespace() {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                    end += 1;
                }
                start = end;
                i = end;
                continue;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn hard_split(sentence: &str, chunk_size: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = sentence;
    while rest.len() > chunk_size {
        let cut = rest.floor_char_boundary(chunk_size);
        parts.push(rest[..cut].trim().to_string());
        rest = &rest[cut..];
    }
    let tail = rest.trim();
    if !tail.is_empty() {
        parts.push(tail.to_string());
    }
    parts
}

fn ws_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn collapse_whitespace(text: &str) -> String {
    ws_regex().replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE_HTML: &str = r#"<html><head>
        <title>Fallback Title</title>
        <meta property="og:title" content="The Real Title">
        <style>body { color: red; }</style>
        <script>console.log("noise");</script>
        </head><body>
        <nav>Home About Contact</nav>
        <article>
        <p>Rust is a systems programming language focused on safety and speed. It achieves memory safety without a garbage collector. The borrow checker enforces ownership rules at compile time.</p>
        <p>Many developers appreciate the tooling. Cargo manages builds and dependencies with minimal fuss. Documentation tends to be thorough and approachable for newcomers.</p>
        </article>
        <footer>Copyright</footer>
        </body></html>"#;

    #[test]
    fn prefers_og_title_over_title_tag() {
        let content = extract("https://example.com/rust", ARTICLE_HTML, 1000);
        assert_eq!(content.title, "The Real Title");
    }

    #[test]
    fn main_content_skips_nav_script_and_footer() {
        let content = extract("https://example.com/rust", ARTICLE_HTML, 1000);
        let joined = content.text_chunks.join(" ");
        assert!(joined.contains("borrow checker"));
        assert!(!joined.contains("console.log"));
        assert!(!joined.contains("Home About Contact"));
        assert!(!joined.contains("Copyright"));
        assert_eq!(content.metadata.extraction_method, "main_content");
    }

    #[test]
    fn falls_back_to_paragraphs_without_main_container() {
        let html = r#"<html><body>
            <p>First paragraph with enough words to count for the sweep stage of extraction.</p>
            <p>Second paragraph adds more sentences. It keeps the recall pass well above threshold.</p>
            </body></html>"#;
        let content = extract("https://example.com/p", html, 1000);
        assert_eq!(content.metadata.extraction_method, "paragraph_sweep");
        assert!(content.text_chunks.join(" ").contains("Second paragraph"));
    }

    #[test]
    fn strips_tags_as_a_last_resort() {
        let html = "<html><body><div>tiny text body here</div></body></html>";
        let content = extract("https://example.com/t", html, 1000);
        assert_eq!(content.metadata.extraction_method, "strip_tags");
        assert_eq!(content.text_chunks, vec!["tiny text body here"]);
    }

    #[test]
    fn short_text_scores_zero() {
        let metrics = quality_metrics("too short");
        assert_eq!(metrics.overall, 0.0);
        assert_eq!(metrics.readability, 0.0);
    }

    #[test]
    fn reasonable_prose_scores_above_the_default_gate() {
        let text = "Rust is a systems programming language focused on safety and speed. \
            It achieves memory safety without using a garbage collector at runtime. \
            The borrow checker enforces ownership rules during compilation of every crate. \
            Developers often praise the quality of compiler diagnostics and error messages.";
        let metrics = quality_metrics(text);
        assert!(metrics.overall >= 0.6, "overall = {}", metrics.overall);
        assert!(metrics.readability > 0.5);
        assert!(metrics.structure > 0.5);
    }

    #[test]
    fn chunks_respect_the_size_budget_and_sentence_boundaries() {
        let text = "One sentence here. Another sentence follows! A third one asks? Finally a fourth.";
        let chunks = chunk_text(text, 40);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 40, "chunk too long: {chunk}");
        }
        assert!(chunks[0].starts_with("One sentence"));
    }

    #[test]
    fn oversized_sentences_are_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 100));
    }

    #[test]
    fn sentence_splitter_keeps_punctuation() {
        let sentences = split_sentences("First one. Second two! Third three? tail");
        assert_eq!(
            sentences,
            vec!["First one.", "Second two!", "Third three?", "tail"]
        );
    }
}
