use ikoma_citations::CitationRegistry;
use ikoma_memory::{MemoryValue, VectorStore};
use ikoma_web::HttpFetcher;
use serde_json::json;
use uuid::Uuid;

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_MIN_QUALITY: f64 = 0.6;
const PREVIEW_CHARS: usize = 200;

fn web_namespace() -> Vec<String> {
    vec!["web_content".to_string(), "default".to_string()]
}

/// `url|||chunk_size|||store_in_memory|||min_quality`, later parts optional.
fn parse_extract_args(raw: &str) -> (String, usize, bool, f64) {
    let parts: Vec<&str> = raw.split("|||").collect();
    let url = parts.first().map(|s| s.trim()).unwrap_or("").to_string();
    let chunk_size = parts
        .get(1)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let store = parts
        .get(2)
        .map(|s| s.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let min_quality = parts
        .get(3)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MIN_QUALITY);
    (url, chunk_size, store, min_quality)
}

pub fn extract_web_content(
    fetcher: &HttpFetcher,
    memory: &VectorStore,
    citations: &mut CitationRegistry,
    url_and_options: &str,
) -> Result<String, String> {
    let (url, chunk_size, store_in_memory, min_quality) = parse_extract_args(url_and_options);
    if url.is_empty() {
        return Err("Use format 'url|||chunk_size|||store_in_memory|||min_quality'".to_string());
    }

    let response = fetcher.get(&url, None, true);
    if !response.success {
        return Err(format!(
            "Fetch failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        ));
    }
    let html = response.content.unwrap_or_default();

    let extracted = ikoma_web::extract(&response.url, &html, chunk_size);
    if extracted.quality_score < min_quality {
        return Ok(format!(
            "Content quality too low: {:.2} < {min_quality} (extracted via {})",
            extracted.quality_score, extracted.metadata.extraction_method
        ));
    }

    let first_chunk = extracted.text_chunks.first().cloned().unwrap_or_default();
    let preview: String = first_chunk.chars().take(PREVIEW_CHARS).collect();

    if store_in_memory {
        let namespace = web_namespace();
        let total = extracted.text_chunks.len();
        for (index, chunk) in extracted.text_chunks.iter().enumerate() {
            let key = format!("{}_{index}", Uuid::now_v7());
            let value = MemoryValue {
                content: chunk.clone(),
                context: "web_content".to_string(),
                plan_context: None,
                reflection: None,
                metadata: json!({
                    "url": extracted.url,
                    "title": extracted.title,
                    "chunk_index": index,
                    "total_chunks": total,
                    "quality_score": extracted.quality_score,
                    "readability_score": extracted.readability_score,
                    "extraction_method": extracted.metadata.extraction_method,
                    "domain": extracted.metadata.domain,
                    "content_type": "web_content",
                }),
            };
            memory
                .put(&namespace, &key, &value)
                .map_err(|e| format!("Error storing web content: {e}"))?;
        }
    }

    let title = if extracted.title.is_empty() {
        "Untitled Web Page".to_string()
    } else {
        extracted.title.clone()
    };
    let citation_id = citations.add_citation(
        &extracted.url,
        &title,
        &preview,
        "web",
        &extracted.metadata.domain,
        extracted.quality_score,
    );

    Ok(format!(
        "Web content extracted from {}\n\n\
         Quality metrics:\n\
         - overall score: {:.2}/1.0\n\
         - readability: {:.2}/1.0\n\
         - method: {}\n\
         - chunks stored: {}\n\n\
         Preview: {}\n\n\
         Citation ID: [[{citation_id}]]",
        extracted.url,
        extracted.quality_score,
        extracted.readability_score,
        extracted.metadata.extraction_method,
        extracted.text_chunks.len(),
        preview,
    ))
}

/// `query|||min_quality|||domain_filter|||max_results`, later parts optional.
fn parse_search_args(raw: &str) -> (String, f64, Option<String>, usize) {
    let parts: Vec<&str> = raw.split("|||").collect();
    let query = parts.first().map(|s| s.trim()).unwrap_or("").to_string();
    let min_quality = parts
        .get(1)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MIN_QUALITY);
    let domain = parts
        .get(2)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let max_results = parts.get(3).and_then(|s| s.trim().parse().ok()).unwrap_or(5);
    (query, min_quality, domain, max_results)
}

pub fn search_web_memories(
    memory: &VectorStore,
    query_and_filters: &str,
) -> Result<String, String> {
    let (query, min_quality, domain_filter, max_results) = parse_search_args(query_and_filters);
    if query.is_empty() {
        return Err("Use format 'query|||min_quality|||domain_filter|||max_results'".to_string());
    }

    // Over-fetch so quality/domain filtering still fills the result list.
    let hits = memory
        .search(&web_namespace(), &query, max_results * 2)
        .map_err(|e| format!("Error searching web memories: {e}"))?;

    let mut lines = Vec::new();
    for hit in hits {
        let quality = hit.entry.metadata["quality_score"].as_f64().unwrap_or(0.0);
        if quality < min_quality {
            continue;
        }
        let domain = hit.entry.metadata["domain"].as_str().unwrap_or("");
        if let Some(wanted) = &domain_filter
            && !domain.to_lowercase().contains(&wanted.to_lowercase())
        {
            continue;
        }
        let url = hit.entry.metadata["url"].as_str().unwrap_or("");
        let preview: String = hit.entry.content.chars().take(PREVIEW_CHARS).collect();
        lines.push(format!(
            "- {preview}\n  source: {url} (quality {quality:.2}, distance {:.3})",
            hit.distance
        ));
        if lines.len() >= max_results {
            break;
        }
    }

    if lines.is_empty() {
        return Ok(format!("No stored web content matched '{query}'."));
    }
    Ok(format!(
        "Stored web content matching '{query}':\n{}",
        lines.join("\n")
    ))
}
