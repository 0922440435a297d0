use anyhow::{Result, anyhow};
use ikoma_core::LlmConfig;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

/// Text-in/text-out plus embeddings. No streaming contract: callers get the
/// fully assembled response or an error. Implementations must be safe to
/// share across runs.
pub trait LlmClient: Send + Sync {
    fn generate(&self, prompt: &str, temperature: f32) -> Result<String>;

    /// Embed a single document. Providers may not support batching, so the
    /// interface is deliberately one-text-in, one-vector-out; callers that
    /// need many embeddings loop.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Client for any OpenAI-compatible local server (LM Studio, Ollama, ...).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&url)
                .bearer_auth("sk-dummy")
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return serde_json::from_str(&body)
                            .map_err(|e| anyhow!("invalid JSON from {url}: {e}"));
                    }
                    last_err = Some(anyhow!(
                        "llm request failed with {} (attempt {}/{}): {}",
                        status,
                        attempt + 1,
                        self.cfg.max_retries + 1,
                        truncate(&body, 300)
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("llm transport error: {e}"));
                    if attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("llm request failed without detailed error")))
    }
}

impl LlmClient for OpenAiCompatClient {
    fn generate(&self, prompt: &str, temperature: f32) -> Result<String> {
        let payload = json!({
            "model": self.cfg.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "stream": false,
        });
        let body = self.post_json("/chat/completions", &payload)?;
        body.get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("completion response had no message content"))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let payload = json!({
            "model": self.cfg.embed_model,
            "input": text,
        });
        let body = self.post_json("/embeddings", &payload)?;
        let embedding = body
            .get("data")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|d| d.get("embedding"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("embedding response had no vector"))?;
        embedding
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| anyhow!("embedding vector contained a non-number"))
            })
            .collect()
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(base_ms: u64, attempt: u8) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(6)))
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        text
    } else {
        &text[..text.floor_char_boundary(max)]
    }
}

/// Pull a JSON object out of an LLM response. Both plan and reflection
/// parsing go through here so fence handling stays in one place: a
/// ```json fenced block wins, then a bare ``` fence, then the outermost
/// brace pair.
pub fn extract_json_snippet(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    if let Some(start) = text.find("```") {
        let rest = &text[start + "```".len()..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
        && end > start
    {
        return Some(text[start..=end].trim());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_handles_json_fences() {
        let text = "Here is the plan:\n```json\n{\"plan\": []}\n```\nDone.";
        assert_eq!(extract_json_snippet(text), Some("{\"plan\": []}"));
    }

    #[test]
    fn extract_handles_bare_fences() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_snippet(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extract_falls_back_to_outer_braces() {
        let text = "prefix {\"a\": {\"b\": 2}} suffix";
        assert_eq!(extract_json_snippet(text), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn extract_returns_none_without_json() {
        assert_eq!(extract_json_snippet("no json here"), None);
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        assert_eq!(retry_delay(400, 0), Duration::from_millis(400));
        assert_eq!(retry_delay(400, 1), Duration::from_millis(800));
        assert_eq!(retry_delay(400, 2), Duration::from_millis(1600));
    }
}
