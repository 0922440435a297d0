use anyhow::Result;
use ikoma_llm::LlmClient;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MOCK_EMBED_DIM: usize = 16;

/// Scripted stand-in for the language model. `generate` pops queued
/// responses in order (falling back to a fixed default), `embed` is a
/// cheap deterministic hash so identical texts always land on identical
/// vectors.
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    generate_calls: AtomicUsize,
    default_response: String,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            generate_calls: AtomicUsize::new(0),
            default_response: r#"{"task_completed":true,"success_rate":"100%","summary":"done","next_action":"end","reasoning":"scripted default"}"#.to_string(),
        }
    }

    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        {
            let mut queue = mock.responses.lock().expect("mock queue");
            queue.extend(responses.into_iter().map(Into::into));
        }
        mock
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("mock queue")
            .push_back(response.into());
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Every prompt passed to `generate`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock prompts").clone()
    }
}

impl LlmClient for MockLlm {
    fn generate(&self, prompt: &str, _temperature: f32) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("mock prompts")
            .push(prompt.to_string());
        let next = self.responses.lock().expect("mock queue").pop_front();
        Ok(next.unwrap_or_else(|| self.default_response.clone()))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text))
    }
}

fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; MOCK_EMBED_DIM];
    for (i, byte) in text.bytes().enumerate() {
        vector[i % MOCK_EMBED_DIM] += byte as f32;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Scratch directory for tests that need a workspace on disk.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().expect("temp workspace")
}
