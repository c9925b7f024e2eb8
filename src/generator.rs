//! The `TextGenerator` capability: an abstract language-model backend the
//! dispatcher's NL fallback and the evolution engine's Identify/Generate
//! phases call out to. The agent core depends only on this trait; no
//! concrete backend ships here.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("no text-generation backend is loaded")]
    NotLoaded,
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

/// Sampling/shape parameters for a single generation request.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            stop: Vec::new(),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, GeneratorError>;
}

/// Deterministic double for tests: returns a fixed reply, or replays a
/// scripted sequence, without depending on any real backend.
pub struct MockTextGenerator {
    replies: std::sync::Mutex<std::collections::VecDeque<String>>,
    default_reply: String,
}

impl MockTextGenerator {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            replies: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default_reply: default_reply.into(),
        }
    }

    pub fn with_script(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into_iter().map(Into::into).collect()),
            default_reply: String::new(),
        }
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String, GeneratorError> {
        let mut replies = self.replies.lock().expect("mock generator lock poisoned");
        Ok(replies.pop_front().unwrap_or_else(|| self.default_reply.clone()))
    }
}
