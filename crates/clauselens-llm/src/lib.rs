pub mod client;
mod json;

pub use client::HttpLlmClient;
pub use json::extract_json_object;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Fixed dimension of the embedding model. Vectors of any other length
/// are rejected by the client and never reach the store.
pub const EMBEDDING_DIM: usize = 1024;

/// Max characters sent to the embedding endpoint per text.
pub const EMBED_INPUT_MAX_CHARS: usize = 8_000;

/// Texts per embedding request.
pub const EMBED_BATCH_SIZE: usize = 10;

/// Pause between embedding batches to respect upstream rate limits.
pub const EMBED_BATCH_PAUSE_MS: u64 = 200;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Error, Debug)]
pub enum LlmError {
    /// All retries exhausted on connection-level or transient failures.
    #[error("网络连接不稳定，请检查网络后重试")]
    Network,

    /// Non-retryable upstream response (4xx).
    #[error("上游服务错误 ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Model reply could not be parsed as the requested shape.
    #[error("解析模型输出失败: {0}")]
    Parse(String),

    /// Embedding response had the wrong dimension.
    #[error("向量维度不符: 期望 {expected}, 实际 {actual}")]
    Dimension { expected: usize, actual: usize },
}

/// What kind of text is being embedded. Some embedding models encode
/// queries and documents differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextType {
    Document,
    Query,
}

impl TextType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Query => "query",
        }
    }
}

/// Per-call knobs for a chat completion.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Request a JSON object response and parse the reply.
    pub json_mode: bool,
    /// Model override. None = client default.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_retries: u32,
    /// User content longer than this is truncated with a marker.
    pub max_content_chars: usize,
    /// Per-request deadline.
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            json_mode: false,
            model: None,
            temperature: 0.7,
            max_retries: 2,
            max_content_chars: 30_000,
            timeout: Duration::from_secs(90),
        }
    }
}

/// A chat reply: plain text, or a parsed JSON object when the call ran
/// in JSON mode.
#[derive(Debug, Clone)]
pub enum ChatReply {
    Text(String),
    Json(serde_json::Value),
}

impl ChatReply {
    /// The reply as text (JSON replies are re-serialized).
    pub fn into_text(self) -> String {
        match self {
            Self::Text(t) => t,
            Self::Json(v) => v.to_string(),
        }
    }

    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            Self::Json(v) => Ok(v),
            Self::Text(t) => Err(LlmError::Parse(format!(
                "expected JSON reply, got text ({} chars)",
                t.chars().count()
            ))),
        }
    }
}

/// Seam between the pipeline and the model provider. The production
/// implementation is [`HttpLlmClient`]; tests script their own.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, system: &str, user: &str, opts: ChatOptions) -> Result<ChatReply>;

    /// Embed a single text into a 1024-dim vector.
    async fn embed(&self, text: &str, text_type: TextType) -> Result<Vec<f32>>;

    /// Embed many texts, batched internally. Fails as a whole on any
    /// batch failure; callers fall back to per-text [`Self::embed`].
    async fn embed_batch(&self, texts: &[String], text_type: TextType) -> Result<Vec<Vec<f32>>>;
}
