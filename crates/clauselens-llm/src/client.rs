use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    extract_json_object, ChatOptions, ChatReply, LanguageModel, LlmError, Result, TextType,
    EMBEDDING_DIM, EMBED_BATCH_PAUSE_MS, EMBED_BATCH_SIZE, EMBED_INPUT_MAX_CHARS,
};

const TRUNCATION_MARKER: &str = "\n…[内容已截断]";

/// Chat-completion + embedding client over an OpenAI-compatible HTTP API.
///
/// One instance per process; the underlying reqwest client keeps a pool
/// of warm keep-alive connections shared across concurrent requests.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_key: String,
    chat_url: String,
    chat_model: String,
    embed_url: String,
    embed_model: String,
    embed_timeout: Duration,
    embed_batch_timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(
        api_key: impl Into<String>,
        chat_url: impl Into<String>,
        embed_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(50)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            api_key: api_key.into(),
            chat_url: chat_url.into(),
            chat_model: "deepseek-chat".into(),
            embed_url: embed_url.into(),
            embed_model: "text-embedding-v3".into(),
            embed_timeout: Duration::from_secs(30),
            embed_batch_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    text_type: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

// ── Failure classification ────────────────────────────────────────────────

enum Failure {
    /// Socket-level: reset, timeout, refused, DNS. Backoff 3·2^attempt s.
    Connection(String),
    /// Other retryable failure (5xx, body read). Backoff 1·2^attempt s.
    Transient(String),
    /// Not retryable (4xx and friends).
    Fatal(LlmError),
}

fn classify(e: reqwest::Error) -> Failure {
    if e.is_connect() || e.is_timeout() {
        Failure::Connection(e.to_string())
    } else {
        Failure::Transient(e.to_string())
    }
}

fn backoff(failure: &Failure, attempt: u32) -> Duration {
    let base = match failure {
        Failure::Connection(_) => 3,
        _ => 1,
    };
    Duration::from_secs(base << attempt.min(6))
}

/// Truncate to at most `max` chars, appending the truncation marker.
fn clip_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}{TRUNCATION_MARKER}")
}

impl HttpLlmClient {
    async fn send_chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> std::result::Result<String, Failure> {
        let body = ChatRequest {
            model,
            messages: vec![
                WireMessage { role: "system", content: system },
                WireMessage { role: "user", content: user },
            ],
            temperature: opts.temperature,
            response_format: opts.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let resp = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .timeout(opts.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status.is_client_error() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat endpoint rejected request: {message}");
            return Err(Failure::Fatal(LlmError::Upstream {
                status: status.as_u16(),
                message,
            }));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Failure::Transient(format!("{status}: {message}")));
        }

        let parsed: ChatCompletion = resp.json().await.map_err(classify)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Failure::Transient("empty choices in chat completion".into()))
    }

    async fn send_embeddings(
        &self,
        texts: &[String],
        text_type: TextType,
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| t.chars().take(EMBED_INPUT_MAX_CHARS).collect())
            .collect();
        let body = EmbeddingRequest {
            model: &self.embed_model,
            input: inputs.iter().map(String::as_str).collect(),
            text_type: text_type.as_str(),
        };

        let resp = self
            .http
            .post(&self.embed_url)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|_| LlmError::Network)?;

        let status = resp.status();
        if status.is_client_error() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Upstream { status: status.as_u16(), message });
        }
        if !status.is_success() {
            return Err(LlmError::Network);
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("embedding response: {e}")))?;

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|r| r.embedding).collect();

        if vectors.len() != texts.len() {
            return Err(LlmError::Parse(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for v in &vectors {
            if v.len() != EMBEDDING_DIM {
                return Err(LlmError::Dimension { expected: EMBEDDING_DIM, actual: v.len() });
            }
        }
        Ok(vectors)
    }
}

#[async_trait::async_trait]
impl LanguageModel for HttpLlmClient {
    async fn chat(&self, system: &str, user: &str, opts: ChatOptions) -> Result<ChatReply> {
        let user = clip_chars(user, opts.max_content_chars);
        let model = opts.model.clone().unwrap_or_else(|| self.chat_model.clone());

        let mut attempt = 0u32;
        let content = loop {
            match self.send_chat(&model, system, &user, &opts).await {
                Ok(content) => break content,
                Err(Failure::Fatal(e)) => return Err(e),
                Err(failure) => {
                    let (kind, detail) = match &failure {
                        Failure::Connection(d) => ("connection", d.clone()),
                        Failure::Transient(d) => ("transient", d.clone()),
                        Failure::Fatal(_) => unreachable!(),
                    };
                    if attempt >= opts.max_retries {
                        warn!(attempt, kind, "chat request failed, retries exhausted: {detail}");
                        return Err(LlmError::Network);
                    }
                    let wait = backoff(&failure, attempt);
                    debug!(attempt, kind, wait_s = wait.as_secs(), "chat request failed, retrying: {detail}");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                },
            }
        };

        if !opts.json_mode {
            return Ok(ChatReply::Text(content));
        }

        // Strict parse first; models sometimes wrap the object in prose
        // or fences, so fall back to balanced-brace extraction.
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(v) => Ok(ChatReply::Json(v)),
            Err(_) => match extract_json_object(&content).and_then(|s| serde_json::from_str(s).ok())
            {
                Some(v) => Ok(ChatReply::Json(v)),
                None => Err(LlmError::Parse(format!(
                    "no JSON object in reply ({} chars)",
                    content.chars().count()
                ))),
            },
        }
    }

    async fn embed(&self, text: &str, text_type: TextType) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        let mut vectors = self.send_embeddings(&texts, text_type, self.embed_timeout).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String], text_type: TextType) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(EMBED_BATCH_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(EMBED_BATCH_PAUSE_MS)).await;
            }
            let vectors = self
                .send_embeddings(batch, text_type, self.embed_batch_timeout)
                .await?;
            out.extend(vectors);
        }
        info!(texts = texts.len(), "embedded batch");
        Ok(out)
    }
}
