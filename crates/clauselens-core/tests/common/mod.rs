//! Scripted [`LanguageModel`] double shared by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clauselens_llm::{ChatOptions, ChatReply, LanguageModel, LlmError, TextType, EMBEDDING_DIM};
use serde_json::Value;

/// Deterministic unit vector with a single 1.0 at `seed`.
pub fn unit_vec(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[seed % EMBEDDING_DIM] = 1.0;
    v
}

/// Keyword-keyed embeddings so tests control similarity exactly.
pub fn embed_for(text: &str) -> Vec<f32> {
    if text.contains("保密") {
        unit_vec(1)
    } else if text.contains("付款") {
        unit_vec(2)
    } else {
        unit_vec(0)
    }
}

pub enum ReduceMode {
    /// Consolidation call raises; analysis must degrade.
    Fail,
    /// Consolidation call returns this JSON verbatim.
    Echo(Value),
}

pub struct FakeModel {
    /// chat() fails for any chunk whose user prompt contains this.
    pub fail_chunk_containing: Option<String>,
    pub reduce: ReduceMode,
    /// Builds the chunk JSON reply from the user prompt.
    pub chunk_reply: Box<dyn Fn(&str) -> Value + Send + Sync>,
    /// embed_batch() fails as a whole, forcing the per-text fallback.
    pub embed_batch_fails: bool,
    /// embed() fails for texts containing this marker.
    pub fail_embed_containing: Option<String>,
    /// Artificial latency inside chunk calls, for concurrency checks.
    pub chunk_delay_ms: u64,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self {
            fail_chunk_containing: None,
            reduce: ReduceMode::Fail,
            chunk_reply: Box::new(|_| serde_json::json!({ "score": 50, "summary": "", "risks": [] })),
            embed_batch_fails: false,
            fail_embed_containing: None,
            chunk_delay_ms: 0,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn is_consolidation(system: &str) -> bool {
    system.contains("整合")
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        opts: ChatOptions,
    ) -> Result<ChatReply, LlmError> {
        if is_consolidation(system) {
            return match &self.reduce {
                ReduceMode::Fail => Err(LlmError::Network),
                ReduceMode::Echo(v) => Ok(ChatReply::Json(v.clone())),
            };
        }
        if !opts.json_mode {
            // Grounded Q&A / assist calls run in text mode.
            return Ok(ChatReply::Text("根据合同约定，保密义务期限为五年。".into()));
        }
        if let Some(marker) = &self.fail_chunk_containing {
            if user.contains(marker.as_str()) {
                return Err(LlmError::Network);
            }
        }
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(n, Ordering::SeqCst);
        if self.chunk_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.chunk_delay_ms)).await;
        }
        let reply = (self.chunk_reply)(user);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ChatReply::Json(reply))
    }

    async fn embed(&self, text: &str, _text_type: TextType) -> Result<Vec<f32>, LlmError> {
        if let Some(marker) = &self.fail_embed_containing {
            if text.contains(marker.as_str()) {
                return Err(LlmError::Network);
            }
        }
        Ok(embed_for(text))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        text_type: TextType,
    ) -> Result<Vec<Vec<f32>>, LlmError> {
        if self.embed_batch_fails {
            return Err(LlmError::Network);
        }
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t, text_type).await?);
        }
        Ok(out)
    }
}
