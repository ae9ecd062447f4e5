//! Retrieval-augmented query pipeline: chunk → embed → store → search →
//! context assembly → grounded answer.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use clauselens_llm::{ChatOptions, LanguageModel, TextType};

use crate::chunker;
use crate::db::{Db, MatchRow, NewChunk};
use crate::prompts;
use crate::report::truncate_chars;
use crate::tokens::estimate_tokens;
use crate::types::{Chunk, IndexStats, QueryAnswer, SearchHit, SourceRef};

/// Rows per insert transaction.
const INSERT_BATCH_SIZE: usize = 20;

/// Leading chars of a chunk quoted back as a source excerpt.
const SOURCE_EXCERPT_CHARS: usize = 200;

const NOT_FOUND_ANSWER: &str =
    "未在已索引的合同内容中找到相关信息，请确认文档已完成索引或换一种问法。";

/// `dot(a,b) / (‖a‖·‖b‖)`; mismatched or empty vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut na = 0f64;
    let mut nb = 0f64;
    for (x, y) in a.iter().zip(b) {
        dot += *x as f64 * *y as f64;
        na += *x as f64 * *x as f64;
        nb += *y as f64 * *y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())) as f32
}

// ── Options ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub document_id: Option<String>,
    pub threshold: f32,
    pub count: usize,
    pub include_metadata: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            document_id: None,
            threshold: 0.5,
            count: 5,
            include_metadata: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub max_chunks: usize,
    pub min_similarity: f32,
    pub max_context_tokens: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_chunks: 5,
            min_similarity: 0.5,
            max_context_tokens: 4000,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub chunk_count: usize,
    pub chunks: Vec<Chunk>,
}

/// Assembled retrieval context plus the chunks that made the cut.
#[derive(Debug)]
pub struct ContextBundle {
    pub text: String,
    pub selected: Vec<SearchHit>,
    pub tokens: usize,
}

// ── Pipeline ──────────────────────────────────────────────────────────────

pub struct RagPipeline {
    db: Arc<Db>,
    llm: Arc<dyn LanguageModel>,
}

impl RagPipeline {
    pub fn new(db: Arc<Db>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { db, llm }
    }

    /// Chunk, embed and persist a document. Batch embedding failures
    /// fall back to per-text embedding; a chunk whose embedding still
    /// fails is stored with a null vector so its content survives.
    pub async fn index_document(
        &self,
        document_id: &str,
        text: &str,
        metadata: Option<Value>,
    ) -> Result<IndexSummary> {
        let chunks = chunker::chunk(text);
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        let embeddings: Vec<Option<Vec<f32>>> =
            match self.llm.embed_batch(&contents, TextType::Document).await {
                Ok(vectors) => vectors.into_iter().map(Some).collect(),
                Err(e) => {
                    warn!(document_id, "batch embedding failed, falling back per-text: {e}");
                    let mut out = Vec::with_capacity(contents.len());
                    for content in &contents {
                        match self.llm.embed(content, TextType::Document).await {
                            Ok(v) => out.push(Some(v)),
                            Err(e) => {
                                warn!(document_id, "embedding failed, storing without vector: {e}");
                                out.push(None);
                            },
                        }
                    }
                    out
                },
            };

        let indexed_at = Utc::now().to_rfc3339();
        let rows: Vec<NewChunk> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut meta = json!({
                    "chunkIndex": chunk.chunk_index,
                    "segments": chunk.segments,
                    "importance": chunk.importance,
                    "hasOverlap": chunk.has_overlap,
                    "tokenEstimate": chunk.token_estimate,
                });
                if let (Some(obj), Some(Value::Object(extra))) = (meta.as_object_mut(), &metadata)
                {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                if let Some(obj) = meta.as_object_mut() {
                    obj.insert("indexed_at".into(), Value::String(indexed_at.clone()));
                }
                NewChunk {
                    content: chunk.content.clone(),
                    embedding,
                    metadata: meta,
                }
            })
            .collect();

        for batch in rows.chunks(INSERT_BATCH_SIZE) {
            self.db.insert_chunks(document_id, batch)?;
        }
        info!(document_id, chunks = chunks.len(), "indexed document");
        Ok(IndexSummary { chunk_count: chunks.len(), chunks })
    }

    /// Cosine search, scoped to one document when `document_id` is set.
    /// Falls back to an in-process scan when the SQL path fails; on
    /// fallback failure the result is empty, never an error.
    pub async fn semantic_search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let embedding = self.llm.embed(query, TextType::Query).await?;
        let rows = match self.db.match_documents_in_doc(
            &embedding,
            opts.threshold,
            opts.count,
            opts.document_id.as_deref(),
        ) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("vector query failed, scanning in process: {e}");
                self.fallback_scan(&embedding, opts)
            },
        };

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|r| SearchHit {
                id: r.id,
                document_id: r.document_id,
                content: r.content,
                similarity: r.similarity,
                metadata: r.metadata,
            })
            .collect();

        if opts.include_metadata && !hits.is_empty() {
            let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
            if let Ok(map) = self.db.metadata_for_ids(&ids) {
                for hit in &mut hits {
                    if let Some(meta) = map.get(&hit.id) {
                        hit.metadata = meta.clone();
                    }
                }
            }
        }
        Ok(hits)
    }

    fn fallback_scan(&self, embedding: &[f32], opts: &SearchOptions) -> Vec<MatchRow> {
        let chunks = match self.db.load_embedded_chunks(opts.document_id.as_deref()) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("fallback scan failed, returning empty results: {e}");
                return Vec::new();
            },
        };
        let mut scored: Vec<MatchRow> = chunks
            .into_iter()
            .map(|c| {
                let similarity =
                    cosine_similarity(embedding, c.embedding.as_deref().unwrap_or(&[]));
                MatchRow {
                    id: c.id,
                    document_id: c.document_id,
                    content: c.content,
                    similarity,
                    metadata: c.metadata,
                }
            })
            .filter(|r| r.similarity > opts.threshold)
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(opts.count);
        scored
    }

    /// Greedily assemble a token-bounded context from the best matches,
    /// each block prefixed with its similarity.
    pub async fn build_context(
        &self,
        query: &str,
        document_id: Option<&str>,
        opts: &ContextOptions,
    ) -> Result<ContextBundle> {
        let hits = self
            .semantic_search(
                query,
                &SearchOptions {
                    document_id: document_id.map(Into::into),
                    threshold: opts.min_similarity,
                    count: opts.max_chunks,
                    include_metadata: false,
                },
            )
            .await?;

        let mut text = String::new();
        let mut selected = Vec::new();
        let mut tokens = 0usize;
        for hit in hits {
            let block = format!(
                "\n\n---\n[相关度: {:.1}%]\n{}",
                hit.similarity * 100.0,
                hit.content
            );
            let block_tokens = estimate_tokens(&block);
            if tokens + block_tokens > opts.max_context_tokens {
                break;
            }
            text.push_str(&block);
            tokens += block_tokens;
            selected.push(hit);
        }
        Ok(ContextBundle { text, selected, tokens })
    }

    /// Grounded question answering. Never errors: empty context and
    /// upstream failures both produce a valid answer object.
    pub async fn query(&self, question: &str, document_id: Option<&str>) -> QueryAnswer {
        let ctx = match self
            .build_context(question, document_id, &ContextOptions::default())
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("context assembly failed: {e}");
                return Self::not_found_answer();
            },
        };
        if ctx.selected.is_empty() {
            return Self::not_found_answer();
        }

        let confidence = ctx.selected.iter().map(|h| h.similarity).sum::<f32>()
            / ctx.selected.len() as f32;
        let sources: Vec<SourceRef> = ctx
            .selected
            .iter()
            .map(|h| SourceRef {
                excerpt: truncate_chars(&h.content, SOURCE_EXCERPT_CHARS),
                similarity: h.similarity,
            })
            .collect();

        let system = prompts::rag_system(&ctx.text);
        let opts = ChatOptions {
            temperature: 0.5,
            ..Default::default()
        };
        let answer = match self.llm.chat(&system, question, opts).await {
            Ok(reply) => reply.into_text(),
            Err(e) => {
                warn!("grounded answer generation failed: {e}");
                "回答生成失败，请稍后重试。".to_string()
            },
        };

        QueryAnswer {
            answer,
            sources,
            confidence,
            context_tokens: ctx.tokens,
        }
    }

    fn not_found_answer() -> QueryAnswer {
        QueryAnswer {
            answer: NOT_FOUND_ANSWER.into(),
            sources: Vec::new(),
            confidence: 0.0,
            context_tokens: 0,
        }
    }

    /// Whole-document purge.
    pub fn delete_document_vectors(&self, document_id: &str) -> Result<usize> {
        let n = self.db.delete_document(document_id)?;
        info!(document_id, deleted = n, "purged document vectors");
        Ok(n)
    }

    pub fn index_stats(&self, document_id: &str) -> Result<IndexStats> {
        let (total, embedded) = self.db.index_stats(document_id)?;
        Ok(IndexStats {
            total_chunks: total,
            indexed_chunks: embedded,
            is_fully_indexed: total > 0 && embedded == total,
        })
    }
}
