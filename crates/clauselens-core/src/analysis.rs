//! Map-reduce analysis orchestrator.
//!
//! Fan-out: each chunk gets one JSON-mode extraction call, at most
//! `map_concurrency` outstanding at a time; a failed chunk becomes a
//! neutral placeholder so the reduce phase never starves. Fan-in: one
//! consolidation call shapes the final report; if it fails the job
//! degrades to a chunk-only aggregate instead of erroring.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use clauselens_llm::{ChatOptions, ChatReply, LanguageModel};

use crate::chunker::{self, ChunkerConfig};
use crate::prompts;
use crate::report::{self, truncate_chars};
use crate::types::{AnalysisStage, Chunk, ChunkOutcome, ProgressEvent, Report};

/// Per-request deadline for chunk extraction and consolidation calls.
pub const CHUNK_CALL_TIMEOUT: Duration = Duration::from_secs(90);
pub const REDUCE_CALL_TIMEOUT: Duration = Duration::from_secs(90);

/// Reducer input caps.
pub const REDUCER_MAX_RISKS: usize = 80;
pub const REDUCER_INPUT_MAX_CHARS: usize = 8_000;

pub struct Analyzer {
    llm: Arc<dyn LanguageModel>,
    chunker: ChunkerConfig,
    map_concurrency: usize,
}

impl Analyzer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            chunker: ChunkerConfig::default(),
            map_concurrency: 3,
        }
    }

    pub fn with_chunker(mut self, cfg: ChunkerConfig) -> Self {
        self.chunker = cfg;
        self
    }

    pub fn with_map_concurrency(mut self, n: usize) -> Self {
        self.map_concurrency = n.max(1);
        self
    }

    /// Run the full map-reduce analysis. Always returns a structurally
    /// valid report; internal failures degrade rather than propagate.
    pub async fn analyze(
        &self,
        text: &str,
        document_id: &str,
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> Report {
        let emit = |stage: AnalysisStage, pct: u8, msg: String| {
            if let Some(tx) = progress {
                let _ = tx.send(ProgressEvent::new(stage, pct, msg));
            }
        };

        emit(AnalysisStage::Init, 0, "开始分析".into());
        emit(AnalysisStage::Chunking, 5, "正在切分合同".into());
        let chunks = chunker::chunk_with(text, &self.chunker);
        info!(document_id, chunks = chunks.len(), "chunked document for analysis");

        if chunks.is_empty() {
            emit(AnalysisStage::Complete, 100, "分析完成".into());
            return report::aggregate_report(&[]);
        }

        emit(
            AnalysisStage::Mapping,
            10,
            format!("分 {} 段并行审查", chunks.len()),
        );
        let outcomes = self.map_chunks(&chunks, progress).await;

        emit(AnalysisStage::Reducing, 75, "整合审查结果".into());
        let report = match self.reduce(&outcomes).await {
            Ok(report) => report,
            Err(e) => {
                warn!(document_id, "consolidation failed, degrading to chunk aggregate: {e}");
                emit(
                    AnalysisStage::ReducingDegraded,
                    85,
                    "整合失败，使用分段汇总结果".into(),
                );
                report::aggregate_report(&outcomes)
            },
        };

        // Indexing is fire-and-forget on the caller's side and never
        // gates the report.
        emit(AnalysisStage::Indexing, 95, "开始后台索引".into());
        emit(AnalysisStage::Complete, 100, "分析完成".into());
        report
    }

    // ── Map phase ─────────────────────────────────────────────────────────

    async fn map_chunks(
        &self,
        chunks: &[Chunk],
        progress: Option<&UnboundedSender<ProgressEvent>>,
    ) -> Vec<ChunkOutcome> {
        let sem = Arc::new(Semaphore::new(self.map_concurrency));
        let mut set = tokio::task::JoinSet::new();

        for chunk in chunks {
            let llm = Arc::clone(&self.llm);
            let sem = Arc::clone(&sem);
            let context = prompts::chunk_context(chunk);
            let user = prompts::chunk_user(&context, &chunk.content);
            let index = chunk.chunk_index;
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let opts = ChatOptions {
                    json_mode: true,
                    temperature: 0.2,
                    max_retries: 2,
                    timeout: CHUNK_CALL_TIMEOUT,
                    ..Default::default()
                };
                match llm
                    .chat(prompts::CHUNK_SYSTEM, &user, opts)
                    .await
                    .and_then(ChatReply::into_json)
                {
                    Ok(value) => ChunkOutcome {
                        chunk_index: index,
                        analysis: report::parse_chunk_analysis(value),
                        skipped: false,
                    },
                    Err(e) => {
                        warn!(chunk_index = index, "chunk analysis skipped: {e}");
                        ChunkOutcome {
                            chunk_index: index,
                            analysis: report::skipped_chunk_analysis(),
                            skipped: true,
                        }
                    },
                }
            });
        }

        let total = chunks.len();
        let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(total);
        let mut done = 0usize;
        while let Some(joined) = set.join_next().await {
            done += 1;
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("chunk analysis task aborted: {e}"),
            }
            if let Some(tx) = progress {
                let pct = 10 + (60 * done / total) as u8;
                let _ = tx.send(ProgressEvent::new(
                    AnalysisStage::Mapping,
                    pct,
                    format!("已完成 {done}/{total} 段"),
                ));
            }
        }

        // Any chunk whose task aborted still gets its placeholder so
        // the reducer sees every index.
        let present: HashSet<usize> = outcomes.iter().map(|o| o.chunk_index).collect();
        for chunk in chunks {
            if !present.contains(&chunk.chunk_index) {
                outcomes.push(ChunkOutcome {
                    chunk_index: chunk.chunk_index,
                    analysis: report::skipped_chunk_analysis(),
                    skipped: true,
                });
            }
        }

        // Reduce phase consumes chunks in document order.
        outcomes.sort_by_key(|o| o.chunk_index);
        outcomes
    }

    // ── Reduce phase ──────────────────────────────────────────────────────

    async fn reduce(&self, outcomes: &[ChunkOutcome]) -> anyhow::Result<Report> {
        let input = build_reducer_input(outcomes);
        let system = prompts::consolidation_system(outcomes.len());
        let opts = ChatOptions {
            json_mode: true,
            temperature: 0.3,
            max_retries: 1,
            timeout: REDUCE_CALL_TIMEOUT,
            ..Default::default()
        };
        let value = self.llm.chat(&system, &input, opts).await?.into_json()?;
        let raw: report::RawReport = serde_json::from_value(value).unwrap_or_default();
        Ok(report::normalize_report(raw, outcomes))
    }
}

/// Assemble the reducer input: per-chunk summaries, the first 80 risks
/// rendered one per line, and the flattened suggestions, capped at
/// 8000 chars overall.
pub fn build_reducer_input(outcomes: &[ChunkOutcome]) -> String {
    let mut out = String::from("各片段初审摘要：\n");
    for o in outcomes {
        let _ = writeln!(
            out,
            "片段{}（评分 {}）：{}",
            o.chunk_index + 1,
            o.analysis.score,
            truncate_chars(o.analysis.summary.trim(), 200),
        );
    }

    out.push_str("\n初审风险：\n");
    let mut n = 0usize;
    'risks: for o in outcomes {
        for r in &o.analysis.risks {
            if n >= REDUCER_MAX_RISKS {
                break 'risks;
            }
            let _ = writeln!(
                out,
                "- [{}] {} | 条款：{} | 说明：{} | 依据：{}",
                r.level.as_str(),
                r.title,
                truncate_chars(&r.clause, 120),
                truncate_chars(&r.description, 200),
                r.legal_basis.as_deref().unwrap_or("无"),
            );
            n += 1;
        }
    }

    out.push_str("\n初审修改建议：\n");
    for o in outcomes {
        for s in &o.analysis.suggestions {
            let _ = writeln!(out, "- {s}");
        }
    }

    truncate_chars(&out, REDUCER_INPUT_MAX_CHARS)
}
