use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use chrono::Utc;
use clauselens_core::{
    chunker,
    report::render_report_text,
    tokens::{detect_language, estimate_tokens},
    types::{AnalysisStage, Annotation, ProgressEvent, Report},
};
use clauselens_llm::LanguageModel;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn bad_request(msg: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct AnalyzeBody {
    pub text: Option<String>,
    pub document_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct QueryBody {
    pub question: Option<String>,
    pub document_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ReindexBody {
    pub text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExportBody {
    #[serde(flatten)]
    pub report: Report,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub file_name: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct AssistBody {
    pub text: Option<String>,
    pub action: Option<String>,
}

// ── Shared helpers ────────────────────────────────────────────────────────

fn rand_suffix() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as u64) & 0xFFFFF
}

/// Purge then re-index a document in the background; analysis responses
/// never wait on indexing.
fn spawn_indexing(state: &Arc<AppState>, document_id: String, text: String) {
    let rag = Arc::clone(&state.rag);
    tokio::spawn(async move {
        if let Err(e) = rag.delete_document_vectors(&document_id) {
            tracing::warn!("pre-index purge failed for {document_id}: {e}");
        }
        if let Err(e) = rag.index_document(&document_id, &text, None).await {
            tracing::error!("background indexing failed for {document_id}: {e}");
        }
    });
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeS": state.start_time.elapsed().as_secs(),
        "env": state.config.env,
        "chatModel": state.config.chat_model,
        "embedModel": state.config.embed_model,
        "mapConcurrency": state.config.map_concurrency,
    }))
}

/// Ingest an uploaded file. Text extraction for office formats lives
/// outside the core; the payload is decoded as UTF-8 text.
pub(crate) async fn upload_document(
    State(_state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut name = String::new();
    let mut content = String::new();
    while let Some(field) = multipart.next_field().await.map_err(internal)? {
        if field.name() != Some("file") {
            continue;
        }
        name = field.file_name().unwrap_or("contract.txt").to_string();
        let bytes = field.bytes().await.map_err(internal)?;
        content = String::from_utf8_lossy(&bytes).into_owned();
    }
    if content.trim().is_empty() {
        return Err(bad_request("缺少上传文件"));
    }

    let chunks = chunker::chunk(&content);
    let avg_chunk_tokens = if chunks.is_empty() {
        0
    } else {
        chunks.iter().map(|c| c.token_estimate).sum::<usize>() / chunks.len()
    };
    let id = format!("doc-{}-{}", Utc::now().timestamp_millis(), rand_suffix());

    Ok(Json(json!({
        "id": id,
        "name": name,
        "status": "ready",
        "content": content,
        "analysis": {
            "language": detect_language(&content).as_str(),
            "charCount": content.chars().count(),
            "estimatedTokens": estimate_tokens(&content),
            "chunkCount": chunks.len(),
            "avgChunkTokens": avg_chunk_tokens,
        },
    })))
}

/// Synchronous analysis. Always 200 with a structurally valid report;
/// degraded paths surface through the summary wording only.
pub(crate) async fn analyze_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<Value>, ApiError> {
    let text = match body.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(bad_request("缺少合同文本")),
    };
    let document_id = body.document_id.unwrap_or(id);

    let report = state.analyzer.analyze(&text, &document_id, None).await;
    spawn_indexing(&state, document_id, text);
    Ok(Json(json!(report)))
}

/// Streaming analysis: progress events per stage transition, then a
/// final result record carrying the report.
pub(crate) async fn analyze_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError>
{
    let text = match body.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(bad_request("缺少合同文本")),
    };
    let document_id = body.document_id.unwrap_or(id);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let state2 = Arc::clone(&state);
    tokio::spawn(async move {
        let (ptx, mut prx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
        let analyzer = Arc::clone(&state2.analyzer);
        let analysis_text = text.clone();
        let analysis_doc = document_id.clone();
        let mut analysis = tokio::spawn(async move {
            analyzer.analyze(&analysis_text, &analysis_doc, Some(&ptx)).await
        });
        let joined = loop {
            tokio::select! {
                Some(ev) = prx.recv() => {
                    let _ = tx.send(serde_json::to_string(&ev).unwrap_or_default());
                },
                joined = &mut analysis => break joined,
            }
        };
        while let Ok(ev) = prx.try_recv() {
            let _ = tx.send(serde_json::to_string(&ev).unwrap_or_default());
        }

        match joined {
            Ok(report) => {
                spawn_indexing(&state2, document_id, text);
                let _ = tx.send(
                    json!({ "stage": "result", "progress": 100, "data": report }).to_string(),
                );
            },
            Err(e) => {
                tracing::error!("analysis task failed: {e}");
                let _ = tx.send(
                    json!({ "stage": AnalysisStage::Error.as_str(), "error": e.to_string() })
                        .to_string(),
                );
            },
        }
    });

    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}

/// Grounded question answering over indexed chunks.
pub(crate) async fn query_document(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Value>, ApiError> {
    let question = match body.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => return Err(bad_request("缺少问题")),
    };
    let answer = state
        .rag
        .query(&question, body.document_id.as_deref())
        .await;
    Ok(Json(json!(answer)))
}

pub(crate) async fn reindex_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ReindexBody>,
) -> Result<Json<Value>, ApiError> {
    let text = match body.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(bad_request("缺少合同文本")),
    };
    state.rag.delete_document_vectors(&id).map_err(internal)?;
    let summary = state
        .rag
        .index_document(&id, &text, None)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "documentId": id, "chunkCount": summary.chunk_count })))
}

pub(crate) async fn index_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stats = state.rag.index_stats(&id).map_err(internal)?;
    Ok(Json(json!(stats)))
}

/// Render the report as formatted text for office export. Document
/// generation itself happens client-side; this endpoint supplies the
/// text and the file name.
pub(crate) async fn export_docx(
    Json(body): Json<ExportBody>,
) -> Result<Json<Value>, ApiError> {
    let file_name = body
        .file_name
        .unwrap_or_else(|| "合同审查报告.docx".to_string());
    let mut content = render_report_text(&body.report, &file_name);
    if !body.annotations.is_empty() {
        content.push_str("\n附：条款标注\n");
        for a in &body.annotations {
            content.push_str(&format!(
                "- [{}] 位置 {}：{}\n",
                a.risk.as_str(),
                a.position,
                a.clause
            ));
        }
    }
    Ok(Json(json!({ "content": content, "fileName": file_name })))
}

/// Lightweight single-call assist actions.
pub(crate) async fn assist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssistBody>,
) -> Result<Json<Value>, ApiError> {
    let text = match body.text {
        Some(t) if !t.trim().is_empty() => t,
        _ => return Err(bad_request("缺少文本")),
    };
    let action = body.action.unwrap_or_default();
    let Some((system, user)) = clauselens_core::prompts::assist_prompts(&action, &text) else {
        return Err(bad_request("不支持的操作"));
    };

    let reply = state
        .llm
        .chat(&system, &user, Default::default())
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "result": reply.into_text() })))
}

// ── SSE logs — replays ring buffer history then streams live events ──────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
