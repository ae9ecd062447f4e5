mod common;

use std::sync::Arc;

use clauselens_core::db::{Db, NewChunk};
use clauselens_core::rag::{cosine_similarity, ContextOptions, RagPipeline, SearchOptions};
use common::{unit_vec, FakeModel};
use serde_json::json;

const DOC_A_TEXT: &str = "保密协议：甲方与乙方约定对商业秘密承担保密义务，保密期限为合同终止后五年。";
const DOC_B_TEXT: &str = "付款条款：乙方应当在验收合格后三十日内向甲方支付全部合同价款。";

fn pipeline(model: FakeModel) -> RagPipeline {
    let db = Arc::new(Db::open_in_memory().expect("open in-memory store"));
    db.migrate().expect("migrate");
    RagPipeline::new(db, Arc::new(model))
}

fn scoped(document_id: &str) -> SearchOptions {
    SearchOptions {
        document_id: Some(document_id.into()),
        ..Default::default()
    }
}

// ── Cosine similarity ────────────────────────────────────────────────────

#[test]
fn cosine_of_a_vector_with_itself_is_one() {
    let v = vec![0.3f32, -1.2, 4.5, 0.0, 2.2];
    assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
}

#[test]
fn cosine_is_symmetric() {
    let a = vec![1.0f32, 2.0, 3.0];
    let b = vec![-2.0f32, 0.5, 1.0];
    assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
}

#[test]
fn cosine_degenerate_inputs_yield_zero() {
    assert_eq!(cosine_similarity(&[], &[]), 0.0);
    assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
}

#[test]
fn cosine_of_orthogonal_unit_vectors_is_zero() {
    assert_eq!(cosine_similarity(&unit_vec(1), &unit_vec(2)), 0.0);
}

// ── Indexing ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn index_document_stores_chunks_with_metadata() {
    let rag = pipeline(FakeModel::default());
    let summary = rag
        .index_document("doc-a", DOC_A_TEXT, Some(json!({ "source": "upload" })))
        .await
        .expect("index");
    assert_eq!(summary.chunk_count, 1);

    let stats = rag.index_stats("doc-a").expect("stats");
    assert_eq!(stats.total_chunks, 1);
    assert_eq!(stats.indexed_chunks, 1);
    assert!(stats.is_fully_indexed);
}

#[tokio::test]
async fn batch_failure_falls_back_to_per_text_embedding() {
    let model = FakeModel {
        embed_batch_fails: true,
        ..Default::default()
    };
    let rag = pipeline(model);
    let summary = rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index");
    assert_eq!(summary.chunk_count, 1);

    let stats = rag.index_stats("doc-a").expect("stats");
    assert!(stats.is_fully_indexed, "per-text fallback should embed the chunk");
}

#[tokio::test]
async fn failed_embedding_still_stores_the_chunk() {
    let model = FakeModel {
        embed_batch_fails: true,
        fail_embed_containing: Some("付款".into()),
        ..Default::default()
    };
    let rag = pipeline(model);
    rag.index_document("doc-b", DOC_B_TEXT, None).await.expect("index");

    let stats = rag.index_stats("doc-b").expect("stats");
    assert_eq!(stats.total_chunks, 1);
    assert_eq!(stats.indexed_chunks, 0);
    assert!(!stats.is_fully_indexed);

    // Content survives without a vector, so search cannot find it.
    let hits = rag.semantic_search("付款期限", &scoped("doc-b")).await.expect("search");
    assert!(hits.is_empty());
}

// ── Search scoping ───────────────────────────────────────────────────────

#[tokio::test]
async fn search_scopes_to_the_requested_document() {
    let rag = pipeline(FakeModel::default());
    rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index a");
    rag.index_document("doc-b", DOC_B_TEXT, None).await.expect("index b");

    // The query embedding matches doc A's chunk exactly.
    let hits = rag.semantic_search("保密义务有哪些", &scoped("doc-a")).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "doc-a");
    assert!((hits[0].similarity - 1.0).abs() < 1e-5);
    assert_eq!(hits[0].metadata["chunkIndex"], json!(0));
    assert!(hits[0].metadata["indexed_at"].is_string());

    // Scoped to the other document there is nothing above threshold.
    let hits = rag.semantic_search("保密义务有哪些", &scoped("doc-b")).await.expect("search");
    assert!(hits.is_empty());

    // Global search only surfaces the matching document.
    let hits = rag
        .semantic_search("保密义务有哪些", &SearchOptions::default())
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, "doc-a");
}

// ── Context assembly ─────────────────────────────────────────────────────

#[tokio::test]
async fn context_blocks_carry_similarity_prefixes() {
    let rag = pipeline(FakeModel::default());
    rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index");

    let ctx = rag
        .build_context("保密义务", Some("doc-a"), &ContextOptions::default())
        .await
        .expect("context");
    assert_eq!(ctx.selected.len(), 1);
    assert!(ctx.text.contains("[相关度: 100.0%]"));
    assert!(ctx.text.contains("保密协议"));
    assert!(ctx.tokens > 0);
}

#[tokio::test]
async fn context_respects_the_token_budget() {
    let rag = pipeline(FakeModel::default());
    rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index");

    let tight = ContextOptions {
        max_context_tokens: 5,
        ..Default::default()
    };
    let ctx = rag.build_context("保密义务", Some("doc-a"), &tight).await.expect("context");
    assert!(ctx.selected.is_empty());
    assert!(ctx.text.is_empty());
}

// ── Query ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn query_answers_with_sources_and_confidence() {
    let rag = pipeline(FakeModel::default());
    rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index");

    let answer = rag.query("保密义务的期限是多久", Some("doc-a")).await;
    assert!(answer.answer.contains("保密"));
    assert_eq!(answer.sources.len(), 1);
    assert!((answer.confidence - 1.0).abs() < 1e-5);
    assert!(answer.context_tokens > 0);
    assert!(answer.sources[0].excerpt.chars().count() <= 200);
}

#[tokio::test]
async fn query_without_context_returns_the_stock_answer() {
    let rag = pipeline(FakeModel::default());
    let answer = rag.query("保密义务的期限是多久", Some("doc-missing")).await;
    assert!(answer.answer.contains("未"));
    assert!(answer.sources.is_empty());
    assert_eq!(answer.confidence, 0.0);
    assert_eq!(answer.context_tokens, 0);
}

// ── Deletion ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_document_vectors_purges_everything() {
    let rag = pipeline(FakeModel::default());
    rag.index_document("doc-a", DOC_A_TEXT, None).await.expect("index");
    let deleted = rag.delete_document_vectors("doc-a").expect("delete");
    assert_eq!(deleted, 1);

    let stats = rag.index_stats("doc-a").expect("stats");
    assert_eq!(stats.total_chunks, 0);
    assert!(!stats.is_fully_indexed);

    let hits = rag.semantic_search("保密义务", &scoped("doc-a")).await.expect("search");
    assert!(hits.is_empty());
}

// ── Storage-level contracts ──────────────────────────────────────────────

#[test]
fn document_chunks_come_back_in_chunk_order() {
    let db = Db::open_in_memory().expect("open");
    db.migrate().expect("migrate");

    // Insert out of order; the listing must sort numerically.
    db.insert_chunks(
        "doc-x",
        &[
            NewChunk {
                content: "第二段".into(),
                embedding: Some(unit_vec(2)),
                metadata: json!({ "chunkIndex": 1 }),
            },
            NewChunk {
                content: "第一段".into(),
                embedding: None,
                metadata: json!({ "chunkIndex": 0 }),
            },
        ],
    )
    .expect("insert");

    let rows = db.get_document_chunks("doc-x").expect("list");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].content, "第一段");
    assert!(!rows[0].has_embedding);
    assert_eq!(rows[1].content, "第二段");
    assert!(rows[1].has_embedding);
}

#[test]
fn duplicate_chunk_index_is_rejected() {
    let db = Db::open_in_memory().expect("open");
    db.migrate().expect("migrate");

    let row = || NewChunk {
        content: "重复片段".into(),
        embedding: None,
        metadata: json!({ "chunkIndex": 0 }),
    };
    db.insert_chunks("doc-x", &[row()]).expect("first insert");
    assert!(db.insert_chunks("doc-x", &[row()]).is_err());
    // A different document may reuse the same index.
    db.insert_chunks("doc-y", &[row()]).expect("other document");
}

#[test]
fn file_backed_store_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chunks.db");
    let db = Db::open(path.to_str().expect("utf8 path")).expect("open");
    db.migrate().expect("migrate");

    db.insert_chunks(
        "doc-f",
        &[NewChunk {
            content: "文件存储的片段".into(),
            embedding: Some(unit_vec(3)),
            metadata: json!({ "chunkIndex": 0 }),
        }],
    )
    .expect("insert");

    let rows = db.get_document_chunks("doc-f").expect("rows");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].has_embedding);

    let stored = db.load_embedded_chunks(Some("doc-f")).expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].embedding.as_ref().map(Vec::len), Some(1024));
}

#[test]
fn match_documents_filters_by_threshold_and_orders_by_similarity() {
    let db = Db::open_in_memory().expect("open");
    db.migrate().expect("migrate");

    let mut close = unit_vec(1);
    close[2] = 0.4; // similar but not identical
    db.insert_chunks(
        "doc-x",
        &[
            NewChunk {
                content: "完全匹配".into(),
                embedding: Some(unit_vec(1)),
                metadata: json!({ "chunkIndex": 0 }),
            },
            NewChunk {
                content: "部分匹配".into(),
                embedding: Some(close),
                metadata: json!({ "chunkIndex": 1 }),
            },
            NewChunk {
                content: "无关内容".into(),
                embedding: Some(unit_vec(7)),
                metadata: json!({ "chunkIndex": 2 }),
            },
        ],
    )
    .expect("insert");

    let rows = db.match_documents(&unit_vec(1), 0.5, 5).expect("match");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].content, "完全匹配");
    assert!(rows[0].similarity > rows[1].similarity);
    assert!(rows.iter().all(|r| r.similarity > 0.5));
}
