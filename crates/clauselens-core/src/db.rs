use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{functions::FunctionFlags, params, Connection};
use serde_json::Value;

use crate::rag::cosine_similarity;
use crate::types::StoredChunk;

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// SQLite-backed vector store. One pooled connection behind a mutex;
/// `cosine_sim` is registered as a scalar SQL function so similarity
/// search runs server-side, with the in-process scan as fallback.
pub struct Db {
    conn: Mutex<Connection>,
}

// ── Row types ─────────────────────────────────────────────────────────────

/// A chunk ready for insertion. `chunkIndex` lives in `metadata`.
pub struct NewChunk {
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Value,
}

/// One similarity match.
pub struct MatchRow {
    pub id: i64,
    pub document_id: String,
    pub content: String,
    pub similarity: f32,
    pub metadata: Value,
}

/// One row of a whole-document listing.
pub struct DocChunkRow {
    pub id: i64,
    pub content: String,
    pub metadata: Value,
    pub has_embedding: bool,
}

// ── Embedding codec ───────────────────────────────────────────────────────

pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

pub fn decode_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn parse_metadata(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::Object(Default::default()))
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRow> {
    let metadata: String = row.get(3)?;
    let similarity: f64 = row.get(4)?;
    Ok(MatchRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        content: row.get(2)?,
        metadata: parse_metadata(&metadata),
        similarity: similarity as f32,
    })
}

fn row_to_doc_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocChunkRow> {
    let metadata: String = row.get(2)?;
    let has_embedding: i64 = row.get(3)?;
    Ok(DocChunkRow {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: parse_metadata(&metadata),
        has_embedding: has_embedding != 0,
    })
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredChunk> {
    let metadata: String = row.get(3)?;
    let blob: Option<Vec<u8>> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(StoredChunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        content: row.get(2)?,
        metadata: parse_metadata(&metadata),
        embedding: blob.as_deref().map(decode_embedding),
        created_at: parse_ts(&created_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.create_scalar_function(
            "cosine_sim",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let a: Option<Vec<u8>> = ctx.get(0)?;
                let b: Option<Vec<u8>> = ctx.get(1)?;
                let (Some(a), Some(b)) = (a, b) else {
                    return Ok(0.0f64);
                };
                Ok(cosine_similarity(&decode_embedding(&a), &decode_embedding(&b)) as f64)
            },
        )
        .context("failed to register cosine_sim")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Writes ────────────────────────────────────────────────────────────

    /// Insert a batch of chunks in one transaction.
    pub fn insert_chunks(&self, document_id: &str, rows: &[NewChunk]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("insert_chunks begin")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO document_chunks (document_id, content, embedding, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    document_id,
                    row.content,
                    row.embedding.as_deref().map(encode_embedding),
                    row.metadata.to_string(),
                    now_str(),
                ])
                .context("insert_chunks")?;
            }
        }
        tx.commit().context("insert_chunks commit")?;
        Ok(())
    }

    /// Remove every chunk of a document. Returns the number deleted.
    pub fn delete_document(&self, document_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "DELETE FROM document_chunks WHERE document_id = ?1",
                params![document_id],
            )
            .context("delete_document")?;
        Ok(n)
    }

    // ── Similarity queries ────────────────────────────────────────────────

    /// Top-`count` chunks globally with similarity above `threshold`,
    /// most similar first.
    pub fn match_documents(
        &self,
        query: &[f32],
        threshold: f32,
        count: usize,
    ) -> Result<Vec<MatchRow>> {
        self.match_documents_in_doc(query, threshold, count, None)
    }

    /// Same as [`Self::match_documents`] scoped to one document; a
    /// `None` document behaves like the global query.
    pub fn match_documents_in_doc(
        &self,
        query: &[f32],
        threshold: f32,
        count: usize,
        document_id: Option<&str>,
    ) -> Result<Vec<MatchRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let blob = encode_embedding(query);
        let mut stmt = conn.prepare(
            "SELECT id, document_id, content, metadata, cosine_sim(embedding, ?1) AS similarity \
             FROM document_chunks \
             WHERE embedding IS NOT NULL \
               AND (?4 IS NULL OR document_id = ?4) \
               AND cosine_sim(embedding, ?1) > ?2 \
             ORDER BY similarity DESC \
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![blob, threshold as f64, count as i64, document_id],
                row_to_match,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("match_documents")?;
        Ok(rows)
    }

    /// All chunks of a document in chunk order, with an
    /// embedding-present flag.
    pub fn get_document_chunks(&self, document_id: &str) -> Result<Vec<DocChunkRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, content, metadata, embedding IS NOT NULL \
             FROM document_chunks WHERE document_id = ?1 \
             ORDER BY CAST(json_extract(metadata, '$.chunkIndex') AS INTEGER)",
        )?;
        let rows = stmt
            .query_map(params![document_id], row_to_doc_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_document_chunks")?;
        Ok(rows)
    }

    /// Embedded chunks for the in-process similarity fallback,
    /// optionally scoped to one document.
    pub fn load_embedded_chunks(&self, document_id: Option<&str>) -> Result<Vec<StoredChunk>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, document_id, content, metadata, embedding, created_at \
             FROM document_chunks \
             WHERE embedding IS NOT NULL AND (?1 IS NULL OR document_id = ?1)",
        )?;
        let rows = stmt
            .query_map(params![document_id], row_to_stored)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("load_embedded_chunks")?;
        Ok(rows)
    }

    /// Full metadata for a set of ids, for search-result hydration.
    pub fn metadata_for_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Value>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT metadata FROM document_chunks WHERE id = ?1")?;
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Ok(s) = stmt.query_row(params![id], |row| row.get::<_, String>(0)) {
                out.insert(*id, parse_metadata(&s));
            }
        }
        Ok(out)
    }

    /// (total, embedded) chunk counts for a document.
    pub fn index_stats(&self, document_id: &str) -> Result<(usize, usize)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let (total, embedded): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(embedding IS NOT NULL), 0) \
                 FROM document_chunks WHERE document_id = ?1",
                params![document_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("index_stats")?;
        Ok((total as usize, embedded as usize))
    }
}
