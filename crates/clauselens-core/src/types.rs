use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Chunking ─────────────────────────────────────────────────────────────

/// Structural role of a segment inside a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Article,
    Clause,
    Header,
    Signature,
    Content,
}

impl SegmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Clause => "clause",
            Self::Header => "header",
            Self::Signature => "signature",
            Self::Content => "content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Normal,
    Low,
}

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// A contiguous semantic segment of the source text, sized to fit the
/// model's context budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub token_estimate: usize,
    /// Ordered set of segment types observed in this chunk.
    pub segments: Vec<SegmentType>,
    pub importance: Importance,
    /// True when the chunk opens with the tail of its predecessor.
    pub has_overlap: bool,
    /// 0-based, stable across identical input and configuration.
    pub chunk_index: usize,
}

// ── Risks ────────────────────────────────────────────────────────────────

/// Per-finding severity. Declaration order is the sort order (high first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    /// Lenient parse of model output; None for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "高" => Some(Self::High),
            "medium" | "中" => Some(Self::Medium),
            "low" | "低" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One validated finding. `clause` is a verbatim quotation from the
/// source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Risk {
    pub level: RiskLevel,
    pub title: String,
    pub clause: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_basis: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
}

pub fn default_category() -> String {
    "other".into()
}

// ── Report ───────────────────────────────────────────────────────────────

/// Overall report banding (distinct from per-risk [`RiskLevel`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportRiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ReportRiskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Band a 0–100 score: ≥80 low, ≥60 medium, ≥40 high, else critical.
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Low,
            60..=79 => Self::Medium,
            40..=59 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScore {
    pub dimension: String,
    pub score: u8,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingItem {
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_important: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceStatus {
    Ok,
    Risk,
    Missing,
    Na,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceItem {
    pub topic: String,
    pub status: ComplianceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Placeholder for profile fields the model could not establish.
pub const UNKNOWN_FIELD: &str = "未明确";

fn unknown() -> String {
    UNKNOWN_FIELD.into()
}

/// Typed snapshot of the contract's basic facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractProfile {
    #[serde(default = "unknown")]
    pub contract_type: String,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(default = "unknown")]
    pub term: String,
    #[serde(default = "unknown")]
    pub subject_matter: String,
    #[serde(default = "unknown")]
    pub payment: String,
    #[serde(default = "unknown")]
    pub delivery_and_acceptance: String,
    #[serde(default = "unknown")]
    pub dispute_resolution: String,
}

impl Default for ContractProfile {
    fn default() -> Self {
        Self {
            contract_type: unknown(),
            parties: Vec::new(),
            term: unknown(),
            subject_matter: unknown(),
            payment: unknown(),
            delivery_and_acceptance: unknown(),
            dispute_resolution: unknown(),
        }
    }
}

/// The consolidated review. `risks` is deduplicated and sorted
/// high → medium → low; within a level, first occurrence wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub score: u8,
    pub risk_level: ReportRiskLevel,
    pub summary: String,
    pub contract_profile: ContractProfile,
    /// category → distinct risk titles.
    pub risk_categories: BTreeMap<String, Vec<String>>,
    pub dimension_scores: Vec<DimensionScore>,
    pub missing_items: Vec<MissingItem>,
    pub compliance_checklist: Vec<ComplianceItem>,
    pub risks: Vec<Risk>,
    pub overall_suggestions: Vec<String>,
    pub key_facts_to_confirm: Vec<String>,
    pub next_steps: Vec<String>,
    pub sign_recommendation: String,
}

/// A risk anchored to its byte position in the source text, for
/// client-side highlighting and export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub clause: String,
    pub risk: RiskLevel,
    /// Byte offset of `clause` in the source:
    /// `source[position..position + clause.len()] == clause`.
    pub position: usize,
}

// ── Map-phase results ────────────────────────────────────────────────────

/// Validated output of one chunk's extraction call.
#[derive(Debug, Clone, Default)]
pub struct ChunkAnalysis {
    pub score: u8,
    pub summary: String,
    pub risks: Vec<Risk>,
    pub key_terms: Vec<String>,
    pub suggestions: Vec<String>,
}

/// One chunk's map result, in document order. `skipped` marks the
/// neutral placeholder substituted after a chunk-level failure.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub analysis: ChunkAnalysis,
    pub skipped: bool,
}

// ── Storage / retrieval ──────────────────────────────────────────────────

/// A chunk as persisted in the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub id: i64,
    pub document_id: String,
    pub content: String,
    /// None while the embedding service was unavailable at index time.
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: i64,
    pub document_id: String,
    pub content: String,
    pub similarity: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_chunks: usize,
    pub indexed_chunks: usize,
    pub is_fully_indexed: bool,
}

/// Citation returned alongside a grounded answer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Leading 200 chars of the cited chunk.
    pub excerpt: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Mean similarity of the selected chunks; 0 when nothing matched.
    pub confidence: f32,
    pub context_tokens: usize,
}

// ── Progress events ──────────────────────────────────────────────────────

/// Stages of one analysis job. Reducer failure does not error the job;
/// it degrades to `ReducingDegraded` and still completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStage {
    Init,
    Chunking,
    Mapping,
    Reducing,
    ReducingDegraded,
    Indexing,
    Complete,
    Error,
}

impl AnalysisStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Chunking => "chunking",
            Self::Mapping => "mapping",
            Self::Reducing => "reducing",
            Self::ReducingDegraded => "reducing_degraded",
            Self::Indexing => "indexing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Emitted at each stage transition of an analysis job.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub progress: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(stage: AnalysisStage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            stage: stage.as_str().into(),
            progress,
            message: message.into(),
        }
    }
}
