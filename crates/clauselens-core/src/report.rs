//! Validation and shaping of model output into [`Report`] values.
//!
//! Model JSON is deserialized into tolerant raw shapes, validated
//! per-field with safe defaults, and only then promoted into the typed
//! report. All paths end in a structurally valid report, including the
//! chunk-only aggregate used when the reducer fails.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::{
    default_category, Annotation, ChunkAnalysis, ChunkOutcome, ComplianceItem, ComplianceStatus,
    ContractProfile, DimensionScore, MissingItem, Report, ReportRiskLevel, Risk, RiskLevel,
};

pub const MIN_CLAUSE_CHARS: usize = 10;
pub const MIN_DESCRIPTION_CHARS: usize = 30;

/// Truncate to at most `max` chars (not bytes).
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn coerce_score(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_score(s: f64) -> u8 {
    s.round().clamp(0.0, 100.0) as u8
}

// ── Raw model shapes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawRisk {
    pub level: Option<String>,
    pub title: Option<String>,
    pub clause: Option<String>,
    pub description: Option<String>,
    pub recommendation: Option<String>,
    pub legal_basis: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawChunkAnalysis {
    pub score: Option<Value>,
    pub summary: Option<String>,
    pub risks: Vec<RawRisk>,
    pub key_terms: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDimensionScore {
    pub dimension: Option<String>,
    pub score: Option<Value>,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawComplianceItem {
    pub topic: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawReport {
    pub score: Option<Value>,
    pub risk_level: Option<String>,
    pub summary: Option<String>,
    pub contract_profile: Option<ContractProfile>,
    pub risk_categories: Option<BTreeMap<String, Vec<String>>>,
    pub dimension_scores: Vec<RawDimensionScore>,
    pub missing_items: Vec<MissingItem>,
    pub compliance_checklist: Vec<RawComplianceItem>,
    pub risks: Vec<RawRisk>,
    pub overall_suggestions: Vec<String>,
    pub key_facts_to_confirm: Vec<String>,
    pub next_steps: Vec<String>,
    pub sign_recommendation: Option<String>,
}

// ── Risk validation ──────────────────────────────────────────────────────

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Map-phase validation: invalid levels coerce to low, clauses under
/// 10 chars drop the risk, short descriptions are kept with a warning.
pub fn validate_chunk_risk(raw: RawRisk) -> Option<Risk> {
    let clause = non_empty(raw.clause)?;
    if clause.chars().count() < MIN_CLAUSE_CHARS {
        warn!(clause = %clause, "dropping risk: clause quotation under {MIN_CLAUSE_CHARS} chars");
        return None;
    }
    let level = raw
        .level
        .as_deref()
        .and_then(RiskLevel::parse)
        .unwrap_or(RiskLevel::Low);
    let title = non_empty(raw.title).unwrap_or_else(|| "未命名风险".into());
    let description = non_empty(raw.description).unwrap_or_default();
    if description.chars().count() < MIN_DESCRIPTION_CHARS {
        warn!(title = %title, "risk description under {MIN_DESCRIPTION_CHARS} chars, quality degraded");
    }
    Some(Risk {
        level,
        title,
        clause,
        description,
        recommendation: non_empty(raw.recommendation),
        legal_basis: non_empty(raw.legal_basis),
        category: non_empty(raw.category).unwrap_or_else(default_category),
    })
}

/// Report-level bar: short descriptions are rejected outright.
pub fn meets_report_bar(risk: &Risk) -> bool {
    risk.clause.trim().chars().count() >= MIN_CLAUSE_CHARS
        && risk.description.trim().chars().count() >= MIN_DESCRIPTION_CHARS
}

/// Deduplicate by `(title, clause[..50])`, first seen wins, then sort
/// high → medium → low preserving first occurrence within a level.
pub fn dedup_and_sort_risks(risks: Vec<Risk>) -> Vec<Risk> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out: Vec<Risk> = Vec::new();
    for r in risks {
        let key = (r.title.clone(), truncate_chars(&r.clause, 50));
        if seen.insert(key) {
            out.push(r);
        }
    }
    out.sort_by_key(|r| r.level);
    out
}

/// category → distinct titles, in risk order.
pub fn group_risk_categories(risks: &[Risk]) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for r in risks {
        let titles = map.entry(r.category.clone()).or_default();
        if !titles.contains(&r.title) {
            titles.push(r.title.clone());
        }
    }
    map
}

/// Score-band fallback wording for the signing recommendation.
pub fn sign_recommendation_for(score: u8) -> String {
    if score >= 70 {
        "建议人工复核后签署".into()
    } else if score >= 50 {
        "建议修改后签署".into()
    } else {
        "建议暂缓签署".into()
    }
}

// ── Chunk analysis parsing ───────────────────────────────────────────────

/// Parse and validate one chunk's JSON reply.
pub fn parse_chunk_analysis(value: Value) -> ChunkAnalysis {
    let raw: RawChunkAnalysis = serde_json::from_value(value).unwrap_or_default();
    let score = raw
        .score
        .as_ref()
        .and_then(coerce_score)
        .map(clamp_score)
        .unwrap_or(50);
    ChunkAnalysis {
        score,
        summary: raw.summary.unwrap_or_default(),
        risks: raw.risks.into_iter().filter_map(validate_chunk_risk).collect(),
        key_terms: raw.key_terms,
        suggestions: raw.suggestions,
    }
}

/// Neutral placeholder substituted when a chunk's call fails, so the
/// reduce phase never starves.
pub fn skipped_chunk_analysis() -> ChunkAnalysis {
    ChunkAnalysis {
        score: 50,
        summary: "该片段分析跳过".into(),
        risks: Vec::new(),
        key_terms: Vec::new(),
        suggestions: Vec::new(),
    }
}

// ── Report shaping ───────────────────────────────────────────────────────

fn mean_chunk_score(outcomes: &[ChunkOutcome]) -> u8 {
    let scores: Vec<f64> = outcomes
        .iter()
        .filter(|o| !o.skipped)
        .map(|o| o.analysis.score as f64)
        .collect();
    if scores.is_empty() {
        50
    } else {
        clamp_score(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

fn chunk_level_risks(outcomes: &[ChunkOutcome]) -> Vec<Risk> {
    let all: Vec<Risk> = outcomes
        .iter()
        .flat_map(|o| o.analysis.risks.iter().cloned())
        .filter(meets_report_bar)
        .collect();
    dedup_and_sort_risks(all)
}

fn validate_dimensions(raw: Vec<RawDimensionScore>) -> Vec<DimensionScore> {
    raw.into_iter()
        .filter_map(|d| {
            let dimension = non_empty(d.dimension)?;
            let score = d.score.as_ref().and_then(coerce_score).map(clamp_score)?;
            Some(DimensionScore {
                dimension,
                score,
                findings: d.findings,
                recommendations: d.recommendations,
            })
        })
        .collect()
}

fn validate_compliance(raw: Vec<RawComplianceItem>) -> Vec<ComplianceItem> {
    raw.into_iter()
        .filter_map(|c| {
            let topic = non_empty(c.topic)?;
            let status = match c.status.as_deref().map(str::trim) {
                Some("ok") => ComplianceStatus::Ok,
                Some("risk") => ComplianceStatus::Risk,
                Some("missing") => ComplianceStatus::Missing,
                _ => ComplianceStatus::Na,
            };
            Some(ComplianceItem { topic, status, notes: non_empty(c.notes) })
        })
        .collect()
}

/// Shape the reducer's JSON into the final report, falling back to the
/// chunk-level union wherever the model under-delivered.
pub fn normalize_report(raw: RawReport, outcomes: &[ChunkOutcome]) -> Report {
    let score = raw
        .score
        .as_ref()
        .and_then(coerce_score)
        .map(clamp_score)
        .unwrap_or_else(|| mean_chunk_score(outcomes));

    let risk_level = raw
        .risk_level
        .as_deref()
        .and_then(ReportRiskLevel::parse)
        .unwrap_or_else(|| ReportRiskLevel::from_score(score));

    let model_risks: Vec<Risk> = raw
        .risks
        .into_iter()
        .filter_map(validate_chunk_risk)
        .filter(|r| meets_report_bar(r))
        .collect();
    let risks = if model_risks.is_empty() {
        chunk_level_risks(outcomes)
    } else {
        dedup_and_sort_risks(model_risks)
    };

    let risk_categories = match raw.risk_categories {
        Some(m) if !m.is_empty() => m,
        _ => group_risk_categories(&risks),
    };

    let sign_recommendation = raw
        .sign_recommendation
        .and_then(non_empty_string)
        .unwrap_or_else(|| sign_recommendation_for(score));

    Report {
        score,
        risk_level,
        summary: raw.summary.unwrap_or_else(|| summary_from_outcomes(outcomes, risks.len())),
        contract_profile: raw.contract_profile.unwrap_or_default(),
        risk_categories,
        dimension_scores: validate_dimensions(raw.dimension_scores),
        missing_items: raw.missing_items,
        compliance_checklist: validate_compliance(raw.compliance_checklist),
        risks,
        overall_suggestions: raw.overall_suggestions,
        key_facts_to_confirm: raw.key_facts_to_confirm,
        next_steps: raw.next_steps,
        sign_recommendation,
    }
}

fn non_empty_string(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn summary_from_outcomes(outcomes: &[ChunkOutcome], risk_count: usize) -> String {
    let mut summary = format!("共分析 {} 个片段，识别 {} 个风险点。", outcomes.len(), risk_count);
    let highlights: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.skipped && !o.analysis.summary.trim().is_empty())
        .map(|o| o.analysis.summary.trim())
        .take(3)
        .collect();
    if !highlights.is_empty() {
        summary.push_str("要点：");
        summary.push_str(&highlights.join("；"));
        summary.push('。');
    }
    summary
}

/// Degraded reduce path: a report assembled purely from chunk outputs.
/// Never fails; an empty outcome list still yields a valid report.
pub fn aggregate_report(outcomes: &[ChunkOutcome]) -> Report {
    let score = mean_chunk_score(outcomes);
    let risks = chunk_level_risks(outcomes);
    let risk_categories = group_risk_categories(&risks);

    let mut suggestions: Vec<String> = Vec::new();
    for o in outcomes.iter().filter(|o| !o.skipped) {
        for s in &o.analysis.suggestions {
            if !suggestions.contains(s) {
                suggestions.push(s.clone());
            }
        }
    }

    Report {
        score,
        risk_level: ReportRiskLevel::from_score(score),
        summary: summary_from_outcomes(outcomes, risks.len()),
        contract_profile: ContractProfile::default(),
        risk_categories,
        dimension_scores: Vec::new(),
        missing_items: Vec::new(),
        compliance_checklist: Vec::new(),
        risks,
        overall_suggestions: suggestions,
        key_facts_to_confirm: Vec::new(),
        next_steps: Vec::new(),
        sign_recommendation: sign_recommendation_for(score),
    }
}

// ── Annotations ──────────────────────────────────────────────────────────

/// Anchor each risk's clause at its first occurrence in the source.
/// Risks whose quotation does not appear verbatim are skipped.
pub fn annotate(source: &str, risks: &[Risk]) -> Vec<Annotation> {
    let mut out = Vec::new();
    for r in risks {
        let clause = r.clause.trim();
        if clause.is_empty() {
            continue;
        }
        if let Some(position) = source.find(clause) {
            out.push(Annotation {
                id: format!("anno-{}", out.len() + 1),
                clause: clause.to_string(),
                risk: r.level,
                position,
            });
        }
    }
    out
}

// ── Plain-text rendering ─────────────────────────────────────────────────

fn level_zh(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::High => "高",
        RiskLevel::Medium => "中",
        RiskLevel::Low => "低",
    }
}

fn report_level_zh(level: ReportRiskLevel) -> &'static str {
    match level {
        ReportRiskLevel::Low => "低",
        ReportRiskLevel::Medium => "中",
        ReportRiskLevel::High => "高",
        ReportRiskLevel::Critical => "严重",
    }
}

/// Render the report as formatted text for the export endpoint.
pub fn render_report_text(report: &Report, file_name: &str) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "合同审查报告：{file_name}");
    let _ = writeln!(out, "{}", "=".repeat(40));
    let _ = writeln!(
        out,
        "综合评分：{} / 100　风险等级：{}　签署建议：{}",
        report.score,
        report_level_zh(report.risk_level),
        report.sign_recommendation
    );
    let _ = writeln!(out, "\n一、总体评述\n{}", report.summary);

    let p = &report.contract_profile;
    let _ = writeln!(out, "\n二、合同概况");
    let _ = writeln!(out, "合同类型：{}", p.contract_type);
    let _ = writeln!(
        out,
        "当事人：{}",
        if p.parties.is_empty() { "未明确".to_string() } else { p.parties.join("、") }
    );
    let _ = writeln!(out, "合同期限：{}", p.term);
    let _ = writeln!(out, "标的：{}", p.subject_matter);
    let _ = writeln!(out, "价款与支付：{}", p.payment);
    let _ = writeln!(out, "交付与验收：{}", p.delivery_and_acceptance);
    let _ = writeln!(out, "争议解决：{}", p.dispute_resolution);

    let _ = writeln!(out, "\n三、风险清单（共 {} 项）", report.risks.len());
    for (i, r) in report.risks.iter().enumerate() {
        let _ = writeln!(out, "{}. [{}] {}", i + 1, level_zh(r.level), r.title);
        let _ = writeln!(out, "   条款：{}", r.clause);
        let _ = writeln!(out, "   说明：{}", r.description);
        if let Some(rec) = &r.recommendation {
            let _ = writeln!(out, "   建议：{rec}");
        }
        if let Some(basis) = &r.legal_basis {
            let _ = writeln!(out, "   依据：{basis}");
        }
    }

    if !report.dimension_scores.is_empty() {
        let _ = writeln!(out, "\n四、维度评分");
        for d in &report.dimension_scores {
            let _ = writeln!(out, "- {}：{} 分", d.dimension, d.score);
        }
    }

    if !report.missing_items.is_empty() {
        let _ = writeln!(out, "\n五、缺失条款");
        for m in &report.missing_items {
            let _ = writeln!(out, "- {}", m.item);
            if let Some(why) = &m.why_important {
                let _ = writeln!(out, "  重要性：{why}");
            }
            if let Some(s) = &m.suggestion {
                let _ = writeln!(out, "  建议：{s}");
            }
        }
    }

    if !report.compliance_checklist.is_empty() {
        let _ = writeln!(out, "\n六、合规检查");
        for c in &report.compliance_checklist {
            let status = match c.status {
                ComplianceStatus::Ok => "通过",
                ComplianceStatus::Risk => "存在风险",
                ComplianceStatus::Missing => "缺失",
                ComplianceStatus::Na => "不适用",
            };
            let _ = writeln!(out, "- {}：{}", c.topic, status);
            if let Some(n) = &c.notes {
                let _ = writeln!(out, "  备注：{n}");
            }
        }
    }

    if !report.overall_suggestions.is_empty() {
        let _ = writeln!(out, "\n七、总体建议");
        for s in &report.overall_suggestions {
            let _ = writeln!(out, "- {s}");
        }
    }
    if !report.key_facts_to_confirm.is_empty() {
        let _ = writeln!(out, "\n八、待确认事实");
        for s in &report.key_facts_to_confirm {
            let _ = writeln!(out, "- {s}");
        }
    }
    if !report.next_steps.is_empty() {
        let _ = writeln!(out, "\n九、后续步骤");
        for s in &report.next_steps {
            let _ = writeln!(out, "- {s}");
        }
    }
    out
}
