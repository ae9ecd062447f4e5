mod common;

use std::sync::Arc;

use clauselens_core::analysis::Analyzer;
use clauselens_core::chunker::ChunkerConfig;
use clauselens_core::types::{ReportRiskLevel, RiskLevel};
use common::{FakeModel, ReduceMode};
use serde_json::{json, Value};

/// Three article sections, sized so each becomes its own chunk under
/// the test chunker configuration.
const CONTRACT: &str = "\
第一条 保密条款
甲方与乙方均应对在合作过程中知悉的对方商业秘密承担保密义务，未经对方书面同意不得向任何第三方披露，保密期限为本合同终止后五年。
第二条 违约条款
任何一方违反本合同约定给对方造成损失的，应当赔偿对方因此遭受的全部直接经济损失，并支付合同总价百分之二十的违约金。
第三条 争议条款
因本合同引起的或与本合同有关的任何争议，双方应当首先友好协商解决；协商不成的，任何一方均可向合同签订地有管辖权的人民法院提起诉讼。
";

fn test_chunker() -> ChunkerConfig {
    ChunkerConfig {
        max_chunk_tokens: 70,
        overlap_tokens: 0,
        min_chunk_tokens: 10,
    }
}

/// Chunk replies keyed off the fragment content: the confidentiality
/// section scores 80, the dispute section 60, the breach section 70.
fn scripted_chunk_reply(user: &str) -> Value {
    if user.contains("保密") {
        json!({
            "score": 80,
            "summary": "保密义务约定总体完备",
            "risks": [{
                "level": "high",
                "title": "保密期限过长",
                "clause": "保密期限为本合同终止后五年",
                "description": "五年的保密期限超出同类交易的通常约定，长期合规成本完全由一方承担，建议缩短或增加例外情形。",
                "legalBasis": "《民法典》第五百零一条"
            }],
            "keyTerms": ["商业秘密"],
            "suggestions": ["缩短保密期限"]
        })
    } else if user.contains("争议") {
        json!({
            "score": 60,
            "summary": "争议解决条款存在管辖不利",
            "risks": [{
                "level": "medium",
                "title": "管辖约定不利",
                "clause": "任何一方均可向合同签订地有管辖权的人民法院提起诉讼",
                "description": "合同签订地由对方安排，实际诉讼成本将显著增加，建议改为被告住所地或约定仲裁以平衡双方负担。"
            }],
            "keyTerms": [],
            "suggestions": ["改为仲裁"]
        })
    } else {
        json!({
            "score": 70,
            "summary": "违约责任基本均衡",
            "risks": [{
                "level": "low",
                "title": "违约金比例偏高",
                "clause": "并支付合同总价百分之二十的违约金",
                "description": "百分之二十的违约金高于通常裁判尺度，若实际损失明显低于该比例，法院可能应请求予以酌减。"
            }],
            "keyTerms": [],
            "suggestions": []
        })
    }
}

fn analyzer(model: FakeModel) -> Analyzer {
    Analyzer::new(Arc::new(model))
        .with_chunker(test_chunker())
        .with_map_concurrency(3)
}

// ── Map fallback ─────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_chunk_becomes_placeholder_and_job_completes() {
    let model = FakeModel {
        fail_chunk_containing: Some("违约条款".into()),
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let report = analyzer(model).analyze(CONTRACT, "doc-1", None).await;

    // Mean of the two successful chunk scores (80 and 60).
    assert_eq!(report.score, 70);
    assert!(!report.summary.contains("分析失败"));
    assert!(!report.summary.contains("网络连接"));

    let titles: Vec<&str> = report.risks.iter().map(|r| r.title.as_str()).collect();
    assert!(titles.contains(&"保密期限过长"));
    assert!(titles.contains(&"管辖约定不利"));
    assert!(!titles.iter().any(|t| t.contains("违约金")));
}

// ── Reducer degradation ──────────────────────────────────────────────────

#[tokio::test]
async fn reducer_failure_degrades_to_chunk_aggregate() {
    let model = FakeModel {
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let report = analyzer(model).analyze(CONTRACT, "doc-2", None).await;

    // Mean of 80, 70, 60.
    assert_eq!(report.score, 70);
    assert_eq!(report.risk_level, ReportRiskLevel::from_score(report.score));
    assert_eq!(report.sign_recommendation, "建议人工复核后签署");
    assert!(!report.risks.is_empty());

    // Sorted high → medium → low.
    assert_eq!(report.risks[0].level, RiskLevel::High);
    assert_eq!(report.risks.last().unwrap().level, RiskLevel::Low);

    // Categories populated by grouping on the default category.
    let other = report.risk_categories.get("other").expect("grouped categories");
    assert!(other.contains(&"保密期限过长".to_string()));

    // Chunk suggestions flow into the aggregate.
    assert!(report.overall_suggestions.contains(&"缩短保密期限".to_string()));
}

// ── Risk validation in the map phase ─────────────────────────────────────

#[tokio::test]
async fn short_clause_risks_never_reach_the_report() {
    let model = FakeModel {
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(|user| {
            let mut reply = scripted_chunk_reply(user);
            reply["risks"].as_array_mut().unwrap().push(json!({
                "level": "high",
                "title": "无效风险",
                "clause": "太短",
                "description": "clause 不足十个字符的风险必须在校验阶段被拒绝，即使描述本身足够长也不能例外。"
            }));
            reply
        }),
        ..Default::default()
    };
    let report = analyzer(model).analyze(CONTRACT, "doc-3", None).await;
    assert!(report.risks.iter().all(|r| r.title != "无效风险"));
    assert!(report.risks.iter().all(|r| r.clause.chars().count() >= 10));
    assert!(report
        .risks
        .iter()
        .all(|r| r.description.chars().count() >= 30));
}

// ── Reducer normalization ────────────────────────────────────────────────

#[tokio::test]
async fn reducer_output_is_normalized() {
    let model = FakeModel {
        reduce: ReduceMode::Echo(json!({
            "score": 150,
            "riskLevel": "extreme",
            "summary": "整体风险偏高",
            "risks": [],
            "signRecommendation": ""
        })),
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let report = analyzer(model).analyze(CONTRACT, "doc-4", None).await;

    // Score clamps to 100; invalid level re-derives from the band.
    assert_eq!(report.score, 100);
    assert_eq!(report.risk_level, ReportRiskLevel::Low);
    assert_eq!(report.summary, "整体风险偏高");

    // Empty model risks fall back to the validated chunk-level union.
    assert!(!report.risks.is_empty());
    assert!(report.risks.iter().any(|r| r.title == "保密期限过长"));

    // Omitted categories derive by grouping; blank recommendation
    // falls back to the score band.
    assert!(report.risk_categories.contains_key("other"));
    assert_eq!(report.sign_recommendation, "建议人工复核后签署");
}

#[tokio::test]
async fn valid_model_risk_level_wins_over_band() {
    let model = FakeModel {
        reduce: ReduceMode::Echo(json!({
            "score": 85,
            "riskLevel": "critical",
            "summary": "模型自评为重大风险",
            "risks": []
        })),
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let report = analyzer(model).analyze(CONTRACT, "doc-5", None).await;
    assert_eq!(report.score, 85);
    assert_eq!(report.risk_level, ReportRiskLevel::Critical);
}

// ── Empty input ──────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_text_still_yields_a_valid_report() {
    let model = FakeModel {
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let report = analyzer(model).analyze("", "doc-6", None).await;
    assert_eq!(report.score, 50);
    assert!(report.risks.is_empty());
    assert!(report.summary.contains("0 个"));
}

// ── Concurrency bound ────────────────────────────────────────────────────

#[tokio::test]
async fn map_phase_respects_the_concurrency_bound() {
    let model = FakeModel {
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(scripted_chunk_reply),
        chunk_delay_ms: 30,
        ..Default::default()
    };
    let max_active = Arc::clone(&model.max_active);

    let mut text = String::new();
    for header in ["第一条", "第二条", "第三条", "第四条", "第五条", "第六条"] {
        text.push_str(header);
        text.push_str(" 保密条款\n");
        text.push_str(
            "甲方与乙方均应对在合作过程中知悉的对方商业秘密承担保密义务，未经对方书面同意不得向任何第三方披露。\n",
        );
    }

    let report = analyzer(model).analyze(&text, "doc-7", None).await;
    assert!(!report.risks.is_empty());
    let peak = max_active.load(std::sync::atomic::Ordering::SeqCst);
    assert!(peak <= 3, "map concurrency exceeded: {peak}");
}

// ── Progress events ──────────────────────────────────────────────────────

async fn collect_stages(model: FakeModel) -> (Vec<String>, u8) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _report = analyzer(model).analyze(CONTRACT, "doc-8", Some(&tx)).await;
    drop(tx);

    let mut stages = Vec::new();
    let mut last_progress = 0u8;
    while let Ok(ev) = rx.try_recv() {
        if stages.last().map(String::as_str) != Some(ev.stage.as_str()) {
            stages.push(ev.stage.clone());
        }
        assert!(ev.progress <= 100);
        last_progress = ev.progress;
    }
    (stages, last_progress)
}

#[tokio::test]
async fn progress_events_cover_every_stage_transition() {
    let model = FakeModel {
        reduce: ReduceMode::Fail,
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let (stages, last_progress) = collect_stages(model).await;
    // Reducer failure passes through the degraded stage and still
    // reaches the terminal transition.
    assert_eq!(
        stages,
        vec![
            "init",
            "chunking",
            "mapping",
            "reducing",
            "reducing_degraded",
            "indexing",
            "complete"
        ]
    );
    assert_eq!(last_progress, 100);
}

#[tokio::test]
async fn successful_reduce_completes_without_degraded_stage() {
    let model = FakeModel {
        reduce: ReduceMode::Echo(json!({ "score": 80, "summary": "整体可控", "risks": [] })),
        chunk_reply: Box::new(scripted_chunk_reply),
        ..Default::default()
    };
    let (stages, last_progress) = collect_stages(model).await;
    assert_eq!(
        stages,
        vec!["init", "chunking", "mapping", "reducing", "indexing", "complete"]
    );
    assert_eq!(last_progress, 100);
}
