//! Prompt templates for the map, reduce and retrieval calls.
//!
//! All three instruct a Chinese legal-review register; the map and
//! reduce prompts additionally demand strict JSON output.

use crate::types::{Chunk, Importance, SegmentType};

/// System prompt for per-chunk risk extraction.
pub const CHUNK_SYSTEM: &str = "\
你是一名资深中国合同审查律师。你将收到一份合同的一个片段，请仅基于该片段进行风险审查。\
要求：\n\
1. 只输出一个 JSON 对象，不要输出任何其他文字；\n\
2. JSON 结构为 {\"score\": 0-100 的整数, \"summary\": \"本片段要点概述\", \
\"risks\": [{\"level\": \"high|medium|low\", \"title\": \"风险标题\", \
\"clause\": \"原文条款引用\", \"description\": \"风险说明\", \"legalBasis\": \"法律依据\"}], \
\"keyTerms\": [\"关键术语\"], \"suggestions\": [\"修改建议\"]}；\n\
3. clause 必须逐字引用片段原文，长度 20-150 字，不得改写；\n\
4. description 不少于 100 字，说明风险成因与可能后果；\n\
5. 没有风险时 risks 为空数组，不要编造。";

/// User prompt for one chunk.
pub fn chunk_user(chunk_context: &str, content: &str) -> String {
    format!("审查要点：{chunk_context}\n\n合同片段如下：\n{content}")
}

/// System prompt for the consolidation (reduce) call.
pub fn consolidation_system(chunk_count: usize) -> String {
    format!(
        "你是一名资深中国合同审查律师，现在需要把 {chunk_count} 个片段的初审结果整合为一份完整的审查报告。\
只输出一个 JSON 对象，结构为：\n\
{{\"score\": 0-100 的整数, \"riskLevel\": \"low|medium|high|critical\", \
\"summary\": \"整体评述\", \
\"contractProfile\": {{\"contractType\": \"\", \"parties\": [], \"term\": \"\", \
\"subjectMatter\": \"\", \"payment\": \"\", \"deliveryAndAcceptance\": \"\", \
\"disputeResolution\": \"\"}}（无法确定的字段填\"未明确\"）, \
\"riskCategories\": {{\"分类\": [\"风险标题\"]}}, \
\"dimensionScores\": [{{\"dimension\": \"维度\", \"score\": 0-100, \"findings\": [], \
\"recommendations\": []}}]（不少于 8 个维度）, \
\"missingItems\": [{{\"item\": \"\", \"whyImportant\": \"\", \"suggestion\": \"\"}}], \
\"complianceChecklist\": [{{\"topic\": \"\", \"status\": \"ok|risk|missing|na\", \"notes\": \"\"}}], \
\"risks\": [{{\"level\": \"high|medium|low\", \"title\": \"\", \"clause\": \"\", \
\"description\": \"\", \"recommendation\": \"\", \"legalBasis\": \"\", \"category\": \"\"}}], \
\"overallSuggestions\": [], \"keyFactsToConfirm\": [], \"nextSteps\": [], \
\"signRecommendation\": \"可签署|修改后签署|暂缓签署|建议拒绝|需人工复核\"}}\n\
risks 中的 clause 必须保留初审中的原文引用，不得改写。"
    )
}

/// System prompt for grounded question answering.
pub fn rag_system(context: &str) -> String {
    format!(
        "你是一名合同审查助手。请仅依据下面提供的合同内容回答用户问题：\n\
1. 回答时引用相关条款原文；\n\
2. 如果提供的内容不足以回答，直接说明\"合同中未找到相关约定\"，不得推测；\n\
3. 用简洁的中文作答。\n\n\
合同内容：{context}"
    )
}

// ── Chunk context advisories ─────────────────────────────────────────────

/// Derive the per-chunk review advisory from its structure and
/// importance. An empty structure set maps to a full-review advisory.
pub fn chunk_context(chunk: &Chunk) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for kind in &chunk.segments {
        match kind {
            SegmentType::Article | SegmentType::Clause => {
                if !parts.contains(&"重点关注权利义务分配") {
                    parts.push("重点关注权利义务分配");
                }
            },
            SegmentType::Header => parts.push("注意该部分在合同整体中的地位"),
            SegmentType::Signature => parts.push("核对签署要件是否完备"),
            SegmentType::Content => {},
        }
    }
    if chunk.importance == Importance::High {
        parts.push("关键条款，需深度分析");
    }
    if chunk.has_overlap {
        parts.push("开头为上文延续，避免重复分析");
    }
    if parts.is_empty() {
        return "对本段进行全面审查".into();
    }
    parts.join("；")
}

// ── Assist actions ───────────────────────────────────────────────────────

/// (system, user) prompt pair for a lightweight assist action, or None
/// for an unknown action.
pub fn assist_prompts(action: &str, text: &str) -> Option<(String, String)> {
    let pair = match action {
        "summary" => (
            "你是一名合同审查律师。请用要点形式概述这份合同：合同类型、当事人、主要权利义务、\
             关键金额与期限、值得注意的条款。用简洁的中文输出。"
                .to_string(),
            format!("合同内容：\n{text}"),
        ),
        "extract_terms" => (
            "你是一名合同审查律师。请从合同中抽取关键要素并逐项列出：当事人、标的、价款及支付方式、\
             履行期限、违约责任、争议解决方式。找不到的项标注\"未明确\"。"
                .to_string(),
            format!("合同内容：\n{text}"),
        ),
        "translate" => (
            "你是一名法律翻译。请在中英文之间翻译下面的合同文本：中文译为英文，英文译为中文。\
             保持法律术语准确，保留条款编号与结构。"
                .to_string(),
            text.to_string(),
        ),
        "clause_compare" => (
            "你是一名合同审查律师。下面给出两段条款（以 --- 分隔）。请逐项对比两者的差异，\
             指出各自对当事人更有利/更不利之处，并给出取舍建议。"
                .to_string(),
            text.to_string(),
        ),
        _ => return None,
    };
    Some(pair)
}
