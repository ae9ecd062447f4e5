//! Token estimation and script detection for mixed CJK/Latin legal text.
//!
//! Both functions are pure and deterministic; the chunker and the RAG
//! context builder budget exclusively through them.

/// Dominant script of a text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zh => "zh",
            Self::En => "en",
        }
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Approximate LLM token count: CJK chars weigh 0.7 tokens, everything
/// else 0.25, rounded up. Empty input is 0.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut cjk = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    let rest = total - cjk;
    (cjk as f64 * 0.7 + rest as f64 * 0.25).ceil() as usize
}

/// `Zh` iff more than 30% of chars are CJK; empty input is `En`.
pub fn detect_language(text: &str) -> Language {
    let mut cjk = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    if total > 0 && cjk as f64 / total as f64 > 0.3 {
        Language::Zh
    } else {
        Language::En
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(detect_language(""), Language::En);
    }

    #[test]
    fn pure_cjk_weighs_point_seven() {
        // 10 CJK chars → ceil(7.0) = 7
        assert_eq!(estimate_tokens("甲方应当按照本合同约定"), 7);
    }

    #[test]
    fn pure_latin_weighs_quarter() {
        // 8 chars → ceil(2.0) = 2
        assert_eq!(estimate_tokens("Contract"), 2);
    }

    #[test]
    fn mixed_text_rounds_up() {
        // 2 CJK + 4 latin → ceil(1.4 + 1.0) = 3
        assert_eq!(estimate_tokens("甲方 abc"), 3);
    }

    #[test]
    fn language_threshold() {
        assert_eq!(detect_language("本合同由甲方与乙方签订"), Language::Zh);
        assert_eq!(detect_language("This Agreement is made by both parties"), Language::En);
        // Exactly 30% CJK is not enough: 3 CJK of 10 chars.
        assert_eq!(detect_language("甲乙丙abcdefg"), Language::En);
    }
}
