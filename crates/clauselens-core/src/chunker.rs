//! Structure-aware chunker for legal prose.
//!
//! Lines are classified against per-language pattern sets (articles,
//! numbered clauses, headers, signature blocks) and grouped into
//! segments; segments are packed into chunks under a token budget with
//! sentence-level splitting for oversize segments and a tail-overlap
//! prefix across chunk boundaries. Output is deterministic for
//! identical input and configuration.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::tokens::{detect_language, estimate_tokens, Language};
use crate::types::{Chunk, Importance, SegmentType};

/// Marker prepended to overlap-seeded chunks.
pub const OVERLAP_MARKER: &str = "[上文续] ";

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub min_chunk_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 6000,
            overlap_tokens: 300,
            min_chunk_tokens: 800,
        }
    }
}

// ── Line classification ──────────────────────────────────────────────────

static ZH_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^第[0-9０-９一二三四五六七八九十百千零两]+[条章节款项]").unwrap());
static ZH_NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[（(【\[]?[一二三四五六七八九十0-9]+[、．.）)]").unwrap());
static ZH_SUB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[①②③④⑤⑥⑦⑧⑨⑩]|[0-9]+[、．.）)])").unwrap());
static ZH_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:【[^】]+】|《[^》]+》|〔[^〕]+〕)$").unwrap());

const ZH_SIGNATURE_PREFIXES: &[&str] =
    &["甲方", "乙方", "丙方", "签章", "签字", "盖章", "日期", "地址"];

static EN_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:article|section)\s*[\d.]+").unwrap());
static EN_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());
static EN_SUB: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\(?[a-z]\)").unwrap());

const EN_SIGNATURE_PREFIXES: &[&str] =
    &["IN WITNESS WHEREOF", "EXECUTED", "Signature", "Date", "Address"];

fn is_en_header(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty()
        && t.chars().any(|c| c.is_ascii_alphabetic())
        && !t.chars().any(|c| c.is_lowercase())
}

fn classify_line(line: &str, lang: Language) -> Option<(SegmentType, Importance)> {
    match lang {
        Language::Zh => {
            if ZH_ARTICLE.is_match(line) {
                Some((SegmentType::Article, Importance::High))
            } else if ZH_NUMBERED.is_match(line) || ZH_SUB.is_match(line) {
                Some((SegmentType::Clause, Importance::High))
            } else if ZH_HEADER.is_match(line.trim()) {
                Some((SegmentType::Header, Importance::High))
            } else if ZH_SIGNATURE_PREFIXES.iter().any(|p| line.starts_with(p)) {
                Some((SegmentType::Signature, Importance::Low))
            } else {
                None
            }
        },
        Language::En => {
            if EN_ARTICLE.is_match(line) {
                Some((SegmentType::Article, Importance::High))
            } else if EN_NUMBERED.is_match(line) || EN_SUB.is_match(line) {
                Some((SegmentType::Clause, Importance::High))
            } else if is_en_header(line) {
                Some((SegmentType::Header, Importance::High))
            } else if EN_SIGNATURE_PREFIXES.iter().any(|p| line.starts_with(p)) {
                Some((SegmentType::Signature, Importance::Low))
            } else {
                None
            }
        },
    }
}

// ── Segments ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Segment {
    content: String,
    kind: SegmentType,
    importance: Importance,
}

fn close_segment(seg: Option<Segment>, out: &mut Vec<Segment>) {
    if let Some(mut seg) = seg {
        let trimmed = seg.content.trim_end().len();
        seg.content.truncate(trimmed);
        if !seg.content.is_empty() {
            out.push(seg);
        }
    }
}

/// Walk lines: a structural line starts a new segment; other non-empty
/// lines extend the current one; empty lines insert a newline.
fn build_segments(text: &str, lang: Language) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut current: Option<Segment> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            if let Some(seg) = current.as_mut() {
                seg.content.push('\n');
            }
            continue;
        }
        match classify_line(line, lang) {
            Some((kind, importance)) => {
                close_segment(current.take(), &mut segments);
                current = Some(Segment {
                    content: line.to_string(),
                    kind,
                    importance,
                });
            },
            None => match current.as_mut() {
                Some(seg) => {
                    seg.content.push('\n');
                    seg.content.push_str(line);
                },
                None => {
                    current = Some(Segment {
                        content: line.to_string(),
                        kind: SegmentType::Content,
                        importance: Importance::Normal,
                    });
                },
            },
        }
    }
    close_segment(current, &mut segments);
    segments
}

// ── Sentence splitting ───────────────────────────────────────────────────

const ZH_TERMINATORS: &[char] = &['。', '！', '？', '；', ';', '!', '?'];
const EN_TERMINATORS: &[char] = &['.', '!', '?', ';'];

/// Split into sentences, keeping terminators. zh splits after any
/// terminator; en splits after a terminator followed by whitespace
/// (the whitespace is consumed).
fn split_sentences(text: &str, lang: Language) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();

    match lang {
        Language::Zh => {
            for c in text.chars() {
                cur.push(c);
                if ZH_TERMINATORS.contains(&c) {
                    out.push(std::mem::take(&mut cur));
                }
            }
        },
        Language::En => {
            let mut chars = text.chars().peekable();
            while let Some(c) = chars.next() {
                cur.push(c);
                if EN_TERMINATORS.contains(&c) {
                    let mut saw_ws = false;
                    while chars.peek().is_some_and(|n| n.is_whitespace()) {
                        chars.next();
                        saw_ws = true;
                    }
                    if saw_ws || chars.peek().is_none() {
                        out.push(std::mem::take(&mut cur));
                    }
                }
            }
        },
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out.retain(|s| !s.trim().is_empty());
    out
}

fn sentence_joiner(lang: Language) -> &'static str {
    match lang {
        Language::Zh => "",
        Language::En => " ",
    }
}

/// Break a single sentence that alone exceeds the budget into
/// char-windows that fit. Rare; long run-on boilerplate only.
fn hard_wrap(sentence: &str, max_tokens: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for c in sentence.chars() {
        cur.push(c);
        if estimate_tokens(&cur) >= max_tokens {
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

// ── Overlap extraction ───────────────────────────────────────────────────

/// Tail of the previous chunk: whole sentences from the text after its
/// last blank line, accumulated backwards until `overlap_tokens` is
/// reached. Staying after the last blank line keeps the tail a verbatim
/// suffix with no internal paragraph break.
fn overlap_tail(prev: &str, lang: Language, overlap_tokens: usize) -> String {
    if overlap_tokens == 0 {
        return String::new();
    }
    let base = match prev.rfind("\n\n") {
        Some(i) => &prev[i + 2..],
        None => prev,
    };
    let sentences = split_sentences(base, lang);
    let mut taken: Vec<&str> = Vec::new();
    let mut tokens = 0usize;
    for s in sentences.iter().rev() {
        if tokens >= overlap_tokens {
            break;
        }
        taken.push(s);
        tokens += estimate_tokens(s);
    }
    taken.reverse();
    taken.join(sentence_joiner(lang))
}

// ── Chunk accumulation ───────────────────────────────────────────────────

#[derive(Default)]
struct Builder {
    content: String,
    segments: Vec<SegmentType>,
    has_high: bool,
    has_overlap: bool,
}

impl Builder {
    fn seeded(seed: String) -> Self {
        Self {
            content: seed,
            segments: Vec::new(),
            has_high: false,
            has_overlap: true,
        }
    }

    fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    fn tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    fn would_fit(&self, seg_content: &str, max: usize) -> bool {
        // Blank-line separator, counted conservatively.
        let sep = if self.content.is_empty() { 0 } else { 1 };
        estimate_tokens(&self.content) + estimate_tokens(seg_content) + sep <= max
    }

    fn push_segment(&mut self, seg: &Segment) {
        if !self.content.is_empty() {
            self.content.push_str("\n\n");
        }
        self.content.push_str(&seg.content);
        if !self.segments.contains(&seg.kind) {
            self.segments.push(seg.kind);
        }
        if seg.importance == Importance::High {
            self.has_high = true;
        }
    }

    fn importance(&self) -> Importance {
        if self.has_high {
            Importance::High
        } else if !self.segments.is_empty()
            && self.segments.iter().all(|s| *s == SegmentType::Signature)
        {
            Importance::Low
        } else {
            Importance::Normal
        }
    }

    fn into_chunk(self) -> Chunk {
        let token_estimate = estimate_tokens(&self.content);
        let importance = self.importance();
        Chunk {
            token_estimate,
            importance,
            segments: self.segments,
            has_overlap: self.has_overlap,
            content: self.content,
            chunk_index: 0,
        }
    }
}

fn make_chunk(content: String, kind: SegmentType, importance: Importance, has_overlap: bool) -> Chunk {
    Chunk {
        token_estimate: estimate_tokens(&content),
        segments: vec![kind],
        importance,
        has_overlap,
        content,
        chunk_index: 0,
    }
}

/// Greedily pack the sentences of an oversize segment into sub-chunks,
/// seeding each boundary with an overlap tail when it fits.
fn split_oversize_segment(
    seg: &Segment,
    lang: Language,
    cfg: &ChunkerConfig,
    chunks: &mut Vec<Chunk>,
) {
    let joiner = sentence_joiner(lang);
    let mut pieces: Vec<String> = Vec::new();
    for s in split_sentences(&seg.content, lang) {
        if estimate_tokens(&s) > cfg.max_chunk_tokens {
            pieces.extend(hard_wrap(&s, cfg.max_chunk_tokens));
        } else {
            pieces.push(s);
        }
    }

    let mut cur = String::new();
    let mut has_overlap = false;

    for piece in pieces {
        let sep = if cur.is_empty() { "" } else { joiner };
        let over = !cur.is_empty()
            && estimate_tokens(&cur) + estimate_tokens(sep) + estimate_tokens(&piece)
                > cfg.max_chunk_tokens;

        if over {
            let emitted = std::mem::take(&mut cur);
            let tail = overlap_tail(&emitted, lang, cfg.overlap_tokens);
            chunks.push(make_chunk(emitted, seg.kind, seg.importance, has_overlap));
            has_overlap = false;
            if !tail.is_empty() {
                let seed = format!("{OVERLAP_MARKER}{tail}");
                if estimate_tokens(&seed) + estimate_tokens(&piece) + 1 <= cfg.max_chunk_tokens {
                    cur = seed;
                    // Blank line between the seed and the fresh text.
                    cur.push_str("\n\n");
                    has_overlap = true;
                }
            }
            cur.push_str(&piece);
            continue;
        }

        cur.push_str(sep);
        cur.push_str(&piece);
    }

    if !cur.is_empty() {
        chunks.push(make_chunk(cur, seg.kind, seg.importance, has_overlap));
    }
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Chunk with default configuration.
pub fn chunk(text: &str) -> Vec<Chunk> {
    chunk_with(text, &ChunkerConfig::default())
}

pub fn chunk_with(text: &str, cfg: &ChunkerConfig) -> Vec<Chunk> {
    let lang = detect_language(text);
    let segments = build_segments(text, lang);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut cur = Builder::default();

    for seg in &segments {
        let seg_tokens = estimate_tokens(&seg.content);

        if seg_tokens > cfg.max_chunk_tokens {
            if !cur.is_empty() {
                chunks.push(std::mem::take(&mut cur).into_chunk());
            }
            split_oversize_segment(seg, lang, cfg, &mut chunks);
            continue;
        }

        if cur.is_empty() || cur.would_fit(&seg.content, cfg.max_chunk_tokens) {
            cur.push_segment(seg);
            continue;
        }

        // Flush and start a new chunk seeded with the flushed tail,
        // unless the seed would push the next segment over budget.
        let flushed = std::mem::take(&mut cur).into_chunk();
        let tail = overlap_tail(&flushed.content, lang, cfg.overlap_tokens);
        chunks.push(flushed);
        if !tail.is_empty() {
            let seed = format!("{OVERLAP_MARKER}{tail}");
            if estimate_tokens(&seed) + seg_tokens + 1 <= cfg.max_chunk_tokens {
                cur = Builder::seeded(seed);
            }
        }
        cur.push_segment(seg);
    }

    // Final flush: small residuals merge back into the previous chunk.
    if !cur.is_empty() {
        if cur.tokens() >= cfg.min_chunk_tokens || chunks.is_empty() {
            chunks.push(cur.into_chunk());
        } else {
            let last = chunks.last_mut().expect("non-empty");
            last.content.push_str("\n\n");
            last.content.push_str(&cur.content);
            last.token_estimate = estimate_tokens(&last.content);
            for kind in cur.segments {
                if !last.segments.contains(&kind) {
                    last.segments.push(kind);
                }
            }
            if cur.has_high {
                last.importance = Importance::High;
            }
        }
    }

    for (i, c) in chunks.iter_mut().enumerate() {
        c.chunk_index = i;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zh_article_line_is_structural() {
        assert_eq!(
            classify_line("第一条 保密义务", Language::Zh),
            Some((SegmentType::Article, Importance::High))
        );
        assert_eq!(
            classify_line("第十二章 附则", Language::Zh),
            Some((SegmentType::Article, Importance::High))
        );
    }

    #[test]
    fn zh_numbered_and_sub_clauses() {
        assert_eq!(
            classify_line("（一）合同标的", Language::Zh),
            Some((SegmentType::Clause, Importance::High))
        );
        assert_eq!(
            classify_line("1、付款方式", Language::Zh),
            Some((SegmentType::Clause, Importance::High))
        );
        assert_eq!(
            classify_line("  ①乙方应当", Language::Zh),
            Some((SegmentType::Clause, Importance::High))
        );
    }

    #[test]
    fn zh_signature_lines_are_low_importance() {
        assert_eq!(
            classify_line("甲方（盖章）：", Language::Zh),
            Some((SegmentType::Signature, Importance::Low))
        );
        assert_eq!(
            classify_line("日期：2024年1月1日", Language::Zh),
            Some((SegmentType::Signature, Importance::Low))
        );
    }

    #[test]
    fn en_patterns() {
        assert_eq!(
            classify_line("Article 12. Confidentiality", Language::En),
            Some((SegmentType::Article, Importance::High))
        );
        assert_eq!(
            classify_line("3) Payment terms", Language::En),
            Some((SegmentType::Clause, Importance::High))
        );
        assert_eq!(
            classify_line("(a) each party shall", Language::En),
            Some((SegmentType::Clause, Importance::High))
        );
        assert_eq!(
            classify_line("b) bare letter form", Language::En),
            Some((SegmentType::Clause, Importance::High))
        );
        assert_eq!(
            classify_line("GOVERNING LAW", Language::En),
            Some((SegmentType::Header, Importance::High))
        );
        assert_eq!(
            classify_line("IN WITNESS WHEREOF, the parties execute", Language::En),
            Some((SegmentType::Signature, Importance::Low))
        );
        assert_eq!(classify_line("The parties agree as follows.", Language::En), None);
    }

    #[test]
    fn zh_sentences_keep_terminators() {
        let s = split_sentences("甲方应保密。乙方亦然！期限五年；", Language::Zh);
        assert_eq!(s, vec!["甲方应保密。", "乙方亦然！", "期限五年；"]);
    }

    #[test]
    fn en_sentence_split_requires_following_whitespace() {
        let s = split_sentences("Pay $3.5m promptly. No delay; none.", Language::En);
        assert_eq!(s, vec!["Pay $3.5m promptly.", "No delay;", "none."]);
    }
}
