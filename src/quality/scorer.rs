// Per-region translation quality score and recommendation tags

use std::collections::BTreeMap;

use crate::core::types::{Glossary, QualityRecord, Region};

pub const RETRY_TRANSLATION: &str = "retry_translation";
pub const LOW_OCR_CONFIDENCE: &str = "low_ocr_confidence";
pub const CHECK_OVERFLOW: &str = "check_overflow";
pub const REVIEW_GLOSSARY: &str = "review_glossary";

const W_OCR: f32 = 0.35;
const W_LENGTH: f32 = 0.25;
const W_GLOSSARY: f32 = 0.20;
const W_PUNCTUATION: f32 = 0.10;
const W_MODEL: f32 = 0.10;

const BRACKET_PAIRS: [(char, char); 11] = [
    ('(', ')'),
    ('[', ']'),
    ('{', '}'),
    ('（', '）'),
    ('【', '】'),
    ('《', '》'),
    ('〈', '〉'),
    ('「', '」'),
    ('『', '』'),
    ('“', '”'),
    ('‘', '’'),
];

/// Outputs shorter than this (non-whitespace chars) read as cut off
const MIN_COMPLETE_CHARS: usize = 2;

/// Trailing marks that signal a cut-off sentence
const DANGLING_TRAILING: [char; 10] = [',', '，', '、', ';', '；', ':', '：', '-', '—', '/'];

/// Sort key for recommendation tags; unknown tags sort last
pub fn recommendation_priority(tag: &str) -> u8 {
    match tag {
        RETRY_TRANSLATION => 0,
        LOW_OCR_CONFIDENCE => 1,
        CHECK_OVERFLOW => 2,
        REVIEW_GLOSSARY => 3,
        _ => u8::MAX,
    }
}

/// Stable sort by [`recommendation_priority`]
pub fn sort_recommendations(tags: &mut [String]) {
    tags.sort_by_key(|t| recommendation_priority(t));
}

/// Thresholds for score and recommendation triggers
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub retry_threshold: f32,
    pub low_ocr_threshold: f32,
    pub overflow_threshold: f32,
    pub glossary_threshold: f32,
    /// Expected target/source character ratio
    pub length_ratio: f32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            retry_threshold: 0.55,
            low_ocr_threshold: 0.6,
            overflow_threshold: 0.7,
            glossary_threshold: 0.6,
            length_ratio: 1.0,
        }
    }
}

/// Named signal values before weighting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySignals {
    pub ocr_conf: f32,
    pub length_fit: f32,
    pub glossary_cov: f32,
    pub punctuation_ok: f32,
    pub model_conf: f32,
}

impl QualitySignals {
    pub fn weighted_score(&self) -> f32 {
        let score = W_OCR * self.ocr_conf
            + W_LENGTH * self.length_fit
            + W_GLOSSARY * self.glossary_cov
            + W_PUNCTUATION * self.punctuation_ok
            + W_MODEL * self.model_conf;
        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    fn to_map(self) -> BTreeMap<String, f32> {
        BTreeMap::from([
            ("ocr_conf".to_string(), self.ocr_conf),
            ("length_fit".to_string(), self.length_fit),
            ("glossary_cov".to_string(), self.glossary_cov),
            ("punctuation_ok".to_string(), self.punctuation_ok),
            ("model_conf".to_string(), self.model_conf),
        ])
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    config: ScorerConfig,
    glossary: Option<Glossary>,
}

impl QualityScorer {
    pub fn new(config: ScorerConfig, glossary: Option<Glossary>) -> Self {
        Self { config, glossary }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn glossary(&self) -> Option<&Glossary> {
        self.glossary.as_ref()
    }

    /// `max_chars` when known, else source length scaled by the length ratio,
    /// else one character per box-height of box width
    pub fn target_length_estimate(&self, region: &Region) -> Option<usize> {
        if let Some(max_chars) = region.max_chars.filter(|&m| m > 0) {
            return Some(max_chars);
        }
        let source_len = region.source_text.trim().chars().count();
        if source_len > 0 {
            return Some(((source_len as f32 * self.config.length_ratio).ceil() as usize).max(1));
        }
        let bbox = &region.bbox;
        if bbox.is_valid() && bbox.height() > 0.0 {
            return Some(((bbox.width() / bbox.height()).round() as usize).max(1));
        }
        None
    }

    pub fn signals(&self, region: &Region) -> QualitySignals {
        let ocr_conf = region.confidence.map(|c| c.clamp(0.0, 1.0)).unwrap_or(0.5);

        let target_len = region.target_text.trim().chars().count();
        let expected = self.target_length_estimate(region);
        let truncated = !region.is_sfx
            && region.target_text.chars().filter(|c| !c.is_whitespace()).count() < MIN_COMPLETE_CHARS
            && expected.map_or(true, |e| e >= MIN_COMPLETE_CHARS);
        let length_fit = match expected {
            _ if truncated => 0.0,
            Some(expected) => {
                let diff = (target_len as f32 - expected as f32).abs();
                1.0 - (diff / expected as f32).min(1.0)
            }
            None => 0.5,
        };

        let glossary_cov = self
            .glossary
            .as_ref()
            .map(|g| glossary_coverage(g, &region.source_text, &region.target_text))
            .unwrap_or(1.0);

        let punctuation_ok = if punctuation_well_formed(&region.target_text) {
            1.0
        } else {
            0.0
        };

        let model_conf = region
            .model_confidence
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(0.5);

        QualitySignals {
            ocr_conf,
            length_fit,
            glossary_cov,
            punctuation_ok,
            model_conf,
        }
    }

    /// Score one region and derive its prioritized recommendation tags
    pub fn score(&self, region: &Region) -> QualityRecord {
        let signals = self.signals(region);
        let score = signals.weighted_score();

        let mut recommendations = Vec::new();
        if signals.glossary_cov < self.config.glossary_threshold && !region.is_sfx {
            recommendations.push(REVIEW_GLOSSARY.to_string());
        }
        if signals.length_fit < self.config.overflow_threshold {
            recommendations.push(CHECK_OVERFLOW.to_string());
        }
        if signals.ocr_conf < self.config.low_ocr_threshold {
            recommendations.push(LOW_OCR_CONFIDENCE.to_string());
        }
        if score < self.config.retry_threshold {
            recommendations.push(RETRY_TRANSLATION.to_string());
        }
        sort_recommendations(&mut recommendations);

        QualityRecord {
            quality_score: score,
            quality_signals: signals.to_map(),
            recommendations,
        }
    }

    /// Score and attach a fresh record to the region
    pub fn apply(&self, region: &mut Region) -> f32 {
        let record = self.score(region);
        let score = record.quality_score;
        region.quality = Some(record);
        score
    }
}

/// Fraction of applicable glossary terms rendered in the output (1.0 if none apply)
pub fn glossary_coverage(glossary: &Glossary, source: &str, target: &str) -> f32 {
    let target_lower = target.to_lowercase();
    let mut applicable = 0usize;
    let mut matched = 0usize;
    for (_, tgt) in glossary.applicable(source) {
        applicable += 1;
        if target_lower.contains(&tgt.to_lowercase()) {
            matched += 1;
        }
    }
    if applicable == 0 {
        1.0
    } else {
        matched as f32 / applicable as f32
    }
}

/// Balanced brackets/quotes and no dangling trailing punctuation
pub fn punctuation_well_formed(text: &str) -> bool {
    let text = text.trim();
    let chars: Vec<char> = text.chars().collect();
    let mut stack: Vec<char> = Vec::new();

    for (i, &c) in chars.iter().enumerate() {
        if c == '’' && is_apostrophe(&chars, i) {
            continue;
        }
        if let Some(&(_, close)) = BRACKET_PAIRS.iter().find(|(open, _)| *open == c) {
            stack.push(close);
        } else if BRACKET_PAIRS.iter().any(|(_, close)| *close == c) {
            if stack.pop() != Some(c) {
                return false;
            }
        }
    }
    if !stack.is_empty() {
        return false;
    }

    // Symmetric quotes must pair up
    if text.chars().filter(|&c| c == '"').count() % 2 != 0 {
        return false;
    }

    match text.chars().last() {
        Some(last) => {
            !DANGLING_TRAILING.contains(&last) && !BRACKET_PAIRS.iter().any(|(open, _)| *open == last)
        }
        None => true,
    }
}

/// `’` between two alphanumerics is an apostrophe ("don’t"), not a closing quote
fn is_apostrophe(chars: &[char], i: usize) -> bool {
    let before = i.checked_sub(1).and_then(|j| chars.get(j));
    let after = chars.get(i + 1);
    matches!((before, after), (Some(b), Some(a)) if b.is_alphanumeric() && a.is_alphanumeric())
}
