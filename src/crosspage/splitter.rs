// Top/bottom division of a translation that spans a page seam

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Marks a split may happen after; the mark stays with the top half
const SPLIT_PUNCTUATION: [char; 6] = ['。', '！', '？', '…', '；', '，'];

/// Which path produced a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPath {
    /// Translator returned valid `{"top", "bottom"}` JSON
    Json,
    /// Split after the punctuation mark nearest the midpoint
    Punctuation,
    /// Split at the character midpoint
    Ratio,
}

impl SplitPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitPath::Json => "json",
            SplitPath::Punctuation => "punctuation",
            SplitPath::Ratio => "ratio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResult {
    pub top: String,
    pub bottom: String,
    pub path: SplitPath,
}

impl SplitResult {
    pub fn json_ok(&self) -> bool {
        self.path == SplitPath::Json
    }

    pub fn fallback_used(&self) -> bool {
        self.path != SplitPath::Json
    }
}

#[derive(Debug, Deserialize)]
struct SplitJson {
    top: String,
    bottom: String,
}

/// Parse the translator's strict-JSON split output.
///
/// Tolerates surrounding whitespace and a Markdown code fence.
pub fn parse_split_json(raw: &str) -> Option<(String, String)> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let parsed: SplitJson = serde_json::from_str(body).ok()?;
    Some((parsed.top.trim().to_string(), parsed.bottom.trim().to_string()))
}

/// Use the JSON split when it parses, otherwise split `full_text` locally
pub fn resolve_split(raw_json: Option<&str>, full_text: &str) -> SplitResult {
    if let Some(raw) = raw_json {
        if let Some((top, bottom)) = parse_split_json(raw) {
            debug!("Cross-page split from JSON output");
            return SplitResult {
                top,
                bottom,
                path: SplitPath::Json,
            };
        }
        warn!(
            "Cross-page split output is not valid JSON, falling back to punctuation split: {}",
            raw.chars().take(80).collect::<String>()
        );
    }
    split_with_path(full_text)
}

/// Deterministic fallback split into (top, bottom)
pub fn split_by_punctuation(text: &str) -> (String, String) {
    let result = split_with_path(text);
    (result.top, result.bottom)
}

fn split_with_path(text: &str) -> SplitResult {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    let len = chars.len();

    if len == 0 {
        return SplitResult {
            top: String::new(),
            bottom: String::new(),
            path: SplitPath::Ratio,
        };
    }

    if len > 4 {
        if let Some(cut) = punctuation_cut(&chars) {
            return SplitResult {
                top: chars[..cut].iter().collect::<String>().trim().to_string(),
                bottom: chars[cut..].iter().collect::<String>().trim().to_string(),
                path: SplitPath::Punctuation,
            };
        }
    }

    let mid = len / 2;
    SplitResult {
        top: chars[..mid].iter().collect(),
        bottom: chars[mid..].iter().collect(),
        path: SplitPath::Ratio,
    }
}

/// Cut position just after the qualifying mark closest to the midpoint
fn punctuation_cut(chars: &[char]) -> Option<usize> {
    let mid = chars.len() / 2;
    let trimmed_len = |slice: &[char]| {
        slice
            .iter()
            .collect::<String>()
            .trim()
            .chars()
            .count()
    };

    chars
        .iter()
        .enumerate()
        .filter(|(_, c)| SPLIT_PUNCTUATION.contains(c))
        .map(|(i, _)| i)
        .filter(|&i| trimmed_len(&chars[..=i]) >= 2 && trimmed_len(&chars[i + 1..]) >= 2)
        .min_by_key(|&i| i.abs_diff(mid))
        .map(|i| i + 1)
}
