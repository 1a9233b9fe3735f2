// Region metadata shared by the merge, pairing, carryover and quality stages

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned bounding box in page pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Finite coordinates with x1 < x2 and y1 < y2
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn y_center(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Horizontal overlap divided by the narrower width (0.0 when disjoint)
    pub fn horizontal_overlap_ratio(&self, other: &BBox) -> f32 {
        let overlap = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let narrower = self.width().min(other.width());
        if narrower <= 0.0 {
            return 0.0;
        }
        overlap / narrower
    }
}

/// Which side of a page seam a region sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrosspageRole {
    /// Bottom band of page N, continues on page N+1
    CurrentBottom,
    /// Top band of page N+1, continued from page N
    NextTop,
}

/// Quality assessment attached to a region.
///
/// A new record replaces the old one each time the region is rescored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub quality_score: f32,
    pub quality_signals: BTreeMap<String, f32>,
    pub recommendations: Vec<String>,
}

/// A single detected text area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub bbox: BBox,
    pub source_text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub target_text: String,
    #[serde(default)]
    pub is_sfx: bool,
    #[serde(default)]
    pub is_watermark: bool,
    #[serde(default)]
    pub skip_translation: bool,
    #[serde(default)]
    pub crosspage_pair_id: Option<String>,
    #[serde(default)]
    pub crosspage_role: Option<CrosspageRole>,
    /// Bubble the detector placed this text in, if any
    #[serde(default)]
    pub bubble_id: Option<String>,
    /// Layout capacity hint for the translated text
    #[serde(default)]
    pub max_chars: Option<usize>,
    /// Confidence reported by the translation model
    #[serde(default)]
    pub model_confidence: Option<f32>,
    #[serde(default)]
    pub quality: Option<QualityRecord>,
}

impl Region {
    pub fn new(id: impl Into<String>, bbox: BBox, source_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bbox,
            source_text: source_text.into(),
            confidence: None,
            target_text: String::new(),
            is_sfx: false,
            is_watermark: false,
            skip_translation: false,
            crosspage_pair_id: None,
            crosspage_role: None,
            bubble_id: None,
            max_chars: None,
            model_confidence: None,
            quality: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_bubble(mut self, bubble_id: impl Into<String>) -> Self {
        self.bubble_id = Some(bubble_id.into());
        self
    }

    pub fn with_target(mut self, target_text: impl Into<String>) -> Self {
        self.target_text = target_text.into();
        self
    }

    pub fn sfx(mut self) -> Self {
        self.is_sfx = true;
        self
    }

    pub fn watermark(mut self) -> Self {
        self.is_watermark = true;
        self
    }

    /// Whether the translation stage should send this region to a model
    pub fn needs_translation(&self) -> bool {
        !self.skip_translation && !self.is_watermark && !self.source_text.trim().is_empty()
    }
}

/// Source-to-target term list used for coverage scoring and retry prompts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Glossary {
    terms: BTreeMap<String, String>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.terms.insert(source.into(), target.into());
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Terms whose source side occurs in `source_text`
    pub fn applicable<'a>(&'a self, source_text: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.terms
            .iter()
            .filter(move |(src, _)| !src.is_empty() && source_text.contains(src.as_str()))
            .map(|(src, tgt)| (src.as_str(), tgt.as_str()))
    }

    /// One `source → target` line per applicable term
    pub fn prompt_terms(&self, source_text: &str) -> String {
        let lines: Vec<String> = self
            .applicable(source_text)
            .map(|(src, tgt)| format!("{} → {}", src, tgt))
            .collect();
        if lines.is_empty() {
            "(none)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

impl<S: Into<String>, T: Into<String>> FromIterator<(S, T)> for Glossary {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut glossary = Glossary::new();
        for (src, tgt) in iter {
            glossary.insert(src, tgt);
        }
        glossary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_validity() {
        assert!(BBox::new(0.0, 0.0, 10.0, 5.0).is_valid());
        assert!(!BBox::new(10.0, 0.0, 10.0, 5.0).is_valid());
        assert!(!BBox::new(0.0, 0.0, f32::NAN, 5.0).is_valid());
    }

    #[test]
    fn test_horizontal_overlap_uses_narrower_width() {
        let wide = BBox::new(0.0, 0.0, 100.0, 10.0);
        let narrow = BBox::new(80.0, 0.0, 120.0, 10.0);
        // overlap 20 / narrower width 40
        assert!((wide.horizontal_overlap_ratio(&narrow) - 0.5).abs() < 1e-6);
        let disjoint = BBox::new(200.0, 0.0, 220.0, 10.0);
        assert_eq!(wide.horizontal_overlap_ratio(&disjoint), 0.0);
    }

    #[test]
    fn test_region_deserializes_with_defaults() {
        let region: Region = serde_json::from_str(
            r#"{"id":"r1","bbox":{"x1":0,"y1":0,"x2":5,"y2":5},"source_text":"안녕"}"#,
        )
        .unwrap();
        assert_eq!(region.confidence, None);
        assert!(region.target_text.is_empty());
        assert!(!region.is_sfx);
        assert_eq!(region.crosspage_role, None);
    }

    #[test]
    fn test_glossary_prompt_terms() {
        let glossary: Glossary = [("선배", "senpai"), ("학교", "school")].into_iter().collect();
        assert_eq!(glossary.prompt_terms("선배님 안녕하세요"), "선배 → senpai");
        assert_eq!(glossary.prompt_terms("안녕"), "(none)");
    }
}
