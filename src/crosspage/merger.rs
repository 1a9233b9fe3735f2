// Fragment merging: joins OCR fragments split mid-line back into one region
//
// Any ambiguous geometry degrades to "no merge". A single bad gap rejects the
// whole group, there are no partial merges.

use tracing::debug;

use crate::core::config::MergeConfig;
use crate::core::types::Region;
use crate::crosspage::grouping::Group;
use crate::utils::Metrics;

/// Why a group was left unmerged
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeAbort {
    TooFewCandidates(usize),
    NonPositiveMedianHeight,
    HeightMismatch { ratio: f32 },
    GapTooLarge { gap: f32, limit: f32 },
}

/// Result of merging one group
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Eligible fragments merged into the first region; excluded ones follow unchanged
    Merged(Vec<Region>),
    /// Input returned unmodified
    Aborted { regions: Vec<Region>, reason: MergeAbort },
}

impl MergeOutcome {
    pub fn into_regions(self) -> Vec<Region> {
        match self {
            MergeOutcome::Merged(regions) => regions,
            MergeOutcome::Aborted { regions, .. } => regions,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_))
    }
}

/// Row cluster with an incrementally maintained mean y-center
struct Row<'a> {
    mean_y: f32,
    members: Vec<&'a Region>,
}

impl<'a> Row<'a> {
    fn push(&mut self, region: &'a Region) {
        self.members.push(region);
        let n = self.members.len() as f32;
        self.mean_y += (region.bbox.y_center() - self.mean_y) / n;
    }
}

pub struct RegionMerger {
    config: MergeConfig,
    metrics: Option<Metrics>,
}

impl RegionMerger {
    pub fn new(config: MergeConfig, metrics: Option<Metrics>) -> Self {
        Self { config, metrics }
    }

    fn is_eligible(&self, region: &Region) -> bool {
        !region.is_watermark
            && !region.is_sfx
            && region.bbox.is_valid()
            && region
                .confidence
                .map_or(true, |c| c >= self.config.min_confidence)
    }

    /// Merge a group's fragments into a single region when the geometry allows it
    pub fn merge(&self, group: Group) -> MergeOutcome {
        let regions = group.into_regions();
        let outcome = match self.plan(&regions) {
            Ok(sequence) => {
                let (merged, excluded) = self.build(&regions, &sequence);
                let mut out = Vec::with_capacity(excluded.len() + 1);
                out.push(merged);
                out.extend(excluded);
                MergeOutcome::Merged(out)
            }
            Err(reason) => {
                debug!("Merge aborted for {} regions: {:?}", regions.len(), reason);
                MergeOutcome::Aborted { regions, reason }
            }
        };

        // Lone fragments are not merge attempts
        let attempted = !matches!(
            outcome,
            MergeOutcome::Aborted {
                reason: MergeAbort::TooFewCandidates(_),
                ..
            }
        );
        if let (Some(m), true) = (self.metrics.as_ref(), attempted) {
            m.record_merge(outcome.is_merged());
        }
        outcome
    }

    /// Merge every group and flatten the result
    pub fn merge_all(&self, groups: Vec<Group>) -> Vec<Region> {
        groups
            .into_iter()
            .flat_map(|g| self.merge(g).into_regions())
            .collect()
    }

    /// Returns candidate indices in reading order
    fn plan(&self, regions: &[Region]) -> Result<Vec<usize>, MergeAbort> {
        let candidates: Vec<usize> = (0..regions.len())
            .filter(|&i| self.is_eligible(&regions[i]))
            .collect();
        if candidates.len() < 2 {
            return Err(MergeAbort::TooFewCandidates(candidates.len()));
        }

        let heights: Vec<f32> = candidates.iter().map(|&i| regions[i].bbox.height()).collect();
        let median_h = median(&heights);
        if median_h <= 0.0 {
            return Err(MergeAbort::NonPositiveMedianHeight);
        }
        let max_h = heights.iter().copied().fold(f32::MIN, f32::max);
        let min_h = heights.iter().copied().fold(f32::MAX, f32::min);
        let ratio = max_h / min_h;
        if ratio > self.config.max_height_ratio {
            return Err(MergeAbort::HeightMismatch { ratio });
        }

        // Row clustering in (y1, x1) order
        let mut sorted: Vec<&Region> = candidates.iter().map(|&i| &regions[i]).collect();
        sorted.sort_by(|a, b| {
            a.bbox
                .y1
                .total_cmp(&b.bbox.y1)
                .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        });

        let row_tolerance = self.config.row_tolerance * median_h;
        let mut rows: Vec<Row> = Vec::new();
        for region in sorted {
            let yc = region.bbox.y_center();
            match rows.iter_mut().find(|row| (row.mean_y - yc).abs() <= row_tolerance) {
                Some(row) => row.push(region),
                None => rows.push(Row {
                    mean_y: yc,
                    members: vec![region],
                }),
            }
        }

        rows.sort_by(|a, b| a.mean_y.total_cmp(&b.mean_y));
        let sequence: Vec<&Region> = rows
            .into_iter()
            .flat_map(|mut row| {
                row.members.sort_by(|a, b| a.bbox.x1.total_cmp(&b.bbox.x1));
                row.members
            })
            .collect();

        let gap_limit = self.config.max_gap * median_h;
        for pair in sequence.windows(2) {
            let gap = pair[1].bbox.x1 - pair[0].bbox.x2;
            if gap > gap_limit {
                return Err(MergeAbort::GapTooLarge {
                    gap,
                    limit: gap_limit,
                });
            }
        }

        // Map back to indices so the caller can split eligible from excluded
        Ok(sequence
            .into_iter()
            .filter_map(|r| regions.iter().position(|c| std::ptr::eq(c, r)))
            .collect())
    }

    fn build(&self, regions: &[Region], sequence: &[usize]) -> (Region, Vec<Region>) {
        let members: Vec<&Region> = sequence.iter().map(|&i| &regions[i]).collect();

        let tokens: Vec<&str> = members
            .iter()
            .map(|r| r.source_text.trim())
            .filter(|t| !t.is_empty())
            .collect();
        let text = join_tokens(&tokens);

        let bbox = members[1..]
            .iter()
            .fold(members[0].bbox, |acc, r| acc.union(&r.bbox));

        let confidences: Vec<f32> = members.iter().filter_map(|r| r.confidence).collect();
        let confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
        };

        let mut merged = members[0].clone();
        merged.bbox = bbox;
        merged.source_text = text;
        merged.confidence = confidence;
        merged.max_chars = members
            .iter()
            .filter_map(|r| r.max_chars)
            .reduce(|a, b| a + b);

        let excluded = (0..regions.len())
            .filter(|i| !sequence.contains(i))
            .map(|i| regions[i].clone())
            .collect();

        debug!(
            "Merged {} fragments into region {} ({} chars)",
            members.len(),
            merged.id,
            merged.source_text.chars().count()
        );

        (merged, excluded)
    }
}

/// Concatenate tokens, inserting one space only between two ASCII-alphanumeric
/// borders (Latin word boundaries); CJK runs are joined directly.
pub fn join_tokens(tokens: &[&str]) -> String {
    let mut out = String::new();
    for token in tokens {
        let needs_space = matches!(
            (out.chars().last(), token.chars().next()),
            (Some(prev), Some(next)) if prev.is_ascii_alphanumeric() && next.is_ascii_alphanumeric()
        );
        if needs_space {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BBox;

    fn fragment(id: &str, x1: f32, y1: f32, x2: f32, y2: f32, text: &str) -> Region {
        Region::new(id, BBox::new(x1, y1, x2, y2), text).with_confidence(0.9)
    }

    fn merger() -> RegionMerger {
        RegionMerger::new(MergeConfig::default(), None)
    }

    #[test]
    fn test_merges_cjk_fragments_without_space() {
        let group = Group::new(vec![
            fragment("a", 10.0, 100.0, 60.0, 130.0, "너무"),
            fragment("b", 70.0, 100.0, 120.0, 130.0, "좋아"),
        ])
        .unwrap();

        let outcome = merger().merge(group);
        assert!(outcome.is_merged());
        let regions = outcome.into_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].source_text, "너무좋아");
        assert_eq!(regions[0].bbox.x1, 10.0);
        assert_eq!(regions[0].bbox.x2, 120.0);
        assert_eq!(regions[0].id, "a");
    }

    #[test]
    fn test_latin_tokens_get_single_space() {
        let group = Group::new(vec![
            fragment("b", 70.0, 0.0, 120.0, 30.0, "world"),
            fragment("a", 10.0, 0.0, 60.0, 30.0, "hello"),
        ])
        .unwrap();
        let regions = merger().merge(group).into_regions();
        assert_eq!(regions[0].source_text, "hello world");
    }

    #[test]
    fn test_multi_row_reading_order() {
        let group = Group::new(vec![
            fragment("c", 10.0, 40.0, 60.0, 70.0, "셋"),
            fragment("b", 70.0, 2.0, 120.0, 32.0, "둘"),
            fragment("a", 10.0, 0.0, 60.0, 30.0, "하나"),
        ])
        .unwrap();
        let regions = merger().merge(group).into_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].source_text, "하나둘셋");
    }

    #[test]
    fn test_large_gap_aborts_whole_group() {
        let group = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "너무"),
            fragment("b", 65.0, 0.0, 90.0, 30.0, "정말"),
            fragment("c", 200.0, 0.0, 250.0, 30.0, "좋아"),
        ])
        .unwrap();
        let outcome = merger().merge(group.clone());
        match outcome {
            MergeOutcome::Aborted { regions, reason } => {
                assert_eq!(regions, group.into_regions());
                assert!(matches!(reason, MergeAbort::GapTooLarge { .. }));
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_height_mismatch_aborts() {
        let group = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 20.0, "작은"),
            fragment("b", 62.0, 0.0, 120.0, 60.0, "큰"),
        ])
        .unwrap();
        let outcome = merger().merge(group);
        assert!(matches!(
            outcome,
            MergeOutcome::Aborted {
                reason: MergeAbort::HeightMismatch { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_excluded_regions_pass_through() {
        let group = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "너무"),
            fragment("wm", 300.0, 300.0, 400.0, 320.0, "site.com").watermark(),
            fragment("b", 70.0, 0.0, 120.0, 30.0, "좋아"),
            fragment("low", 0.0, 200.0, 20.0, 230.0, "?").with_confidence(0.2),
        ])
        .unwrap();
        let regions = merger().merge(group).into_regions();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].source_text, "너무좋아");
        assert_eq!(regions[1].id, "wm");
        assert_eq!(regions[2].id, "low");
    }

    #[test]
    fn test_single_candidate_is_unchanged() {
        let group = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "BOOM").sfx(),
            fragment("b", 70.0, 0.0, 120.0, 30.0, "좋아"),
        ])
        .unwrap();
        let outcome = merger().merge(group);
        assert!(matches!(
            outcome,
            MergeOutcome::Aborted {
                reason: MergeAbort::TooFewCandidates(1),
                ..
            }
        ));
    }

    #[test]
    fn test_lone_fragments_not_counted_as_aborted_merges() {
        let metrics = Metrics::new();
        let merger = RegionMerger::new(MergeConfig::default(), Some(metrics.clone()));

        let single = Group::new(vec![fragment("a", 10.0, 0.0, 60.0, 30.0, "안녕")]).unwrap();
        merger.merge(single);
        assert_eq!(metrics.snapshot().merges_aborted, 0);

        let gapped = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "너무"),
            fragment("c", 200.0, 0.0, 250.0, 30.0, "좋아"),
        ])
        .unwrap();
        merger.merge(gapped);
        let pair = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "너무"),
            fragment("b", 70.0, 0.0, 120.0, 30.0, "좋아"),
        ])
        .unwrap();
        merger.merge(pair);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.merges_aborted, 1);
        assert_eq!(snapshot.merges_applied, 1);
    }

    #[test]
    fn test_mean_confidence() {
        let group = Group::new(vec![
            fragment("a", 10.0, 0.0, 60.0, 30.0, "너무").with_confidence(0.6),
            fragment("b", 70.0, 0.0, 120.0, 30.0, "좋아").with_confidence(1.0),
        ])
        .unwrap();
        let regions = merger().merge(group).into_regions();
        assert!((regions[0].confidence.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_join_tokens() {
        assert_eq!(join_tokens(&["ab", "cd"]), "ab cd");
        assert_eq!(join_tokens(&["ab,", "cd"]), "ab,cd");
        assert_eq!(join_tokens(&["这段", "时间"]), "这段时间");
    }
}
