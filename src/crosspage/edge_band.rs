// Edge band detection and bottom/top pairing across adjacent pages

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::types::Region;
use crate::crosspage::grouping::{BubbleGrouper, Group};

/// Characters of normalized text folded into a pair id
const PAIR_ID_TEXT_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Top,
    Bottom,
}

/// A bottom-of-page-N group matched to a top-of-page-(N+1) group
#[derive(Debug, Clone, PartialEq)]
pub struct CrosspagePair {
    pub pair_id: String,
    /// Index into the bottom group list
    pub bottom_index: usize,
    /// Index into the top group list
    pub top_index: usize,
    pub overlap: f32,
}

/// Groups whose union box touches the requested edge band.
///
/// Top band: `y1 <= height * ratio`. Bottom band: `y2 >= height * (1 - ratio)`.
pub fn find_edge_groups(
    grouper: &dyn BubbleGrouper,
    regions: &[Region],
    page_height: u32,
    edge: Edge,
    ratio: f32,
) -> Vec<Group> {
    let height = page_height as f32;
    grouper
        .group(regions)
        .into_iter()
        .filter(|group| {
            let bbox = group.bbox();
            if !bbox.is_valid() {
                return false;
            }
            match edge {
                Edge::Top => bbox.y1 <= height * ratio,
                Edge::Bottom => bbox.y2 >= height * (1.0 - ratio),
            }
        })
        .collect()
}

/// Greedy one-to-one pairing of bottom groups against unused top groups.
///
/// Bottom groups are visited in input order and take the best-overlapping
/// unused top group; the first top group wins a tie. A candidate is accepted
/// only when its overlap ratio reaches `min_overlap`.
pub fn match_crosspage_pairs(
    bottom_groups: &[Group],
    top_groups: &[Group],
    min_overlap: f32,
) -> Vec<CrosspagePair> {
    let mut used = vec![false; top_groups.len()];
    let mut pairs = Vec::new();

    for (bottom_index, bottom) in bottom_groups.iter().enumerate() {
        let bottom_box = bottom.bbox();
        let mut best: Option<(usize, f32)> = None;

        for (top_index, top) in top_groups.iter().enumerate() {
            if used[top_index] {
                continue;
            }
            let score = bottom_box.horizontal_overlap_ratio(&top.bbox());
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((top_index, score));
            }
        }

        match best {
            Some((top_index, overlap)) if overlap >= min_overlap => {
                used[top_index] = true;
                let pair_id = pair_id(bottom);
                debug!(
                    "Paired bottom group {} with top group {} (overlap {:.2}, id {})",
                    bottom_index, top_index, overlap, pair_id
                );
                pairs.push(CrosspagePair {
                    pair_id,
                    bottom_index,
                    top_index,
                    overlap,
                });
            }
            Some((_, overlap)) => {
                debug!(
                    "Bottom group {} left unpaired (best overlap {:.2} < {:.2})",
                    bottom_index, overlap, min_overlap
                );
            }
            None => {}
        }
    }

    pairs
}

/// Deterministic id from the bottom group's rounded edge coordinates and a
/// normalized text prefix, so both pages derive it independently.
pub fn pair_id(bottom: &Group) -> String {
    let bbox = bottom.bbox();
    let prefix = normalized_text_prefix(&bottom.text(), PAIR_ID_TEXT_PREFIX);

    let mut hash_input = Vec::with_capacity(8 + prefix.len());
    hash_input.extend_from_slice(&(bbox.x1.round() as i32).to_le_bytes());
    hash_input.extend_from_slice(&(bbox.y1.round() as i32).to_le_bytes());
    hash_input.extend_from_slice(prefix.as_bytes());

    format!("cp_{:016x}", xxh3_64(&hash_input))
}

/// Lowercased text with whitespace and punctuation removed, cut to `max_chars`
pub fn normalized_text_prefix(text: &str, max_chars: usize) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .take(max_chars)
        .collect()
}
