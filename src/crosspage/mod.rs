// Cross-page continuity: fragment merging, seam pairing, carryover handoff
// and top/bottom splitting of translations that span two pages

pub mod carryover;
pub mod edge_band;
pub mod grouping;
pub mod merger;
pub mod splitter;

pub use carryover::{CarryoverEntry, CarryoverStatus, CarryoverStore, RecoveryReport};
pub use edge_band::{find_edge_groups, match_crosspage_pairs, pair_id, CrosspagePair, Edge};
pub use grouping::{BubbleGrouper, BubbleIdGrouper, Group};
pub use merger::{MergeAbort, MergeOutcome, RegionMerger};
pub use splitter::{parse_split_json, resolve_split, split_by_punctuation, SplitPath, SplitResult};
