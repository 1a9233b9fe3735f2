// Bubble groups: regions believed to belong to one bubble or line

use std::collections::HashMap;

use crate::core::types::{BBox, Region};

/// Ordered, non-empty list of regions forming one bubble
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    regions: Vec<Region>,
}

impl Group {
    /// Returns `None` for an empty list
    pub fn new(regions: Vec<Region>) -> Option<Self> {
        if regions.is_empty() {
            None
        } else {
            Some(Self { regions })
        }
    }

    pub fn single(region: Region) -> Self {
        Self {
            regions: vec![region],
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn into_regions(self) -> Vec<Region> {
        self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Union of member boxes
    pub fn bbox(&self) -> BBox {
        let first = self.regions[0].bbox;
        self.regions[1..]
            .iter()
            .fold(first, |acc, region| acc.union(&region.bbox))
    }

    /// Member ids in order
    pub fn region_ids(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.id.as_str()).collect()
    }

    /// Member source texts in top-to-bottom, left-to-right order
    pub fn text(&self) -> String {
        let mut ordered: Vec<&Region> = self.regions.iter().collect();
        ordered.sort_by(|a, b| {
            a.bbox
                .y1
                .total_cmp(&b.bbox.y1)
                .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        });
        let parts: Vec<&str> = ordered
            .iter()
            .map(|r| r.source_text.trim())
            .filter(|t| !t.is_empty())
            .collect();
        super::merger::join_tokens(&parts)
    }
}

/// Clusters a page's regions into bubble groups
pub trait BubbleGrouper: Send + Sync {
    fn group(&self, regions: &[Region]) -> Vec<Group>;
}

/// Groups regions by the detector-assigned `bubble_id`.
///
/// Groups keep first-seen order; regions without a bubble id become
/// singleton groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct BubbleIdGrouper;

impl BubbleGrouper for BubbleIdGrouper {
    fn group(&self, regions: &[Region]) -> Vec<Group> {
        let mut slots: Vec<Vec<Region>> = Vec::new();
        let mut by_bubble: HashMap<&str, usize> = HashMap::new();

        for region in regions {
            match region.bubble_id.as_deref() {
                Some(bubble) => {
                    let slot = *by_bubble.entry(bubble).or_insert_with(|| {
                        slots.push(Vec::new());
                        slots.len() - 1
                    });
                    slots[slot].push(region.clone());
                }
                None => slots.push(vec![region.clone()]),
            }
        }

        slots.into_iter().filter_map(Group::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: &str, x1: f32, y1: f32, text: &str) -> Region {
        Region::new(id, BBox::new(x1, y1, x1 + 20.0, y1 + 10.0), text)
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(Group::new(Vec::new()).is_none());
    }

    #[test]
    fn test_group_bbox_is_union() {
        let group = Group::new(vec![region("a", 0.0, 0.0, "x"), region("b", 50.0, 30.0, "y")]).unwrap();
        assert_eq!(group.bbox(), BBox::new(0.0, 0.0, 70.0, 40.0));
    }

    #[test]
    fn test_group_text_reading_order() {
        let group = Group::new(vec![
            region("b", 0.0, 30.0, "world"),
            region("a", 0.0, 0.0, "hello"),
        ])
        .unwrap();
        assert_eq!(group.text(), "hello world");
    }

    #[test]
    fn test_bubble_id_grouper() {
        let regions = vec![
            region("a", 0.0, 0.0, "1").with_bubble("b1"),
            region("b", 0.0, 40.0, "2"),
            region("c", 0.0, 20.0, "3").with_bubble("b1"),
        ];
        let groups = BubbleIdGrouper.group(&regions);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].region_ids(), vec!["a", "c"]);
        assert_eq!(groups[1].region_ids(), vec!["b"]);
    }
}
