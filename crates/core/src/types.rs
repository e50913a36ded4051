use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Corners as (left, top, right, bottom).
    pub fn to_tlbr(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }

    /// Intersection-over-union with another box. Returns 0.0 for disjoint boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let (ax1, ay1, ax2, ay2) = self.to_tlbr();
        let (bx1, by1, bx2, by2) = other.to_tlbr();

        let ix = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let iy = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let inter = ix * iy;

        let area_a = (ax2 - ax1).max(0.0) * (ay2 - ay1).max(0.0);
        let area_b = (bx2 - bx1).max(0.0) * (by2 - by1).max(0.0);
        let union = area_a + area_b - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Identity embedding vector produced by the external embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance to another embedding.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A canonical identity as seen by the matcher: the stored embedding plus
/// enough metadata to upsert the matched record.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: i64,
    pub alias: String,
    pub is_known: bool,
    pub embedding: Embedding,
}

/// How a face is labeled while it moves through the pipeline: a pending
/// placeholder alias before consolidation has named it, or the given name
/// once an operator has confirmed who it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTag {
    Pending { alias: String },
    Named { name: String },
}

impl IdentityTag {
    /// Label drawn on annotated frames and carried in frame reports.
    pub fn display_name(&self) -> &str {
        match self {
            IdentityTag::Pending { .. } => "Processing",
            IdentityTag::Named { name } => name,
        }
    }

    /// The underlying alias or name, for store lookups.
    pub fn key(&self) -> &str {
        match self {
            IdentityTag::Pending { alias } => alias,
            IdentityTag::Named { name } => name,
        }
    }
}

/// Strategy for resolving a probe embedding against an owner's gallery.
pub trait Matcher {
    fn find_match<'a>(
        &self,
        probe: &Embedding,
        gallery: &'a [GalleryEntry],
        threshold: f32,
    ) -> Option<&'a GalleryEntry>;
}

/// Returns the first gallery entry whose Euclidean distance to the probe is
/// under the threshold.
///
/// Deliberately first-match rather than best-match: the gallery is small and
/// the threshold tight enough that a second entry under the threshold is
/// rare, and the scan stays O(k) in the common miss case.
pub struct FirstMatchMatcher;

impl Matcher for FirstMatchMatcher {
    fn find_match<'a>(
        &self,
        probe: &Embedding,
        gallery: &'a [GalleryEntry],
        threshold: f32,
    ) -> Option<&'a GalleryEntry> {
        gallery
            .iter()
            .find(|entry| probe.euclidean_distance(&entry.embedding) < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, alias: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            id,
            alias: alias.into(),
            is_known: false,
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn euclidean_distance_identical_is_zero() {
        let a = Embedding::new(vec![0.5, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn euclidean_distance_unit_apart() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert!((a.euclidean_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn match_under_threshold_found() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry(1, "unknown_001", vec![0.5, 0.0])];
        let hit = FirstMatchMatcher.find_match(&probe, &gallery, 0.6);
        assert_eq!(hit.map(|e| e.id), Some(1));
    }

    #[test]
    fn match_over_threshold_misses() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry(1, "unknown_001", vec![0.9, 0.0])];
        assert!(FirstMatchMatcher.find_match(&probe, &gallery, 0.6).is_none());
    }

    #[test]
    fn first_match_wins_over_closer_later_entry() {
        // Both entries are under the threshold; the scan stops at the first.
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry(1, "unknown_001", vec![0.5, 0.0]),
            entry(2, "unknown_002", vec![0.1, 0.0]),
        ];
        let hit = FirstMatchMatcher.find_match(&probe, &gallery, 0.6);
        assert_eq!(hit.map(|e| e.id), Some(1));
    }

    #[test]
    fn empty_gallery_never_matches() {
        let probe = Embedding::new(vec![1.0]);
        assert!(FirstMatchMatcher.find_match(&probe, &[], 0.6).is_none());
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        let b = BoundingBox { x: 20.0, y: 20.0, width: 10.0, height: 10.0, confidence: 1.0 };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_identical_is_one() {
        let a = BoundingBox { x: 5.0, y: 5.0, width: 10.0, height: 10.0, confidence: 1.0 };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_half_overlap() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        let b = BoundingBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        let expected = 50.0 / 150.0;
        assert!((a.iou(&b) - expected).abs() < 1e-6);
    }

    #[test]
    fn identity_tag_display_names() {
        let pending = IdentityTag::Pending { alias: "unknown_001".into() };
        let named = IdentityTag::Named { name: "Alice".into() };
        assert_eq!(pending.display_name(), "Processing");
        assert_eq!(named.display_name(), "Alice");
        assert_eq!(pending.key(), "unknown_001");
    }
}
