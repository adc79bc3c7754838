//! Correspondence graph: keypoint-level links between images.
//!
//! Built from pairwise (geometrically verified) feature matches. For every
//! keypoint we keep the list of keypoints in other images it corresponds to,
//! which makes "who else sees this keypoint" a direct lookup during
//! triangulation and track bookkeeping.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{ImageId, ImagePair, Point2DIdx};
use crate::error::{Result, SfmError};

/// A single match between keypoints of two images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureMatch {
    pub point2d_idx1: Point2DIdx,
    pub point2d_idx2: Point2DIdx,
}

impl FeatureMatch {
    pub fn new(point2d_idx1: Point2DIdx, point2d_idx2: Point2DIdx) -> Self {
        Self {
            point2d_idx1,
            point2d_idx2,
        }
    }
}

/// Keypoint in another image that corresponds to a query keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correspondence {
    pub image_id: ImageId,
    pub point2d_idx: Point2DIdx,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImageCorrespondences {
    /// Number of keypoints with at least one correspondence.
    num_observations: usize,
    /// Total number of correspondences over all keypoints.
    num_correspondences: usize,
    corrs: Vec<Vec<Correspondence>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrespondenceGraph {
    images: HashMap<ImageId, ImageCorrespondences>,
    image_pairs: HashMap<ImagePair, usize>,
}

impl CorrespondenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────────────────

    /// Register an image with `num_points2d` keypoints.
    pub fn add_image(&mut self, image_id: ImageId, num_points2d: usize) {
        self.images.entry(image_id).or_default().corrs = vec![Vec::new(); num_points2d];
    }

    /// Add the matches between two images.
    ///
    /// Self-matches are ignored; out-of-range and duplicate matches are
    /// dropped and not counted.
    ///
    /// # Errors
    /// * `UnknownImage` if either image was not added first
    pub fn add_correspondences(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[FeatureMatch],
    ) -> Result<()> {
        if image_id1 == image_id2 {
            warn!("[CorrespondenceGraph] Ignoring self-matches of image {}", image_id1);
            return Ok(());
        }
        if !self.images.contains_key(&image_id1) {
            return Err(SfmError::UnknownImage(image_id1));
        }
        if !self.images.contains_key(&image_id2) {
            return Err(SfmError::UnknownImage(image_id2));
        }

        let mut num_added = 0;
        for m in matches {
            let valid1 = m.point2d_idx1 < self.images[&image_id1].corrs.len();
            let valid2 = m.point2d_idx2 < self.images[&image_id2].corrs.len();
            if !(valid1 && valid2) {
                warn!(
                    "[CorrespondenceGraph] Match ({}, {}) out of range for images {} and {}",
                    m.point2d_idx1, m.point2d_idx2, image_id1, image_id2
                );
                continue;
            }

            let duplicate1 = self.images[&image_id1].corrs[m.point2d_idx1]
                .iter()
                .any(|c| c.image_id == image_id2);
            let duplicate2 = self.images[&image_id2].corrs[m.point2d_idx2]
                .iter()
                .any(|c| c.image_id == image_id1);
            if duplicate1 || duplicate2 {
                warn!(
                    "[CorrespondenceGraph] Duplicate correspondence between images {} and {}",
                    image_id1, image_id2
                );
                continue;
            }

            if let Some(image1) = self.images.get_mut(&image_id1) {
                image1.corrs[m.point2d_idx1].push(Correspondence {
                    image_id: image_id2,
                    point2d_idx: m.point2d_idx2,
                });
                image1.num_correspondences += 1;
            }
            if let Some(image2) = self.images.get_mut(&image_id2) {
                image2.corrs[m.point2d_idx2].push(Correspondence {
                    image_id: image_id1,
                    point2d_idx: m.point2d_idx1,
                });
                image2.num_correspondences += 1;
            }
            num_added += 1;
        }

        *self
            .image_pairs
            .entry(ImagePair::new(image_id1, image_id2))
            .or_insert(0) += num_added;
        Ok(())
    }

    /// Compute per-image observation counts and drop images without any
    /// correspondence.
    pub fn finalize(&mut self) {
        self.images.retain(|_, image| {
            image.num_observations = image.corrs.iter().filter(|c| !c.is_empty()).count();
            image.num_observations > 0
        });
        self.image_pairs.retain(|_, num| *num > 0);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn exists_image(&self, image_id: ImageId) -> bool {
        self.images.contains_key(&image_id)
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_image_pairs(&self) -> usize {
        self.image_pairs.len()
    }

    /// Number of keypoints of the image that have at least one correspondence.
    pub fn num_observations_for_image(&self, image_id: ImageId) -> usize {
        self.images
            .get(&image_id)
            .map_or(0, |image| image.num_observations)
    }

    /// Total number of correspondences of the image to all other images.
    pub fn num_correspondences_for_image(&self, image_id: ImageId) -> usize {
        self.images
            .get(&image_id)
            .map_or(0, |image| image.num_correspondences)
    }

    pub fn num_correspondences_between_images(&self, image_id1: ImageId, image_id2: ImageId) -> usize {
        self.image_pairs
            .get(&ImagePair::new(image_id1, image_id2))
            .copied()
            .unwrap_or(0)
    }

    /// All connected image pairs with their number of correspondences.
    pub fn image_pairs(&self) -> impl Iterator<Item = (ImagePair, usize)> + '_ {
        self.image_pairs.iter().map(|(pair, num)| (*pair, *num))
    }

    /// Direct correspondences of a keypoint.
    pub fn find_correspondences(&self, image_id: ImageId, point2d_idx: Point2DIdx) -> &[Correspondence] {
        self.images
            .get(&image_id)
            .and_then(|image| image.corrs.get(point2d_idx))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_correspondences(&self, image_id: ImageId, point2d_idx: Point2DIdx) -> bool {
        !self.find_correspondences(image_id, point2d_idx).is_empty()
    }

    /// Correspondences reachable within `transitivity` hops, excluding the
    /// query keypoint itself.
    pub fn find_transitive_correspondences(
        &self,
        image_id: ImageId,
        point2d_idx: Point2DIdx,
        transitivity: usize,
    ) -> Vec<Correspondence> {
        if transitivity <= 1 {
            return self.find_correspondences(image_id, point2d_idx).to_vec();
        }

        let query = Correspondence {
            image_id,
            point2d_idx,
        };
        let mut found = vec![query];
        let mut visited: HashSet<Correspondence> = HashSet::from([query]);
        let mut level_begin = 0;
        for _ in 0..transitivity {
            let level_end = found.len();
            for i in level_begin..level_end {
                let reference = found[i];
                for corr in self.find_correspondences(reference.image_id, reference.point2d_idx) {
                    if visited.insert(*corr) {
                        found.push(*corr);
                    }
                }
            }
            level_begin = level_end;
            if level_begin == found.len() {
                break;
            }
        }

        found.remove(0);
        found
    }

    /// Matches between two images, oriented as `(idx in image1, idx in image2)`.
    pub fn find_correspondences_between_images(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Vec<FeatureMatch> {
        let Some(image1) = self.images.get(&image_id1) else {
            return Vec::new();
        };
        let mut matches = Vec::new();
        for (point2d_idx1, corrs) in image1.corrs.iter().enumerate() {
            for corr in corrs.iter().filter(|c| c.image_id == image_id2) {
                matches.push(FeatureMatch::new(point2d_idx1, corr.point2d_idx));
            }
        }
        matches
    }

    /// Whether the keypoint is only linked to exactly one other keypoint which
    /// itself has no other correspondence.
    pub fn is_two_view_observation(&self, image_id: ImageId, point2d_idx: Point2DIdx) -> bool {
        let corrs = self.find_correspondences(image_id, point2d_idx);
        if corrs.len() != 1 {
            return false;
        }
        self.find_correspondences(corrs[0].image_id, corrs[0].point2d_idx)
            .len()
            == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: u32) -> ImageId {
        ImageId::new(i)
    }

    /// Three images, keypoint 0 of each linked in a chain 1-2-3.
    fn chain_graph() -> CorrespondenceGraph {
        let mut graph = CorrespondenceGraph::new();
        for i in 1..=3 {
            graph.add_image(id(i), 4);
        }
        graph
            .add_correspondences(id(1), id(2), &[FeatureMatch::new(0, 0), FeatureMatch::new(1, 2)])
            .unwrap();
        graph
            .add_correspondences(id(2), id(3), &[FeatureMatch::new(0, 0)])
            .unwrap();
        graph.finalize();
        graph
    }

    #[test]
    fn test_counts_after_finalize() {
        let graph = chain_graph();
        assert_eq!(graph.num_images(), 3);
        assert_eq!(graph.num_correspondences_for_image(id(2)), 3);
        assert_eq!(graph.num_observations_for_image(id(2)), 2);
        assert_eq!(graph.num_correspondences_between_images(id(2), id(1)), 2);
        assert_eq!(graph.num_correspondences_between_images(id(1), id(3)), 0);
    }

    #[test]
    fn test_duplicate_and_invalid_matches_dropped() {
        let mut graph = CorrespondenceGraph::new();
        graph.add_image(id(1), 2);
        graph.add_image(id(2), 2);
        graph
            .add_correspondences(
                id(1),
                id(2),
                &[FeatureMatch::new(0, 0), FeatureMatch::new(0, 1), FeatureMatch::new(5, 0)],
            )
            .unwrap();
        assert_eq!(graph.num_correspondences_between_images(id(1), id(2)), 1);
        assert!(graph.add_correspondences(id(1), id(9), &[]).is_err());
    }

    #[test]
    fn test_transitive_correspondences() {
        let graph = chain_graph();
        let direct = graph.find_transitive_correspondences(id(1), 0, 1);
        assert_eq!(direct.len(), 1);

        let transitive = graph.find_transitive_correspondences(id(1), 0, 2);
        assert_eq!(transitive.len(), 2);
        assert!(transitive.contains(&Correspondence {
            image_id: id(3),
            point2d_idx: 0
        }));
        assert!(!transitive.contains(&Correspondence {
            image_id: id(1),
            point2d_idx: 0
        }));
    }

    #[test]
    fn test_between_images_oriented() {
        let graph = chain_graph();
        let forward = graph.find_correspondences_between_images(id(1), id(2));
        let backward = graph.find_correspondences_between_images(id(2), id(1));
        assert!(forward.contains(&FeatureMatch::new(1, 2)));
        assert!(backward.contains(&FeatureMatch::new(2, 1)));
    }

    #[test]
    fn test_two_view_observation() {
        let graph = chain_graph();
        // 1:1 <-> 2:2 only
        assert!(graph.is_two_view_observation(id(1), 1));
        // 1:0 <-> 2:0 <-> 3:0 is a three-view track
        assert!(!graph.is_two_view_observation(id(1), 0));
    }
}
