//! Observation Manager - bookkeeping on top of a Reconstruction.
//!
//! Every mutation of 3D points and observations during a mapping session goes
//! through the manager so that it can keep, per image:
//! - the number of keypoints with correspondences and their total count
//! - the number of keypoints with a correspondence to a triangulated keypoint
//!   ("visible" points) and their spatial distribution ([`VisibilityPyramid`])
//!
//! and per image pair the number of triangulated correspondences. These
//! statistics drive next-image selection and retriangulation. The manager also
//! implements the point and frame filters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::debug;

use super::visibility_pyramid::{VisibilityPyramid, NUM_VISIBILITY_PYRAMID_LEVELS};
use crate::error::{Result, SfmError};
use crate::geometry::{calculate_triangulation_angle, has_point_positive_depth, Rigid3d};
use crate::scene::{
    DatabaseCache, FrameId, ImageId, ImagePair, Point2DIdx, Point3DId, Reconstruction, Track, TrackElement,
};

/// Triangulation progress of one image pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImagePairStat {
    /// Correspondences whose keypoints are triangulated.
    pub num_tri_corrs: usize,
    /// All correspondences between the two images.
    pub num_total_corrs: usize,
}

#[derive(Debug, Clone)]
struct ImageStat {
    num_observations: usize,
    num_correspondences: usize,
    num_visible_points3d: usize,
    /// Per keypoint, the number of corresponding keypoints that are triangulated.
    num_correspondences_have_point3d: Vec<u32>,
    visibility_pyramid: VisibilityPyramid,
}

pub struct ObservationManager {
    database_cache: Arc<DatabaseCache>,
    image_pair_stats: HashMap<ImagePair, ImagePairStat>,
    image_stats: HashMap<ImageId, ImageStat>,
}

impl ObservationManager {
    /// Build statistics for all images of `reconstruction`, counting
    /// observations that already exist.
    pub fn new(reconstruction: &Reconstruction, database_cache: Arc<DatabaseCache>) -> Self {
        let graph = database_cache.correspondence_graph();
        let image_pair_stats = graph
            .image_pairs()
            .map(|(pair, num_total_corrs)| {
                (
                    pair,
                    ImagePairStat {
                        num_tri_corrs: 0,
                        num_total_corrs,
                    },
                )
            })
            .collect();

        let mut image_stats = HashMap::with_capacity(reconstruction.num_images());
        for (image_id, image) in reconstruction.images() {
            let (width, height) = reconstruction
                .camera(image.camera_id)
                .map_or((0, 0), |camera| (camera.width, camera.height));
            image_stats.insert(
                *image_id,
                ImageStat {
                    num_observations: graph.num_observations_for_image(*image_id),
                    num_correspondences: graph.num_correspondences_for_image(*image_id),
                    num_visible_points3d: 0,
                    num_correspondences_have_point3d: vec![0; image.num_points2d()],
                    visibility_pyramid: VisibilityPyramid::new(NUM_VISIBILITY_PYRAMID_LEVELS, width, height),
                },
            );
        }

        let mut manager = Self {
            database_cache,
            image_pair_stats,
            image_stats,
        };

        // Observations of a loaded model.
        for image_id in reconstruction.reg_image_ids() {
            let Some(image) = reconstruction.image(image_id) else {
                continue;
            };
            for (point2d_idx, point2d) in image.points2d.iter().enumerate() {
                if point2d.has_point3d() {
                    manager.set_observation_as_triangulated(reconstruction, image_id, point2d_idx);
                }
            }
        }
        manager
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics
    // ─────────────────────────────────────────────────────────────────────────

    /// Keypoints of the image that have at least one correspondence.
    pub fn num_observations(&self, image_id: ImageId) -> usize {
        self.image_stats.get(&image_id).map_or(0, |s| s.num_observations)
    }

    pub fn num_correspondences(&self, image_id: ImageId) -> usize {
        self.image_stats.get(&image_id).map_or(0, |s| s.num_correspondences)
    }

    /// Keypoints of the image with a correspondence to a triangulated keypoint.
    pub fn num_visible_points3d(&self, image_id: ImageId) -> usize {
        self.image_stats.get(&image_id).map_or(0, |s| s.num_visible_points3d)
    }

    /// Visibility pyramid score of the visible keypoints.
    pub fn point3d_visibility_score(&self, image_id: ImageId) -> usize {
        self.image_stats
            .get(&image_id)
            .map_or(0, |s| s.visibility_pyramid.score())
    }

    pub fn image_pairs(&self) -> &HashMap<ImagePair, ImagePairStat> {
        &self.image_pair_stats
    }

    pub fn image_pair_stat(&self, image_id1: ImageId, image_id2: ImageId) -> Option<&ImagePairStat> {
        self.image_pair_stats.get(&ImagePair::new(image_id1, image_id2))
    }

    fn set_observation_as_triangulated(
        &mut self,
        reconstruction: &Reconstruction,
        image_id: ImageId,
        point2d_idx: Point2DIdx,
    ) {
        let cache = Arc::clone(&self.database_cache);
        for corr in cache.correspondence_graph().find_correspondences(image_id, point2d_idx) {
            if let Some(stat) = self.image_stats.get_mut(&corr.image_id) {
                if let Some(count) = stat.num_correspondences_have_point3d.get_mut(corr.point2d_idx) {
                    *count += 1;
                    if *count == 1 {
                        stat.num_visible_points3d += 1;
                        if let Some(p) = reconstruction
                            .image(corr.image_id)
                            .and_then(|image| image.point2d(corr.point2d_idx))
                        {
                            stat.visibility_pyramid.set_point(p.xy.x, p.xy.y);
                        }
                    }
                }
            }

            // Each correspondence is counted from one side only.
            if point2d_idx < corr.point2d_idx || (point2d_idx == corr.point2d_idx && image_id < corr.image_id) {
                if let Some(stat) = self.image_pair_stats.get_mut(&ImagePair::new(image_id, corr.image_id)) {
                    stat.num_tri_corrs = (stat.num_tri_corrs + 1).min(stat.num_total_corrs);
                }
            }
        }
    }

    fn reset_tri_observations(&mut self, reconstruction: &Reconstruction, image_id: ImageId, point2d_idx: Point2DIdx) {
        let cache = Arc::clone(&self.database_cache);
        for corr in cache.correspondence_graph().find_correspondences(image_id, point2d_idx) {
            if let Some(stat) = self.image_stats.get_mut(&corr.image_id) {
                if let Some(count) = stat.num_correspondences_have_point3d.get_mut(corr.point2d_idx) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            stat.num_visible_points3d = stat.num_visible_points3d.saturating_sub(1);
                            if let Some(p) = reconstruction
                                .image(corr.image_id)
                                .and_then(|image| image.point2d(corr.point2d_idx))
                            {
                                stat.visibility_pyramid.reset_point(p.xy.x, p.xy.y);
                            }
                        }
                    }
                }
            }

            if point2d_idx < corr.point2d_idx || (point2d_idx == corr.point2d_idx && image_id < corr.image_id) {
                if let Some(stat) = self.image_pair_stats.get_mut(&ImagePair::new(image_id, corr.image_id)) {
                    stat.num_tri_corrs = stat.num_tri_corrs.saturating_sub(1);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Point & Observation Mutation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_point3d(
        &mut self,
        reconstruction: &mut Reconstruction,
        xyz: Vector3<f64>,
        track: Track,
    ) -> Result<Point3DId> {
        let elements = track.elements().to_vec();
        let point3d_id = reconstruction.add_point3d(xyz, track)?;
        for el in elements {
            self.set_observation_as_triangulated(reconstruction, el.image_id, el.point2d_idx);
        }
        Ok(point3d_id)
    }

    pub fn add_observation(
        &mut self,
        reconstruction: &mut Reconstruction,
        point3d_id: Point3DId,
        el: TrackElement,
    ) -> Result<()> {
        reconstruction.add_observation(point3d_id, el)?;
        self.set_observation_as_triangulated(reconstruction, el.image_id, el.point2d_idx);
        Ok(())
    }

    pub fn delete_point3d(&mut self, reconstruction: &mut Reconstruction, point3d_id: Point3DId) -> Result<()> {
        let elements = reconstruction
            .point3d(point3d_id)
            .ok_or(SfmError::UnknownPoint3D(point3d_id))?
            .track
            .elements()
            .to_vec();
        for el in &elements {
            self.reset_tri_observations(reconstruction, el.image_id, el.point2d_idx);
        }
        reconstruction.delete_point3d(point3d_id)
    }

    /// Remove one observation; a point left with a single observation is
    /// deleted.
    pub fn delete_observation(
        &mut self,
        reconstruction: &mut Reconstruction,
        image_id: ImageId,
        point2d_idx: Point2DIdx,
    ) -> Result<()> {
        let point3d_id = reconstruction
            .image(image_id)
            .ok_or(SfmError::UnknownImage(image_id))?
            .point2d(point2d_idx)
            .ok_or(SfmError::UnknownPoint2D { image_id, point2d_idx })?
            .point3d_id;
        let Some(point3d_id) = point3d_id else {
            return Ok(());
        };
        let track_len = reconstruction
            .point3d(point3d_id)
            .map_or(0, |point3d| point3d.track.len());
        if track_len <= 2 {
            return self.delete_point3d(reconstruction, point3d_id);
        }
        self.reset_tri_observations(reconstruction, image_id, point2d_idx);
        reconstruction.delete_observation(image_id, point2d_idx)
    }

    /// Merge two points. All observations stay triangulated, so the statistics
    /// do not change.
    pub fn merge_points3d(
        &mut self,
        reconstruction: &mut Reconstruction,
        point3d_id1: Point3DId,
        point3d_id2: Point3DId,
    ) -> Result<Point3DId> {
        reconstruction.merge_points3d(point3d_id1, point3d_id2)
    }

    /// Remove all observations of a frame's images, then its pose.
    pub fn deregister_frame(&mut self, reconstruction: &mut Reconstruction, frame_id: FrameId) -> Result<()> {
        let image_ids = reconstruction
            .frame(frame_id)
            .ok_or(SfmError::UnknownFrame(frame_id))?
            .image_ids
            .clone();
        for image_id in image_ids {
            let linked: Vec<Point2DIdx> = reconstruction
                .image(image_id)
                .map(|image| {
                    image
                        .points2d
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.has_point3d())
                        .map(|(idx, _)| idx)
                        .collect()
                })
                .unwrap_or_default();
            for point2d_idx in linked {
                self.delete_observation(reconstruction, image_id, point2d_idx)?;
            }
        }
        reconstruction.deregister_frame(frame_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filtering
    // ─────────────────────────────────────────────────────────────────────────

    /// Filter the given points by reprojection error, then by triangulation
    /// angle.
    ///
    /// # Arguments
    /// * `max_reproj_error` - Maximum reprojection error in pixels
    /// * `min_tri_angle` - Minimum triangulation angle in degrees
    ///
    /// # Returns
    /// * Number of removed observations
    pub fn filter_points3d<I>(
        &mut self,
        reconstruction: &mut Reconstruction,
        max_reproj_error: f64,
        min_tri_angle: f64,
        point3d_ids: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = Point3DId>,
    {
        let mut point3d_ids: Vec<Point3DId> = point3d_ids.into_iter().collect();
        point3d_ids.sort_unstable();
        point3d_ids.dedup();
        let mut num_filtered =
            self.filter_points3d_with_large_reprojection_error(reconstruction, max_reproj_error, &point3d_ids)?;
        num_filtered +=
            self.filter_points3d_with_small_triangulation_angle(reconstruction, min_tri_angle, &point3d_ids)?;
        Ok(num_filtered)
    }

    /// Filter all points observed in the given images.
    pub fn filter_points3d_in_images<I>(
        &mut self,
        reconstruction: &mut Reconstruction,
        max_reproj_error: f64,
        min_tri_angle: f64,
        image_ids: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = ImageId>,
    {
        let mut point3d_ids = HashSet::new();
        for image_id in image_ids {
            if let Some(image) = reconstruction.image(image_id) {
                point3d_ids.extend(image.points2d.iter().filter_map(|p| p.point3d_id));
            }
        }
        self.filter_points3d(reconstruction, max_reproj_error, min_tri_angle, point3d_ids)
    }

    pub fn filter_all_points3d(
        &mut self,
        reconstruction: &mut Reconstruction,
        max_reproj_error: f64,
        min_tri_angle: f64,
    ) -> Result<usize> {
        let point3d_ids = reconstruction.point3d_ids();
        self.filter_points3d(reconstruction, max_reproj_error, min_tri_angle, point3d_ids)
    }

    /// Remove observations whose point lies behind the observing camera.
    pub fn filter_observations_with_negative_depth(&mut self, reconstruction: &mut Reconstruction) -> Result<usize> {
        let mut to_delete = Vec::new();
        for image_id in reconstruction.reg_image_ids() {
            let (Some(image), Some(cam_from_world)) =
                (reconstruction.image(image_id), reconstruction.cam_from_world(image_id))
            else {
                continue;
            };
            for (point2d_idx, point2d) in image.points2d.iter().enumerate() {
                let Some(point3d) = point2d.point3d_id.and_then(|id| reconstruction.point3d(id)) else {
                    continue;
                };
                if !has_point_positive_depth(&cam_from_world, &point3d.xyz) {
                    to_delete.push((image_id, point2d_idx));
                }
            }
        }

        let mut num_filtered = 0;
        for (image_id, point2d_idx) in to_delete {
            let still_linked = reconstruction
                .image(image_id)
                .and_then(|image| image.point2d(point2d_idx))
                .is_some_and(|p| p.has_point3d());
            if still_linked {
                self.delete_observation(reconstruction, image_id, point2d_idx)?;
                num_filtered += 1;
            }
        }
        if num_filtered > 0 {
            debug!("[ObsManager] Removed {} observations with negative depth", num_filtered);
        }
        Ok(num_filtered)
    }

    /// De-register frames with an image that lost all observations or whose
    /// camera has implausible intrinsics.
    ///
    /// # Returns
    /// * Ids of the de-registered frames
    pub fn filter_frames(
        &mut self,
        reconstruction: &mut Reconstruction,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> Result<Vec<FrameId>> {
        let filtered: Vec<FrameId> = reconstruction
            .reg_frame_ids()
            .iter()
            .copied()
            .filter(|frame_id| {
                let Some(frame) = reconstruction.frame(*frame_id) else {
                    return false;
                };
                frame.image_ids.iter().any(|image_id| {
                    reconstruction
                        .image_with_camera(*image_id)
                        .map_or(true, |(image, camera)| {
                            image.num_points3d() == 0
                                || camera.has_bogus_params(
                                    min_focal_length_ratio,
                                    max_focal_length_ratio,
                                    max_extra_param,
                                )
                        })
                })
            })
            .collect();

        for frame_id in &filtered {
            self.deregister_frame(reconstruction, *frame_id)?;
        }
        Ok(filtered)
    }

    fn filter_points3d_with_large_reprojection_error(
        &mut self,
        reconstruction: &mut Reconstruction,
        max_reproj_error: f64,
        point3d_ids: &[Point3DId],
    ) -> Result<usize> {
        let max_squared_reproj_error = max_reproj_error * max_reproj_error;
        let mut cams_from_world: HashMap<ImageId, Rigid3d> = HashMap::new();
        let mut num_filtered = 0;

        for point3d_id in point3d_ids {
            let Some(point3d) = reconstruction.point3d(*point3d_id) else {
                continue;
            };
            let track_len = point3d.track.len();
            if track_len < 2 {
                num_filtered += track_len;
                self.delete_point3d(reconstruction, *point3d_id)?;
                continue;
            }

            let mut reproj_error_sum = 0.0;
            let mut outliers = Vec::new();
            for el in point3d.track.elements() {
                let cam_from_world = match cams_from_world.get(&el.image_id) {
                    Some(pose) => *pose,
                    None => {
                        let Some(pose) = reconstruction.cam_from_world(el.image_id) else {
                            outliers.push(*el);
                            continue;
                        };
                        cams_from_world.insert(el.image_id, pose);
                        pose
                    }
                };
                let Some((image, camera)) = reconstruction.image_with_camera(el.image_id) else {
                    outliers.push(*el);
                    continue;
                };
                let Some(point2d) = image.point2d(el.point2d_idx) else {
                    outliers.push(*el);
                    continue;
                };
                let squared_error = camera.squared_reprojection_error(&point2d.xy, &point3d.xyz, &cam_from_world);
                if squared_error > max_squared_reproj_error {
                    outliers.push(*el);
                } else {
                    reproj_error_sum += squared_error.sqrt();
                }
            }

            if outliers.len() + 1 >= track_len {
                num_filtered += track_len;
                self.delete_point3d(reconstruction, *point3d_id)?;
            } else {
                num_filtered += outliers.len();
                for el in &outliers {
                    self.delete_observation(reconstruction, el.image_id, el.point2d_idx)?;
                }
                if let Some(point3d) = reconstruction.point3d_mut(*point3d_id) {
                    point3d.error = reproj_error_sum / point3d.track.len() as f64;
                }
            }
        }
        Ok(num_filtered)
    }

    fn filter_points3d_with_small_triangulation_angle(
        &mut self,
        reconstruction: &mut Reconstruction,
        min_tri_angle: f64,
        point3d_ids: &[Point3DId],
    ) -> Result<usize> {
        let min_tri_angle_rad = min_tri_angle.to_radians();
        let mut proj_centers: HashMap<ImageId, Vector3<f64>> = HashMap::new();
        let mut num_filtered = 0;

        for point3d_id in point3d_ids {
            let Some(point3d) = reconstruction.point3d(*point3d_id) else {
                continue;
            };
            let centers: Vec<Vector3<f64>> = point3d
                .track
                .elements()
                .iter()
                .filter_map(|el| {
                    if let Some(center) = proj_centers.get(&el.image_id) {
                        return Some(*center);
                    }
                    let center = reconstruction.projection_center(el.image_id)?;
                    proj_centers.insert(el.image_id, center);
                    Some(center)
                })
                .collect();

            let keep_point = centers.iter().enumerate().any(|(i1, center1)| {
                centers[..i1]
                    .iter()
                    .any(|center2| calculate_triangulation_angle(center1, center2, &point3d.xyz) >= min_tri_angle_rad)
            });
            if !keep_point {
                num_filtered += point3d.track.len();
                self.delete_point3d(reconstruction, *point3d_id)?;
            }
        }
        Ok(num_filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{synthesize_dataset, SyntheticDatasetOptions};

    /// Cache plus a reconstruction with ground-truth poses and no points.
    fn posed_session() -> (Arc<DatabaseCache>, Reconstruction, Reconstruction) {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default()).unwrap();
        let cache = Arc::new(dataset.database_cache);
        let mut reconstruction = Reconstruction::new();
        reconstruction.load(&cache);
        for frame_id in dataset.ground_truth.reg_frame_ids() {
            let pose = dataset.ground_truth.frame(*frame_id).unwrap().rig_from_world.unwrap();
            reconstruction.register_frame(*frame_id, pose).unwrap();
        }
        (cache, reconstruction, dataset.ground_truth)
    }

    /// Copy the ground-truth track of one point into the session.
    fn add_gt_point(
        manager: &mut ObservationManager,
        reconstruction: &mut Reconstruction,
        gt: &Reconstruction,
        point3d_id: Point3DId,
    ) -> Point3DId {
        let point3d = gt.point3d(point3d_id).unwrap();
        manager
            .add_point3d(reconstruction, point3d.xyz, point3d.track.clone())
            .unwrap()
    }

    #[test]
    fn test_visible_points_follow_mutations() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        let image_id = ImageId::new(1);
        assert_eq!(manager.num_visible_points3d(image_id), 0);
        assert!(manager.num_correspondences(image_id) > 0);

        let gt_id = gt
            .point3d_ids()
            .into_iter()
            .find(|id| gt.point3d(*id).unwrap().track.len() >= 3)
            .unwrap();
        let point3d_id = add_gt_point(&mut manager, &mut reconstruction, &gt, gt_id);
        for el in gt.point3d(gt_id).unwrap().track.elements() {
            assert_eq!(manager.num_visible_points3d(el.image_id), 1);
            assert!(manager.point3d_visibility_score(el.image_id) > 0);
        }

        manager.delete_point3d(&mut reconstruction, point3d_id).unwrap();
        for el in gt.point3d(gt_id).unwrap().track.elements() {
            assert_eq!(manager.num_visible_points3d(el.image_id), 0);
            assert_eq!(manager.point3d_visibility_score(el.image_id), 0);
        }
        assert!(manager.image_pairs().values().all(|s| s.num_tri_corrs == 0));
    }

    #[test]
    fn test_pair_stats_count_triangulated_correspondences() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        for point3d_id in gt.point3d_ids() {
            add_gt_point(&mut manager, &mut reconstruction, &gt, point3d_id);
        }
        for stat in manager.image_pairs().values() {
            assert!(stat.num_tri_corrs > 0);
            assert!(stat.num_tri_corrs <= stat.num_total_corrs);
        }

        // A second manager over the loaded model sees the same statistics
        let reloaded = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        assert_eq!(reloaded.image_pairs(), manager.image_pairs());
        for image_id in reconstruction.reg_image_ids() {
            assert_eq!(
                reloaded.num_visible_points3d(image_id),
                manager.num_visible_points3d(image_id)
            );
        }
    }

    #[test]
    fn test_delete_observation_removes_two_view_points() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        let gt_id = gt.point3d_ids()[0];
        let el = gt.point3d(gt_id).unwrap().track.elements()[0];
        let two_view = Track::from_elements(gt.point3d(gt_id).unwrap().track.elements()[..2].to_vec());
        let point3d_id = manager
            .add_point3d(&mut reconstruction, gt.point3d(gt_id).unwrap().xyz, two_view)
            .unwrap();

        manager
            .delete_observation(&mut reconstruction, el.image_id, el.point2d_idx)
            .unwrap();
        assert!(!reconstruction.exists_point3d(point3d_id));
        assert_eq!(manager.num_visible_points3d(el.image_id), 0);
    }

    #[test]
    fn test_filters_remove_outliers_and_are_idempotent() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        let mut ids = Vec::new();
        for point3d_id in gt.point3d_ids() {
            ids.push(add_gt_point(&mut manager, &mut reconstruction, &gt, point3d_id));
        }

        // Move one point far off its rays
        let moved = ids[0];
        reconstruction.point3d_mut(moved).unwrap().xyz += Vector3::new(1.0, -1.0, 0.5);

        let num_filtered = manager.filter_all_points3d(&mut reconstruction, 4.0, 1.5).unwrap();
        assert!(num_filtered > 0);
        assert!(!reconstruction.exists_point3d(moved));
        assert_eq!(manager.filter_all_points3d(&mut reconstruction, 4.0, 1.5).unwrap(), 0);
        assert_eq!(
            manager.filter_observations_with_negative_depth(&mut reconstruction).unwrap(),
            0
        );
    }

    #[test]
    fn test_filter_points_with_small_triangulation_angle() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        let point3d_id = add_gt_point(&mut manager, &mut reconstruction, &gt, gt.point3d_ids()[0]);
        let num_obs = reconstruction.point3d(point3d_id).unwrap().track.len();
        // Nothing in the dataset reaches 170 degrees
        let removed = manager
            .filter_points3d(&mut reconstruction, 100.0, 170.0, [point3d_id])
            .unwrap();
        assert_eq!(removed, num_obs);
        assert!(!reconstruction.exists_point3d(point3d_id));
    }

    #[test]
    fn test_filter_frames_deregisters_bogus_cameras() {
        let (cache, mut reconstruction, gt) = posed_session();
        let mut manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        for point3d_id in gt.point3d_ids() {
            add_gt_point(&mut manager, &mut reconstruction, &gt, point3d_id);
        }
        assert!(manager
            .filter_frames(&mut reconstruction, 0.1, 10.0, 1.0)
            .unwrap()
            .is_empty());

        let camera_id = reconstruction.image(ImageId::new(1)).unwrap().camera_id;
        reconstruction.camera_mut(camera_id).unwrap().set_focal_length(1e6);
        let filtered = manager.filter_frames(&mut reconstruction, 0.1, 10.0, 1.0).unwrap();
        // All frames share the single camera
        assert_eq!(filtered.len(), 5);
        assert_eq!(reconstruction.num_reg_frames(), 0);
        assert_eq!(reconstruction.num_points3d(), 0);
        assert_eq!(manager.num_visible_points3d(ImageId::new(1)), 0);
    }
}
