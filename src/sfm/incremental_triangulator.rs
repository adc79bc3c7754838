//! Incremental Triangulator - creates and maintains 3D point tracks.
//!
//! Works on a Reconstruction through an [`ObservationManager`] and follows the
//! correspondence graph of the [`DatabaseCache`]:
//! - `triangulate_image`: continue existing tracks with keypoints of a newly
//!   registered image, or create new points from untriangulated
//!   correspondences
//! - `complete_*`: extend tracks transitively with keypoints that reproject
//!   well
//! - `merge_*`: fuse points that turned out to be the same landmark
//! - `retriangulate`: revisit under-reconstructed image pairs
//!
//! Every point that is created or modified is recorded so that the mapper can
//! hand them to local bundle adjustment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::observation_manager::ObservationManager;
use crate::error::{check_option, Result};
use crate::estimators::{estimate_triangulation, EstimateTriangulationOptions, RansacOptions, TriangulationObservation};
use crate::geometry::calculate_angular_error;
use crate::scene::{
    CameraId, Correspondence, DatabaseCache, ImageId, ImagePair, Point2DIdx, Point3DId, Reconstruction, Track,
    TrackElement,
};
use crate::sensor::Camera;

/// Remaining untriangulated observations needed to try another point.
const MIN_RECURSIVE_TRACK_LENGTH: usize = 3;

/// Tracks up to this length sample all view pairs.
const EXHAUSTIVE_SAMPLING_THRESHOLD: usize = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalTriangulatorOptions {
    /// Maximum hops in the correspondence graph when looking for views.
    pub max_transitivity: usize,
    /// Maximum angular error in degrees to create a new point.
    pub create_max_angle_error: f64,
    /// Maximum angular error in degrees to continue an existing track.
    pub continue_max_angle_error: f64,
    /// Maximum reprojection error in pixels to merge two tracks.
    pub merge_max_reproj_error: f64,
    /// Maximum reprojection error in pixels to complete a track.
    pub complete_max_reproj_error: f64,
    pub complete_max_transitivity: usize,
    /// Maximum angular error in degrees to continue tracks when
    /// retriangulating.
    pub re_max_angle_error: f64,
    /// Image pairs with a smaller ratio of triangulated correspondences are
    /// retriangulated.
    pub re_min_ratio: f64,
    pub re_max_trials: usize,
    /// Minimum triangulation angle in degrees.
    pub min_angle: f64,
    /// Skip correspondences that only link two keypoints.
    pub ignore_two_view_tracks: bool,
    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    pub max_extra_param: f64,
    pub random_seed: Option<u64>,
}

impl Default for IncrementalTriangulatorOptions {
    fn default() -> Self {
        Self {
            max_transitivity: 1,
            create_max_angle_error: 2.0,
            continue_max_angle_error: 2.0,
            merge_max_reproj_error: 4.0,
            complete_max_reproj_error: 4.0,
            complete_max_transitivity: 5,
            re_max_angle_error: 5.0,
            re_min_ratio: 0.2,
            re_max_trials: 1,
            min_angle: 1.5,
            ignore_two_view_tracks: true,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            max_extra_param: 1.0,
            random_seed: None,
        }
    }
}

impl IncrementalTriangulatorOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.max_transitivity > 0, "max_transitivity must be positive")?;
        check_option(self.create_max_angle_error > 0.0, "create_max_angle_error must be positive")?;
        check_option(self.continue_max_angle_error > 0.0, "continue_max_angle_error must be positive")?;
        check_option(self.merge_max_reproj_error > 0.0, "merge_max_reproj_error must be positive")?;
        check_option(self.complete_max_reproj_error > 0.0, "complete_max_reproj_error must be positive")?;
        check_option(self.complete_max_transitivity > 0, "complete_max_transitivity must be positive")?;
        check_option(self.re_max_angle_error > 0.0, "re_max_angle_error must be positive")?;
        check_option((0.0..=1.0).contains(&self.re_min_ratio), "re_min_ratio must be in [0, 1]")?;
        check_option(self.min_angle >= 0.0, "min_angle must be non-negative")?;
        check_option(
            self.min_focal_length_ratio > 0.0 && self.max_focal_length_ratio > self.min_focal_length_ratio,
            "focal length ratios must satisfy 0 < min < max",
        )?;
        check_option(self.max_extra_param >= 0.0, "max_extra_param must be non-negative")
    }

    /// Robust triangulation settings for a given angular error in degrees.
    fn estimation_options(&self, max_angle_error: f64) -> EstimateTriangulationOptions {
        EstimateTriangulationOptions {
            min_tri_angle: self.min_angle.to_radians(),
            ransac: RansacOptions {
                max_error: max_angle_error.to_radians(),
                min_inlier_ratio: 0.02,
                confidence: 0.9999,
                max_num_trials: 10_000,
                random_seed: self.random_seed,
                ..Default::default()
            },
            max_num_exhaustive_observations: EXHAUSTIVE_SAMPLING_THRESHOLD,
        }
    }
}

/// One keypoint taking part in a triangulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CorrData {
    image_id: ImageId,
    point2d_idx: Point2DIdx,
}

impl CorrData {
    fn new(image_id: ImageId, point2d_idx: Point2DIdx) -> Self {
        Self { image_id, point2d_idx }
    }

    fn track_element(&self) -> TrackElement {
        TrackElement::new(self.image_id, self.point2d_idx)
    }

    /// Point linked to the keypoint, read from the current model.
    fn point3d_id(&self, reconstruction: &Reconstruction) -> Option<Point3DId> {
        reconstruction
            .image(self.image_id)?
            .point2d(self.point2d_idx)?
            .point3d_id
    }

    fn observation(&self, reconstruction: &Reconstruction) -> Option<TriangulationObservation> {
        let (image, camera) = reconstruction.image_with_camera(self.image_id)?;
        let xy = image.point2d(self.point2d_idx)?.xy;
        let cam_from_world = reconstruction.cam_from_world(self.image_id)?;
        Some(TriangulationObservation::new(camera.cam_from_img(&xy), cam_from_world))
    }
}

/// Whether the keypoint `el` reprojects within `max_squared_error` of `xyz`.
fn reprojects_within(
    reconstruction: &Reconstruction,
    el: &TrackElement,
    xyz: &Vector3<f64>,
    max_squared_error: f64,
) -> bool {
    let Some((image, camera)) = reconstruction.image_with_camera(el.image_id) else {
        return false;
    };
    let (Some(point2d), Some(cam_from_world)) =
        (image.point2d(el.point2d_idx), reconstruction.cam_from_world(el.image_id))
    else {
        return false;
    };
    camera.squared_reprojection_error(&point2d.xy, xyz, &cam_from_world) <= max_squared_error
}

pub struct IncrementalTriangulator {
    database_cache: Arc<DatabaseCache>,
    camera_has_bogus_params: HashMap<CameraId, bool>,
    /// Point pairs whose merge was already attempted.
    merge_trials: HashMap<Point3DId, HashSet<Point3DId>>,
    /// Retriangulation attempts per image pair. Kept across calls.
    re_num_trials: HashMap<ImagePair, usize>,
    modified_point3d_ids: HashSet<Point3DId>,
}

impl IncrementalTriangulator {
    pub fn new(database_cache: Arc<DatabaseCache>) -> Self {
        Self {
            database_cache,
            camera_has_bogus_params: HashMap::new(),
            merge_trials: HashMap::new(),
            re_num_trials: HashMap::new(),
            modified_point3d_ids: HashSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Triangulation
    // ─────────────────────────────────────────────────────────────────────────

    /// Continue and create tracks for all keypoints of a registered image.
    ///
    /// # Returns
    /// * Number of added observations
    pub fn triangulate_image(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        image_id: ImageId,
    ) -> Result<usize> {
        self.clear_caches();
        let Some(num_points2d) = self.usable_image_points(options, reconstruction, image_id) else {
            return Ok(0);
        };

        let mut num_tris = 0;
        for point2d_idx in 0..num_points2d {
            let (mut corrs, num_triangulated) =
                self.find(options, reconstruction, image_id, point2d_idx, options.max_transitivity);
            if corrs.is_empty() {
                continue;
            }
            let ref_corr = CorrData::new(image_id, point2d_idx);
            if num_triangulated > 0 {
                num_tris += self.continue_track(options, reconstruction, obs_manager, ref_corr, &corrs)?;
            }
            corrs.push(ref_corr);
            num_tris += self.create(options, reconstruction, obs_manager, &corrs)?;
        }
        debug!("[Triangulator] Image {}: {} observations", image_id, num_tris);
        Ok(num_tris)
    }

    /// Complete the tracks of an image's points and create points for its
    /// keypoints whose correspondences are all untriangulated.
    pub fn complete_image(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        image_id: ImageId,
    ) -> Result<usize> {
        self.clear_caches();
        let Some(num_points2d) = self.usable_image_points(options, reconstruction, image_id) else {
            return Ok(0);
        };
        let cache = Arc::clone(&self.database_cache);
        let graph = cache.correspondence_graph();
        let estimation_options = options.estimation_options(options.create_max_angle_error);

        let mut num_tris = 0;
        for point2d_idx in 0..num_points2d {
            let ref_corr = CorrData::new(image_id, point2d_idx);
            if let Some(point3d_id) = ref_corr.point3d_id(reconstruction) {
                num_tris += self.complete(options, reconstruction, obs_manager, point3d_id)?;
                continue;
            }
            if options.ignore_two_view_tracks && graph.is_two_view_observation(image_id, point2d_idx) {
                continue;
            }

            let (mut corrs, num_triangulated) =
                self.find(options, reconstruction, image_id, point2d_idx, options.max_transitivity);
            if num_triangulated > 0 || corrs.is_empty() {
                continue;
            }
            corrs.push(ref_corr);
            num_tris += self.estimate_and_add(&estimation_options, reconstruction, obs_manager, &corrs)?;
        }
        Ok(num_tris)
    }

    /// Retriangulate image pairs with few triangulated correspondences.
    ///
    /// Each pair is attempted at most `re_max_trials` times over the lifetime
    /// of the triangulator.
    pub fn retriangulate(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
    ) -> Result<usize> {
        self.clear_caches();
        let re_options = IncrementalTriangulatorOptions {
            continue_max_angle_error: options.re_max_angle_error,
            ..options.clone()
        };
        let cache = Arc::clone(&self.database_cache);
        let graph = cache.correspondence_graph();

        let mut pairs: Vec<ImagePair> = obs_manager.image_pairs().keys().copied().collect();
        pairs.sort_unstable();

        let mut num_tris = 0;
        for pair in pairs {
            let Some(stat) = obs_manager.image_pair_stat(pair.first, pair.second).copied() else {
                continue;
            };
            if stat.num_total_corrs == 0 {
                continue;
            }
            let tri_ratio = stat.num_tri_corrs as f64 / stat.num_total_corrs as f64;
            if tri_ratio >= options.re_min_ratio {
                continue;
            }
            if !reconstruction.is_image_registered(pair.first) || !reconstruction.is_image_registered(pair.second) {
                continue;
            }

            let num_re_trials = self.re_num_trials.entry(pair).or_insert(0);
            if *num_re_trials >= options.re_max_trials {
                continue;
            }
            *num_re_trials += 1;

            if self.has_image_bogus_camera(options, reconstruction, pair.first)
                || self.has_image_bogus_camera(options, reconstruction, pair.second)
            {
                continue;
            }

            for m in graph.find_correspondences_between_images(pair.first, pair.second) {
                let corr1 = CorrData::new(pair.first, m.point2d_idx1);
                let corr2 = CorrData::new(pair.second, m.point2d_idx2);
                // Correspondences between two different points are left
                // alone; merging them would likely destroy both.
                num_tris += match (corr1.point3d_id(reconstruction), corr2.point3d_id(reconstruction)) {
                    (Some(_), Some(_)) => 0,
                    (Some(_), None) => self.continue_track(&re_options, reconstruction, obs_manager, corr2, &[corr1])?,
                    (None, Some(_)) => self.continue_track(&re_options, reconstruction, obs_manager, corr1, &[corr2])?,
                    (None, None) => self.create(options, reconstruction, obs_manager, &[corr1, corr2])?,
                };
            }
        }
        debug!("[Triangulator] Retriangulated {} observations", num_tris);
        Ok(num_tris)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Track Completion & Merging
    // ─────────────────────────────────────────────────────────────────────────

    pub fn complete_tracks<I>(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        point3d_ids: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = Point3DId>,
    {
        self.clear_caches();
        let mut num_completed = 0;
        for point3d_id in point3d_ids {
            num_completed += self.complete(options, reconstruction, obs_manager, point3d_id)?;
        }
        Ok(num_completed)
    }

    pub fn complete_all_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
    ) -> Result<usize> {
        let point3d_ids = reconstruction.point3d_ids();
        self.complete_tracks(options, reconstruction, obs_manager, point3d_ids)
    }

    pub fn merge_tracks<I>(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        point3d_ids: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = Point3DId>,
    {
        self.clear_caches();
        let mut num_merged = 0;
        for point3d_id in point3d_ids {
            num_merged += self.merge(options, reconstruction, obs_manager, point3d_id)?;
        }
        Ok(num_merged)
    }

    pub fn merge_all_tracks(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
    ) -> Result<usize> {
        let point3d_ids = reconstruction.point3d_ids();
        self.merge_tracks(options, reconstruction, obs_manager, point3d_ids)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Modified Points
    // ─────────────────────────────────────────────────────────────────────────

    /// Points created or changed since the last clear that still exist.
    pub fn modified_points3d(&self, reconstruction: &Reconstruction) -> HashSet<Point3DId> {
        self.modified_point3d_ids
            .iter()
            .copied()
            .filter(|id| reconstruction.exists_point3d(*id))
            .collect()
    }

    pub fn add_modified_point3d(&mut self, point3d_id: Point3DId) {
        self.modified_point3d_ids.insert(point3d_id);
    }

    pub fn clear_modified_points3d(&mut self) {
        self.modified_point3d_ids.clear();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn clear_caches(&mut self) {
        self.camera_has_bogus_params.clear();
        self.merge_trials.clear();
    }

    fn has_camera_bogus_params(&mut self, options: &IncrementalTriangulatorOptions, camera: &Camera) -> bool {
        *self
            .camera_has_bogus_params
            .entry(camera.camera_id)
            .or_insert_with(|| {
                camera.has_bogus_params(
                    options.min_focal_length_ratio,
                    options.max_focal_length_ratio,
                    options.max_extra_param,
                )
            })
    }

    fn has_image_bogus_camera(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &Reconstruction,
        image_id: ImageId,
    ) -> bool {
        match reconstruction.image_with_camera(image_id) {
            Some((_, camera)) => self.has_camera_bogus_params(options, camera),
            None => true,
        }
    }

    /// Number of keypoints of a registered image with sane intrinsics.
    fn usable_image_points(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &Reconstruction,
        image_id: ImageId,
    ) -> Option<usize> {
        if !reconstruction.is_image_registered(image_id) || self.has_image_bogus_camera(options, reconstruction, image_id) {
            return None;
        }
        reconstruction.image(image_id).map(|image| image.num_points2d())
    }

    /// Correspondences of a keypoint in registered images with sane cameras,
    /// and how many of them are triangulated.
    fn find(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &Reconstruction,
        image_id: ImageId,
        point2d_idx: Point2DIdx,
        transitivity: usize,
    ) -> (Vec<CorrData>, usize) {
        let graph = self.database_cache.correspondence_graph();
        let corrs: Vec<Correspondence> = if transitivity <= 1 {
            graph.find_correspondences(image_id, point2d_idx).to_vec()
        } else {
            graph.find_transitive_correspondences(image_id, point2d_idx, transitivity)
        };

        let mut corrs_data = Vec::with_capacity(corrs.len());
        let mut num_triangulated = 0;
        for corr in corrs {
            if !reconstruction.is_image_registered(corr.image_id) {
                continue;
            }
            let Some((image, camera)) = reconstruction.image_with_camera(corr.image_id) else {
                continue;
            };
            if self.has_camera_bogus_params(options, camera) {
                continue;
            }
            let Some(point2d) = image.point2d(corr.point2d_idx) else {
                continue;
            };
            if point2d.has_point3d() {
                num_triangulated += 1;
            }
            corrs_data.push(CorrData::new(corr.image_id, corr.point2d_idx));
        }
        (corrs_data, num_triangulated)
    }

    /// Create points from the untriangulated keypoints among `corrs`,
    /// recursing on the outliers while enough of them remain.
    fn create(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        corrs: &[CorrData],
    ) -> Result<usize> {
        let create_corrs: Vec<CorrData> = corrs
            .iter()
            .copied()
            .filter(|c| c.point3d_id(reconstruction).is_none())
            .collect();
        if create_corrs.len() < 2 {
            return Ok(0);
        }
        if options.ignore_two_view_tracks
            && create_corrs.len() == 2
            && self
                .database_cache
                .correspondence_graph()
                .is_two_view_observation(create_corrs[0].image_id, create_corrs[0].point2d_idx)
        {
            return Ok(0);
        }

        let estimation_options = options.estimation_options(options.create_max_angle_error);
        let track_len = self.estimate_and_add(&estimation_options, reconstruction, obs_manager, &create_corrs)?;
        if track_len > 0 && create_corrs.len() - track_len >= MIN_RECURSIVE_TRACK_LENGTH {
            return Ok(track_len + self.create(options, reconstruction, obs_manager, &create_corrs)?);
        }
        Ok(track_len)
    }

    /// Triangulate `corrs` robustly and add a point with the inlier track.
    ///
    /// # Returns
    /// * Length of the new track, 0 if estimation failed
    fn estimate_and_add(
        &mut self,
        estimation_options: &EstimateTriangulationOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        corrs: &[CorrData],
    ) -> Result<usize> {
        let mut used = Vec::with_capacity(corrs.len());
        let mut observations = Vec::with_capacity(corrs.len());
        for corr in corrs {
            if let Some(observation) = corr.observation(reconstruction) {
                used.push(*corr);
                observations.push(observation);
            }
        }
        let Some(estimate) = estimate_triangulation(estimation_options, &observations) else {
            return Ok(0);
        };

        let elements: Vec<TrackElement> = used
            .iter()
            .zip(&estimate.inlier_mask)
            .filter(|(_, inlier)| **inlier)
            .map(|(corr, _)| corr.track_element())
            .collect();
        if elements.len() < 2 {
            return Ok(0);
        }
        let track_len = elements.len();
        let point3d_id = obs_manager.add_point3d(reconstruction, estimate.xyz, Track::from_elements(elements))?;
        self.modified_point3d_ids.insert(point3d_id);
        Ok(track_len)
    }

    /// Add `ref_corr` to the triangulated point among `corrs` that explains it
    /// with the smallest angular error.
    fn continue_track(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        ref_corr: CorrData,
        corrs: &[CorrData],
    ) -> Result<usize> {
        if ref_corr.point3d_id(reconstruction).is_some() {
            return Ok(0);
        }
        let Some(ref_observation) = ref_corr.observation(reconstruction) else {
            return Ok(0);
        };

        let mut best: Option<(Point3DId, f64)> = None;
        for corr in corrs {
            let Some(point3d) = corr
                .point3d_id(reconstruction)
                .and_then(|id| reconstruction.point3d(id))
            else {
                continue;
            };
            let angle_error = calculate_angular_error(
                &ref_observation.point,
                &point3d.xyz,
                &ref_observation.cam_from_world,
            );
            if best.map_or(true, |(_, best_error)| angle_error < best_error) {
                best = Some((point3d.id, angle_error));
            }
        }

        match best {
            Some((point3d_id, angle_error)) if angle_error <= options.continue_max_angle_error.to_radians() => {
                obs_manager.add_observation(reconstruction, point3d_id, ref_corr.track_element())?;
                self.modified_point3d_ids.insert(point3d_id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    /// Extend a track breadth-first along the correspondence graph.
    fn complete(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        point3d_id: Point3DId,
    ) -> Result<usize> {
        let Some(point3d) = reconstruction.point3d(point3d_id) else {
            return Ok(0);
        };
        let xyz = point3d.xyz;
        let mut queue = point3d.track.elements().to_vec();
        let max_squared_error = options.complete_max_reproj_error * options.complete_max_reproj_error;
        let cache = Arc::clone(&self.database_cache);
        let graph = cache.correspondence_graph();

        let mut num_completed = 0;
        for transitivity in 0..options.complete_max_transitivity {
            if queue.is_empty() {
                break;
            }
            let prev_queue = std::mem::take(&mut queue);
            for queue_el in prev_queue {
                for corr in graph.find_correspondences(queue_el.image_id, queue_el.point2d_idx) {
                    if !reconstruction.is_image_registered(corr.image_id) {
                        continue;
                    }
                    let el = TrackElement::new(corr.image_id, corr.point2d_idx);
                    let free = reconstruction
                        .image(corr.image_id)
                        .and_then(|image| image.point2d(corr.point2d_idx))
                        .is_some_and(|p| !p.has_point3d());
                    if !free || self.has_image_bogus_camera(options, reconstruction, corr.image_id) {
                        continue;
                    }
                    if !reprojects_within(reconstruction, &el, &xyz, max_squared_error) {
                        continue;
                    }

                    obs_manager.add_observation(reconstruction, point3d_id, el)?;
                    self.modified_point3d_ids.insert(point3d_id);
                    if transitivity + 1 < options.complete_max_transitivity {
                        queue.push(el);
                    }
                    num_completed += 1;
                }
            }
        }
        Ok(num_completed)
    }

    /// Merge a point with corresponding points whose joint position
    /// reprojects well into every observation, then recurse on the result.
    fn merge(
        &mut self,
        options: &IncrementalTriangulatorOptions,
        reconstruction: &mut Reconstruction,
        obs_manager: &mut ObservationManager,
        point3d_id: Point3DId,
    ) -> Result<usize> {
        let Some(point3d) = reconstruction.point3d(point3d_id) else {
            return Ok(0);
        };
        let elements = point3d.track.elements().to_vec();
        let max_squared_error = options.merge_max_reproj_error * options.merge_max_reproj_error;
        let cache = Arc::clone(&self.database_cache);
        let graph = cache.correspondence_graph();

        for el in elements {
            for corr in graph.find_correspondences(el.image_id, el.point2d_idx) {
                if !reconstruction.is_image_registered(corr.image_id) {
                    continue;
                }
                let Some(corr_point3d_id) = CorrData::new(corr.image_id, corr.point2d_idx).point3d_id(reconstruction)
                else {
                    continue;
                };
                if corr_point3d_id == point3d_id
                    || self
                        .merge_trials
                        .get(&point3d_id)
                        .is_some_and(|tried| tried.contains(&corr_point3d_id))
                {
                    continue;
                }
                self.merge_trials.entry(point3d_id).or_default().insert(corr_point3d_id);
                self.merge_trials.entry(corr_point3d_id).or_default().insert(point3d_id);

                let (Some(point1), Some(point2)) =
                    (reconstruction.point3d(point3d_id), reconstruction.point3d(corr_point3d_id))
                else {
                    continue;
                };
                let weight1 = point1.track.len() as f64;
                let weight2 = point2.track.len() as f64;
                let merged_xyz = (weight1 * point1.xyz + weight2 * point2.xyz) / (weight1 + weight2);
                let merge_success = point1
                    .track
                    .elements()
                    .iter()
                    .chain(point2.track.elements())
                    .all(|test_el| reprojects_within(reconstruction, test_el, &merged_xyz, max_squared_error));
                if !merge_success {
                    continue;
                }

                let num_merged = point1.track.len() + point2.track.len();
                let merged_point3d_id = obs_manager.merge_points3d(reconstruction, point3d_id, corr_point3d_id)?;
                self.modified_point3d_ids.remove(&point3d_id);
                self.modified_point3d_ids.remove(&corr_point3d_id);
                self.modified_point3d_ids.insert(merged_point3d_id);

                let num_merged_recursive = self.merge(options, reconstruction, obs_manager, merged_point3d_id)?;
                return Ok(if num_merged_recursive > 0 {
                    num_merged_recursive
                } else {
                    num_merged
                });
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{synthesize_dataset, SyntheticDatasetOptions};

    struct Session {
        cache: Arc<DatabaseCache>,
        reconstruction: Reconstruction,
        obs_manager: ObservationManager,
        triangulator: IncrementalTriangulator,
        ground_truth: Reconstruction,
    }

    /// Ground-truth poses registered, no points.
    fn posed_session() -> Session {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default()).unwrap();
        let cache = Arc::new(dataset.database_cache);
        let mut reconstruction = Reconstruction::new();
        reconstruction.load(&cache);
        for frame_id in dataset.ground_truth.reg_frame_ids() {
            let pose = dataset.ground_truth.frame(*frame_id).unwrap().rig_from_world.unwrap();
            reconstruction.register_frame(*frame_id, pose).unwrap();
        }
        let obs_manager = ObservationManager::new(&reconstruction, Arc::clone(&cache));
        let triangulator = IncrementalTriangulator::new(Arc::clone(&cache));
        Session {
            cache,
            reconstruction,
            obs_manager,
            triangulator,
            ground_truth: dataset.ground_truth,
        }
    }

    /// Ground-truth point with at least `min_len` observations.
    fn long_gt_point(gt: &Reconstruction, min_len: usize) -> Point3DId {
        let mut ids = gt.point3d_ids();
        ids.sort_unstable();
        ids.into_iter()
            .find(|id| gt.point3d(*id).unwrap().track.len() >= min_len)
            .unwrap()
    }

    #[test]
    fn test_triangulate_all_images() {
        let mut s = posed_session();
        let options = IncrementalTriangulatorOptions::default();
        let mut total = 0;
        for image_id in s.reconstruction.reg_image_ids() {
            total += s
                .triangulator
                .triangulate_image(&options, &mut s.reconstruction, &mut s.obs_manager, image_id)
                .unwrap();
        }
        assert!(total > 0);
        assert_eq!(total, s.reconstruction.compute_num_observations());
        assert!(s.reconstruction.num_points3d() > s.ground_truth.num_points3d() / 2);
        assert!(s.reconstruction.compute_mean_reprojection_error() < 1e-6);
        assert_eq!(
            s.triangulator.modified_points3d(&s.reconstruction).len(),
            s.reconstruction.num_points3d()
        );

        s.triangulator.clear_modified_points3d();
        assert!(s.triangulator.modified_points3d(&s.reconstruction).is_empty());
    }

    #[test]
    fn test_continue_existing_track() {
        let mut s = posed_session();
        let gt_id = long_gt_point(&s.ground_truth, 3);
        let gt_point = s.ground_truth.point3d(gt_id).unwrap().clone();
        let elements = gt_point.track.elements();
        let seed = Track::from_elements(elements[..2].to_vec());
        let point3d_id = s
            .obs_manager
            .add_point3d(&mut s.reconstruction, gt_point.xyz, seed)
            .unwrap();

        let third = elements[2];
        s.triangulator
            .triangulate_image(
                &IncrementalTriangulatorOptions::default(),
                &mut s.reconstruction,
                &mut s.obs_manager,
                third.image_id,
            )
            .unwrap();
        let point2d = s
            .reconstruction
            .image(third.image_id)
            .unwrap()
            .point2d(third.point2d_idx)
            .unwrap();
        assert_eq!(point2d.point3d_id, Some(point3d_id));
    }

    #[test]
    fn test_complete_tracks() {
        let mut s = posed_session();
        let gt_id = long_gt_point(&s.ground_truth, 4);
        let gt_point = s.ground_truth.point3d(gt_id).unwrap().clone();
        let seed = Track::from_elements(gt_point.track.elements()[..2].to_vec());
        let point3d_id = s
            .obs_manager
            .add_point3d(&mut s.reconstruction, gt_point.xyz, seed)
            .unwrap();

        let num_completed = s
            .triangulator
            .complete_tracks(
                &IncrementalTriangulatorOptions::default(),
                &mut s.reconstruction,
                &mut s.obs_manager,
                [point3d_id],
            )
            .unwrap();
        assert_eq!(num_completed, gt_point.track.len() - 2);
        assert_eq!(
            s.reconstruction.point3d(point3d_id).unwrap().track.len(),
            gt_point.track.len()
        );
    }

    #[test]
    fn test_merge_split_track() {
        let mut s = posed_session();
        let gt_id = long_gt_point(&s.ground_truth, 4);
        let gt_point = s.ground_truth.point3d(gt_id).unwrap().clone();
        let elements = gt_point.track.elements();
        let id1 = s
            .obs_manager
            .add_point3d(
                &mut s.reconstruction,
                gt_point.xyz,
                Track::from_elements(elements[..2].to_vec()),
            )
            .unwrap();
        let id2 = s
            .obs_manager
            .add_point3d(
                &mut s.reconstruction,
                gt_point.xyz + Vector3::new(1e-4, 0.0, 0.0),
                Track::from_elements(elements[2..4].to_vec()),
            )
            .unwrap();

        let num_merged = s
            .triangulator
            .merge_all_tracks(
                &IncrementalTriangulatorOptions::default(),
                &mut s.reconstruction,
                &mut s.obs_manager,
            )
            .unwrap();
        assert_eq!(num_merged, 4);
        assert!(!s.reconstruction.exists_point3d(id1));
        assert!(!s.reconstruction.exists_point3d(id2));
        assert_eq!(s.reconstruction.num_points3d(), 1);
        let modified = s.triangulator.modified_points3d(&s.reconstruction);
        assert_eq!(modified.len(), 1);
    }

    #[test]
    fn test_retriangulate_attempts_each_pair_once() {
        let mut s = posed_session();
        let options = IncrementalTriangulatorOptions::default();
        let num_tris = s
            .triangulator
            .retriangulate(&options, &mut s.reconstruction, &mut s.obs_manager)
            .unwrap();
        assert!(num_tris > 0);
        assert!(s.reconstruction.compute_mean_reprojection_error() < 1e-6);
        let attempted: HashSet<ImagePair> = s.triangulator.re_num_trials.keys().copied().collect();
        assert!(!attempted.is_empty());

        // Pairs skipped above for their triangulation ratio become eligible
        // once the model is cleared; the attempted ones stay exhausted.
        for point3d_id in s.reconstruction.point3d_ids() {
            s.obs_manager
                .delete_point3d(&mut s.reconstruction, point3d_id)
                .unwrap();
        }
        let again = s
            .triangulator
            .retriangulate(&options, &mut s.reconstruction, &mut s.obs_manager)
            .unwrap();
        assert!(s
            .triangulator
            .re_num_trials
            .values()
            .all(|&n| n <= options.re_max_trials));
        for pair in &attempted {
            assert_eq!(s.triangulator.re_num_trials[pair], options.re_max_trials);
        }
        let newly_attempted = s
            .triangulator
            .re_num_trials
            .keys()
            .filter(|pair| !attempted.contains(*pair))
            .count();
        if again > 0 {
            assert!(newly_attempted > 0);
        }

        assert_eq!(s.cache.num_images(), 5);
    }

    #[test]
    fn test_bogus_camera_is_skipped() {
        let mut s = posed_session();
        let image_id = ImageId::new(1);
        let camera_id = s.reconstruction.image(image_id).unwrap().camera_id;
        s.reconstruction.camera_mut(camera_id).unwrap().set_focal_length(1e6);
        let num_tris = s
            .triangulator
            .triangulate_image(
                &IncrementalTriangulatorOptions::default(),
                &mut s.reconstruction,
                &mut s.obs_manager,
                image_id,
            )
            .unwrap();
        assert_eq!(num_tris, 0);
        assert_eq!(s.reconstruction.num_points3d(), 0);
    }
}
