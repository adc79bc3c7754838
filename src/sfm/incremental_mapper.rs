//! Incremental Mapper - the reconstruction controller.
//!
//! Binds to one shared [`Reconstruction`] per session and drives it:
//! 1. Initial pair search and registration
//! 2. Next-image ranking and generalized (rig) registration
//! 3. Triangulation, track completion and merging through the
//!    [`IncrementalTriangulator`]
//! 4. Local and global bundle adjustment with iterative refinement
//! 5. Point and frame filtering
//!
//! Registration statistics survive `end_reconstruction`, so one mapper can
//! build several models from the same image set without claiming an image
//! twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::incremental_triangulator::{IncrementalTriangulator, IncrementalTriangulatorOptions};
use super::observation_manager::ObservationManager;
use crate::error::{check_option, Result, SfmError};
use crate::estimators::{
    estimate_generalized_absolute_pose, estimate_relative_pose, refine_generalized_absolute_pose,
    AbsolutePoseEstimationOptions, AbsolutePoseRefinementOptions, BundleAdjuster, BundleAdjustmentConfig,
    BundleAdjustmentOptions, BundleAdjustmentSummary, LossFunctionType, PoseCorrespondence,
    PosePriorBundleAdjustmentOptions, RansacOptions, TwoViewGeometryOptions,
};
use crate::geometry::{
    calculate_triangulation_angle, calculate_triangulation_angles, has_point_positive_depth, percentile,
    triangulate_point, Rigid3d,
};
use crate::scene::{
    CameraId, DatabaseCache, FrameId, ImageId, ImagePair, Point2DIdx, Point3DId, Reconstruction, RigId,
    SharedReconstruction, Track, TrackElement,
};
use crate::sensor::{Camera, SensorId};

/// Frames needed before bogus-camera frames are filtered.
const MIN_NUM_REG_FRAMES_FOR_FRAME_FILTER: usize = 20;

/// Below this many frames global BA runs with stricter tolerances.
const MIN_NUM_REG_FRAMES_FOR_RELAXED_GLOBAL_BA: usize = 10;

/// Points with longer tracks and a known error stay fixed in local BA.
const MAX_LOCAL_BA_VARIABLE_TRACK_LENGTH: usize = 15;

const LOCAL_BUNDLE_TRI_ANGLE_PERCENTILE: f64 = 75.0;

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Ranking used by [`IncrementalMapper::find_next_images`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageSelectionMethod {
    /// Most keypoints linked to triangulated correspondences.
    MaxVisiblePointsNum,
    /// Largest share of observations linked to triangulated correspondences.
    MaxVisiblePointsRatio,
    /// Best spatial coverage of the visible points (visibility pyramid).
    #[default]
    MinUncertainty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalMapperOptions {
    pub init_min_num_inliers: usize,
    /// Maximum two-view error in pixels.
    pub init_max_error: f64,
    /// Maximum `|t_z|` of the unit-baseline relative pose.
    pub init_max_forward_motion: f64,
    /// Minimum median triangulation angle in degrees.
    pub init_min_tri_angle: f64,
    pub init_max_reg_trials: usize,

    /// Maximum reprojection error in pixels.
    pub abs_pose_max_error: f64,
    pub abs_pose_min_num_inliers: usize,
    pub abs_pose_min_inlier_ratio: f64,
    pub abs_pose_refine_focal_length: bool,
    pub abs_pose_refine_extra_params: bool,

    /// Images in the local bundle, including the reference image.
    pub local_ba_num_images: usize,
    /// Minimum triangulation angle in degrees to select a bundle image.
    pub local_ba_min_tri_angle: f64,

    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    pub max_extra_param: f64,

    /// Maximum reprojection error in pixels of a kept observation.
    pub filter_max_reproj_error: f64,
    /// Minimum triangulation angle in degrees of a kept point.
    pub filter_min_tri_angle: f64,

    pub max_reg_trials: usize,
    /// Keep frames registered before the session constant.
    pub fix_existing_frames: bool,

    pub use_prior_position: bool,
    pub use_robust_loss_on_prior_position: bool,
    pub prior_position_loss_scale: f64,

    pub num_threads: i32,
    pub image_selection_method: ImageSelectionMethod,
    pub random_seed: Option<u64>,
}

impl Default for IncrementalMapperOptions {
    fn default() -> Self {
        Self {
            init_min_num_inliers: 100,
            init_max_error: 4.0,
            init_max_forward_motion: 0.95,
            init_min_tri_angle: 16.0,
            init_max_reg_trials: 2,
            abs_pose_max_error: 12.0,
            abs_pose_min_num_inliers: 30,
            abs_pose_min_inlier_ratio: 0.25,
            abs_pose_refine_focal_length: true,
            abs_pose_refine_extra_params: true,
            local_ba_num_images: 6,
            local_ba_min_tri_angle: 6.0,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            max_extra_param: 1.0,
            filter_max_reproj_error: 4.0,
            filter_min_tri_angle: 1.5,
            max_reg_trials: 3,
            fix_existing_frames: false,
            use_prior_position: false,
            use_robust_loss_on_prior_position: false,
            prior_position_loss_scale: 7.815,
            num_threads: -1,
            image_selection_method: ImageSelectionMethod::MinUncertainty,
            random_seed: None,
        }
    }
}

impl IncrementalMapperOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.init_min_num_inliers > 0, "init_min_num_inliers must be positive")?;
        check_option(self.init_max_error > 0.0, "init_max_error must be positive")?;
        check_option(
            (0.0..=1.0).contains(&self.init_max_forward_motion),
            "init_max_forward_motion must be in [0, 1]",
        )?;
        check_option(self.init_min_tri_angle >= 0.0, "init_min_tri_angle must be non-negative")?;
        check_option(self.init_max_reg_trials > 0, "init_max_reg_trials must be positive")?;
        check_option(self.abs_pose_max_error > 0.0, "abs_pose_max_error must be positive")?;
        check_option(self.abs_pose_min_num_inliers > 0, "abs_pose_min_num_inliers must be positive")?;
        check_option(
            (0.0..=1.0).contains(&self.abs_pose_min_inlier_ratio),
            "abs_pose_min_inlier_ratio must be in [0, 1]",
        )?;
        check_option(self.local_ba_num_images >= 2, "local_ba_num_images must be at least 2")?;
        check_option(self.local_ba_min_tri_angle >= 0.0, "local_ba_min_tri_angle must be non-negative")?;
        check_option(
            self.min_focal_length_ratio > 0.0 && self.max_focal_length_ratio > self.min_focal_length_ratio,
            "focal length ratios must satisfy 0 < min < max",
        )?;
        check_option(self.max_extra_param >= 0.0, "max_extra_param must be non-negative")?;
        check_option(self.filter_max_reproj_error > 0.0, "filter_max_reproj_error must be positive")?;
        check_option(self.filter_min_tri_angle >= 0.0, "filter_min_tri_angle must be non-negative")?;
        check_option(self.max_reg_trials > 0, "max_reg_trials must be positive")?;
        check_option(self.prior_position_loss_scale > 0.0, "prior_position_loss_scale must be positive")
    }

    fn pose_prior_options(&self) -> PosePriorBundleAdjustmentOptions {
        PosePriorBundleAdjustmentOptions {
            use_robust_loss_on_prior_position: self.use_robust_loss_on_prior_position,
            prior_position_loss_scale: self.prior_position_loss_scale,
            ..Default::default()
        }
    }

    fn has_bogus_params(&self, camera: &Camera) -> bool {
        camera.has_bogus_params(
            self.min_focal_length_ratio,
            self.max_focal_length_ratio,
            self.max_extra_param,
        )
    }
}

/// Observation counts of one local bundle adjustment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBundleAdjustmentReport {
    pub num_merged_observations: usize,
    pub num_completed_observations: usize,
    pub num_filtered_observations: usize,
    pub num_adjusted_observations: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Counters kept for the lifetime of the mapper.
#[derive(Debug, Clone, Default)]
struct RegistrationStatistics {
    /// Images registered in at least one reconstruction.
    num_total_reg_images: usize,
    /// Images of the current session also registered in another one.
    num_shared_reg_images: usize,
    /// Registered frames per rig in the current session.
    num_reg_frames_per_rig: HashMap<RigId, usize>,
    /// Registered images per camera in the current session.
    num_reg_images_per_camera: HashMap<CameraId, usize>,
    /// Number of reconstructions each image is registered in.
    num_registrations: HashMap<ImageId, usize>,
    init_num_reg_trials: HashMap<ImageId, usize>,
    init_image_pairs: HashSet<ImagePair>,
    /// Registration attempts in the current session.
    num_reg_trials: HashMap<ImageId, usize>,
}

impl RegistrationStatistics {
    fn register_frame_event(&mut self, reconstruction: &Reconstruction, frame_id: FrameId) {
        let Some(frame) = reconstruction.frame(frame_id) else {
            return;
        };
        *self.num_reg_frames_per_rig.entry(frame.rig_id).or_default() += 1;
        for image_id in &frame.image_ids {
            let Some(image) = reconstruction.image(*image_id) else {
                continue;
            };
            *self.num_reg_images_per_camera.entry(image.camera_id).or_default() += 1;
            let num_regs = self.num_registrations.entry(*image_id).or_default();
            *num_regs += 1;
            if *num_regs == 1 {
                self.num_total_reg_images += 1;
            } else {
                self.num_shared_reg_images += 1;
            }
        }
    }

    fn deregister_frame_event(&mut self, reconstruction: &Reconstruction, frame_id: FrameId) {
        let Some(frame) = reconstruction.frame(frame_id) else {
            return;
        };
        if let Some(count) = self.num_reg_frames_per_rig.get_mut(&frame.rig_id) {
            *count = count.saturating_sub(1);
        }
        for image_id in &frame.image_ids {
            let Some(image) = reconstruction.image(*image_id) else {
                continue;
            };
            if let Some(count) = self.num_reg_images_per_camera.get_mut(&image.camera_id) {
                *count = count.saturating_sub(1);
            }
            let Some(num_regs) = self.num_registrations.get_mut(image_id) else {
                continue;
            };
            if *num_regs == 0 {
                continue;
            }
            *num_regs -= 1;
            if *num_regs == 0 {
                self.num_total_reg_images = self.num_total_reg_images.saturating_sub(1);
            } else {
                self.num_shared_reg_images = self.num_shared_reg_images.saturating_sub(1);
            }
        }
    }

    fn num_registrations(&self, image_id: ImageId) -> usize {
        self.num_registrations.get(&image_id).copied().unwrap_or(0)
    }

    fn init_num_reg_trials(&self, image_id: ImageId) -> usize {
        self.init_num_reg_trials.get(&image_id).copied().unwrap_or(0)
    }

    fn num_reg_trials(&self, image_id: ImageId) -> usize {
        self.num_reg_trials.get(&image_id).copied().unwrap_or(0)
    }
}

/// Collaborators bound to one reconstruction.
struct Session {
    reconstruction: SharedReconstruction,
    obs_manager: ObservationManager,
    triangulator: IncrementalTriangulator,
}

/// Initial pair candidate ranking key.
struct InitCandidate {
    image_id: ImageId,
    has_prior_focal_length: bool,
    num_correspondences: usize,
}

fn sort_init_candidates(candidates: &mut [InitCandidate]) {
    candidates.sort_by(|a, b| {
        b.has_prior_focal_length
            .cmp(&a.has_prior_focal_length)
            .then(b.num_correspondences.cmp(&a.num_correspondences))
            .then(a.image_id.cmp(&b.image_id))
    });
}

fn frame_of(reconstruction: &Reconstruction, image_id: ImageId) -> Result<FrameId> {
    reconstruction
        .image(image_id)
        .map(|image| image.frame_id)
        .ok_or(SfmError::UnknownImage(image_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Mapper
// ─────────────────────────────────────────────────────────────────────────────

pub struct IncrementalMapper {
    database_cache: Arc<DatabaseCache>,
    session: Option<Session>,
    stats: RegistrationStatistics,
    /// Frames deregistered for bogus intrinsics in the current session.
    filtered_frames: HashSet<FrameId>,
    /// Frames registered when the session began.
    existing_frame_ids: HashSet<FrameId>,
}

impl IncrementalMapper {
    pub fn new(database_cache: Arc<DatabaseCache>) -> Self {
        Self {
            database_cache,
            session: None,
            stats: RegistrationStatistics::default(),
            filtered_frames: HashSet::new(),
            existing_frame_ids: HashSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind to a reconstruction and load the database into it.
    ///
    /// Frames the reconstruction already registered count as registrations of
    /// this session.
    ///
    /// # Errors
    /// * `ReconstructionAlreadyBound` if a session is active
    pub fn begin_reconstruction(&mut self, reconstruction: SharedReconstruction) -> Result<()> {
        if self.session.is_some() {
            return Err(SfmError::ReconstructionAlreadyBound);
        }

        let (obs_manager, existing_frame_ids) = {
            let mut rec = reconstruction.write();
            rec.load(&self.database_cache);

            self.stats.num_shared_reg_images = 0;
            self.stats.num_reg_frames_per_rig.clear();
            self.stats.num_reg_images_per_camera.clear();
            let existing_frame_ids: HashSet<FrameId> = rec.reg_frame_ids().iter().copied().collect();
            for frame_id in rec.reg_frame_ids() {
                self.stats.register_frame_event(&rec, *frame_id);
            }
            (
                ObservationManager::new(&rec, Arc::clone(&self.database_cache)),
                existing_frame_ids,
            )
        };

        info!(
            "[Mapper] Begin reconstruction with {} existing frames",
            existing_frame_ids.len()
        );
        self.existing_frame_ids = existing_frame_ids;
        self.filtered_frames.clear();
        self.stats.num_reg_trials.clear();
        self.session = Some(Session {
            reconstruction,
            obs_manager,
            triangulator: IncrementalTriangulator::new(Arc::clone(&self.database_cache)),
        });
        Ok(())
    }

    /// Unbind from the current reconstruction.
    ///
    /// With `discard` the registrations of this session are removed from the
    /// statistics, so its images become available to later sessions.
    pub fn end_reconstruction(&mut self, discard: bool) -> Result<()> {
        let session = self.session.take().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        if discard {
            for frame_id in rec.reg_frame_ids().clone() {
                self.stats.deregister_frame_event(&rec, frame_id);
            }
        }
        rec.tear_down();
        info!(
            "[Mapper] End reconstruction (discard={}), {} images registered overall",
            discard, self.stats.num_total_reg_images
        );
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(SfmError::NoReconstruction)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Find an initial image pair with a well-conditioned relative pose.
    ///
    /// With both ids only that pair is tried; with one id only pairs seeded by
    /// that image are tried. Every attempted pair is recorded and never tried
    /// again until [`reset_initialization_stats`](Self::reset_initialization_stats).
    ///
    /// # Returns
    /// * `(image_id1, image_id2, cam2_from_cam1)` or `None` if no pair qualifies
    pub fn find_initial_image_pair(
        &mut self,
        options: &IncrementalMapperOptions,
        image_id1: Option<ImageId>,
        image_id2: Option<ImageId>,
    ) -> Result<Option<(ImageId, ImageId, Rigid3d)>> {
        options.check()?;
        self.session()?;

        let (image_id1, image_id2) = match (image_id1, image_id2) {
            (None, Some(id)) => (Some(id), None),
            ids => ids,
        };
        for image_id in [image_id1, image_id2].into_iter().flatten() {
            if !self.database_cache.exists_image(image_id) {
                return Err(SfmError::UnknownImage(image_id));
            }
        }

        let first_ids = match image_id1 {
            Some(id) => vec![id],
            None => self.find_first_initial_images(options),
        };
        for first_id in first_ids {
            let second_ids = match image_id2 {
                Some(id) => vec![id],
                None => self.find_second_initial_images(options, first_id),
            };
            for second_id in second_ids {
                if first_id == second_id || self.same_frame(first_id, second_id) {
                    continue;
                }
                if !self.stats.init_image_pairs.insert(ImagePair::new(first_id, second_id)) {
                    continue;
                }
                if let Some(cam2_from_cam1) = self.estimate_initial_two_view_geometry(options, first_id, second_id)? {
                    info!("[Mapper] Initial pair: images {} and {}", first_id, second_id);
                    return Ok(Some((first_id, second_id, cam2_from_cam1)));
                }
            }
        }
        Ok(None)
    }

    /// Relative pose of an image pair if it is good enough to initialize.
    ///
    /// # Returns
    /// * `cam2_from_cam1` with unit baseline, `None` if the geometry has too
    ///   few inliers, mostly forward motion or a small triangulation angle
    pub fn estimate_initial_two_view_geometry(
        &self,
        options: &IncrementalMapperOptions,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<Option<Rigid3d>> {
        let cache = &self.database_cache;
        let image1 = cache.image(image_id1).ok_or(SfmError::UnknownImage(image_id1))?;
        let image2 = cache.image(image_id2).ok_or(SfmError::UnknownImage(image_id2))?;
        let camera1 = cache.camera(image1.camera_id).ok_or(SfmError::UnknownCamera(image1.camera_id))?;
        let camera2 = cache.camera(image2.camera_id).ok_or(SfmError::UnknownCamera(image2.camera_id))?;

        let points1: Vec<_> = image1.points2d.iter().map(|p| p.xy).collect();
        let points2: Vec<_> = image2.points2d.iter().map(|p| p.xy).collect();
        let matches = cache
            .correspondence_graph()
            .find_correspondences_between_images(image_id1, image_id2);

        let two_view_options = TwoViewGeometryOptions {
            max_error: options.init_max_error,
            min_num_inliers: options.init_min_num_inliers,
            ransac: RansacOptions {
                max_error: options.init_max_error,
                confidence: 0.999,
                min_num_trials: 30,
                random_seed: options.random_seed,
                ..Default::default()
            },
        };
        let Some(geometry) = estimate_relative_pose(camera1, &points1, camera2, &points2, &matches, &two_view_options)
        else {
            return Ok(None);
        };

        let accepted = geometry.inlier_matches.len() >= options.init_min_num_inliers
            && geometry.cam2_from_cam1.translation.z.abs() < options.init_max_forward_motion
            && geometry.tri_angle > options.init_min_tri_angle.to_radians();
        debug!(
            "[Mapper] Two-view geometry {}-{}: {} inliers, tri_angle={:.2}deg, accepted={}",
            image_id1,
            image_id2,
            geometry.inlier_matches.len(),
            geometry.tri_angle.to_degrees(),
            accepted
        );
        Ok(accepted.then_some(geometry.cam2_from_cam1))
    }

    /// Images ranked as the first image of an initial pair.
    fn find_first_initial_images(&self, options: &IncrementalMapperOptions) -> Vec<ImageId> {
        let graph = self.database_cache.correspondence_graph();
        let mut candidates: Vec<InitCandidate> = self
            .database_cache
            .images()
            .values()
            .filter_map(|image| {
                let num_correspondences = graph.num_correspondences_for_image(image.image_id);
                if num_correspondences == 0
                    || self.stats.init_num_reg_trials(image.image_id) >= options.init_max_reg_trials
                    || self.stats.num_registrations(image.image_id) > 0
                {
                    return None;
                }
                Some(InitCandidate {
                    image_id: image.image_id,
                    has_prior_focal_length: self
                        .database_cache
                        .camera(image.camera_id)
                        .is_some_and(|camera| camera.has_prior_focal_length),
                    num_correspondences,
                })
            })
            .collect();
        sort_init_candidates(&mut candidates);
        candidates.into_iter().map(|c| c.image_id).collect()
    }

    /// Images ranked as partner of `image_id1`, counting only correspondences
    /// to images not registered in any reconstruction.
    fn find_second_initial_images(&self, options: &IncrementalMapperOptions, image_id1: ImageId) -> Vec<ImageId> {
        let graph = self.database_cache.correspondence_graph();
        let Some(image1) = self.database_cache.image(image_id1) else {
            return Vec::new();
        };

        let mut num_correspondences: HashMap<ImageId, usize> = HashMap::new();
        for point2d_idx in 0..image1.num_points2d() {
            for corr in graph.find_correspondences(image_id1, point2d_idx) {
                if self.stats.num_registrations(corr.image_id) == 0 {
                    *num_correspondences.entry(corr.image_id).or_default() += 1;
                }
            }
        }

        let mut candidates: Vec<InitCandidate> = num_correspondences
            .into_iter()
            .filter_map(|(image_id, num_correspondences)| {
                if num_correspondences < options.init_min_num_inliers
                    || self.stats.init_num_reg_trials(image_id) >= options.init_max_reg_trials
                {
                    return None;
                }
                let image = self.database_cache.image(image_id)?;
                if image.frame_id == image1.frame_id {
                    return None;
                }
                Some(InitCandidate {
                    image_id,
                    has_prior_focal_length: self
                        .database_cache
                        .camera(image.camera_id)
                        .is_some_and(|camera| camera.has_prior_focal_length),
                    num_correspondences,
                })
            })
            .collect();
        sort_init_candidates(&mut candidates);
        candidates.into_iter().map(|c| c.image_id).collect()
    }

    fn same_frame(&self, image_id1: ImageId, image_id2: ImageId) -> bool {
        match (self.database_cache.image(image_id1), self.database_cache.image(image_id2)) {
            (Some(image1), Some(image2)) => image1.frame_id == image2.frame_id,
            _ => false,
        }
    }

    /// Register the frames of an initial pair and triangulate their matches.
    ///
    /// The first camera becomes the world origin.
    ///
    /// # Errors
    /// * `ReconstructionNotEmpty` if any frame is registered already
    /// * `SameFrame` if both images belong to one frame
    pub fn register_initial_image_pair(
        &mut self,
        options: &IncrementalMapperOptions,
        image_id1: ImageId,
        image_id2: ImageId,
        cam2_from_cam1: Rigid3d,
    ) -> Result<()> {
        options.check()?;
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut guard = session.reconstruction.write();
        let rec = &mut *guard;

        let num_reg_frames = rec.num_reg_frames();
        if num_reg_frames != 0 {
            return Err(SfmError::ReconstructionNotEmpty(num_reg_frames));
        }
        let frame_id1 = frame_of(rec, image_id1)?;
        let frame_id2 = frame_of(rec, image_id2)?;
        if frame_id1 == frame_id2 {
            return Err(SfmError::SameFrame(image_id1, image_id2));
        }
        let cam1_from_rig = rec.cam_from_rig(image_id1).ok_or(SfmError::UnknownImage(image_id1))?;
        let cam2_from_rig = rec.cam_from_rig(image_id2).ok_or(SfmError::UnknownImage(image_id2))?;

        rec.register_frame(frame_id1, cam1_from_rig.inverse())?;
        if let Err(err) = rec.register_frame(frame_id2, cam2_from_rig.inverse() * cam2_from_cam1) {
            rec.deregister_frame(frame_id1)?;
            return Err(err);
        }

        for image_id in [image_id1, image_id2] {
            *self.stats.init_num_reg_trials.entry(image_id).or_default() += 1;
            *self.stats.num_reg_trials.entry(image_id).or_default() += 1;
        }
        self.stats.init_image_pairs.insert(ImagePair::new(image_id1, image_id2));
        self.stats.register_frame_event(rec, frame_id1);
        self.stats.register_frame_event(rec, frame_id2);

        let (Some(cam1_from_world), Some(cam2_from_world)) =
            (rec.cam_from_world(image_id1), rec.cam_from_world(image_id2))
        else {
            return Err(SfmError::UnknownImage(image_id1));
        };
        let (Some((image1, camera1)), Some((image2, camera2))) =
            (rec.image_with_camera(image_id1), rec.image_with_camera(image_id2))
        else {
            return Err(SfmError::UnknownImage(image_id1));
        };

        let proj_matrix1 = cam1_from_world.to_matrix();
        let proj_matrix2 = cam2_from_world.to_matrix();
        let proj_center1 = cam1_from_world.center();
        let proj_center2 = cam2_from_world.center();
        let min_tri_angle = options.init_min_tri_angle.to_radians();

        let matches = self
            .database_cache
            .correspondence_graph()
            .find_correspondences_between_images(image_id1, image_id2);
        let mut new_points: Vec<(Vector3<f64>, Point2DIdx, Point2DIdx)> = Vec::with_capacity(matches.len());
        for m in &matches {
            let (Some(point1), Some(point2)) = (image1.point2d(m.point2d_idx1), image2.point2d(m.point2d_idx2)) else {
                continue;
            };
            if point1.has_point3d() || point2.has_point3d() {
                continue;
            }
            let Some(xyz) = triangulate_point(
                &proj_matrix1,
                &proj_matrix2,
                &camera1.cam_from_img(&point1.xy),
                &camera2.cam_from_img(&point2.xy),
            ) else {
                continue;
            };
            if calculate_triangulation_angle(&proj_center1, &proj_center2, &xyz) >= min_tri_angle
                && has_point_positive_depth(&cam1_from_world, &xyz)
                && has_point_positive_depth(&cam2_from_world, &xyz)
            {
                new_points.push((xyz, m.point2d_idx1, m.point2d_idx2));
            }
        }

        let num_points = new_points.len();
        for (xyz, point2d_idx1, point2d_idx2) in new_points {
            let track = Track::from_elements(vec![
                TrackElement::new(image_id1, point2d_idx1),
                TrackElement::new(image_id2, point2d_idx2),
            ]);
            session.obs_manager.add_point3d(rec, xyz, track)?;
        }
        info!(
            "[Mapper] Registered initial pair {}-{} with {} points",
            image_id1, image_id2, num_points
        );
        Ok(())
    }

    /// Forget initial pair attempts so that relaxed thresholds can retry them.
    pub fn reset_initialization_stats(&mut self) {
        self.stats.init_num_reg_trials.clear();
        self.stats.init_image_pairs.clear();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Unregistered images worth trying next, best first.
    ///
    /// Images never tried in this session come before images that already
    /// failed. Images of filtered frames, images with too few visible points
    /// and images out of registration trials are excluded.
    pub fn find_next_images(&self, options: &IncrementalMapperOptions) -> Result<Vec<ImageId>> {
        let session = self.session()?;
        let rec = session.reconstruction.read();
        let obs_manager = &session.obs_manager;

        let mut untried: Vec<(ImageId, f64)> = Vec::new();
        let mut retried: Vec<(ImageId, f64)> = Vec::new();
        for image in rec.images().values() {
            if rec.is_image_registered(image.image_id) || self.filtered_frames.contains(&image.frame_id) {
                continue;
            }
            let num_visible = obs_manager.num_visible_points3d(image.image_id);
            if num_visible < options.abs_pose_min_num_inliers {
                continue;
            }
            let num_trials = self.stats.num_reg_trials(image.image_id);
            if num_trials >= options.max_reg_trials {
                continue;
            }

            let rank = match options.image_selection_method {
                ImageSelectionMethod::MaxVisiblePointsNum => num_visible as f64,
                ImageSelectionMethod::MaxVisiblePointsRatio => {
                    num_visible as f64 / obs_manager.num_observations(image.image_id).max(1) as f64
                }
                ImageSelectionMethod::MinUncertainty => obs_manager.point3d_visibility_score(image.image_id) as f64,
            };
            if num_trials == 0 {
                untried.push((image.image_id, rank));
            } else {
                retried.push((image.image_id, rank));
            }
        }

        let by_rank = |a: &(ImageId, f64), b: &(ImageId, f64)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
        untried.sort_by(by_rank);
        retried.sort_by(by_rank);
        Ok(untried.into_iter().chain(retried).map(|(image_id, _)| image_id).collect())
    }

    /// Register the frame of `image_id` from 2D-3D correspondences of all its
    /// images.
    ///
    /// Nothing changes unless the registration succeeds, apart from the trial
    /// counter of the image.
    ///
    /// # Returns
    /// * `false` for too few correspondences or inliers
    ///
    /// # Errors
    /// * `NotEnoughRegisteredFrames` before the initial pair is registered
    /// * `FrameAlreadyRegistered` if the frame has a pose already
    pub fn register_next_image(&mut self, options: &IncrementalMapperOptions, image_id: ImageId) -> Result<bool> {
        options.check()?;
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut guard = session.reconstruction.write();
        let rec = &mut *guard;

        let num_reg_frames = rec.num_reg_frames();
        if num_reg_frames < 2 {
            return Err(SfmError::NotEnoughRegisteredFrames {
                required: 2,
                found: num_reg_frames,
            });
        }
        let frame_id = frame_of(rec, image_id)?;
        if rec.is_frame_registered(frame_id) {
            return Err(SfmError::FrameAlreadyRegistered(frame_id));
        }

        *self.stats.num_reg_trials.entry(image_id).or_default() += 1;
        if session.obs_manager.num_visible_points3d(image_id) < options.abs_pose_min_num_inliers {
            return Ok(false);
        }

        // 2D-3D correspondences of every image of the frame
        let graph = self.database_cache.correspondence_graph();
        let frame_image_ids = rec.frame(frame_id).ok_or(SfmError::UnknownFrame(frame_id))?.image_ids.clone();
        let mut cams_from_rig: Vec<Rigid3d> = Vec::new();
        let mut camera_ids: Vec<CameraId> = Vec::new();
        let mut correspondences: Vec<PoseCorrespondence> = Vec::new();
        let mut keypoints: Vec<(ImageId, Point2DIdx, Point3DId)> = Vec::new();
        for frame_image_id in frame_image_ids {
            let (Some(cam_from_rig), Some(image)) = (rec.cam_from_rig(frame_image_id), rec.image(frame_image_id))
            else {
                continue;
            };
            let camera_idx = cams_from_rig.len();
            cams_from_rig.push(cam_from_rig);
            camera_ids.push(image.camera_id);

            let mut point3d_ids: HashSet<Point3DId> = HashSet::new();
            for (point2d_idx, point2d) in image.points2d.iter().enumerate() {
                for corr in graph.find_correspondences(frame_image_id, point2d_idx) {
                    let Some((corr_image, corr_camera)) = rec.image_with_camera(corr.image_id) else {
                        continue;
                    };
                    let Some(point3d_id) = corr_image.point2d(corr.point2d_idx).and_then(|p| p.point3d_id) else {
                        continue;
                    };
                    if point3d_ids.contains(&point3d_id) || options.has_bogus_params(corr_camera) {
                        continue;
                    }
                    let Some(point3d) = rec.point3d(point3d_id) else {
                        continue;
                    };
                    point3d_ids.insert(point3d_id);
                    correspondences.push(PoseCorrespondence {
                        camera_idx,
                        point2d: point2d.xy,
                        point3d: point3d.xyz,
                    });
                    keypoints.push((frame_image_id, point2d_idx, point3d_id));
                }
            }
        }
        if correspondences.len() < options.abs_pose_min_num_inliers {
            return Ok(false);
        }

        // Work on copies of the intrinsics; they are committed on success only
        let mut cameras: Vec<Camera> = Vec::with_capacity(camera_ids.len());
        let mut estimate_focal_length = false;
        let mut refine_intrinsics = false;
        for camera_id in &camera_ids {
            let mut camera = rec.camera(*camera_id).cloned().ok_or(SfmError::UnknownCamera(*camera_id))?;
            let refined_elsewhere = self.stats.num_reg_images_per_camera.get(camera_id).copied().unwrap_or(0) > 0;
            if !refined_elsewhere || options.has_bogus_params(&camera) {
                if let Some(db_camera) = self.database_cache.camera(*camera_id) {
                    camera.params = db_camera.params.clone();
                }
                estimate_focal_length |= !camera.has_prior_focal_length;
                refine_intrinsics = true;
            }
            cameras.push(camera);
        }
        // Shared intrinsics of multi-camera rigs are left to bundle adjustment
        if cameras.len() > 1 {
            estimate_focal_length = false;
            refine_intrinsics = false;
        }

        let abs_pose_options = AbsolutePoseEstimationOptions {
            estimate_focal_length: estimate_focal_length && options.abs_pose_refine_focal_length,
            num_focal_length_samples: 30,
            min_focal_length_ratio: options.min_focal_length_ratio,
            max_focal_length_ratio: options.max_focal_length_ratio,
            ransac: RansacOptions {
                max_error: options.abs_pose_max_error,
                min_inlier_ratio: options.abs_pose_min_inlier_ratio,
                confidence: 0.99999,
                min_num_trials: 100,
                max_num_trials: 10_000,
                random_seed: options.random_seed,
                ..Default::default()
            },
        };
        let Some(estimate) =
            estimate_generalized_absolute_pose(&abs_pose_options, &correspondences, &cams_from_rig, &mut cameras)
        else {
            debug!("[Mapper] Image {}: absolute pose estimation failed", image_id);
            return Ok(false);
        };
        if estimate.num_inliers < options.abs_pose_min_num_inliers {
            debug!(
                "[Mapper] Image {}: {} inliers, {} needed",
                image_id, estimate.num_inliers, options.abs_pose_min_num_inliers
            );
            return Ok(false);
        }

        let inlier_correspondences: Vec<PoseCorrespondence> = correspondences
            .iter()
            .zip(&estimate.inlier_mask)
            .filter(|(_, inlier)| **inlier)
            .map(|(corr, _)| *corr)
            .collect();
        let refinement_options = AbsolutePoseRefinementOptions {
            refine_focal_length: refine_intrinsics && options.abs_pose_refine_focal_length,
            refine_extra_params: refine_intrinsics && options.abs_pose_refine_extra_params,
            use_robust_loss_on_prior_position: options.use_robust_loss_on_prior_position,
            prior_position_loss_scale: options.prior_position_loss_scale,
            ..Default::default()
        };
        let prior = if options.use_prior_position {
            self.database_cache.pose_prior(frame_id).filter(|prior| prior.is_valid())
        } else {
            None
        };
        let mut rig_from_world = estimate.rig_from_world;
        if !refine_generalized_absolute_pose(
            &refinement_options,
            &inlier_correspondences,
            &cams_from_rig,
            &mut rig_from_world,
            &mut cameras,
            prior,
        ) {
            debug!("[Mapper] Image {}: pose refinement failed", image_id);
            return Ok(false);
        }

        // Commit
        for camera in cameras {
            if let Some(rec_camera) = rec.camera_mut(camera.camera_id) {
                *rec_camera = camera;
            }
        }
        rec.register_frame(frame_id, rig_from_world)?;
        self.stats.register_frame_event(rec, frame_id);

        for ((obs_image_id, point2d_idx, point3d_id), inlier) in keypoints.into_iter().zip(&estimate.inlier_mask) {
            if !*inlier {
                continue;
            }
            let free = rec
                .image(obs_image_id)
                .and_then(|image| image.point2d(point2d_idx))
                .is_some_and(|p| !p.has_point3d());
            if free && rec.exists_point3d(point3d_id) {
                session
                    .obs_manager
                    .add_observation(rec, point3d_id, TrackElement::new(obs_image_id, point2d_idx))?;
                session.triangulator.add_modified_point3d(point3d_id);
            }
        }
        info!(
            "[Mapper] Registered image {} (frame {}) with {} inliers",
            image_id, frame_id, estimate.num_inliers
        );
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Triangulation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn triangulate_image(&mut self, tri_options: &IncrementalTriangulatorOptions, image_id: ImageId) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        session
            .triangulator
            .triangulate_image(tri_options, &mut rec, &mut session.obs_manager, image_id)
    }

    pub fn retriangulate(&mut self, tri_options: &IncrementalTriangulatorOptions) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        session
            .triangulator
            .retriangulate(tri_options, &mut rec, &mut session.obs_manager)
    }

    pub fn complete_tracks(&mut self, tri_options: &IncrementalTriangulatorOptions) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        session
            .triangulator
            .complete_all_tracks(tri_options, &mut rec, &mut session.obs_manager)
    }

    pub fn merge_tracks(&mut self, tri_options: &IncrementalTriangulatorOptions) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        session
            .triangulator
            .merge_all_tracks(tri_options, &mut rec, &mut session.obs_manager)
    }

    pub fn complete_and_merge_tracks(&mut self, tri_options: &IncrementalTriangulatorOptions) -> Result<usize> {
        let num_completed = self.complete_tracks(tri_options)?;
        let num_merged = self.merge_tracks(tri_options)?;
        debug!(
            "[Mapper] Completed {} and merged {} observations",
            num_completed, num_merged
        );
        Ok(num_completed + num_merged)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bundle Adjustment
    // ─────────────────────────────────────────────────────────────────────────

    /// Registered images sharing the most points with `image_id`, preferring
    /// images that see the shared points under a large angle.
    ///
    /// # Returns
    /// * At most `local_ba_num_images - 1` images, excluding `image_id`
    pub fn find_local_bundle(&self, options: &IncrementalMapperOptions, image_id: ImageId) -> Result<Vec<ImageId>> {
        let session = self.session()?;
        let rec = session.reconstruction.read();
        let image = rec.image(image_id).ok_or(SfmError::UnknownImage(image_id))?;

        let mut point3d_ids: HashSet<Point3DId> = HashSet::new();
        let mut num_shared: HashMap<ImageId, usize> = HashMap::new();
        for point3d_id in image.points2d.iter().filter_map(|p| p.point3d_id) {
            let Some(point3d) = rec.point3d(point3d_id) else {
                continue;
            };
            point3d_ids.insert(point3d_id);
            for el in point3d.track.elements() {
                if el.image_id != image_id {
                    *num_shared.entry(el.image_id).or_default() += 1;
                }
            }
        }

        let mut overlapping: Vec<(ImageId, usize)> = num_shared.into_iter().collect();
        overlapping.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let num_eff_images = options.local_ba_num_images.saturating_sub(1).min(overlapping.len());
        if num_eff_images == overlapping.len() {
            return Ok(overlapping.into_iter().map(|(id, _)| id).collect());
        }

        let Some(proj_center) = rec.projection_center(image_id) else {
            return Ok(overlapping.into_iter().take(num_eff_images).map(|(id, _)| id).collect());
        };
        let min_tri_angle = options.local_ba_min_tri_angle.to_radians();
        let num_points3d = image.num_points3d() as f64;
        let selection_thresholds = [
            (min_tri_angle / 1.0, 0.6 * num_points3d),
            (min_tri_angle / 1.5, 0.6 * num_points3d),
            (min_tri_angle / 2.0, 0.5 * num_points3d),
            (min_tri_angle / 2.5, 0.4 * num_points3d),
            (min_tri_angle / 3.0, 0.3 * num_points3d),
            (min_tri_angle / 4.0, 0.2 * num_points3d),
            (min_tri_angle / 5.0, 0.1 * num_points3d),
            (min_tri_angle / 6.0, 0.1 * num_points3d),
        ];

        let mut local_bundle: Vec<ImageId> = Vec::with_capacity(num_eff_images);
        let mut used = vec![false; overlapping.len()];
        let mut tri_angles: Vec<Option<f64>> = vec![None; overlapping.len()];
        'thresholds: for (tri_angle_threshold, min_num_shared) in selection_thresholds {
            for (idx, (overlapping_id, overlap)) in overlapping.iter().enumerate() {
                // Sorted by overlap, the rest has even less
                if (*overlap as f64) < min_num_shared {
                    break;
                }
                if used[idx] {
                    continue;
                }
                let tri_angle = match tri_angles[idx] {
                    Some(angle) => angle,
                    None => {
                        let angle = self.local_bundle_tri_angle(&rec, &point3d_ids, &proj_center, *overlapping_id);
                        tri_angles[idx] = Some(angle);
                        angle
                    }
                };
                if tri_angle >= tri_angle_threshold {
                    local_bundle.push(*overlapping_id);
                    used[idx] = true;
                    if local_bundle.len() >= num_eff_images {
                        break 'thresholds;
                    }
                }
            }
        }

        // Fill up with the most overlapping images
        for (idx, (overlapping_id, _)) in overlapping.iter().enumerate() {
            if local_bundle.len() >= num_eff_images {
                break;
            }
            if !used[idx] {
                local_bundle.push(*overlapping_id);
                used[idx] = true;
            }
        }
        Ok(local_bundle)
    }

    /// Triangulation angle percentile of the points shared with another image.
    fn local_bundle_tri_angle(
        &self,
        rec: &Reconstruction,
        point3d_ids: &HashSet<Point3DId>,
        proj_center: &Vector3<f64>,
        other_image_id: ImageId,
    ) -> f64 {
        let (Some(other_image), Some(other_center)) =
            (rec.image(other_image_id), rec.projection_center(other_image_id))
        else {
            return 0.0;
        };
        let shared_points3d: Vec<Vector3<f64>> = other_image
            .points2d
            .iter()
            .filter_map(|p| p.point3d_id)
            .filter(|id| point3d_ids.contains(id))
            .filter_map(|id| rec.point3d(id).map(|p| p.xyz))
            .collect();
        percentile(
            &calculate_triangulation_angles(proj_center, &other_center, &shared_points3d),
            LOCAL_BUNDLE_TRI_ANGLE_PERCENTILE,
        )
    }

    /// Adjust `image_id` with its local bundle, then merge, complete and
    /// filter the affected points.
    ///
    /// `point3d_ids` are the points allowed to move, usually the points
    /// modified since the last adjustment.
    pub fn adjust_local_bundle<I>(
        &mut self,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        image_id: ImageId,
        point3d_ids: I,
    ) -> Result<LocalBundleAdjustmentReport>
    where
        I: IntoIterator<Item = Point3DId>,
    {
        options.check()?;
        let local_bundle = self.find_local_bundle(options, image_id)?;
        let point3d_ids: Vec<Point3DId> = point3d_ids.into_iter().collect();

        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut guard = session.reconstruction.write();
        let rec = &mut *guard;
        let mut report = LocalBundleAdjustmentReport::default();

        if !local_bundle.is_empty() {
            let mut config = BundleAdjustmentConfig::new();
            config.add_image(image_id);
            for bundle_image_id in &local_bundle {
                config.add_image(*bundle_image_id);
            }

            let mut bundle_frames: HashSet<FrameId> = HashSet::new();
            let mut num_images_per_camera: HashMap<CameraId, usize> = HashMap::new();
            for bundle_image_id in config.image_ids().clone() {
                let Some(image) = rec.image(bundle_image_id) else {
                    continue;
                };
                bundle_frames.insert(image.frame_id);
                *num_images_per_camera.entry(image.camera_id).or_default() += 1;
            }
            if options.fix_existing_frames {
                for frame_id in &bundle_frames {
                    if self.existing_frame_ids.contains(frame_id) {
                        config.set_constant_rig_from_world_pose(*frame_id);
                    }
                }
            }

            // Intrinsics shared with images outside the bundle stay fixed
            for (camera_id, num_images) in &num_images_per_camera {
                let num_reg_images = self.stats.num_reg_images_per_camera.get(camera_id).copied().unwrap_or(0);
                if *num_images < num_reg_images {
                    config.set_constant_cam_intrinsics(*camera_id);
                }
            }

            // Same for rig extrinsics shared with frames outside the bundle
            let mut num_frames_per_rig: HashMap<RigId, usize> = HashMap::new();
            for frame_id in &bundle_frames {
                if let Some(frame) = rec.frame(*frame_id) {
                    *num_frames_per_rig.entry(frame.rig_id).or_default() += 1;
                }
            }
            for (rig_id, num_frames) in &num_frames_per_rig {
                let num_reg_frames = self.stats.num_reg_frames_per_rig.get(rig_id).copied().unwrap_or(0);
                if *num_frames < num_reg_frames {
                    let sensor_ids: Vec<SensorId> = rec
                        .rig(*rig_id)
                        .map(|rig| rig.non_ref_sensor_ids().collect())
                        .unwrap_or_default();
                    for sensor_id in sensor_ids {
                        config.set_constant_sensor_from_rig_pose(sensor_id);
                    }
                }
            }

            // Gauge: one fixed pose plus one fixed position coordinate
            let image_frame_id = frame_of(rec, image_id)?;
            if local_bundle.len() == 1 {
                config.set_constant_rig_from_world_pose(frame_of(rec, local_bundle[0])?);
                config.set_constant_rig_position(image_frame_id, &[0]);
            } else {
                let frame_id1 = frame_of(rec, local_bundle[local_bundle.len() - 1])?;
                let frame_id2 = frame_of(rec, local_bundle[local_bundle.len() - 2])?;
                config.set_constant_rig_from_world_pose(frame_id1);
                if !options.fix_existing_frames || !self.existing_frame_ids.contains(&frame_id2) {
                    config.set_constant_rig_position(frame_id2, &[0]);
                }
            }

            let mut variable_point3d_ids: Vec<Point3DId> = Vec::new();
            for point3d_id in &point3d_ids {
                let Some(point3d) = rec.point3d(*point3d_id) else {
                    continue;
                };
                if !point3d.has_error() || point3d.track.len() <= MAX_LOCAL_BA_VARIABLE_TRACK_LENGTH {
                    config.add_variable_point(*point3d_id);
                    variable_point3d_ids.push(*point3d_id);
                }
            }

            let summary = Self::run_bundle_adjuster(&self.database_cache, options, ba_options, config, rec);
            report.num_adjusted_observations = summary.num_residuals / 2;
            debug!(
                "[BA] Local bundle of image {}: {} images, {} observations, cost {:.4} -> {:.4}",
                image_id,
                local_bundle.len() + 1,
                report.num_adjusted_observations,
                summary.initial_cost,
                summary.final_cost
            );

            report.num_merged_observations = session.triangulator.merge_tracks(
                tri_options,
                rec,
                &mut session.obs_manager,
                variable_point3d_ids.iter().copied(),
            )?;
            report.num_completed_observations = session.triangulator.complete_tracks(
                tri_options,
                rec,
                &mut session.obs_manager,
                variable_point3d_ids.iter().copied(),
            )?;
            report.num_completed_observations +=
                session
                    .triangulator
                    .complete_image(tri_options, rec, &mut session.obs_manager, image_id)?;
        }

        let filter_image_ids = std::iter::once(image_id).chain(local_bundle.iter().copied());
        report.num_filtered_observations = session.obs_manager.filter_points3d_in_images(
            rec,
            options.filter_max_reproj_error,
            options.filter_min_tri_angle,
            filter_image_ids,
        )?;
        report.num_filtered_observations += session.obs_manager.filter_points3d(
            rec,
            options.filter_max_reproj_error,
            options.filter_min_tri_angle,
            point3d_ids,
        )?;
        Ok(report)
    }

    /// Adjust all registered frames and points.
    ///
    /// # Returns
    /// * Whether the solver converged
    ///
    /// # Errors
    /// * `NotEnoughRegisteredFrames` with fewer than two registered frames
    pub fn adjust_global_bundle(
        &mut self,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
    ) -> Result<bool> {
        options.check()?;
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut guard = session.reconstruction.write();
        let rec = &mut *guard;

        let reg_frame_ids: Vec<FrameId> = rec.reg_frame_ids().iter().copied().collect();
        if reg_frame_ids.len() < 2 {
            return Err(SfmError::NotEnoughRegisteredFrames {
                required: 2,
                found: reg_frame_ids.len(),
            });
        }

        let mut ba_options = ba_options.clone();
        if reg_frame_ids.len() < MIN_NUM_REG_FRAMES_FOR_RELAXED_GLOBAL_BA {
            ba_options.function_tolerance /= 10.0;
            ba_options.gradient_tolerance /= 10.0;
            ba_options.parameter_tolerance /= 10.0;
            ba_options.max_num_iterations *= 2;
        }

        let num_filtered = session.obs_manager.filter_observations_with_negative_depth(rec)?;
        if num_filtered > 0 {
            debug!("[BA] Removed {} observations behind cameras", num_filtered);
        }

        let mut config = BundleAdjustmentConfig::new();
        for image_id in rec.reg_image_ids() {
            config.add_image(image_id);
        }
        if options.fix_existing_frames {
            for frame_id in &reg_frame_ids {
                if self.existing_frame_ids.contains(frame_id) {
                    config.set_constant_rig_from_world_pose(*frame_id);
                }
            }
        }
        if !options.use_prior_position {
            config.set_constant_rig_from_world_pose(reg_frame_ids[0]);
            if !options.fix_existing_frames || !self.existing_frame_ids.contains(&reg_frame_ids[1]) {
                config.set_constant_rig_position(reg_frame_ids[1], &[0]);
            }
        }

        let summary = Self::run_bundle_adjuster(&self.database_cache, options, &ba_options, config, rec);
        info!(
            "[BA] Global: {} frames, {} residuals, {} iterations, cost {:.4} -> {:.4} ({:?})",
            reg_frame_ids.len(),
            summary.num_residuals,
            summary.iterations,
            summary.initial_cost,
            summary.final_cost,
            summary.termination
        );
        Ok(summary.is_converged())
    }

    fn run_bundle_adjuster(
        database_cache: &DatabaseCache,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        config: BundleAdjustmentConfig,
        reconstruction: &mut Reconstruction,
    ) -> BundleAdjustmentSummary {
        let adjuster = if options.use_prior_position {
            BundleAdjuster::with_pose_priors(
                ba_options.clone(),
                options.pose_prior_options(),
                config,
                database_cache.pose_priors().clone(),
            )
        } else {
            BundleAdjuster::new(ba_options.clone(), config)
        };
        adjuster.solve(reconstruction)
    }

    /// Repeat local bundle adjustment around `image_id` until the share of
    /// changed observations drops below `max_refinement_change`.
    ///
    /// Only the first round uses the robust loss of `ba_options`.
    #[allow(clippy::too_many_arguments)]
    pub fn iterative_local_refinement(
        &mut self,
        max_num_refinements: usize,
        max_refinement_change: f64,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        image_id: ImageId,
    ) -> Result<()> {
        let mut ba_options = ba_options.clone();
        for _ in 0..max_num_refinements {
            let modified = self.modified_points3d()?;
            let report = self.adjust_local_bundle(options, &ba_options, tri_options, image_id, modified)?;
            let num_changed = report.num_merged_observations
                + report.num_completed_observations
                + report.num_filtered_observations;
            let changed = if report.num_adjusted_observations == 0 {
                0.0
            } else {
                num_changed as f64 / report.num_adjusted_observations as f64
            };
            debug!(
                "[Mapper] Local refinement of image {}: merged={}, completed={}, filtered={}, changed={:.4}",
                image_id,
                report.num_merged_observations,
                report.num_completed_observations,
                report.num_filtered_observations,
                changed
            );
            if changed < max_refinement_change {
                break;
            }
            ba_options.loss_function_type = LossFunctionType::Trivial;
        }
        self.clear_modified_points3d()
    }

    /// Alternate global bundle adjustment with track completion, merging and
    /// filtering until the share of changed observations drops below
    /// `max_refinement_change`, then filter frames.
    #[allow(clippy::too_many_arguments)]
    pub fn iterative_global_refinement(
        &mut self,
        max_num_refinements: usize,
        max_refinement_change: f64,
        options: &IncrementalMapperOptions,
        ba_options: &BundleAdjustmentOptions,
        tri_options: &IncrementalTriangulatorOptions,
        normalize_reconstruction: bool,
    ) -> Result<()> {
        self.complete_and_merge_tracks(tri_options)?;
        let num_retriangulated = self.retriangulate(tri_options)?;
        debug!("[Mapper] Retriangulated {} observations", num_retriangulated);

        for _ in 0..max_num_refinements {
            let num_observations = self.session()?.reconstruction.read().compute_num_observations();
            if !self.adjust_global_bundle(options, ba_options)? {
                warn!("[BA] Global bundle adjustment did not converge");
            }
            if normalize_reconstruction {
                self.session()?.reconstruction.write().normalize(10.0, 0.1, 0.9);
            }
            let num_changed = self.complete_and_merge_tracks(tri_options)? + self.filter_points(options)?;
            let changed = if num_observations == 0 {
                0.0
            } else {
                num_changed as f64 / num_observations as f64
            };
            debug!("[Mapper] Global refinement: changed={:.4}", changed);
            if changed < max_refinement_change {
                break;
            }
        }
        self.filter_frames(options)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filtering
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove observations with large reprojection error and points with a
    /// small triangulation angle.
    pub fn filter_points(&mut self, options: &IncrementalMapperOptions) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut rec = session.reconstruction.write();
        let num_filtered = session.obs_manager.filter_all_points3d(
            &mut rec,
            options.filter_max_reproj_error,
            options.filter_min_tri_angle,
        )?;
        debug!("[Mapper] Filtered {} observations", num_filtered);
        Ok(num_filtered)
    }

    /// Deregister frames with implausible intrinsics.
    ///
    /// Filtered frames are not offered by `find_next_images` again in this
    /// session. Does nothing while fewer than 20 frames are registered.
    pub fn filter_frames(&mut self, options: &IncrementalMapperOptions) -> Result<usize> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        let mut guard = session.reconstruction.write();
        let rec = &mut *guard;
        if rec.num_reg_frames() < MIN_NUM_REG_FRAMES_FOR_FRAME_FILTER {
            return Ok(0);
        }

        let filtered = session.obs_manager.filter_frames(
            rec,
            options.min_focal_length_ratio,
            options.max_focal_length_ratio,
            options.max_extra_param,
        )?;
        for frame_id in &filtered {
            self.stats.deregister_frame_event(rec, *frame_id);
            self.filtered_frames.insert(*frame_id);
        }
        if !filtered.is_empty() {
            info!("[Mapper] Filtered {} frames", filtered.len());
        }
        Ok(filtered.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn database_cache(&self) -> &Arc<DatabaseCache> {
        &self.database_cache
    }

    /// Handle to the bound reconstruction.
    pub fn reconstruction(&self) -> Option<SharedReconstruction> {
        self.session.as_ref().map(|session| Arc::clone(&session.reconstruction))
    }

    pub fn observation_manager(&self) -> Option<&ObservationManager> {
        self.session.as_ref().map(|session| &session.obs_manager)
    }

    pub fn triangulator(&self) -> Option<&IncrementalTriangulator> {
        self.session.as_ref().map(|session| &session.triangulator)
    }

    pub fn num_total_reg_images(&self) -> usize {
        self.stats.num_total_reg_images
    }

    pub fn num_shared_reg_images(&self) -> usize {
        self.stats.num_shared_reg_images
    }

    pub fn num_reg_frames_per_rig(&self) -> &HashMap<RigId, usize> {
        &self.stats.num_reg_frames_per_rig
    }

    pub fn num_reg_images_per_camera(&self) -> &HashMap<CameraId, usize> {
        &self.stats.num_reg_images_per_camera
    }

    /// Number of reconstructions the image is registered in.
    pub fn num_registrations(&self, image_id: ImageId) -> usize {
        self.stats.num_registrations(image_id)
    }

    /// Registration attempts of the image in the current session.
    pub fn num_reg_trials(&self, image_id: ImageId) -> usize {
        self.stats.num_reg_trials(image_id)
    }

    pub fn init_num_reg_trials(&self, image_id: ImageId) -> usize {
        self.stats.init_num_reg_trials(image_id)
    }

    pub fn init_image_pairs(&self) -> &HashSet<ImagePair> {
        &self.stats.init_image_pairs
    }

    pub fn filtered_frames(&self) -> &HashSet<FrameId> {
        &self.filtered_frames
    }

    pub fn existing_frame_ids(&self) -> &HashSet<FrameId> {
        &self.existing_frame_ids
    }

    /// Points created or changed since the last clear.
    pub fn modified_points3d(&self) -> Result<HashSet<Point3DId>> {
        let session = self.session()?;
        let rec = session.reconstruction.read();
        Ok(session.triangulator.modified_points3d(&rec))
    }

    pub fn clear_modified_points3d(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(SfmError::NoReconstruction)?;
        session.triangulator.clear_modified_points3d();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{synthesize_dataset, SyntheticDatasetOptions};
    use parking_lot::RwLock;

    fn new_reconstruction() -> SharedReconstruction {
        Arc::new(RwLock::new(Reconstruction::new()))
    }

    fn mapper_for(options: &SyntheticDatasetOptions) -> IncrementalMapper {
        let dataset = synthesize_dataset(options).unwrap();
        IncrementalMapper::new(Arc::new(dataset.database_cache))
    }

    fn test_options() -> IncrementalMapperOptions {
        IncrementalMapperOptions {
            random_seed: Some(7),
            ..Default::default()
        }
    }

    /// Bound mapper with the initial pair registered.
    fn initialized_mapper() -> (IncrementalMapper, SharedReconstruction, ImageId, ImageId) {
        let mut mapper = mapper_for(&SyntheticDatasetOptions::default());
        let reconstruction = new_reconstruction();
        mapper.begin_reconstruction(Arc::clone(&reconstruction)).unwrap();
        let options = test_options();
        let (image_id1, image_id2, cam2_from_cam1) =
            mapper.find_initial_image_pair(&options, None, None).unwrap().unwrap();
        mapper
            .register_initial_image_pair(&options, image_id1, image_id2, cam2_from_cam1)
            .unwrap();
        (mapper, reconstruction, image_id1, image_id2)
    }

    #[test]
    fn test_operations_need_a_bound_reconstruction() {
        let mut mapper = mapper_for(&SyntheticDatasetOptions::default());
        let options = test_options();
        assert_eq!(
            mapper.find_next_images(&options).unwrap_err(),
            SfmError::NoReconstruction
        );
        assert_eq!(mapper.end_reconstruction(false).unwrap_err(), SfmError::NoReconstruction);

        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        assert_eq!(
            mapper.begin_reconstruction(new_reconstruction()).unwrap_err(),
            SfmError::ReconstructionAlreadyBound
        );
        assert!(matches!(
            mapper.adjust_global_bundle(&options, &BundleAdjustmentOptions::default()),
            Err(SfmError::NotEnoughRegisteredFrames { required: 2, found: 0 })
        ));
        assert!(matches!(
            mapper.register_next_image(&options, ImageId::new(3)),
            Err(SfmError::NotEnoughRegisteredFrames { .. })
        ));
    }

    #[test]
    fn test_initial_pair_is_ranked_and_recorded() {
        let mut mapper = mapper_for(&SyntheticDatasetOptions::default());
        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        let options = test_options();

        let (id1, id2, _) = mapper.find_initial_image_pair(&options, None, None).unwrap().unwrap();
        assert_eq!((id1, id2), (ImageId::new(1), ImageId::new(2)));
        assert!(mapper.init_image_pairs().contains(&ImagePair::new(id1, id2)));

        // The attempted pair is not returned again
        let (next1, next2, _) = mapper.find_initial_image_pair(&options, None, None).unwrap().unwrap();
        assert_ne!(ImagePair::new(next1, next2), ImagePair::new(id1, id2));

        mapper.reset_initialization_stats();
        let (again1, again2, _) = mapper.find_initial_image_pair(&options, None, None).unwrap().unwrap();
        assert_eq!((again1, again2), (id1, id2));
    }

    #[test]
    fn test_initial_pair_below_inlier_threshold_is_rejected() {
        let mut mapper = mapper_for(&SyntheticDatasetOptions::default());
        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        let options = IncrementalMapperOptions {
            init_min_num_inliers: 1000,
            ..test_options()
        };
        assert!(mapper
            .find_initial_image_pair(&options, Some(ImageId::new(1)), Some(ImageId::new(2)))
            .unwrap()
            .is_none());
        assert!(mapper
            .estimate_initial_two_view_geometry(&test_options(), ImageId::new(1), ImageId::new(2))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_initial_pair_falls_through_to_next_candidate() {
        let mut mapper = mapper_for(&SyntheticDatasetOptions::default());
        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        // Neighbouring ring frames are 30 degrees apart and miss this bound
        let options = IncrementalMapperOptions {
            init_min_tri_angle: 45.0,
            ..test_options()
        };
        let first_ranked = ImagePair::new(ImageId::new(1), ImageId::new(2));
        assert!(mapper
            .estimate_initial_two_view_geometry(&options, first_ranked.first, first_ranked.second)
            .unwrap()
            .is_none());

        let (id1, id2, cam2_from_cam1) = mapper.find_initial_image_pair(&options, None, None).unwrap().unwrap();
        let found = ImagePair::new(id1, id2);
        assert_ne!(found, first_ranked);
        assert!(mapper.init_image_pairs().contains(&first_ranked));
        assert!(mapper.init_image_pairs().contains(&found));
        assert!((cam2_from_cam1.translation.norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejected_initial_pair_leaves_stats_untouched() {
        let dataset_options = SyntheticDatasetOptions {
            num_cameras_per_rig: 2,
            ..Default::default()
        };
        let mut mapper = mapper_for(&dataset_options);
        let frame = mapper.database_cache().frame(FrameId::new(1)).unwrap().clone();
        let reconstruction = new_reconstruction();
        mapper.begin_reconstruction(Arc::clone(&reconstruction)).unwrap();
        let (id1, id2) = (frame.image_ids[0], frame.image_ids[1]);

        assert!(mapper
            .register_initial_image_pair(&test_options(), id1, id2, Rigid3d::identity())
            .is_err());
        assert_eq!(reconstruction.read().num_reg_frames(), 0);
        for image_id in [id1, id2] {
            assert_eq!(mapper.init_num_reg_trials(image_id), 0);
            assert_eq!(mapper.num_reg_trials(image_id), 0);
            assert_eq!(mapper.num_registrations(image_id), 0);
        }
        assert!(mapper.init_image_pairs().is_empty());
        assert_eq!(mapper.num_total_reg_images(), 0);
    }

    #[test]
    fn test_register_initial_pair() {
        let (mapper, reconstruction, id1, id2) = initialized_mapper();
        {
            let rec = reconstruction.read();
            assert_eq!(rec.num_reg_frames(), 2);
            assert!(rec.num_points3d() > 100);
            assert!(rec.compute_mean_reprojection_error() < 1e-3);
        }
        assert_eq!(mapper.num_total_reg_images(), 2);
        assert_eq!(mapper.num_shared_reg_images(), 0);
        assert_eq!(mapper.init_num_reg_trials(id1), 1);
        assert_eq!(mapper.init_num_reg_trials(id2), 1);
        assert_eq!(mapper.num_registrations(id1), 1);
        assert_eq!(mapper.num_reg_images_per_camera().values().sum::<usize>(), 2);
    }

    #[test]
    fn test_register_initial_pair_into_non_empty_reconstruction_fails() {
        let (mut mapper, _reconstruction, _, _) = initialized_mapper();
        let result = mapper.register_initial_image_pair(
            &test_options(),
            ImageId::new(3),
            ImageId::new(4),
            Rigid3d::identity(),
        );
        assert_eq!(result.unwrap_err(), SfmError::ReconstructionNotEmpty(2));
    }

    #[test]
    fn test_register_initial_pair_from_one_frame_fails() {
        let dataset_options = SyntheticDatasetOptions {
            num_cameras_per_rig: 2,
            ..Default::default()
        };
        let mut mapper = mapper_for(&dataset_options);
        let frame = mapper.database_cache().frame(FrameId::new(1)).unwrap().clone();
        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        let result = mapper.register_initial_image_pair(
            &test_options(),
            frame.image_ids[0],
            frame.image_ids[1],
            Rigid3d::identity(),
        );
        assert_eq!(
            result.unwrap_err(),
            SfmError::SameFrame(frame.image_ids[0], frame.image_ids[1])
        );
    }

    #[test]
    fn test_register_next_image_updates_counters() {
        let (mut mapper, reconstruction, _, _) = initialized_mapper();
        let options = test_options();
        let next = mapper.find_next_images(&options).unwrap();
        assert_eq!(next.len(), 3);

        let image_id = next[0];
        assert!(mapper.register_next_image(&options, image_id).unwrap());
        assert!(reconstruction.read().is_image_registered(image_id));
        assert_eq!(mapper.num_registrations(image_id), 1);
        assert_eq!(mapper.num_reg_trials(image_id), 1);
        assert_eq!(mapper.num_total_reg_images(), 3);
        assert!(!mapper.modified_points3d().unwrap().is_empty());

        let frame_id = reconstruction.read().image(image_id).unwrap().frame_id;
        assert_eq!(
            mapper.register_next_image(&options, image_id).unwrap_err(),
            SfmError::FrameAlreadyRegistered(frame_id)
        );
    }

    #[test]
    fn test_failed_registration_changes_nothing_but_trials() {
        let (mut mapper, reconstruction, _, _) = initialized_mapper();
        let image_id = mapper.find_next_images(&test_options()).unwrap()[0];
        let before = reconstruction.read().clone();

        let strict = IncrementalMapperOptions {
            abs_pose_min_num_inliers: 10_000,
            ..test_options()
        };
        assert!(!mapper.register_next_image(&strict, image_id).unwrap());
        assert_eq!(mapper.num_reg_trials(image_id), 1);
        assert_eq!(mapper.num_registrations(image_id), 0);

        let after = reconstruction.read();
        assert_eq!(after.reg_frame_ids(), before.reg_frame_ids());
        assert_eq!(after.num_points3d(), before.num_points3d());
        assert_eq!(after.compute_num_observations(), before.compute_num_observations());
        assert_eq!(after.cameras(), before.cameras());
    }

    #[test]
    fn test_image_out_of_trials_is_not_offered() {
        let (mut mapper, _reconstruction, _, _) = initialized_mapper();
        let options = test_options();
        let image_id = mapper.find_next_images(&options).unwrap()[0];
        let strict = IncrementalMapperOptions {
            abs_pose_min_num_inliers: 10_000,
            ..test_options()
        };

        for _ in 0..options.max_reg_trials - 1 {
            assert!(!mapper.register_next_image(&strict, image_id).unwrap());
        }
        let next = mapper.find_next_images(&options).unwrap();
        // Failed images go after untried ones
        assert_eq!(next.last(), Some(&image_id));

        assert!(!mapper.register_next_image(&strict, image_id).unwrap());
        assert!(!mapper.find_next_images(&options).unwrap().contains(&image_id));
    }

    #[test]
    fn test_end_reconstruction_discard_rolls_back_statistics() {
        let (mut mapper, _reconstruction, id1, _) = initialized_mapper();
        assert_eq!(mapper.num_total_reg_images(), 2);
        mapper.end_reconstruction(true).unwrap();
        assert_eq!(mapper.num_total_reg_images(), 0);
        assert_eq!(mapper.num_shared_reg_images(), 0);
        assert_eq!(mapper.num_registrations(id1), 0);

        let (mut mapper, _reconstruction, id1, id2) = initialized_mapper();
        mapper.end_reconstruction(false).unwrap();
        assert_eq!(mapper.num_total_reg_images(), 2);

        // Claimed images are not used to seed another model
        mapper.begin_reconstruction(new_reconstruction()).unwrap();
        let (next1, next2, _) = mapper
            .find_initial_image_pair(&test_options(), None, None)
            .unwrap()
            .unwrap();
        for image_id in [next1, next2] {
            assert_ne!(image_id, id1);
            assert_ne!(image_id, id2);
        }
    }

    #[test]
    fn test_continuing_a_reconstruction_counts_shared_images() {
        let (mut mapper, reconstruction, _, _) = initialized_mapper();
        mapper.end_reconstruction(false).unwrap();

        mapper.begin_reconstruction(Arc::clone(&reconstruction)).unwrap();
        assert_eq!(mapper.existing_frame_ids().len(), 2);
        assert_eq!(mapper.num_total_reg_images(), 2);
        assert_eq!(mapper.num_shared_reg_images(), 2);
        assert!(reconstruction.read().num_points3d() > 0);
    }

    #[test]
    fn test_global_bundle_and_filters() {
        let (mut mapper, reconstruction, _, _) = initialized_mapper();
        let options = test_options();
        mapper
            .adjust_global_bundle(&options, &BundleAdjustmentOptions::default())
            .unwrap();
        assert!(reconstruction.read().compute_mean_reprojection_error() < 1e-3);

        mapper.filter_points(&options).unwrap();
        assert_eq!(mapper.filter_points(&options).unwrap(), 0);
        // Fewer than 20 frames
        assert_eq!(mapper.filter_frames(&options).unwrap(), 0);
        assert!(mapper.filtered_frames().is_empty());
    }

    #[test]
    fn test_local_bundle_selection() {
        let (mut mapper, reconstruction, id1, _) = initialized_mapper();
        let options = test_options();
        let tri_options = IncrementalTriangulatorOptions::default();
        while let Some(image_id) = mapper.find_next_images(&options).unwrap().first().copied() {
            assert!(mapper.register_next_image(&options, image_id).unwrap());
            mapper.triangulate_image(&tri_options, image_id).unwrap();
        }
        assert_eq!(reconstruction.read().num_reg_images(), 5);

        let all = mapper.find_local_bundle(&options, id1).unwrap();
        assert_eq!(all.len(), 4);
        assert!(!all.contains(&id1));

        let small = IncrementalMapperOptions {
            local_ba_num_images: 3,
            ..test_options()
        };
        let bundle = mapper.find_local_bundle(&small, id1).unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(!bundle.contains(&id1));

        let modified = mapper.modified_points3d().unwrap();
        let report = mapper
            .adjust_local_bundle(
                &options,
                &BundleAdjustmentOptions::default(),
                &tri_options,
                id1,
                modified,
            )
            .unwrap();
        assert!(report.num_adjusted_observations > 0);
        assert!(reconstruction.read().compute_mean_reprojection_error() < 1e-2);
    }
}
