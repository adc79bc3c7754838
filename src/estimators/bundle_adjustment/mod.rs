//! Bundle adjustment over a subset of a reconstruction.
//!
//! Three phases, as everywhere shared state is optimized:
//! 1. **Collect**: build parameter blocks and residuals from the
//!    reconstruction according to a [`BundleAdjustmentConfig`]
//! 2. **Solve**: Levenberg–Marquardt with Schur elimination of the points
//! 3. **Apply**: write the variable blocks back in place
//!
//! Residuals are pixel reprojection errors under a robust loss. The pose
//! prior variant first aligns the reconstruction to the prior positions and
//! then adds whitened position residuals, so the gauge is fixed by the priors
//! instead of by constant poses.

mod loss;
mod problem;
mod solver;

pub use loss::{LossFunction, LossFunctionType};

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::problem::Problem;
use super::alignment::align_reconstruction_to_pose_priors;
use crate::error::{check_option, Result};
use crate::scene::{CameraId, FrameId, ImageId, Point3DId, PosePrior, Reconstruction};
use crate::sensor::SensorId;

/// Number of worker threads for `num_threads`, where `<= 0` means all cores.
pub fn effective_num_threads(num_threads: i32) -> usize {
    if num_threads > 0 {
        num_threads as usize
    } else {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Which images, points and parameter blocks take part in an adjustment.
#[derive(Debug, Clone, Default)]
pub struct BundleAdjustmentConfig {
    image_ids: BTreeSet<ImageId>,
    variable_point3d_ids: BTreeSet<Point3DId>,
    constant_point3d_ids: BTreeSet<Point3DId>,
    constant_cam_intrinsics: HashSet<CameraId>,
    constant_sensor_from_rig_poses: HashSet<SensorId>,
    constant_rig_from_world_poses: HashSet<FrameId>,
    /// Constant translation components of otherwise variable rig poses.
    constant_rig_positions: HashMap<FrameId, Vec<usize>>,
}

impl BundleAdjustmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image_id: ImageId) {
        self.image_ids.insert(image_id);
    }

    pub fn has_image(&self, image_id: ImageId) -> bool {
        self.image_ids.contains(&image_id)
    }

    pub fn remove_image(&mut self, image_id: ImageId) {
        self.image_ids.remove(&image_id);
    }

    pub fn image_ids(&self) -> &BTreeSet<ImageId> {
        &self.image_ids
    }

    pub fn num_images(&self) -> usize {
        self.image_ids.len()
    }

    /// Points whose observations outside the configured images are added with
    /// constant poses.
    pub fn add_variable_point(&mut self, point3d_id: Point3DId) {
        self.constant_point3d_ids.remove(&point3d_id);
        self.variable_point3d_ids.insert(point3d_id);
    }

    pub fn add_constant_point(&mut self, point3d_id: Point3DId) {
        self.variable_point3d_ids.remove(&point3d_id);
        self.constant_point3d_ids.insert(point3d_id);
    }

    pub fn has_variable_point(&self, point3d_id: Point3DId) -> bool {
        self.variable_point3d_ids.contains(&point3d_id)
    }

    pub fn has_constant_point(&self, point3d_id: Point3DId) -> bool {
        self.constant_point3d_ids.contains(&point3d_id)
    }

    pub fn variable_point3d_ids(&self) -> &BTreeSet<Point3DId> {
        &self.variable_point3d_ids
    }

    pub fn constant_point3d_ids(&self) -> &BTreeSet<Point3DId> {
        &self.constant_point3d_ids
    }

    pub fn set_constant_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.insert(camera_id);
    }

    pub fn set_variable_cam_intrinsics(&mut self, camera_id: CameraId) {
        self.constant_cam_intrinsics.remove(&camera_id);
    }

    pub fn has_constant_cam_intrinsics(&self, camera_id: CameraId) -> bool {
        self.constant_cam_intrinsics.contains(&camera_id)
    }

    pub fn set_constant_sensor_from_rig_pose(&mut self, sensor_id: SensorId) {
        self.constant_sensor_from_rig_poses.insert(sensor_id);
    }

    pub fn has_constant_sensor_from_rig_pose(&self, sensor_id: SensorId) -> bool {
        self.constant_sensor_from_rig_poses.contains(&sensor_id)
    }

    pub fn set_constant_rig_from_world_pose(&mut self, frame_id: FrameId) {
        self.constant_rig_from_world_poses.insert(frame_id);
    }

    pub fn set_variable_rig_from_world_pose(&mut self, frame_id: FrameId) {
        self.constant_rig_from_world_poses.remove(&frame_id);
    }

    pub fn has_constant_rig_from_world_pose(&self, frame_id: FrameId) -> bool {
        self.constant_rig_from_world_poses.contains(&frame_id)
    }

    /// Keep the given translation components (0..3) of a rig pose fixed.
    pub fn set_constant_rig_position(&mut self, frame_id: FrameId, idxs: &[usize]) {
        let entry = self.constant_rig_positions.entry(frame_id).or_default();
        for &idx in idxs.iter().filter(|idx| **idx < 3) {
            if !entry.contains(&idx) {
                entry.push(idx);
            }
        }
    }

    pub fn constant_rig_position(&self, frame_id: FrameId) -> &[usize] {
        self.constant_rig_positions
            .get(&frame_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleAdjustmentOptions {
    pub loss_function_type: LossFunctionType,
    /// Scale of the robust loss in pixels.
    pub loss_function_scale: f64,
    pub refine_focal_length: bool,
    pub refine_principal_point: bool,
    pub refine_extra_params: bool,
    pub refine_sensor_from_rig: bool,
    pub refine_rig_from_world: bool,
    pub max_num_iterations: usize,
    /// Relative cost decrease below which the solver stops.
    pub function_tolerance: f64,
    /// Maximum absolute gradient entry below which the solver stops.
    pub gradient_tolerance: f64,
    /// Relative step size below which the solver stops.
    pub parameter_tolerance: f64,
    /// `<= 0` uses all cores.
    pub num_threads: i32,
    pub min_num_residuals_for_multi_threading: usize,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            loss_function_type: LossFunctionType::Trivial,
            loss_function_scale: 1.0,
            refine_focal_length: true,
            refine_principal_point: false,
            refine_extra_params: true,
            refine_sensor_from_rig: true,
            refine_rig_from_world: true,
            max_num_iterations: 100,
            function_tolerance: 0.0,
            gradient_tolerance: 1e-4,
            parameter_tolerance: 0.0,
            num_threads: -1,
            min_num_residuals_for_multi_threading: 50_000,
        }
    }
}

impl BundleAdjustmentOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.loss_function_scale >= 0.0, "loss_function_scale must be non-negative")?;
        check_option(self.max_num_iterations > 0, "max_num_iterations must be positive")?;
        check_option(
            self.function_tolerance >= 0.0 && self.gradient_tolerance >= 0.0 && self.parameter_tolerance >= 0.0,
            "solver tolerances must be non-negative",
        )
    }

    pub fn effective_num_threads(&self) -> usize {
        effective_num_threads(self.num_threads)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosePriorBundleAdjustmentOptions {
    pub use_robust_loss_on_prior_position: bool,
    /// Cauchy scale on the squared whitened position residual (chi² 95%, 3 DOF).
    pub prior_position_loss_scale: f64,
    /// Maximum position error of the initial prior alignment; `<= 0` uses a
    /// plain least-squares fit.
    pub alignment_ransac_max_error: f64,
}

impl Default for PosePriorBundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            use_robust_loss_on_prior_position: false,
            prior_position_loss_scale: 7.815,
            alignment_ransac_max_error: 0.0,
        }
    }
}

impl PosePriorBundleAdjustmentOptions {
    pub fn check(&self) -> Result<()> {
        check_option(
            self.prior_position_loss_scale > 0.0,
            "prior_position_loss_scale must be positive",
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// A tolerance was reached.
    Convergence,
    /// The iteration limit was reached first.
    NoConvergence,
    /// Empty or numerically degenerate problem.
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundleAdjustmentSummary {
    pub termination: TerminationType,
    pub num_residuals: usize,
    pub num_parameters: usize,
    pub iterations: usize,
    /// `½ Σ ρ(||r||²)` before and after.
    pub initial_cost: f64,
    pub final_cost: f64,
}

impl BundleAdjustmentSummary {
    pub fn is_converged(&self) -> bool {
        self.termination == TerminationType::Convergence
    }

    pub fn is_usable(&self) -> bool {
        self.termination != TerminationType::Failure
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adjuster
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum number of valid priors for the prior-constrained variant.
const MIN_NUM_POSE_PRIORS: usize = 3;

pub struct BundleAdjuster {
    options: BundleAdjustmentOptions,
    config: BundleAdjustmentConfig,
    pose_priors: Option<(PosePriorBundleAdjustmentOptions, HashMap<FrameId, PosePrior>)>,
}

impl BundleAdjuster {
    pub fn new(options: BundleAdjustmentOptions, config: BundleAdjustmentConfig) -> Self {
        Self {
            options,
            config,
            pose_priors: None,
        }
    }

    /// Adjuster constrained by position priors instead of a fixed gauge.
    pub fn with_pose_priors(
        options: BundleAdjustmentOptions,
        prior_options: PosePriorBundleAdjustmentOptions,
        config: BundleAdjustmentConfig,
        pose_priors: HashMap<FrameId, PosePrior>,
    ) -> Self {
        Self {
            options,
            config,
            pose_priors: Some((prior_options, pose_priors)),
        }
    }

    pub fn config(&self) -> &BundleAdjustmentConfig {
        &self.config
    }

    /// Optimize the configured blocks in place.
    ///
    /// With pose priors the reconstruction is first moved onto the prior
    /// positions. When fewer than three registered frames carry a valid prior,
    /// the adjustment runs without priors.
    pub fn solve(&self, reconstruction: &mut Reconstruction) -> BundleAdjustmentSummary {
        let priors = match &self.pose_priors {
            Some((prior_options, priors)) if self.prepare_pose_priors(reconstruction, prior_options, priors) => {
                Some((prior_options, priors))
            }
            Some(_) => {
                debug!("[BA] Too few pose priors, adjusting without them");
                None
            }
            None => None,
        };

        // Collect
        let (problem, mut state) = Problem::build(reconstruction, &self.config, &self.options, priors);

        // Solve
        let summary = solver::minimize(&problem, &mut state, &self.options);
        debug!(
            "[BA] {:?} after {} iterations: {} residuals, {} params, cost {:.4e} -> {:.4e}",
            summary.termination,
            summary.iterations,
            summary.num_residuals,
            summary.num_parameters,
            summary.initial_cost,
            summary.final_cost
        );

        // Apply
        if summary.is_usable() {
            problem.write_back(&state, reconstruction);
        } else {
            warn!("[BA] Solver failed, keeping previous estimates");
        }
        summary
    }

    fn prepare_pose_priors(
        &self,
        reconstruction: &mut Reconstruction,
        prior_options: &PosePriorBundleAdjustmentOptions,
        priors: &HashMap<FrameId, PosePrior>,
    ) -> bool {
        let num_valid = reconstruction
            .reg_frame_ids()
            .iter()
            .filter(|frame_id| {
                priors
                    .get(*frame_id)
                    .is_some_and(|p| p.is_valid() && p.sqrt_information().is_some())
            })
            .count();
        if num_valid < MIN_NUM_POSE_PRIORS {
            return false;
        }
        match align_reconstruction_to_pose_priors(reconstruction, priors, prior_options.alignment_ransac_max_error) {
            Some(prior_from_rec) => {
                reconstruction.transform(&prior_from_rec);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sim3d;
    use crate::scene::{synthesize_dataset, SyntheticDataset, SyntheticDatasetOptions};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn dataset(options: SyntheticDatasetOptions) -> SyntheticDataset {
        synthesize_dataset(&options).unwrap()
    }

    /// Config over all registered images with the gauge fixed by the first
    /// frame and one coordinate of the second.
    fn full_config(reconstruction: &Reconstruction) -> BundleAdjustmentConfig {
        let mut config = BundleAdjustmentConfig::new();
        for image_id in reconstruction.reg_image_ids() {
            config.add_image(image_id);
        }
        let frames: Vec<FrameId> = reconstruction.reg_frame_ids().iter().copied().collect();
        config.set_constant_rig_from_world_pose(frames[0]);
        config.set_constant_rig_position(frames[1], &[0]);
        config
    }

    fn perturb(reconstruction: &mut Reconstruction, frames_from: usize, sigma: f64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, sigma).unwrap();
        let frames: Vec<FrameId> = reconstruction.reg_frame_ids().iter().copied().collect();
        for frame_id in &frames[frames_from..] {
            let frame = reconstruction.frame_mut(*frame_id).unwrap();
            let pose = frame.rig_from_world.as_mut().unwrap();
            pose.translation += Vector3::from_fn(|_, _| noise.sample(&mut rng));
            pose.rotation = UnitQuaternion::from_scaled_axis(Vector3::from_fn(|_, _| 0.1 * noise.sample(&mut rng)))
                * pose.rotation;
        }
        for point3d_id in reconstruction.point3d_ids() {
            let point3d = reconstruction.point3d_mut(point3d_id).unwrap();
            point3d.xyz += Vector3::from_fn(|_, _| noise.sample(&mut rng));
        }
    }

    #[test]
    fn test_config_bookkeeping() {
        let mut config = BundleAdjustmentConfig::new();
        config.add_constant_point(Point3DId::new(3));
        config.add_variable_point(Point3DId::new(3));
        assert!(config.has_variable_point(Point3DId::new(3)));
        assert!(!config.has_constant_point(Point3DId::new(3)));

        config.set_constant_rig_position(FrameId::new(1), &[0, 2, 0, 5]);
        assert_eq!(config.constant_rig_position(FrameId::new(1)), &[0, 2]);
        assert!(config.constant_rig_position(FrameId::new(2)).is_empty());
    }

    #[test]
    fn test_recovers_perturbed_scene() {
        let data = dataset(SyntheticDatasetOptions::default());
        let mut reconstruction = data.ground_truth.clone();
        perturb(&mut reconstruction, 2, 0.02, 7);
        assert!(reconstruction.compute_mean_reprojection_error() > 0.1);

        let options = BundleAdjustmentOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            gradient_tolerance: 1e-8,
            function_tolerance: 1e-12,
            ..Default::default()
        };
        let summary = BundleAdjuster::new(options, full_config(&reconstruction)).solve(&mut reconstruction);

        assert_eq!(summary.termination, TerminationType::Convergence);
        assert!(summary.final_cost < summary.initial_cost);
        assert!(reconstruction.compute_mean_reprojection_error() < 1e-3);
    }

    #[test]
    fn test_constant_blocks_stay_fixed() {
        let data = dataset(SyntheticDatasetOptions::default());
        let mut reconstruction = data.ground_truth.clone();
        perturb(&mut reconstruction, 0, 0.01, 3);
        let frames: Vec<FrameId> = reconstruction.reg_frame_ids().iter().copied().collect();
        let fixed_pose = reconstruction.frame(frames[0]).unwrap().rig_from_world.unwrap();
        let partially_fixed = reconstruction.frame(frames[1]).unwrap().rig_from_world.unwrap();
        let camera_before = reconstruction.cameras().values().next().unwrap().clone();

        let options = BundleAdjustmentOptions {
            refine_focal_length: false,
            ..Default::default()
        };
        BundleAdjuster::new(options, full_config(&reconstruction)).solve(&mut reconstruction);

        let fixed_after = reconstruction.frame(frames[0]).unwrap().rig_from_world.unwrap();
        assert_eq!(fixed_after, fixed_pose);
        let partially_after = reconstruction.frame(frames[1]).unwrap().rig_from_world.unwrap();
        assert_eq!(partially_after.translation.x, partially_fixed.translation.x);
        let camera_after = reconstruction.camera(camera_before.camera_id).unwrap();
        assert_eq!(camera_after.params, camera_before.params);
    }

    #[test]
    fn test_refines_focal_length() {
        let data = dataset(SyntheticDatasetOptions::default());
        let mut reconstruction = data.ground_truth.clone();
        let camera_id = *reconstruction.cameras().keys().next().unwrap();
        let truth = reconstruction.camera(camera_id).unwrap().params[0];
        reconstruction.camera_mut(camera_id).unwrap().params[0] = truth * 1.02;

        let options = BundleAdjustmentOptions {
            gradient_tolerance: 1e-8,
            function_tolerance: 1e-12,
            ..Default::default()
        };
        BundleAdjuster::new(options, full_config(&reconstruction)).solve(&mut reconstruction);

        let refined = reconstruction.camera(camera_id).unwrap().params[0];
        assert_relative_eq!(refined, truth, epsilon = 1e-3 * truth);
        assert!(reconstruction.compute_mean_reprojection_error() < 1e-3);
    }

    #[test]
    fn test_multi_camera_rig_extrinsics() {
        let data = dataset(SyntheticDatasetOptions {
            num_cameras_per_rig: 2,
            ..Default::default()
        });
        let mut reconstruction = data.ground_truth.clone();
        let rig_id = *reconstruction.rigs().keys().next().unwrap();
        let sensor_id = reconstruction.rig(rig_id).unwrap().non_ref_sensor_ids().next().unwrap();
        let truth = reconstruction.rig(rig_id).unwrap().sensor_from_rig(sensor_id).unwrap();
        let mut moved = truth;
        moved.translation += Vector3::new(0.01, -0.01, 0.005);
        reconstruction.rig_mut(rig_id).unwrap().set_sensor_from_rig(sensor_id, moved);

        let options = BundleAdjustmentOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            gradient_tolerance: 1e-8,
            function_tolerance: 1e-12,
            ..Default::default()
        };
        BundleAdjuster::new(options, full_config(&reconstruction)).solve(&mut reconstruction);
        assert!(reconstruction.compute_mean_reprojection_error() < 1e-3);
    }

    #[test]
    fn test_pose_priors_fix_gauge() {
        let data = dataset(SyntheticDatasetOptions {
            prior_position_stddev: Some(0.0),
            ..Default::default()
        });
        let mut reconstruction = data.ground_truth.clone();
        reconstruction.transform(&Sim3d::new(
            0.5,
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.3, 0.1)),
            Vector3::new(1.0, 2.0, 3.0),
        ));

        let mut config = BundleAdjustmentConfig::new();
        for image_id in reconstruction.reg_image_ids() {
            config.add_image(image_id);
        }
        let options = BundleAdjustmentOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            gradient_tolerance: 1e-8,
            ..Default::default()
        };
        let adjuster = BundleAdjuster::with_pose_priors(
            options,
            PosePriorBundleAdjustmentOptions::default(),
            config,
            data.database_cache.pose_priors().clone(),
        );
        let summary = adjuster.solve(&mut reconstruction);
        assert!(summary.is_usable());

        for (frame_id, prior) in data.database_cache.pose_priors() {
            let center = reconstruction.frame(*frame_id).unwrap().rig_from_world.unwrap().center();
            assert_relative_eq!(center, prior.position, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_empty_problem_fails() {
        let mut reconstruction = Reconstruction::new();
        let summary = BundleAdjuster::new(BundleAdjustmentOptions::default(), BundleAdjustmentConfig::new())
            .solve(&mut reconstruction);
        assert_eq!(summary.termination, TerminationType::Failure);
    }
}
