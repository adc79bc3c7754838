//! Generalized absolute pose: pose of a (multi-camera) rig from 2D-3D
//! correspondences.
//!
//! - Linear solver on the viewing rays of all cameras of the rig, wrapped in
//!   locally optimized RANSAC
//! - Optional focal length search for a single camera with unknown
//!   calibration
//! - Non-linear refinement (`levenberg-marquardt`) of the rig pose and,
//!   optionally, the focal length and distortion parameters, with a Cauchy
//!   loss on the reprojection residuals and an optional position prior

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Owned, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ransac::{ransac, Estimator, RansacOptions};
use crate::error::{check_option, Result};
use crate::geometry::triangulation::null_vector;
use crate::geometry::{project_to_rotation, retract_rotation, skew, Rigid3d};
use crate::scene::PosePrior;
use crate::sensor::Camera;

/// Constant residual for points behind a camera during refinement.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e3;

/// One 2D-3D correspondence of a rig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseCorrespondence {
    /// Index into the rig's camera list.
    pub camera_idx: usize,
    /// Observed keypoint in pixels.
    pub point2d: Vector2<f64>,
    pub point3d: Vector3<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsolutePoseEstimationOptions {
    /// Search the focal length of a single camera.
    pub estimate_focal_length: bool,
    pub num_focal_length_samples: usize,
    pub min_focal_length_ratio: f64,
    pub max_focal_length_ratio: f64,
    /// `ransac.max_error` is in pixels.
    pub ransac: RansacOptions,
}

impl Default for AbsolutePoseEstimationOptions {
    fn default() -> Self {
        Self {
            estimate_focal_length: false,
            num_focal_length_samples: 30,
            min_focal_length_ratio: 0.1,
            max_focal_length_ratio: 10.0,
            ransac: RansacOptions {
                max_error: 12.0,
                min_inlier_ratio: 0.1,
                confidence: 0.99999,
                min_num_trials: 100,
                max_num_trials: 10_000,
                ..Default::default()
            },
        }
    }
}

impl AbsolutePoseEstimationOptions {
    pub fn check(&self) -> Result<()> {
        check_option(
            self.num_focal_length_samples > 0,
            "num_focal_length_samples must be positive",
        )?;
        check_option(
            self.min_focal_length_ratio > 0.0 && self.max_focal_length_ratio > self.min_focal_length_ratio,
            "focal length ratios must satisfy 0 < min < max",
        )?;
        self.ransac.check()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsolutePoseRefinementOptions {
    pub refine_focal_length: bool,
    pub refine_extra_params: bool,
    /// Cauchy loss scale on the reprojection error in pixels.
    pub loss_function_scale: f64,
    pub max_num_iterations: usize,
    pub function_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,
    pub use_robust_loss_on_prior_position: bool,
    /// Cauchy loss scale on the squared whitened prior residual.
    pub prior_position_loss_scale: f64,
}

impl Default for AbsolutePoseRefinementOptions {
    fn default() -> Self {
        Self {
            refine_focal_length: true,
            refine_extra_params: true,
            loss_function_scale: 1.0,
            max_num_iterations: 100,
            function_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-10,
            use_robust_loss_on_prior_position: false,
            prior_position_loss_scale: 7.815,
        }
    }
}

impl AbsolutePoseRefinementOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.loss_function_scale > 0.0, "loss_function_scale must be positive")?;
        check_option(self.max_num_iterations > 0, "max_num_iterations must be positive")?;
        check_option(
            self.prior_position_loss_scale > 0.0,
            "prior_position_loss_scale must be positive",
        )
    }
}

/// Result of [`estimate_generalized_absolute_pose`].
#[derive(Debug, Clone)]
pub struct AbsolutePoseEstimate {
    pub rig_from_world: Rigid3d,
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Linear solver
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct GeneralizedPoseSample {
    pub camera_idx: usize,
    /// Normalized image coordinates of the observation.
    pub ray: Vector2<f64>,
    pub point3d: Vector3<f64>,
}

/// Linear rig pose from viewing rays.
///
/// Every observation contributes `[x]× (R_c (R X + t) + t_c) = 0`, linear in
/// the entries of `R`, `t` and a homogenizing scale on `t_c`. Rigs whose
/// cameras all sit at the rig origin drop the scale unknown.
pub struct GeneralizedPoseEstimator {
    cams_from_rig: Vec<Rigid3d>,
    central: bool,
}

impl GeneralizedPoseEstimator {
    pub fn new(cams_from_rig: &[Rigid3d]) -> Self {
        let central = cams_from_rig
            .iter()
            .all(|cam_from_rig| cam_from_rig.translation.norm() < 1e-12);
        Self {
            cams_from_rig: cams_from_rig.to_vec(),
            central,
        }
    }
}

impl Estimator for GeneralizedPoseEstimator {
    type Sample = GeneralizedPoseSample;
    type Model = Rigid3d;

    fn min_num_samples(&self) -> usize {
        6
    }

    fn estimate(&self, samples: &[GeneralizedPoseSample]) -> Vec<Rigid3d> {
        if samples.len() < 6 {
            return Vec::new();
        }

        // Condition the 3D points: X = sigma * X' + c
        let n = samples.len() as f64;
        let centroid = samples.iter().fold(Vector3::zeros(), |acc, s| acc + s.point3d) / n;
        let sigma = (samples
            .iter()
            .map(|s| (s.point3d - centroid).norm_squared())
            .sum::<f64>()
            / n)
            .sqrt();
        if sigma < f64::EPSILON {
            return Vec::new();
        }

        let num_unknowns = if self.central { 12 } else { 13 };
        let mut a = DMatrix::zeros((3 * samples.len()).max(num_unknowns), num_unknowns);
        for (i, sample) in samples.iter().enumerate() {
            let Some(cam_from_rig) = self.cams_from_rig.get(sample.camera_idx) else {
                return Vec::new();
            };
            let ray_skew = skew(&Vector3::new(sample.ray.x, sample.ray.y, 1.0));
            let m = ray_skew * cam_from_rig.rotation_matrix();
            let offset = ray_skew * cam_from_rig.translation / sigma;
            let x = (sample.point3d - centroid) / sigma;
            for row in 0..3 {
                for j in 0..3 {
                    for k in 0..3 {
                        a[(3 * i + row, 3 * j + k)] = m[(row, j)] * x[k];
                    }
                    a[(3 * i + row, 9 + j)] = m[(row, j)];
                }
                if !self.central {
                    a[(3 * i + row, 12)] = offset[row];
                }
            }
        }

        let Some(v) = null_vector(&a) else {
            return Vec::new();
        };
        let rotation_raw = Matrix3::from_row_slice(&v.as_slice()[0..9]);
        let sign = if rotation_raw.determinant() < 0.0 { -1.0 } else { 1.0 };
        let singular_values = rotation_raw.svd(false, false).singular_values;
        let scale = singular_values.mean();
        if scale < f64::EPSILON || !scale.is_finite() {
            return Vec::new();
        }

        let Some(rotation) = project_to_rotation(&(rotation_raw * (sign / scale))) else {
            return Vec::new();
        };
        let t_normalized = Vector3::new(v[9], v[10], v[11]) * (sign / scale);
        // R X + t = sigma (R X' + t'') with t'' = (R c + t) / sigma
        let translation = sigma * t_normalized - rotation * centroid;
        vec![Rigid3d::from_rotation_matrix(&rotation, translation)]
    }

    fn residuals(&self, samples: &[GeneralizedPoseSample], rig_from_world: &Rigid3d) -> Vec<f64> {
        samples
            .iter()
            .map(|sample| {
                let Some(cam_from_rig) = self.cams_from_rig.get(sample.camera_idx) else {
                    return f64::MAX;
                };
                let p = cam_from_rig.transform_point(&rig_from_world.transform_point(&sample.point3d));
                if p.z <= f64::EPSILON {
                    return f64::MAX;
                }
                (Vector2::new(p.x / p.z, p.y / p.z) - sample.ray).norm_squared()
            })
            .collect()
    }
}

fn run_generalized_ransac(
    ransac_options: &RansacOptions,
    correspondences: &[PoseCorrespondence],
    cams_from_rig: &[Rigid3d],
    cameras: &[Camera],
) -> Option<AbsolutePoseEstimate> {
    let mut samples = Vec::with_capacity(correspondences.len());
    for corr in correspondences {
        let camera = cameras.get(corr.camera_idx)?;
        samples.push(GeneralizedPoseSample {
            camera_idx: corr.camera_idx,
            ray: camera.cam_from_img(&corr.point2d),
            point3d: corr.point3d,
        });
    }

    let mut options = ransac_options.clone();
    options.max_error = cameras
        .iter()
        .map(|camera| camera.cam_from_img_threshold(ransac_options.max_error))
        .sum::<f64>()
        / cameras.len().max(1) as f64;

    let report = ransac(&GeneralizedPoseEstimator::new(cams_from_rig), &samples, &options)?;
    Some(AbsolutePoseEstimate {
        rig_from_world: report.model,
        num_inliers: report.num_inliers,
        inlier_mask: report.inlier_mask,
    })
}

/// Focal length factors sampled more densely around small factors.
fn focal_length_factors(options: &AbsolutePoseEstimationOptions) -> Vec<f64> {
    let n = options.num_focal_length_samples;
    let span = options.max_focal_length_ratio - options.min_focal_length_ratio;
    (0..n)
        .map(|i| {
            let u = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
            options.min_focal_length_ratio + span * u * u
        })
        .collect()
}

/// Robustly estimate the pose of a rig.
///
/// # Arguments
/// * `correspondences` - 2D-3D matches, each naming the observing camera
/// * `cams_from_rig` - Extrinsics per camera index
/// * `cameras` - Intrinsics per camera index; with focal length search the
///   single camera receives the best focal length
///
/// # Returns
/// * `None` if RANSAC finds no model with enough support
pub fn estimate_generalized_absolute_pose(
    options: &AbsolutePoseEstimationOptions,
    correspondences: &[PoseCorrespondence],
    cams_from_rig: &[Rigid3d],
    cameras: &mut [Camera],
) -> Option<AbsolutePoseEstimate> {
    if cameras.is_empty() || cams_from_rig.len() != cameras.len() {
        return None;
    }

    if !(options.estimate_focal_length && cameras.len() == 1) {
        return run_generalized_ransac(&options.ransac, correspondences, cams_from_rig, cameras);
    }

    let base_focal_length = cameras[0].mean_focal_length();
    let mut best: Option<(AbsolutePoseEstimate, f64)> = None;
    for factor in focal_length_factors(options) {
        let mut scaled = cameras[0].clone();
        scaled.set_focal_length(factor * base_focal_length);
        let Some(estimate) = run_generalized_ransac(
            &options.ransac,
            correspondences,
            cams_from_rig,
            std::slice::from_ref(&scaled),
        ) else {
            continue;
        };
        if best
            .as_ref()
            .map_or(true, |(b, _)| estimate.num_inliers > b.num_inliers)
        {
            best = Some((estimate, scaled.mean_focal_length()));
        }
    }

    let (estimate, focal_length) = best?;
    debug!(
        "[AbsPose] Focal length search picked {:.2} (was {:.2})",
        focal_length, base_focal_length
    );
    cameras[0].set_focal_length(focal_length);
    Some(estimate)
}

// ─────────────────────────────────────────────────────────────────────────────
// Refinement
// ─────────────────────────────────────────────────────────────────────────────

/// Cauchy loss `ρ(s) = a² ln(1 + s / a²)` on a squared residual.
fn cauchy(s: f64, scale: f64) -> f64 {
    let a2 = scale * scale;
    a2 * (1.0 + s / a2).ln()
}

/// Rescale a residual block so its squared norm equals the robust cost.
fn robustify(residual: &mut [f64], loss: impl Fn(f64) -> f64) {
    let s: f64 = residual.iter().map(|r| r * r).sum();
    if s <= f64::EPSILON {
        return;
    }
    let factor = (loss(s) / s).sqrt();
    for r in residual.iter_mut() {
        *r *= factor;
    }
}

struct PoseRefinementProblem<'a> {
    correspondences: &'a [PoseCorrespondence],
    cams_from_rig: &'a [Rigid3d],
    cameras: Vec<Camera>,
    /// `(camera_idx, param_idx)` of every refined intrinsic parameter.
    intrinsic_slots: Vec<(usize, usize)>,
    base_rotation: UnitQuaternion<f64>,
    prior: Option<(Vector3<f64>, Matrix3<f64>)>,
    options: &'a AbsolutePoseRefinementOptions,
    params: DVector<f64>,
}

impl PoseRefinementProblem<'_> {
    fn rig_from_world(&self) -> Rigid3d {
        let omega = Vector3::new(self.params[0], self.params[1], self.params[2]);
        Rigid3d::new(
            retract_rotation(&self.base_rotation, &omega),
            Vector3::new(self.params[3], self.params[4], self.params[5]),
        )
    }

    fn compute_residuals(&self) -> DVector<f64> {
        let rig_from_world = self.rig_from_world();
        let num_prior = if self.prior.is_some() { 3 } else { 0 };
        let mut residuals = DVector::zeros(2 * self.correspondences.len() + num_prior);

        for (i, corr) in self.correspondences.iter().enumerate() {
            let camera = &self.cameras[corr.camera_idx];
            let p = self.cams_from_rig[corr.camera_idx]
                .transform_point(&rig_from_world.transform_point(&corr.point3d));
            let mut r = match camera.img_from_cam(&p) {
                Some(projection) => {
                    let d = projection - corr.point2d;
                    [d.x, d.y]
                }
                None => [BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL],
            };
            robustify(&mut r, |s| cauchy(s, self.options.loss_function_scale));
            residuals[2 * i] = r[0];
            residuals[2 * i + 1] = r[1];
        }

        if let Some((position, sqrt_information)) = &self.prior {
            let whitened = sqrt_information * (rig_from_world.center() - position);
            let mut r = [whitened.x, whitened.y, whitened.z];
            if self.options.use_robust_loss_on_prior_position {
                robustify(&mut r, |s| cauchy(s, self.options.prior_position_loss_scale.sqrt()));
            }
            let offset = 2 * self.correspondences.len();
            residuals[offset] = r[0];
            residuals[offset + 1] = r[1];
            residuals[offset + 2] = r[2];
        }
        residuals
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoseRefinementProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
        for (slot, &(camera_idx, param_idx)) in self.intrinsic_slots.iter().enumerate() {
            self.cameras[camera_idx].params[param_idx] = params[6 + slot];
        }
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let residuals = self.compute_residuals();
        residuals.iter().all(|r| r.is_finite()).then_some(residuals)
    }

    /// Central differences.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let num_residuals = self.compute_residuals().len();
        let mut jacobian = DMatrix::zeros(num_residuals, self.params.len());
        let mut probe = PoseRefinementProblem {
            correspondences: self.correspondences,
            cams_from_rig: self.cams_from_rig,
            cameras: self.cameras.clone(),
            intrinsic_slots: self.intrinsic_slots.clone(),
            base_rotation: self.base_rotation,
            prior: self.prior,
            options: self.options,
            params: self.params.clone(),
        };
        for col in 0..self.params.len() {
            let h = 1e-6 * self.params[col].abs().max(1.0);
            let mut plus = self.params.clone();
            plus[col] += h;
            probe.set_params(&plus);
            let r_plus = probe.compute_residuals();
            let mut minus = self.params.clone();
            minus[col] -= h;
            probe.set_params(&minus);
            let r_minus = probe.compute_residuals();
            jacobian.set_column(col, &((r_plus - r_minus) / (2.0 * h)));
        }
        jacobian.iter().all(|v| v.is_finite()).then_some(jacobian)
    }
}

/// Refine a rig pose (and optionally intrinsics) on inlier correspondences.
///
/// # Returns
/// * `false` if the solver produced no usable solution; inputs are then left
///   unchanged
pub fn refine_generalized_absolute_pose(
    options: &AbsolutePoseRefinementOptions,
    correspondences: &[PoseCorrespondence],
    cams_from_rig: &[Rigid3d],
    rig_from_world: &mut Rigid3d,
    cameras: &mut [Camera],
    prior: Option<&PosePrior>,
) -> bool {
    if correspondences.is_empty()
        || cams_from_rig.len() != cameras.len()
        || correspondences.iter().any(|c| c.camera_idx >= cameras.len())
    {
        return false;
    }

    let mut intrinsic_slots = Vec::new();
    for (camera_idx, camera) in cameras.iter().enumerate() {
        if options.refine_focal_length {
            intrinsic_slots.extend(camera.focal_length_idxs().iter().map(|&idx| (camera_idx, idx)));
        }
        if options.refine_extra_params {
            intrinsic_slots.extend(camera.extra_params_idxs().iter().map(|&idx| (camera_idx, idx)));
        }
    }

    let mut params = DVector::zeros(6 + intrinsic_slots.len());
    params[3] = rig_from_world.translation.x;
    params[4] = rig_from_world.translation.y;
    params[5] = rig_from_world.translation.z;
    for (slot, &(camera_idx, param_idx)) in intrinsic_slots.iter().enumerate() {
        params[6 + slot] = cameras[camera_idx].params[param_idx];
    }

    let prior = prior.and_then(|p| p.sqrt_information().map(|sqrt_info| (p.position, sqrt_info)));
    let problem = PoseRefinementProblem {
        correspondences,
        cams_from_rig,
        cameras: cameras.to_vec(),
        intrinsic_slots,
        base_rotation: rig_from_world.rotation,
        prior,
        options,
        params,
    };
    let initial_cost = problem.compute_residuals().norm_squared();

    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(options.function_tolerance)
        .with_gtol(options.gradient_tolerance)
        .with_xtol(options.parameter_tolerance)
        .with_patience(options.max_num_iterations)
        .minimize(problem);

    let final_cost = problem.compute_residuals().norm_squared();
    let usable = problem.params.iter().all(|v| v.is_finite())
        && final_cost.is_finite()
        && final_cost <= initial_cost + f64::EPSILON;
    debug!(
        "[AbsPose] Refinement {:?}: cost {:.4} -> {:.4} ({} evaluations)",
        report.termination, initial_cost, final_cost, report.number_of_evaluations
    );
    if !usable {
        return false;
    }

    *rig_from_world = problem.rig_from_world();
    for (camera, refined) in cameras.iter_mut().zip(problem.cameras) {
        camera.params = refined.params;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::CameraId;
    use crate::sensor::CameraModelId;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn camera(focal_length: f64) -> Camera {
        Camera::from_focal_length(CameraId::new(1), CameraModelId::SimplePinhole, focal_length, 1000, 800)
    }

    fn truth() -> Rigid3d {
        Rigid3d::new(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.05),
            Vector3::new(0.4, -0.2, 6.0),
        )
    }

    /// Points in front of the rig with their projections through `cameras`.
    fn correspondences(cams_from_rig: &[Rigid3d], cameras: &[Camera], num: usize, seed: u64) -> Vec<PoseCorrespondence> {
        let rig_from_world = truth();
        let world_from_rig = rig_from_world.inverse();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut result = Vec::new();
        while result.len() < num {
            let camera_idx = result.len() % cameras.len();
            let p_cam = Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(3.0..7.0));
            let p_rig = cams_from_rig[camera_idx].inverse().transform_point(&p_cam);
            let point3d = world_from_rig.transform_point(&p_rig);
            let Some(point2d) = cameras[camera_idx].img_from_cam(&p_cam) else {
                continue;
            };
            result.push(PoseCorrespondence {
                camera_idx,
                point2d,
                point3d,
            });
        }
        result
    }

    #[test]
    fn test_single_camera_with_outliers() {
        let cameras = vec![camera(800.0)];
        let cams_from_rig = vec![Rigid3d::identity()];
        let mut corrs = correspondences(&cams_from_rig, &cameras, 100, 1);
        for corr in corrs.iter_mut().take(20) {
            corr.point2d += Vector2::new(80.0, 50.0);
        }
        let mut options = AbsolutePoseEstimationOptions::default();
        options.ransac.random_seed = Some(5);

        let mut cams = cameras.clone();
        let estimate = estimate_generalized_absolute_pose(&options, &corrs, &cams_from_rig, &mut cams).unwrap();
        assert_eq!(estimate.num_inliers, 80);
        assert!(estimate.inlier_mask.iter().take(20).all(|inlier| !inlier));
        assert!(estimate.rig_from_world.rotation_angle_to(&truth()) < 1e-6);
        assert_relative_eq!(estimate.rig_from_world.translation, truth().translation, epsilon = 1e-6);
    }

    #[test]
    fn test_multi_camera_rig() {
        let cameras = vec![camera(800.0), camera(600.0)];
        let cams_from_rig = vec![
            Rigid3d::identity(),
            Rigid3d::new(
                UnitQuaternion::from_euler_angles(0.0, 0.4, 0.0),
                Vector3::new(-0.5, 0.0, 0.1),
            ),
        ];
        let corrs = correspondences(&cams_from_rig, &cameras, 60, 2);
        let mut options = AbsolutePoseEstimationOptions::default();
        options.ransac.random_seed = Some(9);

        let mut cams = cameras.clone();
        let estimate = estimate_generalized_absolute_pose(&options, &corrs, &cams_from_rig, &mut cams).unwrap();
        assert_eq!(estimate.num_inliers, 60);
        assert!(estimate.rig_from_world.rotation_angle_to(&truth()) < 1e-6);
        assert_relative_eq!(estimate.rig_from_world.translation, truth().translation, epsilon = 1e-6);
    }

    #[test]
    fn test_refinement_reduces_error_with_noise() {
        let cameras = vec![camera(800.0)];
        let cams_from_rig = vec![Rigid3d::identity()];
        let mut corrs = correspondences(&cams_from_rig, &cameras, 80, 3);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.5).unwrap();
        for corr in corrs.iter_mut() {
            corr.point2d += Vector2::new(noise.sample(&mut rng), noise.sample(&mut rng));
        }

        let perturbed = Rigid3d::new(
            UnitQuaternion::from_euler_angles(0.01, -0.01, 0.0) * truth().rotation,
            truth().translation + Vector3::new(0.05, -0.03, 0.1),
        );
        let mut rig_from_world = perturbed;
        let mut cams = cameras.clone();
        let options = AbsolutePoseRefinementOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        assert!(refine_generalized_absolute_pose(
            &options,
            &corrs,
            &cams_from_rig,
            &mut rig_from_world,
            &mut cams,
            None
        ));
        let start_rot_err = perturbed.rotation_angle_to(&truth());
        let rot_err = rig_from_world.rotation_angle_to(&truth());
        assert!(rot_err < 3e-3, "rotation error {rot_err}");
        assert!(rot_err < 0.25 * start_rot_err);
        assert!((rig_from_world.translation - truth().translation).norm() < 0.02);
        assert_eq!(cams[0].params, cameras[0].params);
    }

    #[test]
    fn test_focal_length_search_and_refinement() {
        let true_camera = camera(800.0);
        let cams_from_rig = vec![Rigid3d::identity()];
        let corrs = correspondences(&cams_from_rig, std::slice::from_ref(&true_camera), 80, 4);

        let mut cams = vec![camera(500.0)];
        let mut options = AbsolutePoseEstimationOptions {
            estimate_focal_length: true,
            ..Default::default()
        };
        options.ransac.random_seed = Some(2);
        let estimate = estimate_generalized_absolute_pose(&options, &corrs, &cams_from_rig, &mut cams).unwrap();
        let inliers: Vec<PoseCorrespondence> = corrs
            .iter()
            .zip(&estimate.inlier_mask)
            .filter(|(_, inlier)| **inlier)
            .map(|(c, _)| *c)
            .collect();
        assert!(inliers.len() >= 30);

        let mut rig_from_world = estimate.rig_from_world;
        let refine = AbsolutePoseRefinementOptions::default();
        assert!(refine_generalized_absolute_pose(
            &refine,
            &inliers,
            &cams_from_rig,
            &mut rig_from_world,
            &mut cams,
            None
        ));
        assert_relative_eq!(cams[0].mean_focal_length(), 800.0, max_relative = 1e-3);
    }

    #[test]
    fn test_prior_pulls_position() {
        let cameras = vec![camera(800.0)];
        let cams_from_rig = vec![Rigid3d::identity()];
        let corrs = correspondences(&cams_from_rig, &cameras, 30, 6);
        let center = truth().center();
        let prior = PosePrior::isotropic(center, 0.01);

        let mut rig_from_world = truth();
        let mut cams = cameras.clone();
        let options = AbsolutePoseRefinementOptions {
            refine_focal_length: false,
            refine_extra_params: false,
            ..Default::default()
        };
        assert!(refine_generalized_absolute_pose(
            &options,
            &corrs,
            &cams_from_rig,
            &mut rig_from_world,
            &mut cams,
            Some(&prior)
        ));
        assert!((rig_from_world.center() - center).norm() < 1e-4);
    }
}
