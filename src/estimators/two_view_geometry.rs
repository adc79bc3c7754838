//! Calibrated two-view geometry.
//!
//! Relative pose between two cameras from keypoint matches:
//! 1. Undistort and normalize the keypoints with the camera intrinsics
//! 2. Estimate the essential matrix with the normalized 8-point algorithm in
//!    RANSAC, scoring by Sampson error
//! 3. Decompose the essential matrix into four pose hypotheses and keep the
//!    one with the most points in front of both cameras
//!
//! The returned `cam2_from_cam1` has a unit-length baseline.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ransac::{ransac, Estimator, RansacOptions};
use crate::error::{check_option, Result};
use crate::geometry::triangulation::null_vector;
use crate::geometry::{calculate_triangulation_angle, median, triangulate_point, Rigid3d};
use crate::scene::FeatureMatch;
use crate::sensor::Camera;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoViewGeometryOptions {
    /// Maximum Sampson error of an inlier in pixels.
    pub max_error: f64,
    pub min_num_inliers: usize,
    pub ransac: RansacOptions,
}

impl Default for TwoViewGeometryOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0,
            min_num_inliers: 15,
            ransac: RansacOptions {
                confidence: 0.999,
                min_num_trials: 30,
                ..Default::default()
            },
        }
    }
}

impl TwoViewGeometryOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.max_error > 0.0, "max_error must be positive")?;
        self.ransac.check()
    }
}

/// Relative pose with its supporting matches.
#[derive(Debug, Clone)]
pub struct TwoViewGeometry {
    pub cam2_from_cam1: Rigid3d,
    pub inlier_matches: Vec<FeatureMatch>,
    /// Median triangulation angle of the inliers in radians.
    pub tri_angle: f64,
}

/// Normalized 8-point essential matrix estimator.
pub struct EssentialMatrixEstimator;

impl EssentialMatrixEstimator {
    /// Similarity moving the centroid to the origin with mean distance √2.
    fn normalization(points: &[Vector2<f64>]) -> Matrix3<f64> {
        let n = points.len() as f64;
        let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
        let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
        let scale = if mean_dist > f64::EPSILON {
            std::f64::consts::SQRT_2 / mean_dist
        } else {
            1.0
        };
        Matrix3::new(
            scale,
            0.0,
            -scale * centroid.x,
            0.0,
            scale,
            -scale * centroid.y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn apply(t: &Matrix3<f64>, p: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(t[(0, 0)] * p.x + t[(0, 2)], t[(1, 1)] * p.y + t[(1, 2)])
    }
}

impl Estimator for EssentialMatrixEstimator {
    type Sample = (Vector2<f64>, Vector2<f64>);
    type Model = Matrix3<f64>;

    fn min_num_samples(&self) -> usize {
        8
    }

    fn estimate(&self, samples: &[Self::Sample]) -> Vec<Matrix3<f64>> {
        if samples.len() < 8 {
            return Vec::new();
        }
        let points1: Vec<Vector2<f64>> = samples.iter().map(|s| s.0).collect();
        let points2: Vec<Vector2<f64>> = samples.iter().map(|s| s.1).collect();
        let t1 = Self::normalization(&points1);
        let t2 = Self::normalization(&points2);

        // x2^T E x1 = 0
        let mut a = DMatrix::zeros(samples.len().max(9), 9);
        for (i, (p1, p2)) in points1.iter().zip(&points2).enumerate() {
            let x1 = Self::apply(&t1, p1);
            let x2 = Self::apply(&t2, p2);
            let row = [
                x2.x * x1.x,
                x2.x * x1.y,
                x2.x,
                x2.y * x1.x,
                x2.y * x1.y,
                x2.y,
                x1.x,
                x1.y,
                1.0,
            ];
            for (col, value) in row.iter().enumerate() {
                a[(i, col)] = *value;
            }
        }

        let Some(e) = null_vector(&a) else {
            return Vec::new();
        };
        let e_normalized = Matrix3::from_row_slice(e.as_slice());
        let e_raw = t2.transpose() * e_normalized * t1;

        // Two equal singular values and one zero, in unnormalized coordinates
        let svd = e_raw.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Vec::new();
        };
        let essential = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t;
        let norm = essential.norm();
        if norm < f64::EPSILON || !norm.is_finite() {
            return Vec::new();
        }
        vec![essential / norm]
    }

    /// Squared Sampson distance.
    fn residuals(&self, samples: &[Self::Sample], e: &Matrix3<f64>) -> Vec<f64> {
        samples
            .iter()
            .map(|(p1, p2)| {
                let x1 = Vector3::new(p1.x, p1.y, 1.0);
                let x2 = Vector3::new(p2.x, p2.y, 1.0);
                let ex1 = e * x1;
                let etx2 = e.transpose() * x2;
                let x2tex1 = x2.dot(&ex1);
                let denom = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
                if denom <= f64::EPSILON {
                    f64::MAX
                } else {
                    x2tex1 * x2tex1 / denom
                }
            })
            .collect()
    }
}

/// Decompose an essential matrix into its two rotations and the translation
/// direction.
pub fn decompose_essential_matrix(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    #[rustfmt::skip]
    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );

    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    let t = u.column(2).normalize();
    Some((r1, r2, t))
}

/// Triangulate the correspondences under `cam2_from_cam1` and keep the points
/// in front of both cameras.
fn check_cheirality(
    cam2_from_cam1: &Rigid3d,
    points1: &[Vector2<f64>],
    points2: &[Vector2<f64>],
) -> Vec<Vector3<f64>> {
    let proj1 = Rigid3d::identity().to_matrix();
    let proj2 = cam2_from_cam1.to_matrix();
    // Points far beyond the baseline are numerically unstable.
    let max_depth = 1000.0 * cam2_from_cam1.translation.norm();
    points1
        .iter()
        .zip(points2)
        .filter_map(|(p1, p2)| {
            let x = triangulate_point(&proj1, &proj2, p1, p2)?;
            let depth1 = x.z;
            let depth2 = cam2_from_cam1.transform_point(&x).z;
            (depth1 > f64::EPSILON && depth1 < max_depth && depth2 > f64::EPSILON && depth2 < max_depth)
                .then_some(x)
        })
        .collect()
}

/// Recover the relative pose of two calibrated views.
///
/// # Arguments
/// * `points1`/`points2` - Keypoints (pixels) of the two images
/// * `matches` - Candidate matches as `(idx in image1, idx in image2)`
///
/// # Returns
/// * `None` if RANSAC fails or fewer than `min_num_inliers` matches survive
pub fn estimate_relative_pose(
    camera1: &Camera,
    points1: &[Vector2<f64>],
    camera2: &Camera,
    points2: &[Vector2<f64>],
    matches: &[FeatureMatch],
    options: &TwoViewGeometryOptions,
) -> Option<TwoViewGeometry> {
    let valid: Vec<&FeatureMatch> = matches
        .iter()
        .filter(|m| m.point2d_idx1 < points1.len() && m.point2d_idx2 < points2.len())
        .collect();
    if valid.len() < options.min_num_inliers.max(8) {
        return None;
    }

    let samples: Vec<(Vector2<f64>, Vector2<f64>)> = valid
        .iter()
        .map(|m| {
            (
                camera1.cam_from_img(&points1[m.point2d_idx1]),
                camera2.cam_from_img(&points2[m.point2d_idx2]),
            )
        })
        .collect();

    let mut ransac_options = options.ransac.clone();
    ransac_options.max_error = 0.5
        * (camera1.cam_from_img_threshold(options.max_error)
            + camera2.cam_from_img_threshold(options.max_error));
    let report = ransac(&EssentialMatrixEstimator, &samples, &ransac_options)?;
    if report.num_inliers < options.min_num_inliers {
        return None;
    }

    let inlier_idxs = report.inlier_indices();
    let inlier_points1: Vec<Vector2<f64>> = inlier_idxs.iter().map(|&i| samples[i].0).collect();
    let inlier_points2: Vec<Vector2<f64>> = inlier_idxs.iter().map(|&i| samples[i].1).collect();

    let (r1, r2, t) = decompose_essential_matrix(&report.model)?;
    let candidates = [(r1, t), (r2, t), (r1, -t), (r2, -t)];
    let (cam2_from_cam1, points3d) = candidates
        .iter()
        .map(|(r, t)| {
            let pose = Rigid3d::from_rotation_matrix(r, *t);
            let points3d = check_cheirality(&pose, &inlier_points1, &inlier_points2);
            (pose, points3d)
        })
        .max_by_key(|(_, points3d)| points3d.len())?;
    if points3d.is_empty() {
        return None;
    }

    let center1 = Vector3::zeros();
    let center2 = cam2_from_cam1.center();
    let tri_angles: Vec<f64> = points3d
        .iter()
        .map(|x| calculate_triangulation_angle(&center1, &center2, x))
        .collect();
    let tri_angle = median(&tri_angles);

    debug!(
        "[TwoView] {} / {} inliers, {} in front, median tri angle {:.2} deg",
        report.num_inliers,
        samples.len(),
        points3d.len(),
        tri_angle.to_degrees()
    );

    Some(TwoViewGeometry {
        cam2_from_cam1,
        inlier_matches: inlier_idxs.iter().map(|&i| *valid[i]).collect(),
        tri_angle,
    })
}
