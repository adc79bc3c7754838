//! Robust multi-view triangulation.
//!
//! Hypotheses are two-view DLT points; observations are scored by the angle
//! between their viewing ray and the ray towards the hypothesis. Short tracks
//! try every view pair, longer ones sample pairs with RANSAC. The winner is
//! refit on all its inliers with the multi-view DLT.

use nalgebra::{Matrix3x4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::ransac::{ransac, Estimator, RansacOptions};
use crate::error::{check_option, Result};
use crate::geometry::{
    calculate_angular_error, calculate_triangulation_angle, has_point_positive_depth,
    triangulate_multi_view_point, Rigid3d,
};

/// One observation of the point to triangulate.
#[derive(Debug, Clone, Copy)]
pub struct TriangulationObservation {
    /// Normalized image coordinates.
    pub point: Vector2<f64>,
    pub cam_from_world: Rigid3d,
}

impl TriangulationObservation {
    pub fn new(point: Vector2<f64>, cam_from_world: Rigid3d) -> Self {
        Self {
            point,
            cam_from_world,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateTriangulationOptions {
    /// Minimum triangulation angle in radians.
    pub min_tri_angle: f64,
    /// `ransac.max_error` is the maximum angular error in radians.
    pub ransac: RansacOptions,
    /// Tracks up to this length are searched exhaustively over view pairs.
    pub max_num_exhaustive_observations: usize,
}

impl Default for EstimateTriangulationOptions {
    fn default() -> Self {
        Self {
            min_tri_angle: 1.5f64.to_radians(),
            ransac: RansacOptions {
                max_error: 2.0f64.to_radians(),
                min_inlier_ratio: 0.02,
                confidence: 0.9999,
                max_num_trials: 10_000,
                ..Default::default()
            },
            max_num_exhaustive_observations: 15,
        }
    }
}

impl EstimateTriangulationOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.min_tri_angle >= 0.0, "min_tri_angle must be non-negative")?;
        self.ransac.check()
    }
}

/// Triangulated point with its consensus set.
#[derive(Debug, Clone)]
pub struct TriangulationEstimate {
    pub xyz: Vector3<f64>,
    pub inlier_mask: Vec<bool>,
}

pub struct TriangulationEstimator {
    min_tri_angle: f64,
}

impl TriangulationEstimator {
    pub fn new(min_tri_angle: f64) -> Self {
        Self { min_tri_angle }
    }
}

impl Estimator for TriangulationEstimator {
    type Sample = TriangulationObservation;
    type Model = Vector3<f64>;

    fn min_num_samples(&self) -> usize {
        2
    }

    fn estimate(&self, samples: &[TriangulationObservation]) -> Vec<Vector3<f64>> {
        if samples.len() < 2 {
            return Vec::new();
        }
        let projections: Vec<Matrix3x4<f64>> = samples.iter().map(|s| s.cam_from_world.to_matrix()).collect();
        let points: Vec<Vector2<f64>> = samples.iter().map(|s| s.point).collect();
        let Some(xyz) = triangulate_multi_view_point(&projections, &points) else {
            return Vec::new();
        };

        if !samples
            .iter()
            .all(|s| has_point_positive_depth(&s.cam_from_world, &xyz))
        {
            return Vec::new();
        }

        let centers: Vec<Vector3<f64>> = samples.iter().map(|s| s.cam_from_world.center()).collect();
        let sufficient_angle = centers.iter().enumerate().any(|(i, c1)| {
            centers[..i]
                .iter()
                .any(|c2| calculate_triangulation_angle(c1, c2, &xyz) >= self.min_tri_angle)
        });
        if sufficient_angle {
            vec![xyz]
        } else {
            Vec::new()
        }
    }

    /// Squared angular error.
    fn residuals(&self, samples: &[TriangulationObservation], xyz: &Vector3<f64>) -> Vec<f64> {
        samples
            .iter()
            .map(|s| {
                if !has_point_positive_depth(&s.cam_from_world, xyz) {
                    return f64::MAX;
                }
                calculate_angular_error(&s.point, xyz, &s.cam_from_world).powi(2)
            })
            .collect()
    }
}

fn inlier_mask(residuals: &[f64], max_squared_error: f64) -> Vec<bool> {
    residuals.iter().map(|r| *r <= max_squared_error).collect()
}

/// Best point over all view pairs, refit on its inliers.
fn exhaustive_triangulation(
    estimator: &TriangulationEstimator,
    observations: &[TriangulationObservation],
    options: &EstimateTriangulationOptions,
) -> Option<TriangulationEstimate> {
    let max_squared_error = options.ransac.max_error * options.ransac.max_error;
    let mut best: Option<(Vector3<f64>, usize, f64)> = None;

    for i in 0..observations.len() {
        for j in (i + 1)..observations.len() {
            for xyz in estimator.estimate(&[observations[i], observations[j]]) {
                let residuals = estimator.residuals(observations, &xyz);
                let num_inliers = residuals.iter().filter(|r| **r <= max_squared_error).count();
                let residual_sum: f64 = residuals.iter().filter(|r| **r <= max_squared_error).sum();
                let better = best.as_ref().map_or(true, |(_, n, sum)| {
                    num_inliers > *n || (num_inliers == *n && residual_sum < *sum)
                });
                if better {
                    best = Some((xyz, num_inliers, residual_sum));
                }
            }
        }
    }

    let (mut xyz, mut num_inliers, _) = best?;
    let mask = inlier_mask(&estimator.residuals(observations, &xyz), max_squared_error);
    let inliers: Vec<TriangulationObservation> = observations
        .iter()
        .zip(&mask)
        .filter(|(_, m)| **m)
        .map(|(o, _)| *o)
        .collect();
    if let Some(refined) = estimator.estimate(&inliers).into_iter().next() {
        let refined_inliers = estimator
            .residuals(observations, &refined)
            .iter()
            .filter(|r| **r <= max_squared_error)
            .count();
        if refined_inliers >= num_inliers {
            xyz = refined;
            num_inliers = refined_inliers;
        }
    }

    let inlier_ratio = num_inliers as f64 / observations.len() as f64;
    if num_inliers < 2 || inlier_ratio < options.ransac.min_inlier_ratio {
        return None;
    }
    Some(TriangulationEstimate {
        xyz,
        inlier_mask: inlier_mask(&estimator.residuals(observations, &xyz), max_squared_error),
    })
}

/// Robustly triangulate a point from two or more posed observations.
///
/// # Returns
/// * `None` if no hypothesis has a sufficient triangulation angle and
///   positive depth, or the consensus is too small
pub fn estimate_triangulation(
    options: &EstimateTriangulationOptions,
    observations: &[TriangulationObservation],
) -> Option<TriangulationEstimate> {
    if observations.len() < 2 {
        return None;
    }
    let estimator = TriangulationEstimator::new(options.min_tri_angle);
    if observations.len() <= options.max_num_exhaustive_observations {
        return exhaustive_triangulation(&estimator, observations, options);
    }

    let report = ransac(&estimator, observations, &options.ransac)?;
    Some(TriangulationEstimate {
        xyz: report.model,
        inlier_mask: report.inlier_mask,
    })
}
