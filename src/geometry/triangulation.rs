//! Triangulation primitives on normalized image coordinates.
//!
//! - DLT triangulation from two or more views
//! - Triangulation angles between viewing rays
//! - Cheirality (positive depth) and angular error checks
//!
//! Projection matrices are `cam_from_world` 3x4 matrices; image points are
//! normalized camera coordinates (undistorted, focal length removed).

use nalgebra::{DMatrix, DVector, Matrix3x4, Vector2, Vector3};

use super::Rigid3d;

/// Minimum depth for a point to count as in front of a camera.
pub const MIN_POSITIVE_DEPTH: f64 = f64::EPSILON;

/// Right singular vector of the smallest singular value of `a`.
///
/// Pads the system with zero rows when it has fewer rows than columns so that
/// the full right singular basis is available.
pub(crate) fn null_vector(a: &DMatrix<f64>) -> Option<DVector<f64>> {
    let (rows, cols) = a.shape();
    let system = if rows < cols {
        let mut padded = DMatrix::zeros(cols, cols);
        padded.view_mut((0, 0), (rows, cols)).copy_from(a);
        padded
    } else {
        a.clone()
    };

    let svd = system.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(v_t.row(min_idx).transpose())
}

/// Fill the two DLT rows contributed by one observation.
fn fill_triangulation_rows(
    a: &mut DMatrix<f64>,
    row: usize,
    projection: &Matrix3x4<f64>,
    point: &Vector2<f64>,
) {
    let third_row = projection.row(2);
    for (offset, (axis, value)) in [(0, point.x), (1, point.y)].into_iter().enumerate() {
        let row_data = projection.row(axis);
        for col in 0..4 {
            a[(row + offset, col)] = value * third_row[col] - row_data[col];
        }
    }
}

fn dehomogenize(homog: &DVector<f64>) -> Option<Vector3<f64>> {
    if homog[3].abs() < 1e-12 {
        return None;
    }
    let point = Vector3::new(homog[0] / homog[3], homog[1] / homog[3], homog[2] / homog[3]);
    point.iter().all(|v| v.is_finite()).then_some(point)
}

/// Triangulate a 3D point from two views using DLT.
///
/// # Returns
/// * `None` if the point lies at infinity (rays parallel)
pub fn triangulate_point(
    cam1_from_world: &Matrix3x4<f64>,
    cam2_from_world: &Matrix3x4<f64>,
    point1: &Vector2<f64>,
    point2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let mut a = DMatrix::zeros(4, 4);
    fill_triangulation_rows(&mut a, 0, cam1_from_world, point1);
    fill_triangulation_rows(&mut a, 2, cam2_from_world, point2);
    dehomogenize(&null_vector(&a)?)
}

/// Triangulate a 3D point from an arbitrary number of views using DLT.
pub fn triangulate_multi_view_point(
    cams_from_world: &[Matrix3x4<f64>],
    points: &[Vector2<f64>],
) -> Option<Vector3<f64>> {
    if cams_from_world.len() < 2 || cams_from_world.len() != points.len() {
        return None;
    }
    let mut a = DMatrix::zeros(2 * points.len(), 4);
    for (i, (projection, point)) in cams_from_world.iter().zip(points).enumerate() {
        fill_triangulation_rows(&mut a, 2 * i, projection, point);
    }
    dehomogenize(&null_vector(&a)?)
}

/// Angle in radians between the two viewing rays of a point.
///
/// Always returns the acute variant (`min(angle, π - angle)`) since both very
/// small and very large intersection angles are equally unstable.
pub fn calculate_triangulation_angle(
    center1: &Vector3<f64>,
    center2: &Vector3<f64>,
    point3d: &Vector3<f64>,
) -> f64 {
    let baseline_length_squared = (center1 - center2).norm_squared();
    let ray_length_squared1 = (point3d - center1).norm_squared();
    let ray_length_squared2 = (point3d - center2).norm_squared();

    // Law of cosines
    let denominator = 2.0 * (ray_length_squared1 * ray_length_squared2).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    let nominator = ray_length_squared1 + ray_length_squared2 - baseline_length_squared;
    let angle = (nominator / denominator).clamp(-1.0, 1.0).acos().abs();
    angle.min(std::f64::consts::PI - angle)
}

pub fn calculate_triangulation_angles(
    center1: &Vector3<f64>,
    center2: &Vector3<f64>,
    points3d: &[Vector3<f64>],
) -> Vec<f64> {
    points3d
        .iter()
        .map(|p| calculate_triangulation_angle(center1, center2, p))
        .collect()
}

#[inline]
pub fn has_point_positive_depth(cam_from_world: &Rigid3d, point3d: &Vector3<f64>) -> bool {
    cam_from_world.transform_point(point3d).z > MIN_POSITIVE_DEPTH
}

/// Angle in radians between the observed ray and the ray towards `point3d`.
pub fn calculate_angular_error(
    normalized_point: &Vector2<f64>,
    point3d: &Vector3<f64>,
    cam_from_world: &Rigid3d,
) -> f64 {
    let ray1 = Vector3::new(normalized_point.x, normalized_point.y, 1.0);
    let ray2 = cam_from_world.transform_point(point3d);
    let denom = ray1.norm() * ray2.norm();
    if denom == 0.0 {
        return std::f64::consts::PI;
    }
    (ray1.dot(&ray2) / denom).clamp(-1.0, 1.0).acos()
}

/// Value at percentile `p` in `[0, 100]` with linear interpolation.
///
/// Returns 0 for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}
