//! SO(3) helpers used by the estimators and the bundle adjuster.
//!
//! Rotation updates are applied on the left: `R' = exp([ω]×) * R`.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Apply a left tangent-space increment to a rotation.
#[inline]
pub fn retract_rotation(rotation: &UnitQuaternion<f64>, omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega) * rotation
}

/// Closest rotation matrix (Frobenius norm) to an arbitrary 3x3 matrix.
///
/// Returns `None` when the SVD fails to produce both factors.
pub fn project_to_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        for i in 0..3 {
            u_flipped[(i, 2)] = -u_flipped[(i, 2)];
        }
        rotation = u_flipped * v_t;
    }
    Some(rotation)
}
