//! Rigid3d: 6-DOF rigid body transformation.
//!
//! Poses follow the `b_from_a` naming: a `cam_from_world` transform maps world
//! points into the camera frame, `x_cam = R * x_world + t`.

use nalgebra::{Matrix3, Matrix3x4, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transformation: rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rigid3d {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Rigid3d {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from an axis-angle vector (direction = axis, norm = angle).
    pub fn from_axis_angle(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(axis_angle),
            translation,
        }
    }

    /// Construct from a (possibly slightly non-orthogonal) rotation matrix.
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = nalgebra::Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Inverse transformation: `a_from_b` for a `b_from_a` input.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transformation to a point.
    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// 3x4 matrix `[R | t]`.
    pub fn to_matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Origin of the target frame expressed in the source frame.
    ///
    /// For `cam_from_world` this is the camera projection center in world
    /// coordinates: `-R^T * t`.
    #[inline]
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Angle in radians of the relative rotation between two transforms.
    pub fn rotation_angle_to(&self, other: &Rigid3d) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for Rigid3d {
    fn default() -> Self {
        Self::identity()
    }
}

/// Composition: `(a * b).transform_point(x) == a.transform_point(b.transform_point(x))`.
impl std::ops::Mul for Rigid3d {
    type Output = Rigid3d;

    fn mul(self, rhs: Rigid3d) -> Rigid3d {
        Rigid3d {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl std::ops::Mul<&Rigid3d> for &Rigid3d {
    type Output = Rigid3d;

    fn mul(self, rhs: &Rigid3d) -> Rigid3d {
        *self * *rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> Rigid3d {
        Rigid3d::from_axis_angle(Vector3::new(0.1, -0.3, 0.2), Vector3::new(1.0, 2.0, -0.5))
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, -1.2, 4.0);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = sample_pose();
        let b = Rigid3d::from_axis_angle(Vector3::new(0.0, 0.5, 0.0), Vector3::new(-1.0, 0.0, 3.0));
        let p = Vector3::new(1.0, 1.0, 1.0);
        assert_relative_eq!(
            (a * b).transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_center_maps_to_origin() {
        let pose = sample_pose();
        let center = pose.center();
        assert_relative_eq!(pose.transform_point(&center), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_layout() {
        let pose = sample_pose();
        let m = pose.to_matrix();
        let p = Vector3::new(2.0, -1.0, 0.5);
        let via_matrix = m * p.push(1.0);
        assert_relative_eq!(via_matrix, pose.transform_point(&p), epsilon = 1e-12);
    }
}
