//! Sim3d: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Used to re-normalize a reconstruction's gauge and to align reconstructions
//! against ground truth or pose priors.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::Rigid3d;

/// 7-DOF similarity transformation: rotation + translation + scale.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sim3d {
    pub scale: f64,
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Sim3d {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(scale: f64, rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            scale,
            rotation,
            translation,
        }
    }

    /// Inverse transformation.
    ///
    /// For Sim3: S = [sR | t; 0 | 1]
    /// Inverse: S^{-1} = [(1/s)R^T | -(1/s)R^T*t; 0 | 1]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            scale: scale_inv,
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &Sim3d) -> Self {
        Self {
            scale: self.scale * other.scale,
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
        }
    }

    /// Transform a single point: p' = s * R * p + t.
    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Re-express a `cam_from_world` pose after the world has been moved by
    /// `self` (`new_world_from_world`).
    ///
    /// The camera frame is scaled together with the world so that the result
    /// remains a rigid transform.
    pub fn transform_pose(&self, cam_from_world: &Rigid3d) -> Rigid3d {
        let rotation = cam_from_world.rotation * self.rotation.inverse();
        let translation = self.scale * cam_from_world.translation - rotation * self.translation;
        Rigid3d::new(rotation, translation)
    }

    /// Estimate `dst ≈ S * src` in the least-squares sense (Umeyama).
    ///
    /// # Returns
    /// * `None` for fewer than three pairs or degenerate (collapsed) input
    pub fn estimate(src: &[Vector3<f64>], dst: &[Vector3<f64>]) -> Option<Sim3d> {
        let n = src.len();
        if n < 3 || n != dst.len() {
            return None;
        }

        let centroid_src = centroid(src);
        let centroid_dst = centroid(dst);

        let mut cov = Matrix3::zeros();
        let mut var_src = 0.0;
        for (s, d) in src.iter().zip(dst) {
            let cs = s - centroid_src;
            let cd = d - centroid_dst;
            cov += cd * cs.transpose();
            var_src += cs.norm_squared();
        }
        cov /= n as f64;
        var_src /= n as f64;
        if var_src < 1e-12 {
            return None;
        }

        // cov = U * D * V^T, R = U * S * V^T with S fixing reflections
        let svd = cov.svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let mut sign = Vector3::new(1.0, 1.0, 1.0);
        if (u * v_t).determinant() < 0.0 {
            sign.z = -1.0;
        }
        let rotation_mat = u * Matrix3::from_diagonal(&sign) * v_t;
        let scale = svd.singular_values.dot(&sign) / var_src;
        if !scale.is_finite() || scale <= 0.0 {
            return None;
        }

        let rotation =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
        let translation = centroid_dst - scale * (rotation * centroid_src);

        Some(Sim3d {
            scale,
            rotation,
            translation,
        })
    }
}

impl Default for Sim3d {
    fn default() -> Self {
        Self::identity()
    }
}

/// Compute centroid of a set of 3D points.
pub(crate) fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_sim3() -> Sim3d {
        Sim3d::new(
            2.5,
            UnitQuaternion::from_scaled_axis(Vector3::new(0.2, -0.4, 0.9)),
            Vector3::new(1.0, -2.0, 3.0),
        )
    }

    #[test]
    fn test_inverse() {
        let sim3 = sample_sim3();
        let composed = sim3.compose(&sim3.inverse());

        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_back = sim3.inverse().transform_point(&sim3.transform_point(&p));
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose() {
        let s1 = Sim3d::new(2.0, UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
        let s2 = Sim3d::new(3.0, UnitQuaternion::identity(), Vector3::new(0.0, 1.0, 0.0));
        let composed = s1.compose(&s2);

        assert_relative_eq!(composed.scale, 6.0, epsilon = 1e-10);
        // s1.t + s1.s * R1 * s2.t = (1,0,0) + 2*(0,1,0)
        assert_relative_eq!(composed.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-10);
    }

    #[test]
    fn test_transform_pose_keeps_projection() {
        let sim3 = sample_sim3();
        let cam_from_world =
            Rigid3d::from_axis_angle(Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.5, -0.5, 4.0));
        let x_world = Vector3::new(0.3, 0.7, -1.1);

        let before = cam_from_world.transform_point(&x_world);
        let after = sim3
            .transform_pose(&cam_from_world)
            .transform_point(&sim3.transform_point(&x_world));

        // Same viewing ray, depth scaled by s
        assert_relative_eq!(after, before * sim3.scale, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_recovers_transform() {
        let truth = sample_sim3();
        let src = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 2.0, 3.0),
        ];
        let dst: Vec<_> = src.iter().map(|p| truth.transform_point(p)).collect();
        let estimated = Sim3d::estimate(&src, &dst).unwrap();

        assert_relative_eq!(estimated.scale, truth.scale, epsilon = 1e-9);
        assert_relative_eq!(estimated.translation, truth.translation, epsilon = 1e-9);
        assert_relative_eq!(estimated.rotation.angle_to(&truth.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_rejects_collapsed_points() {
        let src = vec![Vector3::new(1.0, 1.0, 1.0); 4];
        let dst = vec![Vector3::new(2.0, 2.0, 2.0); 4];
        assert!(Sim3d::estimate(&src, &dst).is_none());
    }
}
