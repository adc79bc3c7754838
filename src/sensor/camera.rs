//! Camera intrinsics.
//!
//! A small set of models covers what the mapper needs:
//! - `SimplePinhole`: f, cx, cy
//! - `Pinhole`: fx, fy, cx, cy
//! - `SimpleRadial`: f, cx, cy, k
//! - `Radial`: f, cx, cy, k1, k2
//!
//! Conventions: camera frame is RDF (x right, y down, z forward), pixel
//! coordinates have their origin at the top-left image corner.

use nalgebra::{Matrix2, Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SfmError};
use crate::geometry::triangulation::MIN_POSITIVE_DEPTH;
use crate::geometry::Rigid3d;
use crate::scene::CameraId;

/// Number of fixed-point iterations used to invert the distortion.
const UNDISTORT_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraModelId {
    SimplePinhole,
    Pinhole,
    SimpleRadial,
    Radial,
}

impl CameraModelId {
    pub fn num_params(self) -> usize {
        match self {
            CameraModelId::SimplePinhole => 3,
            CameraModelId::Pinhole => 4,
            CameraModelId::SimpleRadial => 4,
            CameraModelId::Radial => 5,
        }
    }

    pub fn focal_length_idxs(self) -> &'static [usize] {
        match self {
            CameraModelId::Pinhole => &[0, 1],
            _ => &[0],
        }
    }

    pub fn principal_point_idxs(self) -> &'static [usize] {
        match self {
            CameraModelId::Pinhole => &[2, 3],
            _ => &[1, 2],
        }
    }

    pub fn extra_params_idxs(self) -> &'static [usize] {
        match self {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => &[],
            CameraModelId::SimpleRadial => &[3],
            CameraModelId::Radial => &[3, 4],
        }
    }
}

/// Intrinsic calibration of one physical camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: CameraId,
    pub model: CameraModelId,
    pub width: usize,
    pub height: usize,
    pub params: Vec<f64>,
    /// Whether the focal length comes from a trusted source (EXIF, calibration).
    pub has_prior_focal_length: bool,
}

impl Camera {
    /// Create a camera with explicit parameters.
    ///
    /// Fails if the parameter count does not match the model.
    pub fn new(
        camera_id: CameraId,
        model: CameraModelId,
        width: usize,
        height: usize,
        params: Vec<f64>,
    ) -> Result<Self> {
        if params.len() != model.num_params() {
            return Err(SfmError::InvalidOptions(format!(
                "camera {} expects {} parameters for {:?}, got {}",
                camera_id,
                model.num_params(),
                model,
                params.len()
            )));
        }
        Ok(Self {
            camera_id,
            model,
            width,
            height,
            params,
            has_prior_focal_length: false,
        })
    }

    /// Create a camera with the given focal length, a centered principal
    /// point and zero distortion.
    pub fn from_focal_length(
        camera_id: CameraId,
        model: CameraModelId,
        focal_length: f64,
        width: usize,
        height: usize,
    ) -> Self {
        let mut params = vec![0.0; model.num_params()];
        for &idx in model.focal_length_idxs() {
            params[idx] = focal_length;
        }
        let pp = model.principal_point_idxs();
        params[pp[0]] = width as f64 / 2.0;
        params[pp[1]] = height as f64 / 2.0;
        Self {
            camera_id,
            model,
            width,
            height,
            params,
            has_prior_focal_length: false,
        }
    }

    pub fn focal_length_idxs(&self) -> &'static [usize] {
        self.model.focal_length_idxs()
    }

    pub fn principal_point_idxs(&self) -> &'static [usize] {
        self.model.principal_point_idxs()
    }

    pub fn extra_params_idxs(&self) -> &'static [usize] {
        self.model.extra_params_idxs()
    }

    fn focal_lengths(&self) -> (f64, f64) {
        match self.model {
            CameraModelId::Pinhole => (self.params[0], self.params[1]),
            _ => (self.params[0], self.params[0]),
        }
    }

    fn principal_point(&self) -> (f64, f64) {
        let pp = self.principal_point_idxs();
        (self.params[pp[0]], self.params[pp[1]])
    }

    pub fn mean_focal_length(&self) -> f64 {
        let (fx, fy) = self.focal_lengths();
        0.5 * (fx + fy)
    }

    pub fn set_focal_length(&mut self, focal_length: f64) {
        for &idx in self.model.focal_length_idxs() {
            self.params[idx] = focal_length;
        }
    }

    pub fn max_dimension(&self) -> usize {
        self.width.max(self.height)
    }

    /// Radial distortion factor and its derivative w.r.t. r².
    fn radial_factor(&self, r2: f64) -> (f64, f64) {
        match self.model {
            CameraModelId::SimplePinhole | CameraModelId::Pinhole => (1.0, 0.0),
            CameraModelId::SimpleRadial => {
                let k = self.params[3];
                (1.0 + k * r2, k)
            }
            CameraModelId::Radial => {
                let (k1, k2) = (self.params[3], self.params[4]);
                (1.0 + k1 * r2 + k2 * r2 * r2, k1 + 2.0 * k2 * r2)
            }
        }
    }

    /// Project a point in the camera frame to pixel coordinates.
    ///
    /// # Returns
    /// * `None` if the point is not in front of the camera
    pub fn img_from_cam(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_POSITIVE_DEPTH {
            return None;
        }
        Some(self.img_from_normalized(&Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)))
    }

    /// Apply distortion and intrinsics to a normalized image point.
    pub fn img_from_normalized(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let (fx, fy) = self.focal_lengths();
        let (cx, cy) = self.principal_point();
        let (d, _) = self.radial_factor(normalized.norm_squared());
        Vector2::new(fx * normalized.x * d + cx, fy * normalized.y * d + cy)
    }

    /// Back-project a pixel to normalized (undistorted) camera coordinates.
    pub fn cam_from_img(&self, xy: &Vector2<f64>) -> Vector2<f64> {
        let (fx, fy) = self.focal_lengths();
        let (cx, cy) = self.principal_point();
        let distorted = Vector2::new((xy.x - cx) / fx, (xy.y - cy) / fy);
        if self.extra_params_idxs().is_empty() {
            return distorted;
        }

        let mut undistorted = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let (d, _) = self.radial_factor(undistorted.norm_squared());
            if d.abs() < 1e-12 {
                break;
            }
            let next = distorted / d;
            let converged = (next - undistorted).norm_squared() < 1e-24;
            undistorted = next;
            if converged {
                break;
            }
        }
        undistorted
    }

    /// Convert a pixel error threshold into normalized camera coordinates.
    pub fn cam_from_img_threshold(&self, threshold: f64) -> f64 {
        threshold / self.mean_focal_length()
    }

    /// Projection together with its Jacobian w.r.t. the camera-frame point.
    pub fn img_from_cam_with_jacobian(
        &self,
        p_cam: &Vector3<f64>,
    ) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
        if p_cam.z <= MIN_POSITIVE_DEPTH {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        let x = p_cam.x * inv_z;
        let y = p_cam.y * inv_z;
        let (fx, fy) = self.focal_lengths();
        let (cx, cy) = self.principal_point();
        let (d, dd_dr2) = self.radial_factor(x * x + y * y);

        let projection = Vector2::new(fx * x * d + cx, fy * y * d + cy);

        // d(uv)/d(xy) on the normalized plane
        let j_norm = Matrix2::new(
            fx * (d + 2.0 * dd_dr2 * x * x),
            fx * 2.0 * dd_dr2 * x * y,
            fy * 2.0 * dd_dr2 * x * y,
            fy * (d + 2.0 * dd_dr2 * y * y),
        );
        // d(xy)/d(p_cam)
        let j_proj = Matrix2x3::new(
            inv_z,
            0.0,
            -x * inv_z,
            0.0,
            inv_z,
            -y * inv_z,
        );
        Some((projection, j_norm * j_proj))
    }

    /// Squared pixel reprojection error of `point3d` observed at `xy`.
    ///
    /// Points behind the camera yield `f64::MAX`.
    pub fn squared_reprojection_error(
        &self,
        xy: &Vector2<f64>,
        point3d: &Vector3<f64>,
        cam_from_world: &Rigid3d,
    ) -> f64 {
        match self.img_from_cam(&cam_from_world.transform_point(point3d)) {
            Some(projection) => (projection - xy).norm_squared(),
            None => f64::MAX,
        }
    }

    /// Whether the intrinsics drifted into implausible values.
    ///
    /// Checks the focal length relative to the larger image dimension and the
    /// magnitude of distortion parameters.
    pub fn has_bogus_params(
        &self,
        min_focal_length_ratio: f64,
        max_focal_length_ratio: f64,
        max_extra_param: f64,
    ) -> bool {
        let inv_max_size = 1.0 / self.max_dimension().max(1) as f64;
        let bogus_focal = self.focal_length_idxs().iter().any(|&idx| {
            let ratio = self.params[idx] * inv_max_size;
            ratio < min_focal_length_ratio || ratio > max_focal_length_ratio
        });
        let bogus_extra = self
            .extra_params_idxs()
            .iter()
            .any(|&idx| self.params[idx].abs() > max_extra_param);
        bogus_focal || bogus_extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn radial_camera() -> Camera {
        Camera::new(
            CameraId::new(1),
            CameraModelId::Radial,
            640,
            480,
            vec![500.0, 320.0, 240.0, 0.05, -0.01],
        )
        .unwrap()
    }

    #[test]
    fn test_param_count_validated() {
        let result = Camera::new(CameraId::new(1), CameraModelId::Pinhole, 640, 480, vec![1.0]);
        assert!(matches!(result, Err(SfmError::InvalidOptions(_))));
    }

    #[test]
    fn test_from_focal_length_centers_principal_point() {
        let camera =
            Camera::from_focal_length(CameraId::new(2), CameraModelId::SimpleRadial, 800.0, 1024, 768);
        assert_eq!(camera.params, vec![800.0, 512.0, 384.0, 0.0]);
        assert_relative_eq!(camera.mean_focal_length(), 800.0);
    }

    #[test]
    fn test_cam_from_img_inverts_projection() {
        let camera = radial_camera();
        let p_cam = Vector3::new(0.4, -0.3, 2.0);
        let xy = camera.img_from_cam(&p_cam).unwrap();
        let normalized = camera.cam_from_img(&xy);
        assert_relative_eq!(normalized, Vector2::new(0.2, -0.15), epsilon = 1e-9);
    }

    #[test]
    fn test_projection_jacobian_numerical() {
        let camera = radial_camera();
        let p_cam = Vector3::new(0.3, 0.2, 1.5);
        let (_, jacobian) = camera.img_from_cam_with_jacobian(&p_cam).unwrap();

        let eps = 1e-6;
        for k in 0..3 {
            let mut plus = p_cam;
            let mut minus = p_cam;
            plus[k] += eps;
            minus[k] -= eps;
            let numeric = (camera.img_from_cam(&plus).unwrap() - camera.img_from_cam(&minus).unwrap())
                / (2.0 * eps);
            assert_relative_eq!(jacobian.column(k).into_owned(), numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_point_behind_camera_not_projected() {
        let camera = radial_camera();
        assert!(camera.img_from_cam(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        let err = camera.squared_reprojection_error(
            &Vector2::new(0.0, 0.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &Rigid3d::identity(),
        );
        assert_eq!(err, f64::MAX);
    }

    #[test]
    fn test_has_bogus_params() {
        let mut camera = radial_camera();
        assert!(!camera.has_bogus_params(0.1, 10.0, 1.0));

        camera.set_focal_length(10.0);
        assert!(camera.has_bogus_params(0.1, 10.0, 1.0));

        camera.set_focal_length(500.0);
        camera.params[3] = 2.0;
        assert!(camera.has_bogus_params(0.1, 10.0, 1.0));
    }
}
