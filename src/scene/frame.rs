//! Frame - one capture event of a rig.
//!
//! All images of a frame share the frame's `rig_from_world` pose. A frame is
//! registered in a reconstruction exactly when it has a pose.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::types::{FrameId, ImageId, RigId};
use crate::geometry::Rigid3d;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub rig_id: RigId,
    pub image_ids: Vec<ImageId>,
    pub rig_from_world: Option<Rigid3d>,
}

impl Frame {
    pub fn new(frame_id: FrameId, rig_id: RigId) -> Self {
        Self {
            frame_id,
            rig_id,
            image_ids: Vec::new(),
            rig_from_world: None,
        }
    }

    pub fn with_images(frame_id: FrameId, rig_id: RigId, image_ids: Vec<ImageId>) -> Self {
        Self {
            frame_id,
            rig_id,
            image_ids,
            rig_from_world: None,
        }
    }

    pub fn has_pose(&self) -> bool {
        self.rig_from_world.is_some()
    }

    pub fn add_image(&mut self, image_id: ImageId) {
        if !self.image_ids.contains(&image_id) {
            self.image_ids.push(image_id);
        }
    }
}

/// Prior on the position of a frame's rig origin in world coordinates
/// (e.g. from GNSS).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosePrior {
    pub position: Vector3<f64>,
    pub position_covariance: Matrix3<f64>,
}

impl PosePrior {
    /// Prior with isotropic standard deviation `sigma`.
    pub fn isotropic(position: Vector3<f64>, sigma: f64) -> Self {
        Self {
            position,
            position_covariance: Matrix3::identity() * (sigma * sigma),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
    }

    /// Square-root information matrix `L^T` with `L * L^T = Σ^{-1}`, used to
    /// whiten position residuals.
    pub fn sqrt_information(&self) -> Option<Matrix3<f64>> {
        let information = self.position_covariance.try_inverse()?;
        let cholesky = information.cholesky()?;
        Some(cholesky.l().transpose())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_pose_state() {
        let mut frame = Frame::new(FrameId::new(1), RigId::new(1));
        frame.add_image(ImageId::new(4));
        frame.add_image(ImageId::new(4));
        assert_eq!(frame.image_ids.len(), 1);
        assert!(!frame.has_pose());

        frame.rig_from_world = Some(Rigid3d::identity());
        assert!(frame.has_pose());
    }

    #[test]
    fn test_sqrt_information_whitens() {
        let prior = PosePrior::isotropic(Vector3::new(1.0, 2.0, 3.0), 2.0);
        let sqrt_info = prior.sqrt_information().unwrap();
        let residual = sqrt_info * Vector3::new(2.0, 0.0, 0.0);
        assert_relative_eq!(residual.norm(), 1.0, epsilon = 1e-12);
    }
}
