//! Image - a single camera view with its keypoints.
//!
//! Keypoints are stored as `Point2D` entries; once the image's frame is
//! registered, keypoints may link to triangulated 3D points. The pose of an
//! image is not stored here: it is derived from its frame's `rig_from_world`
//! and the rig extrinsics (see `Reconstruction::cam_from_world`).

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use super::types::{CameraId, FrameId, ImageId, Point3DId};

/// A keypoint and its optional 3D point association.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    /// Pixel coordinates.
    pub xy: Vector2<f64>,
    pub point3d_id: Option<Point3DId>,
}

impl Point2D {
    pub fn new(xy: Vector2<f64>) -> Self {
        Self {
            xy,
            point3d_id: None,
        }
    }

    pub fn has_point3d(&self) -> bool {
        self.point3d_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub image_id: ImageId,
    pub name: String,
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub points2d: Vec<Point2D>,
}

impl Image {
    pub fn new(
        image_id: ImageId,
        name: impl Into<String>,
        camera_id: CameraId,
        frame_id: FrameId,
        keypoints: &[Vector2<f64>],
    ) -> Self {
        Self {
            image_id,
            name: name.into(),
            camera_id,
            frame_id,
            points2d: keypoints.iter().map(|xy| Point2D::new(*xy)).collect(),
        }
    }

    pub fn num_points2d(&self) -> usize {
        self.points2d.len()
    }

    /// Number of keypoints associated with a 3D point.
    pub fn num_points3d(&self) -> usize {
        self.points2d.iter().filter(|p| p.has_point3d()).count()
    }

    pub fn point2d(&self, idx: usize) -> Option<&Point2D> {
        self.points2d.get(idx)
    }

    /// Drop all 3D point associations (used when loading from the cache).
    pub fn reset_point3d_links(&mut self) {
        for point2d in &mut self.points2d {
            point2d.point3d_id = None;
        }
    }
}
