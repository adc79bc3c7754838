//! Point3D - a triangulated landmark and its observation track.
//!
//! Each Point3D owns a track: the list of (image, keypoint) observations that
//! were associated with it. The track is kept in sync with the images'
//! `Point2D::point3d_id` links by the Reconstruction.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::types::{ImageId, Point2DIdx, Point3DId};

/// One observation of a 3D point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackElement {
    pub image_id: ImageId,
    pub point2d_idx: Point2DIdx,
}

impl TrackElement {
    pub fn new(image_id: ImageId, point2d_idx: Point2DIdx) -> Self {
        Self {
            image_id,
            point2d_idx,
        }
    }
}

/// Observation list of a 3D point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    elements: Vec<TrackElement>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<TrackElement>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[TrackElement] {
        &self.elements
    }

    pub fn add_element(&mut self, image_id: ImageId, point2d_idx: Point2DIdx) {
        self.elements.push(TrackElement::new(image_id, point2d_idx));
    }

    pub fn add_elements(&mut self, elements: &[TrackElement]) {
        self.elements.extend_from_slice(elements);
    }

    /// Remove the observation of keypoint `point2d_idx` in `image_id`.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn delete_element(&mut self, image_id: ImageId, point2d_idx: Point2DIdx) -> bool {
        let before = self.elements.len();
        self.elements
            .retain(|el| !(el.image_id == image_id && el.point2d_idx == point2d_idx));
        self.elements.len() != before
    }

    pub fn contains_image(&self, image_id: ImageId) -> bool {
        self.elements.iter().any(|el| el.image_id == image_id)
    }
}

/// A triangulated 3D point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub id: Point3DId,

    /// Position in world frame.
    pub xyz: Vector3<f64>,

    pub track: Track,

    /// Mean reprojection error in pixels; negative while unknown.
    pub error: f64,
}

impl Point3D {
    pub fn new(id: Point3DId, xyz: Vector3<f64>, track: Track) -> Self {
        Self {
            id,
            xyz,
            track,
            error: -1.0,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_add_and_delete() {
        let mut track = Track::new();
        track.add_element(ImageId::new(1), 3);
        track.add_element(ImageId::new(2), 7);
        assert_eq!(track.len(), 2);
        assert!(track.contains_image(ImageId::new(2)));

        assert!(track.delete_element(ImageId::new(2), 7));
        assert!(!track.delete_element(ImageId::new(2), 7));
        assert_eq!(track.len(), 1);
        assert!(!track.contains_image(ImageId::new(2)));
    }

    #[test]
    fn test_new_point_has_unknown_error() {
        let point = Point3D::new(Point3DId::new(1), Vector3::zeros(), Track::new());
        assert!(!point.has_error());
    }
}
