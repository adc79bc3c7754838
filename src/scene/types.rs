//! Core ID types for scene entities.

use serde::{Deserialize, Serialize};

/// Index of a keypoint within its image.
pub type Point2DIdx = usize;

/// Unique identifier for a Camera (intrinsics shared by one or more images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u32);

impl CameraId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Unique identifier for a Rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RigId(pub u32);

impl RigId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Unique identifier for a Frame: one capture event of a rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Unique identifier for an Image.
///
/// Images are the unit of feature observations; each belongs to exactly one
/// frame and one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u32);

impl ImageId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Unique identifier for a triangulated 3D point.
///
/// Assigned sequentially by the Reconstruction and never reused, so a merged
/// or deleted point id stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point3DId(pub u64);

impl Point3DId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for Point3DId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Unordered image pair key: `ImagePair::new(a, b) == ImagePair::new(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImagePair {
    pub first: ImageId,
    pub second: ImageId,
}

impl ImagePair {
    pub fn new(a: ImageId, b: ImageId) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// Whether `(a, b)` had to be swapped to build this key.
    pub fn is_swapped(a: ImageId, b: ImageId) -> bool {
        a > b
    }

    pub fn contains(&self, image_id: ImageId) -> bool {
        self.first == image_id || self.second == image_id
    }
}

impl std::fmt::Display for ImagePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_id_equality() {
        assert_eq!(ImageId::new(42), ImageId::new(42));
        assert_ne!(ImageId::new(42), ImageId::new(43));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", Point3DId::new(123)), "P123");
        assert_eq!(format!("{}", FrameId::new(7)), "F7");
    }

    #[test]
    fn test_image_pair_is_unordered() {
        let a = ImageId::new(5);
        let b = ImageId::new(2);
        assert_eq!(ImagePair::new(a, b), ImagePair::new(b, a));
        assert_eq!(ImagePair::new(a, b).first, b);
        assert!(ImagePair::is_swapped(a, b));
        assert!(ImagePair::new(a, b).contains(a));
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<ImageId, &str> = HashMap::new();
        map.insert(ImageId::new(1), "first");
        map.insert(ImageId::new(2), "second");

        assert_eq!(map.get(&ImageId::new(1)), Some(&"first"));
        assert_eq!(map.get(&ImageId::new(3)), None);
    }
}
