//! Error type for contract violations.
//!
//! Algorithmic failures (too few inliers, no initial pair, solver trouble) are
//! reported through `bool`/`Option`/count return values. An `SfmError` means the
//! caller used an API out of contract and must not continue the session as if
//! nothing happened.

use thiserror::Error;

use crate::scene::{CameraId, FrameId, ImageId, Point3DId, RigId};
use crate::sensor::SensorId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SfmError {
    #[error("rig {0} already has a reference sensor")]
    ReferenceSensorAlreadySet(RigId),

    #[error("rig {0} has no reference sensor yet, add it before other sensors")]
    MissingReferenceSensor(RigId),

    #[error("sensor {sensor} is already part of rig {rig}")]
    DuplicateSensor { rig: RigId, sensor: SensorId },

    #[error("sensor {sensor} is not part of rig {rig}")]
    UnknownSensor { rig: RigId, sensor: SensorId },

    #[error("unknown camera {0}")]
    UnknownCamera(CameraId),

    #[error("unknown rig {0}")]
    UnknownRig(RigId),

    #[error("unknown frame {0}")]
    UnknownFrame(FrameId),

    #[error("unknown image {0}")]
    UnknownImage(ImageId),

    #[error("unknown 3D point {0}")]
    UnknownPoint3D(Point3DId),

    #[error("keypoint {point2d_idx} out of range for image {image_id}")]
    UnknownPoint2D { image_id: ImageId, point2d_idx: usize },

    #[error("keypoint {point2d_idx} of image {image_id} already observes a 3D point")]
    Point2DAlreadyTriangulated { image_id: ImageId, point2d_idx: usize },

    #[error("frame {0} is already registered")]
    FrameAlreadyRegistered(FrameId),

    #[error("frame {0} is not registered")]
    FrameNotRegistered(FrameId),

    #[error("mapper is not bound to a reconstruction")]
    NoReconstruction,

    #[error("mapper is already bound to a reconstruction")]
    ReconstructionAlreadyBound,

    #[error("initial pair can only be registered into a reconstruction without registered frames ({0} registered)")]
    ReconstructionNotEmpty(usize),

    #[error("images {0} and {1} belong to the same frame")]
    SameFrame(ImageId, ImageId),

    #[error("operation needs at least {required} registered frames, found {found}")]
    NotEnoughRegisteredFrames { required: usize, found: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, SfmError>;

/// Returns `InvalidOptions` with the given message unless `condition` holds.
pub(crate) fn check_option(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(SfmError::InvalidOptions(message.to_string()))
    }
}
