//! Sensor models: camera intrinsics and multi-sensor rigs.

pub mod camera;
pub mod rig;

pub use camera::{Camera, CameraModelId};
pub use rig::{Rig, SensorId, SensorType};
