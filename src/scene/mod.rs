//! Scene model: ids, images, frames, 3D points, the read-only input cache and
//! the mutable reconstruction.

pub mod correspondence_graph;
pub mod database_cache;
pub mod frame;
pub mod image;
pub mod point3d;
pub mod reconstruction;
pub mod reconstruction_manager;
pub mod synthetic;
pub mod types;

pub use correspondence_graph::{Correspondence, CorrespondenceGraph, FeatureMatch};
pub use database_cache::{DatabaseCache, DatabaseCacheBuilder};
pub use frame::{Frame, PosePrior};
pub use image::{Image, Point2D};
pub use point3d::{Point3D, Track, TrackElement};
pub use reconstruction::Reconstruction;
pub use reconstruction_manager::{ReconstructionIdx, ReconstructionManager, SharedReconstruction};
pub use synthetic::{synthesize_dataset, SyntheticDataset, SyntheticDatasetOptions};
pub use types::{CameraId, FrameId, ImageId, ImagePair, Point2DIdx, Point3DId, RigId};
