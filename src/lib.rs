//! Incremental structure-from-motion.
//!
//! Images are registered one at a time into a growing [`scene::Reconstruction`]:
//! an initial pair is chosen and triangulated, further frames are registered
//! from 2D-3D correspondences, tracks are triangulated and maintained, and
//! bundle adjustment keeps the model consistent.
//!
//! The entry points are [`sfm::IncrementalMapper`] for step-by-step control and
//! [`sfm::IncrementalPipeline`] for a complete run over a [`scene::DatabaseCache`].

pub mod error;
pub mod estimators;
pub mod geometry;
pub mod scene;
pub mod sensor;
pub mod sfm;

pub use error::{Result, SfmError};
