//! Incremental structure-from-motion.
//!
//! - [`visibility_pyramid`]: spatial coverage score of visible points
//! - [`observation_manager`]: per-image and per-pair observation bookkeeping
//! - [`incremental_triangulator`]: track creation, continuation, completion and merging
//! - [`incremental_mapper`]: initialization, registration, refinement and filtering
//! - [`incremental_pipeline`]: multi-model driver around the mapper

pub mod incremental_mapper;
pub mod incremental_pipeline;
pub mod incremental_triangulator;
pub mod observation_manager;
pub mod visibility_pyramid;

pub use incremental_mapper::{
    ImageSelectionMethod, IncrementalMapper, IncrementalMapperOptions, LocalBundleAdjustmentReport,
};
pub use incremental_pipeline::{IncrementalPipeline, IncrementalPipelineOptions};
pub use incremental_triangulator::{IncrementalTriangulator, IncrementalTriangulatorOptions};
pub use observation_manager::{ImagePairStat, ObservationManager};
pub use visibility_pyramid::{VisibilityPyramid, NUM_VISIBILITY_PYRAMID_LEVELS};
