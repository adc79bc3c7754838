//! Robust estimators and nonlinear refinement.
//!
//! - [`ransac`]: generic locally optimized RANSAC
//! - [`two_view_geometry`]: essential matrix and relative pose
//! - [`absolute_pose`]: generalized (multi-camera) absolute pose and refinement
//! - [`triangulation`]: robust multi-view point triangulation
//! - [`alignment`]: similarity alignment of reconstructions
//! - [`bundle_adjustment`]: sparse Levenberg–Marquardt bundle adjustment

pub mod absolute_pose;
pub mod alignment;
pub mod bundle_adjustment;
pub mod ransac;
pub mod triangulation;
pub mod two_view_geometry;

pub use absolute_pose::{
    estimate_generalized_absolute_pose, refine_generalized_absolute_pose, AbsolutePoseEstimate,
    AbsolutePoseEstimationOptions, AbsolutePoseRefinementOptions, PoseCorrespondence,
};
pub use alignment::{
    align_reconstruction_to_pose_priors, align_reconstructions_via_proj_centers, compute_image_alignment_error,
    estimate_sim3d_robust, ImageAlignmentError,
};
pub use bundle_adjustment::{
    effective_num_threads, BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions, BundleAdjustmentSummary,
    LossFunctionType, PosePriorBundleAdjustmentOptions, TerminationType,
};
pub use ransac::{ransac, Estimator, RansacOptions, RansacReport};
pub use triangulation::{estimate_triangulation, EstimateTriangulationOptions, TriangulationObservation};
pub use two_view_geometry::{estimate_relative_pose, TwoViewGeometry, TwoViewGeometryOptions};
