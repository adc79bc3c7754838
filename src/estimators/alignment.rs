//! Similarity alignment between reconstructions and against pose priors.
//!
//! - Robust Sim3 estimation from point pairs (Umeyama inside RANSAC)
//! - Alignment of a reconstruction's rig centers to prior positions
//! - Alignment of two reconstructions through shared projection centers
//! - Per-image rotation and projection-center errors after alignment

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use super::ransac::{ransac, Estimator, RansacOptions};
use crate::geometry::Sim3d;
use crate::scene::{FrameId, ImageId, PosePrior, Reconstruction};

/// Sim3 from point pairs `(src, dst)` with `dst ≈ S * src`.
pub struct Sim3Estimator;

impl Estimator for Sim3Estimator {
    type Sample = (Vector3<f64>, Vector3<f64>);
    type Model = Sim3d;

    fn min_num_samples(&self) -> usize {
        3
    }

    fn estimate(&self, samples: &[(Vector3<f64>, Vector3<f64>)]) -> Vec<Sim3d> {
        let (src, dst): (Vec<_>, Vec<_>) = samples.iter().copied().unzip();
        Sim3d::estimate(&src, &dst).into_iter().collect()
    }

    fn residuals(&self, samples: &[(Vector3<f64>, Vector3<f64>)], model: &Sim3d) -> Vec<f64> {
        samples
            .iter()
            .map(|(src, dst)| (model.transform_point(src) - dst).norm_squared())
            .collect()
    }
}

/// Robust `dst_from_src` similarity.
///
/// # Returns
/// * `None` for fewer than three pairs or when no model gathers enough inliers
pub fn estimate_sim3d_robust(
    src: &[Vector3<f64>],
    dst: &[Vector3<f64>],
    options: &RansacOptions,
) -> Option<(Sim3d, Vec<bool>)> {
    if src.len() != dst.len() {
        return None;
    }
    let samples: Vec<_> = src.iter().copied().zip(dst.iter().copied()).collect();
    let report = ransac(&Sim3Estimator, &samples, options)?;
    Some((report.model, report.inlier_mask))
}

/// Similarity mapping the reconstruction's world onto the pose priors' world,
/// estimated from registered rig centers and prior positions.
///
/// With `max_error <= 0` the plain least-squares fit over all pairs is used,
/// otherwise a robust fit with that maximum position error.
pub fn align_reconstruction_to_pose_priors(
    reconstruction: &Reconstruction,
    pose_priors: &HashMap<FrameId, PosePrior>,
    max_error: f64,
) -> Option<Sim3d> {
    let mut src = Vec::new();
    let mut dst = Vec::new();
    for frame_id in reconstruction.reg_frame_ids() {
        let Some(prior) = pose_priors.get(frame_id).filter(|p| p.is_valid()) else {
            continue;
        };
        let Some(rig_from_world) = reconstruction.frame(*frame_id).and_then(|f| f.rig_from_world) else {
            continue;
        };
        src.push(rig_from_world.center());
        dst.push(prior.position);
    }
    if src.len() < 3 {
        return None;
    }

    let prior_from_rec = if max_error > 0.0 {
        let options = RansacOptions {
            max_error,
            min_inlier_ratio: 0.0,
            ..Default::default()
        };
        estimate_sim3d_robust(&src, &dst, &options).map(|(sim3, _)| sim3)
    } else {
        Sim3d::estimate(&src, &dst)
    }?;
    debug!(
        "[Alignment] {} priors, scale={:.4}",
        src.len(),
        prior_from_rec.scale
    );
    Some(prior_from_rec)
}

/// `tgt_from_src` from projection centers of images registered in both.
pub fn align_reconstructions_via_proj_centers(
    src: &Reconstruction,
    tgt: &Reconstruction,
    max_proj_center_error: f64,
) -> Option<Sim3d> {
    let mut src_centers = Vec::new();
    let mut tgt_centers = Vec::new();
    for image_id in src.reg_image_ids() {
        if !tgt.is_image_registered(image_id) {
            continue;
        }
        if let (Some(s), Some(t)) = (src.projection_center(image_id), tgt.projection_center(image_id)) {
            src_centers.push(s);
            tgt_centers.push(t);
        }
    }
    let options = RansacOptions {
        max_error: max_proj_center_error,
        min_inlier_ratio: 0.0,
        ..Default::default()
    };
    estimate_sim3d_robust(&src_centers, &tgt_centers, &options).map(|(sim3, _)| sim3)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageAlignmentError {
    pub image_id: ImageId,
    pub rotation_error_deg: f64,
    pub proj_center_error: f64,
}

/// Errors of images registered in both reconstructions after mapping `src`
/// into `tgt` with `tgt_from_src`.
pub fn compute_image_alignment_error(
    src: &Reconstruction,
    tgt: &Reconstruction,
    tgt_from_src: &Sim3d,
) -> Vec<ImageAlignmentError> {
    src.reg_image_ids()
        .into_iter()
        .filter_map(|image_id| {
            let src_pose = src.cam_from_world(image_id)?;
            let tgt_pose = tgt.cam_from_world(image_id)?;
            let aligned = tgt_from_src.transform_pose(&src_pose);
            Some(ImageAlignmentError {
                image_id,
                rotation_error_deg: aligned.rotation_angle_to(&tgt_pose).to_degrees(),
                proj_center_error: (aligned.center() - tgt_pose.center()).norm(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{synthesize_dataset, SyntheticDatasetOptions};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn sample_sim3() -> Sim3d {
        Sim3d::new(
            0.7,
            UnitQuaternion::from_scaled_axis(Vector3::new(-0.3, 0.1, 0.6)),
            Vector3::new(2.0, 1.0, -1.0),
        )
    }

    #[test]
    fn test_robust_sim3_with_outliers() {
        let truth = sample_sim3();
        let src: Vec<_> = (0..30)
            .map(|i| {
                let t = i as f64;
                Vector3::new(t.sin() * 3.0, (0.7 * t).cos() * 2.0, 0.1 * t)
            })
            .collect();
        let mut dst: Vec<_> = src.iter().map(|p| truth.transform_point(p)).collect();
        dst[3] += Vector3::new(5.0, 0.0, 0.0);
        dst[17] += Vector3::new(0.0, -4.0, 2.0);

        let options = RansacOptions {
            max_error: 0.01,
            random_seed: Some(2),
            ..Default::default()
        };
        let (sim3, mask) = estimate_sim3d_robust(&src, &dst, &options).unwrap();
        assert_relative_eq!(sim3.scale, truth.scale, epsilon = 1e-9);
        assert_relative_eq!(sim3.translation, truth.translation, epsilon = 1e-9);
        assert!(!mask[3] && !mask[17]);
        assert_eq!(mask.iter().filter(|m| **m).count(), 28);
    }

    #[test]
    fn test_alignment_errors_vanish_for_transformed_copy() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default()).unwrap();
        let src = dataset.ground_truth.clone();
        let mut tgt = dataset.ground_truth;
        let truth = sample_sim3();
        tgt.transform(&truth);

        let tgt_from_src = align_reconstructions_via_proj_centers(&src, &tgt, 0.01).unwrap();
        assert_relative_eq!(tgt_from_src.scale, truth.scale, epsilon = 1e-6);

        let errors = compute_image_alignment_error(&src, &tgt, &tgt_from_src);
        assert_eq!(errors.len(), src.num_reg_images());
        for error in errors {
            assert!(error.rotation_error_deg < 1e-4);
            assert!(error.proj_center_error < 1e-6);
        }
    }

    #[test]
    fn test_align_to_pose_priors() {
        let options = SyntheticDatasetOptions {
            prior_position_stddev: Some(0.0),
            ..Default::default()
        };
        let dataset = synthesize_dataset(&options).unwrap();
        let mut reconstruction = dataset.ground_truth;
        let moved = sample_sim3();
        reconstruction.transform(&moved);

        let prior_from_rec =
            align_reconstruction_to_pose_priors(&reconstruction, dataset.database_cache.pose_priors(), 0.0).unwrap();
        let back = prior_from_rec.compose(&moved);
        assert_relative_eq!(back.scale, 1.0, epsilon = 1e-6);
        assert_relative_eq!(back.translation.norm(), 0.0, epsilon = 1e-6);
    }
}
