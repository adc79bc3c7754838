//! Deterministic synthetic scenes.
//!
//! Rigs are placed on a horizontal ring around a cube of random 3D points and
//! look at the origin. Every visible point becomes a keypoint, and every point
//! seen by two images in different frames becomes a match. Optionally the
//! keypoints are perturbed with Gaussian noise and the frames get noisy
//! position priors.
//!
//! The generator returns both the [`DatabaseCache`] to reconstruct from and the
//! ground-truth [`Reconstruction`] the cache was rendered from.

use std::collections::HashMap;

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::correspondence_graph::FeatureMatch;
use super::database_cache::DatabaseCache;
use super::frame::{Frame, PosePrior};
use super::image::Image;
use super::point3d::{Track, TrackElement};
use super::reconstruction::Reconstruction;
use super::types::{CameraId, FrameId, ImageId, RigId};
use crate::error::{check_option, Result, SfmError};
use crate::geometry::Rigid3d;
use crate::sensor::{Camera, CameraModelId, Rig, SensorId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticDatasetOptions {
    pub num_rigs: usize,
    pub num_cameras_per_rig: usize,
    pub num_frames_per_rig: usize,
    pub num_points3d: usize,

    pub camera_model: CameraModelId,
    pub camera_width: usize,
    pub camera_height: usize,
    pub focal_length: f64,
    pub has_prior_focal_length: bool,

    /// Half extent of the point cube centered at the origin.
    pub scene_half_extent: f64,
    /// Distance of the rig centers from the origin.
    pub ring_radius: f64,
    /// Angular spacing of consecutive frames on the ring in degrees.
    pub ring_step_deg: f64,

    /// Standard deviation of the keypoint noise in pixels.
    pub point2d_stddev: f64,
    /// Standard deviation of the position priors; `None` disables priors.
    pub prior_position_stddev: Option<f64>,

    pub random_seed: u64,
}

impl Default for SyntheticDatasetOptions {
    fn default() -> Self {
        Self {
            num_rigs: 1,
            num_cameras_per_rig: 1,
            num_frames_per_rig: 5,
            num_points3d: 200,
            camera_model: CameraModelId::SimplePinhole,
            camera_width: 1024,
            camera_height: 768,
            focal_length: 700.0,
            has_prior_focal_length: true,
            scene_half_extent: 2.0,
            ring_radius: 8.0,
            ring_step_deg: 30.0,
            point2d_stddev: 0.0,
            prior_position_stddev: None,
            random_seed: 0,
        }
    }
}

impl SyntheticDatasetOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.num_rigs > 0, "num_rigs must be positive")?;
        check_option(self.num_cameras_per_rig > 0, "num_cameras_per_rig must be positive")?;
        check_option(self.focal_length > 0.0, "focal_length must be positive")?;
        check_option(
            self.ring_radius > self.scene_half_extent * 3f64.sqrt(),
            "ring_radius must keep the cameras outside the point cloud",
        )?;
        check_option(self.point2d_stddev >= 0.0, "point2d_stddev must be non-negative")?;
        check_option(
            self.prior_position_stddev.map_or(true, |s| s >= 0.0),
            "prior_position_stddev must be non-negative",
        )
    }
}

/// Output of [`synthesize_dataset`].
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub database_cache: DatabaseCache,
    pub ground_truth: Reconstruction,
}

/// Camera pose at `center` looking at the world origin.
fn look_at_origin(center: &Vector3<f64>) -> Rigid3d {
    let z = (-center).normalize();
    let x = Vector3::y().cross(&z).normalize();
    let y = z.cross(&x);
    let world_from_cam = Matrix3::from_columns(&[x, y, z]);
    let rotation = world_from_cam.transpose();
    Rigid3d::from_rotation_matrix(&rotation, -(rotation * center))
}

/// Extrinsics of the `k`-th camera of a rig, turned sideways and shifted along
/// the rig x axis.
fn synthetic_sensor_from_rig(k: usize) -> Rigid3d {
    let angle = (k as f64 * 8.0).to_radians();
    Rigid3d::new(
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle),
        Vector3::new(-0.3 * k as f64, 0.05 * k as f64, 0.0),
    )
}

/// Render a synthetic scene.
///
/// Ids start at 1 for cameras, rigs, frames and images.
pub fn synthesize_dataset(options: &SyntheticDatasetOptions) -> Result<SyntheticDataset> {
    options.check()?;
    let mut rng = StdRng::seed_from_u64(options.random_seed);

    let mut ground_truth = Reconstruction::new();
    let mut builder = DatabaseCache::builder();

    // Rigs and cameras
    let mut rig_cameras: Vec<(RigId, Vec<CameraId>)> = Vec::new();
    let mut next_camera_id = 1;
    for r in 0..options.num_rigs {
        let rig_id = RigId::new(r as u32 + 1);
        let mut rig = Rig::new(rig_id);
        let mut camera_ids = Vec::new();
        for k in 0..options.num_cameras_per_rig {
            let camera_id = CameraId::new(next_camera_id);
            next_camera_id += 1;
            let mut camera = Camera::from_focal_length(
                camera_id,
                options.camera_model,
                options.focal_length,
                options.camera_width,
                options.camera_height,
            );
            camera.has_prior_focal_length = options.has_prior_focal_length;
            if k == 0 {
                rig.add_ref_sensor(SensorId::camera(camera_id))?;
            } else {
                rig.add_sensor(SensorId::camera(camera_id), Some(synthetic_sensor_from_rig(k)))?;
            }
            ground_truth.add_camera(camera.clone());
            builder = builder.add_camera(camera);
            camera_ids.push(camera_id);
        }
        ground_truth.add_rig(rig.clone());
        builder = builder.add_rig(rig);
        rig_cameras.push((rig_id, camera_ids));
    }

    // Points
    let half = options.scene_half_extent;
    let points3d: Vec<Vector3<f64>> = (0..options.num_points3d)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-half..=half),
                rng.gen_range(-half..=half),
                rng.gen_range(-half..=half),
            )
        })
        .collect();

    let noise = Normal::new(0.0, options.point2d_stddev.max(f64::MIN_POSITIVE))
        .map_err(|e| SfmError::InvalidOptions(e.to_string()))?;
    let prior_noise = options
        .prior_position_stddev
        .map(|s| Normal::new(0.0, s.max(f64::MIN_POSITIVE)))
        .transpose()
        .map_err(|e| SfmError::InvalidOptions(e.to_string()))?;

    // Frames and images. `observations[image]` maps point index to keypoint index.
    let mut image_frames: Vec<(ImageId, FrameId)> = Vec::new();
    let mut gt_images: Vec<Image> = Vec::new();
    let mut observations: HashMap<ImageId, HashMap<usize, usize>> = HashMap::new();
    let mut next_image_id = 1;
    let mut frame_idx = 0usize;
    for (rig_id, camera_ids) in &rig_cameras {
        for _ in 0..options.num_frames_per_rig {
            let frame_id = FrameId::new(frame_idx as u32 + 1);
            let angle = (frame_idx as f64 * options.ring_step_deg).to_radians();
            let height = 0.4 * ((frame_idx % 3) as f64 - 1.0);
            let center = Vector3::new(
                options.ring_radius * angle.sin(),
                height,
                -options.ring_radius * angle.cos(),
            );
            let rig_from_world = look_at_origin(&center);
            frame_idx += 1;

            let mut frame = Frame::new(frame_id, *rig_id);
            for (k, camera_id) in camera_ids.iter().enumerate() {
                let image_id = ImageId::new(next_image_id);
                next_image_id += 1;

                let sensor_from_rig = if k == 0 {
                    Rigid3d::identity()
                } else {
                    synthetic_sensor_from_rig(k)
                };
                let cam_from_world = sensor_from_rig * rig_from_world;
                let camera = ground_truth
                    .camera(*camera_id)
                    .ok_or(SfmError::UnknownCamera(*camera_id))?;

                let mut keypoints: Vec<Vector2<f64>> = Vec::new();
                let mut point_to_keypoint = HashMap::new();
                for (point_idx, xyz) in points3d.iter().enumerate() {
                    let Some(xy) = camera.img_from_cam(&cam_from_world.transform_point(xyz)) else {
                        continue;
                    };
                    let inside = xy.x >= 0.0
                        && xy.y >= 0.0
                        && xy.x < options.camera_width as f64
                        && xy.y < options.camera_height as f64;
                    if !inside {
                        continue;
                    }
                    let noisy = if options.point2d_stddev > 0.0 {
                        xy + Vector2::new(noise.sample(&mut rng), noise.sample(&mut rng))
                    } else {
                        xy
                    };
                    point_to_keypoint.insert(point_idx, keypoints.len());
                    keypoints.push(noisy);
                }

                let image = Image::new(image_id, format!("image{:04}", image_id.0), *camera_id, frame_id, &keypoints);
                frame.add_image(image_id);
                builder = builder.add_image(image.clone());
                image_frames.push((image_id, frame_id));
                observations.insert(image_id, point_to_keypoint);
                gt_images.push(image);
            }

            if let Some(prior_noise) = &prior_noise {
                let rig_center = rig_from_world.center();
                let sigma = options.prior_position_stddev.unwrap_or(0.0);
                let position = if sigma > 0.0 {
                    rig_center
                        + Vector3::new(
                            prior_noise.sample(&mut rng),
                            prior_noise.sample(&mut rng),
                            prior_noise.sample(&mut rng),
                        )
                } else {
                    rig_center
                };
                builder = builder.add_pose_prior(frame_id, PosePrior::isotropic(position, sigma.max(1e-3)));
            }

            builder = builder.add_frame(frame.clone());
            let mut posed = frame;
            posed.rig_from_world = Some(rig_from_world);
            ground_truth.add_frame(posed)?;
        }
    }
    for image in gt_images {
        ground_truth.add_image(image)?;
    }

    // Matches between images of different frames
    for (i, (image_id1, frame_id1)) in image_frames.iter().enumerate() {
        for (image_id2, frame_id2) in image_frames.iter().skip(i + 1) {
            if frame_id1 == frame_id2 {
                continue;
            }
            let (Some(obs1), Some(obs2)) = (observations.get(image_id1), observations.get(image_id2)) else {
                continue;
            };
            let mut matches: Vec<FeatureMatch> = obs1
                .iter()
                .filter_map(|(point_idx, idx1)| obs2.get(point_idx).map(|idx2| FeatureMatch::new(*idx1, *idx2)))
                .collect();
            if matches.is_empty() {
                continue;
            }
            matches.sort_by_key(|m| m.point2d_idx1);
            builder = builder.add_matches(*image_id1, *image_id2, matches);
        }
    }

    // Ground-truth tracks
    for (point_idx, xyz) in points3d.iter().enumerate() {
        let mut elements: Vec<TrackElement> = image_frames
            .iter()
            .filter_map(|(image_id, _)| {
                observations
                    .get(image_id)
                    .and_then(|obs| obs.get(&point_idx))
                    .map(|idx| TrackElement::new(*image_id, *idx))
            })
            .collect();
        if elements.len() < 2 {
            continue;
        }
        elements.sort_by_key(|el| el.image_id);
        ground_truth.add_point3d(*xyz, Track::from_elements(elements))?;
    }

    Ok(SyntheticDataset {
        database_cache: builder.build()?,
        ground_truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_truth_reprojects_exactly() {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default()).unwrap();
        let gt = &dataset.ground_truth;
        assert_eq!(gt.num_reg_frames(), 5);
        assert!(gt.num_points3d() > 150);
        assert!(gt.compute_mean_reprojection_error() < 1e-9);
        assert_eq!(dataset.database_cache.num_images(), 5);
        assert_eq!(dataset.database_cache.correspondence_graph().num_image_pairs(), 10);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let options = SyntheticDatasetOptions {
            point2d_stddev: 0.5,
            ..Default::default()
        };
        let a = synthesize_dataset(&options).unwrap();
        let b = synthesize_dataset(&options).unwrap();
        assert_eq!(a.ground_truth, b.ground_truth);
    }

    #[test]
    fn test_multi_camera_rigs_and_priors() {
        let options = SyntheticDatasetOptions {
            num_rigs: 2,
            num_cameras_per_rig: 2,
            num_frames_per_rig: 3,
            prior_position_stddev: Some(0.0),
            ..Default::default()
        };
        let dataset = synthesize_dataset(&options).unwrap();
        let cache = &dataset.database_cache;
        assert_eq!(cache.frames().len(), 6);
        assert_eq!(cache.num_images(), 12);
        assert_eq!(cache.pose_priors().len(), 6);

        let frame = dataset.ground_truth.frame(FrameId::new(2)).unwrap();
        let prior = cache.pose_prior(FrameId::new(2)).unwrap();
        let center = frame.rig_from_world.unwrap().center();
        assert!((prior.position - center).norm() < 1e-12);
        assert!(dataset.ground_truth.compute_mean_reprojection_error() < 1e-9);
    }
}
