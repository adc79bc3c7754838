//! DatabaseCache - read-only index of the input data.
//!
//! Holds cameras, rigs, frames, images (keypoints only), optional pose priors
//! and the correspondence graph. It is built once with
//! [`DatabaseCacheBuilder`] and then shared immutably for the lifetime of the
//! mapper.

use std::collections::HashMap;

use tracing::debug;

use super::correspondence_graph::{CorrespondenceGraph, FeatureMatch};
use super::frame::{Frame, PosePrior};
use super::image::Image;
use super::types::{CameraId, FrameId, ImageId, RigId};
use crate::error::{Result, SfmError};
use crate::sensor::{Camera, Rig, SensorId};

#[derive(Debug, Clone, Default)]
pub struct DatabaseCache {
    cameras: HashMap<CameraId, Camera>,
    rigs: HashMap<RigId, Rig>,
    frames: HashMap<FrameId, Frame>,
    images: HashMap<ImageId, Image>,
    pose_priors: HashMap<FrameId, PosePrior>,
    correspondence_graph: CorrespondenceGraph,
}

impl DatabaseCache {
    pub fn builder() -> DatabaseCacheBuilder {
        DatabaseCacheBuilder::default()
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&Camera> {
        self.cameras.get(&camera_id)
    }

    pub fn rig(&self, rig_id: RigId) -> Option<&Rig> {
        self.rigs.get(&rig_id)
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<&Frame> {
        self.frames.get(&frame_id)
    }

    pub fn image(&self, image_id: ImageId) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub fn exists_image(&self, image_id: ImageId) -> bool {
        self.images.contains_key(&image_id)
    }

    pub fn cameras(&self) -> &HashMap<CameraId, Camera> {
        &self.cameras
    }

    pub fn rigs(&self) -> &HashMap<RigId, Rig> {
        &self.rigs
    }

    pub fn frames(&self) -> &HashMap<FrameId, Frame> {
        &self.frames
    }

    pub fn images(&self) -> &HashMap<ImageId, Image> {
        &self.images
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn pose_priors(&self) -> &HashMap<FrameId, PosePrior> {
        &self.pose_priors
    }

    pub fn pose_prior(&self, frame_id: FrameId) -> Option<&PosePrior> {
        self.pose_priors.get(&frame_id)
    }

    pub fn correspondence_graph(&self) -> &CorrespondenceGraph {
        &self.correspondence_graph
    }

    pub fn find_image_with_name(&self, name: &str) -> Option<&Image> {
        self.images.values().find(|image| image.name == name)
    }
}

/// Incremental construction of a [`DatabaseCache`] with id validation.
#[derive(Debug, Default)]
pub struct DatabaseCacheBuilder {
    cameras: HashMap<CameraId, Camera>,
    rigs: HashMap<RigId, Rig>,
    frames: HashMap<FrameId, Frame>,
    images: HashMap<ImageId, Image>,
    pose_priors: HashMap<FrameId, PosePrior>,
    matches: Vec<(ImageId, ImageId, Vec<FeatureMatch>)>,
    min_num_matches: usize,
}

impl DatabaseCacheBuilder {
    pub fn add_camera(mut self, camera: Camera) -> Self {
        self.cameras.insert(camera.camera_id, camera);
        self
    }

    pub fn add_rig(mut self, rig: Rig) -> Self {
        self.rigs.insert(rig.rig_id, rig);
        self
    }

    pub fn add_frame(mut self, frame: Frame) -> Self {
        self.frames.insert(frame.frame_id, frame);
        self
    }

    pub fn add_image(mut self, image: Image) -> Self {
        self.images.insert(image.image_id, image);
        self
    }

    pub fn add_pose_prior(mut self, frame_id: FrameId, prior: PosePrior) -> Self {
        self.pose_priors.insert(frame_id, prior);
        self
    }

    /// Add verified matches between two images.
    pub fn add_matches(mut self, image_id1: ImageId, image_id2: ImageId, matches: Vec<FeatureMatch>) -> Self {
        self.matches.push((image_id1, image_id2, matches));
        self
    }

    /// Pairs with fewer matches are not added to the correspondence graph.
    pub fn min_num_matches(mut self, min_num_matches: usize) -> Self {
        self.min_num_matches = min_num_matches;
        self
    }

    /// Validate all cross references and build the correspondence graph.
    ///
    /// # Errors
    /// * `UnknownCamera`/`UnknownFrame`/`UnknownRig` for dangling ids
    /// * `UnknownSensor` if an image's camera is not a sensor of its rig
    pub fn build(mut self) -> Result<DatabaseCache> {
        for image in self.images.values_mut() {
            if !self.cameras.contains_key(&image.camera_id) {
                return Err(SfmError::UnknownCamera(image.camera_id));
            }
            let frame = self
                .frames
                .get_mut(&image.frame_id)
                .ok_or(SfmError::UnknownFrame(image.frame_id))?;
            let rig = self
                .rigs
                .get(&frame.rig_id)
                .ok_or(SfmError::UnknownRig(frame.rig_id))?;
            let sensor_id = SensorId::camera(image.camera_id);
            if !rig.has_sensor(sensor_id) {
                return Err(SfmError::UnknownSensor {
                    rig: rig.rig_id,
                    sensor: sensor_id,
                });
            }
            frame.add_image(image.image_id);
            image.reset_point3d_links();
        }
        for frame in self.frames.values_mut() {
            frame.rig_from_world = None;
            if let Some(missing) = frame
                .image_ids
                .iter()
                .find(|image_id| !self.images.contains_key(image_id))
            {
                return Err(SfmError::UnknownImage(*missing));
            }
        }

        let mut correspondence_graph = CorrespondenceGraph::new();
        for image in self.images.values() {
            correspondence_graph.add_image(image.image_id, image.num_points2d());
        }
        let mut num_skipped_pairs = 0;
        for (image_id1, image_id2, matches) in &self.matches {
            if matches.len() < self.min_num_matches {
                num_skipped_pairs += 1;
                continue;
            }
            correspondence_graph.add_correspondences(*image_id1, *image_id2, matches)?;
        }
        correspondence_graph.finalize();

        debug!(
            "[DatabaseCache] {} cameras, {} frames, {} images, {} pairs ({} below {} matches skipped)",
            self.cameras.len(),
            self.frames.len(),
            self.images.len(),
            correspondence_graph.num_image_pairs(),
            num_skipped_pairs,
            self.min_num_matches
        );

        Ok(DatabaseCache {
            cameras: self.cameras,
            rigs: self.rigs,
            frames: self.frames,
            images: self.images,
            pose_priors: self.pose_priors,
            correspondence_graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::CameraModelId;
    use nalgebra::Vector2;

    fn camera(id: u32) -> Camera {
        Camera::from_focal_length(CameraId::new(id), CameraModelId::SimplePinhole, 500.0, 640, 480)
    }

    fn keypoints() -> Vec<Vector2<f64>> {
        (0..10).map(|i| Vector2::new(i as f64, i as f64)).collect()
    }

    #[test]
    fn test_build_links_frames_and_graph() {
        let cache = DatabaseCache::builder()
            .add_camera(camera(1))
            .add_rig(Rig::with_camera(RigId::new(1), CameraId::new(1)))
            .add_frame(Frame::new(FrameId::new(1), RigId::new(1)))
            .add_frame(Frame::new(FrameId::new(2), RigId::new(1)))
            .add_image(Image::new(ImageId::new(1), "a", CameraId::new(1), FrameId::new(1), &keypoints()))
            .add_image(Image::new(ImageId::new(2), "b", CameraId::new(1), FrameId::new(2), &keypoints()))
            .add_matches(
                ImageId::new(1),
                ImageId::new(2),
                (0..5).map(|i| FeatureMatch::new(i, i)).collect(),
            )
            .build()
            .unwrap();

        assert_eq!(cache.num_images(), 2);
        assert_eq!(cache.frame(FrameId::new(1)).unwrap().image_ids, vec![ImageId::new(1)]);
        assert_eq!(
            cache
                .correspondence_graph()
                .num_correspondences_between_images(ImageId::new(1), ImageId::new(2)),
            5
        );
        assert_eq!(cache.find_image_with_name("b").unwrap().image_id, ImageId::new(2));
    }

    #[test]
    fn test_min_num_matches_filters_pairs() {
        let cache = DatabaseCache::builder()
            .add_camera(camera(1))
            .add_rig(Rig::with_camera(RigId::new(1), CameraId::new(1)))
            .add_frame(Frame::new(FrameId::new(1), RigId::new(1)))
            .add_frame(Frame::new(FrameId::new(2), RigId::new(1)))
            .add_image(Image::new(ImageId::new(1), "a", CameraId::new(1), FrameId::new(1), &keypoints()))
            .add_image(Image::new(ImageId::new(2), "b", CameraId::new(1), FrameId::new(2), &keypoints()))
            .add_matches(ImageId::new(1), ImageId::new(2), vec![FeatureMatch::new(0, 0)])
            .min_num_matches(2)
            .build()
            .unwrap();
        assert_eq!(cache.correspondence_graph().num_image_pairs(), 0);
    }

    #[test]
    fn test_dangling_ids_rejected() {
        let result = DatabaseCache::builder()
            .add_camera(camera(1))
            .add_rig(Rig::with_camera(RigId::new(1), CameraId::new(1)))
            .add_image(Image::new(ImageId::new(1), "a", CameraId::new(1), FrameId::new(7), &keypoints()))
            .build();
        assert_eq!(result.unwrap_err(), SfmError::UnknownFrame(FrameId::new(7)));

        let result = DatabaseCache::builder()
            .add_camera(camera(2))
            .add_rig(Rig::with_camera(RigId::new(1), CameraId::new(1)))
            .add_frame(Frame::new(FrameId::new(1), RigId::new(1)))
            .add_image(Image::new(ImageId::new(1), "a", CameraId::new(2), FrameId::new(1), &keypoints()))
            .build();
        assert!(matches!(result, Err(SfmError::UnknownSensor { .. })));
    }
}
