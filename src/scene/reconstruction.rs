//! Reconstruction - the mutable model being built.
//!
//! The Reconstruction holds the SfM model:
//! - Cameras and rigs (intrinsics/extrinsics, refined in place)
//! - Frames with their `rig_from_world` poses and registration state
//! - Images with keypoints linked to 3D points
//! - Points3D with their observation tracks
//!
//! It keeps the bipartite image ↔ point graph consistent: every track element
//! has a matching `Point2D::point3d_id` link and vice versa.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;
use tracing::debug;

use super::database_cache::DatabaseCache;
use super::frame::Frame;
use super::image::Image;
use super::point3d::{Point3D, Track, TrackElement};
use super::types::{CameraId, FrameId, ImageId, Point2DIdx, Point3DId, RigId};
use crate::error::{Result, SfmError};
use crate::geometry::{Rigid3d, Sim3d};
use crate::sensor::{Camera, Rig, SensorId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    cameras: HashMap<CameraId, Camera>,
    rigs: HashMap<RigId, Rig>,
    frames: HashMap<FrameId, Frame>,
    images: HashMap<ImageId, Image>,
    points3d: HashMap<Point3DId, Point3D>,

    /// Registered frames, ordered by id.
    reg_frame_ids: BTreeSet<FrameId>,

    /// Counter for generating unique Point3D IDs.
    next_point3d_id: u64,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Pull cameras, rigs, frames and images from the cache that are not yet
    /// part of this reconstruction. Existing entries keep their state.
    pub fn load(&mut self, cache: &DatabaseCache) {
        for (camera_id, camera) in cache.cameras() {
            self.cameras
                .entry(*camera_id)
                .or_insert_with(|| camera.clone());
        }
        for (rig_id, rig) in cache.rigs() {
            self.rigs.entry(*rig_id).or_insert_with(|| rig.clone());
        }
        for (frame_id, frame) in cache.frames() {
            self.frames.entry(*frame_id).or_insert_with(|| frame.clone());
        }
        for (image_id, image) in cache.images() {
            self.images.entry(*image_id).or_insert_with(|| image.clone());
        }
        debug!(
            "[Reconstruction] Loaded {} frames, {} images ({} registered frames)",
            self.frames.len(),
            self.images.len(),
            self.reg_frame_ids.len()
        );
    }

    /// Drop unregistered frames with their images, and cameras/rigs no
    /// longer referenced.
    pub fn tear_down(&mut self) {
        let unregistered: Vec<FrameId> = self
            .frames
            .iter()
            .filter(|(_, frame)| !frame.has_pose())
            .map(|(frame_id, _)| *frame_id)
            .collect();
        for frame_id in unregistered {
            if let Some(frame) = self.frames.remove(&frame_id) {
                for image_id in frame.image_ids {
                    self.images.remove(&image_id);
                }
            }
        }

        let used_cameras: BTreeSet<CameraId> = self.images.values().map(|i| i.camera_id).collect();
        self.cameras.retain(|camera_id, _| used_cameras.contains(camera_id));
        let used_rigs: BTreeSet<RigId> = self.frames.values().map(|f| f.rig_id).collect();
        self.rigs.retain(|rig_id, _| used_rigs.contains(rig_id));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity Access
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_camera(&mut self, camera: Camera) {
        self.cameras.insert(camera.camera_id, camera);
    }

    pub fn add_rig(&mut self, rig: Rig) {
        self.rigs.insert(rig.rig_id, rig);
    }

    /// Add a frame. A frame that already carries a pose is registered.
    pub fn add_frame(&mut self, frame: Frame) -> Result<()> {
        if !self.rigs.contains_key(&frame.rig_id) {
            return Err(SfmError::UnknownRig(frame.rig_id));
        }
        if frame.has_pose() {
            self.reg_frame_ids.insert(frame.frame_id);
        }
        self.frames.insert(frame.frame_id, frame);
        Ok(())
    }

    pub fn add_image(&mut self, image: Image) -> Result<()> {
        if !self.cameras.contains_key(&image.camera_id) {
            return Err(SfmError::UnknownCamera(image.camera_id));
        }
        let frame = self
            .frames
            .get_mut(&image.frame_id)
            .ok_or(SfmError::UnknownFrame(image.frame_id))?;
        frame.add_image(image.image_id);
        self.images.insert(image.image_id, image);
        Ok(())
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&Camera> {
        self.cameras.get(&camera_id)
    }

    pub fn camera_mut(&mut self, camera_id: CameraId) -> Option<&mut Camera> {
        self.cameras.get_mut(&camera_id)
    }

    pub fn rig(&self, rig_id: RigId) -> Option<&Rig> {
        self.rigs.get(&rig_id)
    }

    pub fn rig_mut(&mut self, rig_id: RigId) -> Option<&mut Rig> {
        self.rigs.get_mut(&rig_id)
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<&Frame> {
        self.frames.get(&frame_id)
    }

    pub fn frame_mut(&mut self, frame_id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(&frame_id)
    }

    pub fn image(&self, image_id: ImageId) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub fn point3d(&self, point3d_id: Point3DId) -> Option<&Point3D> {
        self.points3d.get(&point3d_id)
    }

    pub fn point3d_mut(&mut self, point3d_id: Point3DId) -> Option<&mut Point3D> {
        self.points3d.get_mut(&point3d_id)
    }

    pub fn exists_point3d(&self, point3d_id: Point3DId) -> bool {
        self.points3d.contains_key(&point3d_id)
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

    pub fn points3d(&self) -> &HashMap<Point3DId, Point3D> {
        &self.points3d
    }

    pub fn point3d_ids(&self) -> Vec<Point3DId> {
        let mut ids: Vec<Point3DId> = self.points3d.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_points3d(&self) -> usize {
        self.points3d.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration & Poses
    // ─────────────────────────────────────────────────────────────────────────

    pub fn reg_frame_ids(&self) -> &BTreeSet<FrameId> {
        &self.reg_frame_ids
    }

    pub fn num_reg_frames(&self) -> usize {
        self.reg_frame_ids.len()
    }

    /// Images of all registered frames, ordered by id.
    pub fn reg_image_ids(&self) -> Vec<ImageId> {
        let mut ids: Vec<ImageId> = self
            .reg_frame_ids
            .iter()
            .filter_map(|frame_id| self.frames.get(frame_id))
            .flat_map(|frame| frame.image_ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn num_reg_images(&self) -> usize {
        self.reg_frame_ids
            .iter()
            .filter_map(|frame_id| self.frames.get(frame_id))
            .map(|frame| frame.image_ids.len())
            .sum()
    }

    pub fn is_frame_registered(&self, frame_id: FrameId) -> bool {
        self.reg_frame_ids.contains(&frame_id)
    }

    pub fn is_image_registered(&self, image_id: ImageId) -> bool {
        self.images
            .get(&image_id)
            .is_some_and(|image| self.reg_frame_ids.contains(&image.frame_id))
    }

    /// Set the pose of a frame and mark it registered.
    ///
    /// # Errors
    /// * `UnknownFrame` if the frame does not exist
    /// * `FrameAlreadyRegistered` if it is registered already
    pub fn register_frame(&mut self, frame_id: FrameId, rig_from_world: Rigid3d) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&frame_id)
            .ok_or(SfmError::UnknownFrame(frame_id))?;
        if self.reg_frame_ids.contains(&frame_id) {
            return Err(SfmError::FrameAlreadyRegistered(frame_id));
        }
        frame.rig_from_world = Some(rig_from_world);
        self.reg_frame_ids.insert(frame_id);
        Ok(())
    }

    /// Remove the pose of a frame, dropping any remaining observations of its
    /// images.
    pub fn deregister_frame(&mut self, frame_id: FrameId) -> Result<()> {
        let image_ids = self
            .frames
            .get(&frame_id)
            .ok_or(SfmError::UnknownFrame(frame_id))?
            .image_ids
            .clone();
        if !self.reg_frame_ids.contains(&frame_id) {
            return Err(SfmError::FrameNotRegistered(frame_id));
        }

        for image_id in image_ids {
            let linked: Vec<Point2DIdx> = self
                .images
                .get(&image_id)
                .map(|image| {
                    image
                        .points2d
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.has_point3d())
                        .map(|(idx, _)| idx)
                        .collect()
                })
                .unwrap_or_default();
            for point2d_idx in linked {
                self.delete_observation(image_id, point2d_idx)?;
            }
        }

        if let Some(frame) = self.frames.get_mut(&frame_id) {
            frame.rig_from_world = None;
        }
        self.reg_frame_ids.remove(&frame_id);
        Ok(())
    }

    /// Transform from the rig frame of the image's frame into its camera.
    pub fn cam_from_rig(&self, image_id: ImageId) -> Option<Rigid3d> {
        let image = self.images.get(&image_id)?;
        let frame = self.frames.get(&image.frame_id)?;
        self.rigs
            .get(&frame.rig_id)?
            .sensor_from_rig(SensorId::camera(image.camera_id))
    }

    /// Pose of a registered image's camera.
    pub fn cam_from_world(&self, image_id: ImageId) -> Option<Rigid3d> {
        let image = self.images.get(&image_id)?;
        let rig_from_world = self.frames.get(&image.frame_id)?.rig_from_world?;
        Some(self.cam_from_rig(image_id)? * rig_from_world)
    }

    /// Camera center of a registered image in world coordinates.
    pub fn projection_center(&self, image_id: ImageId) -> Option<Vector3<f64>> {
        self.cam_from_world(image_id).map(|pose| pose.center())
    }

    /// Image together with its camera.
    pub fn image_with_camera(&self, image_id: ImageId) -> Option<(&Image, &Camera)> {
        let image = self.images.get(&image_id)?;
        let camera = self.cameras.get(&image.camera_id)?;
        Some((image, camera))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Point3D & Observation Operations
    // ─────────────────────────────────────────────────────────────────────────

    fn check_free_point2d(&self, el: &TrackElement) -> Result<()> {
        let image = self
            .images
            .get(&el.image_id)
            .ok_or(SfmError::UnknownImage(el.image_id))?;
        let point2d = image.point2d(el.point2d_idx).ok_or(SfmError::UnknownPoint2D {
            image_id: el.image_id,
            point2d_idx: el.point2d_idx,
        })?;
        if point2d.has_point3d() {
            return Err(SfmError::Point2DAlreadyTriangulated {
                image_id: el.image_id,
                point2d_idx: el.point2d_idx,
            });
        }
        Ok(())
    }

    fn set_point2d_link(&mut self, el: &TrackElement, point3d_id: Option<Point3DId>) {
        if let Some(point2d) = self
            .images
            .get_mut(&el.image_id)
            .and_then(|image| image.points2d.get_mut(el.point2d_idx))
        {
            point2d.point3d_id = point3d_id;
        }
    }

    /// Create a new 3D point and link all track elements to it.
    ///
    /// Validates the whole track before mutating anything.
    pub fn add_point3d(&mut self, xyz: Vector3<f64>, track: Track) -> Result<Point3DId> {
        for el in track.elements() {
            self.check_free_point2d(el)?;
        }

        let point3d_id = Point3DId::new(self.next_point3d_id);
        self.next_point3d_id += 1;
        for el in track.elements() {
            self.set_point2d_link(el, Some(point3d_id));
        }
        self.points3d
            .insert(point3d_id, Point3D::new(point3d_id, xyz, track));
        Ok(point3d_id)
    }

    /// Add one observation to an existing 3D point.
    pub fn add_observation(&mut self, point3d_id: Point3DId, el: TrackElement) -> Result<()> {
        if !self.points3d.contains_key(&point3d_id) {
            return Err(SfmError::UnknownPoint3D(point3d_id));
        }
        self.check_free_point2d(&el)?;
        self.set_point2d_link(&el, Some(point3d_id));
        if let Some(point3d) = self.points3d.get_mut(&point3d_id) {
            point3d.track.add_element(el.image_id, el.point2d_idx);
        }
        Ok(())
    }

    /// Delete a 3D point and unlink all its observations.
    pub fn delete_point3d(&mut self, point3d_id: Point3DId) -> Result<()> {
        let point3d = self
            .points3d
            .remove(&point3d_id)
            .ok_or(SfmError::UnknownPoint3D(point3d_id))?;
        for el in point3d.track.elements() {
            self.set_point2d_link(el, None);
        }
        Ok(())
    }

    /// Remove one observation. Points left with fewer than two observations
    /// are deleted.
    pub fn delete_observation(&mut self, image_id: ImageId, point2d_idx: Point2DIdx) -> Result<()> {
        let point3d_id = self
            .images
            .get(&image_id)
            .ok_or(SfmError::UnknownImage(image_id))?
            .point2d(point2d_idx)
            .ok_or(SfmError::UnknownPoint2D {
                image_id,
                point2d_idx,
            })?
            .point3d_id;
        let Some(point3d_id) = point3d_id else {
            return Ok(());
        };

        let track_len = self
            .points3d
            .get(&point3d_id)
            .map_or(0, |point| point.track.len());
        if track_len <= 2 {
            return self.delete_point3d(point3d_id);
        }

        if let Some(point3d) = self.points3d.get_mut(&point3d_id) {
            point3d.track.delete_element(image_id, point2d_idx);
        }
        self.set_point2d_link(&TrackElement::new(image_id, point2d_idx), None);
        Ok(())
    }

    /// Merge two points into a new one at the track-length weighted mean
    /// position. Both inputs are deleted.
    pub fn merge_points3d(&mut self, point3d_id1: Point3DId, point3d_id2: Point3DId) -> Result<Point3DId> {
        let point1 = self
            .points3d
            .get(&point3d_id1)
            .ok_or(SfmError::UnknownPoint3D(point3d_id1))?;
        let point2 = self
            .points3d
            .get(&point3d_id2)
            .ok_or(SfmError::UnknownPoint3D(point3d_id2))?;

        let weight1 = point1.track.len() as f64;
        let weight2 = point2.track.len() as f64;
        let merged_xyz = (weight1 * point1.xyz + weight2 * point2.xyz) / (weight1 + weight2);
        let mut merged_track = point1.track.clone();
        merged_track.add_elements(point2.track.elements());

        self.delete_point3d(point3d_id1)?;
        self.delete_point3d(point3d_id2)?;
        self.add_point3d(merged_xyz, merged_track)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statistics
    // ─────────────────────────────────────────────────────────────────────────

    /// Total number of observations over all tracks.
    pub fn compute_num_observations(&self) -> usize {
        self.points3d.values().map(|p| p.track.len()).sum()
    }

    pub fn compute_mean_track_length(&self) -> f64 {
        if self.points3d.is_empty() {
            return 0.0;
        }
        self.compute_num_observations() as f64 / self.points3d.len() as f64
    }

    /// Reprojection error of one observation in pixels.
    pub fn observation_reprojection_error(&self, point3d: &Point3D, el: &TrackElement) -> Option<f64> {
        let (image, camera) = self.image_with_camera(el.image_id)?;
        let cam_from_world = self.cam_from_world(el.image_id)?;
        let xy = image.point2d(el.point2d_idx)?.xy;
        Some(
            camera
                .squared_reprojection_error(&xy, &point3d.xyz, &cam_from_world)
                .sqrt(),
        )
    }

    /// Mean reprojection error over all observations in pixels.
    pub fn compute_mean_reprojection_error(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for point3d in self.points3d.values() {
            for el in point3d.track.elements() {
                if let Some(error) = self.observation_reprojection_error(point3d, el) {
                    sum += error;
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Recompute the mean reprojection error stored on every point.
    pub fn update_point3d_errors(&mut self) {
        let errors: Vec<(Point3DId, f64)> = self
            .points3d
            .values()
            .map(|point3d| {
                let errors: Vec<f64> = point3d
                    .track
                    .elements()
                    .iter()
                    .filter_map(|el| self.observation_reprojection_error(point3d, el))
                    .collect();
                let mean = if errors.is_empty() {
                    -1.0
                } else {
                    errors.iter().sum::<f64>() / errors.len() as f64
                };
                (point3d.id, mean)
            })
            .collect();
        for (point3d_id, error) in errors {
            if let Some(point3d) = self.points3d.get_mut(&point3d_id) {
                point3d.error = error;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Gauge
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a similarity transform to the whole model (points, frame poses
    /// and rig extrinsic translations).
    pub fn transform(&mut self, new_from_old_world: &Sim3d) {
        for point3d in self.points3d.values_mut() {
            point3d.xyz = new_from_old_world.transform_point(&point3d.xyz);
        }
        for frame in self.frames.values_mut() {
            if let Some(pose) = frame.rig_from_world.as_mut() {
                *pose = new_from_old_world.transform_pose(pose);
            }
        }
        for rig in self.rigs.values_mut() {
            let sensor_ids: Vec<SensorId> = rig.non_ref_sensor_ids().collect();
            for sensor_id in sensor_ids {
                if let Some(mut sensor_from_rig) = rig.sensor_from_rig(sensor_id) {
                    sensor_from_rig.translation *= new_from_old_world.scale;
                    rig.set_sensor_from_rig(sensor_id, sensor_from_rig);
                }
            }
        }
    }

    /// Center and scale the model so that the central `[p0, p1]` percentile
    /// range of the camera centers spans `extent`.
    ///
    /// Needs at least two registered images, otherwise the identity is
    /// returned and nothing changes.
    pub fn normalize(&mut self, extent: f64, p0: f64, p1: f64) -> Sim3d {
        let centers: Vec<Vector3<f64>> = self
            .reg_image_ids()
            .into_iter()
            .filter_map(|image_id| self.projection_center(image_id))
            .collect();
        if centers.len() < 2 {
            return Sim3d::identity();
        }

        let last = centers.len() - 1;
        let idx0 = ((p0 * last as f64) as usize).min(last);
        let idx1 = ((p1 * last as f64) as usize).clamp(idx0, last);

        let mut bbox_min = Vector3::zeros();
        let mut bbox_max = Vector3::zeros();
        let mut mean = Vector3::zeros();
        for axis in 0..3 {
            let mut coords: Vec<f64> = centers.iter().map(|c| c[axis]).collect();
            coords.sort_by(|a, b| a.total_cmp(b));
            bbox_min[axis] = coords[idx0];
            bbox_max[axis] = coords[idx1];
            let window = &coords[idx0..=idx1];
            mean[axis] = window.iter().sum::<f64>() / window.len() as f64;
        }

        let diagonal = (bbox_max - bbox_min).norm();
        let scale = if diagonal > f64::EPSILON {
            extent / diagonal
        } else {
            1.0
        };
        let tform = Sim3d::new(scale, nalgebra::UnitQuaternion::identity(), -scale * mean);
        self.transform(&tform);
        debug!(
            "[Reconstruction] Normalized with scale {:.4}, centroid {:?}",
            scale,
            mean.as_slice()
        );
        tform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::CameraModelId;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn id(i: u32) -> ImageId {
        ImageId::new(i)
    }

    /// Three single-camera frames at x = 0, 1, 2 looking along +z.
    fn build() -> Reconstruction {
        let mut rec = Reconstruction::new();
        rec.add_camera(Camera::from_focal_length(
            CameraId::new(1),
            CameraModelId::SimplePinhole,
            100.0,
            200,
            200,
        ));
        rec.add_rig(Rig::with_camera(RigId::new(1), CameraId::new(1)));
        let keypoints: Vec<Vector2<f64>> = (0..5).map(|i| Vector2::new(i as f64, 0.0)).collect();
        for i in 1..=3 {
            rec.add_frame(Frame::new(FrameId::new(i), RigId::new(1))).unwrap();
            rec.add_image(Image::new(id(i), format!("{i}"), CameraId::new(1), FrameId::new(i), &keypoints))
                .unwrap();
            rec.register_frame(
                FrameId::new(i),
                Rigid3d::new(nalgebra::UnitQuaternion::identity(), Vector3::new(-(i as f64), 0.0, 0.0)),
            )
            .unwrap();
        }
        rec
    }

    fn track(elements: &[(u32, usize)]) -> Track {
        Track::from_elements(
            elements
                .iter()
                .map(|(i, idx)| TrackElement::new(id(*i), *idx))
                .collect(),
        )
    }

    #[test]
    fn test_add_point_links_both_directions() {
        let mut rec = build();
        let point_id = rec
            .add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(1, 0), (2, 1)]))
            .unwrap();

        assert_eq!(rec.image(id(1)).unwrap().points2d[0].point3d_id, Some(point_id));
        assert_eq!(rec.image(id(2)).unwrap().points2d[1].point3d_id, Some(point_id));
        assert_eq!(rec.compute_num_observations(), 2);
    }

    #[test]
    fn test_add_point_rejects_linked_keypoint_without_mutation() {
        let mut rec = build();
        rec.add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(1, 0), (2, 0)]))
            .unwrap();
        let before = rec.clone();

        let result = rec.add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(3, 0), (2, 0)]));
        assert!(matches!(result, Err(SfmError::Point2DAlreadyTriangulated { .. })));
        assert_eq!(rec, before);
    }

    #[test]
    fn test_delete_observation_drops_short_tracks() {
        let mut rec = build();
        let long = rec
            .add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(1, 0), (2, 0), (3, 0)]))
            .unwrap();
        let short = rec
            .add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(1, 1), (2, 1)]))
            .unwrap();

        rec.delete_observation(id(3), 0).unwrap();
        assert_eq!(rec.point3d(long).unwrap().track.len(), 2);
        assert!(rec.image(id(3)).unwrap().points2d[0].point3d_id.is_none());

        rec.delete_observation(id(2), 1).unwrap();
        assert!(!rec.exists_point3d(short));
        assert!(rec.image(id(1)).unwrap().points2d[1].point3d_id.is_none());
    }

    #[test]
    fn test_merge_points_weighted_position() {
        let mut rec = build();
        let a = rec
            .add_point3d(Vector3::new(0.0, 0.0, 3.0), track(&[(1, 0), (2, 0), (3, 0)]))
            .unwrap();
        let b = rec
            .add_point3d(Vector3::new(0.0, 0.0, 7.0), track(&[(1, 1)]))
            .unwrap();

        let merged = rec.merge_points3d(a, b).unwrap();
        let point = rec.point3d(merged).unwrap();
        assert_relative_eq!(point.xyz.z, 4.0, epsilon = 1e-12);
        assert_eq!(point.track.len(), 4);
        assert!(!rec.exists_point3d(a) && !rec.exists_point3d(b));
        assert_eq!(rec.image(id(1)).unwrap().points2d[1].point3d_id, Some(merged));
    }

    #[test]
    fn test_deregister_frame_removes_observations() {
        let mut rec = build();
        let point_id = rec
            .add_point3d(Vector3::new(0.0, 0.0, 5.0), track(&[(1, 0), (2, 0)]))
            .unwrap();

        rec.deregister_frame(FrameId::new(2)).unwrap();
        assert!(!rec.is_frame_registered(FrameId::new(2)));
        assert!(rec.frame(FrameId::new(2)).unwrap().rig_from_world.is_none());
        assert!(!rec.exists_point3d(point_id));
        assert_eq!(
            rec.deregister_frame(FrameId::new(2)),
            Err(SfmError::FrameNotRegistered(FrameId::new(2)))
        );
    }

    #[test]
    fn test_register_twice_rejected() {
        let mut rec = build();
        assert_eq!(
            rec.register_frame(FrameId::new(1), Rigid3d::identity()),
            Err(SfmError::FrameAlreadyRegistered(FrameId::new(1)))
        );
    }

    #[test]
    fn test_normalize_preserves_reprojection() {
        let mut rec = build();
        rec.add_point3d(Vector3::new(1.0, 0.5, 5.0), track(&[(1, 0), (2, 0), (3, 0)]))
            .unwrap();
        // Put keypoints exactly at the projections
        let xyz = rec.points3d().values().next().unwrap().xyz;
        for i in 1..=3 {
            let pose = rec.cam_from_world(id(i)).unwrap();
            let xy = rec
                .camera(CameraId::new(1))
                .unwrap()
                .img_from_cam(&pose.transform_point(&xyz))
                .unwrap();
            rec.images.get_mut(&id(i)).unwrap().points2d[0].xy = xy;
        }
        assert_relative_eq!(rec.compute_mean_reprojection_error(), 0.0, epsilon = 1e-9);

        let tform = rec.normalize(10.0, 0.0, 1.0);
        assert!((tform.scale - 5.0).abs() < 1e-9);
        assert_relative_eq!(rec.compute_mean_reprojection_error(), 0.0, epsilon = 1e-9);
        let centers: Vec<_> = rec
            .reg_image_ids()
            .into_iter()
            .map(|i| rec.projection_center(i).unwrap())
            .collect();
        assert_relative_eq!(centers[1], Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_tear_down_drops_unregistered() {
        let mut rec = build();
        rec.add_frame(Frame::new(FrameId::new(9), RigId::new(1))).unwrap();
        rec.add_image(Image::new(id(9), "9", CameraId::new(1), FrameId::new(9), &[]))
            .unwrap();
        rec.tear_down();
        assert!(rec.frame(FrameId::new(9)).is_none());
        assert!(rec.image(id(9)).is_none());
        assert_eq!(rec.num_images(), 3);
    }
}
