//! Bundle adjustment problem: parameter blocks collected from a
//! reconstruction, per-residual linearization and write-back.

use std::collections::HashMap;

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};
use tracing::debug;

use super::loss::{LossFunction, LossFunctionType};
use super::{BundleAdjustmentConfig, BundleAdjustmentOptions, PosePriorBundleAdjustmentOptions};
use crate::geometry::triangulation::MIN_POSITIVE_DEPTH;
use crate::geometry::{retract_rotation, skew, Rigid3d};
use crate::scene::{CameraId, FrameId, ImageId, Point3DId, PosePrior, Reconstruction, RigId};
use crate::sensor::{Camera, SensorId};

/// Relative step for numeric differentiation of intrinsics.
const INTRINSICS_STEP: f64 = 1e-6;

/// `rig_from_world` of one frame. Rotation and translation components map to
/// columns of the reduced camera system when variable.
#[derive(Debug, Clone)]
pub(super) struct PoseBlock {
    pub frame_id: FrameId,
    pub columns: [Option<usize>; 6],
}

#[derive(Debug, Clone)]
pub(super) struct SensorBlock {
    pub rig_id: RigId,
    pub sensor_id: SensorId,
    /// First of six columns when variable.
    pub column: Option<usize>,
}

#[derive(Debug, Clone)]
pub(super) struct IntrinsicsBlock {
    pub camera_id: CameraId,
    /// `(camera param index, column)` of the refined parameters.
    pub columns: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub(super) struct PointBlock {
    pub point3d_id: Point3DId,
    /// Index among the variable points.
    pub variable_idx: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Observation {
    pub pose: usize,
    /// `None` for the rig's reference sensor.
    pub sensor: Option<usize>,
    pub camera: usize,
    pub point: usize,
    pub xy: Vector2<f64>,
}

#[derive(Debug, Clone)]
pub(super) struct PriorResidual {
    pub pose: usize,
    pub position: Vector3<f64>,
    pub sqrt_information: Matrix3<f64>,
}

/// Current values of all parameter blocks.
#[derive(Debug, Clone)]
pub(super) struct State {
    pub poses: Vec<Rigid3d>,
    pub sensors: Vec<Rigid3d>,
    pub cameras: Vec<Camera>,
    pub points: Vec<Vector3<f64>>,
}

/// Whitened residual and Jacobian of one observation.
#[derive(Debug, Clone)]
pub(super) struct LinearizedObservation {
    pub point: usize,
    pub residual: Vector2<f64>,
    pub camera_columns: Vec<(usize, Vector2<f64>)>,
    pub point_jacobian: Option<Matrix2x3<f64>>,
}

/// Whitened residual and Jacobian of one position prior.
#[derive(Debug, Clone)]
pub(super) struct LinearizedPrior {
    pub residual: Vector3<f64>,
    pub camera_columns: Vec<(usize, Vector3<f64>)>,
}

pub(super) struct Problem {
    pub poses: Vec<PoseBlock>,
    pub sensors: Vec<SensorBlock>,
    pub cameras: Vec<IntrinsicsBlock>,
    pub points: Vec<PointBlock>,
    pub observations: Vec<Observation>,
    pub priors: Vec<PriorResidual>,
    pub num_camera_params: usize,
    pub num_variable_points: usize,
    pub loss: LossFunction,
    pub prior_loss: LossFunction,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collection
// ─────────────────────────────────────────────────────────────────────────────

struct ProblemBuilder<'a> {
    reconstruction: &'a Reconstruction,
    config: &'a BundleAdjustmentConfig,
    options: &'a BundleAdjustmentOptions,
    problem: Problem,
    state: State,
    pose_index: HashMap<FrameId, usize>,
    sensor_index: HashMap<(RigId, SensorId), usize>,
    camera_index: HashMap<CameraId, usize>,
    point_index: HashMap<Point3DId, usize>,
}

impl<'a> ProblemBuilder<'a> {
    fn next_columns(&mut self, n: usize) -> usize {
        let start = self.problem.num_camera_params;
        self.problem.num_camera_params += n;
        start
    }

    fn pose_block(&mut self, frame_id: FrameId, rig_from_world: Rigid3d, in_config: bool) -> usize {
        if let Some(&idx) = self.pose_index.get(&frame_id) {
            return idx;
        }
        let config = self.config;
        let mut columns = [None; 6];
        let variable =
            in_config && self.options.refine_rig_from_world && !config.has_constant_rig_from_world_pose(frame_id);
        if variable {
            let constant_position = config.constant_rig_position(frame_id);
            for (k, column) in columns.iter_mut().enumerate() {
                if k >= 3 && constant_position.contains(&(k - 3)) {
                    continue;
                }
                *column = Some(self.next_columns(1));
            }
        }
        let idx = self.problem.poses.len();
        self.problem.poses.push(PoseBlock { frame_id, columns });
        self.state.poses.push(rig_from_world);
        self.pose_index.insert(frame_id, idx);
        idx
    }

    fn sensor_block(&mut self, rig_id: RigId, sensor_id: SensorId, sensor_from_rig: Rigid3d, in_config: bool) -> usize {
        if let Some(&idx) = self.sensor_index.get(&(rig_id, sensor_id)) {
            return idx;
        }
        let variable = in_config
            && self.options.refine_sensor_from_rig
            && !self.config.has_constant_sensor_from_rig_pose(sensor_id);
        let column = variable.then(|| self.next_columns(6));
        let idx = self.problem.sensors.len();
        self.problem.sensors.push(SensorBlock {
            rig_id,
            sensor_id,
            column,
        });
        self.state.sensors.push(sensor_from_rig);
        self.sensor_index.insert((rig_id, sensor_id), idx);
        idx
    }

    fn camera_block(&mut self, camera: &Camera, in_config: bool) -> usize {
        if let Some(&idx) = self.camera_index.get(&camera.camera_id) {
            return idx;
        }
        let mut param_idxs: Vec<usize> = Vec::new();
        if in_config && !self.config.has_constant_cam_intrinsics(camera.camera_id) {
            if self.options.refine_focal_length {
                param_idxs.extend_from_slice(camera.focal_length_idxs());
            }
            if self.options.refine_principal_point {
                param_idxs.extend_from_slice(camera.principal_point_idxs());
            }
            if self.options.refine_extra_params {
                param_idxs.extend_from_slice(camera.extra_params_idxs());
            }
        }
        let columns = param_idxs
            .into_iter()
            .map(|param_idx| (param_idx, self.next_columns(1)))
            .collect();
        let idx = self.problem.cameras.len();
        self.problem.cameras.push(IntrinsicsBlock {
            camera_id: camera.camera_id,
            columns,
        });
        self.state.cameras.push(camera.clone());
        self.camera_index.insert(camera.camera_id, idx);
        idx
    }

    fn point_block(&mut self, point3d_id: Point3DId, xyz: Vector3<f64>, variable: bool) -> usize {
        if let Some(&idx) = self.point_index.get(&point3d_id) {
            return idx;
        }
        let variable_idx = variable.then(|| {
            self.problem.num_variable_points += 1;
            self.problem.num_variable_points - 1
        });
        let idx = self.problem.points.len();
        self.problem.points.push(PointBlock {
            point3d_id,
            variable_idx,
        });
        self.state.points.push(xyz);
        self.point_index.insert(point3d_id, idx);
        idx
    }

    /// Pose, sensor and camera blocks of a registered image.
    fn image_blocks(&mut self, image_id: ImageId, in_config: bool) -> Option<(usize, Option<usize>, usize)> {
        let reconstruction = self.reconstruction;
        let (image, camera) = reconstruction.image_with_camera(image_id)?;
        let frame = reconstruction.frame(image.frame_id)?;
        let rig_from_world = frame.rig_from_world?;
        let rig = reconstruction.rig(frame.rig_id)?;
        let sensor_id = SensorId::camera(image.camera_id);

        let sensor = if rig.is_ref_sensor(sensor_id) {
            None
        } else {
            let sensor_from_rig = rig.sensor_from_rig(sensor_id)?;
            Some(self.sensor_block(frame.rig_id, sensor_id, sensor_from_rig, in_config))
        };
        let pose = self.pose_block(frame.frame_id, rig_from_world, in_config);
        let camera = self.camera_block(camera, in_config);
        Some((pose, sensor, camera))
    }

    fn add_observation(&mut self, blocks: (usize, Option<usize>, usize), point: usize, xy: Vector2<f64>) {
        let (pose, sensor, camera) = blocks;
        let observation = Observation {
            pose,
            sensor,
            camera,
            point,
            xy,
        };
        // Observations behind the camera at the start are left out
        if project(&self.state, &observation).is_some() {
            self.problem.observations.push(observation);
        }
    }

    fn add_config_image(&mut self, image_id: ImageId) {
        let Some(blocks) = self.image_blocks(image_id, true) else {
            debug!("[BA] Skipping image {} without pose", image_id);
            return;
        };
        let reconstruction = self.reconstruction;
        let Some(image) = reconstruction.image(image_id) else {
            return;
        };
        for point2d in &image.points2d {
            let Some(point3d_id) = point2d.point3d_id else {
                continue;
            };
            let Some(point3d) = reconstruction.point3d(point3d_id) else {
                continue;
            };
            let variable = !self.config.has_constant_point(point3d_id);
            let point = self.point_block(point3d_id, point3d.xyz, variable);
            self.add_observation(blocks, point, point2d.xy);
        }
    }

    /// Observations of an explicitly variable point in images outside the
    /// configuration, with constant poses.
    fn add_variable_point(&mut self, point3d_id: Point3DId) {
        let reconstruction = self.reconstruction;
        let Some(point3d) = reconstruction.point3d(point3d_id) else {
            return;
        };
        let point = self.point_block(point3d_id, point3d.xyz, true);
        for el in point3d.track.elements() {
            if self.config.has_image(el.image_id) || !reconstruction.is_image_registered(el.image_id) {
                continue;
            }
            let Some(blocks) = self.image_blocks(el.image_id, false) else {
                continue;
            };
            let Some(point2d) = reconstruction.image(el.image_id).and_then(|image| image.point2d(el.point2d_idx))
            else {
                continue;
            };
            self.add_observation(blocks, point, point2d.xy);
        }
    }
}

impl Problem {
    /// Collect parameter blocks and residuals from the reconstruction.
    pub fn build(
        reconstruction: &Reconstruction,
        config: &BundleAdjustmentConfig,
        options: &BundleAdjustmentOptions,
        pose_priors: Option<(&PosePriorBundleAdjustmentOptions, &HashMap<FrameId, PosePrior>)>,
    ) -> (Problem, State) {
        let mut builder = ProblemBuilder {
            reconstruction,
            config,
            options,
            problem: Problem {
                poses: Vec::new(),
                sensors: Vec::new(),
                cameras: Vec::new(),
                points: Vec::new(),
                observations: Vec::new(),
                priors: Vec::new(),
                num_camera_params: 0,
                num_variable_points: 0,
                loss: LossFunction::new(options.loss_function_type, options.loss_function_scale),
                prior_loss: LossFunction::trivial(),
            },
            state: State {
                poses: Vec::new(),
                sensors: Vec::new(),
                cameras: Vec::new(),
                points: Vec::new(),
            },
            pose_index: HashMap::new(),
            sensor_index: HashMap::new(),
            camera_index: HashMap::new(),
            point_index: HashMap::new(),
        };

        for &image_id in config.image_ids() {
            builder.add_config_image(image_id);
        }
        for &point3d_id in config.variable_point3d_ids() {
            builder.add_variable_point(point3d_id);
        }

        if let Some((prior_options, priors)) = pose_priors {
            if prior_options.use_robust_loss_on_prior_position {
                builder.problem.prior_loss =
                    LossFunction::new(LossFunctionType::Cauchy, prior_options.prior_position_loss_scale.sqrt());
            }
            for (idx, block) in builder.problem.poses.iter().enumerate() {
                let Some(prior) = priors.get(&block.frame_id).filter(|p| p.is_valid()) else {
                    continue;
                };
                let Some(sqrt_information) = prior.sqrt_information() else {
                    continue;
                };
                builder.problem.priors.push(PriorResidual {
                    pose: idx,
                    position: prior.position,
                    sqrt_information,
                });
            }
        }

        (builder.problem, builder.state)
    }

    pub fn num_residuals(&self) -> usize {
        2 * self.observations.len() + 3 * self.priors.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────────

    /// `½ Σ ρ(s)`, or `None` if any observation fell behind its camera.
    pub fn cost(&self, state: &State) -> Option<f64> {
        let mut cost = 0.0;
        for observation in &self.observations {
            let (projection, _) = project(state, observation)?;
            cost += self.loss.rho((projection - observation.xy).norm_squared());
        }
        for prior in &self.priors {
            cost += self.prior_loss.rho(prior_residual(state, prior).norm_squared());
        }
        Some(0.5 * cost)
    }

    pub fn linearize_observation(&self, state: &State, observation: &Observation) -> Option<LinearizedObservation> {
        let (projection, p_cam) = project(state, observation)?;
        let camera = &state.cameras[observation.camera];
        let (_, d_uv_d_cam) = camera.img_from_cam_with_jacobian(&p_cam)?;

        let raw = projection - observation.xy;
        let (_, drho) = self.loss.evaluate(raw.norm_squared());
        let weight = drho.max(0.0).sqrt();

        let rig_from_world = &state.poses[observation.pose];
        let xyz = &state.points[observation.point];
        let rotated = rig_from_world.rotation * xyz;
        let p_rig = rotated + rig_from_world.translation;
        let (sensor_rotation, sensor_from_rig) = match observation.sensor {
            Some(idx) => (state.sensors[idx].rotation_matrix(), Some(&state.sensors[idx])),
            None => (Matrix3::identity(), None),
        };

        let mut camera_columns = Vec::new();

        let pose_block = &self.poses[observation.pose];
        let d_uv_d_rig = d_uv_d_cam * sensor_rotation;
        let d_rig_d_omega = -skew(&rotated);
        for k in 0..3 {
            if let Some(column) = pose_block.columns[k] {
                camera_columns.push((column, weight * (d_uv_d_rig * d_rig_d_omega.column(k))));
            }
            if let Some(column) = pose_block.columns[3 + k] {
                camera_columns.push((column, weight * d_uv_d_rig.column(k).into_owned()));
            }
        }

        if let (Some(idx), Some(sensor_from_rig)) = (observation.sensor, sensor_from_rig) {
            if let Some(start) = self.sensors[idx].column {
                let d_cam_d_omega = -skew(&(sensor_from_rig.rotation * p_rig));
                for k in 0..3 {
                    camera_columns.push((start + k, weight * (d_uv_d_cam * d_cam_d_omega.column(k))));
                    camera_columns.push((start + 3 + k, weight * d_uv_d_cam.column(k).into_owned()));
                }
            }
        }

        let intrinsics = &self.cameras[observation.camera];
        if !intrinsics.columns.is_empty() {
            let normalized = Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z);
            let mut perturbed = camera.clone();
            for &(param_idx, column) in &intrinsics.columns {
                let value = camera.params[param_idx];
                let h = INTRINSICS_STEP * value.abs().max(1.0);
                perturbed.params[param_idx] = value + h;
                let plus = perturbed.img_from_normalized(&normalized);
                perturbed.params[param_idx] = value - h;
                let minus = perturbed.img_from_normalized(&normalized);
                perturbed.params[param_idx] = value;
                camera_columns.push((column, weight * (plus - minus) / (2.0 * h)));
            }
        }

        let point_jacobian = self.points[observation.point]
            .variable_idx
            .map(|_| weight * d_uv_d_rig * rig_from_world.rotation_matrix());

        Some(LinearizedObservation {
            point: observation.point,
            residual: weight * raw,
            camera_columns,
            point_jacobian,
        })
    }

    pub fn linearize_prior(&self, state: &State, prior: &PriorResidual) -> LinearizedPrior {
        let raw = prior_residual(state, prior);
        let (_, drho) = self.prior_loss.evaluate(raw.norm_squared());
        let weight = drho.max(0.0).sqrt();

        // center = -R^T t; d/dω = -R^T [t]x, d/dt = -R^T
        let pose = &state.poses[prior.pose];
        let r_t = pose.rotation_matrix().transpose();
        let d_omega = -prior.sqrt_information * r_t * skew(&pose.translation);
        let d_t = -prior.sqrt_information * r_t;

        let columns = &self.poses[prior.pose].columns;
        let mut camera_columns = Vec::new();
        for k in 0..3 {
            if let Some(column) = columns[k] {
                camera_columns.push((column, weight * d_omega.column(k).into_owned()));
            }
            if let Some(column) = columns[3 + k] {
                camera_columns.push((column, weight * d_t.column(k).into_owned()));
            }
        }
        LinearizedPrior {
            residual: weight * raw,
            camera_columns,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Update & write-back
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply camera-system and point increments.
    pub fn retract(&self, state: &State, delta_cameras: &[f64], delta_points: &[Vector3<f64>]) -> State {
        let mut next = state.clone();
        for (block, pose) in self.poses.iter().zip(next.poses.iter_mut()) {
            let get = |k: usize| block.columns[k].map_or(0.0, |c| delta_cameras[c]);
            let omega = Vector3::new(get(0), get(1), get(2));
            pose.rotation = retract_rotation(&pose.rotation, &omega);
            pose.translation += Vector3::new(get(3), get(4), get(5));
        }
        for (block, sensor) in self.sensors.iter().zip(next.sensors.iter_mut()) {
            if let Some(start) = block.column {
                let omega = Vector3::new(delta_cameras[start], delta_cameras[start + 1], delta_cameras[start + 2]);
                sensor.rotation = retract_rotation(&sensor.rotation, &omega);
                sensor.translation += Vector3::new(
                    delta_cameras[start + 3],
                    delta_cameras[start + 4],
                    delta_cameras[start + 5],
                );
            }
        }
        for (block, camera) in self.cameras.iter().zip(next.cameras.iter_mut()) {
            for &(param_idx, column) in &block.columns {
                camera.params[param_idx] += delta_cameras[column];
            }
        }
        for (block, xyz) in self.points.iter().zip(next.points.iter_mut()) {
            if let Some(idx) = block.variable_idx {
                *xyz += delta_points[idx];
            }
        }
        next
    }

    /// Norm of the variable parameter values, for the parameter tolerance.
    pub fn parameter_norm(&self, state: &State) -> f64 {
        let mut sum = 0.0;
        for (block, pose) in self.poses.iter().zip(&state.poses) {
            for k in 0..3 {
                if block.columns[3 + k].is_some() {
                    sum += pose.translation[k] * pose.translation[k];
                }
            }
        }
        for (block, camera) in self.cameras.iter().zip(&state.cameras) {
            for &(param_idx, _) in &block.columns {
                sum += camera.params[param_idx] * camera.params[param_idx];
            }
        }
        for (block, xyz) in self.points.iter().zip(&state.points) {
            if block.variable_idx.is_some() {
                sum += xyz.norm_squared();
            }
        }
        sum.sqrt()
    }

    /// Write variable blocks back into the reconstruction.
    pub fn write_back(&self, state: &State, reconstruction: &mut Reconstruction) {
        for (block, pose) in self.poses.iter().zip(&state.poses) {
            if block.columns.iter().all(Option::is_none) {
                continue;
            }
            if let Some(frame) = reconstruction.frame_mut(block.frame_id) {
                frame.rig_from_world = Some(*pose);
            }
        }
        for (block, sensor_from_rig) in self.sensors.iter().zip(&state.sensors) {
            if block.column.is_none() {
                continue;
            }
            if let Some(rig) = reconstruction.rig_mut(block.rig_id) {
                rig.set_sensor_from_rig(block.sensor_id, *sensor_from_rig);
            }
        }
        for (block, camera) in self.cameras.iter().zip(&state.cameras) {
            if block.columns.is_empty() {
                continue;
            }
            if let Some(target) = reconstruction.camera_mut(block.camera_id) {
                target.params.clone_from(&camera.params);
            }
        }
        for (block, xyz) in self.points.iter().zip(&state.points) {
            if block.variable_idx.is_none() {
                continue;
            }
            if let Some(point3d) = reconstruction.point3d_mut(block.point3d_id) {
                point3d.xyz = *xyz;
            }
        }
    }
}

/// Pixel projection and camera-frame point of an observation.
fn project(state: &State, observation: &Observation) -> Option<(Vector2<f64>, Vector3<f64>)> {
    let p_rig = state.poses[observation.pose].transform_point(&state.points[observation.point]);
    let p_cam = match observation.sensor {
        Some(idx) => state.sensors[idx].transform_point(&p_rig),
        None => p_rig,
    };
    if p_cam.z <= MIN_POSITIVE_DEPTH {
        return None;
    }
    let projection = state.cameras[observation.camera].img_from_cam(&p_cam)?;
    Some((projection, p_cam))
}

fn prior_residual(state: &State, prior: &PriorResidual) -> Vector3<f64> {
    prior.sqrt_information * (state.poses[prior.pose].center() - prior.position)
}
