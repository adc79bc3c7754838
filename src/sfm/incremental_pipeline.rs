//! Incremental Pipeline - drives the mapper over a whole image set.
//!
//! One run may produce several models:
//! - Each model starts from an initial pair and grows image by image
//! - Local refinement after every registration, global refinement on a
//!   frame/point growth cadence
//! - Models smaller than `min_model_size` are discarded
//! - If nothing could be reconstructed, the initialization constraints are
//!   relaxed twice and the run is repeated
//!
//! A run can be aborted from another thread through [`IncrementalPipeline::stop_handle`];
//! the flag is checked between mapper calls only.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::incremental_mapper::{IncrementalMapper, IncrementalMapperOptions};
use super::incremental_triangulator::IncrementalTriangulatorOptions;
use crate::error::check_option;
use crate::estimators::{BundleAdjustmentOptions, LossFunctionType};
use crate::scene::{DatabaseCache, ImageId, ReconstructionManager, SharedReconstruction};

/// Candidates tried per step before a small model gives up.
const MAX_NEXT_IMAGE_TRIALS_FOR_SMALL_MODEL: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalPipelineOptions {
    pub mapper: IncrementalMapperOptions,
    pub triangulation: IncrementalTriangulatorOptions,

    /// Keep building models after the first one.
    pub multiple_models: bool,
    pub max_num_models: usize,
    /// Maximum number of images a model may share with earlier models.
    pub max_model_overlap: usize,
    /// Models with fewer registered images are discarded.
    pub min_model_size: usize,

    /// Use this pair for initialization; with one id only its pairs are tried.
    pub init_image_id1: Option<ImageId>,
    pub init_image_id2: Option<ImageId>,
    /// Number of models attempted from distinct initial pairs.
    pub init_num_trials: usize,

    pub num_threads: i32,

    pub ba_refine_focal_length: bool,
    pub ba_refine_principal_point: bool,
    pub ba_refine_extra_params: bool,
    pub ba_refine_sensor_from_rig: bool,
    pub ba_min_num_residuals_for_multi_threading: usize,

    pub ba_local_function_tolerance: f64,
    pub ba_local_gradient_tolerance: f64,
    pub ba_local_max_num_iterations: usize,
    pub ba_local_max_refinements: usize,
    pub ba_local_max_refinement_change: f64,

    pub ba_global_function_tolerance: f64,
    pub ba_global_gradient_tolerance: f64,
    pub ba_global_max_num_iterations: usize,
    pub ba_global_max_refinements: usize,
    pub ba_global_max_refinement_change: f64,

    /// Global refinement runs once the frame count grew by this factor...
    pub ba_global_frames_ratio: f64,
    /// ...or the point count grew by this factor...
    pub ba_global_points_ratio: f64,
    /// ...or this many frames were added...
    pub ba_global_frames_freq: usize,
    /// ...or this many points were added since the last global refinement.
    pub ba_global_points_freq: usize,
}

impl Default for IncrementalPipelineOptions {
    fn default() -> Self {
        Self {
            mapper: IncrementalMapperOptions::default(),
            triangulation: IncrementalTriangulatorOptions::default(),
            multiple_models: true,
            max_num_models: 50,
            max_model_overlap: 20,
            min_model_size: 10,
            init_image_id1: None,
            init_image_id2: None,
            init_num_trials: 200,
            num_threads: -1,
            ba_refine_focal_length: true,
            ba_refine_principal_point: false,
            ba_refine_extra_params: true,
            ba_refine_sensor_from_rig: true,
            ba_min_num_residuals_for_multi_threading: 50_000,
            ba_local_function_tolerance: 0.0,
            ba_local_gradient_tolerance: 1e-4,
            ba_local_max_num_iterations: 25,
            ba_local_max_refinements: 2,
            ba_local_max_refinement_change: 0.001,
            ba_global_function_tolerance: 0.0,
            ba_global_gradient_tolerance: 1e-4,
            ba_global_max_num_iterations: 50,
            ba_global_max_refinements: 5,
            ba_global_max_refinement_change: 0.0005,
            ba_global_frames_ratio: 1.1,
            ba_global_points_ratio: 1.1,
            ba_global_frames_freq: 500,
            ba_global_points_freq: 250_000,
        }
    }
}

impl IncrementalPipelineOptions {
    /// Parse options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: Self = toml::from_str(s).context("Failed to parse incremental pipeline options")?;
        options.check().context("Invalid incremental pipeline options")?;
        Ok(options)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to load options from {}", path.display()))
    }

    pub fn check(&self) -> crate::error::Result<()> {
        self.mapper.check()?;
        self.triangulation.check()?;
        check_option(self.max_num_models > 0, "max_num_models must be positive")?;
        check_option(self.init_num_trials > 0, "init_num_trials must be positive")?;
        check_option(self.ba_local_max_num_iterations > 0, "ba_local_max_num_iterations must be positive")?;
        check_option(self.ba_global_max_num_iterations > 0, "ba_global_max_num_iterations must be positive")?;
        check_option(
            self.ba_local_function_tolerance >= 0.0
                && self.ba_local_gradient_tolerance >= 0.0
                && self.ba_global_function_tolerance >= 0.0
                && self.ba_global_gradient_tolerance >= 0.0,
            "bundle adjustment tolerances must be non-negative",
        )?;
        check_option(
            self.ba_local_max_refinement_change >= 0.0 && self.ba_global_max_refinement_change >= 0.0,
            "refinement change thresholds must be non-negative",
        )?;
        check_option(
            self.ba_global_frames_ratio > 1.0 && self.ba_global_points_ratio > 1.0,
            "global bundle adjustment ratios must exceed 1",
        )?;
        check_option(
            self.ba_global_frames_freq > 0 && self.ba_global_points_freq > 0,
            "global bundle adjustment frequencies must be positive",
        )
    }

    pub fn is_initial_pair_provided(&self) -> bool {
        self.init_image_id1.is_some() || self.init_image_id2.is_some()
    }

    pub fn mapper_options(&self) -> IncrementalMapperOptions {
        IncrementalMapperOptions {
            num_threads: self.num_threads,
            ..self.mapper.clone()
        }
    }

    /// Options for the bundle around a newly registered image.
    pub fn local_bundle_adjustment(&self) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            loss_function_type: LossFunctionType::SoftL1,
            loss_function_scale: 1.0,
            max_num_iterations: self.ba_local_max_num_iterations,
            function_tolerance: self.ba_local_function_tolerance,
            gradient_tolerance: self.ba_local_gradient_tolerance,
            parameter_tolerance: 0.0,
            ..self.bundle_adjustment_base()
        }
    }

    pub fn global_bundle_adjustment(&self) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            loss_function_type: LossFunctionType::Trivial,
            max_num_iterations: self.ba_global_max_num_iterations,
            function_tolerance: self.ba_global_function_tolerance,
            gradient_tolerance: self.ba_global_gradient_tolerance,
            parameter_tolerance: 0.0,
            ..self.bundle_adjustment_base()
        }
    }

    fn bundle_adjustment_base(&self) -> BundleAdjustmentOptions {
        BundleAdjustmentOptions {
            refine_focal_length: self.ba_refine_focal_length,
            refine_principal_point: self.ba_refine_principal_point,
            refine_extra_params: self.ba_refine_extra_params,
            refine_sensor_from_rig: self.ba_refine_sensor_from_rig,
            num_threads: self.num_threads,
            min_num_residuals_for_multi_threading: self.ba_min_num_residuals_for_multi_threading,
            ..Default::default()
        }
    }
}

/// Outcome of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubModelStatus {
    Success,
    NoInitialPair,
    BadInitialPair,
    Interrupted,
}

/// Growth snapshot at the last global refinement.
#[derive(Debug, Clone, Copy)]
struct GlobalRefinementMark {
    num_reg_frames: usize,
    num_points3d: usize,
}

pub struct IncrementalPipeline {
    options: IncrementalPipelineOptions,
    database_cache: Arc<DatabaseCache>,
    reconstruction_manager: ReconstructionManager,
    stop_requested: Arc<AtomicBool>,
}

impl IncrementalPipeline {
    pub fn new(options: IncrementalPipelineOptions, database_cache: Arc<DatabaseCache>) -> Result<Self> {
        options.check().context("Invalid incremental pipeline options")?;
        Ok(Self {
            options,
            database_cache,
            reconstruction_manager: ReconstructionManager::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn options(&self) -> &IncrementalPipelineOptions {
        &self.options
    }

    pub fn reconstruction_manager(&self) -> &ReconstructionManager {
        &self.reconstruction_manager
    }

    pub fn into_reconstruction_manager(self) -> ReconstructionManager {
        self.reconstruction_manager
    }

    /// Flag another thread can set to abort the run.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Reconstruct all models; relax the initialization constraints if the
    /// first attempt produced nothing.
    pub fn run(&mut self) -> Result<()> {
        if self.database_cache.num_images() == 0 {
            warn!("[Pipeline] No images to reconstruct");
            return Ok(());
        }

        let mut mapper = IncrementalMapper::new(Arc::clone(&self.database_cache));
        let mut mapper_options = self.options.mapper_options();
        self.reconstruct(&mut mapper, &mapper_options)?;

        for round in 0..2 {
            if !self.reconstruction_manager.is_empty() || self.is_stop_requested() {
                break;
            }
            if round == 0 {
                mapper_options.init_min_num_inliers = (mapper_options.init_min_num_inliers / 2).max(1);
            } else {
                mapper_options.init_min_tri_angle /= 2.0;
            }
            info!(
                "[Pipeline] Relaxing initialization: min_num_inliers={}, min_tri_angle={:.2}",
                mapper_options.init_min_num_inliers, mapper_options.init_min_tri_angle
            );
            mapper.reset_initialization_stats();
            self.reconstruct(&mut mapper, &mapper_options)?;
        }

        info!(
            "[Pipeline] Finished with {} models, {} images registered",
            self.reconstruction_manager.len(),
            mapper.num_total_reg_images()
        );
        Ok(())
    }

    fn reconstruct(&mut self, mapper: &mut IncrementalMapper, mapper_options: &IncrementalMapperOptions) -> Result<()> {
        let num_images = self.database_cache.num_images();
        let min_model_size = ((0.8 * num_images as f64) as usize).min(self.options.min_model_size);

        for _ in 0..self.options.init_num_trials {
            if self.is_stop_requested() {
                break;
            }

            let idx = self.reconstruction_manager.add();
            let reconstruction = self
                .reconstruction_manager
                .get(idx)
                .context("Reconstruction missing right after being added")?;
            mapper
                .begin_reconstruction(Arc::clone(&reconstruction))
                .context("Failed to begin reconstruction")?;

            let status = self.reconstruct_sub_model(mapper, mapper_options, &reconstruction)?;
            match status {
                SubModelStatus::Interrupted => {
                    mapper.end_reconstruction(false)?;
                    return Ok(());
                }
                SubModelStatus::NoInitialPair => {
                    mapper.end_reconstruction(true)?;
                    self.reconstruction_manager.delete(idx);
                    return Ok(());
                }
                SubModelStatus::BadInitialPair => {
                    mapper.end_reconstruction(true)?;
                    self.reconstruction_manager.delete(idx);
                    if self.options.is_initial_pair_provided() {
                        return Ok(());
                    }
                }
                SubModelStatus::Success => {
                    let num_reg_images = reconstruction.read().num_reg_images();
                    if num_reg_images == 0 || (self.options.multiple_models && num_reg_images < min_model_size) {
                        info!(
                            "[Pipeline] Discarding model with {} images (minimum {})",
                            num_reg_images, min_model_size
                        );
                        mapper.end_reconstruction(true)?;
                        self.reconstruction_manager.delete(idx);
                    } else {
                        info!("[Pipeline] Model {} done with {} images", idx, num_reg_images);
                        mapper.end_reconstruction(false)?;
                    }

                    if !self.options.multiple_models
                        || self.reconstruction_manager.len() >= self.options.max_num_models
                        || mapper.num_total_reg_images() >= num_images.saturating_sub(1)
                    {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn reconstruct_sub_model(
        &self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
        reconstruction: &SharedReconstruction,
    ) -> Result<SubModelStatus> {
        let tri_options = &self.options.triangulation;

        if reconstruction.read().num_reg_frames() == 0 {
            let initial_pair = mapper
                .find_initial_image_pair(mapper_options, self.options.init_image_id1, self.options.init_image_id2)
                .context("Initial pair search failed")?;
            let Some((image_id1, image_id2, cam2_from_cam1)) = initial_pair else {
                if self.options.is_initial_pair_provided() {
                    warn!("[Pipeline] Provided initial pair is unusable");
                    return Ok(SubModelStatus::BadInitialPair);
                }
                warn!("[Pipeline] No good initial image pair found");
                return Ok(SubModelStatus::NoInitialPair);
            };

            info!("[Pipeline] Initializing with images {} and {}", image_id1, image_id2);
            mapper.register_initial_image_pair(mapper_options, image_id1, image_id2, cam2_from_cam1)?;
            if !mapper.adjust_global_bundle(mapper_options, &self.options.global_bundle_adjustment())? {
                debug!("[Pipeline] Initial bundle adjustment did not converge");
            }
            if !mapper_options.use_prior_position {
                reconstruction.write().normalize(10.0, 0.1, 0.9);
            }
            mapper.filter_points(mapper_options)?;
            mapper.filter_frames(mapper_options)?;

            let rec = reconstruction.read();
            if rec.num_reg_frames() == 0 || rec.num_points3d() == 0 {
                warn!("[Pipeline] Initial pair lost all frames or points after refinement");
                return Ok(SubModelStatus::BadInitialPair);
            }
        }

        let mut mark = self.mark(reconstruction);
        let mut reg_next_success = true;
        loop {
            if self.is_stop_requested() {
                break;
            }
            let prev_reg_next_success = reg_next_success;
            reg_next_success = false;

            let next_images = mapper.find_next_images(mapper_options)?;
            if next_images.is_empty() {
                break;
            }

            let mut registered_image_id = None;
            for (trial, image_id) in next_images.iter().enumerate() {
                debug!(
                    "[Pipeline] Registering image {} ({} registered)",
                    image_id,
                    reconstruction.read().num_reg_images()
                );
                if mapper.register_next_image(mapper_options, *image_id)? {
                    registered_image_id = Some(*image_id);
                    break;
                }
                if trial + 1 >= MAX_NEXT_IMAGE_TRIALS_FOR_SMALL_MODEL
                    && reconstruction.read().num_reg_images() < self.options.min_model_size
                {
                    break;
                }
            }

            if let Some(image_id) = registered_image_id {
                reg_next_success = true;
                let frame_image_ids = {
                    let rec = reconstruction.read();
                    rec.image(image_id)
                        .and_then(|image| rec.frame(image.frame_id))
                        .map(|frame| frame.image_ids.clone())
                        .unwrap_or_default()
                };
                for frame_image_id in frame_image_ids {
                    mapper.triangulate_image(tri_options, frame_image_id)?;
                }
                mapper.iterative_local_refinement(
                    self.options.ba_local_max_refinements,
                    self.options.ba_local_max_refinement_change,
                    mapper_options,
                    &self.options.local_bundle_adjustment(),
                    tri_options,
                    image_id,
                )?;

                if self.needs_global_refinement(reconstruction, mark) {
                    self.iterative_global_refinement(mapper, mapper_options)?;
                    mark = self.mark(reconstruction);
                }
            }

            if mapper.num_shared_reg_images() >= self.options.max_model_overlap {
                break;
            }
            if !reg_next_success && prev_reg_next_success {
                self.iterative_global_refinement(mapper, mapper_options)?;
            }
            if !(reg_next_success || prev_reg_next_success) {
                break;
            }
        }

        if self.is_stop_requested() {
            return Ok(SubModelStatus::Interrupted);
        }

        let current = self.mark(reconstruction);
        if current.num_reg_frames >= 2
            && current.num_reg_frames != mark.num_reg_frames
            && current.num_points3d != mark.num_points3d
        {
            self.iterative_global_refinement(mapper, mapper_options)?;
        }
        Ok(SubModelStatus::Success)
    }

    fn mark(&self, reconstruction: &SharedReconstruction) -> GlobalRefinementMark {
        let rec = reconstruction.read();
        GlobalRefinementMark {
            num_reg_frames: rec.num_reg_frames(),
            num_points3d: rec.num_points3d(),
        }
    }

    fn needs_global_refinement(&self, reconstruction: &SharedReconstruction, mark: GlobalRefinementMark) -> bool {
        let current = self.mark(reconstruction);
        let options = &self.options;
        current.num_reg_frames as f64 >= options.ba_global_frames_ratio * mark.num_reg_frames as f64
            || current.num_reg_frames >= options.ba_global_frames_freq + mark.num_reg_frames
            || current.num_points3d as f64 >= options.ba_global_points_ratio * mark.num_points3d as f64
            || current.num_points3d >= options.ba_global_points_freq + mark.num_points3d
    }

    fn iterative_global_refinement(
        &self,
        mapper: &mut IncrementalMapper,
        mapper_options: &IncrementalMapperOptions,
    ) -> Result<()> {
        info!("[Pipeline] Global refinement");
        mapper
            .iterative_global_refinement(
                self.options.ba_global_max_refinements,
                self.options.ba_global_max_refinement_change,
                mapper_options,
                &self.options.global_bundle_adjustment(),
                &self.options.triangulation,
                !mapper_options.use_prior_position,
            )
            .context("Global refinement failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{synthesize_dataset, SyntheticDatasetOptions};
    use crate::sfm::incremental_mapper::ImageSelectionMethod;

    fn synthetic_cache() -> Arc<DatabaseCache> {
        let dataset = synthesize_dataset(&SyntheticDatasetOptions::default()).unwrap();
        Arc::new(dataset.database_cache)
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = IncrementalPipelineOptions::default();
        assert!(options.check().is_ok());
        assert!(!options.is_initial_pair_provided());
        assert_eq!(options.min_model_size, 10);
        assert_eq!(options.init_num_trials, 200);
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            multiple_models = false
            ba_global_max_refinements = 3

            [mapper]
            init_min_num_inliers = 50
            image_selection_method = "MaxVisiblePointsNum"

            [triangulation]
            min_angle = 2.0
        "#;
        let options = IncrementalPipelineOptions::from_toml_str(toml).unwrap();
        assert!(!options.multiple_models);
        assert_eq!(options.ba_global_max_refinements, 3);
        assert_eq!(options.mapper.init_min_num_inliers, 50);
        assert_eq!(
            options.mapper.image_selection_method,
            ImageSelectionMethod::MaxVisiblePointsNum
        );
        assert_eq!(options.triangulation.min_angle, 2.0);
        // Untouched keys keep defaults
        assert_eq!(options.max_num_models, 50);
        assert_eq!(options.mapper.abs_pose_min_num_inliers, 30);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(IncrementalPipelineOptions::from_toml_str("multiple_models = ").is_err());
        assert!(IncrementalPipelineOptions::from_toml_str("max_num_models = 0").is_err());
        assert!(IncrementalPipelineOptions::from_toml_str("ba_global_frames_ratio = 0.5").is_err());
    }

    #[test]
    fn test_bundle_adjustment_options() {
        let options = IncrementalPipelineOptions {
            num_threads: 2,
            ba_refine_principal_point: true,
            ..Default::default()
        };
        let local = options.local_bundle_adjustment();
        assert_eq!(local.loss_function_type, LossFunctionType::SoftL1);
        assert_eq!(local.max_num_iterations, 25);
        assert_eq!(local.num_threads, 2);
        assert!(local.refine_principal_point);

        let global = options.global_bundle_adjustment();
        assert_eq!(global.loss_function_type, LossFunctionType::Trivial);
        assert_eq!(global.max_num_iterations, 50);
        assert!(global.refine_rig_from_world);
    }

    #[test]
    fn test_stop_before_run_builds_nothing() {
        let mut pipeline = IncrementalPipeline::new(IncrementalPipelineOptions::default(), synthetic_cache()).unwrap();
        let stop = pipeline.stop_handle();
        stop.store(true, Ordering::SeqCst);
        assert!(pipeline.is_stop_requested());
        pipeline.run().unwrap();
        assert!(pipeline.reconstruction_manager().is_empty());
    }

    #[test]
    fn test_unusable_initial_pair_leaves_no_model() {
        let options = IncrementalPipelineOptions {
            init_image_id1: Some(ImageId::new(1)),
            init_image_id2: Some(ImageId::new(1)),
            ..Default::default()
        };
        let mut pipeline = IncrementalPipeline::new(options, synthetic_cache()).unwrap();
        pipeline.run().unwrap();
        assert!(pipeline.reconstruction_manager().is_empty());
    }

    #[test]
    fn test_new_rejects_invalid_options() {
        let options = IncrementalPipelineOptions {
            init_num_trials: 0,
            ..Default::default()
        };
        assert!(IncrementalPipeline::new(options, synthetic_cache()).is_err());
    }
}
