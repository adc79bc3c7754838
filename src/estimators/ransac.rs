//! Generic locally optimized RANSAC.
//!
//! An [`Estimator`] provides minimal-sample model fitting and per-sample
//! squared residuals. [`ransac`] draws random minimal samples, scores every
//! hypothesis by its inlier support, re-fits the best hypothesis on its inliers
//! (local optimization) and adapts the number of trials to the observed inlier
//! ratio.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{check_option, Result};

/// Number of local optimization rounds per improved hypothesis.
const MAX_LOCAL_ITERATIONS: usize = 10;

/// Model fitting used inside [`ransac`].
pub trait Estimator {
    type Sample: Clone;
    type Model: Clone;

    /// Number of samples needed to fit a model.
    fn min_num_samples(&self) -> usize;

    /// Fit zero or more candidate models to the given samples.
    fn estimate(&self, samples: &[Self::Sample]) -> Vec<Self::Model>;

    /// Squared residual of every sample under `model`.
    fn residuals(&self, samples: &[Self::Sample], model: &Self::Model) -> Vec<f64>;

    /// Non-minimal refit on an inlier set. The default fits with the minimal
    /// solver on all inliers.
    fn local_estimate(&self, inliers: &[Self::Sample], _model: &Self::Model) -> Vec<Self::Model> {
        self.estimate(inliers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacOptions {
    /// Maximum residual (not squared) of an inlier.
    pub max_error: f64,
    /// Minimum inlier ratio for the final model to be accepted.
    pub min_inlier_ratio: f64,
    /// Confidence that at least one outlier-free sample was drawn.
    pub confidence: f64,
    /// Multiplier on the adaptive trial count.
    pub dyn_num_trials_multiplier: f64,
    pub min_num_trials: usize,
    pub max_num_trials: usize,
    /// Seed for the sampler; `None` seeds from entropy.
    pub random_seed: Option<u64>,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_error: 4.0,
            min_inlier_ratio: 0.1,
            confidence: 0.99,
            dyn_num_trials_multiplier: 3.0,
            min_num_trials: 0,
            max_num_trials: 10_000,
            random_seed: None,
        }
    }
}

impl RansacOptions {
    pub fn check(&self) -> Result<()> {
        check_option(self.max_error > 0.0, "max_error must be positive")?;
        check_option(
            (0.0..=1.0).contains(&self.min_inlier_ratio),
            "min_inlier_ratio must be in [0, 1]",
        )?;
        check_option(
            (0.0..=1.0).contains(&self.confidence),
            "confidence must be in [0, 1]",
        )?;
        check_option(
            self.dyn_num_trials_multiplier > 0.0,
            "dyn_num_trials_multiplier must be positive",
        )?;
        check_option(
            self.max_num_trials >= self.min_num_trials,
            "max_num_trials must not be below min_num_trials",
        )
    }
}

/// Best model with its consensus set.
#[derive(Debug, Clone)]
pub struct RansacReport<M> {
    pub model: M,
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
    pub num_trials: usize,
}

impl<M> RansacReport<M> {
    /// Indices of the inlier samples.
    pub fn inlier_indices(&self) -> Vec<usize> {
        self.inlier_mask
            .iter()
            .enumerate()
            .filter(|(_, inlier)| **inlier)
            .map(|(idx, _)| idx)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Support {
    num_inliers: usize,
    residual_sum: f64,
}

impl Support {
    fn evaluate(residuals: &[f64], max_squared_error: f64) -> Self {
        let mut support = Support {
            num_inliers: 0,
            residual_sum: 0.0,
        };
        for &r in residuals {
            if r <= max_squared_error {
                support.num_inliers += 1;
                support.residual_sum += r;
            }
        }
        support
    }

    fn is_better_than(&self, other: &Support) -> bool {
        self.num_inliers > other.num_inliers
            || (self.num_inliers == other.num_inliers && self.residual_sum < other.residual_sum)
    }
}

/// Number of trials needed to draw one outlier-free sample with the given
/// confidence: `ln(1 - p) / ln(1 - w^n)`.
pub fn compute_num_trials(
    num_inliers: usize,
    num_samples: usize,
    min_num_samples: usize,
    confidence: f64,
    multiplier: f64,
) -> usize {
    if num_samples == 0 {
        return usize::MAX;
    }
    let inlier_ratio = num_inliers as f64 / num_samples as f64;
    let nom = 1.0 - confidence;
    if nom <= 0.0 {
        return usize::MAX;
    }
    let denom = 1.0 - inlier_ratio.powi(min_num_samples as i32);
    if denom <= 0.0 {
        return 1;
    }
    if (denom - 1.0).abs() < f64::EPSILON {
        return usize::MAX;
    }
    let k = (nom.ln() / denom.ln() * multiplier).ceil();
    if k >= usize::MAX as f64 {
        usize::MAX
    } else {
        (k as usize).max(1)
    }
}

pub(crate) fn make_rng(random_seed: Option<u64>) -> StdRng {
    match random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Robustly fit a model with locally optimized RANSAC.
///
/// # Returns
/// * `None` if there are too few samples, no hypothesis was found or the
///   best model's inlier ratio is below `min_inlier_ratio`
pub fn ransac<E: Estimator>(
    estimator: &E,
    samples: &[E::Sample],
    options: &RansacOptions,
) -> Option<RansacReport<E::Model>> {
    let num_samples = samples.len();
    let min_num_samples = estimator.min_num_samples();
    if num_samples < min_num_samples || min_num_samples == 0 {
        return None;
    }

    let max_squared_error = options.max_error * options.max_error;
    let mut rng = make_rng(options.random_seed);

    let mut best: Option<(E::Model, Support)> = None;
    let mut dyn_max_num_trials = options.max_num_trials;
    let mut num_trials = 0;

    while num_trials < options.max_num_trials {
        if num_trials >= dyn_max_num_trials && num_trials >= options.min_num_trials {
            break;
        }
        num_trials += 1;

        let subset: Vec<E::Sample> = index::sample(&mut rng, num_samples, min_num_samples)
            .into_iter()
            .map(|i| samples[i].clone())
            .collect();

        for model in estimator.estimate(&subset) {
            let support = Support::evaluate(&estimator.residuals(samples, &model), max_squared_error);
            let improves = best
                .as_ref()
                .map_or(true, |(_, best_support)| support.is_better_than(best_support));
            if !improves {
                continue;
            }

            let (model, support) =
                local_optimize(estimator, samples, model, support, max_squared_error);
            best = Some((model, support));

            dyn_max_num_trials = compute_num_trials(
                support.num_inliers,
                num_samples,
                min_num_samples,
                options.confidence,
                options.dyn_num_trials_multiplier,
            )
            .min(options.max_num_trials);
        }

        // All samples are inliers, nothing left to find.
        if best
            .as_ref()
            .is_some_and(|(_, support)| support.num_inliers == num_samples)
            && num_trials >= options.min_num_trials
        {
            break;
        }
    }

    let (model, support) = best?;
    let inlier_ratio = support.num_inliers as f64 / num_samples as f64;
    if support.num_inliers < min_num_samples || inlier_ratio < options.min_inlier_ratio {
        return None;
    }

    let inlier_mask: Vec<bool> = estimator
        .residuals(samples, &model)
        .iter()
        .map(|r| *r <= max_squared_error)
        .collect();
    let num_inliers = inlier_mask.iter().filter(|m| **m).count();
    Some(RansacReport {
        model,
        inlier_mask,
        num_inliers,
        num_trials,
    })
}

/// Refit on the consensus set while the support keeps improving.
fn local_optimize<E: Estimator>(
    estimator: &E,
    samples: &[E::Sample],
    mut model: E::Model,
    mut support: Support,
    max_squared_error: f64,
) -> (E::Model, Support) {
    for _ in 0..MAX_LOCAL_ITERATIONS {
        if support.num_inliers < estimator.min_num_samples() {
            break;
        }
        let residuals = estimator.residuals(samples, &model);
        let inliers: Vec<E::Sample> = samples
            .iter()
            .zip(&residuals)
            .filter(|(_, r)| **r <= max_squared_error)
            .map(|(s, _)| s.clone())
            .collect();

        let mut improved = false;
        for candidate in estimator.local_estimate(&inliers, &model) {
            let candidate_support =
                Support::evaluate(&estimator.residuals(samples, &candidate), max_squared_error);
            if candidate_support.is_better_than(&support) {
                model = candidate;
                support = candidate_support;
                improved = true;
            }
        }
        if !improved {
            break;
        }
    }
    (model, support)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Line y = a x + b through two points.
    struct LineEstimator;

    impl Estimator for LineEstimator {
        type Sample = (f64, f64);
        type Model = (f64, f64);

        fn min_num_samples(&self) -> usize {
            2
        }

        fn estimate(&self, samples: &[(f64, f64)]) -> Vec<(f64, f64)> {
            let n = samples.len() as f64;
            let sx: f64 = samples.iter().map(|s| s.0).sum();
            let sy: f64 = samples.iter().map(|s| s.1).sum();
            let sxx: f64 = samples.iter().map(|s| s.0 * s.0).sum();
            let sxy: f64 = samples.iter().map(|s| s.0 * s.1).sum();
            let det = n * sxx - sx * sx;
            if det.abs() < 1e-12 {
                return Vec::new();
            }
            let a = (n * sxy - sx * sy) / det;
            vec![(a, (sy - a * sx) / n)]
        }

        fn residuals(&self, samples: &[(f64, f64)], model: &(f64, f64)) -> Vec<f64> {
            samples
                .iter()
                .map(|(x, y)| (y - (model.0 * x + model.1)).powi(2))
                .collect()
        }
    }

    #[test]
    fn test_line_with_outliers() {
        let mut samples: Vec<(f64, f64)> = (0..40).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        for i in 0..10 {
            samples.push((i as f64, 100.0 + 7.0 * i as f64));
        }
        let options = RansacOptions {
            max_error: 0.5,
            random_seed: Some(3),
            ..Default::default()
        };

        let report = ransac(&LineEstimator, &samples, &options).unwrap();
        assert_eq!(report.num_inliers, 40);
        assert_relative_eq!(report.model.0, 2.0, epsilon = 1e-9);
        assert_relative_eq!(report.model.1, 1.0, epsilon = 1e-9);
        assert!(!report.inlier_mask[45]);
    }

    #[test]
    fn test_too_few_samples() {
        let options = RansacOptions::default();
        assert!(ransac(&LineEstimator, &[(0.0, 0.0)], &options).is_none());
    }

    #[test]
    fn test_min_inlier_ratio_rejects() {
        let samples = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 50.0), (3.0, -40.0), (4.0, 90.0)];
        let options = RansacOptions {
            max_error: 0.1,
            min_inlier_ratio: 0.9,
            random_seed: Some(1),
            ..Default::default()
        };
        assert!(ransac(&LineEstimator, &samples, &options).is_none());
    }

    #[test]
    fn test_num_trials() {
        assert_eq!(compute_num_trials(10, 10, 3, 0.99, 1.0), 1);
        assert_eq!(compute_num_trials(0, 10, 3, 0.99, 1.0), usize::MAX);
        // w = 0.5, n = 2: ln(0.01) / ln(0.75) = 16.0078
        assert_eq!(compute_num_trials(5, 10, 2, 0.99, 1.0), 17);
    }
}
