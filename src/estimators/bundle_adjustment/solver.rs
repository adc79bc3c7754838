//! Levenberg–Marquardt on the bundle adjustment normal equations.
//!
//! Point blocks are eliminated with the Schur complement; the reduced camera
//! system is solved densely (Cholesky, LU fallback). Linearization of the
//! residuals runs on a rayon pool for large problems.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3, RowVector3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use super::problem::{LinearizedObservation, LinearizedPrior, Problem, State};
use super::{BundleAdjustmentOptions, BundleAdjustmentSummary, TerminationType};

const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;
const MIN_DIAGONAL: f64 = 1e-6;

/// Normal equations `J^T J δ = -J^T r` split into camera and point blocks.
struct NormalEquations {
    u: DMatrix<f64>,
    g_cameras: DVector<f64>,
    v: Vec<Matrix3<f64>>,
    g_points: Vec<Vector3<f64>>,
    /// Camera-point coupling `J_c^T J_p` per variable point, keyed by column.
    w: Vec<BTreeMap<usize, RowVector3<f64>>>,
}

impl NormalEquations {
    fn new(num_camera_params: usize, num_points: usize) -> Self {
        Self {
            u: DMatrix::zeros(num_camera_params, num_camera_params),
            g_cameras: DVector::zeros(num_camera_params),
            v: vec![Matrix3::zeros(); num_points],
            g_points: vec![Vector3::zeros(); num_points],
            w: vec![BTreeMap::new(); num_points],
        }
    }

    fn add_observation(&mut self, problem: &Problem, lin: &LinearizedObservation) {
        for (i, (ci, ji)) in lin.camera_columns.iter().enumerate() {
            self.g_cameras[*ci] += ji.dot(&lin.residual);
            for (cj, jj) in &lin.camera_columns[i..] {
                let value = ji.dot(jj);
                self.u[(*ci, *cj)] += value;
                if ci != cj {
                    self.u[(*cj, *ci)] += value;
                }
            }
        }

        let (Some(jp), Some(p)) = (lin.point_jacobian, problem.points[lin.point].variable_idx) else {
            return;
        };
        self.v[p] += jp.transpose() * jp;
        self.g_points[p] += jp.transpose() * lin.residual;
        for (ci, ji) in &lin.camera_columns {
            *self.w[p].entry(*ci).or_insert_with(RowVector3::zeros) += ji.transpose() * jp;
        }
    }

    fn add_prior(&mut self, lin: &LinearizedPrior) {
        for (i, (ci, ji)) in lin.camera_columns.iter().enumerate() {
            self.g_cameras[*ci] += ji.dot(&lin.residual);
            for (cj, jj) in &lin.camera_columns[i..] {
                let value = ji.dot(jj);
                self.u[(*ci, *cj)] += value;
                if ci != cj {
                    self.u[(*cj, *ci)] += value;
                }
            }
        }
    }

    fn max_gradient(&self) -> f64 {
        let cameras = self.g_cameras.iter().fold(0.0f64, |m, g| m.max(g.abs()));
        self.g_points
            .iter()
            .flat_map(|g| g.iter())
            .fold(cameras, |m, g| m.max(g.abs()))
    }

    /// Damped step `(camera increments, point increments)`.
    fn solve(&self, lambda: f64) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
        let n = self.u.nrows();
        let mut s = self.u.clone();
        for i in 0..n {
            s[(i, i)] += lambda * self.u[(i, i)].max(MIN_DIAGONAL);
        }
        let mut b = -&self.g_cameras;

        let mut v_inv = Vec::with_capacity(self.v.len());
        for (p, v) in self.v.iter().enumerate() {
            let mut damped = *v;
            for k in 0..3 {
                damped[(k, k)] += lambda * v[(k, k)].max(MIN_DIAGONAL);
            }
            let inv = damped.try_inverse()?;
            let entries: Vec<(usize, RowVector3<f64>)> = self.w[p].iter().map(|(c, w)| (*c, *w)).collect();
            for (ci, wi) in &entries {
                let t = wi * inv;
                b[*ci] += (t * self.g_points[p])[0];
                for (cj, wj) in &entries {
                    s[(*ci, *cj)] -= (t * wj.transpose())[0];
                }
            }
            v_inv.push(inv);
        }

        let delta_cameras = if n == 0 {
            DVector::zeros(0)
        } else {
            match s.clone().cholesky() {
                Some(cholesky) => cholesky.solve(&b),
                None => s.lu().solve(&b)?,
            }
        };

        let delta_points = v_inv
            .iter()
            .enumerate()
            .map(|(p, inv)| {
                let mut rhs = -self.g_points[p];
                for (c, w) in &self.w[p] {
                    rhs -= w.transpose() * delta_cameras[*c];
                }
                inv * rhs
            })
            .collect();
        Some((delta_cameras, delta_points))
    }
}

fn linearize(
    problem: &Problem,
    state: &State,
    pool: Option<&rayon::ThreadPool>,
) -> NormalEquations {
    let linearized: Vec<LinearizedObservation> = match pool {
        Some(pool) => pool.install(|| {
            problem
                .observations
                .par_iter()
                .filter_map(|obs| problem.linearize_observation(state, obs))
                .collect()
        }),
        None => problem
            .observations
            .iter()
            .filter_map(|obs| problem.linearize_observation(state, obs))
            .collect(),
    };

    let mut normal = NormalEquations::new(problem.num_camera_params, problem.num_variable_points);
    for lin in &linearized {
        normal.add_observation(problem, lin);
    }
    for prior in &problem.priors {
        normal.add_prior(&problem.linearize_prior(state, prior));
    }
    normal
}

/// Run LM until convergence or the iteration limit.
pub(super) fn minimize(
    problem: &Problem,
    state: &mut State,
    options: &BundleAdjustmentOptions,
) -> BundleAdjustmentSummary {
    let num_residuals = problem.num_residuals();
    let mut summary = BundleAdjustmentSummary {
        termination: TerminationType::Failure,
        num_residuals,
        num_parameters: problem.num_camera_params + 3 * problem.num_variable_points,
        iterations: 0,
        initial_cost: 0.0,
        final_cost: 0.0,
    };
    if num_residuals == 0 {
        debug!("[BA] Problem has no residuals");
        return summary;
    }

    let Some(mut cost) = problem.cost(state).filter(|c| c.is_finite()) else {
        return summary;
    };
    summary.initial_cost = cost;
    summary.final_cost = cost;
    if summary.num_parameters == 0 {
        summary.termination = TerminationType::Convergence;
        return summary;
    }

    let pool = if num_residuals >= options.min_num_residuals_for_multi_threading {
        rayon::ThreadPoolBuilder::new()
            .num_threads(options.effective_num_threads())
            .build()
            .ok()
    } else {
        None
    };

    let mut lambda = INITIAL_LAMBDA;
    let mut normal = linearize(problem, state, pool.as_ref());
    summary.termination = TerminationType::NoConvergence;

    for iter in 0..options.max_num_iterations {
        summary.iterations = iter + 1;

        if normal.max_gradient() <= options.gradient_tolerance {
            summary.termination = TerminationType::Convergence;
            break;
        }

        let Some((delta_cameras, delta_points)) = normal.solve(lambda) else {
            lambda *= LAMBDA_UP;
            if lambda > MAX_LAMBDA {
                summary.termination = TerminationType::Failure;
                break;
            }
            continue;
        };

        let step_norm_sq = delta_cameras.norm_squared()
            + delta_points.iter().map(|d| d.norm_squared()).sum::<f64>();
        let x_norm = problem.parameter_norm(state);
        if step_norm_sq.sqrt() <= options.parameter_tolerance * (x_norm + options.parameter_tolerance) {
            summary.termination = TerminationType::Convergence;
            break;
        }

        let trial = problem.retract(state, delta_cameras.as_slice(), &delta_points);
        match problem.cost(&trial).filter(|c| c.is_finite() && *c < cost) {
            Some(trial_cost) => {
                let relative_decrease = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                *state = trial;
                cost = trial_cost;
                lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
                if relative_decrease <= options.function_tolerance {
                    summary.termination = TerminationType::Convergence;
                    break;
                }
                normal = linearize(problem, state, pool.as_ref());
            }
            None => {
                lambda *= LAMBDA_UP;
                if lambda > MAX_LAMBDA {
                    // No damping yields a decrease: local minimum.
                    summary.termination = TerminationType::Convergence;
                    break;
                }
            }
        }
    }

    summary.final_cost = cost;
    summary
}
