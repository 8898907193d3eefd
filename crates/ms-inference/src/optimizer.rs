//! Bounded quasi-Newton minimisation on top of argmin.
//!
//! Bounds are enforced by clamping every trial point and projecting the gradient
//! at active bounds. The same module provides the curvature helpers used to turn
//! a minimum into parameter uncertainties.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ms_core::{Error, Result};
use nalgebra::DMatrix;

/// Settings for [`BoundedLbfgs`].
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Iteration cap.
    pub max_iter: u64,
    /// Gradient-norm tolerance.
    pub tol: f64,
    /// History length of the inverse-Hessian approximation.
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 500, tol: 1e-7, m: 7 }
    }
}

/// Outcome of one minimisation.
///
/// `parameters` always holds the best point seen, converged or not.
#[derive(Debug, Clone)]
pub struct Minimum {
    /// Best parameters (inside bounds).
    pub parameters: Vec<f64>,
    /// Objective at `parameters`.
    pub fval: f64,
    /// Iterations performed.
    pub n_iter: u64,
    /// Objective evaluations.
    pub n_fev: usize,
    /// Whether the solver reported convergence.
    pub converged: bool,
    /// Termination reason as reported by the solver.
    pub message: String,
}

/// Objective with an optional analytic gradient.
pub trait Objective: Send + Sync {
    /// Value at `params`.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at `params`; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut shifted = params.to_vec();
        for i in 0..params.len() {
            let h = 1e-7 * params[i].abs().max(1.0);
            shifted[i] = params[i] + h;
            let up = self.eval(&shifted)?;
            shifted[i] = params[i] - h;
            let down = self.eval(&shifted)?;
            shifted[i] = params[i];
            grad[i] = (up - down) / (2.0 * h);
        }
        Ok(grad)
    }
}

fn clamp(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

struct Problem<'a> {
    objective: &'a dyn Objective,
    bounds: &'a [(f64, f64)],
    n_fev: Arc<AtomicUsize>,
}

impl CostFunction for Problem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.n_fev.fetch_add(1, Ordering::Relaxed);
        self.objective
            .eval(&clamp(params, self.bounds))
            .map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

impl Gradient for Problem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        let x = clamp(params, self.bounds);
        let mut g =
            self.objective.gradient(&x).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        // Zero components that push past an active bound.
        for (gi, (&xi, &(lo, hi))) in g.iter_mut().zip(x.iter().zip(self.bounds)) {
            if (xi <= lo + 1e-12 && *gi > 0.0) || (xi >= hi - 1e-12 && *gi < 0.0) {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS with box constraints by clamping.
#[derive(Debug, Clone, Default)]
pub struct BoundedLbfgs {
    config: OptimizerConfig,
}

impl BoundedLbfgs {
    /// Optimizer with the given settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimise `objective` from `init` inside `bounds`.
    ///
    /// Hitting the iteration cap is not an error: the best point is returned with
    /// `converged = false`.
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<Minimum> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "{} initial values for {} bounds",
                init.len(),
                bounds.len()
            )));
        }
        let start = clamp(init, bounds);
        let n_fev = Arc::new(AtomicUsize::new(0));
        let problem = Problem { objective, bounds, n_fev: n_fev.clone() };

        let tol_cost = (0.1 * self.config.tol).max(1e-14);
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(tol_cost))
            .map_err(|e| Error::Configuration(format!("optimizer tolerance: {e}")))?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start.clone()).max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("minimisation failed: {e}")))?;

        let state = res.state();
        let best = state.get_best_param().map(|p| clamp(p, bounds)).unwrap_or(start);
        let converged = matches!(
            state.get_termination_status(),
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );
        Ok(Minimum {
            fval: state.get_best_cost(),
            parameters: best,
            n_iter: state.get_iter(),
            n_fev: n_fev.load(Ordering::Relaxed),
            converged,
            message: state.get_termination_status().to_string(),
        })
    }
}

/// Symmetrised Hessian from forward differences of the gradient.
pub fn hessian(objective: &dyn Objective, at: &[f64]) -> Result<DMatrix<f64>> {
    let n = at.len();
    let g0 = objective.gradient(at)?;
    let mut h = DMatrix::zeros(n, n);
    let mut shifted = at.to_vec();
    for j in 0..n {
        let step = 1e-5 * at[j].abs().max(1.0);
        shifted[j] = at[j] + step;
        let g = objective.gradient(&shifted)?;
        shifted[j] = at[j];
        for i in 0..n {
            h[(i, j)] = (g[i] - g0[i]) / step;
        }
    }
    let ht = h.transpose();
    Ok((h + ht) * 0.5)
}

/// Inverse of a positive-definite matrix by Cholesky, adding diagonal damping when needed.
///
/// `None` when no damping up to the attempt limit yields finite positive variances.
pub fn damped_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = m.nrows();
    let scale = (0..n).map(|i| m[(i, i)].abs()).fold(0.0_f64, f64::max).max(1e-300);
    let mut work = m.clone();
    let mut damping = 0.0_f64;
    for _ in 0..10 {
        if let Some(chol) = work.clone().cholesky() {
            let inv = chol.inverse();
            if (0..n).all(|i| inv[(i, i)].is_finite() && inv[(i, i)] > 0.0) {
                return Some(inv);
            }
        }
        let next = if damping == 0.0 { scale * 1e-9 } else { damping * 10.0 };
        for i in 0..n {
            work[(i, i)] += next - damping;
        }
        damping = next;
    }
    None
}
