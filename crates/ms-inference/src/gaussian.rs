//! Chi-square fit of a Gaussian shape to a weighted histogram.
//!
//! Model for bin `i` with centre `x_i` and width `w`:
//!
//! ```text
//! f_i = A·w / (√(2π)·σ) · exp(−½·(x_i − μ)²/σ²)
//! ```
//!
//! Bins with zero error do not contribute. Uncertainties come from the inverse
//! curvature of the chi-square at the minimum, `cov = 2·H⁻¹`.

use ms_core::{Histogram1D, Result};

use crate::optimizer::{BoundedLbfgs, Objective, OptimizerConfig, damped_inverse, hessian};

const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Fitted Gaussian parameters and their uncertainties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    /// Normalisation (number of entries under the curve).
    pub amplitude: f64,
    /// Mean.
    pub mean: f64,
    /// Uncertainty on the mean (0 when the curvature is not invertible).
    pub mean_error: f64,
    /// Width, always reported non-negative.
    pub sigma: f64,
    /// Uncertainty on the width.
    pub sigma_error: f64,
    /// Chi-square at the returned point.
    pub chi2: f64,
    /// Bins used minus three.
    pub ndf: i64,
    /// Whether the optimizer converged.
    pub converged: bool,
}

struct Point {
    x: f64,
    y: f64,
    inv_var: f64,
}

struct GaussChi2 {
    points: Vec<Point>,
    width: f64,
}

impl GaussChi2 {
    fn model(&self, p: &[f64], x: f64) -> f64 {
        let z = (x - p[1]) / p[2];
        p[0] * self.width * INV_SQRT_2PI / p[2] * (-0.5 * z * z).exp()
    }
}

impl Objective for GaussChi2 {
    fn eval(&self, p: &[f64]) -> Result<f64> {
        Ok(self
            .points
            .iter()
            .map(|pt| {
                let r = pt.y - self.model(p, pt.x);
                r * r * pt.inv_var
            })
            .sum())
    }

    fn gradient(&self, p: &[f64]) -> Result<Vec<f64>> {
        let (amp, mu, sigma) = (p[0], p[1], p[2]);
        let mut g = vec![0.0; 3];
        for pt in &self.points {
            let z = (pt.x - mu) / sigma;
            let f = self.model(p, pt.x);
            let w = -2.0 * (pt.y - f) * pt.inv_var;
            if amp != 0.0 {
                g[0] += w * f / amp;
            } else {
                g[0] += w * self.width * INV_SQRT_2PI / sigma * (-0.5 * z * z).exp();
            }
            g[1] += w * f * z / sigma;
            g[2] += w * f * (z * z - 1.0) / sigma;
        }
        Ok(g)
    }
}

/// Gaussian fitter over an optional symmetric window around zero.
#[derive(Debug, Clone, Default)]
pub struct GaussianFitter {
    optimizer: BoundedLbfgs,
}

impl GaussianFitter {
    /// Fitter with explicit optimizer settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { optimizer: BoundedLbfgs::new(config) }
    }

    /// Fit `hist` using bins whose centre lies in `[lo, hi]`.
    ///
    /// Starts from the histogram integral, mean and RMS. A non-converged minimisation
    /// still returns the best point found; only objective failures are errors.
    pub fn fit(&self, hist: &Histogram1D, lo: f64, hi: f64) -> Result<GaussianFit> {
        let axis = hist.axis;
        let points: Vec<Point> = (0..axis.n_bins)
            .filter_map(|i| {
                let x = axis.center(i);
                let var = hist.sumw2[i];
                let inside = x >= lo && x <= hi && var > 0.0;
                inside.then(|| Point { x, y: hist.sumw[i], inv_var: 1.0 / var })
            })
            .collect();

        let integral = hist.integral();
        let init = [integral, hist.mean(), hist.rms().max(0.25 * axis.width())];
        let mut result = GaussianFit {
            amplitude: init[0],
            mean: init[1],
            mean_error: 0.0,
            sigma: init[2],
            sigma_error: 0.0,
            chi2: 0.0,
            ndf: points.len() as i64 - 3,
            converged: false,
        };
        if points.is_empty() {
            return Ok(result);
        }

        let objective = GaussChi2 { points, width: axis.width() };
        let span = axis.high - axis.low;
        let bounds = [
            (0.0, 10.0 * integral.abs().max(1.0)),
            (axis.low, axis.high),
            (1e-3 * axis.width(), span),
        ];
        let min = self.optimizer.minimize(&objective, &init, &bounds)?;
        let p = &min.parameters;
        result.amplitude = p[0];
        result.mean = p[1];
        result.sigma = p[2].abs();
        result.chi2 = min.fval;
        result.converged = min.converged;

        if let Some(cov) = damped_inverse(&hessian(&objective, p)?) {
            result.mean_error = (2.0 * cov[(1, 1)]).sqrt();
            result.sigma_error = (2.0 * cov[(2, 2)]).sqrt();
        }
        Ok(result)
    }
}

/// Fit window `[−n·rms, +n·rms]` clipped to the axis, or the whole axis when `n_rms <= 0`.
pub fn fit_window(hist: &Histogram1D, n_rms: f64) -> (f64, f64) {
    let axis = hist.axis;
    if n_rms > 0.0 {
        let half = n_rms * hist.rms();
        ((-half).max(axis.low), half.min(axis.high))
    } else {
        (axis.low, axis.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_core::Axis;

    fn gaussian_histogram(n: f64, mu: f64, sigma: f64) -> Histogram1D {
        let axis = Axis::residual();
        let contents: Vec<f64> = (0..axis.n_bins)
            .map(|i| {
                let z = (axis.center(i) - mu) / sigma;
                n * axis.width() * INV_SQRT_2PI / sigma * (-0.5 * z * z).exp()
            })
            .collect();
        let errors = contents.iter().map(|c: &f64| c.max(1.0).sqrt()).collect();
        Histogram1D::from_contents(axis, contents, errors).unwrap()
    }

    #[test]
    fn test_recovers_exact_shape() {
        let h = gaussian_histogram(10_000.0, 0.4, 1.5);
        let fit = GaussianFitter::default().fit(&h, -6.0, 6.0).unwrap();
        assert_relative_eq!(fit.mean, 0.4, epsilon = 1e-3);
        assert_relative_eq!(fit.sigma, 1.5, epsilon = 1e-3);
        assert!(fit.mean_error > 0.0 && fit.mean_error < 0.1);
        assert!(fit.sigma_error > 0.0);
    }

    #[test]
    fn test_window_restricts_points() {
        let h = gaussian_histogram(10_000.0, 0.0, 1.0);
        let (lo, hi) = fit_window(&h, 2.0);
        assert!(lo > -6.0 && hi < 6.0);
        assert_relative_eq!(lo, -hi);
        let fit = GaussianFitter::default().fit(&h, lo, hi).unwrap();
        assert_relative_eq!(fit.sigma, 1.0, epsilon = 1e-2);
        assert_eq!(fit_window(&h, -1.0), (-6.0, 6.0));
    }

    #[test]
    fn test_empty_histogram_returns_start_values() {
        let h = Histogram1D::new(Axis::residual());
        let fit = GaussianFitter::default().fit(&h, -6.0, 6.0).unwrap();
        assert!(!fit.converged);
        assert_eq!(fit.mean, 0.0);
        assert_eq!(fit.mean_error, 0.0);
    }
}
