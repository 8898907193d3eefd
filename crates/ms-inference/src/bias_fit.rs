//! Projection of per-bin scale and width biases onto per-η bias coefficients.
//!
//! Each fitted bin constrains the average of its two legs:
//!
//! ```text
//! beta  ≈ ½·[(A_i + e_i·k+ − M_i/k+) + (A_j + e_j·k− + M_j/k−)]
//! alpha ≈ ¼·[(c_i + d_i·k+) + (c_j + d_j·k−)]
//! ```
//!
//! with `i`, `j` the η slots of the positive and negative leg and `k±` the
//! representative curvature of each leg's momentum slot. The systems are solved
//! by weighted least squares with weights `1/error²`; unconstrained directions
//! resolve to zero through the SVD pseudo-inverse.

use ms_core::{BiasCoefficient, BiasVector, BinFitResult, Error, KinematicBinner, Result};
use nalgebra::{DMatrix, DVector};

/// Coefficients extracted from one set of fit rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedBias {
    /// Fitted coefficients (resolution terms are zero unless widths were fitted).
    pub fitted: BiasVector,
    /// Number of bins used.
    pub n_bins_used: usize,
    /// Weighted residual sum of squares of the scale system.
    pub chi2_scale: f64,
}

/// One constraint: sparse `(column, coefficient)` terms, measured value and its error.
type Constraint = (Vec<(usize, f64)>, f64, f64);

fn weighted_solve(rows: &[Constraint], n_cols: usize) -> Result<(Vec<f64>, f64)> {
    let n = rows.len();
    let mut a = DMatrix::<f64>::zeros(n, n_cols);
    let mut b = DVector::<f64>::zeros(n);
    for (r, (terms, value, error)) in rows.iter().enumerate() {
        let w = 1.0 / error;
        for &(c, coef) in terms {
            a[(r, c)] += coef * w;
        }
        b[r] = value * w;
    }
    let svd = a.clone().svd(true, true);
    let eps = svd.singular_values.max() * 1e-10;
    let x = svd.solve(&b, eps).map_err(|e| Error::Computation(format!("bias projection: {e}")))?;
    let r = &b - &a * &x;
    Ok((x.iter().copied().collect(), r.dot(&r)))
}

/// Project fitted per-bin biases onto per-η coefficients.
///
/// Rows that are masked, out of range or have a non-positive error are ignored.
/// With no usable row the result is all zeros.
pub fn extract_bias(
    binner: &KinematicBinner,
    rows: &[BinFitResult],
    with_width: bool,
) -> Result<ExtractedBias> {
    let ne = binner.n_eta_bins();
    let mut fitted = BiasVector::zeros(ne);

    let mut scale_rows: Vec<Constraint> = Vec::new();
    let mut width_rows: Vec<Constraint> = Vec::new();
    for row in rows.iter().filter(|r| r.mask && r.beta_error > 0.0) {
        let Some(idx) = binner.decode(row.bin) else {
            continue;
        };
        let kp = binner.representative_curvature(idx.pt_plus);
        let km = binner.representative_curvature(idx.pt_minus);
        let (i, j) = (idx.eta_plus, idx.eta_minus);
        scale_rows.push((
            vec![
                (i, 0.5),
                (ne + i, 0.5 * kp),
                (2 * ne + i, -0.5 / kp),
                (j, 0.5),
                (ne + j, 0.5 * km),
                (2 * ne + j, 0.5 / km),
            ],
            row.beta,
            row.beta_error,
        ));
        if with_width && row.alpha_error > 0.0 {
            width_rows.push((
                vec![(i, 0.25), (ne + i, 0.25 * kp), (j, 0.25), (ne + j, 0.25 * km)],
                row.alpha,
                row.alpha_error,
            ));
        }
    }

    if scale_rows.is_empty() {
        tracing::warn!("no fitted bins; bias coefficients left at zero");
        return Ok(ExtractedBias { fitted, n_bins_used: 0, chi2_scale: 0.0 });
    }

    let (x, chi2_scale) = weighted_solve(&scale_rows, 3 * ne)?;
    let scale_coefs = [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M];
    for (k, coef) in scale_coefs.into_iter().enumerate() {
        fitted.get_mut(coef).copy_from_slice(&x[k * ne..(k + 1) * ne]);
    }
    if !width_rows.is_empty() {
        let (x, _) = weighted_solve(&width_rows, 2 * ne)?;
        fitted.c.copy_from_slice(&x[..ne]);
        fitted.d.copy_from_slice(&x[ne..]);
    }

    tracing::info!(bins = scale_rows.len(), chi2 = chi2_scale, "bias coefficients extracted");
    Ok(ExtractedBias { fitted, n_bins_used: scale_rows.len(), chi2_scale })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_core::{FitStatus, KinematicIndex};

    fn row(bin: usize, beta: f64) -> BinFitResult {
        let mut r = BinFitResult::skipped(bin, FitStatus::Fitted);
        r.beta = beta;
        r.beta_error = 1e-4;
        r.mask = true;
        r
    }

    #[test]
    fn test_recovers_uniform_a() {
        let binner = KinematicBinner::new(vec![-1.0, 0.0, 1.0], vec![25.0, 35.0, 55.0]).unwrap();
        let mut truth = BiasVector::zeros(2);
        truth.a = vec![1e-3, -2e-3];
        truth.e = vec![0.01, 0.02];
        truth.m = vec![1e-5, -1e-5];
        let rows: Vec<BinFitResult> = (0..binner.n_bins())
            .map(|bin| {
                let idx: KinematicIndex = binner.decode(bin).unwrap();
                let kp = binner.representative_curvature(idx.pt_plus);
                let km = binner.representative_curvature(idx.pt_minus);
                let plus = truth.curvature_scale(idx.eta_plus, kp, true) - 1.0;
                let minus = truth.curvature_scale(idx.eta_minus, km, false) - 1.0;
                row(bin, 0.5 * (plus + minus))
            })
            .collect();
        let out = extract_bias(&binner, &rows, false).unwrap();
        assert_eq!(out.n_bins_used, 16);
        assert!(out.chi2_scale < 1e-12);
        for s in 0..2 {
            assert_relative_eq!(out.fitted.a[s], truth.a[s], epsilon = 1e-9);
            assert_relative_eq!(out.fitted.e[s], truth.e[s], epsilon = 1e-7);
            assert_relative_eq!(out.fitted.m[s], truth.m[s], epsilon = 1e-9);
        }
        assert_eq!(out.fitted.c, vec![0.0; 2]);
    }

    #[test]
    fn test_no_rows_gives_zeros() {
        let binner = KinematicBinner::default();
        let mut masked = row(3, 0.1);
        masked.mask = false;
        let out = extract_bias(&binner, &[masked], true).unwrap();
        assert_eq!(out.n_bins_used, 0);
        assert_eq!(out.fitted, BiasVector::zeros(24));
    }
}
