//! Per-bin weighted least-squares fit of scale, width and normalisation biases.
//!
//! For one kinematic bin, over the selected mass slices:
//!
//! ```text
//! J = [jScale | jWidth | y0]         (width, norm columns optional)
//! W = diag(1/var_i)
//! A = √W·J,  b = √W·(y − y0)
//! x = argmin ‖A·x − b‖               (thin SVD)
//! C = (Jᵀ·W·J)⁻¹ = V·Σ⁻²·Vᵀ
//! ```
//!
//! A rank-deficient `A` is reported as [`FitStatus::DegenerateFit`]; no covariance is
//! fabricated for it.

use ms_core::{BinFitResult, Error, FitStatus, Histogram1D, PerBinHistograms, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::calibration::CalibrationTable;

/// How the variance of a mass slice is estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceModel {
    /// Data are counts: `var = y + σ_sim²`.
    #[default]
    CountingData,
    /// Data are another simulation sample of equal size: `var = 2·σ_sim²`.
    SimulationClosure,
}

impl VarianceModel {
    /// Counting statistics when a luminosity is configured, simulation closure otherwise.
    pub fn from_lumi(lumi: f64) -> Self {
        if lumi > 0.0 { VarianceModel::CountingData } else { VarianceModel::SimulationClosure }
    }

    /// Variance of a slice with data count `y` and simulation error `sim_err`.
    pub fn variance(self, y: f64, sim_err: f64) -> f64 {
        match self {
            VarianceModel::CountingData => y + sim_err * sim_err,
            VarianceModel::SimulationClosure => 2.0 * sim_err * sim_err,
        }
    }
}

/// Settings of [`WeightedLeastSquaresFitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// Mass histograms are rebinned by this factor before slicing (must divide the bin count).
    pub rebin: usize,
    /// A slice is used when its data count is strictly above this.
    #[serde(alias = "min_num_events_per_bin")]
    pub min_events_per_slice: f64,
    /// Minimum number of used slices.
    #[serde(alias = "min_num_mass_bins")]
    pub min_slices: usize,
    /// Fit the width parameter.
    pub fit_width: bool,
    /// Fit the normalisation parameter.
    pub fit_norm: bool,
    /// Slice variance model.
    pub variance_model: VarianceModel,
    /// Keep pre/post-fit mass snapshots of fitted bins.
    #[serde(alias = "save_mass_fit_histos")]
    pub save_mass_fits: bool,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            rebin: 2,
            min_events_per_slice: 10.0,
            min_slices: 4,
            fit_width: false,
            fit_norm: false,
            variance_model: VarianceModel::default(),
            save_mass_fits: false,
        }
    }
}

impl FitterConfig {
    /// Number of fitted parameters.
    pub fn n_params(&self) -> usize {
        1 + usize::from(self.fit_width) + usize::from(self.fit_norm)
    }
}

/// Inputs of one bin restricted to the selected mass slices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceData {
    /// Mass-axis index (after rebinning) of each slice.
    pub index: Vec<usize>,
    /// Pseudo-data counts.
    pub y: Vec<f64>,
    /// Nominal simulated counts.
    pub y0: Vec<f64>,
    /// Statistical error of `y0`.
    pub y0_err: Vec<f64>,
    /// Scale-jacobian weighted counts.
    pub j_scale: Vec<f64>,
    /// Width-jacobian weighted counts.
    pub j_width: Vec<f64>,
}

impl SliceData {
    /// Number of slices.
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// Whether no slice was selected.
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Solution of a non-degenerate fit.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    /// Parameters in column order (scale, [width], [norm]).
    pub params: Vec<f64>,
    /// Parameter covariance.
    pub covariance: DMatrix<f64>,
    /// Parameter correlation.
    pub correlation: DMatrix<f64>,
    /// `bᵀb`.
    pub chi2_before: f64,
    /// `|b − A·x|²`.
    pub chi2_after: f64,
    /// Slices minus parameters.
    pub ndof: i64,
    /// Chi-square survival probability of `chi2_after`.
    pub p_value: f64,
    /// Mass-axis index of each slice that entered the fit.
    pub used: Vec<usize>,
    /// `y0 + J·x` per used slice.
    pub postfit: Vec<f64>,
}

/// Result of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    /// Solved.
    Fitted(LinearFit),
    /// Not solved; the status says why.
    Skipped(FitStatus),
}

/// Pre- and post-fit mass distributions of one fitted bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassFitSnapshot {
    /// Linear bin id.
    pub bin: usize,
    /// Rebinned pseudo-data.
    pub data: Histogram1D,
    /// Rebinned nominal simulation.
    pub prefit: Histogram1D,
    /// Nominal simulation with `y0 + J·x` on the selected slices.
    pub postfit: Histogram1D,
}

/// Per-bin histograms feeding the fit.
#[derive(Debug, Clone, Copy)]
pub struct FitInputs<'a> {
    /// Pseudo-data mass histograms.
    pub data: &'a PerBinHistograms,
    /// Corrected-simulation mass histograms.
    pub nominal: &'a PerBinHistograms,
    /// Corrected-simulation scale-jacobian histograms.
    pub jac_scale: &'a PerBinHistograms,
    /// Corrected-simulation width-jacobian histograms.
    pub jac_width: &'a PerBinHistograms,
    /// Corrected-simulation residual histograms (for the reported mean/RMS).
    pub residual: &'a PerBinHistograms,
    /// Corrected-simulation calibration; only accepted bins are fitted.
    pub calibration: &'a CalibrationTable,
}

/// Every bin's fit outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutput {
    /// One row per bin that was accepted in calibration or received pseudo-data.
    pub rows: Vec<BinFitResult>,
    /// Snapshots of fitted bins when requested.
    pub snapshots: Vec<MassFitSnapshot>,
}

impl FitOutput {
    /// Number of rows with a given status.
    pub fn count(&self, status: FitStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }
}

/// The per-bin linearised bias fit.
#[derive(Debug, Clone, Default)]
pub struct WeightedLeastSquaresFitter {
    config: FitterConfig,
}

impl WeightedLeastSquaresFitter {
    /// Fitter with the given settings.
    pub fn new(config: FitterConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Select the slices of one bin whose data count is above threshold.
    ///
    /// All four histograms are rebinned first and must share an axis.
    pub fn select_slices(
        &self,
        data: &Histogram1D,
        nominal: &Histogram1D,
        jac_scale: &Histogram1D,
        jac_width: &Histogram1D,
    ) -> Result<SliceData> {
        let rebin = self.config.rebin.max(1);
        let data = data.rebin(rebin)?;
        let nominal = nominal.rebin(rebin)?;
        let jac_scale = jac_scale.rebin(rebin)?;
        let jac_width = jac_width.rebin(rebin)?;
        for h in [&nominal, &jac_scale, &jac_width] {
            if h.axis != data.axis {
                return Err(Error::Validation(format!(
                    "fit inputs on different axes: {:?} vs {:?}",
                    h.axis, data.axis
                )));
            }
        }

        let mut s = SliceData::default();
        for i in 0..data.axis.n_bins {
            if data.content(i) > self.config.min_events_per_slice {
                s.index.push(i);
                s.y.push(data.content(i));
                s.y0.push(nominal.content(i));
                s.y0_err.push(nominal.error(i));
                s.j_scale.push(jac_scale.content(i));
                s.j_width.push(jac_width.content(i));
            }
        }
        Ok(s)
    }

    /// Positions and inverse variances of the slices with a strictly positive variance.
    fn weighted(&self, slices: &SliceData) -> Vec<(usize, f64)> {
        (0..slices.len())
            .filter_map(|i| {
                let var = self.config.variance_model.variance(slices.y[i], slices.y0_err[i]);
                (var.is_finite() && var > 0.0).then_some((i, 1.0 / var))
            })
            .collect()
    }

    /// Solve the weighted least-squares problem on pre-selected slices.
    ///
    /// Slices whose variance is not strictly positive are dropped before counting.
    pub fn solve(&self, slices: &SliceData) -> Result<SolveOutcome> {
        let keep = self.weighted(slices);
        let n = keep.len();
        if n < self.config.min_slices {
            return Ok(SolveOutcome::Skipped(FitStatus::InsufficientStatistics));
        }
        let p = self.config.n_params();
        let ndof = n as i64 - p as i64;
        if ndof <= 0 {
            return Ok(SolveOutcome::Skipped(FitStatus::DegenerateFit));
        }

        let mut jac = DMatrix::<f64>::zeros(n, p);
        let mut sqrt_w = DVector::<f64>::zeros(n);
        let mut resid = DVector::<f64>::zeros(n);
        for (row, &(i, inv_var)) in keep.iter().enumerate() {
            let mut col = 0;
            jac[(row, col)] = slices.j_scale[i];
            if self.config.fit_width {
                col += 1;
                jac[(row, col)] = slices.j_width[i];
            }
            if self.config.fit_norm {
                col += 1;
                jac[(row, col)] = slices.y0[i];
            }
            sqrt_w[row] = inv_var.sqrt();
            resid[row] = slices.y[i] - slices.y0[i];
        }

        let a = DMatrix::from_fn(n, p, |r, c| jac[(r, c)] * sqrt_w[r]);
        let b = resid.component_mul(&sqrt_w);

        let svd = a.clone().svd(true, true);
        let sv = &svd.singular_values;
        let sv_max = sv.max();
        let sv_min = sv.min();
        if !(sv_max > 0.0) || sv_min <= sv_max * 1e-12 * n.max(p) as f64 {
            return Ok(SolveOutcome::Skipped(FitStatus::DegenerateFit));
        }
        let x = svd
            .solve(&b, sv_max * 1e-12)
            .map_err(|e| Error::Computation(format!("SVD solve: {e}")))?;

        let v_t = svd
            .v_t
            .as_ref()
            .ok_or_else(|| Error::Computation("SVD without right singular vectors".into()))?;
        let inv_sv2 = DMatrix::from_diagonal(&sv.map(|s| 1.0 / (s * s)));
        let cov = v_t.transpose() * inv_sv2 * v_t;
        if (0..p).any(|k| !(cov[(k, k)].is_finite() && cov[(k, k)] > 0.0)) {
            return Ok(SolveOutcome::Skipped(FitStatus::DegenerateFit));
        }
        let corr =
            DMatrix::from_fn(p, p, |r, c| cov[(r, c)] / (cov[(r, r)] * cov[(c, c)]).sqrt());

        let chi2_before = b.dot(&b);
        let after = &b - &a * &x;
        let chi2_after = after.dot(&after);
        let dist = ChiSquared::new(ndof as f64)
            .map_err(|e| Error::Computation(format!("chi-square distribution: {e}")))?;
        let p_value = dist.sf(chi2_after);

        let shift = &jac * &x;
        let postfit =
            keep.iter().enumerate().map(|(row, &(i, _))| slices.y0[i] + shift[row]).collect();

        Ok(SolveOutcome::Fitted(LinearFit {
            params: x.iter().copied().collect(),
            covariance: cov,
            correlation: corr,
            chi2_before,
            chi2_after,
            ndof,
            p_value,
            used: keep.iter().map(|&(i, _)| slices.index[i]).collect(),
            postfit,
        }))
    }

    /// Fit one bin from its histograms. Missing histograms count as empty.
    pub fn fit_bin(
        &self,
        bin: usize,
        inputs: &FitInputs<'_>,
    ) -> Result<(BinFitResult, Option<MassFitSnapshot>)> {
        let data = inputs.data.projection(bin);
        let residual = inputs.residual.projection(bin);
        let mut row = BinFitResult::skipped(bin, FitStatus::NotCalibrated);
        row.n_events = data.integral();
        row.residual_mean = residual.mean();
        row.residual_rms = residual.rms();
        if !inputs.calibration.is_accepted(bin) {
            return Ok((row, None));
        }

        let nominal = inputs.nominal.projection(bin);
        let slices = self.select_slices(
            &data,
            &nominal,
            &inputs.jac_scale.projection(bin),
            &inputs.jac_width.projection(bin),
        )?;

        let fit = match self.solve(&slices)? {
            SolveOutcome::Skipped(status) => {
                row.n_mass_bins = self.weighted(&slices).len();
                match status {
                    FitStatus::DegenerateFit => tracing::debug!(bin, "fit skipped: degenerate"),
                    _ => tracing::debug!(
                        bin,
                        slices = row.n_mass_bins,
                        "fit skipped: low statistics"
                    ),
                }
                row.status = status;
                return Ok((row, None));
            }
            SolveOutcome::Fitted(fit) => fit,
        };
        row.n_mass_bins = fit.used.len();

        let mut k = 1;
        row.beta = fit.params[0];
        row.beta_error = fit.covariance[(0, 0)].sqrt();
        if self.config.fit_width {
            row.alpha = fit.params[k];
            row.alpha_error = fit.covariance[(k, k)].sqrt();
            k += 1;
        }
        if self.config.fit_norm {
            row.nu = fit.params[k];
            row.nu_error = fit.covariance[(k, k)].sqrt();
        }
        row.chi2_before = fit.chi2_before;
        row.chi2_after = fit.chi2_after;
        row.ndof = fit.ndof;
        row.p_value = fit.p_value;
        let corr = fit.correlation.row_iter().map(|r| r.iter().copied().collect()).collect();
        row.correlation = Some(corr);
        row.mask = true;
        row.status = FitStatus::Fitted;

        let snapshot = if self.config.save_mass_fits {
            let rebin = self.config.rebin.max(1);
            let prefit = nominal.rebin(rebin)?;
            let mut postfit = prefit.clone();
            for (&i, &v) in fit.used.iter().zip(&fit.postfit) {
                postfit.sumw[i] = v;
            }
            Some(MassFitSnapshot { bin, data: data.rebin(rebin)?, prefit, postfit })
        } else {
            None
        };
        Ok((row, snapshot))
    }

    /// Fit every bin in parallel.
    ///
    /// Rows are produced for every bin accepted in calibration or holding pseudo-data,
    /// ordered by bin id; the rest appear only as masked entries of the summary tables.
    pub fn fit_all(&self, inputs: &FitInputs<'_>) -> Result<FitOutput> {
        let n_bins = inputs.calibration.n_bins();
        if inputs.data.n_bins != n_bins || inputs.nominal.n_bins != n_bins {
            return Err(Error::SchemaMismatch(format!(
                "fit inputs cover {}/{} bins, calibration covers {}",
                inputs.data.n_bins, inputs.nominal.n_bins, n_bins
            )));
        }
        let results = (0..n_bins)
            .into_par_iter()
            .filter(|&bin| inputs.calibration.is_accepted(bin) || inputs.data.get(bin).is_some())
            .map(|bin| self.fit_bin(bin, inputs))
            .collect::<Result<Vec<_>>>()?;

        let mut out = FitOutput { rows: Vec::with_capacity(results.len()), snapshots: Vec::new() };
        for (row, snap) in results {
            out.rows.push(row);
            out.snapshots.extend(snap);
        }
        tracing::info!(
            fitted = out.count(FitStatus::Fitted),
            insufficient_statistics = out.count(FitStatus::InsufficientStatistics),
            degenerate = out.count(FitStatus::DegenerateFit),
            not_calibrated = out.count(FitStatus::NotCalibrated),
            "mass fits done"
        );
        Ok(out)
    }
}

/// Per-bin summary tables indexed by bin id.
///
/// Unfitted bins carry value 0 and mask `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryTables {
    /// `1 + beta`.
    pub scales: Vec<f64>,
    /// Error on `scales`.
    pub scale_errors: Vec<f64>,
    /// `1 + alpha`.
    pub widths: Vec<f64>,
    /// Error on `widths`.
    pub width_errors: Vec<f64>,
    /// `1 + nu`.
    pub norms: Vec<f64>,
    /// Error on `norms`.
    pub norm_errors: Vec<f64>,
    /// Fit p-values.
    pub probs: Vec<f64>,
    /// Fit masks.
    pub masks: Vec<bool>,
}

impl SummaryTables {
    /// Dense tables over `n_bins` bins from fit rows.
    pub fn from_rows(n_bins: usize, rows: &[BinFitResult]) -> Self {
        let mut t = SummaryTables {
            scales: vec![0.0; n_bins],
            scale_errors: vec![0.0; n_bins],
            widths: vec![0.0; n_bins],
            width_errors: vec![0.0; n_bins],
            norms: vec![0.0; n_bins],
            norm_errors: vec![0.0; n_bins],
            probs: vec![0.0; n_bins],
            masks: vec![false; n_bins],
        };
        for r in rows.iter().filter(|r| r.mask && r.bin < n_bins) {
            t.scales[r.bin] = 1.0 + r.beta;
            t.scale_errors[r.bin] = r.beta_error;
            t.widths[r.bin] = 1.0 + r.alpha;
            t.width_errors[r.bin] = r.alpha_error;
            t.norms[r.bin] = 1.0 + r.nu;
            t.norm_errors[r.bin] = r.nu_error;
            t.probs[r.bin] = r.p_value;
            t.masks[r.bin] = true;
        }
        t
    }

    /// Number of fitted bins.
    pub fn n_fitted(&self) -> usize {
        self.masks.iter().filter(|&&m| m).count()
    }
}
