//! Per-bin Gaussian calibration of the reconstructed-minus-truth mass residual.

use ms_core::{
    CalibrationEntry, CalibrationStatus, Error, Histogram1D, PerBinHistograms, Result, Variant,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::gaussian::{GaussianFitter, fit_window};
use crate::optimizer::OptimizerConfig;

/// Acceptance thresholds and fit window for [`PerBinCalibrator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Both the mass and the residual histogram need strictly more than this many entries.
    pub min_num_events: f64,
    /// Fit window half-width in units of the residual RMS; `<= 0` fits the full axis.
    pub n_rms_for_gaus_fit: f64,
    /// Reject bins whose fitted width exceeds this value; `<= 0` disables the cut.
    pub max_rms: f64,
    /// Open interval the mean reconstructed mass must fall in.
    pub mass_window: (f64, f64),
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_num_events: 100.0,
            n_rms_for_gaus_fit: -1.0,
            max_rms: -1.0,
            mass_window: (75.0, 105.0),
        }
    }
}

/// Dense calibration table of one variant, indexed by linear bin id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Variant whose residuals were calibrated.
    pub variant: Variant,
    /// One entry per valid bin.
    pub entries: Vec<CalibrationEntry>,
}

impl CalibrationTable {
    /// Number of bins covered.
    pub fn n_bins(&self) -> usize {
        self.entries.len()
    }

    /// Entry of `bin`; `None` for the invalid id.
    pub fn get(&self, bin: usize) -> Option<&CalibrationEntry> {
        self.entries.get(bin)
    }

    /// `(mean, rms)` used by the jacobian weights; zeros outside the table.
    pub fn delta_sigma(&self, bin: usize) -> (f64, f64) {
        self.get(bin).map_or((0.0, 0.0), |e| (e.mean, e.rms))
    }

    /// Whether `bin` was accepted.
    pub fn is_accepted(&self, bin: usize) -> bool {
        self.get(bin).is_some_and(|e| e.mask)
    }

    /// Number of bins with a given status.
    pub fn count(&self, status: CalibrationStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Number of accepted bins.
    pub fn n_accepted(&self) -> usize {
        self.entries.iter().filter(|e| e.mask).count()
    }
}

/// Calibrates every bin of one variant independently.
#[derive(Debug, Clone, Default)]
pub struct PerBinCalibrator {
    config: CalibrationConfig,
    fitter: GaussianFitter,
}

impl PerBinCalibrator {
    /// Calibrator with the given thresholds and default optimizer settings.
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config, fitter: GaussianFitter::default() }
    }

    /// Calibrator with explicit optimizer settings.
    pub fn with_optimizer(config: CalibrationConfig, optimizer: OptimizerConfig) -> Self {
        Self { config, fitter: GaussianFitter::new(optimizer) }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrate all bins of `variant` from its mass and residual histograms.
    pub fn calibrate(
        &self,
        variant: Variant,
        mass: &PerBinHistograms,
        residual: &PerBinHistograms,
    ) -> Result<CalibrationTable> {
        if mass.n_bins != residual.n_bins {
            return Err(Error::Validation(format!(
                "mass and residual histograms cover {} and {} bins",
                mass.n_bins, residual.n_bins
            )));
        }
        let entries = (0..mass.n_bins)
            .into_par_iter()
            .map(|bin| self.calibrate_bin(bin, mass.get(bin), residual.get(bin)))
            .collect::<Result<Vec<_>>>()?;
        let table = CalibrationTable { variant, entries };

        tracing::info!(
            variant = %variant,
            accepted = table.n_accepted(),
            low_statistics = table.count(CalibrationStatus::LowStatistics),
            outside_window = table.count(CalibrationStatus::OutsideMassWindow),
            rms_too_large = table.count(CalibrationStatus::RmsTooLarge),
            "calibration done"
        );
        Ok(table)
    }

    /// Calibrate one bin.
    pub fn calibrate_bin(
        &self,
        bin: usize,
        mass: Option<&Histogram1D>,
        residual: Option<&Histogram1D>,
    ) -> Result<CalibrationEntry> {
        let (mass, residual) = match (mass, residual) {
            (None, None) => return Ok(CalibrationEntry::rejected(CalibrationStatus::Empty)),
            (Some(m), Some(r)) => (m, r),
            _ => return Ok(CalibrationEntry::rejected(CalibrationStatus::LowStatistics)),
        };

        let min = self.config.min_num_events;
        if !(mass.integral() > min && residual.integral() > min) {
            tracing::debug!(bin, "calibration: low statistics");
            return Ok(CalibrationEntry::rejected(CalibrationStatus::LowStatistics));
        }
        let (lo, hi) = self.config.mass_window;
        let mean_mass = mass.mean();
        if !(mean_mass > lo && mean_mass < hi) {
            tracing::debug!(bin, mean_mass, "calibration: mean mass outside window");
            return Ok(CalibrationEntry::rejected(CalibrationStatus::OutsideMassWindow));
        }

        let (wlo, whi) = fit_window(residual, self.config.n_rms_for_gaus_fit);
        let fit = self.fitter.fit(residual, wlo, whi)?;
        if !fit.converged {
            tracing::debug!(bin, mean = fit.mean, sigma = fit.sigma, "gaussian fit not converged");
        }

        let mut entry = CalibrationEntry {
            mean: fit.mean,
            mean_error: fit.mean_error,
            rms: fit.sigma,
            rms_error: fit.sigma_error,
            mask: true,
            status: CalibrationStatus::Accepted,
            converged: fit.converged,
        };
        if self.config.max_rms > 0.0 && entry.rms > self.config.max_rms {
            tracing::debug!(bin, rms = entry.rms, "calibration: width above maximum");
            entry.mask = false;
            entry.status = CalibrationStatus::RmsTooLarge;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_core::Axis;

    /// Deterministic quasi-Gaussian sample via the inverse CDF on a regular grid.
    fn fill_bin(
        mass: &mut PerBinHistograms,
        residual: &mut PerBinHistograms,
        bin: usize,
        n: usize,
        mass_center: f64,
        mu: f64,
        sigma: f64,
    ) {
        let normal = statrs::distribution::Normal::new(mu, sigma).unwrap();
        for i in 0..n {
            let u = (i as f64 + 0.5) / n as f64;
            let r = statrs::distribution::ContinuousCDF::inverse_cdf(&normal, u);
            residual.fill(bin, r, 1.0);
            mass.fill(bin, mass_center + r, 1.0);
        }
    }

    fn books(n_bins: usize) -> (PerBinHistograms, PerBinHistograms) {
        let mass = PerBinHistograms::new(n_bins, Axis::mass());
        (mass, PerBinHistograms::new(n_bins, Axis::residual()))
    }

    #[test]
    fn test_accepts_and_fits_populated_bin() {
        let (mut m, mut r) = books(3);
        fill_bin(&mut m, &mut r, 1, 4000, 91.0, 0.3, 1.2);
        let table = PerBinCalibrator::default().calibrate(Variant::Corrected, &m, &r).unwrap();
        assert_eq!(table.n_bins(), 3);
        let e = table.get(1).unwrap();
        assert!(e.mask);
        assert_eq!(e.status, CalibrationStatus::Accepted);
        assert_relative_eq!(e.mean, 0.3, epsilon = 0.05);
        assert_relative_eq!(e.rms, 1.2, epsilon = 0.05);
        assert_eq!(table.get(0).unwrap().status, CalibrationStatus::Empty);
        assert_eq!(table.delta_sigma(3), (0.0, 0.0));
    }

    #[test]
    fn test_low_statistics_rejected() {
        let (mut m, mut r) = books(1);
        fill_bin(&mut m, &mut r, 0, 100, 91.0, 0.0, 1.0);
        let e = PerBinCalibrator::default().calibrate_bin(0, m.get(0), r.get(0)).unwrap();
        assert!(!e.mask);
        assert_eq!(e.status, CalibrationStatus::LowStatistics);
        assert_eq!((e.mean, e.rms), (0.0, 0.0));
    }

    #[test]
    fn test_mass_window_rejects() {
        let (mut m, mut r) = books(1);
        fill_bin(&mut m, &mut r, 0, 1000, 72.0, 0.0, 1.0);
        let e = PerBinCalibrator::default().calibrate_bin(0, m.get(0), r.get(0)).unwrap();
        assert_eq!(e.status, CalibrationStatus::OutsideMassWindow);
    }

    #[test]
    fn test_max_rms_flips_mask_but_keeps_fit() {
        let (mut m, mut r) = books(1);
        fill_bin(&mut m, &mut r, 0, 4000, 91.0, 0.0, 2.0);
        let config = CalibrationConfig { max_rms: 1.0, ..Default::default() };
        let e = PerBinCalibrator::new(config).calibrate_bin(0, m.get(0), r.get(0)).unwrap();
        assert!(!e.mask);
        assert_eq!(e.status, CalibrationStatus::RmsTooLarge);
        assert!(e.rms > 1.5);
    }
}
