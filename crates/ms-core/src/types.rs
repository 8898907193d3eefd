//! Common data types: reconstruction variants, per-event records and per-bin results.

use serde::{Deserialize, Serialize};

/// Reconstruction variant of a muon pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Unsmeared reconstruction.
    Reco,
    /// Simulation with the current bias correction applied.
    Corrected,
    /// Simulation smeared with the injected biases, standing in for data.
    PseudoData,
}

impl Variant {
    /// All variants in record order.
    pub const ALL: [Variant; 3] = [Variant::Reco, Variant::Corrected, Variant::PseudoData];

    /// Position inside [`EventRecord::variants`].
    pub fn index(self) -> usize {
        match self {
            Variant::Reco => 0,
            Variant::Corrected => 1,
            Variant::PseudoData => 2,
        }
    }

    /// Stable name used in artifact keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Reco => "reco",
            Variant::Corrected => "corrected",
            Variant::PseudoData => "pseudo_data",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which variants are booked, decided once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledVariants {
    include_reco: bool,
}

impl EnabledVariants {
    /// Corrected simulation and pseudo-data always; unsmeared reco on request.
    pub fn new(include_reco: bool) -> Self {
        Self { include_reco }
    }

    /// Build from the `skip_unsmeared_reco` switch.
    pub fn from_skip_unsmeared_reco(skip: bool) -> Self {
        Self::new(!skip)
    }

    /// Enabled variants in record order.
    pub fn list(&self) -> &'static [Variant] {
        if self.include_reco {
            &Variant::ALL
        } else {
            &[Variant::Corrected, Variant::PseudoData]
        }
    }

    /// Whether `variant` is booked.
    pub fn contains(&self, variant: Variant) -> bool {
        variant != Variant::Reco || self.include_reco
    }

    /// Whether the unsmeared reco variant is booked.
    pub fn includes_reco(&self) -> bool {
        self.include_reco
    }
}

impl Default for EnabledVariants {
    fn default() -> Self {
        Self::from_skip_unsmeared_reco(true)
    }
}

/// Reconstructed quantities of one pair in one variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    /// Reconstructed dilepton mass.
    pub mass: f64,
    /// Linear kinematic bin id (the binner's invalid id when unclassified).
    pub bin: usize,
    /// Selection weight.
    pub weight: f64,
}

/// Per-event input to aggregation: truth mass plus one record per variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Generator-level dilepton mass.
    pub truth_mass: f64,
    /// Records indexed by [`Variant::index`].
    pub variants: [VariantRecord; 3],
}

impl EventRecord {
    /// Record of one variant.
    pub fn get(&self, variant: Variant) -> &VariantRecord {
        &self.variants[variant.index()]
    }

    /// Reconstructed-minus-truth mass in one variant.
    pub fn residual(&self, variant: Variant) -> f64 {
        self.get(variant).mass - self.truth_mass
    }
}

/// Outcome of the per-bin Gaussian calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    /// Fit performed and bin accepted.
    Accepted,
    /// Nothing was filled in this bin.
    Empty,
    /// Mass or residual histogram below the minimum event count.
    LowStatistics,
    /// Mean reconstructed mass outside the acceptance window.
    OutsideMassWindow,
    /// Fit performed but the fitted width exceeds the configured maximum.
    RmsTooLarge,
}

impl CalibrationStatus {
    /// Stable lowercase name used in tabular exports.
    pub fn as_str(self) -> &'static str {
        match self {
            CalibrationStatus::Accepted => "accepted",
            CalibrationStatus::Empty => "empty",
            CalibrationStatus::LowStatistics => "low_statistics",
            CalibrationStatus::OutsideMassWindow => "outside_mass_window",
            CalibrationStatus::RmsTooLarge => "rms_too_large",
        }
    }
}

/// Calibrated residual mean and width of one bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    /// Fitted Gaussian mean of the residual.
    pub mean: f64,
    /// Uncertainty on `mean`.
    pub mean_error: f64,
    /// Fitted Gaussian width of the residual.
    pub rms: f64,
    /// Uncertainty on `rms`.
    pub rms_error: f64,
    /// Whether the bin enters the jacobian stage and the fit.
    pub mask: bool,
    /// Why the bin was accepted or rejected.
    pub status: CalibrationStatus,
    /// Whether the optimizer reported convergence (false when no fit was run).
    pub converged: bool,
}

impl CalibrationEntry {
    /// Entry for a bin that was not fitted.
    pub fn rejected(status: CalibrationStatus) -> Self {
        Self {
            mean: 0.0,
            mean_error: 0.0,
            rms: 0.0,
            rms_error: 0.0,
            mask: false,
            status,
            converged: false,
        }
    }
}

/// Outcome of the per-bin least-squares fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// Solved; parameters and covariance are valid.
    Fitted,
    /// Rejected at calibration; no fit attempted.
    NotCalibrated,
    /// Too few mass slices above the per-slice event threshold.
    InsufficientStatistics,
    /// Rank-deficient design matrix or non-positive degrees of freedom.
    DegenerateFit,
}

impl FitStatus {
    /// Stable lowercase name used in tabular exports.
    pub fn as_str(self) -> &'static str {
        match self {
            FitStatus::Fitted => "fitted",
            FitStatus::NotCalibrated => "not_calibrated",
            FitStatus::InsufficientStatistics => "insufficient_statistics",
            FitStatus::DegenerateFit => "degenerate_fit",
        }
    }
}

/// One row of the fit result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinFitResult {
    /// Linear kinematic bin id.
    pub bin: usize,
    /// Relative mass-scale bias.
    pub beta: f64,
    /// Uncertainty on `beta`.
    pub beta_error: f64,
    /// Relative mass-width bias (0 when not fitted).
    pub alpha: f64,
    /// Uncertainty on `alpha`.
    pub alpha_error: f64,
    /// Relative normalisation bias (0 when not fitted).
    pub nu: f64,
    /// Uncertainty on `nu`.
    pub nu_error: f64,
    /// `bᵀb` before the fit.
    pub chi2_before: f64,
    /// Residual sum of squares after the fit.
    pub chi2_after: f64,
    /// Mass slices minus fitted parameters.
    pub ndof: i64,
    /// Chi-square survival probability of `chi2_after`.
    pub p_value: f64,
    /// Mass slices used in the fit.
    pub n_mass_bins: usize,
    /// Pseudo-data yield in the bin.
    pub n_events: f64,
    /// Mean of the corrected-simulation residual histogram.
    pub residual_mean: f64,
    /// RMS of the corrected-simulation residual histogram.
    pub residual_rms: f64,
    /// Parameter correlation matrix, present when fitted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation: Option<Vec<Vec<f64>>>,
    /// Whether the bin carries a valid fit.
    pub mask: bool,
    /// Fit outcome.
    pub status: FitStatus,
}

impl BinFitResult {
    /// Row for a bin whose fit was not performed.
    pub fn skipped(bin: usize, status: FitStatus) -> Self {
        Self {
            bin,
            beta: 0.0,
            beta_error: 0.0,
            alpha: 0.0,
            alpha_error: 0.0,
            nu: 0.0,
            nu_error: 0.0,
            chi2_before: 0.0,
            chi2_after: 0.0,
            ndof: 0,
            p_value: 0.0,
            n_mass_bins: 0,
            n_events: 0.0,
            residual_mean: 0.0,
            residual_rms: 0.0,
            correlation: None,
            mask: false,
            status,
        }
    }

    /// `chi2_before` per mass slice.
    pub fn chi2_before_norm(&self) -> f64 {
        if self.n_mass_bins == 0 { 0.0 } else { self.chi2_before / self.n_mass_bins as f64 }
    }

    /// `chi2_after` per degree of freedom.
    pub fn chi2_after_norm(&self) -> f64 {
        if self.ndof <= 0 { 0.0 } else { self.chi2_after / self.ndof as f64 }
    }
}
