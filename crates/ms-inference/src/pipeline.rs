//! Three-stage iteration: aggregate and calibrate, jacobians, fit.
//!
//! Each stage takes immutable inputs (configuration, the bias snapshot and the
//! artifacts of earlier stages) and returns a new artifact; the controller
//! persists it. A stage outside the configured range is not run, and its
//! artifact is loaded from the store when a later stage needs it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ms_core::{
    Axis, BiasCoefficient, BiasSnapshot, BudgetResolution, EnabledVariants, Error,
    FallbackResolution, FitStatus, KinematicBinner, ResolutionModel, Result, Variant,
};
use serde::{Deserialize, Serialize};

use crate::aggregate::{BinnedResidualAggregator, HistogramKind};
use crate::artifacts::{
    ArtifactHeader, Stage0Artifact, Stage1Artifact, Stage2Artifact, StageArtifact,
};
use crate::bias_fit::extract_bias;
use crate::calibration::{CalibrationConfig, PerBinCalibrator};
use crate::store::RunStore;
use crate::toys::{EventFeed, sample_injected_bias};
use crate::wls::{
    FitInputs, FitterConfig, SummaryTables, VarianceModel, WeightedLeastSquaresFitter,
};

/// Luminosity equivalent of the simulated sample.
pub const LUMI_MC: f64 = 3.33369e8 / 2001.9e3;

/// Ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Mass and residual histograms, then per-bin calibration.
    Aggregate,
    /// Jacobian-weighted mass histograms.
    Jacobian,
    /// Per-bin least-squares fit and bias extraction.
    Fit,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [Stage::Aggregate, Stage::Jacobian, Stage::Fit];

    /// Stage number (0, 1 or 2), also the offset of its RNG seeds.
    pub fn index(self) -> u8 {
        match self {
            Stage::Aggregate => 0,
            Stage::Jacobian => 1,
            Stage::Fit => 2,
        }
    }

    /// Stage with number `index`.
    pub fn from_index(index: u8) -> Result<Self> {
        Self::ALL.get(usize::from(index)).copied().ok_or_else(|| {
            Error::Configuration(format!("stage {index} does not exist (0, 1 or 2)"))
        })
    }
}

/// How the pseudo-data biases are injected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Relative resolution bias drawn from `U(-b, b)`; negative disables it.
    pub bias_resolution: f64,
    /// Shift simulated curvatures deterministically instead of sampling them.
    pub use_mc_as_data: bool,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self { bias_resolution: -1.0, use_mc_as_data: false }
    }
}

/// Identifier of an earlier run whose fitted biases seed this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    /// Run type tag.
    pub tag: String,
    /// Iteration identifier.
    pub run: String,
}

/// Complete configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run type tag.
    pub tag: String,
    /// Iteration identifier.
    pub run: String,
    /// Pseudorapidity edges.
    pub eta_edges: Vec<f64>,
    /// Transverse-momentum edges.
    pub pt_edges: Vec<f64>,
    /// Axis of mass and jacobian histograms.
    pub mass_axis: Axis,
    /// Axis of residual histograms.
    pub residual_axis: Axis,
    /// Per-bin calibration thresholds.
    pub calibration: CalibrationConfig,
    /// Per-bin fit settings; the variance model is set from [`Self::variance_model`].
    pub fit: FitterConfig,
    /// Pseudo-data injection.
    pub injection: InjectionConfig,
    /// Do not book the unsmeared reconstruction.
    pub skip_unsmeared_reco: bool,
    /// First stage to run.
    pub first_stage: u8,
    /// Last stage to run.
    pub last_stage: u8,
    /// Base RNG seed.
    pub seed: u64,
    /// Number of RNG shards.
    pub n_slots: usize,
    /// Data luminosity; `<= 0` leaves simulation unscaled.
    pub lumi: f64,
    /// Slice variance model; derived from `lumi` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_model: Option<VarianceModel>,
    /// Seed the momentum-scale correction from this run's fit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_mass_fit: Option<RunRef>,
    /// Seed the resolution correction from this run's fit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_resol_fit: Option<RunRef>,
    /// JSON resolution budget table; the proportional fallback when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_table: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let binner = KinematicBinner::default();
        Self {
            tag: "closure".into(),
            run: "closure".into(),
            eta_edges: binner.eta_edges().to_vec(),
            pt_edges: binner.pt_edges().to_vec(),
            mass_axis: Axis::mass(),
            residual_axis: Axis::residual(),
            calibration: CalibrationConfig::default(),
            fit: FitterConfig::default(),
            injection: InjectionConfig::default(),
            skip_unsmeared_reco: true,
            first_stage: 0,
            last_stage: 2,
            seed: 4357,
            n_slots: 16,
            lumi: 16.1,
            variance_model: None,
            prev_mass_fit: None,
            prev_resol_fit: None,
            resolution_table: None,
        }
    }
}

impl PipelineConfig {
    /// Scale factor applied to every booked histogram.
    pub fn lumi_scale(&self) -> f64 {
        if self.lumi > 0.0 { self.lumi / LUMI_MC } else { 1.0 }
    }

    /// Variance model in effect.
    pub fn effective_variance_model(&self) -> VarianceModel {
        self.variance_model.unwrap_or_else(|| VarianceModel::from_lumi(self.lumi))
    }

    /// Fitter settings with the effective variance model.
    pub fn fitter_config(&self) -> FitterConfig {
        FitterConfig { variance_model: self.effective_variance_model(), ..self.fit.clone() }
    }

    /// Variants booked in this run.
    pub fn enabled(&self) -> EnabledVariants {
        EnabledVariants::from_skip_unsmeared_reco(self.skip_unsmeared_reco)
    }

    /// Binning built from the configured edges.
    pub fn binner(&self) -> Result<KinematicBinner> {
        KinematicBinner::new(self.eta_edges.clone(), self.pt_edges.clone())
            .map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Resolution model; an unreadable table is a configuration error.
    pub fn resolution_model(&self) -> Result<Arc<dyn ResolutionModel>> {
        match &self.resolution_table {
            Some(path) => Ok(Arc::new(BudgetResolution::from_json_file(path)?)),
            None => Ok(Arc::new(FallbackResolution)),
        }
    }

    /// Reject settings no stage could run with.
    pub fn validate(&self) -> Result<()> {
        self.binner()?;
        let first = Stage::from_index(self.first_stage)?;
        let last = Stage::from_index(self.last_stage)?;
        if first > last {
            return Err(Error::Configuration(format!(
                "first stage {} is after last stage {}",
                self.first_stage, self.last_stage
            )));
        }
        if self.n_slots == 0 {
            return Err(Error::Configuration("n_slots must be at least 1".into()));
        }
        let axes = [("mass_axis", &self.mass_axis), ("residual_axis", &self.residual_axis)];
        for (name, axis) in axes {
            Axis::new(axis.n_bins, axis.low, axis.high)
                .map_err(|e| Error::Configuration(format!("{name}: {e}")))?;
        }
        let rebin = self.fit.rebin;
        if rebin == 0 || self.mass_axis.n_bins % rebin != 0 {
            return Err(Error::Configuration(format!(
                "rebin {rebin} does not divide {} mass bins",
                self.mass_axis.n_bins
            )));
        }
        if self.tag.is_empty() || self.run.is_empty() {
            return Err(Error::Configuration("tag and run must not be empty".into()));
        }
        Ok(())
    }

    /// Whether `stage` lies in the configured range.
    pub fn runs(&self, stage: Stage) -> bool {
        (self.first_stage..=self.last_stage).contains(&stage.index())
    }
}

/// Counters of one executed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage.
    pub stage: Stage,
    /// Event records processed (0 for the fit).
    pub n_events: usize,
    /// Bins accepted by the corrected-simulation calibration.
    pub calibrated: usize,
    /// Bins with mask 0 in the stage output.
    pub masked: usize,
    /// Bins with a valid fit.
    pub fitted: usize,
    /// Bins skipped for too few mass slices.
    pub insufficient_statistics: usize,
    /// Bins skipped for a degenerate design matrix.
    pub degenerate: usize,
    /// Wall time in seconds.
    pub elapsed_s: f64,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            n_events: 0,
            calibrated: 0,
            masked: 0,
            fitted: 0,
            insufficient_statistics: 0,
            degenerate: 0,
            elapsed_s: 0.0,
        }
    }
}

/// Summary of a whole run, persisted as `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run type tag.
    pub tag: String,
    /// Iteration identifier.
    pub run: String,
    /// Library version.
    pub version: String,
    /// SHA-256 of the run configuration, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_sha256: Option<String>,
    /// Executed stages in order.
    pub stages: Vec<StageReport>,
    /// Bias state after the last executed stage.
    pub snapshot: Option<BiasSnapshot>,
}

/// Sequences the stages of one run.
pub struct IterationController {
    config: PipelineConfig,
    binner: KinematicBinner,
    store: RunStore,
    config_sha256: Option<String>,
}

impl IterationController {
    /// Controller for `config`, persisting into `store`.
    pub fn new(config: PipelineConfig, store: RunStore) -> Result<Self> {
        config.validate()?;
        let binner = config.binner()?;
        Ok(Self { config, binner, store, config_sha256: None })
    }

    /// Stamp artifacts with the configuration digest.
    pub fn with_config_sha256(mut self, digest: impl Into<String>) -> Self {
        self.config_sha256 = Some(digest.into());
        self
    }

    /// Configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Binning.
    pub fn binner(&self) -> &KinematicBinner {
        &self.binner
    }

    /// Artifact store.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Header the artifact of `stage` is written with and checked against.
    pub fn header(&self, stage: Stage) -> ArtifactHeader {
        let c = &self.config;
        let (mass, residual) = (c.mass_axis, c.residual_axis);
        ArtifactHeader::new(stage.index(), &c.tag, &c.run, &self.binner, mass, residual)
            .with_config_sha256(self.config_sha256.clone())
    }

    /// Bias state at the start of the run: sampled injection plus any previous fits.
    pub fn initial_snapshot(&self) -> Result<BiasSnapshot> {
        let c = &self.config;
        let snapshot = sample_injected_bias(&self.binner, c.seed, c.injection.bias_resolution);
        let schema = self.binner.schema();
        let mut cumulative = ms_core::BiasVector::zeros(self.binner.n_eta_bins());
        if let Some(prev) = &c.prev_mass_fit {
            let keep = [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M];
            let v = self.store.previous_cumulative(&prev.tag, &prev.run, &schema, &keep)?;
            cumulative = cumulative.add(&v)?;
        }
        if let Some(prev) = &c.prev_resol_fit {
            let keep = [BiasCoefficient::C, BiasCoefficient::D];
            let v = self.store.previous_cumulative(&prev.tag, &prev.run, &schema, &keep)?;
            cumulative = cumulative.add(&v)?;
        }
        snapshot.with_cumulative(cumulative)
    }

    fn template(&self) -> BinnedResidualAggregator {
        let c = &self.config;
        BinnedResidualAggregator::new(self.binner.n_bins(), c.mass_axis, c.residual_axis)
    }

    /// Stage 0: fill mass and residual histograms and calibrate every enabled variant.
    pub fn run_stage0(&self, feed: &dyn EventFeed) -> Result<(Stage0Artifact, StageReport)> {
        let start = Instant::now();
        let enabled = self.config.enabled();
        let snapshot = self.initial_snapshot()?;
        let records = feed.records(u64::from(Stage::Aggregate.index()), &snapshot)?;

        let mut template = self.template();
        template.book_mass_stage(enabled);
        let mut agg = BinnedResidualAggregator::par_fill(&template, &records, |a, ev| {
            a.fill_mass_stage(ev, enabled)
        })?;
        agg.scale(self.config.lumi_scale());

        let calibrator = PerBinCalibrator::new(self.config.calibration.clone());
        let calibrations = enabled
            .list()
            .iter()
            .map(|&v| {
                let mass = agg.require(v, HistogramKind::Mass)?;
                let residual = agg.require(v, HistogramKind::Residual)?;
                calibrator.calibrate(v, mass, residual)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = StageReport::new(Stage::Aggregate);
        report.n_events = records.len();
        if let Some(table) = calibrations.iter().find(|t| t.variant == Variant::Corrected) {
            report.calibrated = table.n_accepted();
            report.masked = table.n_bins() - table.n_accepted();
        }
        report.elapsed_s = start.elapsed().as_secs_f64();
        tracing::info!(
            events = report.n_events,
            calibrated = report.calibrated,
            masked = report.masked,
            "stage 0 done"
        );

        let artifact = Stage0Artifact {
            header: self.header(Stage::Aggregate),
            enabled,
            snapshot,
            histograms: agg.to_sets(),
            calibrations,
        };
        Ok((artifact, report))
    }

    /// Stage 1: fill jacobian-weighted mass histograms with the stage 0 calibration.
    pub fn run_stage1(
        &self,
        feed: &dyn EventFeed,
        stage0: &Stage0Artifact,
    ) -> Result<(Stage1Artifact, StageReport)> {
        let start = Instant::now();
        let enabled = stage0.enabled;
        let records = feed.records(u64::from(Stage::Jacobian.index()), &stage0.snapshot)?;

        let mut template = self.template();
        template.book_jacobian_stage(enabled);
        let tables = &stage0.calibrations;
        let mut agg = BinnedResidualAggregator::par_fill(&template, &records, |a, ev| {
            a.fill_jacobian_stage(ev, enabled, tables)
        })?;
        agg.scale(self.config.lumi_scale());

        let mut report = StageReport::new(Stage::Jacobian);
        report.n_events = records.len();
        let corrected = stage0.calibration(Variant::Corrected)?;
        report.calibrated = corrected.n_accepted();
        report.masked = corrected.n_bins() - corrected.n_accepted();
        report.elapsed_s = start.elapsed().as_secs_f64();
        tracing::info!(events = report.n_events, "stage 1 done");

        let artifact =
            Stage1Artifact { header: self.header(Stage::Jacobian), histograms: agg.to_sets() };
        Ok((artifact, report))
    }

    /// Stage 2: fit every bin, extract per-η biases and accumulate them.
    ///
    /// Pseudo-data masses are the data; the corrected simulation provides the
    /// nominal shape, the jacobians and the calibration.
    pub fn run_stage2(
        &self,
        stage0: &Stage0Artifact,
        stage1: &Stage1Artifact,
    ) -> Result<(Stage2Artifact, StageReport)> {
        let start = Instant::now();
        let mass = stage0.aggregator()?;
        let jac = stage1.aggregator()?;
        let nominal = Variant::Corrected;
        let inputs = FitInputs {
            data: mass.require(Variant::PseudoData, HistogramKind::Mass)?,
            nominal: mass.require(nominal, HistogramKind::Mass)?,
            jac_scale: jac.require(nominal, HistogramKind::JacobianScale)?,
            jac_width: jac.require(nominal, HistogramKind::JacobianWidth)?,
            residual: mass.require(nominal, HistogramKind::Residual)?,
            calibration: stage0.calibration(nominal)?,
        };
        let fit_config = self.config.fitter_config();
        let fitter = WeightedLeastSquaresFitter::new(fit_config.clone());
        let output = fitter.fit_all(&inputs)?;
        let summary = SummaryTables::from_rows(self.binner.n_bins(), &output.rows);
        let extracted = extract_bias(&self.binner, &output.rows, fit_config.fit_width)?;
        let snapshot = stage0.snapshot.accumulate(&extracted.fitted)?;

        let mut report = StageReport::new(Stage::Fit);
        report.calibrated = inputs.calibration.n_accepted();
        report.fitted = output.count(FitStatus::Fitted);
        report.masked = self.binner.n_bins() - report.fitted;
        report.insufficient_statistics = output.count(FitStatus::InsufficientStatistics);
        report.degenerate = output.count(FitStatus::DegenerateFit);
        report.elapsed_s = start.elapsed().as_secs_f64();
        tracing::info!(
            fitted = report.fitted,
            insufficient_statistics = report.insufficient_statistics,
            degenerate = report.degenerate,
            bins_used = extracted.n_bins_used,
            "stage 2 done"
        );

        let artifact = Stage2Artifact {
            header: self.header(Stage::Fit),
            fit_config,
            rows: output.rows,
            summary,
            fitted: extracted.fitted,
            snapshot,
            mass_fits: output.snapshots,
        };
        Ok((artifact, report))
    }

    fn loaded<A: StageArtifact>(&self, current: Option<A>, stage: Stage) -> Result<A> {
        match current {
            Some(a) => Ok(a),
            None => {
                tracing::info!(stage = stage.index(), "loading persisted artifact");
                self.store.load(&self.header(stage))
            }
        }
    }

    /// Run the configured stage range, persisting every artifact and the report.
    pub fn run(&self, feed: &dyn EventFeed) -> Result<RunReport> {
        let c = &self.config;
        let mut report = RunReport {
            tag: c.tag.clone(),
            run: c.run.clone(),
            version: ms_core::VERSION.to_string(),
            config_sha256: self.config_sha256.clone(),
            stages: Vec::new(),
            snapshot: None,
        };

        let mut stage0 = None;
        if c.runs(Stage::Aggregate) {
            let (art, r) = self.run_stage0(feed)?;
            self.store.save(&art)?;
            self.store.write_text(&c.tag, &c.run, "calibration.csv", &art.calibration_csv())?;
            report.snapshot = Some(art.snapshot.clone());
            report.stages.push(r);
            stage0 = Some(art);
        }

        let mut stage1 = None;
        if c.runs(Stage::Jacobian) {
            let s0 = self.loaded(stage0.take(), Stage::Aggregate)?;
            let (art, r) = self.run_stage1(feed, &s0)?;
            self.store.save(&art)?;
            report.snapshot = Some(s0.snapshot.clone());
            report.stages.push(r);
            stage0 = Some(s0);
            stage1 = Some(art);
        }

        if c.runs(Stage::Fit) {
            let s0 = self.loaded(stage0.take(), Stage::Aggregate)?;
            let s1 = self.loaded(stage1.take(), Stage::Jacobian)?;
            let (art, r) = self.run_stage2(&s0, &s1)?;
            self.store.save(&art)?;
            self.store.write_text(&c.tag, &c.run, "fit_results.csv", &art.fit_csv())?;
            report.snapshot = Some(art.snapshot.clone());
            report.stages.push(r);
        }

        let json = serde_json::to_string_pretty(&report)?;
        self.store.write_text(&c.tag, &c.run, "report.json", &json)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_command_line_defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.seed, 4357);
        assert_eq!(c.calibration.min_num_events, 100.0);
        assert_eq!(c.fit.min_events_per_slice, 10.0);
        assert_eq!(c.fit.min_slices, 4);
        assert_eq!(c.fit.rebin, 2);
        assert!(c.skip_unsmeared_reco);
        assert_eq!(c.injection.bias_resolution, -1.0);
        assert_eq!(c.binner().unwrap().n_eta_bins(), 24);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_lumi_drives_scale_and_variance() {
        let mut c = PipelineConfig::default();
        assert!((c.lumi_scale() - 16.1 / LUMI_MC).abs() < 1e-15);
        assert_eq!(c.fitter_config().variance_model, VarianceModel::CountingData);
        c.lumi = -1.0;
        assert_eq!(c.lumi_scale(), 1.0);
        assert_eq!(c.fitter_config().variance_model, VarianceModel::SimulationClosure);
        c.variance_model = Some(VarianceModel::CountingData);
        assert_eq!(c.fitter_config().variance_model, VarianceModel::CountingData);
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut c = PipelineConfig { first_stage: 2, last_stage: 1, ..Default::default() };
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));
        c.last_stage = 3;
        assert!(c.validate().is_err());
        let fit = FitterConfig { rebin: 3, ..Default::default() };
        let c = PipelineConfig { fit, ..Default::default() };
        assert!(c.validate().is_err());
        let c = PipelineConfig { pt_edges: vec![30.0, 25.0], ..Default::default() };
        assert!(matches!(c.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_axes() {
        let zero = Axis { n_bins: 0, low: 70.0, high: 110.0 };
        let inverted = Axis { n_bins: 24, low: 6.0, high: -6.0 };
        for c in [
            PipelineConfig { mass_axis: zero, ..Default::default() },
            PipelineConfig { residual_axis: zero, ..Default::default() },
            PipelineConfig { residual_axis: inverted, ..Default::default() },
        ] {
            assert!(matches!(c.validate(), Err(Error::Configuration(_))), "{c:?}");
        }

        let parsed = serde_json::from_value::<PipelineConfig>(serde_json::json!({
            "residual_axis": { "n_bins": 0, "low": -6.0, "high": 6.0 }
        }));
        assert!(parsed.is_err());
        let parsed = serde_json::from_value::<PipelineConfig>(serde_json::json!({
            "mass_axis": { "n_bins": 40, "low": 110.0, "high": 70.0 }
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_stage_gating() {
        let c = PipelineConfig { first_stage: 1, last_stage: 1, ..Default::default() };
        assert!(!c.runs(Stage::Aggregate));
        assert!(c.runs(Stage::Jacobian));
        assert!(!c.runs(Stage::Fit));
        assert_eq!(Stage::from_index(2).unwrap(), Stage::Fit);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let c: PipelineConfig = serde_json::from_value(serde_json::json!({
            "tag": "test",
            "lumi": -1.0,
            "fit": { "fit_width": true, "min_num_mass_bins": 6 }
        }))
        .unwrap();
        assert_eq!(c.tag, "test");
        assert_eq!(c.run, "closure");
        assert!(c.fit.fit_width);
        assert_eq!(c.fit.min_slices, 6);
        assert_eq!(c.effective_variance_model(), VarianceModel::SimulationClosure);
    }

    #[test]
    fn test_missing_resolution_table_is_configuration_error() {
        let c = PipelineConfig {
            resolution_table: Some(PathBuf::from("/nonexistent/resolution.json")),
            ..Default::default()
        };
        assert!(matches!(c.resolution_model(), Err(Error::Configuration(_))));
        assert_eq!(PipelineConfig::default().resolution_model().unwrap().name(), "fallback");
    }
}
