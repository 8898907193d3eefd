//! Typed, versioned artifacts exchanged between stages.
//!
//! Every artifact carries an [`ArtifactHeader`] with the schema version, the
//! stage that produced it and the binning it was built with. Loading checks the
//! header against the running configuration before any content is used.
//!
//! # Schema versioning
//!
//! `schema_version` tracks breaking changes. Current: `"1.0.0"`.

use ms_core::{
    Axis, BiasSnapshot, BiasVector, BinFitResult, BinSchema, EnabledVariants, Error,
    KinematicBinner, Result, Variant,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aggregate::{BinnedResidualAggregator, HistogramSet};
use crate::calibration::CalibrationTable;
use crate::wls::{FitterConfig, MassFitSnapshot, SummaryTables};

/// Current schema version for stage artifacts.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Provenance and schema of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Schema version for forward compatibility.
    pub schema_version: String,
    /// Producing stage (0, 1 or 2).
    pub stage: u8,
    /// Run type tag.
    pub tag: String,
    /// Iteration identifier.
    pub run: String,
    /// Library version that wrote the artifact.
    pub producer_version: String,
    /// Kinematic binning.
    pub binning: BinSchema,
    /// Axis of mass and jacobian histograms.
    pub mass_axis: Axis,
    /// Axis of residual histograms.
    pub residual_axis: Axis,
    /// SHA-256 of the run configuration, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_sha256: Option<String>,
}

impl ArtifactHeader {
    /// Header for `stage` of run `tag`/`run`.
    pub fn new(
        stage: u8,
        tag: &str,
        run: &str,
        binner: &KinematicBinner,
        mass_axis: Axis,
        residual_axis: Axis,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            stage,
            tag: tag.to_string(),
            run: run.to_string(),
            producer_version: ms_core::VERSION.to_string(),
            binning: binner.schema(),
            mass_axis,
            residual_axis,
            config_sha256: None,
        }
    }

    /// Attach the configuration digest.
    pub fn with_config_sha256(mut self, digest: Option<String>) -> Self {
        self.config_sha256 = digest;
        self
    }

    /// Fail with [`Error::SchemaMismatch`] unless this header was written by `stage`
    /// of the current schema version with the given binning and axes.
    pub fn check(&self, stage: u8, expected: &ArtifactHeader) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::SchemaMismatch(format!(
                "artifact schema {} but this build reads {}",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        if self.stage != stage {
            return Err(Error::SchemaMismatch(format!(
                "expected a stage {stage} artifact, found stage {}",
                self.stage
            )));
        }
        expected.binning.ensure_matches(&self.binning)?;
        if self.mass_axis != expected.mass_axis || self.residual_axis != expected.residual_axis {
            return Err(Error::SchemaMismatch("histogram axes differ".into()));
        }
        Ok(())
    }
}

/// Content persisted by one stage.
pub trait StageArtifact: Serialize + DeserializeOwned {
    /// Producing stage.
    const STAGE: u8;
    /// File name inside the run directory.
    const FILE_NAME: &'static str;

    /// Artifact header.
    fn header(&self) -> &ArtifactHeader;
}

/// Stage 0: mass and residual histograms, calibration tables and the bias state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage0Artifact {
    /// Header.
    pub header: ArtifactHeader,
    /// Variants booked in this run.
    pub enabled: EnabledVariants,
    /// Bias state the events were smeared with.
    pub snapshot: BiasSnapshot,
    /// Booked histograms.
    pub histograms: Vec<HistogramSet>,
    /// One calibration table per enabled variant.
    pub calibrations: Vec<CalibrationTable>,
}

impl Stage0Artifact {
    /// Histograms as an aggregator.
    pub fn aggregator(&self) -> Result<BinnedResidualAggregator> {
        aggregator_from(&self.header, self.histograms.clone())
    }

    /// Calibration table of `variant`.
    pub fn calibration(&self, variant: Variant) -> Result<&CalibrationTable> {
        self.calibrations.iter().find(|t| t.variant == variant).ok_or_else(|| {
            Error::MissingState(format!("no calibration table for variant {variant}"))
        })
    }

    /// CSV export of all calibration tables.
    pub fn calibration_csv(&self) -> String {
        let mut csv =
            String::from("variant,bin,mean,mean_error,rms,rms_error,mask,status,converged\n");
        for table in &self.calibrations {
            for (bin, e) in table.entries.iter().enumerate() {
                csv.push_str(&format!(
                    "{},{},{:.6},{:.6},{:.6},{:.6},{},{},{}\n",
                    table.variant,
                    bin,
                    e.mean,
                    e.mean_error,
                    e.rms,
                    e.rms_error,
                    u8::from(e.mask),
                    e.status.as_str(),
                    u8::from(e.converged)
                ));
            }
        }
        csv
    }
}

impl StageArtifact for Stage0Artifact {
    const STAGE: u8 = 0;
    const FILE_NAME: &'static str = "stage0.json";

    fn header(&self) -> &ArtifactHeader {
        &self.header
    }
}

/// Stage 1: jacobian-weighted mass histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Artifact {
    /// Header.
    pub header: ArtifactHeader,
    /// Booked jacobian histograms.
    pub histograms: Vec<HistogramSet>,
}

impl Stage1Artifact {
    /// Histograms as an aggregator.
    pub fn aggregator(&self) -> Result<BinnedResidualAggregator> {
        aggregator_from(&self.header, self.histograms.clone())
    }
}

impl StageArtifact for Stage1Artifact {
    const STAGE: u8 = 1;
    const FILE_NAME: &'static str = "stage1.json";

    fn header(&self) -> &ArtifactHeader {
        &self.header
    }
}

/// Stage 2: fit results, summary tables and the updated bias state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Artifact {
    /// Header.
    pub header: ArtifactHeader,
    /// Fitter settings used.
    pub fit_config: FitterConfig,
    /// One row per fitted or skipped bin.
    pub rows: Vec<BinFitResult>,
    /// Dense per-bin tables.
    pub summary: SummaryTables,
    /// Per-η coefficients extracted from this pass.
    pub fitted: BiasVector,
    /// Bias state after adding `fitted` to the cumulative vector.
    pub snapshot: BiasSnapshot,
    /// Pre- and post-fit mass distributions, when requested.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mass_fits: Vec<MassFitSnapshot>,
}

impl Stage2Artifact {
    /// CSV export of the fit result table.
    pub fn fit_csv(&self) -> String {
        fit_rows_csv(&self.rows)
    }
}

impl StageArtifact for Stage2Artifact {
    const STAGE: u8 = 2;
    const FILE_NAME: &'static str = "stage2.json";

    fn header(&self) -> &ArtifactHeader {
        &self.header
    }
}

fn aggregator_from(
    header: &ArtifactHeader,
    sets: Vec<HistogramSet>,
) -> Result<BinnedResidualAggregator> {
    BinnedResidualAggregator::from_sets(
        header.binning.n_bins,
        header.mass_axis,
        header.residual_axis,
        sets,
    )
}

/// Fit rows as CSV, one line per row.
pub fn fit_rows_csv(rows: &[BinFitResult]) -> String {
    let mut csv = String::from(
        "bin,beta,beta_error,alpha,alpha_error,nu,nu_error,chi2_before,chi2_after,\
         chi2_before_norm,chi2_after_norm,ndof,p_value,n_mass_bins,n_events,residual_mean,\
         residual_rms,mask,status\n",
    );
    for r in rows {
        csv.push_str(&format!(
            "{},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6},{:.6},{:.6},{:.6},{},\
             {:.6},{},{:.3},{:.6},{:.6},{},{}\n",
            r.bin,
            r.beta,
            r.beta_error,
            r.alpha,
            r.alpha_error,
            r.nu,
            r.nu_error,
            r.chi2_before,
            r.chi2_after,
            r.chi2_before_norm(),
            r.chi2_after_norm(),
            r.ndof,
            r.p_value,
            r.n_mass_bins,
            r.n_events,
            r.residual_mean,
            r.residual_rms,
            u8::from(r.mask),
            r.status.as_str()
        ));
    }
    csv
}
