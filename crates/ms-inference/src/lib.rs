//! # ms-inference
//!
//! Numerical engine of the mass-scale calibration.
//!
//! Given per-event dimuon records, the engine
//! - books per-bin mass and residual histograms ([`aggregate`]),
//! - fits a Gaussian to every residual histogram and masks weak bins ([`calibration`]),
//! - fills jacobian-weighted mass histograms from that calibration ([`jacobian`]),
//! - solves a per-bin weighted least-squares problem for scale, width and
//!   normalisation biases ([`wls`]),
//! - projects the per-bin scale biases onto per-η coefficients ([`bias_fit`]).
//!
//! [`pipeline::IterationController`] sequences these as three persisted stages.
//! Toy event smearing lives in [`toys`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod artifacts;
pub mod bias_fit;
pub mod calibration;
pub mod gaussian;
pub mod jacobian;
pub mod optimizer;
pub mod pipeline;
pub mod store;
pub mod toys;
pub mod wls;

pub use aggregate::{BinnedResidualAggregator, HistogramKind, HistogramSet};
pub use artifacts::{
    ArtifactHeader, SCHEMA_VERSION, Stage0Artifact, Stage1Artifact, Stage2Artifact, StageArtifact,
    fit_rows_csv,
};
pub use bias_fit::{ExtractedBias, extract_bias};
pub use calibration::{CalibrationConfig, CalibrationTable, PerBinCalibrator};
pub use gaussian::{GaussianFit, GaussianFitter};
pub use jacobian::JacobianWeights;
pub use optimizer::{BoundedLbfgs, Minimum, Objective, OptimizerConfig};
pub use pipeline::{
    IterationController, InjectionConfig, LUMI_MC, PipelineConfig, RunReport, RunRef, Stage,
    StageReport,
};
pub use store::RunStore;
pub use toys::{
    DimuonEvent, EventFeed, LegKinematics, RecordFeed, ToyFeed, ToySmearer, generate_dimuons,
    invariant_mass, sample_injected_bias,
};
pub use wls::{
    FitInputs, FitOutput, FitterConfig, LinearFit, MassFitSnapshot, SliceData, SolveOutcome,
    SummaryTables, VarianceModel, WeightedLeastSquaresFitter,
};
