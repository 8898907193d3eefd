//! # ms-core
//!
//! Core types for calibrating muon curvature-scale and resolution biases from
//! dilepton mass distributions.
//!
//! This crate provides:
//! - the 4D kinematic binning `(η+, pT+, η−, pT−)` and its linear encoding
//! - per-η bias coefficient vectors and immutable bias snapshots
//! - weighted 1D histograms and per-bin histogram collections
//! - per-event records, calibration entries and fit result rows
//! - the resolution model seam consumed by event smearing
//!
//! Numerical solvers live in `ms-inference`; this crate has no linear-algebra
//! or optimizer dependencies.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bias;
pub mod binning;
pub mod error;
pub mod histogram;
pub mod traits;
pub mod types;

pub use bias::{BiasCoefficient, BiasSnapshot, BiasVector};
pub use binning::{BinRanges, BinSchema, KinematicBinner, KinematicIndex};
pub use error::{Error, Result};
pub use histogram::{Axis, Histogram1D, PerBinHistograms};
pub use traits::{BudgetResolution, FallbackResolution, ResolutionModel};
pub use types::{
    BinFitResult, CalibrationEntry, CalibrationStatus, EnabledVariants, EventRecord, FitStatus,
    Variant, VariantRecord,
};

/// Crate version, reported by the CLI and stamped into artifacts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
