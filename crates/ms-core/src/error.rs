//! Error types for the mass-scale calibration engine.

use thiserror::Error;

/// Calibration error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input (edges, dimensions, parameter values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure
    #[error("Computation error: {0}")]
    Computation(String),

    /// Startup configuration is unusable; the run must not start.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A persisted artifact needed by a later stage is absent.
    #[error("Missing persisted state: {0}")]
    MissingState(String),

    /// A persisted artifact was written for a different binning or schema version.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
