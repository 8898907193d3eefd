//! Seams to external collaborators.
//!
//! The smearing stage needs a per-η curvature resolution. The detector
//! resolution budget is supplied as a lookup table; a simple proportional
//! formula is available when no table is configured.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Absolute curvature resolution as a function of curvature, pseudorapidity and relative bias.
pub trait ResolutionModel: Send + Sync {
    /// Resolution `σ_k` for curvature `k` at pseudorapidity `eta`, scaled by `(1 + bias)`.
    fn resolution(&self, k: f64, eta: f64, bias: f64) -> f64;

    /// Short model name for logs.
    fn name(&self) -> &str;
}

/// `σ_k = 0.02·k·(1 + bias)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackResolution;

impl ResolutionModel for FallbackResolution {
    fn resolution(&self, k: f64, _eta: f64, bias: f64) -> f64 {
        0.02 * k * (1.0 + bias)
    }

    fn name(&self) -> &str {
        "fallback"
    }
}

/// Per-η resolution budget: multiple-scattering term and hit-resolution term.
///
/// `σ_k = sqrt(budget² + hit_res²/k²)·k·(1 + bias)`, with the η lookup clamped
/// to the first/last table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetResolution {
    /// Table η edges (length = entries + 1).
    pub eta_edges: Vec<f64>,
    /// Relative resolution floor per η entry.
    pub budget: Vec<f64>,
    /// Hit-resolution term per η entry.
    pub hit_res: Vec<f64>,
}

impl BudgetResolution {
    /// Validate table shape and build the model.
    pub fn new(eta_edges: Vec<f64>, budget: Vec<f64>, hit_res: Vec<f64>) -> Result<Self> {
        let table = Self { eta_edges, budget, hit_res };
        table.validate()?;
        Ok(table)
    }

    /// Load a JSON table `{"eta_edges": [...], "budget": [...], "hit_res": [...]}`.
    ///
    /// A missing or malformed table is a configuration error: the run cannot start.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Configuration(format!("resolution table {}: {e}", path.display()))
        })?;
        let table: BudgetResolution = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Configuration(format!("resolution table {}: {e}", path.display()))
        })?;
        table.validate().map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let n = self.budget.len();
        if n == 0 || self.hit_res.len() != n || self.eta_edges.len() != n + 1 {
            return Err(Error::Validation(format!(
                "resolution table shape: {} edges, {} budget, {} hit_res",
                self.eta_edges.len(),
                n,
                self.hit_res.len()
            )));
        }
        if self.eta_edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::Validation("resolution table edges must increase".into()));
        }
        Ok(())
    }

    fn entry(&self, eta: f64) -> usize {
        let i = self.eta_edges.partition_point(|&e| e <= eta);
        i.saturating_sub(1).min(self.budget.len() - 1)
    }
}

impl ResolutionModel for BudgetResolution {
    fn resolution(&self, k: f64, eta: f64, bias: f64) -> f64 {
        let i = self.entry(eta);
        let budget = self.budget[i];
        let hit_res = self.hit_res[i];
        (budget * budget + hit_res * hit_res / (k * k)).sqrt() * k * (1.0 + bias)
    }

    fn name(&self) -> &str {
        "budget"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fallback_formula() {
        let r = FallbackResolution;
        assert_relative_eq!(r.resolution(0.025, 1.0, 0.1), 0.02 * 0.025 * 1.1);
    }

    #[test]
    fn test_budget_lookup_clamps_eta() {
        let table = BudgetResolution::new(
            vec![-1.0, 0.0, 1.0],
            vec![0.01, 0.02],
            vec![0.0, 1e-4],
        )
        .unwrap();
        let k = 0.025;
        assert_relative_eq!(table.resolution(k, -5.0, 0.0), 0.01 * k, epsilon = 1e-15);
        assert_relative_eq!(table.resolution(k, -0.5, 0.0), 0.01 * k, epsilon = 1e-15);
        let expected = (0.02f64.powi(2) + 1e-8 / (k * k)).sqrt() * k;
        assert_relative_eq!(table.resolution(k, 0.5, 0.0), expected, epsilon = 1e-15);
        assert_relative_eq!(table.resolution(k, 9.0, 0.5), 1.5 * expected, epsilon = 1e-15);
    }

    #[test]
    fn test_missing_table_is_configuration_error() {
        let err = BudgetResolution::from_json_file(std::path::Path::new("/nonexistent/res.json"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_ragged_table() {
        assert!(BudgetResolution::new(vec![0.0, 1.0], vec![0.01, 0.02], vec![0.0]).is_err());
    }
}
