//! Per-event linear-response weights.
//!
//! With the calibrated residual mean `δ` and width `σ` of the event's bin,
//! the derivatives of the Gaussian log-likelihood of `m` around `g + δ` are
//!
//! ```text
//! scale = (m − (g+δ))·(g+δ)/σ²
//! width = (m − (g+δ))²/σ² − 1
//! ```
//!
//! Both vanish when `σ <= 0`, which is how rejected bins contribute nothing.

use ms_core::{EventRecord, Variant};

use crate::calibration::CalibrationTable;

/// Scale and width jacobian of one event.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JacobianWeights {
    /// Derivative with respect to a multiplicative mass scale.
    pub scale: f64,
    /// Derivative with respect to a relative width change.
    pub width: f64,
}

impl JacobianWeights {
    /// Jacobians of reconstructed mass `mass` given truth mass `truth` and bin calibration.
    pub fn compute(mass: f64, truth: f64, delta: f64, sigma: f64) -> Self {
        if !(sigma > 0.0) {
            return Self::default();
        }
        let expected = truth + delta;
        let pull = (mass - expected) / sigma;
        Self { scale: pull * expected / sigma, width: pull * pull - 1.0 }
    }

    /// Jacobians of `variant` in `event`, multiplied by its selection weight.
    ///
    /// Events outside the binning get the `(0, 0)` calibration and thus zero weights.
    pub fn for_event(event: &EventRecord, variant: Variant, table: &CalibrationTable) -> Self {
        let rec = event.get(variant);
        let (delta, sigma) = table.delta_sigma(rec.bin);
        let j = Self::compute(rec.mass, event.truth_mass, delta, sigma);
        Self { scale: j.scale * rec.weight, width: j.width * rec.weight }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_core::{CalibrationEntry, CalibrationStatus, VariantRecord};

    #[test]
    fn test_formulas() {
        let j = JacobianWeights::compute(92.0, 90.0, 0.5, 1.5);
        assert_relative_eq!(j.scale, (92.0 - 90.5) * 90.5 / 2.25, epsilon = 1e-12);
        assert_relative_eq!(j.width, 1.0 - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_sigma_gives_zero() {
        assert_eq!(JacobianWeights::compute(92.0, 90.0, 0.0, 0.0), JacobianWeights::default());
        assert_eq!(JacobianWeights::compute(92.0, 90.0, 0.0, -1.0), JacobianWeights::default());
    }

    #[test]
    fn test_event_weight_and_invalid_bin() {
        let entry = CalibrationEntry {
            mean: 0.0,
            mean_error: 0.0,
            rms: 2.0,
            rms_error: 0.0,
            mask: true,
            status: CalibrationStatus::Accepted,
            converged: true,
        };
        let table = CalibrationTable { variant: Variant::Corrected, entries: vec![entry] };
        let rec = |bin| VariantRecord { mass: 93.0, bin, weight: -1.0 };
        let ev = EventRecord { truth_mass: 91.0, variants: [rec(0), rec(0), rec(1)] };
        let j = JacobianWeights::for_event(&ev, Variant::Corrected, &table);
        assert_relative_eq!(j.scale, -(2.0 * 91.0 / 4.0), epsilon = 1e-12);
        assert_relative_eq!(j.width, 0.0, epsilon = 1e-12);
        let j = JacobianWeights::for_event(&ev, Variant::PseudoData, &table);
        assert_eq!(j, JacobianWeights::default());
    }
}
