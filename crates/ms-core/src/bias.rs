//! Per-η bias coefficient vectors and the immutable snapshot passed between passes.
//!
//! Scale coefficients describe a relative curvature bias of a leg with curvature `k`:
//!
//! ```text
//! δk/k = A + e·k ∓ M/k        (− for the positive leg, + for the negative leg)
//! ```
//!
//! Resolution coefficients describe a relative change of the curvature variance,
//! `σ_k² → σ_k²·(1 + c + d·k)`.
//!
//! A [`BiasSnapshot`] is read at the start of a pass and a new one is returned at
//! the end; nothing mutates a snapshot once it has been handed to a stage.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Named bias coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BiasCoefficient {
    /// Curvature-scale term independent of `k`.
    A,
    /// Curvature-scale term linear in `k`.
    E,
    /// Curvature-scale term in `1/k`, charge-antisymmetric.
    M,
    /// Resolution term independent of `k`.
    C,
    /// Resolution term linear in `k`.
    D,
}

impl BiasCoefficient {
    /// All coefficients in storage order.
    pub const ALL: [BiasCoefficient; 5] = [Self::A, Self::E, Self::M, Self::C, Self::D];

    /// Short label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::E => "e",
            Self::M => "M",
            Self::C => "c",
            Self::D => "d",
        }
    }

    /// Whether this is one of the three scale coefficients.
    pub fn is_scale(self) -> bool {
        matches!(self, Self::A | Self::E | Self::M)
    }
}

/// One value per η slot for each of the five coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasVector {
    /// `A` per η slot.
    pub a: Vec<f64>,
    /// `e` per η slot.
    pub e: Vec<f64>,
    /// `M` per η slot.
    pub m: Vec<f64>,
    /// `c` per η slot.
    pub c: Vec<f64>,
    /// `d` per η slot.
    pub d: Vec<f64>,
}

impl BiasVector {
    /// All-zero vector for `n_slots` η slots.
    pub fn zeros(n_slots: usize) -> Self {
        Self {
            a: vec![0.0; n_slots],
            e: vec![0.0; n_slots],
            m: vec![0.0; n_slots],
            c: vec![0.0; n_slots],
            d: vec![0.0; n_slots],
        }
    }

    /// Number of η slots.
    pub fn n_slots(&self) -> usize {
        self.a.len()
    }

    /// Values of one coefficient.
    pub fn get(&self, coef: BiasCoefficient) -> &[f64] {
        match coef {
            BiasCoefficient::A => &self.a,
            BiasCoefficient::E => &self.e,
            BiasCoefficient::M => &self.m,
            BiasCoefficient::C => &self.c,
            BiasCoefficient::D => &self.d,
        }
    }

    /// Mutable values of one coefficient.
    pub fn get_mut(&mut self, coef: BiasCoefficient) -> &mut Vec<f64> {
        match coef {
            BiasCoefficient::A => &mut self.a,
            BiasCoefficient::E => &mut self.e,
            BiasCoefficient::M => &mut self.m,
            BiasCoefficient::C => &mut self.c,
            BiasCoefficient::D => &mut self.d,
        }
    }

    /// Check that all five arrays have `n_slots` entries.
    pub fn validate(&self, n_slots: usize) -> Result<()> {
        for coef in BiasCoefficient::ALL {
            let len = self.get(coef).len();
            if len != n_slots {
                return Err(Error::Validation(format!(
                    "bias coefficient {} has {} slots, expected {}",
                    coef.as_str(),
                    len,
                    n_slots
                )));
            }
        }
        Ok(())
    }

    /// Element-wise sum.
    pub fn add(&self, other: &BiasVector) -> Result<BiasVector> {
        other.validate(self.n_slots())?;
        let sum = |x: &[f64], y: &[f64]| x.iter().zip(y).map(|(a, b)| a + b).collect();
        Ok(BiasVector {
            a: sum(&self.a, &other.a),
            e: sum(&self.e, &other.e),
            m: sum(&self.m, &other.m),
            c: sum(&self.c, &other.c),
            d: sum(&self.d, &other.d),
        })
    }

    /// Copy keeping only the selected coefficients; the rest are zeroed.
    pub fn restricted_to(&self, keep: &[BiasCoefficient]) -> BiasVector {
        let mut out = BiasVector::zeros(self.n_slots());
        for &coef in keep {
            out.get_mut(coef).copy_from_slice(self.get(coef));
        }
        out
    }

    /// Relative curvature scale factor `1 + A + e·k ∓ M/k` of a leg in `slot`.
    pub fn curvature_scale(&self, slot: usize, k: f64, positive: bool) -> f64 {
        let sign = if positive { -1.0 } else { 1.0 };
        1.0 + self.a[slot] + self.e[slot] * k + sign * self.m[slot] / k
    }

    /// Additional relative curvature smearing `sqrt(max(1 + c + d·k, 0)) − 1` in `slot`.
    pub fn resolution_factor(&self, slot: usize, k: f64) -> f64 {
        (1.0 + self.c[slot] + self.d[slot] * k).max(0.0).sqrt() - 1.0
    }
}

/// Immutable bias state for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSnapshot {
    /// Biases injected into the pseudo-data (curvature convention).
    pub injected: BiasVector,
    /// Sum of fitted momentum-scale and resolution biases from all previous passes.
    pub cumulative: BiasVector,
    /// Relative resolution bias injected into the pseudo-data.
    pub resolution_bias: f64,
}

impl BiasSnapshot {
    /// Zero snapshot: nothing injected, nothing fitted yet.
    pub fn zeros(n_slots: usize) -> Self {
        Self {
            injected: BiasVector::zeros(n_slots),
            cumulative: BiasVector::zeros(n_slots),
            resolution_bias: 0.0,
        }
    }

    /// Number of η slots.
    pub fn n_slots(&self) -> usize {
        self.injected.n_slots()
    }

    /// Replace the cumulative vector with one persisted by a previous run.
    pub fn with_cumulative(self, cumulative: BiasVector) -> Result<Self> {
        cumulative.validate(self.n_slots())?;
        Ok(Self { cumulative, ..self })
    }

    /// Correction applied to simulated curvatures.
    ///
    /// Scale terms are the negated cumulative momentum-scale biases (a curvature bias
    /// is minus a momentum bias at first order); resolution terms are used as-is.
    pub fn correction(&self) -> BiasVector {
        let neg = |v: &[f64]| v.iter().map(|x| -x).collect();
        BiasVector {
            a: neg(&self.cumulative.a),
            e: neg(&self.cumulative.e),
            m: neg(&self.cumulative.m),
            c: self.cumulative.c.clone(),
            d: self.cumulative.d.clone(),
        }
    }

    /// Injected scale bias still left after the correction, i.e. what the next fit should find.
    pub fn residual_injected(&self) -> BiasVector {
        let mut out = BiasVector::zeros(self.n_slots());
        for coef in [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M] {
            let injected = self.injected.get(coef);
            let cumulative = self.cumulative.get(coef);
            *out.get_mut(coef) = injected.iter().zip(cumulative).map(|(i, c)| i + c).collect();
        }
        out
    }

    /// New snapshot whose cumulative vector includes `fitted`.
    pub fn accumulate(&self, fitted: &BiasVector) -> Result<BiasSnapshot> {
        Ok(BiasSnapshot {
            injected: self.injected.clone(),
            cumulative: self.cumulative.add(fitted)?,
            resolution_bias: self.resolution_bias,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_curvature_scale_charge_antisymmetric_in_m() {
        let mut v = BiasVector::zeros(2);
        v.a[1] = 1e-3;
        v.e[1] = 2e-3;
        v.m[1] = 1e-4;
        let k = 0.025;
        let plus = v.curvature_scale(1, k, true);
        let minus = v.curvature_scale(1, k, false);
        assert_relative_eq!(plus, 1.0 + 1e-3 + 2e-3 * k - 1e-4 / k, epsilon = 1e-15);
        assert_relative_eq!(minus - plus, 2.0 * 1e-4 / k, epsilon = 1e-12);
        assert_relative_eq!(v.curvature_scale(0, k, true), 1.0);
    }

    #[test]
    fn test_resolution_factor_clamps_negative_variance() {
        let mut v = BiasVector::zeros(1);
        v.c[0] = -2.0;
        assert_relative_eq!(v.resolution_factor(0, 0.03), -1.0);
        v.c[0] = 0.21;
        assert_relative_eq!(v.resolution_factor(0, 0.03), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_accumulate_returns_new_snapshot() {
        let snap = BiasSnapshot::zeros(3);
        let mut fitted = BiasVector::zeros(3);
        fitted.a = vec![1.0, 2.0, 3.0];
        let next = snap.accumulate(&fitted).unwrap();
        let after = next.accumulate(&fitted).unwrap();
        assert_eq!(snap.cumulative.a, vec![0.0; 3]);
        assert_eq!(after.cumulative.a, vec![2.0, 4.0, 6.0]);
        assert_eq!(after.correction().a, vec![-2.0, -4.0, -6.0]);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let snap = BiasSnapshot::zeros(3);
        assert!(snap.accumulate(&BiasVector::zeros(2)).is_err());
        assert!(BiasSnapshot::zeros(3).with_cumulative(BiasVector::zeros(4)).is_err());
    }

    #[test]
    fn test_residual_injected_combines_scale_terms_only() {
        let mut snap = BiasSnapshot::zeros(1);
        snap.injected.a[0] = 3e-4;
        snap.cumulative.a[0] = -1e-4;
        snap.cumulative.c[0] = 0.5;
        let r = snap.residual_injected();
        assert_relative_eq!(r.a[0], 2e-4, epsilon = 1e-15);
        assert_eq!(r.c[0], 0.0);
    }
}
