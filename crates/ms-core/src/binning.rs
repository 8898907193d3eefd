//! 4D kinematic binning of muon pairs.
//!
//! A pair is classified by the pseudorapidity and transverse-momentum slots of
//! its positive and negative legs. The four slot indices collapse into one
//! linear bin id by mixed-radix encoding with the fixed order
//! `η+ → pT+ → η− → pT−` (outermost first). The id `n_bins()` is reserved for
//! pairs that cannot be classified.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default transverse-momentum edges (GeV).
pub const DEFAULT_PT_EDGES: [f64; 7] = [25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0];

/// Default pseudorapidity edges: 24 slots of width 0.2 over `[-2.4, 2.4]`.
pub fn default_eta_edges() -> Vec<f64> {
    (0..=24).map(|i| ((-24 + 2 * i) as f64) / 10.0).collect()
}

/// Slot indices of one 4D kinematic bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KinematicIndex {
    /// Pseudorapidity slot of the positive leg.
    pub eta_plus: usize,
    /// Momentum slot of the positive leg.
    pub pt_plus: usize,
    /// Pseudorapidity slot of the negative leg.
    pub eta_minus: usize,
    /// Momentum slot of the negative leg.
    pub pt_minus: usize,
}

/// Edge intervals `[low, up)` of a decoded bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinRanges {
    /// η interval of the positive leg.
    pub eta_plus: (f64, f64),
    /// pT interval of the positive leg.
    pub pt_plus: (f64, f64),
    /// η interval of the negative leg.
    pub eta_minus: (f64, f64),
    /// pT interval of the negative leg.
    pub pt_minus: (f64, f64),
}

/// Serializable description of a binning, stamped into every persisted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSchema {
    /// Pseudorapidity edges.
    pub eta_edges: Vec<f64>,
    /// Transverse-momentum edges.
    pub pt_edges: Vec<f64>,
    /// Number of valid linear bins.
    pub n_bins: usize,
}

impl BinSchema {
    /// Fail with [`Error::SchemaMismatch`] unless `other` describes the same binning.
    pub fn ensure_matches(&self, other: &BinSchema) -> Result<()> {
        if self.n_bins != other.n_bins {
            return Err(Error::SchemaMismatch(format!(
                "bin count differs: expected {}, found {}",
                self.n_bins, other.n_bins
            )));
        }
        if !edges_equal(&self.eta_edges, &other.eta_edges) {
            return Err(Error::SchemaMismatch("pseudorapidity edges differ".into()));
        }
        if !edges_equal(&self.pt_edges, &other.pt_edges) {
            return Err(Error::SchemaMismatch("transverse-momentum edges differ".into()));
        }
        Ok(())
    }
}

fn edges_equal(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-9 * x.abs().max(1.0))
}

/// Deterministic mapping between slot 4-tuples and linear bin ids.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicBinner {
    eta_edges: Vec<f64>,
    pt_edges: Vec<f64>,
}

impl Default for KinematicBinner {
    fn default() -> Self {
        Self { eta_edges: default_eta_edges(), pt_edges: DEFAULT_PT_EDGES.to_vec() }
    }
}

impl KinematicBinner {
    /// Create a binner from strictly increasing edge arrays (at least two edges each).
    pub fn new(eta_edges: Vec<f64>, pt_edges: Vec<f64>) -> Result<Self> {
        validate_edges("eta", &eta_edges)?;
        validate_edges("pt", &pt_edges)?;
        if pt_edges[0] <= 0.0 {
            return Err(Error::Validation(format!(
                "pt edges must be positive (first edge = {})",
                pt_edges[0]
            )));
        }
        Ok(Self { eta_edges, pt_edges })
    }

    /// Rebuild a binner from a persisted schema.
    pub fn from_schema(schema: &BinSchema) -> Result<Self> {
        let binner = Self::new(schema.eta_edges.clone(), schema.pt_edges.clone())?;
        if binner.n_bins() != schema.n_bins {
            return Err(Error::SchemaMismatch(format!(
                "schema declares {} bins but edges imply {}",
                schema.n_bins,
                binner.n_bins()
            )));
        }
        Ok(binner)
    }

    /// Schema of this binning.
    pub fn schema(&self) -> BinSchema {
        BinSchema {
            eta_edges: self.eta_edges.clone(),
            pt_edges: self.pt_edges.clone(),
            n_bins: self.n_bins(),
        }
    }

    /// Pseudorapidity edges.
    pub fn eta_edges(&self) -> &[f64] {
        &self.eta_edges
    }

    /// Transverse-momentum edges.
    pub fn pt_edges(&self) -> &[f64] {
        &self.pt_edges
    }

    /// Number of pseudorapidity slots.
    pub fn n_eta_bins(&self) -> usize {
        self.eta_edges.len() - 1
    }

    /// Number of momentum slots.
    pub fn n_pt_bins(&self) -> usize {
        self.pt_edges.len() - 1
    }

    /// Number of valid linear bins.
    pub fn n_bins(&self) -> usize {
        let ne = self.n_eta_bins();
        let np = self.n_pt_bins();
        ne * np * ne * np
    }

    /// Reserved id for pairs outside the binning.
    pub fn invalid_bin(&self) -> usize {
        self.n_bins()
    }

    /// Encode a 4-tuple into a linear id; out-of-range tuples map to [`Self::invalid_bin`].
    pub fn encode(&self, idx: KinematicIndex) -> usize {
        let ne = self.n_eta_bins();
        let np = self.n_pt_bins();
        if idx.eta_plus >= ne || idx.pt_plus >= np || idx.eta_minus >= ne || idx.pt_minus >= np {
            return self.invalid_bin();
        }
        ((idx.eta_plus * np + idx.pt_plus) * ne + idx.eta_minus) * np + idx.pt_minus
    }

    /// Decode a linear id. Returns `None` for the invalid id and anything beyond it.
    pub fn decode(&self, bin: usize) -> Option<KinematicIndex> {
        if bin >= self.n_bins() {
            return None;
        }
        let ne = self.n_eta_bins();
        let np = self.n_pt_bins();
        let pt_minus = bin % np;
        let rest = bin / np;
        let eta_minus = rest % ne;
        let rest = rest / ne;
        let pt_plus = rest % np;
        let eta_plus = rest / np;
        Some(KinematicIndex { eta_plus, pt_plus, eta_minus, pt_minus })
    }

    /// Edge intervals of a valid bin.
    pub fn decode_range(&self, bin: usize) -> Option<BinRanges> {
        let idx = self.decode(bin)?;
        let eta = |i: usize| (self.eta_edges[i], self.eta_edges[i + 1]);
        let pt = |i: usize| (self.pt_edges[i], self.pt_edges[i + 1]);
        Some(BinRanges {
            eta_plus: eta(idx.eta_plus),
            pt_plus: pt(idx.pt_plus),
            eta_minus: eta(idx.eta_minus),
            pt_minus: pt(idx.pt_minus),
        })
    }

    /// Pseudorapidity slot of `eta` (half-open intervals), `None` outside.
    pub fn eta_slot(&self, eta: f64) -> Option<usize> {
        find_slot(&self.eta_edges, eta)
    }

    /// Momentum slot of `pt` (half-open intervals), `None` outside.
    pub fn pt_slot(&self, pt: f64) -> Option<usize> {
        find_slot(&self.pt_edges, pt)
    }

    /// Classify a pair directly from its leg kinematics.
    pub fn classify(&self, eta_plus: f64, pt_plus: f64, eta_minus: f64, pt_minus: f64) -> usize {
        match (
            self.eta_slot(eta_plus),
            self.pt_slot(pt_plus),
            self.eta_slot(eta_minus),
            self.pt_slot(pt_minus),
        ) {
            (Some(eta_plus), Some(pt_plus), Some(eta_minus), Some(pt_minus)) => {
                self.encode(KinematicIndex { eta_plus, pt_plus, eta_minus, pt_minus })
            }
            _ => self.invalid_bin(),
        }
    }

    /// Centre of a pseudorapidity slot.
    pub fn eta_center(&self, slot: usize) -> f64 {
        0.5 * (self.eta_edges[slot] + self.eta_edges[slot + 1])
    }

    /// Largest pseudorapidity edge.
    pub fn eta_max(&self) -> f64 {
        self.eta_edges[self.eta_edges.len() - 1]
    }

    /// Mean of `1/low` and `1/up` for a momentum slot.
    pub fn representative_curvature(&self, pt_slot: usize) -> f64 {
        0.5 * (1.0 / self.pt_edges[pt_slot] + 1.0 / self.pt_edges[pt_slot + 1])
    }

    /// Mean curvature over the full momentum range.
    pub fn mean_curvature(&self) -> f64 {
        0.5 * (1.0 / self.pt_edges[0] + 1.0 / self.pt_edges[self.pt_edges.len() - 1])
    }
}

fn validate_edges(name: &str, edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::Validation(format!("{name} edges need at least 2 entries")));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(Error::Validation(format!("{name} edges must be finite")));
    }
    if edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation(format!("{name} edges must be strictly increasing")));
    }
    Ok(())
}

fn find_slot(edges: &[f64], x: f64) -> Option<usize> {
    let i = edges.partition_point(|&e| e <= x);
    if i == 0 || i == edges.len() { None } else { Some(i - 1) }
}
