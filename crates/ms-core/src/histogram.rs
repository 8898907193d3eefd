//! Weighted fixed-width histograms and per-bin histogram collections.
//!
//! [`PerBinHistograms`] plays the role of a 2D histogram whose x axis is the
//! linear kinematic bin id: one [`Histogram1D`] per occupied bin, stored sparsely.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Uniform axis `[low, high)` with `n_bins` equal-width bins.
///
/// Deserialisation goes through [`Axis::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisSpec")]
pub struct Axis {
    /// Number of bins (excluding under/overflow).
    pub n_bins: usize,
    /// Lower edge of the first bin.
    pub low: f64,
    /// Upper edge of the last bin.
    pub high: f64,
}

impl Axis {
    /// Create an axis; requires `n_bins > 0` and `low < high`.
    pub fn new(n_bins: usize, low: f64, high: f64) -> Result<Self> {
        if n_bins == 0 {
            return Err(Error::Validation("axis needs at least one bin".into()));
        }
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(Error::Validation(format!("invalid axis range [{low}, {high})")));
        }
        Ok(Self { n_bins, low, high })
    }

    /// Dilepton mass axis: 40 bins over `[70, 110)` GeV.
    pub fn mass() -> Self {
        Self { n_bins: 40, low: 70.0, high: 110.0 }
    }

    /// Reconstructed-minus-true mass axis: 24 bins over `[-6, 6)` GeV.
    pub fn residual() -> Self {
        Self { n_bins: 24, low: -6.0, high: 6.0 }
    }

    /// Bin width.
    pub fn width(&self) -> f64 {
        (self.high - self.low) / self.n_bins as f64
    }

    /// Bin index of `x`, `None` for under/overflow and NaN.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if self.n_bins == 0 || !(x >= self.low && x < self.high) {
            return None;
        }
        let i = ((x - self.low) / self.width()) as usize;
        Some(i.min(self.n_bins - 1))
    }

    /// Lower edge of bin `i`.
    pub fn low_edge(&self, i: usize) -> f64 {
        self.low + i as f64 * self.width()
    }

    /// Centre of bin `i`.
    pub fn center(&self, i: usize) -> f64 {
        self.low + (i as f64 + 0.5) * self.width()
    }

    /// Axis with groups of `factor` consecutive bins merged.
    pub fn rebinned(&self, factor: usize) -> Result<Self> {
        if factor == 0 || self.n_bins % factor != 0 {
            return Err(Error::Validation(format!(
                "rebin factor {factor} does not divide {} bins",
                self.n_bins
            )));
        }
        Ok(Self { n_bins: self.n_bins / factor, low: self.low, high: self.high })
    }
}

#[derive(Deserialize)]
struct AxisSpec {
    n_bins: usize,
    low: f64,
    high: f64,
}

impl TryFrom<AxisSpec> for Axis {
    type Error = Error;

    fn try_from(spec: AxisSpec) -> Result<Self> {
        Axis::new(spec.n_bins, spec.low, spec.high)
    }
}

/// Weighted 1D histogram with per-bin sum of squared weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    /// Binning.
    pub axis: Axis,
    /// Sum of weights per bin.
    pub sumw: Vec<f64>,
    /// Sum of squared weights per bin.
    pub sumw2: Vec<f64>,
    /// Sum of weights below the axis.
    pub underflow: f64,
    /// Sum of weights at or above the axis upper edge.
    pub overflow: f64,
    /// Number of fill calls, including under/overflow.
    pub entries: u64,
}

impl Histogram1D {
    /// Empty histogram.
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            sumw: vec![0.0; axis.n_bins],
            sumw2: vec![0.0; axis.n_bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        }
    }

    /// Histogram with given contents and errors (`sumw2 = err²`).
    pub fn from_contents(axis: Axis, contents: Vec<f64>, errors: Vec<f64>) -> Result<Self> {
        if contents.len() != axis.n_bins || errors.len() != axis.n_bins {
            return Err(Error::Validation(format!(
                "expected {} bins, got {} contents and {} errors",
                axis.n_bins,
                contents.len(),
                errors.len()
            )));
        }
        let sumw2 = errors.iter().map(|e| e * e).collect();
        Ok(Self { axis, sumw: contents, sumw2, underflow: 0.0, overflow: 0.0, entries: 0 })
    }

    /// Add `weight` at `x`. Non-finite `x` is ignored.
    pub fn fill(&mut self, x: f64, weight: f64) {
        if x.is_nan() {
            return;
        }
        self.entries += 1;
        match self.axis.find_bin(x) {
            Some(i) => {
                self.sumw[i] += weight;
                self.sumw2[i] += weight * weight;
            }
            None if x < self.axis.low => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    /// Content of bin `i`.
    pub fn content(&self, i: usize) -> f64 {
        self.sumw[i]
    }

    /// Statistical error of bin `i`.
    pub fn error(&self, i: usize) -> f64 {
        self.sumw2[i].sqrt()
    }

    /// Sum of in-range contents.
    pub fn integral(&self) -> f64 {
        self.sumw.iter().sum()
    }

    /// Weighted mean of bin centres (0 for an empty histogram).
    pub fn mean(&self) -> f64 {
        let sw = self.integral();
        if sw <= 0.0 {
            return 0.0;
        }
        let swx: f64 = self.sumw.iter().enumerate().map(|(i, w)| w * self.axis.center(i)).sum();
        swx / sw
    }

    /// Weighted standard deviation of bin centres (0 for an empty histogram).
    pub fn rms(&self) -> f64 {
        let sw = self.integral();
        if sw <= 0.0 {
            return 0.0;
        }
        let mean = self.mean();
        let swx2: f64 = self
            .sumw
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let dx = self.axis.center(i) - mean;
                w * dx * dx
            })
            .sum();
        (swx2 / sw).max(0.0).sqrt()
    }

    /// Merge groups of `factor` consecutive bins.
    pub fn rebin(&self, factor: usize) -> Result<Histogram1D> {
        let axis = self.axis.rebinned(factor)?;
        let group = |v: &[f64]| v.chunks(factor).map(|c| c.iter().sum()).collect();
        Ok(Histogram1D {
            axis,
            sumw: group(&self.sumw),
            sumw2: group(&self.sumw2),
            underflow: self.underflow,
            overflow: self.overflow,
            entries: self.entries,
        })
    }

    /// Add another histogram with the same axis.
    pub fn add(&mut self, other: &Histogram1D) -> Result<()> {
        if self.axis != other.axis {
            return Err(Error::Validation(format!(
                "cannot add histograms with different axes: {:?} vs {:?}",
                self.axis, other.axis
            )));
        }
        for (a, b) in self.sumw.iter_mut().zip(&other.sumw) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    /// Multiply all contents by `factor` (errors scale with `|factor|`).
    pub fn scale(&mut self, factor: f64) {
        let f2 = factor * factor;
        self.sumw.iter_mut().for_each(|w| *w *= factor);
        self.sumw2.iter_mut().for_each(|w| *w *= f2);
        self.underflow *= factor;
        self.overflow *= factor;
    }
}

/// One [`Histogram1D`] per linear kinematic bin, stored sparsely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerBinHistograms {
    /// Axis shared by every per-bin histogram.
    pub axis: Axis,
    /// Number of valid kinematic bins.
    pub n_bins: usize,
    /// Occupied bins.
    pub bins: BTreeMap<usize, Histogram1D>,
    /// Fill calls with an unclassifiable bin id.
    pub invalid_entries: u64,
}

impl PerBinHistograms {
    /// Empty collection.
    pub fn new(n_bins: usize, axis: Axis) -> Self {
        Self { axis, n_bins, bins: BTreeMap::new(), invalid_entries: 0 }
    }

    /// Add `weight` at `x` in kinematic bin `bin`. Ids `>= n_bins` are counted and dropped.
    pub fn fill(&mut self, bin: usize, x: f64, weight: f64) {
        if bin >= self.n_bins {
            self.invalid_entries += 1;
            return;
        }
        let axis = self.axis;
        self.bins.entry(bin).or_insert_with(|| Histogram1D::new(axis)).fill(x, weight);
    }

    /// Histogram of bin `bin`, if anything was filled there.
    pub fn get(&self, bin: usize) -> Option<&Histogram1D> {
        self.bins.get(&bin)
    }

    /// Histogram of bin `bin`, empty if nothing was filled there.
    pub fn projection(&self, bin: usize) -> Histogram1D {
        self.bins.get(&bin).cloned().unwrap_or_else(|| Histogram1D::new(self.axis))
    }

    /// Ids of bins that received at least one fill.
    pub fn occupied_bins(&self) -> impl Iterator<Item = usize> + '_ {
        self.bins.keys().copied()
    }

    /// Add another collection bin by bin. Addition makes this commutative and associative.
    pub fn merge(&mut self, other: &PerBinHistograms) -> Result<()> {
        if self.axis != other.axis || self.n_bins != other.n_bins {
            return Err(Error::Validation(format!(
                "cannot merge per-bin histograms: ({}, {:?}) vs ({}, {:?})",
                self.n_bins, self.axis, other.n_bins, other.axis
            )));
        }
        for (&bin, h) in &other.bins {
            match self.bins.get_mut(&bin) {
                Some(mine) => mine.add(h)?,
                None => {
                    self.bins.insert(bin, h.clone());
                }
            }
        }
        self.invalid_entries += other.invalid_entries;
        Ok(())
    }

    /// Multiply every per-bin histogram by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.bins.values_mut().for_each(|h| h.scale(factor));
    }

    /// Sum of all in-range contents.
    pub fn integral(&self) -> f64 {
        self.bins.values().map(Histogram1D::integral).sum()
    }

    /// Total fill calls, including dropped ones.
    pub fn total_entries(&self) -> u64 {
        self.bins.values().map(|h| h.entries).sum::<u64>() + self.invalid_entries
    }
}
