//! Per-bin histogram accumulation over the event stream.
//!
//! Every booked histogram is a [`PerBinHistograms`] keyed by `(variant, kind)`.
//! Partial aggregates built on different shards are combined with
//! [`BinnedResidualAggregator::merge`], which is plain bin-wise addition.

use std::collections::BTreeMap;

use ms_core::{Axis, EnabledVariants, Error, EventRecord, PerBinHistograms, Result, Variant};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationTable;
use crate::jacobian::JacobianWeights;

/// Kind of per-bin histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramKind {
    /// Reconstructed mass.
    Mass,
    /// Reconstructed minus truth mass.
    Residual,
    /// Truth mass, binned with the unsmeared reco bin id.
    TruthMass,
    /// Reconstructed mass weighted by the scale jacobian.
    JacobianScale,
    /// Reconstructed mass weighted by the width jacobian.
    JacobianWidth,
}

impl HistogramKind {
    /// Whether this kind lives on the residual axis.
    pub fn is_residual(self) -> bool {
        matches!(self, HistogramKind::Residual)
    }
}

/// One booked histogram collection with its key, as persisted in artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    /// Variant the entries were filled from.
    pub variant: Variant,
    /// What was filled.
    pub kind: HistogramKind,
    /// Contents.
    pub histograms: PerBinHistograms,
}

/// Accumulates per-bin histograms keyed by variant and kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedResidualAggregator {
    n_bins: usize,
    mass_axis: Axis,
    residual_axis: Axis,
    books: BTreeMap<(Variant, HistogramKind), PerBinHistograms>,
}

impl BinnedResidualAggregator {
    /// Empty aggregator for `n_bins` kinematic bins.
    pub fn new(n_bins: usize, mass_axis: Axis, residual_axis: Axis) -> Self {
        Self { n_bins, mass_axis, residual_axis, books: BTreeMap::new() }
    }

    /// Empty aggregator with the same binning and booked keys.
    pub fn empty_like(&self) -> Self {
        let mut out = Self::new(self.n_bins, self.mass_axis, self.residual_axis);
        for &key in self.books.keys() {
            out.book(key.0, key.1);
        }
        out
    }

    /// Number of kinematic bins.
    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    /// Axis of mass and jacobian histograms.
    pub fn mass_axis(&self) -> Axis {
        self.mass_axis
    }

    /// Axis of residual histograms.
    pub fn residual_axis(&self) -> Axis {
        self.residual_axis
    }

    /// Make sure `(variant, kind)` exists even if nothing gets filled.
    pub fn book(&mut self, variant: Variant, kind: HistogramKind) -> &mut PerBinHistograms {
        let axis = if kind.is_residual() { self.residual_axis } else { self.mass_axis };
        let n_bins = self.n_bins;
        self.books.entry((variant, kind)).or_insert_with(|| PerBinHistograms::new(n_bins, axis))
    }

    /// Add one weighted sample to bin `bin` of `(variant, kind)`.
    pub fn accumulate(
        &mut self,
        variant: Variant,
        kind: HistogramKind,
        bin: usize,
        value: f64,
        weight: f64,
    ) {
        self.book(variant, kind).fill(bin, value, weight);
    }

    /// Histograms of `(variant, kind)`.
    pub fn get(&self, variant: Variant, kind: HistogramKind) -> Option<&PerBinHistograms> {
        self.books.get(&(variant, kind))
    }

    /// Like [`Self::get`] but a missing key is an error.
    pub fn require(&self, variant: Variant, kind: HistogramKind) -> Result<&PerBinHistograms> {
        self.get(variant, kind).ok_or_else(|| {
            Error::MissingState(format!("histograms {variant}/{kind:?} were not booked"))
        })
    }

    /// Book the mass and residual histograms of each enabled variant, and the truth
    /// mass when unsmeared reco is enabled.
    pub fn book_mass_stage(&mut self, enabled: EnabledVariants) {
        if enabled.includes_reco() {
            self.book(Variant::Reco, HistogramKind::TruthMass);
        }
        for &v in enabled.list() {
            self.book(v, HistogramKind::Mass);
            self.book(v, HistogramKind::Residual);
        }
    }

    /// Book the jacobian histograms of each enabled variant.
    pub fn book_jacobian_stage(&mut self, enabled: EnabledVariants) {
        for &v in enabled.list() {
            self.book(v, HistogramKind::JacobianScale);
            self.book(v, HistogramKind::JacobianWidth);
        }
    }

    /// Fill mass, residual and truth-mass histograms from one event.
    pub fn fill_mass_stage(&mut self, event: &EventRecord, enabled: EnabledVariants) {
        if enabled.includes_reco() {
            let reco = event.get(Variant::Reco);
            let truth = event.truth_mass;
            self.accumulate(Variant::Reco, HistogramKind::TruthMass, reco.bin, truth, reco.weight);
        }
        for &v in enabled.list() {
            let rec = event.get(v);
            self.accumulate(v, HistogramKind::Mass, rec.bin, rec.mass, rec.weight);
            self.accumulate(v, HistogramKind::Residual, rec.bin, event.residual(v), rec.weight);
        }
    }

    /// Fill jacobian-weighted mass histograms from one event.
    ///
    /// `tables` holds one calibration table per variant; variants without a table are skipped.
    pub fn fill_jacobian_stage(
        &mut self,
        event: &EventRecord,
        enabled: EnabledVariants,
        tables: &[CalibrationTable],
    ) {
        for &v in enabled.list() {
            let Some(table) = tables.iter().find(|t| t.variant == v) else {
                continue;
            };
            let rec = event.get(v);
            let j = JacobianWeights::for_event(event, v, table);
            self.accumulate(v, HistogramKind::JacobianScale, rec.bin, rec.mass, j.scale);
            self.accumulate(v, HistogramKind::JacobianWidth, rec.bin, rec.mass, j.width);
        }
    }

    /// Add another aggregate key by key.
    pub fn merge(&mut self, other: &BinnedResidualAggregator) -> Result<()> {
        if self.n_bins != other.n_bins {
            return Err(Error::Validation(format!(
                "cannot merge aggregates over {} and {} bins",
                self.n_bins, other.n_bins
            )));
        }
        for (key, hists) in &other.books {
            match self.books.get_mut(key) {
                Some(mine) => mine.merge(hists)?,
                None => {
                    self.books.insert(*key, hists.clone());
                }
            }
        }
        Ok(())
    }

    /// Multiply every booked histogram by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.books.values_mut().for_each(|h| h.scale(factor));
    }

    /// Fill a copy of `template` from `events` in parallel.
    ///
    /// Each rayon task fills a private partial aggregate; partials are merged pairwise.
    pub fn par_fill<F>(template: &Self, events: &[EventRecord], fill: F) -> Result<Self>
    where
        F: Fn(&mut Self, &EventRecord) + Sync,
    {
        events
            .par_iter()
            .fold(
                || template.empty_like(),
                |mut acc, ev| {
                    fill(&mut acc, ev);
                    acc
                },
            )
            .map(Ok::<Self, Error>)
            .try_reduce(
                || template.empty_like(),
                |mut a, b| {
                    a.merge(&b)?;
                    Ok(a)
                },
            )
    }

    /// Persistable form of all booked histograms.
    pub fn to_sets(&self) -> Vec<HistogramSet> {
        self.books
            .iter()
            .map(|(&(variant, kind), h)| HistogramSet { variant, kind, histograms: h.clone() })
            .collect()
    }

    /// Rebuild from persisted sets; every set must cover `n_bins` bins.
    pub fn from_sets(
        n_bins: usize,
        mass_axis: Axis,
        residual_axis: Axis,
        sets: Vec<HistogramSet>,
    ) -> Result<Self> {
        let mut out = Self::new(n_bins, mass_axis, residual_axis);
        for set in sets {
            if set.histograms.n_bins != n_bins {
                return Err(Error::SchemaMismatch(format!(
                    "histograms {}/{:?} cover {} bins, expected {}",
                    set.variant, set.kind, set.histograms.n_bins, n_bins
                )));
            }
            out.books.insert((set.variant, set.kind), set.histograms);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ms_core::VariantRecord;
    use proptest::prelude::*;

    const KEYS: [(Variant, HistogramKind); 2] =
        [(Variant::Corrected, HistogramKind::Mass), (Variant::PseudoData, HistogramKind::Residual)];

    fn event(bin: usize, mass: f64, truth: f64, weight: f64) -> EventRecord {
        let rec = VariantRecord { mass, bin, weight };
        EventRecord { truth_mass: truth, variants: [rec, rec, rec] }
    }

    fn aggregator() -> BinnedResidualAggregator {
        let mut a = BinnedResidualAggregator::new(4, Axis::mass(), Axis::residual());
        a.book_mass_stage(EnabledVariants::default());
        a
    }

    #[test]
    fn test_mass_stage_fills_enabled_variants_only() {
        let mut a = aggregator();
        a.fill_mass_stage(&event(2, 91.5, 91.0, 1.0), EnabledVariants::default());
        assert!(a.get(Variant::Reco, HistogramKind::Mass).is_none());
        let m = a.get(Variant::Corrected, HistogramKind::Mass).unwrap();
        assert_relative_eq!(m.projection(2).integral(), 1.0);
        let r = a.get(Variant::PseudoData, HistogramKind::Residual).unwrap();
        assert_relative_eq!(r.projection(2).mean(), 0.75);
    }

    #[test]
    fn test_truth_mass_booked_with_reco() {
        let mut a = BinnedResidualAggregator::new(4, Axis::mass(), Axis::residual());
        let all = EnabledVariants::from_skip_unsmeared_reco(false);
        a.book_mass_stage(all);
        a.fill_mass_stage(&event(1, 91.5, 91.0, 1.0), all);
        let t = a.require(Variant::Reco, HistogramKind::TruthMass).unwrap();
        assert_relative_eq!(t.projection(1).integral(), 1.0);
    }

    #[test]
    fn test_par_fill_matches_serial() {
        let events: Vec<EventRecord> = (0..500)
            .map(|i| event(i % 5, 80.0 + (i % 30) as f64, 80.5 + (i % 29) as f64, 1.0))
            .collect();
        let template = aggregator();
        let enabled = EnabledVariants::default();
        let par = BinnedResidualAggregator::par_fill(&template, &events, |acc, ev| {
            acc.fill_mass_stage(ev, enabled)
        })
        .unwrap();
        let mut serial = template.empty_like();
        events.iter().for_each(|ev| serial.fill_mass_stage(ev, enabled));
        for key in KEYS {
            let (p, s) = (par.get(key.0, key.1).unwrap(), serial.get(key.0, key.1).unwrap());
            assert_eq!(p.invalid_entries, s.invalid_entries);
            for bin in 0..4 {
                let (hp, hs) = (p.projection(bin), s.projection(bin));
                for i in 0..hp.sumw.len() {
                    assert_relative_eq!(hp.sumw[i], hs.sumw[i], epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_sets_round_trip_and_bin_check() {
        let mut a = aggregator();
        a.fill_mass_stage(&event(0, 91.0, 90.0, 2.0), EnabledVariants::default());
        let sets = a.to_sets();
        let (mass, residual) = (Axis::mass(), Axis::residual());
        let back = BinnedResidualAggregator::from_sets(4, mass, residual, sets.clone()).unwrap();
        assert_eq!(back, a);
        assert!(BinnedResidualAggregator::from_sets(5, mass, residual, sets).is_err());
    }

    proptest! {
        #[test]
        fn prop_merge_order_independent(
            fills in proptest::collection::vec(
                (0usize..6, 60.0f64..120.0, -8.0f64..8.0, -1.0f64..1.0),
                0..60,
            ),
            split in 0usize..60,
        ) {
            let enabled = EnabledVariants::default();
            let split = split.min(fills.len());
            let build = |part: &[(usize, f64, f64, f64)]| {
                let mut a = aggregator();
                for &(bin, mass, dm, w) in part {
                    a.fill_mass_stage(&event(bin, mass, mass - dm, w), enabled);
                }
                a
            };
            let (left, right) = (build(&fills[..split]), build(&fills[split..]));
            let mut lr = left.clone();
            lr.merge(&right).unwrap();
            let mut rl = right.clone();
            rl.merge(&left).unwrap();
            for key in KEYS {
                let (a, b) = (lr.get(key.0, key.1).unwrap(), rl.get(key.0, key.1).unwrap());
                prop_assert_eq!(a.invalid_entries, b.invalid_entries);
                for bin in 0..4 {
                    let (ha, hb) = (a.projection(bin), b.projection(bin));
                    for i in 0..ha.sumw.len() {
                        prop_assert!((ha.sumw[i] - hb.sumw[i]).abs() < 1e-9);
                    }
                }
            }
        }
    }
}
