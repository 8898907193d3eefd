//! Deterministic toy smearing of dimuon events.
//!
//! Each generator-level leg is smeared twice in curvature `k = 1/pT`:
//! once with the current simulation correction (the corrected variant) and
//! once with the injected bias (the pseudo-data). Both use the resolution model
//! evaluated at the generator η. Even entries feed the corrected variant and odd
//! entries the pseudo-data, so the two samples are statistically independent.
//!
//! Events are split into contiguous shards; shard `s` at stage `t` draws from
//! `StdRng::seed_from_u64(seed + 10·s + t)`, which makes a run reproducible for
//! a fixed shard count regardless of the thread pool size.

use std::f64::consts::PI;
use std::sync::Arc;

use ms_core::{
    BiasSnapshot, BiasVector, Error, EventRecord, KinematicBinner, ResolutionModel, Result,
    VariantRecord,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Muon rest mass used for four-vectors.
pub const MUON_MASS: f64 = 0.105_658;

const Z_MASS: f64 = 91.1876;
const Z_WIDTH: f64 = 2.4952;
const MIN_GEN_PT: f64 = 10.0;
/// Candidate draws allowed per requested event before generation gives up.
const MAX_TRIES_PER_EVENT: u64 = 1000;

/// `(pT, η, φ, m)` of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegKinematics {
    /// Transverse momentum.
    pub pt: f64,
    /// Pseudorapidity.
    pub eta: f64,
    /// Azimuth.
    pub phi: f64,
    /// Rest mass.
    pub mass: f64,
}

impl LegKinematics {
    /// Leg with the muon mass.
    pub fn muon(pt: f64, eta: f64, phi: f64) -> Self {
        Self { pt, eta, phi, mass: MUON_MASS }
    }

    /// Same direction and mass with a different transverse momentum.
    pub fn with_pt(self, pt: f64) -> Self {
        Self { pt, ..self }
    }

    fn four_vector(&self) -> [f64; 4] {
        let px = self.pt * self.phi.cos();
        let py = self.pt * self.phi.sin();
        let pz = self.pt * self.eta.sinh();
        let e = (px * px + py * py + pz * pz + self.mass * self.mass).sqrt();
        [e, px, py, pz]
    }
}

/// Invariant mass of two legs.
pub fn invariant_mass(a: &LegKinematics, b: &LegKinematics) -> f64 {
    let (p, q) = (a.four_vector(), b.four_vector());
    let e = p[0] + q[0];
    let px = p[1] + q[1];
    let py = p[2] + q[2];
    let pz = p[3] + q[3];
    (e * e - px * px - py * py - pz * pz).max(0.0).sqrt()
}

/// Selected dimuon event at generator and reconstruction level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimuonEvent {
    /// Generator-level positive leg.
    pub gen_plus: LegKinematics,
    /// Generator-level negative leg.
    pub gen_minus: LegKinematics,
    /// Reconstructed positive leg.
    pub reco_plus: LegKinematics,
    /// Reconstructed negative leg.
    pub reco_minus: LegKinematics,
    /// Generator weight; only its sign is used.
    pub gen_weight: f64,
    /// Entry number in the input sample.
    pub entry: u64,
}

/// Correction and injection vectors resolved once per pass.
struct SmearingState {
    correction: BiasVector,
    injected: BiasVector,
    resolution_bias: f64,
}

/// Turns [`DimuonEvent`]s into [`EventRecord`]s for one bias snapshot.
pub struct ToySmearer {
    binner: KinematicBinner,
    resolution: Arc<dyn ResolutionModel>,
    use_mc_as_data: bool,
}

impl ToySmearer {
    /// Smearer over `binner` with the given resolution model.
    pub fn new(binner: KinematicBinner, resolution: Arc<dyn ResolutionModel>) -> Self {
        Self { binner, resolution, use_mc_as_data: false }
    }

    /// Shift curvatures by the reconstructed-minus-generated difference instead of sampling.
    pub fn with_mc_as_data(mut self, use_mc_as_data: bool) -> Self {
        self.use_mc_as_data = use_mc_as_data;
        self
    }

    /// Binning used for the variant bin ids.
    pub fn binner(&self) -> &KinematicBinner {
        &self.binner
    }

    fn state(snapshot: &BiasSnapshot) -> SmearingState {
        SmearingState {
            correction: snapshot.correction(),
            injected: snapshot.injected.clone(),
            resolution_bias: snapshot.resolution_bias,
        }
    }

    /// Smear one event; `None` when a generator leg fails the selection.
    pub fn smear_event<R: Rng + ?Sized>(
        &self,
        event: &DimuonEvent,
        snapshot: &BiasSnapshot,
        rng: &mut R,
    ) -> Option<EventRecord> {
        self.smear_with(event, &Self::state(snapshot), rng)
    }

    fn smear_with<R: Rng + ?Sized>(
        &self,
        event: &DimuonEvent,
        state: &SmearingState,
        rng: &mut R,
    ) -> Option<EventRecord> {
        let (gp, gm) = (&event.gen_plus, &event.gen_minus);
        if gp.pt <= MIN_GEN_PT || gm.pt <= MIN_GEN_PT {
            return None;
        }
        let slot_p = self.binner.eta_slot(gp.eta)?;
        let slot_m = self.binner.eta_slot(gm.eta)?;
        let (kp, km) = (1.0 / gp.pt, 1.0 / gm.pt);
        let (rp, rm) = (&event.reco_plus, &event.reco_minus);

        let scales = |v: &BiasVector| {
            (v.curvature_scale(slot_p, kp, true), v.curvature_scale(slot_m, km, false))
        };
        let corr = &state.correction;
        let scale0 = scales(corr);
        let resol0 = (corr.resolution_factor(slot_p, kp), corr.resolution_factor(slot_m, km));
        let scale1 = scales(&state.injected);
        let resol1 = state.resolution_bias;

        let (k0p, k0m, k1p, k1m) = if self.use_mc_as_data {
            let shift = |k: f64, reco: &LegKinematics, resol: f64, scale: f64| {
                (k + (1.0 / reco.pt - k) * (1.0 + resol)) * scale
            };
            (
                shift(kp, rp, resol0.0, scale0.0),
                shift(km, rm, resol0.1, scale0.1),
                shift(kp, rp, resol1, scale1.0),
                shift(km, rm, resol1, scale1.1),
            )
        } else {
            let res = &self.resolution;
            let k0p = gauss(rng, kp * scale0.0, res.resolution(kp, gp.eta, resol0.0));
            let k0m = gauss(rng, km * scale0.1, res.resolution(km, gm.eta, resol0.1));
            let k1p = gauss(rng, kp * scale1.0, res.resolution(kp, gp.eta, resol1));
            let k1m = gauss(rng, km * scale1.1, res.resolution(km, gm.eta, resol1));
            (k0p, k0m, k1p, k1m)
        };
        // Non-positive curvatures are pushed just below the first pT edge.
        let below = self.binner.pt_edges()[0] - 0.01;
        let pt_of = |k: f64| if k > 0.0 { 1.0 / k } else { below };

        let smeared = |k_plus: f64, k_minus: f64| {
            let plus = rp.with_pt(pt_of(k_plus));
            let minus = rm.with_pt(pt_of(k_minus));
            let bin = self.binner.classify(plus.eta, plus.pt, minus.eta, minus.pt);
            (invariant_mass(&plus, &minus), bin)
        };

        let sign = if event.gen_weight < 0.0 { -1.0 } else { 1.0 };
        let even = if event.entry % 2 == 0 { 1.0 } else { 0.0 };
        let (m0, bin0) = smeared(k0p, k0m);
        let (m1, bin1) = smeared(k1p, k1m);
        let reco = VariantRecord {
            mass: invariant_mass(rp, rm),
            bin: self.binner.classify(rp.eta, rp.pt, rm.eta, rm.pt),
            weight: sign,
        };
        Some(EventRecord {
            truth_mass: invariant_mass(gp, gm),
            variants: [
                reco,
                VariantRecord { mass: m0, bin: bin0, weight: sign * even },
                VariantRecord { mass: m1, bin: bin1, weight: sign * (1.0 - even) },
            ],
        })
    }

    /// Smear all `events` in `n_slots` contiguous shards, in parallel.
    ///
    /// The output preserves input order; dropped events leave no record.
    pub fn smear_all(
        &self,
        events: &[DimuonEvent],
        snapshot: &BiasSnapshot,
        seed: u64,
        stage: u64,
        n_slots: usize,
    ) -> Vec<EventRecord> {
        let state = Self::state(snapshot);
        let n_slots = n_slots.max(1);
        let shard_len = events.len().div_ceil(n_slots).max(1);
        let shards: Vec<Vec<EventRecord>> = events
            .par_chunks(shard_len)
            .enumerate()
            .map(|(slot, shard)| {
                let mut rng = StdRng::seed_from_u64(slot_seed(seed, slot, stage));
                shard.iter().filter_map(|ev| self.smear_with(ev, &state, &mut rng)).collect()
            })
            .collect();
        let out: Vec<EventRecord> = shards.into_iter().flatten().collect();
        tracing::debug!(
            input = events.len(),
            kept = out.len(),
            shards = events.len().div_ceil(shard_len),
            stage,
            "events smeared"
        );
        out
    }
}

/// RNG seed of shard `slot` at stage `stage`.
pub fn slot_seed(seed: u64, slot: usize, stage: u64) -> u64 {
    seed.wrapping_add(10 * slot as u64).wrapping_add(stage)
}

fn gauss<R: Rng + ?Sized>(rng: &mut R, mean: f64, sigma: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    if sigma > 0.0 { mean + sigma * z } else { mean }
}

/// Draw the biases injected into the pseudo-data.
///
/// `bias_resolution < 0` disables the resolution bias. The momentum-scale terms
/// follow a smooth η dependence for `A`, and flat ranges for `e` and `M` scaled
/// by the mean curvature of the binning.
pub fn sample_injected_bias(
    binner: &KinematicBinner,
    seed: u64,
    bias_resolution: f64,
) -> BiasSnapshot {
    let mut rng = StdRng::seed_from_u64(seed);
    let ne = binner.n_eta_bins();
    let mut snapshot = BiasSnapshot::zeros(ne);
    if bias_resolution > 0.0 {
        snapshot.resolution_bias = rng.random_range(-bias_resolution..bias_resolution);
    }
    let r = rng.random_range(-1e-3..1e-3);
    let eta_max = binner.eta_max();
    let kmean = binner.mean_curvature();
    let inj = &mut snapshot.injected;
    for i in 0..ne {
        let x = binner.eta_center(i) / eta_max;
        inj.a[i] = r * (1.0 + x * x);
    }
    for i in 0..ne {
        inj.e[i] = rng.random_range(-1e-4 / kmean..1e-4 / kmean);
    }
    for i in 0..ne {
        inj.m[i] = rng.random_range(-1e-3 * kmean..1e-3 * kmean);
    }
    tracing::debug!(seed, resolution_bias = snapshot.resolution_bias, "injected bias sampled");
    snapshot
}

/// Generate `n` toy Z→μμ events inside the acceptance of `binner`.
///
/// Truth masses follow a Breit-Wigner truncated to `[70, 110]`; the negative
/// leg's momentum is solved from the mass so both legs land in the pT range.
/// Reconstructed legs carry a 1% Gaussian momentum smearing.
///
/// Fails with [`Error::Validation`] when the acceptance is too small to fill the
/// sample within a bounded number of candidate draws.
pub fn generate_dimuons(binner: &KinematicBinner, n: usize, seed: u64) -> Result<Vec<DimuonEvent>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let eta = binner.eta_edges();
    let (eta_lo, eta_hi) = (eta[0], eta[eta.len() - 1]);
    let pt = binner.pt_edges();
    let (pt_lo, pt_hi) = (pt[0], pt[pt.len() - 1]);

    let mut out = Vec::with_capacity(n);
    let mut entry = 0u64;
    let max_tries = MAX_TRIES_PER_EVENT.saturating_mul(n as u64);
    let mut tries = 0u64;
    while out.len() < n {
        if tries >= max_tries {
            return Err(Error::Validation(format!(
                "toy generation accepted {} of {n} events in {tries} draws; \
                 pT acceptance [{pt_lo}, {pt_hi}) is too small for this eta range",
                out.len()
            )));
        }
        tries += 1;
        let mass = loop {
            let u: f64 = rng.random_range(-0.5..0.5);
            let m = Z_MASS + 0.5 * Z_WIDTH * (PI * u).tan();
            if (70.0..110.0).contains(&m) {
                break m;
            }
        };
        let eta_p = rng.random_range(eta_lo..eta_hi);
        let eta_m = rng.random_range(eta_lo..eta_hi);
        let phi_p = rng.random_range(-PI..PI);
        let phi_m = phi_p + PI + rng.random_range(-0.3..0.3);
        let pt_p = rng.random_range(pt_lo..pt_hi);
        let denom = 2.0 * pt_p * ((eta_p - eta_m).cosh() - (phi_p - phi_m).cos());
        if denom <= 0.0 {
            continue;
        }
        let pt_m = mass * mass / denom;
        if !(pt_lo..pt_hi).contains(&pt_m) {
            continue;
        }
        let gen_plus = LegKinematics::muon(pt_p, eta_p, phi_p);
        let gen_minus = LegKinematics::muon(pt_m, eta_m, phi_m);
        let z_p: f64 = StandardNormal.sample(&mut rng);
        let z_m: f64 = StandardNormal.sample(&mut rng);
        out.push(DimuonEvent {
            gen_plus,
            gen_minus,
            reco_plus: gen_plus.with_pt(pt_p * (1.0 + 0.01 * z_p)),
            reco_minus: gen_minus.with_pt(pt_m * (1.0 + 0.01 * z_m)),
            gen_weight: 1.0,
            entry,
        });
        entry += 1;
    }
    tracing::debug!(n, tries, "toy events generated");
    Ok(out)
}

/// Source of per-event records for one stage.
pub trait EventFeed: Send + Sync {
    /// Records for `stage` under the bias state `snapshot`.
    fn records(&self, stage: u64, snapshot: &BiasSnapshot) -> Result<Vec<EventRecord>>;
}

/// Feed that smears a fixed dimuon sample at every stage.
pub struct ToyFeed {
    smearer: ToySmearer,
    events: Vec<DimuonEvent>,
    seed: u64,
    n_slots: usize,
}

impl ToyFeed {
    /// Feed over `events`, smeared with shard seeds derived from `seed`.
    pub fn new(smearer: ToySmearer, events: Vec<DimuonEvent>, seed: u64, n_slots: usize) -> Self {
        Self { smearer, events, seed, n_slots }
    }

    /// Number of input events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the feed has no input events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventFeed for ToyFeed {
    fn records(&self, stage: u64, snapshot: &BiasSnapshot) -> Result<Vec<EventRecord>> {
        snapshot.injected.validate(self.smearer.binner().n_eta_bins())?;
        Ok(self.smearer.smear_all(&self.events, snapshot, self.seed, stage, self.n_slots))
    }
}

/// Feed of records produced elsewhere; the snapshot is ignored.
pub struct RecordFeed {
    records: Vec<EventRecord>,
}

impl RecordFeed {
    /// Feed returning `records` at every stage.
    pub fn new(records: Vec<EventRecord>) -> Self {
        Self { records }
    }
}

impl EventFeed for RecordFeed {
    fn records(&self, _stage: u64, _snapshot: &BiasSnapshot) -> Result<Vec<EventRecord>> {
        Ok(self.records.clone())
    }
}
