use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ms_core::{Axis, EnabledVariants, EventRecord, Variant, VariantRecord};
use ms_inference::{
    BinnedResidualAggregator, CalibrationConfig, FitInputs, FitterConfig, HistogramKind,
    PerBinCalibrator, SliceData, VarianceModel, WeightedLeastSquaresFitter,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::hint::black_box;

fn make_slices(n: usize, seed: u64) -> SliceData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut s = SliceData::default();
    for i in 0..n {
        let x = (i as f64 + 0.5) / n as f64 * 6.0 - 3.0;
        let y0 = 1e4 * (-0.5 * x * x).exp();
        let noise: f64 = StandardNormal.sample(&mut rng);
        s.index.push(i);
        s.y0.push(y0);
        s.y0_err.push(y0.sqrt());
        s.j_scale.push(-x * y0 * 30.0);
        s.j_width.push((x * x - 1.0) * y0);
        s.y.push(y0 + noise * y0.sqrt());
    }
    s
}

fn make_records(n_bins: usize, n: usize, seed: u64) -> Vec<EventRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let bin = rng.random_range(0..n_bins);
            let g: f64 = StandardNormal.sample(&mut rng);
            let z: f64 = StandardNormal.sample(&mut rng);
            let truth = 91.19 + 2.0 * g;
            let mass = truth + 1.3 * z;
            let w = if i % 2 == 0 { 1.0 } else { 0.0 };
            EventRecord {
                truth_mass: truth,
                variants: [
                    VariantRecord { mass, bin, weight: 1.0 },
                    VariantRecord { mass, bin, weight: w },
                    VariantRecord { mass, bin, weight: 1.0 - w },
                ],
            }
        })
        .collect()
}

fn bench_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("wls/solve");
    for fit_width in [false, true] {
        let config = FitterConfig {
            fit_width,
            fit_norm: fit_width,
            variance_model: VarianceModel::CountingData,
            ..FitterConfig::default()
        };
        let fitter = WeightedLeastSquaresFitter::new(config);
        for n in [8usize, 20, 80] {
            let slices = make_slices(n, 7);
            group.bench_with_input(
                BenchmarkId::new(format!("params={}", fitter.config().n_params()), n),
                &slices,
                |b, slices| b.iter(|| black_box(fitter.solve(black_box(slices)).unwrap())),
            );
        }
    }
    group.finish();
}

fn bench_fit_all(c: &mut Criterion) {
    let enabled = EnabledVariants::default();
    let mut group = c.benchmark_group("wls/fit_all");
    group.sample_size(20);
    for n_bins in [16usize, 256] {
        let records = make_records(n_bins, 200 * n_bins * 10, 11);
        let mut template = BinnedResidualAggregator::new(n_bins, Axis::mass(), Axis::residual());
        template.book_mass_stage(enabled);
        let mass = BinnedResidualAggregator::par_fill(&template, &records, |a, ev| {
            a.fill_mass_stage(ev, enabled)
        })
        .unwrap();
        let table = PerBinCalibrator::new(CalibrationConfig::default())
            .calibrate(
                Variant::Corrected,
                mass.require(Variant::Corrected, HistogramKind::Mass).unwrap(),
                mass.require(Variant::Corrected, HistogramKind::Residual).unwrap(),
            )
            .unwrap();
        let mut template = BinnedResidualAggregator::new(n_bins, Axis::mass(), Axis::residual());
        template.book_jacobian_stage(enabled);
        let tables = [table.clone()];
        let jac = BinnedResidualAggregator::par_fill(&template, &records, |a, ev| {
            a.fill_jacobian_stage(ev, enabled, &tables)
        })
        .unwrap();
        let inputs = FitInputs {
            data: mass.require(Variant::PseudoData, HistogramKind::Mass).unwrap(),
            nominal: mass.require(Variant::Corrected, HistogramKind::Mass).unwrap(),
            jac_scale: jac.require(Variant::Corrected, HistogramKind::JacobianScale).unwrap(),
            jac_width: jac.require(Variant::Corrected, HistogramKind::JacobianWidth).unwrap(),
            residual: mass.require(Variant::Corrected, HistogramKind::Residual).unwrap(),
            calibration: &table,
        };
        let fitter = WeightedLeastSquaresFitter::new(FitterConfig::default());
        group.bench_function(BenchmarkId::from_parameter(n_bins), |b| {
            b.iter(|| black_box(fitter.fit_all(black_box(&inputs)).unwrap().rows.len()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_solve, bench_fit_all);
criterion_main!(benches);
