//! Full three-stage runs through `IterationController` against a temporary store.

use std::path::PathBuf;
use std::sync::Arc;

use approx::assert_relative_eq;
use ms_core::{BiasCoefficient, Error, FallbackResolution, FitStatus, KinematicBinner};
use ms_inference::{
    IterationController, PipelineConfig, RunRef, RunStore, Stage, Stage2Artifact, ToyFeed,
    ToySmearer, generate_dimuons,
};

fn temp_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ms-e2e-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn config(run: &str) -> PipelineConfig {
    PipelineConfig {
        tag: "e2e".into(),
        run: run.into(),
        eta_edges: vec![-1.2, 0.0, 1.2],
        pt_edges: vec![25.0, 38.0, 55.0],
        lumi: -1.0,
        n_slots: 4,
        ..Default::default()
    }
}

fn feed(config: &PipelineConfig, n_events: usize) -> ToyFeed {
    let binner = config.binner().unwrap();
    let events = generate_dimuons(&binner, n_events, 23).unwrap();
    let smearer = ToySmearer::new(binner, Arc::new(FallbackResolution));
    ToyFeed::new(smearer, events, config.seed, config.n_slots)
}

#[test]
fn test_full_run_writes_all_outputs() {
    let root = temp_root("full");
    let cfg = config("0");
    let feed = feed(&cfg, 60_000);
    let controller = IterationController::new(cfg, RunStore::new(&root))
        .unwrap()
        .with_config_sha256("abc123");
    let report = controller.run(&feed).unwrap();

    let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    assert_eq!(report.config_sha256.as_deref(), Some("abc123"));
    assert!(report.stages[0].n_events > 50_000);
    assert!(report.stages[2].fitted > 0);
    assert_eq!(report.stages[2].fitted + report.stages[2].masked, controller.binner().n_bins());

    let dir = controller.store().run_dir("e2e", "0");
    for name in
        ["stage0.json", "stage1.json", "stage2.json", "calibration.csv", "fit_results.csv"]
    {
        assert!(dir.join(name).is_file(), "{name} missing");
    }
    let json = std::fs::read_to_string(dir.join("report.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["stages"].as_array().unwrap().len(), 3);
    assert_eq!(value["config_sha256"], "abc123");

    let csv = std::fs::read_to_string(dir.join("fit_results.csv")).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().ends_with("mask,status"));
    assert!(lines.any(|l| l.ends_with("fitted")));

    let s2: Stage2Artifact = controller.store().load(&controller.header(Stage::Fit)).unwrap();
    assert_eq!(s2.header.config_sha256.as_deref(), Some("abc123"));
    let snapshot = report.snapshot.unwrap();
    for (x, y) in snapshot.cumulative.a.iter().zip(&s2.snapshot.cumulative.a) {
        assert_relative_eq!(*x, *y, max_relative = 1e-12);
    }
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_fit_stage_alone_reuses_persisted_histograms() {
    let root = temp_root("resume");
    let cfg = config("0");
    let feed = feed(&cfg, 40_000);
    let first = IterationController::new(cfg.clone(), RunStore::new(&root)).unwrap();
    first.run(&feed).unwrap();
    let header = first.header(Stage::Fit);
    let before: Stage2Artifact = first.store().load(&header).unwrap();

    let cfg = PipelineConfig { first_stage: 2, ..cfg };
    let second = IterationController::new(cfg, RunStore::new(&root)).unwrap();
    let report = second.run(&feed).unwrap();
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].stage, Stage::Fit);

    let after: Stage2Artifact = second.store().load(&header).unwrap();
    assert_eq!(before.rows.len(), after.rows.len());
    for (a, b) in before.rows.iter().zip(&after.rows) {
        assert_eq!(a.bin, b.bin);
        assert_eq!(a.status, b.status);
        assert_eq!(a.mask, b.mask);
        assert_eq!(a.n_mass_bins, b.n_mass_bins);
        assert_relative_eq!(a.beta, b.beta, max_relative = 1e-9, epsilon = 1e-15);
    }
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_fit_stage_without_earlier_stages_is_missing_state() {
    let root = temp_root("missing");
    let cfg = PipelineConfig { first_stage: 2, ..config("0") };
    let feed = feed(&cfg, 1_000);
    let controller = IterationController::new(cfg, RunStore::new(&root)).unwrap();
    assert!(matches!(controller.run(&feed), Err(Error::MissingState(_))));
}

#[test]
fn test_previous_run_seeds_cumulative_bias() {
    let root = temp_root("chain");
    let cfg = config("0");
    let feed = feed(&cfg, 40_000);
    let first = IterationController::new(cfg.clone(), RunStore::new(&root)).unwrap();
    let report = first.run(&feed).unwrap();
    let cumulative = report.snapshot.unwrap().cumulative;
    assert!(cumulative.a.iter().any(|&a| a != 0.0));

    let prev = RunRef { tag: "e2e".into(), run: "0".into() };
    let cfg = PipelineConfig { run: "1".into(), prev_mass_fit: Some(prev), ..cfg };
    let second = IterationController::new(cfg, RunStore::new(&root)).unwrap();
    let initial = second.initial_snapshot().unwrap();
    let scale = [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M];
    let expected = cumulative.restricted_to(&scale);
    for coef in [BiasCoefficient::A, BiasCoefficient::E, BiasCoefficient::M, BiasCoefficient::C] {
        for (x, y) in initial.cumulative.get(coef).iter().zip(expected.get(coef)) {
            assert_relative_eq!(*x, *y, max_relative = 1e-12);
        }
    }
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_changed_binning_is_rejected_on_resume() {
    let root = temp_root("schema");
    let cfg = config("0");
    let feed = feed(&cfg, 20_000);
    IterationController::new(cfg.clone(), RunStore::new(&root)).unwrap().run(&feed).unwrap();

    let coarse = KinematicBinner::new(vec![-1.2, 1.2], vec![25.0, 55.0]).unwrap();
    let cfg = PipelineConfig {
        first_stage: 2,
        eta_edges: coarse.eta_edges().to_vec(),
        pt_edges: coarse.pt_edges().to_vec(),
        ..cfg
    };
    let controller = IterationController::new(cfg, RunStore::new(&root)).unwrap();
    assert!(matches!(controller.run(&feed), Err(Error::SchemaMismatch(_))));
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn test_fit_statuses_are_consistent_with_masks() {
    let root = temp_root("masks");
    let cfg = config("0");
    let feed = feed(&cfg, 30_000);
    let controller = IterationController::new(cfg, RunStore::new(&root)).unwrap();
    controller.run(&feed).unwrap();
    let s2: Stage2Artifact = controller.store().load(&controller.header(Stage::Fit)).unwrap();
    let min_slices = s2.fit_config.min_slices;
    for row in &s2.rows {
        assert_eq!(row.mask, row.status == FitStatus::Fitted);
        if row.mask {
            assert!(row.n_mass_bins >= min_slices);
        }
        assert_eq!(s2.summary.masks[row.bin], row.mask);
    }
    let _ = std::fs::remove_dir_all(&root);
}
