//! Loading resolution tables from disk and using them through the trait object.

use std::path::PathBuf;
use std::sync::Arc;

use approx::assert_relative_eq;
use ms_core::{BudgetResolution, Error, FallbackResolution, KinematicBinner, ResolutionModel};

fn tmp_file(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("ms-core-{}-{name}", std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_table_lookup_over_default_binning() {
    let path = tmp_file(
        "table.json",
        r#"{"eta_edges": [-2.4, -1.2, 1.2, 2.4],
            "budget": [0.02, 0.01, 0.02],
            "hit_res": [2e-4, 1e-4, 2e-4]}"#,
    );
    let table = BudgetResolution::from_json_file(&path).unwrap();
    let model: Arc<dyn ResolutionModel> = Arc::new(table);
    assert_eq!(model.name(), "budget");

    let binner = KinematicBinner::default();
    let k = 1.0 / 40.0;
    for slot in 0..binner.n_eta_bins() {
        let eta = binner.eta_center(slot);
        let (budget, hit): (f64, f64) =
            if eta.abs() < 1.2 { (0.01, 1e-4) } else { (0.02, 2e-4) };
        let expected = (budget * budget + hit * hit / (k * k)).sqrt() * k;
        assert_relative_eq!(model.resolution(k, eta, 0.0), expected, max_relative = 1e-12);
        assert_relative_eq!(model.resolution(k, eta, 0.1), 1.1 * expected, max_relative = 1e-12);
    }
    // Outside the table the edge entries apply.
    assert_relative_eq!(
        model.resolution(k, 3.0, 0.0),
        model.resolution(k, 2.3, 0.0),
        max_relative = 1e-12
    );
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_bad_tables_are_configuration_errors() {
    let missing = std::env::temp_dir().join("ms-core-no-such-table.json");
    assert!(matches!(BudgetResolution::from_json_file(&missing), Err(Error::Configuration(_))));

    let malformed = tmp_file("malformed.json", "{\"eta_edges\": [0.0, 1.0]");
    assert!(matches!(BudgetResolution::from_json_file(&malformed), Err(Error::Configuration(_))));

    let shape = tmp_file(
        "shape.json",
        r#"{"eta_edges": [0.0, 1.0], "budget": [0.01, 0.02], "hit_res": [1e-4, 1e-4]}"#,
    );
    assert!(matches!(BudgetResolution::from_json_file(&shape), Err(Error::Configuration(_))));
    let _ = std::fs::remove_file(&malformed);
    let _ = std::fs::remove_file(&shape);
}

#[test]
fn test_fallback_is_proportional() {
    let model = FallbackResolution;
    assert_relative_eq!(model.resolution(0.04, 0.0, 0.0), 0.0008, max_relative = 1e-12);
    assert_relative_eq!(model.resolution(0.04, 2.0, -0.5), 0.0004, max_relative = 1e-12);
}
