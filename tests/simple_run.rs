//! An end-to-end run of the bundled simple model against the HiGHS
//! network-flow model: constant inflow of 10 into a reservoir, a demand
//! of 8 downstream, five daily steps with zero foresight.
use float_cmp::assert_approx_eq;
use hydronet::commands::DEMOS_DIR;
use hydronet::connection::{DataConnection, LocalConnection};
use hydronet::model::FlowModel;
use hydronet::reporter::NoopReporter;
use hydronet::run::run_one;
use hydronet::scenario::expand_runs;
use hydronet::system::{CancelFlag, RunState, WaterSystem};
use hydronet::time_grid::TimeGrid;
use hydronet::value::Value;
use include_dir::DirEntry;
use std::fs;
use tempfile::TempDir;

/// Unpack the bundled `simple` demo into a temporary model directory.
fn unpack_demo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let demo = DEMOS_DIR.get_dir("simple").unwrap();
    for entry in demo.entries() {
        if let DirEntry::File(file) = entry {
            let name = file.path().file_name().unwrap();
            fs::write(dir.path().join(name), file.contents()).unwrap();
        }
    }
    dir
}

fn series_values(system: &WaterSystem, key: &str) -> Vec<f64> {
    let Some(Value::Series(series)) = system.evaluator().store().get(key) else {
        panic!("no series stored under {key}");
    };
    series.flattened().values().copied().collect()
}

#[test]
fn test_simple_model_end_to_end() {
    let dir = unpack_demo();
    let mut conn = LocalConnection::open(dir.path()).unwrap();
    let network = conn.get_network().unwrap();
    let template = conn.get_template(network.template_id).unwrap();
    let grid = TimeGrid::build(&conn.config().time).unwrap();
    let scenario = conn.get_scenario(9).unwrap();
    let descriptor = expand_runs("integration", &scenario).remove(0);

    let mut system = WaterSystem::new(
        network,
        template,
        grid,
        conn.config().run.foresight,
        conn.files_path(),
        Box::new(FlowModel::new()),
    );

    run_one(
        &mut conn,
        &mut system,
        &descriptor,
        &mut NoopReporter,
        &CancelFlag::new(),
    )
    .unwrap();
    assert_eq!(system.state(), RunState::Finished);

    // exactly five stored dates for the demand node's delivery, each
    // within the demand
    let deliveries = series_values(&system, "node/3/6");
    assert_eq!(deliveries.len(), 5);
    for value in &deliveries {
        assert!(*value <= 8.0 + 1e-6);
        assert_approx_eq!(f64, *value, 8.0, epsilon = 1e-6);
    }

    // mass balance at the reservoir, step by step
    let storage = series_values(&system, "node/2/5");
    let inflow = series_values(&system, "node/2/8");
    let outflow = series_values(&system, "node/2/9");
    assert_eq!(storage.len(), 5);
    let mut previous = 20.0;
    for i in 0..5 {
        assert_approx_eq!(
            f64,
            storage[i] - previous,
            inflow[i] - outflow[i],
            epsilon = 1e-6
        );
        previous = storage[i];
    }
    // net +2 per day on top of the initial 20
    assert_approx_eq!(f64, storage[4], 30.0, epsilon = 1e-6);

    // the flush persisted result datasets
    assert!(!conn.saved_results(9).is_empty());
}

#[test]
fn test_persisted_results_format() {
    let dir = unpack_demo();
    let mut conn = LocalConnection::open(dir.path()).unwrap();
    let network = conn.get_network().unwrap();
    let template = conn.get_template(network.template_id).unwrap();
    let grid = TimeGrid::build(&conn.config().time).unwrap();
    let scenario = conn.get_scenario(9).unwrap();
    let descriptor = expand_runs("integration", &scenario).remove(0);

    let mut system = WaterSystem::new(
        network,
        template,
        grid,
        conn.config().run.foresight,
        conn.files_path(),
        Box::new(FlowModel::new()),
    );
    run_one(
        &mut conn,
        &mut system,
        &descriptor,
        &mut NoopReporter,
        &CancelFlag::new(),
    )
    .unwrap();

    // block-keyed, date-string keyed, dates sorted ascending
    let delivery = conn
        .saved_results(9)
        .iter()
        .find(|d| d.key.to_string() == "node/3/6")
        .expect("delivery dataset saved");
    assert!(delivery.name.contains("city"));
    let block0 = delivery.value.get("0").expect("block 0 present");
    let dates: Vec<&String> = block0.as_object().unwrap().keys().collect();
    assert_eq!(dates.len(), 5);
    assert!(dates.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(dates[0], "2020-01-01 00:00:00");
}
