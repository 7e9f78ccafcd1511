//! Run orchestration: expanding a model request into independent runs
//! and driving each one through its step loop.
//!
//! Each run is reconstructed from scratch off its [`RunDescriptor`] —
//! fresh evaluator, fresh store, fresh model — so nothing is shared
//! between runs except the process-wide compiled-expression cache. The
//! loop polls the cancellation flag, reports progress, flushes partial
//! results on failure and never retries a run on its own.
use crate::connection::{DataConnection, Foresight};
use crate::errors::EngineError;
use crate::model::Model;
use crate::reporter::{ProgressReporter, ReportAction, ReportPayload};
use crate::scenario::{RunDescriptor, expand_runs};
use crate::system::{CancelFlag, WaterSystem};
use crate::time_grid::{TimeGrid, TimeSettings};
use anyhow::{Context, Result};
use log::{error, info};
use std::path::PathBuf;

/// Options for a model request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Name for the request (logs, result naming).
    pub run_name: String,
    /// Scenarios to run.
    pub scenario_ids: Vec<u32>,
    /// Foresight mode.
    pub foresight: Foresight,
    /// Fallback time settings when a scenario does not carry its own.
    pub time: TimeSettings,
    /// Directory external files resolve against.
    pub files_path: PathBuf,
}

/// Run every scenario in the request, expanding variations into
/// independent runs. `make_model` supplies a fresh model per run.
pub fn run_scenarios(
    conn: &mut dyn DataConnection,
    options: &RunOptions,
    reporter: &mut dyn ProgressReporter,
    cancel: &CancelFlag,
    make_model: &dyn Fn() -> Box<dyn Model>,
) -> Result<()> {
    let network = conn.get_network()?;
    let template = conn.get_template(network.template_id)?;

    for scenario_id in &options.scenario_ids {
        let scenario = conn
            .get_scenario(*scenario_id)
            .with_context(|| format!("Failed to load scenario {scenario_id}"))?;

        // scenario-level time settings win over the request fallback
        let time = if scenario.time.start.is_some() {
            scenario.time.clone()
        } else {
            options.time.clone()
        };

        let runs = expand_runs(&options.run_name, &scenario);
        info!(
            "scenario {scenario_id} ({}) expands into {} run(s)",
            scenario.name,
            runs.len()
        );

        for descriptor in runs {
            let grid = TimeGrid::build(&time)?;
            let mut system = WaterSystem::new(
                network.clone(),
                template.clone(),
                grid,
                options.foresight,
                options.files_path.clone(),
                make_model(),
            );
            run_one(conn, &mut system, &descriptor, reporter, cancel)?;
        }
    }
    Ok(())
}

/// Drive one run from initialize to finish.
pub fn run_one(
    conn: &mut dyn DataConnection,
    system: &mut WaterSystem,
    descriptor: &RunDescriptor,
    reporter: &mut dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<()> {
    let mut payload = ReportPayload {
        scenario_id: descriptor.scenario_id,
        run_number: descriptor.number,
        progress_percent: 0,
        status: "starting".to_string(),
        current_date: None,
        message: None,
    };

    system
        .initialize(conn, descriptor)
        .with_context(|| format!("Failed to prepare run {}", descriptor.number))?;
    reporter.report(ReportAction::Start, &payload);

    let total = system.step_count();
    for index in 0..total {
        match system.step(index, cancel) {
            Ok(()) => {}
            Err(EngineError::Canceled(_)) => {
                // cancellation is not a failure; flush what exists
                info!("run {} canceled by user", descriptor.number);
                flush(conn, system, reporter, &mut payload);
                payload.status = "canceled".to_string();
                reporter.report(ReportAction::Done, &payload);
                return Ok(());
            }
            Err(err) => {
                flush(conn, system, reporter, &mut payload);
                payload.status = "error".to_string();
                payload.message = Some(err.to_string());
                reporter.report(ReportAction::Error, &payload);
                error!("run {} failed: {err}", descriptor.number);
                return Err(err.into());
            }
        }

        payload.progress_percent = (((index + 1) * 100) / total) as u8;
        payload.status = "running".to_string();
        payload.current_date = system
            .evaluator()
            .grid()
            .get(index)
            .map(|s| s.date_as_string());
        reporter.report(ReportAction::Step, &payload);
    }

    system.finish();
    flush(conn, system, reporter, &mut payload);
    payload.status = "done".to_string();
    payload.progress_percent = 100;
    reporter.report(ReportAction::Done, &payload);
    Ok(())
}

/// Best-effort results flush; failures are reported, not propagated.
fn flush(
    conn: &mut dyn DataConnection,
    system: &WaterSystem,
    reporter: &mut dyn ProgressReporter,
    payload: &mut ReportPayload,
) {
    match system.save_results(conn) {
        Ok(count) => {
            payload.status = "saved".to_string();
            payload.message = Some(format!("{count} datasets saved"));
            reporter.report(ReportAction::Save, payload);
            payload.message = None;
        }
        Err(err) => {
            payload.message = Some(format!("ERROR: Results could not be saved: {err}"));
            reporter.report(ReportAction::Error, payload);
            payload.message = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use crate::errors::EngineError;
    use crate::fixture::{StubModel, write_simple_model};
    use crate::network::{ResourceKey, ResourceType};
    use crate::reporter::NoopReporter;
    use crate::scenario::expand_runs;
    use crate::store::{Variation, VariationOperator};
    use crate::system::RunState;
    use crate::value::Value;
    use float_cmp::assert_approx_eq;
    use tempfile::tempdir;

    fn build_system(conn: &LocalConnection) -> WaterSystem {
        let network = conn.get_network().unwrap();
        let template = conn.get_template(network.template_id).unwrap();
        let grid = TimeGrid::build(&conn.config().time).unwrap();
        WaterSystem::new(
            network,
            template,
            grid,
            conn.config().run.foresight,
            conn.files_path(),
            Box::new(StubModel::default()),
        )
    }

    fn series_values(system: &WaterSystem, key: &str) -> Vec<f64> {
        let Some(Value::Series(series)) = system.evaluator().store().get(key) else {
            panic!("no series stored under {key}");
        };
        series.flattened().values().copied().collect()
    }

    #[test]
    fn test_end_to_end_simple_run() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        let mut conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let descriptor = expand_runs("test", &scenario).remove(0);

        let mut system = build_system(&conn);
        run_one(
            &mut conn,
            &mut system,
            &descriptor,
            &mut NoopReporter,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(system.state(), RunState::Finished);

        // five stored dates for the demand node's delivery, each within
        // the demand of 8
        let deliveries = series_values(&system, "node/3/6");
        assert_eq!(deliveries.len(), 5);
        for value in &deliveries {
            assert!(*value <= 8.0 + 1e-9);
            assert_approx_eq!(f64, *value, 8.0);
        }

        // mass balance at the reservoir: storage change equals inflow
        // minus outflow at every step
        let storage = series_values(&system, "node/2/5");
        let inflow = series_values(&system, "node/2/8");
        let outflow = series_values(&system, "node/2/9");
        let mut previous = 20.0;
        for i in 0..5 {
            assert_approx_eq!(f64, storage[i] - previous, inflow[i] - outflow[i]);
            previous = storage[i];
        }

        // results were flushed into the connection
        assert!(!conn.saved_results(9).is_empty());
    }

    #[test]
    fn test_run_applies_variations() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        let mut conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let mut descriptor = expand_runs("test", &scenario).remove(0);
        // halve the runoff at the headflow node
        descriptor.variation_sets[0].variations.insert(
            ResourceKey::new(ResourceType::Node, 1, 1),
            Variation {
                operator: VariationOperator::Multiply,
                value: 0.5,
            },
        );

        let mut system = build_system(&conn);
        run_one(
            &mut conn,
            &mut system,
            &descriptor,
            &mut NoopReporter,
            &CancelFlag::new(),
        )
        .unwrap();

        // headflow outflow reflects the perturbed runoff of 5
        let outflow = series_values(&system, "node/1/9");
        for value in outflow {
            assert_approx_eq!(f64, value, 5.0);
        }
    }

    #[test]
    fn test_canceled_run_still_flushes() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        let mut conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let descriptor = expand_runs("test", &scenario).remove(0);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut system = build_system(&conn);
        run_one(&mut conn, &mut system, &descriptor, &mut NoopReporter, &cancel).unwrap();
        // no step ran, but the save path was exercised
        assert_eq!(system.state(), RunState::Initialized);
    }

    #[test]
    fn test_failing_expression_wraps_step_error() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        // sabotage the value function so it fails at run time
        let data_path = dir.path().join("data.json");
        let data = std::fs::read_to_string(&data_path)
            .unwrap()
            .replace("\"function\": \"10\"", "\"function\": \"1 / (timestep - timestep)\"");
        std::fs::write(&data_path, data).unwrap();

        let mut conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let descriptor = expand_runs("test", &scenario).remove(0);

        let mut system = build_system(&conn);
        let err = run_one(
            &mut conn,
            &mut system,
            &descriptor,
            &mut NoopReporter,
            &CancelFlag::new(),
        )
        .unwrap_err();

        assert_eq!(system.state(), RunState::Errored);
        let message = format!("{err:#}");
        // the error names the step and the offending attribute at its
        // resource, by display name
        assert!(message.contains("step 1 of 5"), "message was: {message}");
        assert!(message.contains("Value at node city"), "message was: {message}");
    }

    #[test]
    fn test_step_indices_must_increase() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        let conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let descriptor = expand_runs("test", &scenario).remove(0);

        let mut system = build_system(&conn);
        system.initialize(&conn, &descriptor).unwrap();
        let cancel = CancelFlag::new();
        system.step(0, &cancel).unwrap();
        let err = system.step(0, &cancel).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(system.state(), RunState::Errored);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());
        let conn = LocalConnection::open(dir.path()).unwrap();
        let scenario = conn.get_scenario(9).unwrap();
        let descriptor = expand_runs("test", &scenario).remove(0);

        let mut system = build_system(&conn);
        system.initialize(&conn, &descriptor).unwrap();
        system.finish();
        assert_eq!(system.state(), RunState::Finished);
        system.finish();
        assert_eq!(system.state(), RunState::Finished);
    }
}
