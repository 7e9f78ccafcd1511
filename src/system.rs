//! The per-run state machine that drives stepwise re-optimisation.
//!
//! A `WaterSystem` owns the evaluator, the boundary-condition store and
//! a handle to the external model. `initialize` ingests scenario data and
//! applies variations; each `step` refreshes boundary values, pushes them
//! into the model, solves one window and writes the outputs back; `finish`
//! flushes what remains. Steps must arrive in strictly increasing order —
//! state from step *n* feeds step *n+1* through the model's own carry
//! (reservoir storage) and through the store.
use crate::connection::{DataConnection, Foresight, ResultDataset};
use crate::errors::{Canceled, ConfigurationError, EngineResult, StepExecutionError};
use crate::evaluator::{EvalOpts, Evaluator};
use crate::model::{Model, ModelOutput, ParamUpdate};
use crate::network::{
    DataType, NetworkDescriptor, RawValue, ResourceKey, ResourceType, TemplateDescriptor,
    TypeAttribute, param_name,
};
use crate::scenario::RunDescriptor;
use crate::store::perturb;
use crate::time_grid::{TimeGrid, parse_date};
use crate::units::{self, Dimension, MODEL_FLOW_UNIT, MODEL_VOLUME_UNIT};
use crate::value::{FillPolicy, Series, Value};
use chrono::NaiveDateTime;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared between a run and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, unset flag.
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, not yet initialized.
    Created,
    /// Data ingested, model constructed; ready to step.
    Initialized,
    /// At least one step taken.
    Stepping,
    /// Finished cleanly.
    Finished,
    /// Absorbing failure state.
    Errored,
}

/// Which boundary refresh is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Intermediary values before the solve.
    PreProcess,
    /// Model-bound values, pushed into the solver.
    Main,
    /// Intermediary values after the solve (may read solver outputs).
    PostProcess,
}

/// One ingested boundary input to refresh as the run steps.
#[derive(Debug, Clone)]
struct BoundaryInput {
    key: ResourceKey,
    param: String,
    tattr: TypeAttribute,
    raw: RawValue,
}

/// The per-run stepper.
pub struct WaterSystem {
    network: NetworkDescriptor,
    template: TemplateDescriptor,
    foresight: Foresight,
    evaluator: Evaluator,
    model: Box<dyn Model>,
    state: RunState,
    /// Series-typed inputs refreshed every step.
    inputs: Vec<BoundaryInput>,
    /// Scalar/descriptor inputs, by (param name, resource id).
    variables: HashMap<(String, u32), Value>,
    /// param name -> (resource kind, template metadata)
    params: HashMap<String, (ResourceType, TypeAttribute)>,
    scenario_id: u32,
    foresight_periods: usize,
    last_step: Option<usize>,
    block_params: Vec<String>,
    subblocks: usize,
}

impl WaterSystem {
    /// Create a system bound to a network, template, grid and model.
    pub fn new(
        network: NetworkDescriptor,
        template: TemplateDescriptor,
        grid: TimeGrid,
        foresight: Foresight,
        files_path: PathBuf,
        model: Box<dyn Model>,
    ) -> WaterSystem {
        let foresight_periods = match foresight {
            Foresight::Zero => 1,
            Foresight::Perfect => grid.len(),
        };
        let mut params = HashMap::new();
        for ttype in &template.types {
            for attr in &ttype.attrs {
                let name = param_name(ttype.resource_type, &attr.attr_name);
                params
                    .entry(name)
                    .or_insert((ttype.resource_type, attr.clone()));
            }
        }
        let mut evaluator = Evaluator::new(grid, files_path);
        evaluator.set_tattrs(network.attribute_index(&template));

        WaterSystem {
            network,
            template,
            foresight,
            evaluator,
            model,
            state: RunState::Created,
            inputs: Vec::new(),
            variables: HashMap::new(),
            params,
            scenario_id: 0,
            foresight_periods,
            last_step: None,
            block_params: Vec::new(),
            subblocks: 1,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The evaluator (and through it, the store and the grid).
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// How many `step` calls this run takes.
    pub fn step_count(&self) -> usize {
        match self.foresight {
            Foresight::Zero => self.evaluator.grid().len(),
            Foresight::Perfect => 1,
        }
    }

    /// Name attribute names whose values carry demand blocks.
    pub fn set_block_params(&mut self, params: Vec<String>, subblocks: usize) {
        self.block_params = params;
        self.subblocks = subblocks.max(1);
    }

    /// Human-readable context for an error at a key: names the resource
    /// and the attribute, never internal ids.
    pub fn describe_key(&self, key: &ResourceKey) -> String {
        let resource = self
            .network
            .resource_name(key.resource_type, key.resource_id);
        let attr = self
            .template
            .attr_name(key.attr_id)
            .unwrap_or("unknown attribute");
        format!("{attr} at {} {resource}", key.resource_type)
    }

    /// Ingest scenario data, apply variations and construct the model.
    ///
    /// Errors here abort the run before any step executes.
    pub fn initialize(
        &mut self,
        conn: &dyn DataConnection,
        descriptor: &RunDescriptor,
    ) -> anyhow::Result<()> {
        if self.state != RunState::Created {
            anyhow::bail!("initialize called twice");
        }
        self.scenario_id = descriptor.scenario_id;
        self.evaluator.set_scenario(descriptor.scenario_id);
        self.evaluator.reset_memo();

        self.collect_source_data(conn, &descriptor.source_ids)?;
        self.apply_variations(descriptor);

        let grid = self.evaluator.grid().clone();
        self.model.construct(&self.network, &grid)?;
        self.push_initial_conditions()?;

        self.state = RunState::Initialized;
        info!(
            "initialized run {}/{} of scenario {} ({} steps)",
            descriptor.number,
            descriptor.total,
            descriptor.scenario_id,
            self.step_count()
        );
        Ok(())
    }

    /// Load raw datasets for every resource, resolving each key against
    /// the scenario chain, and pre-evaluate plain datasets into the store.
    fn collect_source_data(
        &mut self,
        conn: &dyn DataConnection,
        source_ids: &[u32],
    ) -> anyhow::Result<()> {
        let mut resources: Vec<(ResourceType, u32)> =
            vec![(ResourceType::Network, self.network.id)];
        resources.extend(self.network.nodes.iter().map(|n| (ResourceType::Node, n.id)));
        resources.extend(self.network.links.iter().map(|l| (ResourceType::Link, l.id)));

        for (resource_type, resource_id) in resources {
            let datasets =
                conn.get_resource_attribute_data(resource_type, resource_id, source_ids, None)?;
            for (key, raw) in datasets {
                self.ingest(key, raw).map_err(|err| {
                    anyhow::anyhow!("Error calculating {}:\n\n{err}", self.describe_key(&key))
                })?;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, key: ResourceKey, raw: RawValue) -> EngineResult<()> {
        let Some(tattr) = self.evaluator.tattr(&key).cloned() else {
            // data for an attribute the template does not declare
            return Ok(());
        };
        // solver outputs are not inputs
        if tattr.is_var {
            return Ok(());
        }
        if tattr.intermediary {
            self.evaluator.store_mut().mark_intermediary(&key.to_string());
        }

        let param = param_name(key.resource_type, &tattr.attr_name);
        self.evaluator.insert_raw(key, raw.clone());

        match raw.data_type {
            DataType::Scalar | DataType::Descriptor | DataType::Array => {
                let value = self.evaluator.eval_data(
                    Some(key),
                    &raw,
                    EvalOpts {
                        has_blocks: tattr.has_blocks,
                        ..EvalOpts::default()
                    },
                )?;
                self.variables
                    .insert((param.clone(), key.resource_id), value.clone());
                self.evaluator.store_mut().set(&key.to_string(), value);
            }
            DataType::Timeseries | DataType::PeriodicTimeseries => {
                // functions are evaluated per step; plain series up front
                if raw.function().is_none() {
                    let value = self.evaluator.eval_data(
                        Some(key),
                        &raw,
                        EvalOpts {
                            has_blocks: tattr.has_blocks,
                            fill: FillPolicy::Value(0.0),
                            ..EvalOpts::default()
                        },
                    )?;
                    self.evaluator.store_mut().set(&key.to_string(), value);
                }
                self.inputs.push(BoundaryInput {
                    key,
                    param,
                    tattr,
                    raw,
                });
            }
        }
        Ok(())
    }

    /// Apply the run's variations to ingested values. A variation on a
    /// key with no data creates the value from a zero default.
    fn apply_variations(&mut self, descriptor: &RunDescriptor) {
        for (key, variation) in descriptor.combined_variations() {
            let Some(tattr) = self.evaluator.tattr(&key).cloned() else {
                continue;
            };
            let param = param_name(key.resource_type, &tattr.attr_name);
            let key_string = key.to_string();

            // functions are perturbed through the store after evaluation,
            // so only directly-stored values are touched here
            let is_function = self
                .evaluator
                .raw(&key)
                .is_some_and(|raw| raw.function().is_some());
            if is_function {
                continue;
            }

            if self.evaluator.store().contains(&key_string) {
                self.evaluator
                    .store_mut()
                    .apply_variation(&key_string, &variation);
                if let Some(value) = self.variables.get_mut(&(param, key.resource_id)) {
                    perturb(value, &variation);
                }
            } else {
                // no data: the variation itself defines the value
                let dates: Vec<NaiveDateTime> = self.evaluator.grid().dates().collect();
                let mut value = match tattr.data_type {
                    DataType::Scalar => Value::Scalar(0.0),
                    _ => Value::Series(Series::zeros(&dates)),
                };
                perturb(&mut value, &variation);
                if tattr.data_type == DataType::Scalar {
                    self.variables.insert((param, key.resource_id), value.clone());
                }
                self.evaluator.store_mut().set(&key_string, value);
            }
        }
    }

    /// Push time-invariant values (initial storage and other scalars)
    /// into the model once.
    fn push_initial_conditions(&mut self) -> anyhow::Result<()> {
        let Some(first_date) = self.evaluator.grid().start() else {
            return Ok(());
        };
        for ((param, resource_id), value) in &self.variables {
            let Some((resource_type, tattr)) = self.params.get(param) else {
                continue;
            };
            let Value::Scalar(raw_value) = value else {
                continue;
            };
            let converted = self.convert_in(*raw_value, tattr)?;
            self.model.update_param(&ParamUpdate {
                resource_type: *resource_type,
                resource_id: *resource_id,
                param: param.clone(),
                date: first_date,
                value: converted,
            })?;
        }
        Ok(())
    }

    /// Execute one step of the run.
    ///
    /// `index` must increase strictly from 0. On failure the system
    /// enters the absorbing `Errored` state and the error carries the
    /// step number, date and total; the caller is responsible for the
    /// partial-results flush and for deciding whether to retry the run
    /// (the stepper itself never retries).
    pub fn step(&mut self, index: usize, cancel: &CancelFlag) -> EngineResult<()> {
        match self.state {
            RunState::Initialized | RunState::Stepping => {}
            _ => {
                return Err(ConfigurationError(format!(
                    "step called in state {:?}",
                    self.state
                ))
                .into());
            }
        }
        if let Some(last) = self.last_step
            && index <= last
        {
            self.state = RunState::Errored;
            return Err(ConfigurationError(format!(
                "step {index} called after step {last}; indices must increase"
            ))
            .into());
        }

        if cancel.is_canceled() {
            return Err(Canceled.into());
        }

        match self.step_inner(index) {
            Ok(()) => {
                self.last_step = Some(index);
                self.state = RunState::Stepping;
                Ok(())
            }
            Err(err) => {
                self.state = RunState::Errored;
                let total = self.step_count();
                let date = self
                    .evaluator
                    .grid()
                    .get(index)
                    .map(|s| s.date_as_string())
                    .unwrap_or_default();
                Err(StepExecutionError {
                    step: index + 1,
                    total,
                    date,
                    detail: err.to_string(),
                }
                .into())
            }
        }
    }

    fn step_inner(&mut self, index: usize) -> anyhow::Result<()> {
        let grid = self.evaluator.grid();
        let tsi = match self.foresight {
            Foresight::Zero => index,
            Foresight::Perfect => 0,
        };
        let tsf = (tsi + self.foresight_periods).min(grid.len());
        if tsi >= grid.len() {
            anyhow::bail!("step {index} is beyond the time grid");
        }
        let window: Vec<NaiveDateTime> = (tsi..tsf)
            .map(|i| grid.get(i).expect("window within grid").date)
            .collect();
        self.evaluator.set_window(tsi, tsf);
        self.model.update_window(&window)?;
        if index > 0 {
            self.model.update_initial_conditions()?;
        }

        self.update_boundary_conditions(&window, Phase::PreProcess)?;
        self.update_boundary_conditions(&window, Phase::Main)?;

        self.model.step()?;

        let outputs = self.model.collect_outputs()?;
        self.store_results(&outputs)?;

        self.update_boundary_conditions(&window, Phase::PostProcess)?;
        Ok(())
    }

    /// Refresh boundary values for one phase of a step.
    fn update_boundary_conditions(
        &mut self,
        window: &[NaiveDateTime],
        phase: Phase,
    ) -> anyhow::Result<()> {
        let inputs = self.inputs.clone();
        for input in &inputs {
            let intermediary = input.tattr.intermediary;
            let wanted = match phase {
                Phase::Main => !intermediary,
                Phase::PreProcess | Phase::PostProcess => intermediary,
            };
            if !wanted {
                continue;
            }
            self.update_param(input, window, phase).map_err(|err| {
                anyhow::anyhow!(
                    "Error calculating {}:\n\n{err}",
                    self.describe_key(&input.key)
                )
            })?;
        }
        Ok(())
    }

    /// Refresh one boundary input: evaluate (functions re-evaluate fresh
    /// and win over any stale stored constant), store, and in the main
    /// phase push into the model.
    fn update_param(
        &mut self,
        input: &BoundaryInput,
        window: &[NaiveDateTime],
        phase: Phase,
    ) -> EngineResult<()> {
        let has_blocks = input.tattr.has_blocks
            || self.block_params.contains(&input.tattr.attr_name);
        let is_function = input.raw.function().is_some();

        // post-process intermediaries may read solver outputs, so their
        // memoized pre-solve values are dropped before re-evaluating
        if phase == Phase::PostProcess
            && let Some(source) = input.raw.function()
        {
            self.evaluator.forget(source, input.raw.data_type);
        }

        // functions re-evaluate fresh each phase; plain series were
        // ingested (and perturbed by variations) at initialize and are
        // pushed from the store
        let value = if is_function {
            self.evaluator.eval_data(
                Some(input.key),
                &input.raw,
                EvalOpts {
                    has_blocks,
                    flatten: Some(!has_blocks),
                    fill: FillPolicy::Value(0.0),
                    ..EvalOpts::default()
                },
            )?
        } else {
            match self.evaluator.store().get(&input.key.to_string()) {
                Some(value) => value.clone(),
                None => self.evaluator.eval_data(
                    Some(input.key),
                    &input.raw,
                    EvalOpts {
                        has_blocks,
                        flatten: Some(!has_blocks),
                        fill: FillPolicy::Value(0.0),
                        ..EvalOpts::default()
                    },
                )?,
            }
        };

        let mut series = match value {
            Value::Series(series) => series,
            // a constant-valued function broadcasts across the window
            Value::Scalar(v) => {
                Series::from_single(window.iter().map(|d| (*d, v)).collect())
            }
            other => {
                self.evaluator.store_mut().set(&input.key.to_string(), other);
                return Ok(());
            }
        };

        if has_blocks && self.subblocks > 1 {
            series = add_subblocks(&series, &input.param, self.subblocks);
        }

        // functions win: their fresh results overwrite the stored values
        // date by date, keeping dates from earlier windows
        if is_function {
            let key_string = input.key.to_string();
            let merged = match self.evaluator.store().get(&key_string) {
                Some(Value::Series(existing)) => {
                    let mut blocks = existing.blocks().clone();
                    for (block, values) in series.blocks() {
                        let target = blocks.entry(*block).or_default();
                        for (date, value) in values {
                            target.insert(*date, *value);
                        }
                    }
                    Series::from_blocks(blocks)
                }
                _ => series.clone(),
            };
            self.evaluator
                .store_mut()
                .set(&key_string, Value::Series(merged));
        }

        let startup_date = self.startup_date(input.key.resource_type, input.key.resource_id);
        let flat = series.flattened();
        for date in window {
            let Some(mut value) = flat.get(date).copied() else {
                continue;
            };
            if startup_date.is_some_and(|startup| *date < startup) {
                value = 0.0;
            }

            if phase == Phase::Main {
                let converted = self.convert_in(value, &input.tattr)?;
                self.model
                    .update_param(&ParamUpdate {
                        resource_type: input.key.resource_type,
                        resource_id: input.key.resource_id,
                        param: input.param.clone(),
                        date: *date,
                        value: converted,
                    })
                    .map_err(|err| ConfigurationError(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// The startup date configured for a resource, if any. Boundary
    /// values before it are forced to zero.
    fn startup_date(
        &self,
        resource_type: ResourceType,
        resource_id: u32,
    ) -> Option<NaiveDateTime> {
        let param = format!("{resource_type}StartupDate");
        match self.variables.get(&(param, resource_id)) {
            Some(Value::Descriptor(text)) if !text.is_empty() => parse_date(text).ok(),
            _ => None,
        }
    }

    /// Convert a boundary value into the model's internal units.
    fn convert_in(&self, value: f64, tattr: &TypeAttribute) -> EngineResult<f64> {
        let scaled = value * tattr.scale;
        match Dimension::from_str(&tattr.dimension) {
            Ok(Dimension::Volume) => {
                Ok(units::convert(scaled, Dimension::Volume, &tattr.unit, MODEL_VOLUME_UNIT)?)
            }
            Ok(Dimension::VolumetricFlowRate) => Ok(units::convert(
                scaled,
                Dimension::VolumetricFlowRate,
                &tattr.unit,
                MODEL_FLOW_UNIT,
            )?),
            Err(_) => Ok(scaled),
        }
    }

    /// Convert a model output back into the attribute's declared unit.
    fn convert_out(&self, value: f64, tattr: &TypeAttribute) -> EngineResult<f64> {
        let converted = match Dimension::from_str(&tattr.dimension) {
            Ok(Dimension::Volume) => {
                units::convert(value, Dimension::Volume, MODEL_VOLUME_UNIT, &tattr.unit)?
            }
            Ok(Dimension::VolumetricFlowRate) => units::convert(
                value,
                Dimension::VolumetricFlowRate,
                MODEL_FLOW_UNIT,
                &tattr.unit,
            )?,
            Err(_) => value,
        };
        Ok(converted / tattr.scale)
    }

    /// Write solver outputs into the store.
    fn store_results(&mut self, outputs: &[ModelOutput]) -> EngineResult<()> {
        for output in outputs {
            let Some((resource_type, tattr)) = self.params.get(&output.param).cloned() else {
                // the model reports everything; only templated outputs
                // are stored
                continue;
            };
            if resource_type != output.resource_type {
                continue;
            }
            let value = self.convert_out(output.value, &tattr)?;
            let key = ResourceKey::new(output.resource_type, output.resource_id, tattr.attr_id);
            let has_blocks = self.block_params.contains(&tattr.attr_name);
            self.evaluator.store_mut().store_value(
                &key.to_string(),
                output.date,
                value,
                has_blocks,
            );
        }
        Ok(())
    }

    /// Flush results into the data service. Used both for the final save
    /// and for the best-effort partial flush after a failure.
    pub fn save_results(&self, conn: &mut dyn DataConnection) -> anyhow::Result<usize> {
        let mut datasets = Vec::new();
        for (key_string, value) in self.evaluator.store().iter() {
            let Ok(key) = ResourceKey::from_str(key_string) else {
                continue;
            };
            let Some(tattr) = self.evaluator.tattr(&key) else {
                continue;
            };
            // only store-worthy series go back; scalars and descriptors
            // are inputs echoed into the store
            if !tattr.data_type.is_series() {
                continue;
            }
            let resource = self
                .network
                .resource_name(key.resource_type, key.resource_id);
            datasets.push(ResultDataset {
                key,
                name: format!(
                    "{} - {} - {}",
                    self.network.name, resource, tattr.attr_name
                ),
                value: value.to_json(),
            });
        }
        let count = datasets.len();
        conn.save_results(self.scenario_id, datasets)?;
        Ok(count)
    }

    /// Finish the run. Idempotent; a second call is a no-op, and an
    /// errored run stays errored.
    pub fn finish(&mut self) {
        if matches!(self.state, RunState::Finished | RunState::Errored) {
            return;
        }
        self.state = RunState::Finished;
        info!("run finished after {:?} steps", self.last_step.map(|s| s + 1));
    }
}

/// Split blocked curves into sub-blocks.
///
/// Demand-type curves split evenly; value/priority-type curves keep the
/// value but separate sub-blocks with a decreasing sqrt-shaped increment,
/// producing a blocked merit-order curve. Everything else passes through.
fn add_subblocks(series: &Series, param: &str, subblocks: usize) -> Series {
    let n = subblocks as f64;
    let mut out = std::collections::BTreeMap::new();
    match param {
        "nodeStorageDemand" | "nodeDemand" => {
            for (block, values) in series.blocks() {
                let split: std::collections::BTreeMap<NaiveDateTime, f64> =
                    values.iter().map(|(d, v)| (*d, v / n)).collect();
                for i in 0..subblocks {
                    out.insert(block * subblocks + i, split.clone());
                }
            }
        }
        "nodeValue" | "nodePriority" | "nodeViolationCost" => {
            for (block, values) in series.blocks() {
                for i in 0..subblocks {
                    let weight = 1.0 - ((n - i as f64) / n).sqrt();
                    out.insert(
                        block * subblocks + i,
                        values.iter().map(|(d, v)| (*d, v + weight)).collect(),
                    );
                }
            }
        }
        _ => return series.clone(),
    }
    Series::from_blocks(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::simple_grid;
    use float_cmp::assert_approx_eq;

    fn series_with_block0(values: &[(&str, f64)]) -> Series {
        let mut series = Series::new();
        for (date, value) in values {
            series.insert(0, parse_date(date).unwrap(), *value);
        }
        series
    }

    #[test]
    fn test_add_subblocks_demand_splits_evenly() {
        let series = series_with_block0(&[("2020-01-01", 8.0)]);
        let split = add_subblocks(&series, "nodeDemand", 2);
        assert_eq!(split.n_blocks(), 2);
        let date = parse_date("2020-01-01").unwrap();
        assert_approx_eq!(f64, split.get_block(0, &date).unwrap(), 4.0);
        assert_approx_eq!(f64, split.get_block(1, &date).unwrap(), 4.0);
        // the split conserves the total
        assert_approx_eq!(f64, split.flatten().get(&date).unwrap(), 8.0);
    }

    #[test]
    fn test_add_subblocks_value_weights_decrease() {
        let series = series_with_block0(&[("2020-01-01", 10.0)]);
        let split = add_subblocks(&series, "nodeValue", 3);
        let date = parse_date("2020-01-01").unwrap();
        let b0 = split.get_block(0, &date).unwrap();
        let b1 = split.get_block(1, &date).unwrap();
        let b2 = split.get_block(2, &date).unwrap();
        // first sub-block keeps the original value, later ones grow by a
        // shrinking increment (lower merit)
        assert_approx_eq!(f64, b0, 10.0);
        assert!(b0 < b1 && b1 < b2);
        assert!(b1 - b0 > 0.0);
    }

    #[test]
    fn test_add_subblocks_other_params_pass_through() {
        let series = series_with_block0(&[("2020-01-01", 5.0)]);
        let split = add_subblocks(&series, "nodeRunoff", 4);
        assert_eq!(split, series);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_canceled());
        let shared = flag.clone();
        shared.cancel();
        assert!(flag.is_canceled());
    }

    #[test]
    fn test_grid_window_sizes() {
        let grid = simple_grid(5);
        assert_eq!(grid.len(), 5);
    }
}
