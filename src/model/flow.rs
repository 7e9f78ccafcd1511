//! The reference network-flow model, built on the HiGHS LP solver.
//!
//! Each step solves a small linear program over the current window:
//! link flows and demand deliveries are decision variables, reservoirs
//! carry storage between windows, and deliveries earn the demand node's
//! value while spills carry a small penalty so water is only discarded
//! when nothing better can be done with it.
use super::{Model, ModelOutput, ParamUpdate, StepResult};
use crate::network::{NetworkDescriptor, ResourceType};
use crate::time_grid::TimeGrid;
use anyhow::{Result, anyhow};
use chrono::NaiveDateTime;
use highs::{HighsModelStatus, RowProblem as Problem, Sense};
use indexmap::IndexMap;
use log::debug;
use std::collections::HashMap;

/// Cost per unit of spilled water at nodes that still have somewhere to
/// send it. Terminal non-demand nodes spill for free (that is the river
/// leaving the system).
const SPILL_PENALTY: f64 = 1e-3;

/// Small carryover reward per unit of stored water, to break ties
/// between storing and discarding.
const STORAGE_CARRYOVER: f64 = 1e-6;

/// Delivery value assumed for demand nodes with no value curve.
const DEFAULT_DELIVERY_VALUE: f64 = 1.0;

/// A decision variable in the problem.
type Variable = highs::Col;

/// What each problem column stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VarKey {
    LinkFlow(u32, NaiveDateTime),
    Delivery(u32, NaiveDateTime),
    Storage(u32, NaiveDateTime),
    Spill(u32, NaiveDateTime),
}

/// An ordered map from variable keys to problem columns, for both
/// constraint construction and solution read-back.
#[derive(Default)]
struct VariableMap(IndexMap<VarKey, Variable>);

impl VariableMap {
    fn insert(&mut self, key: VarKey, var: Variable) {
        let existing = self.0.insert(key, var).is_some();
        assert!(!existing, "Duplicate entry for var");
    }

    fn get(&self, key: &VarKey) -> Option<Variable> {
        self.0.get(key).copied()
    }
}

struct NodeEntity {
    id: u32,
    is_storage: bool,
    incoming: Vec<u32>,
    outgoing: Vec<u32>,
}

/// The HiGHS-backed network-flow model.
#[derive(Default)]
pub struct FlowModel {
    nodes: Vec<NodeEntity>,
    link_ids: Vec<u32>,
    window: Vec<NaiveDateTime>,
    step_days: HashMap<NaiveDateTime, f64>,
    /// Per-resource per-parameter boundary values by date.
    node_params: HashMap<(u32, String), HashMap<NaiveDateTime, f64>>,
    link_params: HashMap<(u32, String), HashMap<NaiveDateTime, f64>>,
    initial_storage: HashMap<u32, f64>,
    /// Solution values from the last solve.
    solution: IndexMap<VarKey, f64>,
}

impl FlowModel {
    /// An empty model; populate with [`Model::construct`].
    pub fn new() -> FlowModel {
        FlowModel::default()
    }

    fn node_param(&self, id: u32, param: &str, date: &NaiveDateTime) -> Option<f64> {
        let values = self.node_params.get(&(id, param.to_string()))?;
        values.get(date).or_else(|| values.values().next()).copied()
    }

    fn link_param(&self, id: u32, param: &str, date: &NaiveDateTime) -> Option<f64> {
        let values = self.link_params.get(&(id, param.to_string()))?;
        values.get(date).or_else(|| values.values().next()).copied()
    }

    fn has_demand(&self, id: u32) -> bool {
        self.node_params.contains_key(&(id, "nodeDemand".to_string()))
    }

    fn days(&self, date: &NaiveDateTime) -> f64 {
        self.step_days.get(date).copied().unwrap_or(1.0)
    }
}

/// Whether a template type name denotes a storage node.
fn is_storage_type(type_name: &str) -> bool {
    let lower = type_name.to_lowercase();
    ["reservoir", "storage", "groundwater", "aquifer"]
        .iter()
        .any(|kind| lower.contains(kind))
}

impl Model for FlowModel {
    fn construct(&mut self, network: &NetworkDescriptor, grid: &TimeGrid) -> Result<()> {
        self.nodes = network
            .nodes
            .iter()
            .map(|node| NodeEntity {
                id: node.id,
                is_storage: is_storage_type(&node.type_name),
                incoming: network
                    .links
                    .iter()
                    .filter(|l| l.node_2_id == node.id)
                    .map(|l| l.id)
                    .collect(),
                outgoing: network
                    .links
                    .iter()
                    .filter(|l| l.node_1_id == node.id)
                    .map(|l| l.id)
                    .collect(),
            })
            .collect();
        self.link_ids = network.links.iter().map(|l| l.id).collect();
        self.step_days = grid
            .iter()
            .map(|step| (step.date, grid.step_days(step.index)))
            .collect();
        Ok(())
    }

    fn update_window(&mut self, dates: &[NaiveDateTime]) -> Result<()> {
        self.window = dates.to_vec();
        Ok(())
    }

    fn update_param(&mut self, update: &ParamUpdate) -> Result<()> {
        let id = update.resource_id;
        match (update.resource_type, update.param.as_str()) {
            (ResourceType::Node, "nodeInitialStorage") => {
                self.initial_storage.entry(id).or_insert(update.value);
            }
            (
                ResourceType::Node,
                "nodeRunoff" | "nodeDemand" | "nodeValue" | "nodeStorageCapacity"
                | "nodeStorageDemand" | "nodeInactivePool",
            ) => {
                self.node_params
                    .entry((id, update.param.clone()))
                    .or_default()
                    .insert(update.date, update.value);
            }
            (ResourceType::Link, "linkFlowCapacity" | "linkCost") => {
                self.link_params
                    .entry((id, update.param.clone()))
                    .or_default()
                    .insert(update.date, update.value);
            }
            _ => {
                debug!("'{}' is not a model parameter; ignored", update.param);
            }
        }
        Ok(())
    }

    fn update_initial_conditions(&mut self) -> Result<()> {
        let Some(last_date) = self.window.last().copied() else {
            return Ok(());
        };
        for node in &self.nodes {
            if !node.is_storage {
                continue;
            }
            if let Some(volume) = self.solution.get(&VarKey::Storage(node.id, last_date)) {
                self.initial_storage.insert(node.id, *volume);
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepResult> {
        if self.window.is_empty() {
            return Err(anyhow!("no window set before step"));
        }

        let mut problem = Problem::default();
        let mut variables = VariableMap::default();

        // columns
        for date in &self.window {
            for link_id in &self.link_ids {
                let cap = self.link_param(*link_id, "linkFlowCapacity", date);
                let cost = self.link_param(*link_id, "linkCost", date).unwrap_or(0.0);
                let var = match cap {
                    Some(cap) => problem.add_column(cost, 0.0..=cap),
                    None => problem.add_column(cost, 0.0..),
                };
                variables.insert(VarKey::LinkFlow(*link_id, *date), var);
            }
            for node in &self.nodes {
                if self.has_demand(node.id) {
                    let demand = self.node_param(node.id, "nodeDemand", date).unwrap_or(0.0);
                    let value = self
                        .node_param(node.id, "nodeValue", date)
                        .unwrap_or(DEFAULT_DELIVERY_VALUE);
                    let var = problem.add_column(-value, 0.0..=demand.max(0.0));
                    variables.insert(VarKey::Delivery(node.id, *date), var);
                }
                if node.is_storage {
                    let max = self
                        .node_param(node.id, "nodeStorageCapacity", date)
                        .or_else(|| self.node_param(node.id, "nodeStorageDemand", date));
                    let min = self
                        .node_param(node.id, "nodeInactivePool", date)
                        .unwrap_or(0.0);
                    let var = match max {
                        Some(max) => problem.add_column(-STORAGE_CARRYOVER, min..=max),
                        None => problem.add_column(-STORAGE_CARRYOVER, min..),
                    };
                    variables.insert(VarKey::Storage(node.id, *date), var);
                }
                let spill_cost = if node.outgoing.is_empty() && !self.has_demand(node.id) {
                    0.0
                } else {
                    SPILL_PENALTY
                };
                let var = problem.add_column(spill_cost, 0.0..);
                variables.insert(VarKey::Spill(node.id, *date), var);
            }
        }

        // mass-balance rows, one per node per date
        let mut terms: Vec<(Variable, f64)> = Vec::new();
        for (t, date) in self.window.iter().enumerate() {
            let days = self.days(date);
            for node in &self.nodes {
                terms.clear();
                for link_id in &node.incoming {
                    terms.push((
                        variables.get(&VarKey::LinkFlow(*link_id, *date)).unwrap(),
                        1.0,
                    ));
                }
                for link_id in &node.outgoing {
                    terms.push((
                        variables.get(&VarKey::LinkFlow(*link_id, *date)).unwrap(),
                        -1.0,
                    ));
                }
                if let Some(var) = variables.get(&VarKey::Delivery(node.id, *date)) {
                    terms.push((var, -1.0));
                }
                terms.push((
                    variables.get(&VarKey::Spill(node.id, *date)).unwrap(),
                    -1.0,
                ));

                let runoff = self.node_param(node.id, "nodeRunoff", date).unwrap_or(0.0);

                if node.is_storage {
                    // S_t - S_prev = (net inflow + runoff) * days
                    let mut terms = terms
                        .iter()
                        .map(|(var, coeff)| (*var, coeff * days))
                        .collect::<Vec<_>>();
                    terms.push((
                        variables.get(&VarKey::Storage(node.id, *date)).unwrap(),
                        -1.0,
                    ));
                    let rhs = if t == 0 {
                        -self.initial_storage.get(&node.id).copied().unwrap_or(0.0)
                            - runoff * days
                    } else {
                        terms.push((
                            variables
                                .get(&VarKey::Storage(node.id, self.window[t - 1]))
                                .unwrap(),
                            1.0,
                        ));
                        -runoff * days
                    };
                    problem.add_row(rhs..=rhs, terms);
                } else {
                    // net inflow + runoff = 0
                    let rhs = -runoff;
                    problem.add_row(rhs..=rhs, terms.iter().copied());
                }
            }
        }

        let solved = problem.optimise(Sense::Minimise).solve();
        match solved.status() {
            HighsModelStatus::Optimal => {
                let solution = solved.get_solution();
                self.solution = variables
                    .0
                    .keys()
                    .cloned()
                    .zip(solution.columns().iter().copied())
                    .collect();
                Ok(StepResult { objective: None })
            }
            status => Err(anyhow!("Could not solve: {status:?}")),
        }
    }

    fn collect_outputs(&self) -> Result<Vec<ModelOutput>> {
        let mut outputs = Vec::new();
        let value = |key: &VarKey| self.solution.get(key).copied().unwrap_or(0.0);

        for date in &self.window {
            for link_id in &self.link_ids {
                outputs.push(ModelOutput {
                    resource_type: ResourceType::Link,
                    resource_id: *link_id,
                    param: "linkFlow".to_string(),
                    date: *date,
                    value: value(&VarKey::LinkFlow(*link_id, *date)),
                });
            }
            for node in &self.nodes {
                let inflow: f64 = node
                    .incoming
                    .iter()
                    .map(|l| value(&VarKey::LinkFlow(*l, *date)))
                    .sum::<f64>()
                    + self.node_param(node.id, "nodeRunoff", date).unwrap_or(0.0);
                let outflow: f64 = node
                    .outgoing
                    .iter()
                    .map(|l| value(&VarKey::LinkFlow(*l, *date)))
                    .sum::<f64>()
                    + value(&VarKey::Spill(node.id, *date));

                outputs.push(ModelOutput {
                    resource_type: ResourceType::Node,
                    resource_id: node.id,
                    param: "nodeInflow".to_string(),
                    date: *date,
                    value: inflow,
                });
                outputs.push(ModelOutput {
                    resource_type: ResourceType::Node,
                    resource_id: node.id,
                    param: "nodeOutflow".to_string(),
                    date: *date,
                    value: outflow,
                });
                if self.has_demand(node.id) {
                    outputs.push(ModelOutput {
                        resource_type: ResourceType::Node,
                        resource_id: node.id,
                        param: "nodeDelivery".to_string(),
                        date: *date,
                        value: value(&VarKey::Delivery(node.id, *date)),
                    });
                }
                if node.is_storage {
                    outputs.push(ModelOutput {
                        resource_type: ResourceType::Node,
                        resource_id: node.id,
                        param: "nodeStorage".to_string(),
                        date: *date,
                        value: value(&VarKey::Storage(node.id, *date)),
                    });
                }
            }
        }
        Ok(outputs)
    }
}
