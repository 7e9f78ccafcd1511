//! The solver interface.
//!
//! The engine drives an external optimisation model through this trait:
//! boundary values are pushed in with [`Model::update_param`] once per
//! refresh, [`Model::step`] solves one window, and the solved flows and
//! storages come back out through [`Model::collect_outputs`]. The
//! constraint formulation itself is the model's business, not the
//! engine's.
use crate::network::{NetworkDescriptor, ResourceType};
use crate::time_grid::TimeGrid;
use anyhow::Result;
use chrono::NaiveDateTime;

pub mod flow;
pub use flow::FlowModel;

/// One boundary-value push into the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamUpdate {
    /// Resource kind the value belongs to.
    pub resource_type: ResourceType,
    /// Node, link or network id.
    pub resource_id: u32,
    /// Internal parameter name (e.g. `nodeDemand`, `linkFlowCapacity`).
    pub param: String,
    /// The step date the value applies to.
    pub date: NaiveDateTime,
    /// The value, already converted to the model's internal units.
    pub value: f64,
}

/// The outcome of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepResult {
    /// Objective value, when the model reports one.
    pub objective: Option<f64>,
}

/// One solved quantity pulled back out of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Node or link id.
    pub resource_id: u32,
    /// Internal parameter name (e.g. `nodeStorage`, `nodeDelivery`).
    pub param: String,
    /// The step date the value applies to.
    pub date: NaiveDateTime,
    /// The solved value, in the model's internal units.
    pub value: f64,
}

/// An external solver/simulator, as the engine sees it.
pub trait Model {
    /// One-time model construction from the network definition.
    fn construct(&mut self, network: &NetworkDescriptor, grid: &TimeGrid) -> Result<()>;

    /// Set the window of dates the next [`Model::step`] covers.
    fn update_window(&mut self, dates: &[NaiveDateTime]) -> Result<()>;

    /// Push one boundary value. Called once per value per refresh.
    fn update_param(&mut self, update: &ParamUpdate) -> Result<()>;

    /// Carry state forward: seed the next window's initial conditions
    /// from the last solved state (e.g. reservoir storage).
    fn update_initial_conditions(&mut self) -> Result<()>;

    /// Solve the current window. Called exactly once per grid index
    /// (or once in total under perfect foresight).
    fn step(&mut self) -> Result<StepResult>;

    /// The solved quantities for the current window.
    fn collect_outputs(&self) -> Result<Vec<ModelOutput>>;
}
