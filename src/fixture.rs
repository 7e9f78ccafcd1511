//! Shared test fixtures: a small source-reservoir-demand network, its
//! template, raw dataset builders and a deterministic stub model.
use crate::model::{Model, ModelOutput, ParamUpdate, StepResult};
use crate::network::{
    DataType, Link, NetworkDescriptor, Node, RawMetadata, RawValue, TemplateDescriptor,
    TemplateType, TypeAttribute,
};
use crate::network::ResourceType;
use crate::time_grid::{Span, TimeGrid, TimeSettings};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::Path;

/// A daily grid starting 2020-01-01.
pub fn simple_grid(days: usize) -> TimeGrid {
    let start = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    let end = start + chrono::Duration::days(days as i64 - 1);
    TimeGrid::build(&TimeSettings {
        start: Some(start.format("%Y-%m-%d").to_string()),
        end: Some(end.format("%Y-%m-%d").to_string()),
        span: Some(Span::Day),
        debug_steps: None,
    })
    .unwrap()
}

/// A scalar dataset.
pub fn scalar_raw(text: &str) -> RawValue {
    RawValue {
        data_type: DataType::Scalar,
        value: text.to_string(),
        metadata: RawMetadata::default(),
    }
}

/// A plain timeseries dataset with a JSON payload.
pub fn series_raw(payload: &str) -> RawValue {
    RawValue {
        data_type: DataType::Timeseries,
        value: payload.to_string(),
        metadata: RawMetadata::default(),
    }
}

/// A function-driven timeseries dataset.
pub fn function_raw(source: &str) -> RawValue {
    RawValue {
        data_type: DataType::Timeseries,
        value: String::new(),
        metadata: RawMetadata {
            use_function: true,
            function: Some(source.to_string()),
        },
    }
}

fn attr(
    attr_id: u32,
    attr_name: &str,
    data_type: DataType,
    unit: &str,
    dimension: &str,
    is_var: bool,
) -> TypeAttribute {
    TypeAttribute {
        attr_id,
        attr_name: attr_name.to_string(),
        data_type,
        unit: unit.to_string(),
        dimension: dimension.to_string(),
        scale: 1.0,
        has_blocks: false,
        intermediary: false,
        is_var,
    }
}

/// The demand attribute (`node/*/2`) used across evaluator tests.
pub fn demand_tattr() -> TypeAttribute {
    attr(
        2,
        "Demand",
        DataType::Timeseries,
        "hm^3 day^-1",
        "Volumetric flow rate",
        false,
    )
}

/// The fixture template: inflow, reservoir, demand and conveyance types.
pub fn simple_template() -> TemplateDescriptor {
    let flow = "Volumetric flow rate";
    let flow_unit = "hm^3 day^-1";
    let io_attrs = vec![
        attr(8, "Inflow", DataType::Timeseries, flow_unit, flow, true),
        attr(9, "Outflow", DataType::Timeseries, flow_unit, flow, true),
    ];

    let mut inflow_attrs = vec![attr(1, "Runoff", DataType::Timeseries, flow_unit, flow, false)];
    inflow_attrs.extend(io_attrs.clone());

    let mut reservoir_attrs = vec![
        attr(3, "Initial Storage", DataType::Scalar, "hm^3", "Volume", false),
        attr(4, "Storage Capacity", DataType::Scalar, "hm^3", "Volume", false),
        attr(5, "Storage", DataType::Timeseries, "hm^3", "Volume", true),
    ];
    reservoir_attrs.extend(io_attrs.clone());

    let mut demand_attrs = vec![
        demand_tattr(),
        attr(6, "Delivery", DataType::Timeseries, flow_unit, flow, true),
        attr(7, "Value", DataType::Timeseries, "", "", false),
    ];
    demand_attrs.extend(io_attrs);

    TemplateDescriptor {
        id: 7,
        name: "water systems".to_string(),
        types: vec![
            TemplateType {
                name: "Inflow".to_string(),
                resource_type: ResourceType::Node,
                attrs: inflow_attrs,
            },
            TemplateType {
                name: "Reservoir".to_string(),
                resource_type: ResourceType::Node,
                attrs: reservoir_attrs,
            },
            TemplateType {
                name: "Urban Demand".to_string(),
                resource_type: ResourceType::Node,
                attrs: demand_attrs,
            },
            TemplateType {
                name: "Conveyance".to_string(),
                resource_type: ResourceType::Link,
                attrs: vec![
                    attr(10, "Flow Capacity", DataType::Timeseries, flow_unit, flow, false),
                    attr(11, "Flow", DataType::Timeseries, flow_unit, flow, true),
                ],
            },
        ],
    }
}

/// The fixture network: headflow (1) -> reservoir (2) -> city (3).
pub fn simple_network() -> NetworkDescriptor {
    NetworkDescriptor {
        id: 1,
        name: "demo basin".to_string(),
        template_id: 7,
        nodes: vec![
            Node {
                id: 1,
                name: "headflow".to_string(),
                type_name: "Inflow".to_string(),
                attributes: vec![1, 8, 9],
            },
            Node {
                id: 2,
                name: "main reservoir".to_string(),
                type_name: "Reservoir".to_string(),
                attributes: vec![3, 4, 5, 8, 9],
            },
            Node {
                id: 3,
                name: "city".to_string(),
                type_name: "Urban Demand".to_string(),
                attributes: vec![2, 6, 7, 8, 9],
            },
        ],
        links: vec![
            Link {
                id: 10,
                name: "upper river".to_string(),
                type_name: "Conveyance".to_string(),
                node_1_id: 1,
                node_2_id: 2,
                attributes: vec![10, 11],
            },
            Link {
                id: 11,
                name: "aqueduct".to_string(),
                type_name: "Conveyance".to_string(),
                node_1_id: 2,
                node_2_id: 3,
                attributes: vec![10, 11],
            },
        ],
        attributes: vec![],
    }
}

/// Write a complete runnable model directory: a 5-day daily run of the
/// fixture network, with the demand defined in both scenarios of the
/// chain (8 in the scenario, 5 in its parent).
pub fn write_simple_model(dir: &Path) {
    std::fs::write(
        dir.join("model.toml"),
        "[run]\nname = \"simple\"\nscenario_ids = [9]\nforesight = \"zero\"\n\n\
         [time]\nstart = \"2020-01-01\"\nend = \"2020-01-05\"\nspan = \"day\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("network.json"),
        serde_json::to_string_pretty(&simple_network()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("template.json"),
        serde_json::to_string_pretty(&simple_template()).unwrap(),
    )
    .unwrap();

    let runoff: std::collections::BTreeMap<String, f64> = (1..=5)
        .map(|d| (format!("2020-01-0{d}"), 10.0))
        .collect();
    let data = serde_json::json!({
        "scenarios": [
            {"id": 9, "name": "baseline", "source_ids": [9, 1]},
            {"id": 1, "name": "master"}
        ],
        "data": {
            "9": {
                "node/1/1": {"type": "timeseries", "value": serde_json::to_string(&runoff).unwrap()},
                "node/2/3": {"type": "scalar", "value": "20"},
                "node/2/4": {"type": "scalar", "value": "100"},
                "node/3/2": {"type": "timeseries", "value": "", "metadata": {"use_function": true, "function": "8"}},
                "node/3/7": {"type": "timeseries", "value": "", "metadata": {"use_function": true, "function": "10"}}
            },
            "1": {
                "node/3/2": {"type": "timeseries", "value": "", "metadata": {"use_function": true, "function": "5"}}
            }
        }
    });
    std::fs::write(dir.join("data.json"), serde_json::to_string_pretty(&data).unwrap()).unwrap();
}

/// A deterministic stand-in for the external solver, hard-wired to the
/// fixture chain: deliveries are capped by demand and available water,
/// and reservoir storage obeys mass balance exactly.
#[derive(Default)]
pub struct StubModel {
    storage: f64,
    storage_set: bool,
    capacity: f64,
    runoff: HashMap<NaiveDateTime, f64>,
    demand: HashMap<NaiveDateTime, f64>,
    window: Vec<NaiveDateTime>,
    outputs: Vec<ModelOutput>,
}

impl Model for StubModel {
    fn construct(&mut self, _network: &NetworkDescriptor, _grid: &TimeGrid) -> Result<()> {
        self.capacity = f64::INFINITY;
        Ok(())
    }

    fn update_window(&mut self, dates: &[NaiveDateTime]) -> Result<()> {
        self.window = dates.to_vec();
        Ok(())
    }

    fn update_param(&mut self, update: &ParamUpdate) -> Result<()> {
        match update.param.as_str() {
            "nodeRunoff" => {
                self.runoff.insert(update.date, update.value);
            }
            "nodeDemand" => {
                self.demand.insert(update.date, update.value);
            }
            "nodeInitialStorage" if !self.storage_set => {
                self.storage = update.value;
                self.storage_set = true;
            }
            "nodeStorageCapacity" => self.capacity = update.value,
            _ => {}
        }
        Ok(())
    }

    fn update_initial_conditions(&mut self) -> Result<()> {
        // storage is stateful already
        Ok(())
    }

    fn step(&mut self) -> Result<StepResult> {
        self.outputs.clear();
        for date in self.window.clone() {
            let inflow = self.runoff.get(&date).copied().unwrap_or(0.0);
            let demand = self.demand.get(&date).copied().unwrap_or(0.0);
            let delivery = demand.min(self.storage + inflow);
            let spill = (self.storage + inflow - delivery - self.capacity).max(0.0);
            let outflow = delivery + spill;
            self.storage += inflow - outflow;

            let mut push = |resource_type, resource_id, param: &str, value| {
                self.outputs.push(ModelOutput {
                    resource_type,
                    resource_id,
                    param: param.to_string(),
                    date,
                    value,
                });
            };
            push(ResourceType::Node, 1, "nodeOutflow", inflow);
            push(ResourceType::Link, 10, "linkFlow", inflow);
            push(ResourceType::Node, 2, "nodeInflow", inflow);
            push(ResourceType::Node, 2, "nodeOutflow", outflow);
            push(ResourceType::Node, 2, "nodeStorage", self.storage);
            push(ResourceType::Link, 11, "linkFlow", delivery);
            push(ResourceType::Node, 3, "nodeInflow", delivery);
            push(ResourceType::Node, 3, "nodeDelivery", delivery);
        }
        Ok(StepResult::default())
    }

    fn collect_outputs(&self) -> Result<Vec<ModelOutput>> {
        Ok(self.outputs.clone())
    }
}
