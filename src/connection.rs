//! The data-service interface and a file-backed implementation.
//!
//! The engine consumes network definitions, templates and raw datasets
//! through the [`DataConnection`] trait; result datasets flow back out
//! through the same trait. [`LocalConnection`] implements it against a
//! model directory so the engine runs standalone.
use crate::network::{NetworkDescriptor, RawValue, ResourceKey, ResourceType, TemplateDescriptor};
use crate::scenario::ScenarioDescriptor;
use crate::time_grid::TimeSettings;
use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_string_enum::{DeserializeLabeledStringEnum, SerializeLabeledStringEnum};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Whether the solver sees one step at a time or the whole horizon.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, SerializeLabeledStringEnum, DeserializeLabeledStringEnum,
)]
pub enum Foresight {
    /// Solve one step at a time; state carries forward.
    #[default]
    #[string = "zero"]
    Zero,
    /// Solve the entire horizon in one step.
    #[string = "perfect"]
    Perfect,
}

/// Run configuration, read from `model.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    /// The `[run]` section.
    pub run: RunSection,
    /// The `[time]` section.
    #[serde(default)]
    pub time: TimeSettings,
}

/// The `[run]` section of `model.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunSection {
    /// Name for this run (used in logs and result naming).
    pub name: String,
    /// Scenarios to run.
    pub scenario_ids: Vec<u32>,
    /// Foresight mode.
    #[serde(default)]
    pub foresight: Foresight,
    /// Directory external files (`read_csv`) resolve against, relative
    /// to the model directory.
    #[serde(default)]
    pub files_path: Option<String>,
}

/// One result dataset handed back to the data service on save.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDataset {
    /// Which resource attribute the dataset belongs to.
    pub key: ResourceKey,
    /// Display name for the dataset.
    pub name: String,
    /// The persisted JSON form (block index -> date -> value).
    pub value: serde_json::Value,
}

/// The remote data/network-definition service, as the engine sees it.
pub trait DataConnection {
    /// The network definition.
    fn get_network(&self) -> Result<NetworkDescriptor>;

    /// The template a network id refers to.
    fn get_template(&self, id: u32) -> Result<TemplateDescriptor>;

    /// A scenario descriptor by id.
    fn get_scenario(&self, id: u32) -> Result<ScenarioDescriptor>;

    /// Raw datasets for one resource, resolved against a scenario chain
    /// (nearest scenario wins). With `attr_id`, only that attribute.
    fn get_resource_attribute_data(
        &self,
        resource_type: ResourceType,
        resource_id: u32,
        scenario_ids: &[u32],
        attr_id: Option<u32>,
    ) -> Result<Vec<(ResourceKey, RawValue)>>;

    /// Create or refresh the result scenario for a run.
    fn update_scenario(&mut self, scenario: &ScenarioDescriptor) -> Result<ScenarioDescriptor>;

    /// Persist a batch of result datasets into a scenario.
    fn save_results(&mut self, scenario_id: u32, results: Vec<ResultDataset>) -> Result<()>;
}

/// Read and deserialize a TOML file.
pub fn read_toml<T: DeserializeOwned>(file_path: &Path) -> Result<T> {
    let text = fs::read_to_string(file_path)
        .with_context(|| format!("Error reading {}", file_path.to_string_lossy()))?;
    toml::from_str(&text)
        .with_context(|| format!("Error parsing {}", file_path.to_string_lossy()))
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(file_path: &Path) -> Result<T> {
    let text = fs::read_to_string(file_path)
        .with_context(|| format!("Error reading {}", file_path.to_string_lossy()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Error parsing {}", file_path.to_string_lossy()))
}

const MODEL_FILE_NAME: &str = "model.toml";
const NETWORK_FILE_NAME: &str = "network.json";
const TEMPLATE_FILE_NAME: &str = "template.json";
const DATA_FILE_NAME: &str = "data.json";

/// The `data.json` layout: scenario descriptors plus per-scenario data
/// keyed by canonical key string.
#[derive(Debug, Clone, Default, Deserialize)]
struct DataFile {
    #[serde(default)]
    scenarios: Vec<ScenarioDescriptor>,
    #[serde(default)]
    data: HashMap<String, IndexMap<ResourceKey, RawValue>>,
}

/// A [`DataConnection`] backed by a model directory.
pub struct LocalConnection {
    dir: PathBuf,
    config: RunConfig,
    network: NetworkDescriptor,
    template: TemplateDescriptor,
    scenarios: Vec<ScenarioDescriptor>,
    data: HashMap<u32, IndexMap<ResourceKey, RawValue>>,
    results: HashMap<u32, Vec<ResultDataset>>,
}

impl LocalConnection {
    /// Load a model directory.
    pub fn open<P: AsRef<Path>>(model_dir: P) -> Result<LocalConnection> {
        let dir = model_dir.as_ref().to_path_buf();
        let config: RunConfig = read_toml(&dir.join(MODEL_FILE_NAME))?;
        let network: NetworkDescriptor = read_json(&dir.join(NETWORK_FILE_NAME))?;
        let template: TemplateDescriptor = read_json(&dir.join(TEMPLATE_FILE_NAME))?;
        let data_file: DataFile = read_json(&dir.join(DATA_FILE_NAME))?;

        network.validate()?;

        let mut data = HashMap::new();
        for (scenario_id, datasets) in data_file.data {
            let id: u32 = scenario_id
                .parse()
                .map_err(|_| anyhow!("bad scenario id '{scenario_id}' in {DATA_FILE_NAME}"))?;
            data.insert(id, datasets);
        }

        Ok(LocalConnection {
            dir,
            config,
            network,
            template,
            scenarios: data_file.scenarios,
            data,
            results: HashMap::new(),
        })
    }

    /// The run configuration from `model.toml`.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Absolute path external files resolve against.
    pub fn files_path(&self) -> PathBuf {
        match &self.config.run.files_path {
            Some(p) => self.dir.join(p),
            None => self.dir.clone(),
        }
    }

    /// Results saved so far for a scenario (used by callers that persist
    /// to disk and by tests).
    pub fn saved_results(&self, scenario_id: u32) -> &[ResultDataset] {
        self.results
            .get(&scenario_id)
            .map_or(&[], Vec::as_slice)
    }
}

impl DataConnection for LocalConnection {
    fn get_network(&self) -> Result<NetworkDescriptor> {
        Ok(self.network.clone())
    }

    fn get_template(&self, id: u32) -> Result<TemplateDescriptor> {
        if self.template.id != id {
            return Err(anyhow!("unknown template {id}"));
        }
        Ok(self.template.clone())
    }

    fn get_scenario(&self, id: u32) -> Result<ScenarioDescriptor> {
        self.scenarios
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown scenario {id}"))
    }

    fn get_resource_attribute_data(
        &self,
        resource_type: ResourceType,
        resource_id: u32,
        scenario_ids: &[u32],
        attr_id: Option<u32>,
    ) -> Result<Vec<(ResourceKey, RawValue)>> {
        let mut out: IndexMap<ResourceKey, RawValue> = IndexMap::new();
        // nearest scenario in the chain wins, so walk it in order and
        // only take keys not already resolved
        for scenario_id in scenario_ids {
            let Some(datasets) = self.data.get(scenario_id) else {
                continue;
            };
            for (key, value) in datasets {
                if key.resource_type != resource_type || key.resource_id != resource_id {
                    continue;
                }
                if attr_id.is_some_and(|a| a != key.attr_id) {
                    continue;
                }
                out.entry(*key).or_insert_with(|| value.clone());
            }
        }
        Ok(out.into_iter().collect())
    }

    fn update_scenario(&mut self, scenario: &ScenarioDescriptor) -> Result<ScenarioDescriptor> {
        if let Some(existing) = self.scenarios.iter_mut().find(|s| s.id == scenario.id) {
            *existing = scenario.clone();
        } else {
            self.scenarios.push(scenario.clone());
        }
        Ok(scenario.clone())
    }

    fn save_results(&mut self, scenario_id: u32, results: Vec<ResultDataset>) -> Result<()> {
        self.results.entry(scenario_id).or_default().extend(results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::write_simple_model;
    use tempfile::tempdir;

    #[test]
    fn test_open_and_query() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());

        let conn = LocalConnection::open(dir.path()).unwrap();
        assert_eq!(conn.config().run.scenario_ids, vec![9]);
        assert_eq!(conn.config().run.foresight, Foresight::Zero);

        let network = conn.get_network().unwrap();
        assert_eq!(network.nodes.len(), 3);
        assert_eq!(network.links.len(), 2);

        let scenario = conn.get_scenario(9).unwrap();
        assert_eq!(scenario.name, "baseline");
        assert!(conn.get_scenario(404).is_err());
    }

    #[test]
    fn test_chain_resolution_nearest_wins() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());

        let conn = LocalConnection::open(dir.path()).unwrap();
        // the demand node's demand attribute is defined in both 9 and 1;
        // scenario 9 is nearer in the chain
        let data = conn
            .get_resource_attribute_data(ResourceType::Node, 3, &[9, 1], Some(2))
            .unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].1.metadata.function.as_deref(), Some("8"));

        // reversing the chain flips the winner
        let data = conn
            .get_resource_attribute_data(ResourceType::Node, 3, &[1, 9], Some(2))
            .unwrap();
        assert_eq!(data[0].1.metadata.function.as_deref(), Some("5"));
    }

    #[test]
    fn test_save_results_accumulates() {
        let dir = tempdir().unwrap();
        write_simple_model(dir.path());

        let mut conn = LocalConnection::open(dir.path()).unwrap();
        let key = ResourceKey::new(ResourceType::Node, 3, 2);
        conn.save_results(
            50,
            vec![ResultDataset {
                key,
                name: "demand".to_string(),
                value: serde_json::json!({"0": {}}),
            }],
        )
        .unwrap();
        assert_eq!(conn.saved_results(50).len(), 1);
    }
}
