//! Scenarios, variations and run descriptors.
//!
//! A model request names one or more scenarios; each scenario carries two
//! axes of variation sets ("options" and "scenarios"). The cartesian
//! product of the axes yields the independent units of work. Each unit is
//! captured as a self-contained, serializable [`RunDescriptor`] from
//! which a worker reconstructs a fresh system — descriptors hold only
//! immutable inputs, so there is no aliasing between runs.
use crate::network::ResourceKey;
use crate::store::Variation;
use crate::time_grid::TimeSettings;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A scenario as described by the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    /// Scenario id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// The scenario chain data is resolved against, nearest first.
    #[serde(default)]
    pub source_ids: Vec<u32>,
    /// Time settings for runs of this scenario.
    #[serde(default)]
    pub time: TimeSettings,
    /// Option-axis variation sets.
    #[serde(default)]
    pub options: Vec<VariationSet>,
    /// Scenario-axis variation sets.
    #[serde(default)]
    pub scenarios: Vec<VariationSet>,
}

impl ScenarioDescriptor {
    /// The scenario chain, defaulting to the scenario itself.
    pub fn chain(&self) -> Vec<u32> {
        if self.source_ids.is_empty() {
            vec![self.id]
        } else {
            self.source_ids.clone()
        }
    }
}

/// One named point on a variation axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariationSet {
    /// Id of the option/scenario this set belongs to.
    #[serde(default)]
    pub parent_id: u32,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Perturbations, keyed by resource attribute.
    #[serde(default)]
    pub variations: IndexMap<ResourceKey, Variation>,
}

/// A self-contained description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    /// 1-based position in the expanded set.
    pub number: usize,
    /// Total number of units the request expanded into.
    pub total: usize,
    /// Name of the overall run (for logs and result naming).
    pub run_name: String,
    /// The scenario being run.
    pub scenario_id: u32,
    /// The scenario chain data is resolved against.
    pub source_ids: Vec<u32>,
    /// Applied variation sets: the option set first, then the scenario
    /// set. On conflict the later set wins.
    pub variation_sets: Vec<VariationSet>,
}

impl RunDescriptor {
    /// Merge the variation sets into one map, later sets winning.
    pub fn combined_variations(&self) -> IndexMap<ResourceKey, Variation> {
        let mut combined = IndexMap::new();
        for set in &self.variation_sets {
            for (key, variation) in &set.variations {
                combined.insert(*key, *variation);
            }
        }
        combined
    }
}

/// Expand a scenario into its independent units of work: one descriptor
/// per (option, scenario) combination. An empty axis contributes a single
/// empty variation set, so a scenario with no variations yields exactly
/// one run.
pub fn expand_runs(run_name: &str, scenario: &ScenarioDescriptor) -> Vec<RunDescriptor> {
    let one_empty = vec![VariationSet::default()];
    let options = if scenario.options.is_empty() {
        &one_empty
    } else {
        &scenario.options
    };
    let scenarios = if scenario.scenarios.is_empty() {
        &one_empty
    } else {
        &scenario.scenarios
    };

    let total = options.len() * scenarios.len();
    options
        .iter()
        .cartesian_product(scenarios.iter())
        .enumerate()
        .map(|(i, (option, variant))| RunDescriptor {
            number: i + 1,
            total,
            run_name: run_name.to_string(),
            scenario_id: scenario.id,
            source_ids: scenario.chain(),
            variation_sets: vec![option.clone(), variant.clone()],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ResourceType;
    use crate::store::VariationOperator;
    use map_macro::hash_map;

    fn variation_set(parent_id: u32, entries: &[(ResourceKey, f64)]) -> VariationSet {
        VariationSet {
            parent_id,
            name: format!("set {parent_id}"),
            variations: entries
                .iter()
                .map(|(key, value)| {
                    (
                        *key,
                        Variation {
                            operator: VariationOperator::Multiply,
                            value: *value,
                        },
                    )
                })
                .collect(),
        }
    }

    fn scenario(options: Vec<VariationSet>, scenarios: Vec<VariationSet>) -> ScenarioDescriptor {
        ScenarioDescriptor {
            id: 9,
            name: "baseline".to_string(),
            source_ids: vec![9, 1],
            time: TimeSettings::default(),
            options,
            scenarios,
        }
    }

    #[test]
    fn test_expand_runs_product() {
        let key = ResourceKey::new(ResourceType::Node, 1, 2);
        let runs = expand_runs(
            "test",
            &scenario(
                vec![variation_set(1, &[(key, 1.1)]), variation_set(2, &[(key, 1.2)])],
                vec![variation_set(3, &[]), variation_set(4, &[]), variation_set(5, &[])],
            ),
        );
        assert_eq!(runs.len(), 6);
        assert_eq!(runs[0].number, 1);
        assert_eq!(runs[5].number, 6);
        assert!(runs.iter().all(|r| r.total == 6));
        assert!(runs.iter().all(|r| r.source_ids == vec![9, 1]));
    }

    #[test]
    fn test_expand_runs_no_variations() {
        let runs = expand_runs("test", &scenario(vec![], vec![]));
        assert_eq!(runs.len(), 1);
        assert!(runs[0].combined_variations().is_empty());
    }

    #[test]
    fn test_combined_variations_later_set_wins() {
        let key = ResourceKey::new(ResourceType::Node, 1, 2);
        let runs = expand_runs(
            "test",
            &scenario(
                vec![variation_set(1, &[(key, 1.1)])],
                vec![variation_set(2, &[(key, 2.0)])],
            ),
        );
        let combined = runs[0].combined_variations();
        let expected = hash_map! { key => 2.0 };
        assert_eq!(combined.len(), expected.len());
        float_cmp::assert_approx_eq!(f64, combined[&key].value, expected[&key]);
    }

    #[test]
    fn test_run_descriptor_serialises() {
        let key = ResourceKey::new(ResourceType::Link, 10, 7);
        let runs = expand_runs("test", &scenario(vec![variation_set(1, &[(key, 0.9)])], vec![]));
        let json = serde_json::to_string(&runs[0]).unwrap();
        assert!(json.contains("\"link/10/7\""));
        let back: RunDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, runs[0]);
    }
}
