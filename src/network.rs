//! The network, template and raw-dataset data model.
//!
//! Networks are nodes and links carrying resource attributes; templates
//! describe, per resource type, which attributes exist and how they are
//! typed (data type, unit, blocks, intermediary/variable flags). The
//! `(resource_type, resource_id, attr_id)` triple is the universal
//! addressing unit for every piece of data in the system.
use crate::errors::ConfigurationError;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_string_enum::{DeserializeLabeledStringEnum, SerializeLabeledStringEnum};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use unicase::UniCase;

/// The kind of resource an attribute is attached to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceType {
    /// A point feature (reservoir, demand site, inflow, junction...).
    Node,
    /// A conveyance between two nodes.
    Link,
    /// The network itself.
    Network,
}

/// The universal address of one piece of data: resource type, resource id
/// and attribute id.
///
/// The canonical string form `node/3/12` is used as the store key, as
/// the argument to `get(...)` inside user expressions, and as the serde
/// representation (so keys can index JSON maps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource kind.
    pub resource_type: ResourceType,
    /// Node, link or network id.
    pub resource_id: u32,
    /// Attribute id within the template.
    pub attr_id: u32,
}

impl ResourceKey {
    /// Create a key.
    pub fn new(resource_type: ResourceType, resource_id: u32, attr_id: u32) -> ResourceKey {
        ResourceKey {
            resource_type,
            resource_id,
            attr_id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.resource_type, self.resource_id, self.attr_id
        )
    }
}

impl Serialize for ResourceKey {
    fn serialize<S>(&self, serialiser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialiser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D>(deserialiser: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserialiser)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for ResourceKey {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigurationError(format!("'{s}' is not a resource_type/id/attr_id key"));
        let mut parts = s.split('/');
        let (Some(rt), Some(rid), Some(aid), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let resource_type = ResourceType::from_str(rt).map_err(|_| bad())?;
        let resource_id = rid.parse().map_err(|_| bad())?;
        let attr_id = aid.parse().map_err(|_| bad())?;
        Ok(ResourceKey::new(resource_type, resource_id, attr_id))
    }
}

/// The stored representation of one dataset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeLabeledStringEnum, DeserializeLabeledStringEnum,
)]
pub enum DataType {
    /// A single number.
    #[string = "scalar"]
    Scalar,
    /// A free-form string.
    #[string = "descriptor"]
    Descriptor,
    /// A JSON numeric array.
    #[string = "array"]
    Array,
    /// A date-indexed series over the simulation period.
    #[string = "timeseries"]
    Timeseries,
    /// A date-indexed series over a synthetic "typical year".
    #[string = "periodic timeseries"]
    PeriodicTimeseries,
}

impl DataType {
    /// Whether this is one of the two series types.
    pub fn is_series(&self) -> bool {
        matches!(self, DataType::Timeseries | DataType::PeriodicTimeseries)
    }
}

/// Dataset metadata attached by the data service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    /// Whether the attached function overrides the stored payload.
    #[serde(default)]
    pub use_function: bool,
    /// User expression source, when `use_function` is set.
    #[serde(default)]
    pub function: Option<String>,
}

/// The as-stored dataset for a resource attribute in one scenario.
///
/// Owned by the data service; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawValue {
    /// Data type of the payload.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// The payload (JSON text for series and arrays).
    #[serde(default)]
    pub value: String,
    /// Attached metadata.
    #[serde(default)]
    pub metadata: RawMetadata,
}

impl RawValue {
    /// The function source, when this dataset is function-driven.
    pub fn function(&self) -> Option<&str> {
        if self.metadata.use_function {
            self.metadata.function.as_deref().filter(|f| !f.is_empty())
        } else {
            None
        }
    }
}

/// Static per-template metadata for one attribute of one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeAttribute {
    /// Attribute id.
    pub attr_id: u32,
    /// Human-readable attribute name (e.g. "Storage Demand").
    pub attr_name: String,
    /// Data type of the attribute's datasets.
    pub data_type: DataType,
    /// Unit of measure (e.g. `hm^3`).
    #[serde(default)]
    pub unit: String,
    /// Dimension the unit belongs to (e.g. "Volume").
    #[serde(default)]
    pub dimension: String,
    /// Multiplier applied before unit conversion.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Whether the attribute carries a blocked (sub-curve) structure.
    #[serde(default)]
    pub has_blocks: bool,
    /// Computed by the engine but not fed to the solver.
    #[serde(default)]
    pub intermediary: bool,
    /// A solver output rather than a user-supplied input.
    #[serde(default)]
    pub is_var: bool,
}

fn default_scale() -> f64 {
    1.0
}

/// One resource type in a template, with its attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateType {
    /// Type name (e.g. "Reservoir", "Urban Demand").
    pub name: String,
    /// Which resource kind this type applies to.
    pub resource_type: ResourceType,
    /// The attributes resources of this type carry.
    pub attrs: Vec<TypeAttribute>,
}

/// A template: the full set of resource types and their attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    /// Template id.
    pub id: u32,
    /// Template name.
    pub name: String,
    /// Resource types.
    pub types: Vec<TemplateType>,
}

impl TemplateDescriptor {
    /// Find a type by name, case-insensitively.
    pub fn get_type(&self, resource_type: ResourceType, name: &str) -> Option<&TemplateType> {
        let wanted = UniCase::new(name);
        self.types
            .iter()
            .find(|t| t.resource_type == resource_type && UniCase::new(t.name.as_str()) == wanted)
    }

    /// Human-readable name of an attribute, searched across all types.
    pub fn attr_name(&self, attr_id: u32) -> Option<&str> {
        self.types
            .iter()
            .flat_map(|t| &t.attrs)
            .find(|a| a.attr_id == attr_id)
            .map(|a| a.attr_name.as_str())
    }
}

/// A node in the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Template type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Attribute ids attached to this node.
    #[serde(default)]
    pub attributes: Vec<u32>,
}

/// A link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Link id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Template type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Upstream node id.
    pub node_1_id: u32,
    /// Downstream node id.
    pub node_2_id: u32,
    /// Attribute ids attached to this link.
    #[serde(default)]
    pub attributes: Vec<u32>,
}

/// The network: nodes, links, and network-level attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// Network id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// The template the network's types refer to.
    #[serde(default)]
    pub template_id: u32,
    /// Nodes.
    pub nodes: Vec<Node>,
    /// Links.
    pub links: Vec<Link>,
    /// Attribute ids attached to the network itself.
    #[serde(default)]
    pub attributes: Vec<u32>,
}

impl NetworkDescriptor {
    /// Look up a node by id.
    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a link by id.
    pub fn link(&self, id: u32) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    /// Display name for a resource, falling back to the network's own
    /// name for unknown ids so error messages always name something.
    pub fn resource_name(&self, resource_type: ResourceType, resource_id: u32) -> &str {
        match resource_type {
            ResourceType::Node => self
                .node(resource_id)
                .map_or("unknown resource", |n| n.name.as_str()),
            ResourceType::Link => self
                .link(resource_id)
                .map_or("unknown resource", |l| l.name.as_str()),
            ResourceType::Network => &self.name,
        }
    }

    /// Check that every link references existing nodes and that no node
    /// is fully disconnected.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut graph: DiGraphMap<u32, u32> = DiGraphMap::new();
        for node in &self.nodes {
            graph.add_node(node.id);
        }
        for link in &self.links {
            for end in [link.node_1_id, link.node_2_id] {
                if self.node(end).is_none() {
                    return Err(ConfigurationError(format!(
                        "link '{}' references unknown node {end}",
                        link.name
                    )));
                }
            }
            graph.add_edge(link.node_1_id, link.node_2_id, link.id);
        }
        if self.nodes.len() > 1 {
            for node in &self.nodes {
                let connected = graph
                    .neighbors_directed(node.id, petgraph::Direction::Outgoing)
                    .next()
                    .is_some()
                    || graph
                        .neighbors_directed(node.id, petgraph::Direction::Incoming)
                        .next()
                        .is_some();
                if !connected {
                    log::warn!("node '{}' is not connected to any link", node.name);
                }
            }
        }
        Ok(())
    }

    /// Build the key -> type-attribute index by joining each resource's
    /// template type against the template, case-insensitively.
    pub fn attribute_index(
        &self,
        template: &TemplateDescriptor,
    ) -> HashMap<ResourceKey, TypeAttribute> {
        let mut index = HashMap::new();
        let mut add = |resource_type: ResourceType, resource_id: u32, type_name: &str| {
            if let Some(ttype) = template.get_type(resource_type, type_name) {
                for attr in &ttype.attrs {
                    index.insert(
                        ResourceKey::new(resource_type, resource_id, attr.attr_id),
                        attr.clone(),
                    );
                }
            }
        };
        for node in &self.nodes {
            add(ResourceType::Node, node.id, &node.type_name);
        }
        for link in &self.links {
            add(ResourceType::Link, link.id, &link.type_name);
        }
        add(ResourceType::Network, self.id, "network");
        index
    }
}

/// Normalise an attribute name into its parameter-name component:
/// title-case the words, then strip spaces, slashes and dashes.
pub fn convert_attr_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start_of_word = true;
    for c in name.chars() {
        if c == ' ' || c == '/' || c == '-' {
            start_of_word = true;
            continue;
        }
        if start_of_word {
            out.extend(c.to_uppercase());
            start_of_word = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// The unique internal parameter name for a resource-type/attribute
/// combination, e.g. `nodeStorageDemand`.
pub fn param_name(resource_type: ResourceType, attr_name: &str) -> String {
    format!("{resource_type}{}", convert_attr_name(attr_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_round_trip() {
        let key = ResourceKey::new(ResourceType::Node, 3, 12);
        assert_eq!(key.to_string(), "node/3/12");
        assert_eq!("node/3/12".parse::<ResourceKey>().unwrap(), key);
    }

    #[test]
    fn test_resource_key_parse_rejects_garbage() {
        assert!("node/3".parse::<ResourceKey>().is_err());
        assert!("pump/3/12".parse::<ResourceKey>().is_err());
        assert!("node/x/12".parse::<ResourceKey>().is_err());
        assert!("node/3/12/9".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_param_name() {
        assert_eq!(param_name(ResourceType::Node, "Storage Demand"), "nodeStorageDemand");
        assert_eq!(param_name(ResourceType::Link, "Flow Capacity"), "linkFlowCapacity");
        assert_eq!(param_name(ResourceType::Node, "runoff"), "nodeRunoff");
    }

    #[test]
    fn test_data_type_labels() {
        let dt: DataType = serde_json::from_str("\"periodic timeseries\"").unwrap();
        assert_eq!(dt, DataType::PeriodicTimeseries);
        assert!(dt.is_series());
    }

    fn simple_network() -> NetworkDescriptor {
        NetworkDescriptor {
            id: 1,
            name: "basin".to_string(),
            template_id: 7,
            nodes: vec![
                Node {
                    id: 1,
                    name: "reservoir".to_string(),
                    type_name: "Reservoir".to_string(),
                    attributes: vec![],
                },
                Node {
                    id: 2,
                    name: "city".to_string(),
                    type_name: "Urban Demand".to_string(),
                    attributes: vec![],
                },
            ],
            links: vec![Link {
                id: 10,
                name: "canal".to_string(),
                type_name: "Conveyance".to_string(),
                node_1_id: 1,
                node_2_id: 2,
                attributes: vec![],
            }],
            attributes: vec![],
        }
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        simple_network().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_dangling_link() {
        let mut network = simple_network();
        network.links[0].node_2_id = 99;
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_attribute_index_is_case_insensitive() {
        let template = TemplateDescriptor {
            id: 7,
            name: "t".to_string(),
            types: vec![TemplateType {
                name: "RESERVOIR".to_string(),
                resource_type: ResourceType::Node,
                attrs: vec![TypeAttribute {
                    attr_id: 5,
                    attr_name: "Storage Capacity".to_string(),
                    data_type: DataType::Scalar,
                    unit: "hm^3".to_string(),
                    dimension: "Volume".to_string(),
                    scale: 1.0,
                    has_blocks: false,
                    intermediary: false,
                    is_var: false,
                }],
            }],
        };
        let index = simple_network().attribute_index(&template);
        let key = ResourceKey::new(ResourceType::Node, 1, 5);
        assert_eq!(index.get(&key).unwrap().attr_name, "Storage Capacity");
    }

    #[test]
    fn test_resource_name_fallbacks() {
        let network = simple_network();
        assert_eq!(network.resource_name(ResourceType::Node, 1), "reservoir");
        assert_eq!(network.resource_name(ResourceType::Node, 42), "unknown resource");
        assert_eq!(network.resource_name(ResourceType::Network, 0), "basin");
    }
}
