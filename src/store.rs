//! The boundary-condition store.
//!
//! A flat `resource_type/resource_id/attr_id` keyed buffer of evaluated
//! values, shared by the evaluator (cross-references) and the stepper
//! (solver inputs and outputs). Blocked values accumulate additively so a
//! multi-source demand curve can be built up incrementally; everything
//! else overwrites.
use crate::errors::MissingKeyError;
use crate::network::DataType;
use crate::value::{Series, Value};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How a variation perturbs a value.
///
/// This is a closed enum on purpose: an unrecognised operator string
/// fails scenario deserialisation instead of silently passing values
/// through unperturbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationOperator {
    /// Multiply every value.
    Multiply,
    /// Add to every value.
    Add,
}

/// A scenario-level perturbation applied to one resource attribute
/// before the run begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// The operator.
    pub operator: VariationOperator,
    /// The operand.
    pub value: f64,
}

/// Apply a variation to a value in place.
pub fn perturb(value: &mut Value, variation: &Variation) {
    let apply = |v: f64| match variation.operator {
        VariationOperator::Multiply => v * variation.value,
        VariationOperator::Add => v + variation.value,
    };
    match value {
        Value::Scalar(v) => *v = apply(*v),
        Value::Descriptor(_) => {}
        Value::Array(rows) => {
            for row in rows {
                for v in row {
                    *v = apply(*v);
                }
            }
        }
        Value::Series(series) => {
            let mut blocks = series.blocks().clone();
            for block in blocks.values_mut() {
                for v in block.values_mut() {
                    *v = apply(*v);
                }
            }
            *series = Series::from_blocks(blocks);
        }
    }
}

/// The per-run boundary-condition buffer.
#[derive(Debug, Default)]
pub struct BoundaryConditionStore {
    entries: HashMap<String, Value>,
    intermediary: HashSet<String>,
}

impl BoundaryConditionStore {
    /// A fresh, empty store.
    pub fn new() -> BoundaryConditionStore {
        BoundaryConditionStore::default()
    }

    /// Store one date's value under `key`.
    ///
    /// With `has_blocks`, the value accumulates into the block-0 bucket
    /// (`new = value + existing`); otherwise it overwrites.
    pub fn store_value(&mut self, key: &str, date: NaiveDateTime, value: f64, has_blocks: bool) {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Series(Series::new()));
        // a non-series entry under this key is stale; a series write wins
        if !matches!(entry, Value::Series(_)) {
            *entry = Value::Series(Series::new());
        }
        let Value::Series(series) = entry else {
            unreachable!();
        };
        let value = if has_blocks {
            value + series.get_block(0, &date).unwrap_or(0.0)
        } else {
            value
        };
        series.insert(0, date, value);
    }

    /// Replace the whole entry under `key`.
    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    /// The entry under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// The stored value at one date (block 0).
    pub fn get_at(&self, key: &str, date: &NaiveDateTime) -> Option<f64> {
        match self.entries.get(key)? {
            Value::Series(series) => series.get(date),
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// The entry under `key`, or a typed default when absent.
    ///
    /// Missing *data* for a known data type degrades gracefully to a
    /// zero-filled series (or `0` / `""` / `[]`); a missing data type is
    /// a hard [`MissingKeyError`] since no default is derivable.
    pub fn get_or_default(
        &self,
        key: &str,
        data_type: Option<DataType>,
        dates: &[NaiveDateTime],
    ) -> Result<Value, MissingKeyError> {
        if let Some(value) = self.entries.get(key) {
            return Ok(value.clone());
        }
        match data_type {
            Some(DataType::Timeseries | DataType::PeriodicTimeseries) => {
                Ok(Value::Series(Series::zeros(dates)))
            }
            Some(DataType::Scalar) => Ok(Value::Scalar(0.0)),
            Some(DataType::Descriptor) => Ok(Value::Descriptor(String::new())),
            Some(DataType::Array) => Ok(Value::Array(Vec::new())),
            None => Err(MissingKeyError {
                key: key.to_string(),
            }),
        }
    }

    /// Apply a variation to every entry of the value stored under `key`.
    pub fn apply_variation(&mut self, key: &str, variation: &Variation) {
        if let Some(value) = self.entries.get_mut(key) {
            perturb(value, variation);
        }
    }

    /// Mark `key` as intermediary (computed, never pushed to the solver).
    pub fn mark_intermediary(&mut self, key: &str) {
        self.intermediary.insert(key.to_string());
    }

    /// Whether `key` is intermediary.
    pub fn is_intermediary(&self, key: &str) -> bool {
        self.intermediary.contains(key)
    }

    /// Whether `key` has been stored.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Drop everything (fresh store semantics between runs).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.intermediary.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_grid::parse_date;
    use float_cmp::assert_approx_eq;

    fn d(s: &str) -> NaiveDateTime {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_blocked_values_accumulate() {
        let mut store = BoundaryConditionStore::new();
        store.store_value("node/1/2", d("2020-01-01"), 3.0, true);
        store.store_value("node/1/2", d("2020-01-01"), 4.5, true);
        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-01")).unwrap(), 7.5);
    }

    #[test]
    fn test_unblocked_values_overwrite() {
        let mut store = BoundaryConditionStore::new();
        store.store_value("node/1/2", d("2020-01-01"), 3.0, false);
        store.store_value("node/1/2", d("2020-01-01"), 4.5, false);
        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-01")).unwrap(), 4.5);
    }

    #[test]
    fn test_identity_variations_leave_values_unchanged() {
        let mut store = BoundaryConditionStore::new();
        store.store_value("node/1/2", d("2020-01-01"), 3.25, false);
        store.store_value("node/1/2", d("2020-01-02"), -1.5, false);

        store.apply_variation(
            "node/1/2",
            &Variation {
                operator: VariationOperator::Add,
                value: 0.0,
            },
        );
        store.apply_variation(
            "node/1/2",
            &Variation {
                operator: VariationOperator::Multiply,
                value: 1.0,
            },
        );

        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-01")).unwrap(), 3.25);
        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-02")).unwrap(), -1.5);
    }

    #[test]
    fn test_variations_perturb() {
        let mut store = BoundaryConditionStore::new();
        store.store_value("node/1/2", d("2020-01-01"), 10.0, false);
        store.apply_variation(
            "node/1/2",
            &Variation {
                operator: VariationOperator::Multiply,
                value: 1.2,
            },
        );
        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-01")).unwrap(), 12.0);

        store.apply_variation(
            "node/1/2",
            &Variation {
                operator: VariationOperator::Add,
                value: -2.0,
            },
        );
        assert_approx_eq!(f64, store.get_at("node/1/2", &d("2020-01-01")).unwrap(), 10.0);
    }

    #[test]
    fn test_unknown_operator_fails_deserialisation() {
        let result: Result<Variation, _> =
            serde_json::from_str("{\"operator\": \"divide\", \"value\": 2}");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_policy() {
        let store = BoundaryConditionStore::new();
        let dates = vec![d("2020-01-01"), d("2020-01-02")];

        let series = store
            .get_or_default("node/1/2", Some(DataType::Timeseries), &dates)
            .unwrap();
        let Value::Series(series) = series else {
            panic!("expected a series default");
        };
        assert_eq!(series.len(), 2);
        assert_approx_eq!(f64, series.get(&dates[0]).unwrap(), 0.0);

        assert_eq!(
            store.get_or_default("node/1/2", Some(DataType::Scalar), &dates),
            Ok(Value::Scalar(0.0))
        );
        assert!(store.get_or_default("node/1/2", None, &dates).is_err());
    }

    #[test]
    fn test_perturb_scalar_and_array() {
        let mut scalar = Value::Scalar(2.0);
        perturb(
            &mut scalar,
            &Variation {
                operator: VariationOperator::Multiply,
                value: 3.0,
            },
        );
        assert_eq!(scalar, Value::Scalar(6.0));

        let mut array = Value::Array(vec![vec![1.0, 2.0], vec![3.0]]);
        perturb(
            &mut array,
            &Variation {
                operator: VariationOperator::Add,
                value: 1.0,
            },
        );
        assert_eq!(array, Value::Array(vec![vec![2.0, 3.0], vec![4.0]]));
    }
}
