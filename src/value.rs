//! Canonical in-memory values for evaluated datasets.
//!
//! Every dataset evaluates to exactly one [`Value`]; JSON strings and
//! tabular renderings are derived from it at the boundary rather than
//! threaded through the engine as stringly-typed "flavors".
use crate::errors::EvalError;
use crate::time_grid::{DATE_FORMAT, format_date};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Map as JsonMap;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// A single value produced by one expression invocation or one series
/// lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// A number.
    Number(f64),
    /// A string (descriptor).
    Text(String),
    /// An ordered list of numbers (e.g. one value per block).
    List(Vec<f64>),
}

impl CellValue {
    /// The numeric content, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

/// A fully evaluated dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A single number.
    Scalar(f64),
    /// A free-form string.
    Descriptor(String),
    /// A rectangular (possibly ragged) numeric array.
    Array(Vec<Vec<f64>>),
    /// A time-indexed series, possibly split into blocks.
    Series(Series),
}

impl Value {
    /// The scalar content, if any.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(n) => Some(*n),
            _ => None,
        }
    }

    /// The series content, if any.
    pub fn as_series(&self) -> Option<&Series> {
        match self {
            Value::Series(s) => Some(s),
            _ => None,
        }
    }

    /// Render as the persisted JSON form.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Scalar(n) => Json::from(*n),
            Value::Descriptor(s) => Json::from(s.clone()),
            Value::Array(rows) => Json::from(
                rows.iter()
                    .map(|r| Json::from(r.clone()))
                    .collect::<Vec<_>>(),
            ),
            Value::Series(s) => s.to_json(),
        }
    }
}

/// How to fill gaps when reindexing a series against the time grid.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FillPolicy {
    /// Leave gaps missing.
    #[default]
    None,
    /// Fill gaps with a constant.
    Value(f64),
    /// Carry the previous value forward.
    Forward,
}

/// A time-indexed series of numbers, optionally split into ordered
/// blocks (sub-curves of a demand or priority curve).
///
/// Dates are kept sorted, which gives the persisted format its required
/// ordering for free.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    blocks: BTreeMap<usize, BTreeMap<NaiveDateTime, f64>>,
}

impl Series {
    /// An empty single-block series.
    pub fn new() -> Series {
        Series {
            blocks: [(0, BTreeMap::new())].into_iter().collect(),
        }
    }

    /// Wrap a plain date-to-value map as block 0.
    pub fn from_single(values: BTreeMap<NaiveDateTime, f64>) -> Series {
        Series {
            blocks: [(0, values)].into_iter().collect(),
        }
    }

    /// Build from explicit per-block maps.
    pub fn from_blocks(blocks: BTreeMap<usize, BTreeMap<NaiveDateTime, f64>>) -> Series {
        if blocks.is_empty() {
            return Series::new();
        }
        Series { blocks }
    }

    /// The per-block maps.
    pub fn blocks(&self) -> &BTreeMap<usize, BTreeMap<NaiveDateTime, f64>> {
        &self.blocks
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether this series has more than the default block.
    pub fn is_blocked(&self) -> bool {
        self.blocks.len() > 1
    }

    /// Number of dates in block 0.
    pub fn len(&self) -> usize {
        self.blocks.get(&0).map_or(0, BTreeMap::len)
    }

    /// Whether block 0 is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The block-0 value at `date`.
    pub fn get(&self, date: &NaiveDateTime) -> Option<f64> {
        self.blocks.get(&0).and_then(|b| b.get(date)).copied()
    }

    /// The value of block `block` at `date`.
    pub fn get_block(&self, block: usize, date: &NaiveDateTime) -> Option<f64> {
        self.blocks.get(&block).and_then(|b| b.get(date)).copied()
    }

    /// One value per block at `date`, in block order.
    pub fn at_date(&self, date: &NaiveDateTime) -> Vec<f64> {
        self.blocks
            .values()
            .filter_map(|b| b.get(date).copied())
            .collect()
    }

    /// Insert a value into the given block.
    pub fn insert(&mut self, block: usize, date: NaiveDateTime, value: f64) {
        self.blocks.entry(block).or_default().insert(date, value);
    }

    /// Sum across blocks into a single date-to-value map.
    pub fn flattened(&self) -> BTreeMap<NaiveDateTime, f64> {
        let mut out: BTreeMap<NaiveDateTime, f64> = BTreeMap::new();
        for block in self.blocks.values() {
            for (date, value) in block {
                *out.entry(*date).or_insert(0.0) += value;
            }
        }
        out
    }

    /// Collapse to a single-block series by summing across blocks.
    pub fn flatten(&self) -> Series {
        Series::from_single(self.flattened())
    }

    /// Aggregate block-0 values over `[start, end]`.
    pub fn aggregate(&self, start: &NaiveDateTime, end: &NaiveDateTime, agg: Aggregation) -> f64 {
        let values: Vec<f64> = self
            .blocks
            .get(&0)
            .map(|b| b.range(start..=end).map(|(_, v)| *v).collect())
            .unwrap_or_default();
        match agg {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Mean => {
                if values.is_empty() {
                    f64::NAN
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
        }
    }

    /// Reindex every block against `dates`, filling gaps per `fill`.
    pub fn reindex(&self, dates: &[NaiveDateTime], fill: FillPolicy) -> Series {
        let mut blocks = BTreeMap::new();
        for (index, block) in &self.blocks {
            let mut out = BTreeMap::new();
            let mut last = None;
            for date in dates {
                let value = block.get(date).copied();
                let value = match (value, fill) {
                    (Some(v), _) => Some(v),
                    (None, FillPolicy::Value(v)) => Some(v),
                    (None, FillPolicy::Forward) => last,
                    (None, FillPolicy::None) => None,
                };
                if let Some(v) = value {
                    out.insert(*date, v);
                    last = Some(v);
                }
            }
            blocks.insert(*index, out);
        }
        Series::from_blocks(blocks)
    }

    /// A zero-filled single-block series over `dates`.
    pub fn zeros(dates: &[NaiveDateTime]) -> Series {
        Series::from_single(dates.iter().map(|d| (*d, 0.0)).collect())
    }

    /// Render as the persisted JSON form: block index (stringified) to a
    /// date-string-to-number map, dates sorted ascending.
    pub fn to_json(&self) -> Json {
        let mut outer = JsonMap::new();
        for (index, block) in &self.blocks {
            let mut inner = JsonMap::new();
            for (date, value) in block {
                let v = if value.is_nan() {
                    Json::Null
                } else {
                    Json::from(*value)
                };
                inner.insert(format_date(date), v);
            }
            outer.insert(index.to_string(), Json::Object(inner));
        }
        Json::Object(outer)
    }

    /// Parse the stored JSON form.
    ///
    /// Accepts either the block-keyed form (`{"0": {date: value}}`) or a
    /// flat date-keyed map (treated as block 0); null values are skipped.
    /// An empty payload parses as an empty series.
    pub fn from_json(payload: &str) -> Result<Series, EvalError> {
        let parsed: Json = serde_json::from_str(payload)
            .map_err(|err| EvalError::BadTimeseries(err.to_string()))?;
        let object = match parsed {
            Json::Object(o) => o,
            _ => {
                return Err(EvalError::BadTimeseries(
                    "expected a JSON object".to_string(),
                ));
            }
        };
        if object.is_empty() {
            return Ok(Series::new());
        }

        // Decide shape by inspecting the first entry: nested objects mean
        // block-keyed, anything else means a flat date map.
        let nested = object.values().next().is_some_and(Json::is_object);
        let mut blocks = BTreeMap::new();
        if nested {
            for (i, (_, block)) in object.iter().enumerate() {
                let inner = block.as_object().ok_or_else(|| {
                    EvalError::BadTimeseries("mixed block and date keys".to_string())
                })?;
                blocks.insert(i, parse_date_map(inner)?);
            }
        } else {
            blocks.insert(0, parse_date_map(&object)?);
        }
        Ok(Series::from_blocks(blocks))
    }

    /// Convert to an explicit tabular form.
    pub fn to_table(&self) -> Table {
        let mut dates: Vec<NaiveDateTime> = self.flattened().keys().copied().collect();
        dates.sort_unstable();
        let columns: Vec<usize> = self.blocks.keys().copied().collect();
        let rows = dates
            .iter()
            .map(|date| {
                columns
                    .iter()
                    .map(|c| self.get_block(*c, date))
                    .collect()
            })
            .collect();
        Table {
            columns,
            dates,
            rows,
        }
    }
}

fn parse_date_map(map: &JsonMap<String, Json>) -> Result<BTreeMap<NaiveDateTime, f64>, EvalError> {
    let mut out = BTreeMap::new();
    for (key, value) in map {
        let date = parse_series_date(key)
            .ok_or_else(|| EvalError::BadTimeseries(format!("bad date key '{key}'")))?;
        match value {
            Json::Null => {}
            Json::Number(n) => {
                out.insert(date, n.as_f64().unwrap_or(f64::NAN));
            }
            other => {
                return Err(EvalError::BadTimeseries(format!(
                    "non-numeric value {other} for date '{key}'"
                )));
            }
        }
    }
    Ok(out)
}

/// Parse a series date key in any of the forms data sources emit.
pub fn parse_series_date(s: &str) -> Option<NaiveDateTime> {
    for format in [
        DATE_FORMAT,
        "%Y-%m-%dT%H:%M:%S%.3f",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Window aggregation method for `get(start=..., end=...)` lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    /// Arithmetic mean.
    #[default]
    Mean,
    /// Sum.
    Sum,
}

impl Aggregation {
    /// Parse the user-facing name.
    pub fn from_name(name: &str) -> Option<Aggregation> {
        match name {
            "mean" => Some(Aggregation::Mean),
            "sum" => Some(Aggregation::Sum),
            _ => None,
        }
    }
}

/// An explicit tabular rendering of a [`Series`]: one row per date, one
/// column per block.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Block indices, in order.
    pub columns: Vec<usize>,
    /// Row dates, ascending.
    pub dates: Vec<NaiveDateTime>,
    /// Row-major values; `None` where a block has no value for a date.
    pub rows: Vec<Vec<Option<f64>>>,
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
    fn test_series_json_round_trip() {
        let mut series = Series::new();
        series.insert(0, d("2020-01-02"), 2.0);
        series.insert(0, d("2020-01-01"), 1.0);
        let json = serde_json::to_string(&series.to_json()).unwrap();
        // dates must come out sorted
        assert_eq!(
            json,
            "{\"0\":{\"2020-01-01 00:00:00\":1.0,\"2020-01-02 00:00:00\":2.0}}"
        );
        assert_eq!(Series::from_json(&json).unwrap(), series);
    }

    #[test]
    fn test_from_json_flat_map() {
        let series = Series::from_json("{\"2020-01-01\": 4.5, \"2020-01-02\": null}").unwrap();
        assert_eq!(series.n_blocks(), 1);
        assert_eq!(series.get(&d("2020-01-01")), Some(4.5));
        assert_eq!(series.get(&d("2020-01-02")), None);
    }

    #[test]
    fn test_from_json_iso_dates() {
        let series = Series::from_json("{\"0\": {\"2020-01-01T00:00:00.000\": 7.0}}").unwrap();
        assert_eq!(series.get(&d("2020-01-01")), Some(7.0));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Series::from_json("not json").is_err());
        assert!(Series::from_json("[1, 2]").is_err());
        assert!(Series::from_json("{\"2020-01-01\": \"abc\"}").is_err());
    }

    #[test]
    fn test_flatten_sums_blocks() {
        let mut series = Series::new();
        series.insert(0, d("2020-01-01"), 1.0);
        series.insert(1, d("2020-01-01"), 2.5);
        let flat = series.flatten();
        assert_eq!(flat.n_blocks(), 1);
        assert_approx_eq!(f64, flat.get(&d("2020-01-01")).unwrap(), 3.5);
    }

    #[test]
    fn test_aggregate() {
        let mut series = Series::new();
        for (i, day) in (1..=4).enumerate() {
            series.insert(0, d(&format!("2020-01-0{day}")), (i + 1) as f64);
        }
        let start = d("2020-01-02");
        let end = d("2020-01-03");
        assert_approx_eq!(f64, series.aggregate(&start, &end, Aggregation::Sum), 5.0);
        assert_approx_eq!(f64, series.aggregate(&start, &end, Aggregation::Mean), 2.5);
    }

    #[test]
    fn test_reindex_fill_value_and_forward() {
        let mut series = Series::new();
        series.insert(0, d("2020-01-01"), 1.0);
        series.insert(0, d("2020-01-03"), 3.0);
        let dates = vec![d("2020-01-01"), d("2020-01-02"), d("2020-01-03")];

        let filled = series.reindex(&dates, FillPolicy::Value(0.0));
        assert_approx_eq!(f64, filled.get(&d("2020-01-02")).unwrap(), 0.0);

        let carried = series.reindex(&dates, FillPolicy::Forward);
        assert_approx_eq!(f64, carried.get(&d("2020-01-02")).unwrap(), 1.0);

        let sparse = series.reindex(&dates, FillPolicy::None);
        assert_eq!(sparse.get(&d("2020-01-02")), None);
    }

    #[test]
    fn test_to_table() {
        let mut series = Series::new();
        series.insert(0, d("2020-01-01"), 1.0);
        series.insert(1, d("2020-01-01"), 2.0);
        series.insert(1, d("2020-01-02"), 4.0);
        let table = series.to_table();
        assert_eq!(table.columns, vec![0, 1]);
        assert_eq!(table.dates.len(), 2);
        assert_eq!(table.rows[0], vec![Some(1.0), Some(2.0)]);
        assert_eq!(table.rows[1], vec![None, Some(4.0)]);
    }

    #[test]
    fn test_series_nan_serialises_as_null() {
        let mut series = Series::new();
        series.insert(0, d("2020-01-01"), f64::NAN);
        let json = serde_json::to_string(&series.to_json()).unwrap();
        assert_eq!(json, "{\"0\":{\"2020-01-01 00:00:00\":null}}");
    }
}
