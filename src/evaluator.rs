//! The dynamic expression evaluation and temporal boundary-condition
//! engine.
//!
//! The evaluator turns raw datasets into canonical [`Value`]s, runs
//! attached user expressions across the active time window with per-date
//! memoization, and exposes the `get` cross-reference primitive that lets
//! one expression read another resource attribute's (possibly
//! time-shifted, aggregated or block-structured) value. A visited stack
//! guards against reference cycles: a direct self-reference serves the
//! in-progress memo (that is how expressions reach their own previous
//! time step), while any longer cycle is detected and raised.
use crate::errors::{EngineError, EngineResult, EvalError, UnknownReferenceError};
use crate::expression::{
    CompiledExpression, CsvRequest, EvalContext, ExpressionCache, GetRequest, TEMPORAL_BINDINGS,
    evaluate,
};
use crate::network::{DataType, RawValue, ResourceKey, TypeAttribute};
use crate::store::BoundaryConditionStore;
use crate::time_grid::{TimeGrid, TimeStep, format_date, parse_date};
use crate::value::{Aggregation, CellValue, FillPolicy, Series, Value};
use chrono::{Datelike, NaiveDateTime, Timelike};
use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Options for one [`Evaluator::eval_data`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalOpts {
    /// Whether the attribute carries blocks.
    pub has_blocks: bool,
    /// Whether to sum blocks into one column. Defaults to the inverse of
    /// `has_blocks`.
    pub flatten: Option<bool>,
    /// Gap filling when reindexing stored series against the grid.
    pub fill: FillPolicy,
    /// Cross-reference depth (0 at the top level).
    pub depth: usize,
}

/// A memoized expression result: one value, or one value per date.
#[derive(Debug, Clone)]
enum MemoEntry {
    Point(CellValue),
    Series(HashMap<NaiveDateTime, CellValue>),
}

/// The in-progress expression evaluation, if any.
struct ActiveEval {
    key: Option<ResourceKey>,
    hash: String,
}

/// A parsed external CSV file: date-indexed numeric columns.
struct CsvTable {
    headers: Vec<String>,
    rows: BTreeMap<NaiveDateTime, Vec<f64>>,
}

/// The expression evaluation engine for one run.
pub struct Evaluator {
    scenario_id: u32,
    grid: TimeGrid,
    tsi: usize,
    tsf: usize,
    memo: HashMap<String, MemoEntry>,
    parsed: HashMap<ResourceKey, Value>,
    raw_values: HashMap<ResourceKey, RawValue>,
    tattrs: HashMap<ResourceKey, TypeAttribute>,
    store: BoundaryConditionStore,
    external: HashMap<String, CsvTable>,
    files_path: PathBuf,
    active: Option<ActiveEval>,
    visited: Vec<ResourceKey>,
    invocations: u64,
}

impl Evaluator {
    /// Create an evaluator bound to a time grid.
    pub fn new(grid: TimeGrid, files_path: PathBuf) -> Evaluator {
        let steps = grid.len();
        Evaluator {
            scenario_id: 0,
            grid,
            tsi: 0,
            tsf: steps,
            memo: HashMap::new(),
            parsed: HashMap::new(),
            raw_values: HashMap::new(),
            tattrs: HashMap::new(),
            store: BoundaryConditionStore::new(),
            external: HashMap::new(),
            files_path,
            active: None,
            visited: Vec::new(),
            invocations: 0,
        }
    }

    /// The active time grid.
    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    /// The boundary-condition store.
    pub fn store(&self) -> &BoundaryConditionStore {
        &self.store
    }

    /// Mutable access to the boundary-condition store.
    pub fn store_mut(&mut self) -> &mut BoundaryConditionStore {
        &mut self.store
    }

    /// Set the scenario whose data is being evaluated.
    pub fn set_scenario(&mut self, scenario_id: u32) {
        self.scenario_id = scenario_id;
    }

    /// The scenario whose data is being evaluated.
    pub fn scenario(&self) -> u32 {
        self.scenario_id
    }

    /// Set the active evaluation window `[tsi, tsf)`.
    pub fn set_window(&mut self, tsi: usize, tsf: usize) {
        self.tsi = tsi;
        self.tsf = tsf.min(self.grid.len());
    }

    /// Register a raw dataset for a key.
    pub fn insert_raw(&mut self, key: ResourceKey, raw: RawValue) {
        self.raw_values.insert(key, raw);
    }

    /// The raw dataset for a key, if known.
    pub fn raw(&self, key: &ResourceKey) -> Option<&RawValue> {
        self.raw_values.get(key)
    }

    /// Register the key -> type-attribute index.
    pub fn set_tattrs(&mut self, tattrs: HashMap<ResourceKey, TypeAttribute>) {
        self.tattrs = tattrs;
    }

    /// The type attribute for a key, if known.
    pub fn tattr(&self, key: &ResourceKey) -> Option<&TypeAttribute> {
        self.tattrs.get(key)
    }

    /// How many times a user expression body has been invoked so far.
    pub fn invocation_count(&self) -> u64 {
        self.invocations
    }

    /// Drop all per-run memoized state. Must be called between
    /// independent scenario runs; expressions may reference
    /// scenario-scoped state, so memos are never shared.
    pub fn reset_memo(&mut self) {
        self.memo.clear();
        self.parsed.clear();
    }

    /// Drop the memo for one expression so it re-evaluates fresh.
    ///
    /// Used for post-process intermediaries, whose results depend on
    /// solver outputs that did not exist when the pre-solve pass ran.
    pub fn forget(&mut self, source: &str, data_type: DataType) {
        let hash = crate::expression::content_hash(source, data_type);
        self.memo.remove(&hash);
    }

    /// Evaluate a raw dataset into its canonical value.
    ///
    /// Function-driven datasets delegate to the expression engine; plain
    /// datasets are parsed once per key and served from cache afterwards.
    pub fn eval_data(
        &mut self,
        key: Option<ResourceKey>,
        raw: &RawValue,
        opts: EvalOpts,
    ) -> EngineResult<Value> {
        let data_type = raw.data_type;

        if let Some(source) = raw.function() {
            let compiled = ExpressionCache::global().get_or_compile(source, data_type)?;
            let has_blocks = opts.has_blocks;
            return self.eval_function(&compiled, key, data_type, has_blocks, opts.depth);
        }

        if let Some(key) = key
            && let Some(cached) = self.parsed.get(&key)
        {
            return Ok(finish_value(cached.clone(), data_type, opts));
        }

        let value = match data_type {
            DataType::Scalar => {
                let text = raw.value.trim();
                let number: f64 = text
                    .parse()
                    .map_err(|_| EvalError::NotANumber(text.to_string()))?;
                Value::Scalar(number)
            }
            DataType::Descriptor => Value::Descriptor(raw.value.clone()),
            DataType::Timeseries => {
                let series = Series::from_json(&raw.value)?;
                let dates: Vec<NaiveDateTime> = self.grid.dates().collect();
                Value::Series(series.reindex(&dates, opts.fill))
            }
            DataType::PeriodicTimeseries => {
                // periodic curves keep their synthetic-year dates; lookups
                // fold real dates onto them
                Value::Series(Series::from_json(&raw.value)?)
            }
            DataType::Array => Value::Array(parse_array(&raw.value)?),
        };

        if let Some(key) = key {
            self.parsed.insert(key, value.clone());
        }
        Ok(finish_value(value, data_type, opts))
    }

    /// Run a compiled expression for a key across the active window.
    ///
    /// Point-typed expressions are invoked once; series-typed expressions
    /// once per date, memoized by `(content hash, date)` so no pair is
    /// ever computed twice in one run. If the first invocation touches no
    /// temporal binding the expression is provably constant and the loop
    /// degenerates to that single call.
    pub fn eval_function(
        &mut self,
        compiled: &Arc<CompiledExpression>,
        key: Option<ResourceKey>,
        data_type: DataType,
        has_blocks: bool,
        depth: usize,
    ) -> EngineResult<Value> {
        let hash = compiled.hash.clone();

        if let Some(MemoEntry::Point(value)) = self.memo.get(&hash) {
            return Ok(point_value(value.clone()));
        }

        let previous = self.active.replace(ActiveEval {
            key,
            hash: hash.clone(),
        });
        let result = self.run_function(compiled, &hash, data_type, has_blocks, depth);
        self.active = previous;
        result
    }

    fn run_function(
        &mut self,
        compiled: &Arc<CompiledExpression>,
        hash: &str,
        data_type: DataType,
        has_blocks: bool,
        depth: usize,
    ) -> EngineResult<Value> {
        if !data_type.is_series() {
            let step = self
                .grid
                .get(self.tsi)
                .or_else(|| self.grid.get(0))
                .cloned()
                .ok_or_else(|| EvalError::BadShape("empty time grid".to_string()))?;
            let (value, _) = self.invoke(compiled, &step, depth)?;
            self.memo
                .insert(hash.to_string(), MemoEntry::Point(value.clone()));
            return Ok(point_value(value));
        }

        for index in self.tsi..self.tsf {
            let step = self.grid.get(index).expect("window within grid").clone();
            let date = step.date;

            if let Some(MemoEntry::Series(dates)) = self.memo.get(hash)
                && dates.contains_key(&date)
            {
                continue;
            }

            let (value, touched_temporal) = self.invoke(compiled, &step, depth)?;

            if let CellValue::Number(n) = value
                && n.is_nan()
            {
                return Err(EvalError::NanResult {
                    date: format_date(&date),
                }
                .into());
            }

            // a first invocation that touched nothing temporal is a
            // constant; don't re-invoke per date
            let fresh = !self.memo.contains_key(hash);
            if fresh && !touched_temporal {
                self.memo
                    .insert(hash.to_string(), MemoEntry::Point(value.clone()));
                return Ok(point_value(value));
            }
            if let CellValue::Text(_) = value {
                return Err(EvalError::BadShape(
                    "expression returned a string for a timeseries".to_string(),
                )
                .into());
            }

            let entry = self
                .memo
                .entry(hash.to_string())
                .or_insert_with(|| MemoEntry::Series(HashMap::new()));
            let MemoEntry::Series(dates) = entry else {
                unreachable!("point memos returned above");
            };
            dates.insert(date, value);
        }

        let series = match self.memo.get(hash) {
            Some(MemoEntry::Series(dates)) => assemble_series(dates, has_blocks),
            // an empty window evaluates nothing
            None => Series::new(),
            Some(MemoEntry::Point(_)) => unreachable!("point memos returned above"),
        };
        Ok(Value::Series(series))
    }

    /// Invoke the expression body once. Returns the value and whether
    /// the invocation touched temporal state.
    fn invoke(
        &mut self,
        compiled: &Arc<CompiledExpression>,
        step: &TimeStep,
        depth: usize,
    ) -> EngineResult<(CellValue, bool)> {
        self.invocations += 1;
        let mut ctx = FunctionContext {
            evaluator: self,
            step: step.clone(),
            depth,
            touched_temporal: false,
        };
        let value = evaluate(&compiled.program, &mut ctx)?;
        let touched = ctx.touched_temporal;
        Ok((value, touched))
    }

    /// Cross-reference another resource attribute, possibly time-shifted,
    /// aggregated over a window, or block-structured.
    pub fn get_value(
        &mut self,
        key: ResourceKey,
        request: &GetRequest,
        step: &TimeStep,
        depth: usize,
    ) -> EngineResult<CellValue> {
        let key_string = key.to_string();
        let parent_key = self.active.as_ref().and_then(|a| a.key);

        let tattr = self
            .tattrs
            .get(&key)
            .cloned()
            .ok_or_else(|| UnknownReferenceError {
                key: key_string.clone(),
            })?;
        let data_type = tattr.data_type;
        let has_blocks = tattr.has_blocks;
        let flatten = request.flatten.unwrap_or(true);

        // resolve the offset up front so bounds errors surface even for
        // self-references
        let lookup_date = match request.offset {
            Some(offset) => {
                let target = step.index as i64 + offset;
                if target < 0 || target >= self.grid.len() as i64 {
                    return Err(EvalError::OffsetOutOfRange { offset }.into());
                }
                self.grid.get(target as usize).expect("bounds checked").date
            }
            None => step.date,
        };

        // Self-reference: serve the in-progress memo (or the store, for
        // dates finished in earlier steps) instead of re-evaluating.
        if parent_key == Some(key) {
            let hash = self.active.as_ref().map(|a| a.hash.clone());
            if let Some(hash) = hash
                && let Some(MemoEntry::Series(dates)) = self.memo.get(&hash)
                && let Some(value) = dates.get(&lookup_date)
            {
                return Ok(value.clone());
            }
            if let Some(value) = self.store.get_at(&key_string, &lookup_date) {
                return Ok(CellValue::Number(value));
            }
            if let Some(default) = request.default {
                return Ok(CellValue::Number(default));
            }
            return Err(EvalError::MissingSelfValue {
                date: format_date(&lookup_date),
            }
            .into());
        }

        // A non-self reference back into the active evaluation stack is a
        // true cycle; there is no sane value to serve.
        if self.visited.contains(&key) {
            return Err(EvalError::CircularReference { key: key_string }.into());
        }

        let window = request.start.is_some() || request.end.is_some();
        let cached = self.store.get(&key_string).cloned();
        let value = match cached {
            Some(value) if !window => value,
            _ => {
                let raw = self.raw_values.get(&key).cloned();
                match raw {
                    Some(raw) => {
                        self.visited.push(key);
                        let result = self.eval_data(
                            Some(key),
                            &raw,
                            EvalOpts {
                                has_blocks,
                                flatten: Some(flatten && !has_blocks),
                                fill: FillPolicy::None,
                                depth: depth + 1,
                            },
                        );
                        self.visited.pop();
                        let value = result?;
                        self.store.set(&key_string, value.clone());
                        value
                    }
                    None => {
                        // absence of input data degrades to a typed default
                        let dates: Vec<NaiveDateTime> = self.grid.dates().collect();
                        self.store
                            .get_or_default(&key_string, Some(data_type), &dates)?
                    }
                }
            }
        };

        self.project(value, data_type, has_blocks, flatten, lookup_date, request)
    }

    /// Project an evaluated value onto what the call site asked for: a
    /// point lookup, a windowed aggregate, or the value itself.
    fn project(
        &self,
        value: Value,
        data_type: DataType,
        has_blocks: bool,
        flatten: bool,
        lookup_date: NaiveDateTime,
        request: &GetRequest,
    ) -> EngineResult<CellValue> {
        match value {
            Value::Scalar(n) => Ok(CellValue::Number(n)),
            Value::Descriptor(s) => Ok(CellValue::Text(s)),
            Value::Array(rows) => Ok(CellValue::List(rows.into_iter().flatten().collect())),
            Value::Series(series) => {
                if request.start.is_some() || request.end.is_some() {
                    let start = match &request.start {
                        Some(s) => parse_date(s)
                            .map_err(|e| EvalError::BadTimeseries(e.to_string()))?,
                        None => lookup_date,
                    };
                    let end = match &request.end {
                        Some(s) => parse_date(s)
                            .map_err(|e| EvalError::BadTimeseries(e.to_string()))?,
                        None => lookup_date,
                    };
                    let agg = request
                        .agg
                        .as_deref()
                        .map(|name| {
                            Aggregation::from_name(name).ok_or_else(|| EvalError::BadShape(
                                format!("unknown aggregation '{name}'"),
                            ))
                        })
                        .transpose()?
                        .unwrap_or_default();
                    let source = if flatten { series.flatten() } else { series };
                    return Ok(CellValue::Number(source.aggregate(&start, &end, agg)));
                }

                let date = if data_type == DataType::PeriodicTimeseries {
                    fold_to_periodic_year(lookup_date)
                } else {
                    lookup_date
                };

                if has_blocks && !flatten {
                    let values = series.at_date(&date);
                    if values.is_empty() {
                        return self.missing_date(request, &date);
                    }
                    return Ok(CellValue::List(values));
                }

                let flat = series.flatten();
                match flat.get(&date) {
                    Some(v) => Ok(CellValue::Number(v)),
                    None => self.missing_date(request, &date),
                }
            }
        }
    }

    fn missing_date(
        &self,
        request: &GetRequest,
        date: &NaiveDateTime,
    ) -> EngineResult<CellValue> {
        if let Some(default) = request.default {
            return Ok(CellValue::Number(default));
        }
        Err(EvalError::Runtime {
            kind: "KeyError".to_string(),
            line: 0,
            detail: format!("no value for date {}", format_date(date)),
        }
        .into())
    }

    /// Read one cell from an external CSV file: the requested column at
    /// the given date. Files are parsed once per run and cached.
    pub fn read_external(
        &mut self,
        request: &CsvRequest,
        date: &NaiveDateTime,
    ) -> EngineResult<CellValue> {
        if !self.external.contains_key(&request.path) {
            let path = self.files_path.join(&request.path);
            let table = read_csv_table(&path).map_err(|err| {
                // named recoverable site: report which file failed, then
                // surface the error to the expression
                warn!("could not load csv file {}: {err}", path.display());
                EvalError::Runtime {
                    kind: "IOError".to_string(),
                    line: 0,
                    detail: format!("could not load csv file '{}'", request.path),
                }
            })?;
            self.external.insert(request.path.clone(), table);
        }
        let table = &self.external[&request.path];

        let column = match &request.column {
            None => 0,
            Some(name) => match table.headers.iter().position(|h| h == name) {
                Some(i) => i,
                None => name.parse::<usize>().ok().and_then(|i| i.checked_sub(1)).ok_or_else(
                    || EvalError::Runtime {
                        kind: "KeyError".to_string(),
                        line: 0,
                        detail: format!("no column '{name}' in '{}'", request.path),
                    },
                )?,
            },
        };

        let row = table.rows.get(date).ok_or_else(|| EvalError::Runtime {
            kind: "KeyError".to_string(),
            line: 0,
            detail: format!("no row for date {} in '{}'", format_date(date), request.path),
        })?;
        row.get(column)
            .copied()
            .map(CellValue::Number)
            .ok_or_else(|| {
                EvalError::Runtime {
                    kind: "KeyError".to_string(),
                    line: 0,
                    detail: format!("no column {column} in '{}'", request.path),
                }
                .into()
            })
    }
}

/// Fold a real date onto the synthetic "typical year" used by periodic
/// series. 29 February folds onto 28 February, which the synthetic year
/// (not a leap year) cannot host.
fn fold_to_periodic_year(date: NaiveDateTime) -> NaiveDateTime {
    let (month, day) = if date.month() == 2 && date.day() == 29 {
        (2, 28)
    } else {
        (date.month(), date.day())
    };
    chrono::NaiveDate::from_ymd_opt(9998, month, day)
        .unwrap()
        .and_hms_opt(date.hour(), date.minute(), date.second())
        .unwrap()
}

/// Build a series from per-date memo entries: numbers land in block 0,
/// lists spread across blocks.
fn assemble_series(dates: &HashMap<NaiveDateTime, CellValue>, has_blocks: bool) -> Series {
    let mut series = Series::new();
    for (date, value) in dates {
        match value {
            CellValue::Number(n) => series.insert(0, *date, *n),
            CellValue::List(values) => {
                if has_blocks {
                    for (block, v) in values.iter().enumerate() {
                        series.insert(block, *date, *v);
                    }
                } else {
                    series.insert(0, *date, values.iter().sum());
                }
            }
            CellValue::Text(_) => {}
        }
    }
    series
}

/// Wrap a memoized point result as a value.
fn point_value(value: CellValue) -> Value {
    match value {
        CellValue::Number(n) => Value::Scalar(n),
        CellValue::Text(s) => Value::Descriptor(s),
        CellValue::List(values) => Value::Array(vec![values]),
    }
}

/// Apply the flatten option to a freshly parsed value.
fn finish_value(value: Value, data_type: DataType, opts: EvalOpts) -> Value {
    let flatten = opts.flatten.unwrap_or(!opts.has_blocks);
    match value {
        Value::Series(series) if data_type.is_series() && flatten && series.is_blocked() => {
            Value::Series(series.flatten())
        }
        other => other,
    }
}

fn parse_array(payload: &str) -> Result<Vec<Vec<f64>>, EvalError> {
    if let Ok(rows) = serde_json::from_str::<Vec<Vec<f64>>>(payload) {
        return Ok(rows);
    }
    serde_json::from_str::<Vec<f64>>(payload)
        .map(|row| vec![row])
        .map_err(|err| EvalError::BadArray(err.to_string()))
}

fn read_csv_table(path: &std::path::Path) -> anyhow::Result<CsvTable> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .skip(1)
        .map(String::from)
        .collect();
    let mut rows = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let date_text = record.get(0).unwrap_or_default();
        let Some(date) = crate::value::parse_series_date(date_text) else {
            anyhow::bail!("bad date '{date_text}'");
        };
        let values: Vec<f64> = record
            .iter()
            .skip(1)
            .map(|v| v.trim().parse().unwrap_or(f64::NAN))
            .collect();
        rows.insert(date, values);
    }
    Ok(CsvTable { headers, rows })
}

/// The [`EvalContext`] a user expression runs against: per-step bindings
/// plus the evaluator's `get`/`read_csv` capabilities.
struct FunctionContext<'a> {
    evaluator: &'a mut Evaluator,
    step: TimeStep,
    depth: usize,
    touched_temporal: bool,
}

impl EvalContext for FunctionContext<'_> {
    fn binding(&mut self, name: &str, line: usize) -> Result<CellValue, EvalError> {
        if TEMPORAL_BINDINGS.contains(&name) {
            self.touched_temporal = true;
        }
        let grid = &self.evaluator.grid;
        let value = match name {
            "timestep" => CellValue::Number(self.step.step_number() as f64),
            "periodic_timestep" => CellValue::Number(self.step.periodic_index as f64),
            "date" => CellValue::Text(self.step.date_as_string()),
            "month" => CellValue::Number(self.step.date.month() as f64),
            "day" => CellValue::Number(self.step.date.day() as f64),
            "year" => CellValue::Number(self.step.date.year() as f64),
            "water_year" => CellValue::Number(self.step.water_year as f64),
            "start_date" => CellValue::Text(
                grid.start().map(|d| format_date(&d)).unwrap_or_default(),
            ),
            "end_date" => {
                CellValue::Text(grid.end().map(|d| format_date(&d)).unwrap_or_default())
            }
            "depth" => CellValue::Number(self.depth as f64),
            "flavor" => CellValue::Text("native".to_string()),
            _ => {
                return Err(EvalError::Runtime {
                    kind: "NameError".to_string(),
                    line,
                    detail: format!("no binding '{name}'"),
                });
            }
        };
        Ok(value)
    }

    fn get(&mut self, request: &GetRequest, line: usize) -> Result<CellValue, EvalError> {
        self.touched_temporal = true;
        let key: ResourceKey = request.key.parse().map_err(|_| EvalError::Runtime {
            kind: "KeyError".to_string(),
            line,
            detail: format!("'{}' is not a resource key", request.key),
        })?;
        let step = self.step.clone();
        self.evaluator
            .get_value(key, request, &step, self.depth + 1)
            .map_err(|err| into_eval_error(err, line))
    }

    fn read_csv(&mut self, request: &CsvRequest, line: usize) -> Result<CellValue, EvalError> {
        self.touched_temporal = true;
        let date = self.step.date;
        self.evaluator
            .read_external(request, &date)
            .map_err(|err| into_eval_error(err, line))
    }
}

/// Flatten an engine error raised below an expression into a single
/// descriptive [`EvalError`] carrying the call-site line.
fn into_eval_error(err: EngineError, line: usize) -> EvalError {
    match err {
        EngineError::Eval(EvalError::Runtime { kind, detail, .. }) => EvalError::Runtime {
            kind,
            line,
            detail,
        },
        EngineError::Eval(inner) => inner,
        EngineError::UnknownReference(inner) => EvalError::Runtime {
            kind: "UnknownReferenceError".to_string(),
            line,
            detail: inner.to_string(),
        },
        other => EvalError::Runtime {
            kind: "EvalError".to_string(),
            line,
            detail: other.to_string(),
        },
    }
}
