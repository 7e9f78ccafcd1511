//! Error types for the simulation engine.
//!
//! Each failure mode gets its own type so callers can react per mode:
//! setup errors abort the run, step errors flush partial results first,
//! cancellation is not a failure. `anyhow` is used only at the
//! application boundary.
use thiserror::Error;

/// Bad or missing run configuration (time grid, scenario wiring).
///
/// Fatal and surfaced immediately; never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// A user expression failed to compile.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("syntax error at line {line}: {message}")]
pub struct ExpressionSyntaxError {
    /// The offending source snippet.
    pub expression: String,
    /// What went wrong.
    pub message: String,
    /// 1-based line within the user's source.
    pub line: usize,
}

/// A failure while evaluating data or executing a user expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// A scalar payload that does not parse as a number.
    #[error("\"{0}\" is not a number")]
    NotANumber(String),
    /// A timeseries payload that does not parse.
    #[error("error parsing timeseries data: {0}")]
    BadTimeseries(String),
    /// An array payload that is not valid JSON.
    #[error("error parsing array data: {0}")]
    BadArray(String),
    /// An error raised inside a user expression, annotated with the
    /// error class and the (user-source) line number.
    #[error("{kind} at line {line}: {detail}")]
    Runtime {
        /// Error class, e.g. `TypeError`, `ZeroDivisionError`.
        kind: String,
        /// 1-based line within the user's source.
        line: usize,
        /// Human-readable detail.
        detail: String,
    },
    /// A `get` offset that lands outside the simulation period.
    #[error("offset {offset} is outside the simulation period")]
    OffsetOutOfRange {
        /// The requested time-step offset.
        offset: i64,
    },
    /// An expression produced NaN in a timeseries context.
    #[error("expression produced NaN for date {date}")]
    NanResult {
        /// The date being evaluated.
        date: String,
    },
    /// A reference cycle longer than a direct self-reference.
    #[error("circular reference involving {key}")]
    CircularReference {
        /// The key that closed the cycle.
        key: String,
    },
    /// A self-referencing expression asked for a date it has not yet
    /// produced.
    #[error("no result found for this variable for date {date}")]
    MissingSelfValue {
        /// The requested date.
        date: String,
    },
    /// The expression returned a shape the data type cannot hold.
    #[error("incorrect data format for expression: {0}")]
    BadShape(String),
}

/// A `get()` call targeted a key with no known type metadata.
///
/// This is a data-model inconsistency, not recoverable by retry.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unknown resource attribute reference: {key}")]
pub struct UnknownReferenceError {
    /// Canonical `resource_type/resource_id/attr_id` key string.
    pub key: String,
}

/// A boundary value was requested whose type metadata is absent, so no
/// default can be derived.
///
/// Missing *data* for a known type yields a typed default instead.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no value stored and no default derivable for {key}")]
pub struct MissingKeyError {
    /// Canonical key string.
    pub key: String,
}

/// A failure during a single [`crate::system::WaterSystem`] step.
///
/// Raised after a best-effort partial-results flush; the caller decides
/// whether to retry the whole run.
#[derive(Debug, Error)]
#[error("something went wrong at step {step} of {total} ({date}):\n\n{detail}")]
pub struct StepExecutionError {
    /// 1-based step number.
    pub step: usize,
    /// Total steps in the run.
    pub total: usize,
    /// Date of the failing step.
    pub date: String,
    /// The underlying failure, rendered.
    pub detail: String,
}

/// Cooperative cancellation; short-circuits cleanly, not a failure.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("run canceled by user")]
pub struct Canceled;

/// Any error the engine can raise.
#[derive(Debug, Error)]
pub enum EngineError {
    /// See [`ConfigurationError`].
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// See [`ExpressionSyntaxError`].
    #[error(transparent)]
    Syntax(#[from] ExpressionSyntaxError),
    /// See [`EvalError`].
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// See [`UnknownReferenceError`].
    #[error(transparent)]
    UnknownReference(#[from] UnknownReferenceError),
    /// See [`MissingKeyError`].
    #[error(transparent)]
    MissingKey(#[from] MissingKeyError),
    /// See [`StepExecutionError`].
    #[error(transparent)]
    Step(#[from] StepExecutionError),
    /// See [`Canceled`].
    #[error(transparent)]
    Canceled(#[from] Canceled),
}

impl EngineError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled(_))
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
