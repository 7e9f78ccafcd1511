//! The user expression language.
//!
//! Datasets can be driven by a small user-authored expression instead of a
//! stored payload. Expressions are compiled once into a closed AST (no
//! dynamic code execution), content-addressed by hash, and interpreted
//! against an evaluation context that supplies the per-step bindings
//! (`timestep`, `date`, `water_year`, ...) and the `get`/`read_csv`
//! cross-reference capabilities.
//!
//! The language is deliberately narrow: arithmetic, comparisons, boolean
//! operators, `if ... then ... else ...`, a fixed builtin library and the
//! two context calls. A program is a sequence of `name = expr` statements
//! whose final statement is the result (the last statement is an implicit
//! `return`; an explicit `return expr` is also accepted).
use crate::errors::ExpressionSyntaxError;
use crate::network::DataType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

mod ast;
mod interp;
mod lexer;
mod parser;

pub use ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
pub use interp::{CsvRequest, EvalContext, GetRequest, evaluate};

/// Bindings an expression may read from its evaluation context.
///
/// This list is the whole capability surface: the parser rejects any other
/// free identifier at compile time.
pub const CONTEXT_BINDINGS: &[&str] = &[
    "timestep",
    "periodic_timestep",
    "date",
    "month",
    "day",
    "year",
    "start_date",
    "end_date",
    "water_year",
    "depth",
    "flavor",
];

/// Bindings whose value changes from step to step.
///
/// Touching one of these (or calling `get`/`read_csv`) marks an
/// invocation as time-dependent; an invocation that touches none is
/// provably constant and is evaluated only once for the whole series.
pub const TEMPORAL_BINDINGS: &[&str] = &[
    "timestep",
    "periodic_timestep",
    "date",
    "month",
    "day",
    "year",
    "water_year",
];

/// The allow-listed builtin function library.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "min", "max", "sum", "mean", "sqrt", "ln", "log10", "exp", "floor", "ceil", "isnan",
];

/// The context-call names (cross-reference and external lookup).
pub const CONTEXT_FUNCTIONS: &[&str] = &["get", "GET", "read_csv"];

/// A compiled user expression, content-addressed by hash.
#[derive(Debug)]
pub struct CompiledExpression {
    /// blake3 hex digest of `(source, data_type)`.
    pub hash: String,
    /// The original source, kept for error reporting.
    pub source: String,
    /// The parsed program.
    pub program: Program,
}

/// Hash a `(source, data_type)` pair the way the cache keys it.
pub fn content_hash(source: &str, data_type: DataType) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(format!("{data_type:?}").as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Compile a user expression.
///
/// Compilation is deterministic: the same `(source, data_type)` always
/// produces the same program and hash. Unknown identifiers and calls
/// outside the allow list fail here, not at run time.
pub fn compile(
    source: &str,
    data_type: DataType,
) -> Result<CompiledExpression, ExpressionSyntaxError> {
    let tokens = lexer::tokenize(source).map_err(|err| err.into_syntax_error(source))?;
    let program = parser::parse(&tokens).map_err(|err| err.into_syntax_error(source))?;
    parser::validate(&program).map_err(|err| err.into_syntax_error(source))?;
    Ok(CompiledExpression {
        hash: content_hash(source, data_type),
        source: source.to_string(),
        program,
    })
}

/// The process-wide compiled-expression cache.
///
/// Content-addressed and append-only: an entry is never mutated after
/// insertion, so concurrent runs in one process may share it freely.
#[derive(Default)]
pub struct ExpressionCache {
    entries: Mutex<HashMap<String, Arc<CompiledExpression>>>,
}

impl ExpressionCache {
    /// The process-scoped cache instance.
    pub fn global() -> &'static ExpressionCache {
        static CACHE: OnceLock<ExpressionCache> = OnceLock::new();
        CACHE.get_or_init(ExpressionCache::default)
    }

    /// Fetch the compiled form of `(source, data_type)`, compiling on
    /// first use. Identical inputs always return the same instance.
    pub fn get_or_compile(
        &self,
        source: &str,
        data_type: DataType,
    ) -> Result<Arc<CompiledExpression>, ExpressionSyntaxError> {
        let hash = content_hash(source, data_type);
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&hash) {
            return Ok(Arc::clone(existing));
        }
        let compiled = Arc::new(compile(source, data_type)?);
        entries.insert(hash, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of cached expressions (diagnostics only).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_implicit_return() {
        let compiled = compile("x = 2\nx * 3", DataType::Scalar).unwrap();
        assert_eq!(compiled.program.statements.len(), 2);
        assert!(matches!(
            compiled.program.statements.last(),
            Some(Stmt::Return(_))
        ));
    }

    #[test]
    fn test_compile_explicit_return() {
        assert!(compile("return 42", DataType::Scalar).is_ok());
    }

    #[test]
    fn test_compile_reports_line_numbers() {
        let err = compile("x = 1\nx +\n2", DataType::Scalar).unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_compile_rejects_unknown_identifier() {
        let err = compile("flow * 2", DataType::Scalar).unwrap_err();
        assert!(err.message.contains("flow"));
    }

    #[test]
    fn test_compile_rejects_unknown_function() {
        let err = compile("eval(1)", DataType::Scalar).unwrap_err();
        assert!(err.message.contains("eval"));
    }

    #[test]
    fn test_compile_accepts_context_bindings() {
        assert!(compile("timestep + water_year", DataType::Timeseries).is_ok());
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let cache = ExpressionCache::default();
        let a = cache.get_or_compile("1 + 1", DataType::Scalar).unwrap();
        let b = cache.get_or_compile("1 + 1", DataType::Scalar).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // a different data type is a different cache entry
        let c = cache.get_or_compile("1 + 1", DataType::Timeseries).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(
            content_hash("x = 1\nx", DataType::Scalar),
            content_hash("x = 1\nx", DataType::Scalar)
        );
        assert_ne!(
            content_hash("x = 1\nx", DataType::Scalar),
            content_hash("x = 1\nx + 0", DataType::Scalar)
        );
    }
}
