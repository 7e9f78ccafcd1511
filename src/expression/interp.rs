//! The expression interpreter.
//!
//! Programs are evaluated against an [`EvalContext`] that supplies the
//! per-step bindings and the `get`/`read_csv` capabilities; the
//! interpreter itself has no access to anything else.
use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::errors::EvalError;
use crate::value::CellValue;
use float_cmp::approx_eq;
use std::collections::HashMap;

/// A `get(...)` call site, decoded from its arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetRequest {
    /// The `resource_type/resource_id/attr_id` key string.
    pub key: String,
    /// Time-step offset relative to the current step.
    pub offset: Option<i64>,
    /// Window start date (inclusive) for aggregation.
    pub start: Option<String>,
    /// Window end date (inclusive) for aggregation.
    pub end: Option<String>,
    /// Aggregation method name (`mean` or `sum`).
    pub agg: Option<String>,
    /// Whether to sum blocks into one column (defaults to true).
    pub flatten: Option<bool>,
    /// Value to yield when the target has no data.
    pub default: Option<f64>,
}

/// A `read_csv(...)` call site.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CsvRequest {
    /// Path relative to the run's files directory.
    pub path: String,
    /// Column to read (name, or 1-based index as text); defaults to the
    /// first value column.
    pub column: Option<String>,
}

/// The capability surface an expression runs against.
///
/// Implementations must record, per invocation, whether any temporal
/// binding or context call was touched; the evaluator uses that to
/// detect provably constant expressions.
pub trait EvalContext {
    /// Resolve a context binding by name.
    fn binding(&mut self, name: &str, line: usize) -> Result<CellValue, EvalError>;
    /// Cross-reference another resource attribute.
    fn get(&mut self, request: &GetRequest, line: usize) -> Result<CellValue, EvalError>;
    /// Read a value from an external CSV file.
    fn read_csv(&mut self, request: &CsvRequest, line: usize) -> Result<CellValue, EvalError>;
}

/// Run a program to completion.
pub fn evaluate(program: &Program, ctx: &mut dyn EvalContext) -> Result<CellValue, EvalError> {
    let mut env: HashMap<String, CellValue> = HashMap::new();
    for stmt in &program.statements {
        match stmt {
            Stmt::Assign(name, expr, _) => {
                let value = eval_expr(expr, &env, ctx)?;
                env.insert(name.clone(), value);
            }
            Stmt::Return(expr) => return eval_expr(expr, &env, ctx),
        }
    }
    // parse() guarantees the final statement is a Return
    unreachable!("program without a result statement");
}

fn eval_expr(
    expr: &Expr,
    env: &HashMap<String, CellValue>,
    ctx: &mut dyn EvalContext,
) -> Result<CellValue, EvalError> {
    match expr {
        Expr::Number(n, _) => Ok(CellValue::Number(*n)),
        Expr::Str(s, _) => Ok(CellValue::Text(s.clone())),
        Expr::Ident(name, line) => match env.get(name) {
            Some(value) => Ok(value.clone()),
            None => ctx.binding(name, *line),
        },
        Expr::Unary(op, operand, line) => {
            let value = eval_expr(operand, env, ctx)?;
            match op {
                UnaryOp::Neg => Ok(CellValue::Number(-as_number(&value, *line, "-")?)),
                UnaryOp::Not => Ok(bool_value(!is_truthy(&value))),
            }
        }
        Expr::Binary(op, lhs, rhs, line) => {
            // short-circuit the boolean operators
            match op {
                BinaryOp::And => {
                    let l = eval_expr(lhs, env, ctx)?;
                    if !is_truthy(&l) {
                        return Ok(bool_value(false));
                    }
                    let r = eval_expr(rhs, env, ctx)?;
                    return Ok(bool_value(is_truthy(&r)));
                }
                BinaryOp::Or => {
                    let l = eval_expr(lhs, env, ctx)?;
                    if is_truthy(&l) {
                        return Ok(bool_value(true));
                    }
                    let r = eval_expr(rhs, env, ctx)?;
                    return Ok(bool_value(is_truthy(&r)));
                }
                _ => {}
            }
            let l = eval_expr(lhs, env, ctx)?;
            let r = eval_expr(rhs, env, ctx)?;
            eval_binary(*op, &l, &r, *line)
        }
        Expr::If {
            cond,
            then,
            otherwise,
            ..
        } => {
            let cond = eval_expr(cond, env, ctx)?;
            if is_truthy(&cond) {
                eval_expr(then, env, ctx)
            } else {
                eval_expr(otherwise, env, ctx)
            }
        }
        Expr::Call {
            name,
            args,
            kwargs,
            line,
        } => eval_call(name, args, kwargs, *line, env, ctx),
    }
}

fn eval_binary(op: BinaryOp, l: &CellValue, r: &CellValue, line: usize) -> Result<CellValue, EvalError> {
    // string comparisons work lexically, which is exactly right for the
    // ISO date strings bound to `date`/`start_date`/`end_date`
    if let (CellValue::Text(a), CellValue::Text(b)) = (l, r) {
        let result = match op {
            BinaryOp::Eq => a == b,
            BinaryOp::Neq => a != b,
            BinaryOp::Lt => a < b,
            BinaryOp::Lte => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Gte => a >= b,
            _ => {
                return Err(type_error(line, format!("cannot apply {op:?} to strings")));
            }
        };
        return Ok(bool_value(result));
    }

    let a = as_number(l, line, &format!("{op:?}"))?;
    let b = as_number(r, line, &format!("{op:?}"))?;
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::Runtime {
                    kind: "ZeroDivisionError".to_string(),
                    line,
                    detail: "division by zero".to_string(),
                });
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::Runtime {
                    kind: "ZeroDivisionError".to_string(),
                    line,
                    detail: "modulo by zero".to_string(),
                });
            }
            a.rem_euclid(b)
        }
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Eq => return Ok(bool_value(approx_eq!(f64, a, b))),
        BinaryOp::Neq => return Ok(bool_value(!approx_eq!(f64, a, b))),
        BinaryOp::Lt => return Ok(bool_value(a < b)),
        BinaryOp::Lte => return Ok(bool_value(a <= b)),
        BinaryOp::Gt => return Ok(bool_value(a > b)),
        BinaryOp::Gte => return Ok(bool_value(a >= b)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled before operand evaluation"),
    };
    Ok(CellValue::Number(value))
}

fn eval_call(
    name: &str,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    line: usize,
    env: &HashMap<String, CellValue>,
    ctx: &mut dyn EvalContext,
) -> Result<CellValue, EvalError> {
    match name {
        "get" | "GET" => {
            let key = eval_expr(&args[0], env, ctx)?;
            let CellValue::Text(key) = key else {
                return Err(type_error(line, "get() key must be a string".to_string()));
            };
            let mut request = GetRequest {
                key,
                ..GetRequest::default()
            };
            for (kwarg, expr) in kwargs {
                let value = eval_expr(expr, env, ctx)?;
                match kwarg.as_str() {
                    "offset" => {
                        request.offset =
                            Some(as_number(&value, line, "offset")?.round() as i64);
                    }
                    "start" => request.start = Some(as_text(&value, line, "start")?),
                    "end" => request.end = Some(as_text(&value, line, "end")?),
                    "agg" => request.agg = Some(as_text(&value, line, "agg")?),
                    "flatten" => request.flatten = Some(is_truthy(&value)),
                    "default" => request.default = Some(as_number(&value, line, "default")?),
                    _ => unreachable!("kwargs validated at compile time"),
                }
            }
            ctx.get(&request, line)
        }
        "read_csv" => {
            let path = eval_expr(&args[0], env, ctx)?;
            let CellValue::Text(path) = path else {
                return Err(type_error(line, "read_csv() path must be a string".to_string()));
            };
            let mut request = CsvRequest {
                path,
                column: None,
            };
            for (kwarg, expr) in kwargs {
                let value = eval_expr(expr, env, ctx)?;
                if kwarg == "column" {
                    request.column = Some(match value {
                        CellValue::Text(t) => t,
                        CellValue::Number(n) => n.to_string(),
                        CellValue::List(_) => {
                            return Err(type_error(line, "column must be a name or index".to_string()));
                        }
                    });
                }
            }
            ctx.read_csv(&request, line)
        }
        _ => eval_builtin(name, args, line, env, ctx),
    }
}

fn eval_builtin(
    name: &str,
    args: &[Expr],
    line: usize,
    env: &HashMap<String, CellValue>,
    ctx: &mut dyn EvalContext,
) -> Result<CellValue, EvalError> {
    let values: Vec<CellValue> = args
        .iter()
        .map(|a| eval_expr(a, env, ctx))
        .collect::<Result<_, _>>()?;

    // aggregate builtins accept either one list or several numbers
    if let "min" | "max" | "sum" | "mean" = name {
        let numbers: Vec<f64> = match values.as_slice() {
            [CellValue::List(list)] => list.clone(),
            _ => values
                .iter()
                .map(|v| as_number(v, line, name))
                .collect::<Result<_, _>>()?,
        };
        if numbers.is_empty() {
            return Err(type_error(line, format!("{name}() of an empty sequence")));
        }
        let result = match name {
            "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
            "max" => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "sum" => numbers.iter().sum(),
            "mean" => numbers.iter().sum::<f64>() / numbers.len() as f64,
            _ => unreachable!(),
        };
        return Ok(CellValue::Number(result));
    }

    if values.len() != 1 {
        return Err(type_error(line, format!("{name}() takes exactly one argument")));
    }
    let x = as_number(&values[0], line, name)?;
    let result = match name {
        "abs" => x.abs(),
        "sqrt" => x.sqrt(),
        "ln" => x.ln(),
        "log10" => x.log10(),
        "exp" => x.exp(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "isnan" => return Ok(bool_value(x.is_nan())),
        _ => unreachable!("functions validated at compile time"),
    };
    Ok(CellValue::Number(result))
}

/// Non-zero numbers, non-empty strings and non-empty lists are truthy.
fn is_truthy(value: &CellValue) -> bool {
    match value {
        CellValue::Number(n) => *n != 0.0,
        CellValue::Text(t) => !t.is_empty(),
        CellValue::List(l) => !l.is_empty(),
    }
}

fn bool_value(b: bool) -> CellValue {
    CellValue::Number(if b { 1.0 } else { 0.0 })
}

fn as_number(value: &CellValue, line: usize, what: &str) -> Result<f64, EvalError> {
    match value {
        CellValue::Number(n) => Ok(*n),
        other => Err(type_error(
            line,
            format!("{what} expects a number, got {other:?}"),
        )),
    }
}

fn as_text(value: &CellValue, line: usize, what: &str) -> Result<String, EvalError> {
    match value {
        CellValue::Text(t) => Ok(t.clone()),
        other => Err(type_error(
            line,
            format!("{what} expects a string, got {other:?}"),
        )),
    }
}

fn type_error(line: usize, detail: String) -> EvalError {
    EvalError::Runtime {
        kind: "TypeError".to_string(),
        line,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::compile;
    use crate::network::DataType;
    use float_cmp::assert_approx_eq;

    /// A canned context for interpreter tests.
    #[derive(Default)]
    struct StubContext {
        timestep: f64,
        get_result: Option<CellValue>,
        last_get: Option<GetRequest>,
    }

    impl EvalContext for StubContext {
        fn binding(&mut self, name: &str, line: usize) -> Result<CellValue, EvalError> {
            match name {
                "timestep" => Ok(CellValue::Number(self.timestep)),
                "date" => Ok(CellValue::Text("2020-06-15 00:00:00".to_string())),
                "water_year" => Ok(CellValue::Number(2021.0)),
                _ => Err(EvalError::Runtime {
                    kind: "NameError".to_string(),
                    line,
                    detail: format!("no binding '{name}'"),
                }),
            }
        }

        fn get(&mut self, request: &GetRequest, _line: usize) -> Result<CellValue, EvalError> {
            self.last_get = Some(request.clone());
            Ok(self.get_result.clone().unwrap_or(CellValue::Number(0.0)))
        }

        fn read_csv(&mut self, _request: &CsvRequest, _line: usize) -> Result<CellValue, EvalError> {
            Ok(CellValue::Number(9.0))
        }
    }

    fn run(source: &str, ctx: &mut StubContext) -> Result<CellValue, EvalError> {
        let compiled = compile(source, DataType::Scalar).unwrap();
        evaluate(&compiled.program, ctx)
    }

    #[test]
    fn test_arithmetic() {
        let mut ctx = StubContext::default();
        let result = run("x = 2 + 3 * 4\nx ^ 2 - 1", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 195.0);
    }

    #[test]
    fn test_if_then_else_and_comparisons() {
        let mut ctx = StubContext {
            timestep: 7.0,
            ..StubContext::default()
        };
        let result = run("if timestep > 5 then 10 else 20", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 10.0);
    }

    #[test]
    fn test_date_string_comparison() {
        let mut ctx = StubContext::default();
        let result = run("if date >= '2020-06-01' then 1 else 0", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 1.0);
    }

    #[test]
    fn test_division_by_zero_reports_line() {
        let mut ctx = StubContext::default();
        let err = run("x = 1\nx / 0", &mut ctx).unwrap_err();
        assert_eq!(
            err,
            EvalError::Runtime {
                kind: "ZeroDivisionError".to_string(),
                line: 2,
                detail: "division by zero".to_string(),
            }
        );
    }

    #[test]
    fn test_builtins() {
        let mut ctx = StubContext::default();
        let result = run("min(3, 1, 2) + max(4, 5) + mean(2, 4)", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 9.0);

        let result = run("isnan(sqrt(-1))", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 1.0);
    }

    #[test]
    fn test_get_request_decoding() {
        let mut ctx = StubContext {
            get_result: Some(CellValue::Number(42.0)),
            ..StubContext::default()
        };
        let result = run(
            "get('node/1/2', offset=-1, agg='sum', flatten=0, default=3)",
            &mut ctx,
        )
        .unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 42.0);
        let request = ctx.last_get.unwrap();
        assert_eq!(request.key, "node/1/2");
        assert_eq!(request.offset, Some(-1));
        assert_eq!(request.agg.as_deref(), Some("sum"));
        assert_eq!(request.flatten, Some(false));
        assert_eq!(request.default, Some(3.0));
    }

    #[test]
    fn test_short_circuit_avoids_rhs() {
        // the right-hand side would divide by zero if evaluated
        let mut ctx = StubContext::default();
        let result = run("0 and 1 / 0", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 0.0);
    }

    #[test]
    fn test_sum_of_list() {
        let mut ctx = StubContext {
            get_result: Some(CellValue::List(vec![1.0, 2.0, 3.0])),
            ..StubContext::default()
        };
        let result = run("sum(get('node/1/2'))", &mut ctx).unwrap();
        assert_approx_eq!(f64, result.as_number().unwrap(), 6.0);
    }
}
