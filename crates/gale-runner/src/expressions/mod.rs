// Expression evaluation for `${{ ... }}`: a pure evaluator over a frozen
// context snapshot. The status functions are injected values supplied fresh
// per step by the job runtime, not keywords.

mod functions;
pub mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use parser::{parse, BinOp, Expr};

/// An expression evaluation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<parser::ParseError> for EvalError {
    fn from(err: parser::ParseError) -> Self {
        EvalError::new(err.to_string())
    }
}

/// The injected status-function values for the current step.
#[derive(Debug, Clone, Copy)]
pub struct StatusFunctions {
    pub success: bool,
    pub failure: bool,
    pub cancelled: bool,
}

impl Default for StatusFunctions {
    fn default() -> Self {
        Self {
            success: true,
            failure: false,
            cancelled: false,
        }
    }
}

/// A frozen snapshot of the named contexts visible to expressions, plus the
/// injected status functions and the workspace root for `hashFiles`.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    contexts: HashMap<String, Value>,
    status: StatusFunctions,
    workspace: Option<PathBuf>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a named context (`github`, `env`, `matrix`, ...).
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.contexts.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(name)
    }

    pub fn set_status(&mut self, status: StatusFunctions) {
        self.status = status;
    }

    pub fn status(&self) -> StatusFunctions {
        self.status
    }

    pub fn set_workspace(&mut self, workspace: &Path) {
        self.workspace = Some(workspace.to_path_buf());
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Evaluate a bare expression (without the `${{ }}` wrapper).
pub fn evaluate(source: &str, ctx: &EvaluationContext) -> Result<Value, EvalError> {
    let ast = parse(source)?;
    eval_expr(&ast, ctx)
}

/// Replace each `${{ ... }}` occurrence in `text` with the stringified
/// result of its expression. Text without any marker passes through
/// untouched.
pub fn interpolate(text: &str, ctx: &EvaluationContext) -> Result<String, EvalError> {
    if !text.contains("${{") {
        return Ok(text.to_string());
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after
            .find("}}")
            .ok_or_else(|| EvalError::new("unterminated '${{' interpolation"))?;
        let value = evaluate(after[..end].trim(), ctx)?;
        result.push_str(&stringify(&value));
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Interpolate every value of a string map (step `with:` / `env:` blocks).
pub fn interpolate_map(
    map: &HashMap<String, String>,
    ctx: &EvaluationContext,
) -> Result<HashMap<String, String>, EvalError> {
    let mut out = HashMap::with_capacity(map.len());
    for (key, value) in map {
        out.insert(key.clone(), interpolate(value, ctx)?);
    }
    Ok(out)
}

/// Evaluate a step `if:` condition.
///
/// An empty condition is `success()`. A condition that does not reference a
/// status function anywhere is wrapped in an implicit `success() && (...)`:
/// once a previous step has failed, it evaluates false without being parsed
/// further.
pub fn evaluate_condition(condition: &str, ctx: &EvaluationContext) -> Result<bool, EvalError> {
    let trimmed = condition.trim();
    let inner = strip_expression_marker(trimmed);

    if inner.is_empty() {
        return Ok(ctx.status.success);
    }

    let ast = parse(inner)?;
    if !references_status_function(&ast) && !ctx.status.success {
        return Ok(false);
    }
    Ok(is_truthy(&eval_expr(&ast, ctx)?))
}

/// Strip a `${{ ... }}` wrapper that spans the whole condition string.
fn strip_expression_marker(condition: &str) -> &str {
    let trimmed = condition.trim();
    if let Some(inner) = trimmed.strip_prefix("${{") {
        if let Some(inner) = inner.strip_suffix("}}") {
            // Only treat it as a wrapper when no second marker follows.
            if !inner.contains("${{") {
                return inner.trim();
            }
        }
    }
    trimmed
}

/// GitHub truthiness: false, 0, '', and null are false; everything else is
/// true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Stringify a value the way interpolation does: null is empty, booleans are
/// lowercase, integral numbers print without a decimal point, arrays and
/// objects render as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    return format!("{}", f as i64);
                }
            }
            n.to_string()
        }
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval_expr(expr: &Expr, ctx: &EvaluationContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Context(name) => Ok(ctx.contexts.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Member(base, member) => {
            let value = eval_expr(base, ctx)?;
            Ok(lookup(&value, member))
        }
        Expr::Index(base, index) => {
            let value = eval_expr(base, ctx)?;
            let key = eval_expr(index, ctx)?;
            Ok(match (&value, &key) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (_, Value::String(name)) => lookup(&value, name),
                _ => Value::Null,
            })
        }
        Expr::Call(name, args) => eval_call(name, args, ctx),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval_expr(inner, ctx)?))),
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, ctx),
    }
}

/// Property lookup; undefined members yield null, never an error.
fn lookup(value: &Value, member: &str) -> Value {
    match value {
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(member))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvaluationContext) -> Result<Value, EvalError> {
    // Status functions are injected values, checked before the function
    // table.
    match name {
        "success" => return Ok(Value::Bool(ctx.status.success)),
        "failure" => return Ok(Value::Bool(ctx.status.failure)),
        "cancelled" => return Ok(Value::Bool(ctx.status.cancelled)),
        "always" => return Ok(Value::Bool(true)),
        _ => {}
    }

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_expr(arg, ctx)?);
    }
    functions::call(name, &values, ctx)
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    ctx: &EvaluationContext,
) -> Result<Value, EvalError> {
    match op {
        // && and || return operand values, enabling the
        // `cond && 'yes' || 'no'` idiom.
        BinOp::And => {
            let lhs = eval_expr(left, ctx)?;
            if is_truthy(&lhs) {
                eval_expr(right, ctx)
            } else {
                Ok(lhs)
            }
        }
        BinOp::Or => {
            let lhs = eval_expr(left, ctx)?;
            if is_truthy(&lhs) {
                Ok(lhs)
            } else {
                eval_expr(right, ctx)
            }
        }
        BinOp::Eq => Ok(Value::Bool(values_equal(
            &eval_expr(left, ctx)?,
            &eval_expr(right, ctx)?,
        ))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(
            &eval_expr(left, ctx)?,
            &eval_expr(right, ctx)?,
        ))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let lhs = to_number(&eval_expr(left, ctx)?);
            let rhs = to_number(&eval_expr(right, ctx)?);
            // NaN comparisons are false, like the hosted evaluator.
            let result = match op {
                BinOp::Lt => lhs < rhs,
                BinOp::Le => lhs <= rhs,
                BinOp::Gt => lhs > rhs,
                BinOp::Ge => lhs >= rhs,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

/// Equality: mixed-type comparisons are false; string comparison is
/// case-insensitive; numbers compare numerically.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// Numeric coercion for relational operators: null is 0, booleans are 0/1,
/// numeric strings parse, everything else is NaN.
fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(true) => 1.0,
        Value::Bool(false) => 0.0,
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

/// Whether the expression references any status function call, at any depth.
fn references_status_function(expr: &Expr) -> bool {
    match expr {
        Expr::Call(name, args) => {
            matches!(name.as_str(), "success" | "failure" | "cancelled" | "always")
                || args.iter().any(references_status_function)
        }
        Expr::Not(inner) => references_status_function(inner),
        Expr::Binary(_, left, right) => {
            references_status_function(left) || references_status_function(right)
        }
        Expr::Member(base, _) => references_status_function(base),
        Expr::Index(base, index) => {
            references_status_function(base) || references_status_function(index)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(entries: &[(&str, Value)]) -> EvaluationContext {
        let mut ctx = EvaluationContext::new();
        for (name, value) in entries {
            ctx.set(*name, value.clone());
        }
        ctx
    }

    #[test]
    fn test_context_lookup() {
        let ctx = ctx_with(&[("github", json!({"event_name": "push"}))]);
        assert_eq!(evaluate("github.event_name", &ctx).unwrap(), json!("push"));
    }

    #[test]
    fn test_undefined_lookup_is_null() {
        let ctx = ctx_with(&[("github", json!({}))]);
        assert_eq!(evaluate("github.missing.deeper", &ctx).unwrap(), Value::Null);
        assert_eq!(evaluate("nonexistent.path", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_index_operator() {
        let ctx = ctx_with(&[
            ("steps", json!({"my-step": {"outputs": {"k": "v"}}})),
            ("list", json!(["x", "y"])),
        ]);
        assert_eq!(
            evaluate("steps['my-step'].outputs.k", &ctx).unwrap(),
            json!("v")
        );
        assert_eq!(evaluate("list[1]", &ctx).unwrap(), json!("y"));
        assert_eq!(evaluate("list[9]", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_string_equality_case_insensitive() {
        let ctx = EvaluationContext::new();
        assert_eq!(evaluate("'ABC' == 'abc'", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("'abc' != 'abd'", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn test_mixed_type_equality_is_false() {
        let ctx = EvaluationContext::new();
        assert_eq!(evaluate("'1' == 1", &ctx).unwrap(), json!(false));
        assert_eq!(evaluate("true == 1", &ctx).unwrap(), json!(false));
        assert_eq!(evaluate("null == ''", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_numeric_comparison_coerces() {
        let ctx = EvaluationContext::new();
        assert_eq!(evaluate("'10' > 9", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("null < 1", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("true <= 1", &ctx).unwrap(), json!(true));
        // Non-numeric strings coerce to NaN; every comparison is false.
        assert_eq!(evaluate("'abc' < 1", &ctx).unwrap(), json!(false));
        assert_eq!(evaluate("'abc' >= 1", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_and_or_return_values() {
        let ctx = EvaluationContext::new();
        assert_eq!(evaluate("true && 'yes' || 'no'", &ctx).unwrap(), json!("yes"));
        assert_eq!(evaluate("false && 'yes' || 'no'", &ctx).unwrap(), json!("no"));
        assert_eq!(evaluate("'' || 'fallback'", &ctx).unwrap(), json!("fallback"));
    }

    #[test]
    fn test_not_operator() {
        let ctx = ctx_with(&[("env", json!({"FLAG": ""}))]);
        assert_eq!(evaluate("!env.FLAG", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("!true", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_status_functions_injected() {
        let mut ctx = EvaluationContext::new();
        ctx.set_status(StatusFunctions {
            success: false,
            failure: true,
            cancelled: false,
        });
        assert_eq!(evaluate("success()", &ctx).unwrap(), json!(false));
        assert_eq!(evaluate("failure()", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("cancelled()", &ctx).unwrap(), json!(false));
        assert_eq!(evaluate("always()", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn test_interpolate() {
        let ctx = ctx_with(&[("env", json!({"NAME": "world", "N": 2}))]);
        assert_eq!(
            interpolate("hello ${{ env.NAME }} x${{ env.N }}", &ctx).unwrap(),
            "hello world x2"
        );
        assert_eq!(interpolate("no markers", &ctx).unwrap(), "no markers");
        assert_eq!(interpolate("${{ null }}<-", &ctx).unwrap(), "<-");
        assert!(interpolate("${{ unterminated", &ctx).is_err());
    }

    #[test]
    fn test_stringify_formats() {
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(3.0)), "3");
        assert_eq!(stringify(&json!(3.5)), "3.5");
        assert_eq!(stringify(&json!("s")), "s");
        assert_eq!(stringify(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_condition_empty_is_success() {
        let mut ctx = EvaluationContext::new();
        assert!(evaluate_condition("", &ctx).unwrap());
        ctx.set_status(StatusFunctions {
            success: false,
            failure: true,
            cancelled: false,
        });
        assert!(!evaluate_condition("", &ctx).unwrap());
    }

    #[test]
    fn test_condition_implicit_success_guard() {
        let mut ctx = ctx_with(&[("env", json!({"RUN": "true"}))]);
        ctx.set_status(StatusFunctions {
            success: false,
            failure: true,
            cancelled: false,
        });
        // No status function referenced -> implicit success() gate.
        assert!(!evaluate_condition("env.RUN == 'true'", &ctx).unwrap());
        // always() disables the gate.
        assert!(evaluate_condition("always()", &ctx).unwrap());
        assert!(evaluate_condition("failure()", &ctx).unwrap());
        assert!(evaluate_condition("always() && env.RUN == 'true'", &ctx).unwrap());
    }

    #[test]
    fn test_condition_with_wrapper() {
        let ctx = ctx_with(&[("github", json!({"event_name": "push"}))]);
        assert!(evaluate_condition("${{ github.event_name == 'push' }}", &ctx).unwrap());
        assert!(!evaluate_condition("${{ github.event_name == 'pull_request' }}", &ctx).unwrap());
    }

    #[test]
    fn test_if_expression_scenario() {
        // github.event_name == 'push' && contains(fromJSON('["a","b"]'), 'a')
        let expr = r#"github.event_name == 'push' && contains(fromJSON('["a","b"]'), 'a')"#;
        let push = ctx_with(&[("github", json!({"event_name": "push"}))]);
        assert!(evaluate_condition(expr, &push).unwrap());

        let pr = ctx_with(&[("github", json!({"event_name": "pull_request"}))]);
        assert!(!evaluate_condition(expr, &pr).unwrap());
    }

    #[test]
    fn test_condition_parse_error_surfaces() {
        let ctx = EvaluationContext::new();
        assert!(evaluate_condition("a &&", &ctx).is_err());
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let ctx = ctx_with(&[("env", json!({"Path": "/usr/bin"}))]);
        assert_eq!(evaluate("env.PATH", &ctx).unwrap(), json!("/usr/bin"));
    }
}
