//! Expression evaluation over registered scalars
//!
//! The evaluator itself is an external collaborator (the `evalexpr`
//! crate); this module owns the value context the registry keeps in sync
//! through `populate`. Evaluation snapshots the context at call time,
//! which is why completion callbacks must re-populate scalars they
//! produce.

use crate::error::{Error, Result};
use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};

/// Cached numeric context for the registry's evaluator
pub(crate) struct ExprContext {
    context: HashMapContext,
}

impl ExprContext {
    pub(crate) fn new() -> Self {
        Self {
            context: HashMapContext::new(),
        }
    }

    /// Install or refresh a named value
    pub(crate) fn set(&mut self, name: &str, value: f64) -> Result<()> {
        self.context
            .set_value(name.to_string(), Value::Float(value))
            .map_err(|err| Error::bad_expression(name, err))
    }

    /// Evaluate a numeric (or boolean) expression
    pub(crate) fn eval(&self, expr: &str) -> Result<f64> {
        let value =
            evalexpr::eval_with_context(expr, &self.context).map_err(|err| Error::bad_expression(expr, err))?;
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::Boolean(v) => Ok(if v { 1.0 } else { 0.0 }),
            other => Err(Error::bad_expression(expr, format!("non-numeric result {other:?}"))),
        }
    }
}

/// Identifiers appearing in an expression, in order of first occurrence
pub(crate) fn identifiers(expr: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = String::new();
    for c in expr.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c);
        } else if !current.is_empty() {
            let ident = std::mem::take(&mut current);
            if !ident.starts_with(|c: char| c.is_ascii_digit()) && !found.contains(&ident) {
                found.push(ident);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_arithmetic() {
        let mut ctx = ExprContext::new();
        ctx.set("h", 0.1).unwrap();
        ctx.set("support", 2.0).unwrap();
        let v = ctx.eval("support * h").unwrap();
        assert!((v - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_eval_boolean_coerces() {
        let mut ctx = ExprContext::new();
        ctx.set("N", 10.0).unwrap();
        ctx.set("h", 0.1).unwrap();
        assert_eq!(ctx.eval("(N > 0) && (h > 0)").unwrap(), 1.0);
        ctx.set("h", 0.0).unwrap();
        assert_eq!(ctx.eval("(N > 0) && (h > 0)").unwrap(), 0.0);
    }

    #[test]
    fn test_eval_unknown_variable_is_bad_expression() {
        let ctx = ExprContext::new();
        assert!(matches!(ctx.eval("missing + 1"), Err(Error::BadExpression { .. })));
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(
            identifiers("(N > 0) && (dt_min * 2 < dt)"),
            vec!["N".to_string(), "dt_min".to_string(), "dt".to_string()]
        );
        assert_eq!(identifiers("3.5e2 + 7"), Vec::<String>::new());
    }
}
