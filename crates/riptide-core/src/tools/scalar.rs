//! Scalar expression tools: expression, set-scalar, and assert
//!
//! The expression is evaluated inside a completion callback gated on the
//! input scalars' writing events, so host arithmetic never blocks the
//! command queue. The tool's out-event is a marker chained on a user
//! event the callback completes.

use crate::error::{Error, Result};
use crate::scalar::{ScalarValue, VarType};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::variables::Variable;
use parking_lot::Mutex;
use riptide_backends::{Event, EventStatus, STATUS_EXEC_ERROR};
use std::sync::Arc;

enum Mode {
    /// Evaluate and keep the result in the tool's output slot
    Expression,
    /// Evaluate and populate a named scalar variable
    SetScalar { target: String },
    /// Evaluate; a zero result is fatal
    Assert,
}

/// Tool evaluating a text expression over registered scalars
///
/// Three flavours share the machinery: plain expressions, `SetScalar`
/// (stores into a variable and re-populates the evaluator), and
/// `Assert` (zero result aborts the pipeline).
pub struct ScalarExpression {
    meta: ToolMeta,
    expr: String,
    output_type: VarType,
    output_type_str: String,
    value: Arc<Mutex<ScalarValue>>,
    mode: Mode,
    target: Option<Arc<Variable>>,
}

impl ScalarExpression {
    /// Plain expression tool with a typed output slot
    pub fn expression(name: &str, expr: &str, output_type: &str, once: bool) -> Self {
        Self {
            meta: ToolMeta::new(name, once),
            expr: expr.to_string(),
            output_type: VarType {
                kind: crate::scalar::ElemKind::Float,
                components: 1,
                is_array: false,
            },
            output_type_str: output_type.to_string(),
            value: Arc::new(Mutex::new(ScalarValue::Float(0.0))),
            mode: Mode::Expression,
            target: None,
        }
    }

    /// Set a named scalar variable to the evaluated expression
    pub fn set_scalar(name: &str, variable: &str, expr: &str, once: bool) -> Self {
        let mut tool = Self::expression(name, expr, "float", once);
        tool.mode = Mode::SetScalar {
            target: variable.to_string(),
        };
        tool
    }

    /// Abort the pipeline when the condition evaluates to zero
    pub fn assert(name: &str, condition: &str, once: bool) -> Self {
        let mut tool = Self::expression(name, condition, "float", once);
        tool.mode = Mode::Assert;
        tool
    }

    /// The evaluated expression text
    pub fn expression_text(&self) -> &str {
        &self.expr
    }

    /// Last evaluated value
    pub fn result(&self) -> ScalarValue {
        *self.value.lock()
    }
}

impl Tool for ScalarExpression {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();

        let mut outputs = Vec::new();
        if let Mode::SetScalar { target } = &self.mode {
            let variable = vars.require(target)?;
            if variable.is_array() {
                return Err(Error::bad_var_type(target, "scalar", variable.var_type()));
            }
            self.output_type = variable.var_type();
            outputs.push(variable.clone());
            self.target = Some(variable);
        } else {
            self.output_type = VarType::parse(&self.output_type_str, vars.dims())?;
        }
        *self.value.lock() = ScalarValue::zero(self.output_type);

        let inputs = vars.dependencies_of(&self.expr);
        self.meta.set_dependencies(inputs, outputs);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let queue = server.context().queue();
        let trigger = queue.marker(wait)?;
        let user_event = Event::user();

        let server = server.clone();
        let vars = server.variables().clone();
        let expr = self.expr.clone();
        let output_type = self.output_type;
        let value_slot = self.value.clone();
        let target = self.target.clone();
        let assert = matches!(self.mode, Mode::Assert);
        let tool_name = self.meta.name().to_string();
        let done = user_event.clone();

        trigger.on_complete(move |status| {
            if let EventStatus::Error(code) = status {
                tracing::warn!(tool = %tool_name, code, "skipping expression evaluation, dependency failed");
                done.fail(code);
                return;
            }
            let solve = || -> Result<()> {
                let value = vars.evaluate_as(&expr, output_type)?;
                *value_slot.lock() = value;
                if let Some(variable) = &target {
                    variable.set_scalar(value)?;
                    vars.populate(variable)?;
                }
                if assert && value.component(0) == 0.0 {
                    return Err(Error::AssertionFailed {
                        tool: tool_name.clone(),
                        expr: expr.clone(),
                    });
                }
                Ok(())
            };
            match solve() {
                Ok(()) => done.complete(),
                Err(err) => {
                    server.latch_fatal(err);
                    done.fail(STATUS_EXEC_ERROR);
                }
            }
        });

        Ok(Some(queue.marker(&[user_event])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Settings;
    use crate::tool;

    fn server() -> Arc<CalcServer> {
        let (server, _device) = CalcServer::new(&Settings::default());
        server
    }

    #[test]
    fn test_expression_evaluates_in_callback() {
        let server = server();
        server.variables().register("h", "float", "", "0.5").unwrap();

        let mut tool = ScalarExpression::expression("edge", "h * 4", "float", false);
        tool.setup(&server).unwrap();
        assert_eq!(tool.meta().inputs().len(), 1);

        tool::execute(&mut tool, &server).unwrap();
        server.finish().unwrap();
        assert_eq!(tool.result(), ScalarValue::Float(2.0));
    }

    #[test]
    fn test_set_scalar_populates_variable() {
        let server = server();
        let vars = server.variables();
        vars.register("N", "unsigned int", "", "8").unwrap();
        vars.register("n_radix", "unsigned int", "", "0").unwrap();

        let mut tool = ScalarExpression::set_scalar("pad", "n_radix", "N * 2", false);
        tool.setup(&server).unwrap();
        tool::execute(&mut tool, &server).unwrap();
        server.finish().unwrap();

        let n_radix = vars.require("n_radix").unwrap();
        assert_eq!(n_radix.scalar().unwrap(), ScalarValue::Uint(16));
        // The evaluator sees the populated value.
        assert_eq!(vars.evaluate("n_radix + 1").unwrap(), 17.0);
        // The out-event was published on the output variable.
        assert!(n_radix.writing_event().is_some());
    }

    #[test]
    fn test_assert_latches_on_zero() {
        let server = server();
        let vars = server.variables();
        vars.register("N", "unsigned int", "", "10").unwrap();
        vars.register("h", "float", "", "0").unwrap();

        let mut tool = ScalarExpression::assert("sanity", "(N > 0) && (h > 0)", false);
        tool.setup(&server).unwrap();
        tool::execute(&mut tool, &server).unwrap();
        assert!(matches!(server.finish(), Err(Error::AssertionFailed { .. })));
    }

    #[test]
    fn test_assert_passes_on_nonzero() {
        let server = server();
        let vars = server.variables();
        vars.register("N", "unsigned int", "", "10").unwrap();
        vars.register("h", "float", "", "0.1").unwrap();

        let mut tool = ScalarExpression::assert("sanity", "(N > 0) && (h > 0)", false);
        tool.setup(&server).unwrap();
        tool::execute(&mut tool, &server).unwrap();
        server.finish().unwrap();
        assert_eq!(tool.result(), ScalarValue::Float(1.0));
    }
}
