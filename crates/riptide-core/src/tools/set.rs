//! Array fill tool
//!
//! Sets every element of an array variable to an evaluated scalar value
//! through the `fill` kernel. Used standalone for initializations and by
//! the multi-process sync to reset the ownership mask.

use crate::error::{Error, Result};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::tools::ShadowArgs;
use crate::variables::Variable;
use riptide_backends::{ArgValue, Event, Kernel, NdRange};
use std::sync::Arc;

const SET_SRC: &str = r#"
__kernel void fill(__global T* dst, T value, unsigned int n)
{
    const unsigned int i = get_global_id(0);
    if (i >= n) return;
    dst[i] = value;
}
"#;

/// Fill an array variable with an evaluated value
pub struct Set {
    meta: ToolMeta,
    var_name: String,
    value_expr: String,
    variable: Option<Arc<Variable>>,
    kernel: Option<Kernel>,
    shadow: ShadowArgs,
}

impl Set {
    /// Fill `var_name` with the value of `value_expr` each iteration
    pub fn new(name: &str, var_name: &str, value_expr: &str, once: bool) -> Self {
        Self {
            meta: ToolMeta::new(name, once),
            var_name: var_name.to_string(),
            value_expr: value_expr.to_string(),
            variable: None,
            kernel: None,
            shadow: ShadowArgs::new(3),
        }
    }
}

impl Tool for Set {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();
        let variable = vars.require(&self.var_name)?;
        if !variable.is_array() {
            return Err(Error::bad_var_type(&self.var_name, "array", variable.var_type()));
        }

        let options = server
            .context()
            .build_options()
            .define("T", variable.var_type().element().designator());
        let kernel = server.context().compile_kernel(SET_SRC, "fill", options)?;

        let inputs = vars.dependencies_of(&self.value_expr);
        self.meta.set_dependencies(inputs, vec![variable.clone()]);
        self.variable = Some(variable);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let vars = server.variables();
        let variable = self.variable.as_ref().ok_or_else(|| Error::InvalidVariable(self.var_name.clone()))?;
        let kernel = self.kernel.as_mut().ok_or_else(|| Error::InvalidVariable(self.var_name.clone()))?;

        let value = vars.evaluate_as(&self.value_expr, variable.var_type().element())?;
        let n = variable.len()?;

        self.shadow.bind_var(kernel, 0, variable)?;
        self.shadow.bind(kernel, 1, ArgValue::Bytes(value.to_bytes()))?;
        self.shadow.bind(kernel, 2, ArgValue::scalar(n as u32))?;

        let local = kernel.max_work_group_size();
        let range = NdRange::new(n.max(1), local)?;
        let event = server.context().queue().enqueue_kernel(kernel, range, wait)?;
        Ok(Some(event))
    }
}
