//! Permutation gather tool
//!
//! Materializes a data array in permuted order (`output[i] =
//! input[perm[i]]`) without mutating the source. Used by the
//! multi-process sync to build mask-sorted field copies.

use crate::error::{Error, Result};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::tools::ShadowArgs;
use crate::variables::Variable;
use riptide_backends::{ArgValue, Event, Kernel, NdRange};
use std::sync::Arc;

const UNSORT_SRC: &str = r#"
__kernel void unsort(__global const T* input,
                     __global T* output,
                     __global const unsigned int* perm,
                     unsigned int n)
{
    const unsigned int i = get_global_id(0);
    if (i >= n) return;
    output[i] = input[perm[i]];
}
"#;

/// Emit a data array in permuted order into a distinct output array
pub struct UnSort {
    meta: ToolMeta,
    input_name: String,
    perm_name: String,
    output_name: String,
    input: Option<Arc<Variable>>,
    perm: Option<Arc<Variable>>,
    output: Option<Arc<Variable>>,
    kernel: Option<Kernel>,
    shadow: ShadowArgs,
}

impl UnSort {
    /// Gather `input_name` through `perm_name` into `output_name`
    pub fn new(name: &str, input_name: &str, perm_name: &str, output_name: &str) -> Self {
        Self {
            meta: ToolMeta::new(name, false),
            input_name: input_name.to_string(),
            perm_name: perm_name.to_string(),
            output_name: output_name.to_string(),
            input: None,
            perm: None,
            output: None,
            kernel: None,
            shadow: ShadowArgs::new(4),
        }
    }
}

impl Tool for UnSort {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();

        let input = vars.require(&self.input_name)?;
        if !input.is_array() {
            return Err(Error::bad_var_type(&self.input_name, "array", input.var_type()));
        }
        let perm = vars.require(&self.perm_name)?;
        let output = vars.require(&self.output_name)?;
        if output.var_type() != input.var_type() {
            return Err(Error::bad_var_type(
                &self.output_name,
                input.var_type().designator(),
                output.var_type(),
            ));
        }
        for variable in [&perm, &output] {
            if variable.len()? != input.len()? {
                return Err(Error::InvalidVariableLength {
                    name: variable.name().to_string(),
                    expected: input.len()?,
                    found: variable.len()?,
                });
            }
        }

        let options = server
            .context()
            .build_options()
            .define("T", input.var_type().element().designator());
        let kernel = server.context().compile_kernel(UNSORT_SRC, "unsort", options)?;

        self.meta
            .set_dependencies(vec![input.clone(), perm.clone()], vec![output.clone()]);
        self.input = Some(input);
        self.perm = Some(perm);
        self.output = Some(output);
        self.kernel = Some(kernel);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let kernel = self.kernel.as_mut().ok_or_else(|| Error::InvalidVariable(self.input_name.clone()))?;
        let input = self.input.as_ref().ok_or_else(|| Error::InvalidVariable(self.input_name.clone()))?;
        let perm = self.perm.as_ref().ok_or_else(|| Error::InvalidVariable(self.perm_name.clone()))?;
        let output = self.output.as_ref().ok_or_else(|| Error::InvalidVariable(self.output_name.clone()))?;

        let n = input.len()?;
        self.shadow.bind_var(kernel, 0, input)?;
        self.shadow.bind_var(kernel, 1, output)?;
        self.shadow.bind_var(kernel, 2, perm)?;
        self.shadow.bind(kernel, 3, ArgValue::scalar(n as u32))?;

        let range = NdRange::new(n.max(1), kernel.max_work_group_size())?;
        let event = server.context().queue().enqueue_kernel(kernel, range, wait)?;
        Ok(Some(event))
    }
}
