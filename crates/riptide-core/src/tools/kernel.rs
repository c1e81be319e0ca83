//! Generic kernel launcher tool
//!
//! Wraps one entry point of a kernel source payload. The variables the
//! kernel uses are detected automatically from the routine's parameter
//! names and resolved against the registry; arguments are bound through
//! a per-slot shadow cache so only changed values are re-set.

use crate::error::{Error, Result};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::tools::ShadowArgs;
use crate::variables::Variable;
use riptide_backends::{Event, Kernel, NdRange};
use std::sync::Arc;

/// Tool launching a single kernel over an expression-sized range
pub struct KernelTool {
    meta: ToolMeta,
    source: String,
    entry: String,
    n_expr: String,
    kernel: Option<Kernel>,
    shadow: ShadowArgs,
    variables: Vec<Arc<Variable>>,
}

impl KernelTool {
    /// Launch `entry` from `source` over `n_expr` work items (`"N"` by
    /// default) each iteration
    pub fn new(name: &str, source: &str, entry: &str, n_expr: Option<&str>, once: bool) -> Self {
        Self {
            meta: ToolMeta::new(name, once),
            source: source.to_string(),
            entry: entry.to_string(),
            n_expr: n_expr.unwrap_or("N").to_string(),
            kernel: None,
            shadow: ShadowArgs::new(0),
            variables: Vec::new(),
        }
    }

    /// The kernel entry point
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl Tool for KernelTool {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();
        let kernel = server
            .context()
            .compile_kernel(&self.source, &self.entry, server.context().build_options())?;

        // The routine's parameter names are the kernel's variable list.
        let mut variables = Vec::with_capacity(kernel.params().len());
        for param in kernel.params() {
            variables.push(vars.require(param)?);
        }
        self.shadow = ShadowArgs::new(variables.len());

        // Without argument direction information every variable is a
        // potential output; the out-event is published on all of them.
        self.meta.set_dependencies(Vec::new(), variables.clone());
        self.variables = variables;
        self.kernel = Some(kernel);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let kernel = self.kernel.as_mut().ok_or_else(|| Error::InvalidVariable(self.entry.clone()))?;
        for (index, variable) in self.variables.iter().enumerate() {
            self.shadow.bind_var(kernel, index, variable)?;
        }

        let n = server.variables().evaluate(&self.n_expr)? as usize;
        let range = NdRange::new(n.max(1), kernel.max_work_group_size())?;
        let event = server.context().queue().enqueue_kernel(kernel, range, wait)?;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Settings;
    use crate::tool;
    use riptide_backends::Device;

    #[test]
    fn test_kernel_tool_detects_variables_and_launches() {
        let (server, device) = CalcServer::new(&Settings::default());
        device.register_routine("scale", &["values", "factor", "N"], |mem, call| {
            let buffer = call.buffer(0)?;
            let factor = call.pod::<f32>(1)?;
            let n = call.pod::<u32>(2)? as usize;
            let bytes = mem.bytes_mut(buffer)?;
            for i in 0..n {
                let o = i * 4;
                let v = f32::from_ne_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
                bytes[o..o + 4].copy_from_slice(&(v * factor).to_ne_bytes());
            }
            Ok(())
        });

        let vars = server.variables();
        vars.register("N", "unsigned int", "", "3").unwrap();
        vars.register("factor", "float", "", "2").unwrap();
        vars.register("values", "float*", "N", "").unwrap();

        let values = vars.require("values").unwrap();
        let data: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        device.write_buffer(values.buffer().unwrap(), 0, &data).unwrap();

        let mut tool = KernelTool::new("scale values", "payload", "scale", None, false);
        tool.setup(&server).unwrap();
        assert_eq!(tool.meta().outputs().len(), 3);

        tool::execute(&mut tool, &server).unwrap();
        server.finish().unwrap();

        let mut out = vec![0u8; 12];
        device.read_buffer(values.buffer().unwrap(), 0, &mut out).unwrap();
        let result: Vec<f32> = out.chunks(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect();
        assert_eq!(result, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_missing_variable_fails_setup() {
        let (server, device) = CalcServer::new(&Settings::default());
        device.register_routine("needs_missing", &["nope"], |_, _| Ok(()));
        let mut tool = KernelTool::new("bad", "payload", "needs_missing", None, false);
        assert!(matches!(tool.setup(&server), Err(Error::InvalidVariable(_))));
    }
}
