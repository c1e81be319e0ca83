//! Parallel tree reduction
//!
//! Reduces an array variable to a scalar variable under a user-supplied
//! associative operator with an identity value. Setup builds a chain of
//! shrinking passes (each consumes `n` elements and produces
//! `ceil(n / local)`) with one intermediate buffer per pass; the first
//! pass reads the input variable's buffer directly. Execute enqueues the
//! passes chained by events, blocking-reads the single final element into
//! the output scalar, and returns a marker chained on the user event its
//! populate callback completes.

use crate::error::{Error, Result};
use crate::scalar::ScalarValue;
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::variables::Variable;
use riptide_backends::{ArgValue, BufferHandle, Device, Event, EventStatus, Kernel, NdRange, STATUS_EXEC_ERROR};
use std::sync::Arc;

/// Work-group ceiling for the reduction kernel
const MAX_LOCAL_SIZE: usize = 128;

const REDUCTION_INC: &str = r#"
#if defined(HAVE_3D)
    #define VEC_INFINITY (vec)(INFINITY, INFINITY, INFINITY, INFINITY)
#else
    #define VEC_INFINITY (vec)(INFINITY, INFINITY)
#endif
"#;

const REDUCTION_SRC: &str = r#"
__kernel void reduction(__global T* input,
                        __global T* output,
                        unsigned int n,
                        __local T* scratch)
{
    /* classic work-group tree fold; tail lanes contribute IDENTITY */
}
"#;

struct Pass {
    kernel: Kernel,
    range: NdRange,
    n: usize,
}

/// Reduce an array variable into a scalar variable
pub struct Reduction {
    meta: ToolMeta,
    input_name: String,
    output_name: String,
    operation: String,
    identity: String,
    input_var: Option<Arc<Variable>>,
    output_var: Option<Arc<Variable>>,
    passes: Vec<Pass>,
    buffers: Vec<BufferHandle>,
    substage: usize,
}

impl Reduction {
    /// Reduce `input_name` into `output_name` with the given operator
    /// body (e.g. `"c = max(a, b);"`) and identity (e.g. `"-VEC_INFINITY"`)
    pub fn new(name: &str, input_name: &str, output_name: &str, operation: &str, identity: &str) -> Self {
        let mut meta = ToolMeta::new(name, false);
        let substage = meta.add_substage("reduction");
        Self {
            meta,
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            operation: operation.to_string(),
            identity: identity.to_string(),
            input_var: None,
            output_var: None,
            passes: Vec::new(),
            buffers: Vec::new(),
            substage,
        }
    }

    fn resolve_variables(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();

        let input = vars.require(&self.input_name)?;
        if !input.is_array() {
            return Err(Error::bad_var_type(&self.input_name, "array", input.var_type()));
        }
        let output = vars.require(&self.output_name)?;
        if output.is_array() {
            return Err(Error::bad_var_type(&self.output_name, "scalar", output.var_type()));
        }
        if input.var_type().element() != output.var_type() {
            return Err(Error::bad_var_type(
                &self.output_name,
                input.var_type().element().designator(),
                output.var_type(),
            ));
        }

        self.meta.set_dependencies(vec![input.clone()], vec![output.clone()]);
        self.input_var = Some(input);
        self.output_var = Some(output);
        Ok(())
    }

    fn source(&self) -> String {
        format!(
            "{REDUCTION_INC}#define IDENTITY {}\nT reduce(T a, T b) {{ T c; {}; return c; }}\n{REDUCTION_SRC}",
            self.identity, self.operation
        )
    }

    fn build_passes(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let ctx = server.context();
        let input = self.input_var.as_ref().ok_or_else(|| Error::InvalidVariable(self.input_name.clone()))?;
        let output = self.output_var.as_ref().ok_or_else(|| Error::InvalidVariable(self.output_name.clone()))?;

        let element = output.var_type();
        let data_size = element.bytes();
        let source = self.source();

        // Largest power of two not exceeding the device/kernel limit.
        let mut local_size = ctx.device().max_work_group_size().min(MAX_LOCAL_SIZE);
        if !local_size.is_power_of_two() {
            local_size = local_size.next_power_of_two() / 2;
        }

        self.buffers.push(input.buffer()?);
        let mut n = input.len()?;
        while n > 1 {
            let range = NdRange::new(n, local_size)?;
            let groups = range.groups();

            let buffer = ctx.device().allocate_buffer(groups * data_size)?;
            self.meta.add_allocated(groups * data_size);
            self.buffers.push(buffer);

            let options = ctx
                .build_options()
                .define("T", element.designator())
                .define("OPERATION", &self.operation)
                .define("IDENTITY", &self.identity)
                .define("LOCAL_WORK_SIZE", local_size.to_string());
            let mut kernel = ctx.compile_kernel(&source, "reduction", options)?;
            let input_index = self.buffers.len() - 2;
            kernel.set_arg(0, ArgValue::Buffer(self.buffers[input_index]))?;
            kernel.set_arg(1, ArgValue::Buffer(buffer))?;
            kernel.set_arg(2, ArgValue::scalar(n as u32))?;
            kernel.set_arg(3, ArgValue::Local(local_size * data_size))?;

            tracing::debug!(
                tool = self.meta.name(),
                step = self.passes.len(),
                n,
                groups,
                "reduction pass"
            );
            self.passes.push(Pass { kernel, range, n });
            n = groups;
        }
        Ok(())
    }

    /// Rewrite the first pass's input argument when the input variable's
    /// buffer was reallocated upstream
    fn refresh_input(&mut self) -> Result<()> {
        let input = self.input_var.as_ref().ok_or_else(|| Error::InvalidVariable(self.input_name.clone()))?;
        let current = input.buffer()?;
        if self.buffers[0] == current {
            return Ok(());
        }
        if let Some(first) = self.passes.first_mut() {
            first.kernel.set_arg(0, ArgValue::Buffer(current))?;
        }
        self.buffers[0] = current;
        Ok(())
    }
}

impl Tool for Reduction {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        self.resolve_variables(server)?;
        self.build_passes(server)
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let started = std::time::Instant::now();
        self.refresh_input()?;

        let queue = server.context().queue();
        let output = self
            .output_var
            .clone()
            .ok_or_else(|| Error::InvalidVariable(self.output_name.clone()))?;

        // Chain the shrinking passes; the first one carries the full
        // wait list, each next one waits only on its predecessor.
        let mut chain: Vec<Event> = wait.to_vec();
        for pass in &self.passes {
            let event = queue.enqueue_kernel(&pass.kernel, pass.range, &chain)?;
            chain = vec![event];
        }

        // Blocking read of the final element into the output slot.
        let final_buffer = *self.buffers.last().unwrap_or(&self.buffers[0]);
        let mut read_wait = wait.to_vec();
        read_wait.extend(chain);
        let (bytes, read_event) = queue.read_blocking(final_buffer, 0, output.type_size(), &read_wait)?;
        output.set_scalar(ScalarValue::from_bytes(output.var_type(), &bytes)?)?;

        // Populate runs in a completion callback so other consumers (the
        // expression evaluator included) observe the new value before the
        // out-event fires.
        let user_event = Event::user();
        let done = user_event.clone();
        let vars = server.variables().clone();
        let server = server.clone();
        let tool_name = self.meta.name().to_string();
        read_event.on_complete(move |status| {
            if let EventStatus::Error(code) = status {
                tracing::warn!(tool = %tool_name, code, "skipping variable population, dependency failed");
                done.fail(code);
                return;
            }
            match vars.populate(&output) {
                Ok(()) => done.complete(),
                Err(err) => {
                    server.latch_fatal(err);
                    done.fail(STATUS_EXEC_ERROR);
                }
            }
        });

        // A user event is awkward downstream (it cannot be profiled), so
        // the published token is a marker on top of it.
        let out_event = queue.marker(&[user_event])?;
        self.meta.substage_mut(self.substage).record(started.elapsed().as_secs_f64());
        Ok(Some(out_event))
    }
}
