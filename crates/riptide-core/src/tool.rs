//! Tool base: metadata, profiling, and the execution driver
//!
//! A tool is a named unit of work with declared input/output variable
//! sets. The driver [`execute`] wraps every per-iteration launch:
//!
//! 1. skip when `once` and already executed;
//! 2. gather the wait list: the writing event of every dependency plus
//!    the reading events of the outputs, de-duplicated;
//! 3. call the tool's [`Tool::launch`];
//! 4. publish the returned event as the writing event of every output
//!    and as a reading event on every input (`None` means the tool did
//!    no asynchronous device work and dependencies stay untouched);
//! 5. record wall-clock elapsed time.

use crate::error::Result;
use crate::server::CalcServer;
use crate::variables::Variable;
use riptide_backends::{dedup_events, Event};
use std::sync::Arc;
use std::time::Instant;

/// Incremental wall-time profile (last / mean / variance)
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    samples: u32,
    last: f64,
    mean: f64,
    mean_squares: f64,
}

impl Profile {
    /// Fresh profile
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            samples: 0,
            last: 0.0,
            mean: 0.0,
            mean_squares: 0.0,
        }
    }

    /// Fold one sample into the running averages
    pub fn record(&mut self, seconds: f64) {
        self.last = seconds;
        let n = self.samples as f64;
        self.mean = (self.mean * n + seconds) / (n + 1.0);
        self.mean_squares = (self.mean_squares * n + seconds * seconds) / (n + 1.0);
        self.samples += 1;
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most recent sample, seconds
    pub fn last(&self) -> f64 {
        self.last
    }

    /// Running mean, seconds
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Running variance, seconds squared
    pub fn variance(&self) -> f64 {
        (self.mean_squares - self.mean * self.mean).max(0.0)
    }

    /// Number of recorded samples
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// Shared metadata of every tool
pub struct ToolMeta {
    name: String,
    once: bool,
    iterations: u32,
    elapsed: Profile,
    allocated_bytes: usize,
    inputs: Vec<Arc<Variable>>,
    outputs: Vec<Arc<Variable>>,
    next_tool: Option<usize>,
    substages: Vec<Profile>,
}

impl ToolMeta {
    /// Metadata for a named tool
    pub fn new(name: impl Into<String>, once: bool) -> Self {
        let name = name.into();
        Self {
            elapsed: Profile::new(name.clone()),
            name,
            once,
            iterations: 0,
            allocated_bytes: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_tool: None,
            substages: Vec::new(),
        }
    }

    /// Tool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the tool runs only on the first iteration
    pub fn once(&self) -> bool {
        self.once
    }

    /// Completed iterations
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Declare the input/output variable sets
    pub fn set_dependencies(&mut self, inputs: Vec<Arc<Variable>>, outputs: Vec<Arc<Variable>>) {
        self.inputs = inputs;
        self.outputs = outputs;
    }

    /// Declared inputs
    pub fn inputs(&self) -> &[Arc<Variable>] {
        &self.inputs
    }

    /// Declared outputs
    pub fn outputs(&self) -> &[Arc<Variable>] {
        &self.outputs
    }

    /// Bytes of persistent device memory this tool allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Account persistent device memory
    pub fn add_allocated(&mut self, bytes: usize) {
        self.allocated_bytes += bytes;
    }

    /// Release accounted device memory
    pub fn sub_allocated(&mut self, bytes: usize) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(bytes);
    }

    /// Index of the next tool in the pipeline, if any
    pub fn next_tool(&self) -> Option<usize> {
        self.next_tool
    }

    pub(crate) fn set_next_tool(&mut self, index: Option<usize>) {
        self.next_tool = index;
    }

    /// Wall-time profile of the whole execute
    pub fn elapsed(&self) -> &Profile {
        &self.elapsed
    }

    /// Add a named substage profiler; returns its index
    pub fn add_substage(&mut self, name: impl Into<String>) -> usize {
        self.substages.push(Profile::new(name));
        self.substages.len() - 1
    }

    /// Substage profilers
    pub fn substages(&self) -> &[Profile] {
        &self.substages
    }

    /// Mutable access to one substage profiler
    pub fn substage_mut(&mut self, index: usize) -> &mut Profile {
        &mut self.substages[index]
    }

    fn record_iteration(&mut self, seconds: f64) {
        self.iterations += 1;
        self.elapsed.record(seconds);
    }
}

/// A named unit of work in the pipeline
pub trait Tool: Send {
    /// Shared metadata
    fn meta(&self) -> &ToolMeta;

    /// Mutable shared metadata
    fn meta_mut(&mut self) -> &mut ToolMeta;

    /// Resolve dependencies, compile kernels, allocate persistent
    /// buffers. Called exactly once per tool at startup.
    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()>;

    /// The per-tool work. `wait` carries the events of every declared
    /// dependency; the returned event is published on the outputs.
    /// Returning `None` means no asynchronous device work happened.
    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>>;
}

/// Wait list for a tool launch: writing events of all dependencies plus
/// reading events of the outputs, de-duplicated
pub fn gather_wait_list(meta: &ToolMeta) -> Vec<Event> {
    let mut events = Vec::new();
    for variable in meta.inputs().iter().chain(meta.outputs()) {
        if let Some(event) = variable.writing_event() {
            events.push(event);
        }
    }
    for variable in meta.outputs() {
        events.extend(variable.reading_events());
    }
    dedup_events(&mut events);
    events
}

/// Drive one tool execution (the pipeline driver)
pub fn execute(tool: &mut dyn Tool, server: &Arc<CalcServer>) -> Result<()> {
    if tool.meta().once() && tool.meta().iterations() > 0 {
        return Ok(());
    }
    let started = Instant::now();
    let wait = gather_wait_list(tool.meta());

    let out_event = tool.launch(server, &wait).map_err(|err| {
        tracing::error!(tool = tool.meta().name(), error = %err, "tool execution failed");
        err
    })?;

    if let Some(event) = out_event {
        let meta = tool.meta();
        for output in meta.outputs() {
            output.set_writing_event(event.clone());
        }
        for input in meta.inputs() {
            if meta.outputs().iter().any(|output| Arc::ptr_eq(output, input)) {
                continue;
            }
            input.add_reading_event(event.clone());
        }
    }

    tool.meta_mut().record_iteration(started.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_running_stats() {
        let mut profile = Profile::new("execute");
        profile.record(1.0);
        profile.record(3.0);
        assert_eq!(profile.last(), 3.0);
        assert_eq!(profile.mean(), 2.0);
        assert_eq!(profile.variance(), 1.0);
        assert_eq!(profile.samples(), 2);
    }

    #[test]
    fn test_meta_allocation_accounting() {
        let mut meta = ToolMeta::new("reduction", false);
        meta.add_allocated(1024);
        meta.add_allocated(512);
        meta.sub_allocated(256);
        assert_eq!(meta.allocated_bytes(), 1280);
        assert_eq!(meta.name(), "reduction");
        assert!(!meta.once());
    }
}
