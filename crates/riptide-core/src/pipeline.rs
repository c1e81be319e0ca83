//! Tool pipeline
//!
//! An ordered sequence of tools executed once per simulation iteration.
//! The pipeline owns its tools; each tool holds the *index* of its
//! successor (no heap cycle). Errors inside a tool are fatal: the
//! iteration stops and the error propagates to the caller.

use crate::error::Result;
use crate::server::CalcServer;
use crate::tool::{self, Tool};
use std::sync::Arc;

/// Ordered tool sequence with a current execution index
pub struct Pipeline {
    tools: Vec<Box<dyn Tool>>,
    current: usize,
}

impl Pipeline {
    /// Empty pipeline
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            current: 0,
        }
    }

    /// Append a tool
    pub fn push(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the pipeline holds no tools
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Index of the tool currently (or last) executed
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The tools, for inspection
    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Wire next-tool indices and run every tool's `setup` once
    #[tracing::instrument(skip_all)]
    pub fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let count = self.tools.len();
        for (index, tool) in self.tools.iter_mut().enumerate() {
            let next = (index + 1 < count).then_some(index + 1);
            tool.meta_mut().set_next_tool(next);
            tracing::info!(tool = tool.meta().name(), "loading tool");
            tool.setup(server)?;
        }
        Ok(())
    }

    /// Execute every tool once, in order
    ///
    /// The server's fatal latch is checked after each tool so failures
    /// raised from completion callbacks stop the iteration.
    pub fn run_iteration(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        for index in 0..self.tools.len() {
            self.current = index;
            tool::execute(self.tools[index].as_mut(), server)?;
            server.check_fatal()?;
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
