//! Kernel routine table
//!
//! The CPU reference device executes kernels as native routines resolved
//! by entry-point name. The source payload handed to the compiler is
//! opaque (it participates in compile-cache keying only); the routine
//! table is what "compilation" resolves against. Problem-specific kernels
//! can be installed at runtime with [`RoutineTable::register`].

use crate::error::{BackendError, Result};
use crate::memory::MemoryManager;
use crate::program::BuildOptions;
use crate::types::{ArgValue, BufferHandle, NdRange};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A single kernel invocation, as seen by a routine
pub struct KernelCall<'a> {
    /// Entry point the launch was issued against
    pub entry: &'a str,
    /// Bound arguments, in declaration order
    pub args: &'a [ArgValue],
    /// Compile options of the kernel instance
    pub options: &'a BuildOptions,
    /// Launch geometry
    pub range: NdRange,
}

impl<'a> KernelCall<'a> {
    fn arg(&self, index: usize) -> Result<&ArgValue> {
        self.args
            .get(index)
            .ok_or_else(|| BackendError::bad_arg(self.entry, index, "argument index out of range"))
    }

    /// Argument as a buffer handle
    pub fn buffer(&self, index: usize) -> Result<BufferHandle> {
        self.arg(index)?.buffer(self.entry, index)
    }

    /// Argument as a plain-old-data scalar
    pub fn pod<T: bytemuck::Pod>(&self, index: usize) -> Result<T> {
        self.arg(index)?.pod(self.entry, index)
    }

    /// Argument as raw scalar bytes
    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        self.arg(index)?.bytes(self.entry, index)
    }

    /// Definition the kernel was compiled with, or an execution error
    pub fn require_define(&self, key: &str) -> Result<&str> {
        self.options
            .get(key)
            .ok_or_else(|| BackendError::execution(format!("\"{}\" compiled without -D{key}", self.entry)))
    }
}

/// Native implementation behind an entry point
pub type RoutineFn = dyn Fn(&mut MemoryManager, &KernelCall<'_>) -> Result<()> + Send + Sync;

/// A resolved kernel routine
#[derive(Clone)]
pub struct Routine {
    /// Entry point name
    pub name: String,
    /// Parameter names, in argument order (used by the generic kernel
    /// tool to detect its variables)
    pub params: Vec<String>,
    /// The native implementation
    pub func: Arc<RoutineFn>,
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Entry-point → routine mapping for a device
pub struct RoutineTable {
    map: RwLock<HashMap<String, Routine>>,
}

impl RoutineTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Table pre-populated with the built-in calculation-server kernels
    pub fn with_builtins() -> Self {
        let table = Self::new();
        crate::builtins::install(&table);
        table
    }

    /// Install (or replace) a routine
    pub fn register<F>(&self, name: &str, params: &[&str], func: F)
    where
        F: Fn(&mut MemoryManager, &KernelCall<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let routine = Routine {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            func: Arc::new(func),
        };
        self.map.write().insert(routine.name.clone(), routine);
    }

    /// Look up a routine by entry-point name
    pub fn resolve(&self, entry: &str) -> Result<Routine> {
        self.map
            .read()
            .get(entry)
            .cloned()
            .ok_or_else(|| BackendError::UnknownEntryPoint(entry.to_string()))
    }
}

impl Default for RoutineTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let table = RoutineTable::new();
        table.register("copy", &["src", "dst", "n"], |_, _| Ok(()));

        let routine = table.resolve("copy").unwrap();
        assert_eq!(routine.name, "copy");
        assert_eq!(routine.params, vec!["src", "dst", "n"]);
        assert!(matches!(
            table.resolve("missing"),
            Err(BackendError::UnknownEntryPoint(_))
        ));
    }

    #[test]
    fn test_builtins_are_installed() {
        let table = RoutineTable::with_builtins();
        for entry in [
            "reduction",
            "iCell",
            "iHoc",
            "linkList",
            "radix_init",
            "radix_histogram",
            "radix_scan",
            "radix_reorder",
            "radix_inverse",
            "unsort",
            "n_offset_mask",
            "n_send_mask",
            "set_mask",
            "fill",
        ] {
            assert!(table.resolve(entry).is_ok(), "missing builtin {entry}");
        }
    }
}
