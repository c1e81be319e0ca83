//! CPU reference device
//!
//! Executes kernel launches as native routines against heap-backed
//! buffer storage. The routine table ships with the calculation server's
//! built-in kernels and accepts problem-specific registrations.

use crate::device::Device;
use crate::driver::{KernelCall, Routine, RoutineTable};
use crate::error::{BackendError, Result};
use crate::memory::MemoryManager;
use crate::program::BuildOptions;
use crate::types::{ArgValue, BufferHandle, NdRange};
use parking_lot::RwLock;

/// Default work-group ceiling of the reference device
pub const CPU_MAX_WORK_GROUP_SIZE: usize = 256;

/// CPU device with a native routine table
pub struct CpuDevice {
    memory: RwLock<MemoryManager>,
    routines: RoutineTable,
    max_work_group_size: usize,
}

impl CpuDevice {
    /// Device with the built-in kernels installed
    pub fn new() -> Self {
        Self {
            memory: RwLock::new(MemoryManager::new()),
            routines: RoutineTable::with_builtins(),
            max_work_group_size: CPU_MAX_WORK_GROUP_SIZE,
        }
    }

    /// Install a problem-specific kernel routine
    ///
    /// `params` are the routine's parameter names, in argument order;
    /// the generic kernel tool resolves registry variables by them.
    pub fn register_routine<F>(&self, entry: &str, params: &[&str], func: F)
    where
        F: Fn(&mut MemoryManager, &KernelCall<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.routines.register(entry, params, func);
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "riptide CPU reference device"
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle> {
        self.memory.write().allocate(size)
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.memory.write().free(handle)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.read().size(handle)
    }

    fn read_buffer(&self, handle: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.memory.read().read(handle, offset, dst)
    }

    fn write_buffer(&self, handle: BufferHandle, offset: usize, src: &[u8]) -> Result<()> {
        self.memory.write().write(handle, offset, src)
    }

    fn allocated_bytes(&self) -> usize {
        self.memory.read().allocated_bytes()
    }

    fn resolve_entry(&self, source: &str, _options: &BuildOptions, entry: &str) -> Result<Routine> {
        if source.trim().is_empty() {
            return Err(BackendError::BuildFailure {
                entry: entry.to_string(),
                reason: "empty kernel source payload".to_string(),
            });
        }
        self.routines.resolve(entry)
    }

    fn launch(
        &self,
        routine: &Routine,
        args: &[ArgValue],
        options: &BuildOptions,
        range: NdRange,
    ) -> Result<()> {
        let call = KernelCall {
            entry: &routine.name,
            args,
            options,
            range,
        };
        let mut memory = self.memory.write();
        (routine.func)(&mut memory, &call)
    }
}
