//! Device trait for the accelerator facade
//!
//! Devices own buffer storage, resolve kernel entry points from source
//! payloads, and execute launches issued by the command queues. One
//! device serves every queue of a context; multi-device scheduling
//! within one process is out of scope.

use crate::driver::Routine;
use crate::error::Result;
use crate::program::BuildOptions;
use crate::types::{ArgValue, BufferHandle, NdRange};

/// Compute device behind a context
pub trait Device: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Largest local work size the device supports
    fn max_work_group_size(&self) -> usize;

    /// Allocate a zero-initialized device buffer
    fn allocate_buffer(&self, size: usize) -> Result<BufferHandle>;

    /// Free a device buffer
    fn free_buffer(&self, handle: BufferHandle) -> Result<()>;

    /// Buffer size in bytes
    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    /// Synchronous device → host copy
    fn read_buffer(&self, handle: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Synchronous host → device copy
    fn write_buffer(&self, handle: BufferHandle, offset: usize, src: &[u8]) -> Result<()>;

    /// Total bytes currently allocated on the device
    fn allocated_bytes(&self) -> usize;

    /// Resolve an entry point of a kernel source payload
    ///
    /// The source text is opaque to the host; the reference device
    /// resolves the entry name against its routine table.
    fn resolve_entry(&self, source: &str, options: &BuildOptions, entry: &str) -> Result<Routine>;

    /// Execute a resolved routine over a 1-D range
    fn launch(
        &self,
        routine: &Routine,
        args: &[ArgValue],
        options: &BuildOptions,
        range: NdRange,
    ) -> Result<()>;
}
