//! Accelerator context
//!
//! Owns the device, the two in-order command queues (the pipeline stream
//! and the callback stream), and the compile cache. The callback queue
//! exists so completion callbacks can move data without stalling the
//! pipeline stream.

use crate::cpu::CpuDevice;
use crate::device::Device;
use crate::error::Result;
use crate::program::{BuildOptions, Kernel, ProgramCache, ProgramKey};
use crate::queue::CommandQueue;
use std::sync::Arc;

/// Accelerator context: device + queues + compile cache
pub struct Context {
    device: Arc<dyn Device>,
    queue: CommandQueue,
    callback_queue: CommandQueue,
    cache: ProgramCache,
    three_d: bool,
}

impl Context {
    /// Build a context over a device
    pub fn new(device: Arc<dyn Device>, three_d: bool) -> Arc<Self> {
        tracing::info!(device = device.name(), three_d, "creating accelerator context");
        Arc::new(Self {
            queue: CommandQueue::new(device.clone()),
            callback_queue: CommandQueue::new(device.clone()),
            cache: ProgramCache::new(),
            device,
            three_d,
        })
    }

    /// Build a context over a fresh CPU reference device
    ///
    /// Also returns the concrete device so callers can register
    /// problem-specific kernel routines.
    pub fn with_cpu_device(three_d: bool) -> (Arc<Self>, Arc<CpuDevice>) {
        let device = Arc::new(CpuDevice::new());
        (Self::new(device.clone(), three_d), device)
    }

    /// The device behind this context
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The pipeline command queue
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// The secondary queue used from completion callbacks
    pub fn callback_queue(&self) -> &CommandQueue {
        &self.callback_queue
    }

    /// Whether the context targets three spatial dimensions
    pub fn three_d(&self) -> bool {
        self.three_d
    }

    /// Spatial dimensionality (2 or 3)
    pub fn dims(&self) -> usize {
        if self.three_d {
            3
        } else {
            2
        }
    }

    /// Build options carrying the standard injected macro set
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions::new(self.three_d)
    }

    /// Compile a kernel entry point from a source payload
    ///
    /// Resolution goes through the compile cache; each call returns a
    /// fresh kernel instance (own argument slots) over the shared routine.
    pub fn compile_kernel(&self, source: &str, entry: &str, options: BuildOptions) -> Result<Kernel> {
        let key = ProgramKey::new(source, &options, entry);
        let routine = self
            .cache
            .get_or_resolve(&key, || self.device.resolve_entry(source, &options, entry))?;
        tracing::debug!(entry, flags = %options.to_flags(), "kernel resolved");
        Ok(Kernel::new(routine, options, self.device.max_work_group_size()))
    }

    /// Number of cached kernel resolutions
    pub fn cached_programs(&self) -> usize {
        self.cache.len()
    }

    /// Drain both queues and surface any latched error
    pub fn finish(&self) -> Result<()> {
        self.queue.finish()?;
        self.callback_queue.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArgValue, NdRange};

    #[test]
    fn test_compile_cache_is_shared() {
        let (ctx, _device) = Context::with_cpu_device(false);
        let options = ctx.build_options();
        ctx.compile_kernel("payload", "fill", options.clone()).unwrap();
        ctx.compile_kernel("payload", "fill", options).unwrap();
        assert_eq!(ctx.cached_programs(), 1);

        ctx.compile_kernel("payload", "iHoc", ctx.build_options()).unwrap();
        assert_eq!(ctx.cached_programs(), 2);
    }

    #[test]
    fn test_kernel_launch_through_context() {
        let (ctx, device) = Context::with_cpu_device(false);
        let buffer = device.allocate_buffer(4 * 4).unwrap();

        let mut kernel = ctx.compile_kernel("payload", "fill", ctx.build_options()).unwrap();
        kernel.set_arg(0, ArgValue::Buffer(buffer)).unwrap();
        kernel.set_arg(1, ArgValue::scalar(3u32)).unwrap();
        kernel.set_arg(2, ArgValue::scalar(4u32)).unwrap();

        let event = ctx
            .queue()
            .enqueue_kernel(&kernel, NdRange::new(4, 4).unwrap(), &[])
            .unwrap();
        event.wait().unwrap();

        let mut out = [0u8; 16];
        device.read_buffer(buffer, 0, &mut out).unwrap();
        assert_eq!(out, [3, 0, 0, 0, 3, 0, 0, 0, 3, 0, 0, 0, 3, 0, 0, 0]);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_unknown_entry_point_fails() {
        let (ctx, _device) = Context::with_cpu_device(false);
        assert!(ctx
            .compile_kernel("payload", "definitely_not_registered", ctx.build_options())
            .is_err());
    }
}
