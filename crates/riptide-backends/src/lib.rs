//! Accelerator facade for the riptide calculation server
//!
//! This crate provides:
//! - **Device trait**: pluggable compute device interface
//! - **CPU device**: reference implementation with native kernel routines
//! - **Command queues**: in-order streams with event-based dependencies
//! - **Events**: retained tokens with host callbacks and user events
//! - **Compile cache**: kernels cached by (source, flags, entry point)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Calculation server tools                │
//! │        (reduction, link-list, sort, sync, ...)           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ enqueue / wait / callbacks
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Context: queues + events + compile cache        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!                ┌─────────────┐
//!                │   Device    │   (CPU reference; the kernel source
//!                │  routines   │    payload is opaque to the host)
//!                └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use riptide_backends::{ArgValue, Context, Device, NdRange};
//!
//! # fn main() -> riptide_backends::Result<()> {
//! let (ctx, device) = Context::with_cpu_device(false);
//!
//! let buffer = device.allocate_buffer(4 * 4)?;
//! let mut kernel = ctx.compile_kernel("payload", "fill", ctx.build_options())?;
//! kernel.set_arg(0, ArgValue::Buffer(buffer))?;
//! kernel.set_arg(1, ArgValue::scalar(1u32))?;
//! kernel.set_arg(2, ArgValue::scalar(4u32))?;
//!
//! let event = ctx.queue().enqueue_kernel(&kernel, NdRange::new(4, 4)?, &[])?;
//! event.wait()?;
//! ctx.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod builtins;
pub mod context;
pub mod cpu;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod memory;
pub mod program;
pub mod queue;
pub mod types;

pub use context::Context;
pub use cpu::CpuDevice;
pub use device::Device;
pub use driver::{KernelCall, Routine, RoutineTable};
pub use error::{BackendError, Result, STATUS_EXEC_ERROR};
pub use event::{dedup_events, wait_all, Event, EventStatus};
pub use memory::MemoryManager;
pub use program::{BuildOptions, Kernel, ProgramCache, ProgramKey};
pub use queue::CommandQueue;
pub use types::{ArgValue, BufferHandle, NdRange};
