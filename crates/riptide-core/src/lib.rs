//! SPH calculation server
//!
//! The runtime of a Smoothed Particle Hydrodynamics simulator: a
//! pipeline of compute tools, each executing one or more accelerator
//! kernels against a shared pool of named variables, coordinated by a
//! fine-grained event-driven dependency graph.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Pipeline                            │
//! │   tool → tool → tool → ...   (one pass per iteration)     │
//! └──────────┬───────────────────────────────────────────────┘
//!            │ wait lists / out-events per shared variable
//!            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        Variables registry (scalars + device arrays)       │
//! │   writing event + reading events per variable             │
//! └──────────┬───────────────────────────────────────────────┘
//!            │ buffers / kernels / markers / user events
//!            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        riptide-backends accelerator context               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use riptide_backends::Device;
//! use riptide_core::{CalcServer, Pipeline, Settings};
//! use riptide_core::tools::Reduction;
//!
//! # fn main() -> riptide_core::Result<()> {
//! let (server, device) = CalcServer::new(&Settings::default());
//! let vars = server.variables();
//! vars.register("N", "unsigned int", "", "4")?;
//! vars.register("a", "float*", "N", "")?;
//! vars.register("sum", "float", "", "0")?;
//!
//! let a = vars.require("a")?;
//! let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
//! device.write_buffer(a.buffer()?, 0, &data)?;
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.push(Box::new(Reduction::new("sum a", "a", "sum", "c = a + b;", "0")));
//! pipeline.setup(&server)?;
//! pipeline.run_iteration(&server)?;
//! server.finish()?;
//!
//! assert_eq!(vars.require("sum")?.scalar()?.as_f64(), Some(10.0));
//! # Ok(())
//! # }
//! ```

pub mod comm;
pub mod error;
mod expr;
pub mod pipeline;
pub mod scalar;
pub mod server;
pub mod tool;
pub mod tools;
pub mod variables;

pub use comm::{wire_type, Communicator, LocalCluster, LocalCommunicator, WireType, COUNT_TAG};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use scalar::{type_to_bytes, type_to_components, ElemKind, ScalarValue, VarType};
pub use server::{CalcServer, DeviceKind, Settings};
pub use tool::{execute, gather_wait_list, Profile, Tool, ToolMeta};
pub use variables::{Variable, Variables};
