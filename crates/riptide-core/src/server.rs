//! Calculation server context
//!
//! The long-lived context value every tool works against: the
//! accelerator context, the variable registry, and (in multi-process
//! runs) the communicator. There are no process singletons; the server
//! is constructed at startup from [`Settings`] and passed explicitly.

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::variables::Variables;
use parking_lot::Mutex;
use riptide_backends::{Context, CpuDevice};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// The CPU reference device
    #[default]
    Cpu,
}

/// Problem-level runtime settings
///
/// Supplied by the problem loader; everything defaults to a 2D CPU run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Three spatial dimensions (`HAVE_3D` builds) instead of two
    pub three_d: bool,
    /// Which device backs the context
    pub device: DeviceKind,
}

/// The calculation server context value
pub struct CalcServer {
    ctx: Arc<Context>,
    vars: Arc<Variables>,
    comm: Option<Arc<dyn Communicator>>,
    fatal: Mutex<Option<Error>>,
}

impl CalcServer {
    /// Build a server (and its CPU device) from settings
    pub fn new(settings: &Settings) -> (Arc<Self>, Arc<CpuDevice>) {
        let DeviceKind::Cpu = settings.device;
        let (ctx, device) = Context::with_cpu_device(settings.three_d);
        (Self::from_context(ctx), device)
    }

    /// Build a server over an existing accelerator context
    pub fn from_context(ctx: Arc<Context>) -> Arc<Self> {
        Self::from_parts(ctx, None)
    }

    /// Build a server with a communicator for multi-process runs
    pub fn from_parts(ctx: Arc<Context>, comm: Option<Arc<dyn Communicator>>) -> Arc<Self> {
        Arc::new(Self {
            vars: Variables::new(ctx.clone()),
            ctx,
            comm,
            fatal: Mutex::new(None),
        })
    }

    /// The accelerator context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The variable registry
    pub fn variables(&self) -> &Arc<Variables> {
        &self.vars
    }

    /// The communicator, failing when the run is single-process
    pub fn communicator(&self) -> Result<Arc<dyn Communicator>> {
        self.comm
            .clone()
            .ok_or_else(|| Error::Communication("no communicator configured".to_string()))
    }

    /// Latch a fatal error raised from a completion callback
    ///
    /// Callbacks cannot unwind into the pipeline thread; the pipeline
    /// driver checks the latch after every tool.
    pub fn latch_fatal(&self, err: Error) {
        tracing::error!(error = %err, "fatal error latched");
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Surface a latched fatal error, consuming it
    pub fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Await in-flight events, drain the device queues, then surface any
    /// latched error
    ///
    /// Events attached to variables are awaited before the queue drain:
    /// completion callbacks (sync receivers in particular) enqueue device
    /// work after their trigger fires, and a plain drain could overtake
    /// them. A fatal latched by a callback (e.g. a failed assertion)
    /// takes precedence over the generic queue error it usually also
    /// causes; individual event failures surface through those latches.
    pub fn finish(&self) -> Result<()> {
        for event in self.vars.pending_events() {
            let _ = event.wait();
        }
        let drained = self.ctx.finish();
        self.check_fatal()?;
        drained.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(!settings.three_d);
        assert_eq!(settings.device, DeviceKind::Cpu);

        let settings: Settings = serde_json::from_str(r#"{"three_d": true}"#).unwrap();
        assert!(settings.three_d);
    }

    #[test]
    fn test_fatal_latch_is_consumed_once() {
        let (server, _device) = CalcServer::new(&Settings::default());
        server.check_fatal().unwrap();

        server.latch_fatal(Error::AssertionFailed {
            tool: "assert".into(),
            expr: "h > 0".into(),
        });
        assert!(matches!(server.check_fatal(), Err(Error::AssertionFailed { .. })));
        server.check_fatal().unwrap();
    }

    #[test]
    fn test_missing_communicator_is_an_error() {
        let (server, _device) = CalcServer::new(&Settings::default());
        assert!(matches!(server.communicator(), Err(Error::Communication(_))));
    }
}
