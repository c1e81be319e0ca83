//! Error types for accelerator operations

/// Result type for accelerator operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Status code an event carries when it finishes in error state.
///
/// Mirrors the convention of negative device status codes; host callbacks
/// may fail user events with their own negative codes.
pub const STATUS_EXEC_ERROR: i32 = -1;

/// Errors that can occur inside the accelerator facade
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Host or device allocation failure
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The kernel source carries no routine for the requested entry point
    #[error("unknown kernel entry point: {0}")]
    UnknownEntryPoint(String),

    /// Kernel compilation failure (empty payload, bad definitions, ...)
    #[error("kernel build failure for \"{entry}\": {reason}")]
    BuildFailure { entry: String, reason: String },

    /// A kernel argument slot is unset or carries the wrong kind of value
    #[error("invalid kernel argument {index} for \"{entry}\": {reason}")]
    InvalidKernelArg {
        entry: String,
        index: usize,
        reason: String,
    },

    /// Bad NDRange geometry
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// A waited-on event finished with an error status
    #[error("event finished with error status {0}")]
    EventError(i32),

    /// The command queue worker is gone
    #[error("command queue is shut down")]
    QueueClosed,

    /// Failure while executing a routine on the device
    #[error("execution error: {0}")]
    ExecutionError(String),
}

impl BackendError {
    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create a kernel argument error
    pub fn bad_arg(entry: impl Into<String>, index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidKernelArg {
            entry: entry.into(),
            index,
            reason: reason.into(),
        }
    }
}
