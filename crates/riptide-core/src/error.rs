//! Error types for the calculation server

/// Result type for calculation-server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving the pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lookup of an unregistered variable name
    #[error("invalid variable: \"{0}\" is not registered")]
    InvalidVariable(String),

    /// A variable name is already taken
    #[error("duplicate variable: \"{0}\" is already registered")]
    DuplicateVariable(String),

    /// A type designator could not be parsed
    #[error("unknown type designator: \"{0}\"")]
    UnknownType(String),

    /// Scalar/array or element-kind mismatch
    #[error("invalid type for variable \"{name}\": expected {expected}, found {found}")]
    InvalidVariableType {
        name: String,
        expected: String,
        found: String,
    },

    /// Array lengths disagree (e.g. mask vs. field)
    #[error("invalid length for variable \"{name}\": expected {expected} elements, found {found}")]
    InvalidVariableLength {
        name: String,
        expected: usize,
        found: usize,
    },

    /// Expression parse or type error
    #[error("bad expression \"{expr}\": {reason}")]
    BadExpression { expr: String, reason: String },

    /// Any underlying accelerator failure
    #[error("accelerator error: {0}")]
    Accelerator(#[from] riptide_backends::BackendError),

    /// Host or device allocation failure
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// An assert tool evaluated to zero
    #[error("assertion failed in tool \"{tool}\": {expr}")]
    AssertionFailed { tool: String, expr: String },

    /// No message-passing descriptor for a type
    #[error("no wire descriptor for type \"{0}\"")]
    BadType(String),

    /// Message-passing failure
    #[error("communication error: {0}")]
    Communication(String),
}

impl Error {
    /// Build a `BadExpression` error
    pub fn bad_expression(expr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::BadExpression {
            expr: expr.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an `InvalidVariableType` error
    pub fn bad_var_type(
        name: impl Into<String>,
        expected: impl Into<String>,
        found: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidVariableType {
            name: name.into(),
            expected: expected.into(),
            found: found.to_string(),
        }
    }
}
