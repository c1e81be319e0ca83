//! Handles, launch geometry, and kernel argument values

use crate::error::{BackendError, Result};
use std::fmt;

/// Handle to an allocated device buffer
///
/// Buffers are opaque handles managed by the device. Use the device (or
/// a command queue) to interact with the underlying storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    /// Create a new buffer handle
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// One-dimensional launch geometry
///
/// The calculation server launches every kernel over a 1-D iteration
/// space; `global` is always a multiple of `local` (see [`NdRange::round_up`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// Global work size (total work items)
    pub global: usize,
    /// Local work size (work items per group)
    pub local: usize,
}

impl NdRange {
    /// Create a new range; `global` is rounded up to a multiple of `local`
    pub fn new(global: usize, local: usize) -> Result<Self> {
        if local == 0 {
            return Err(BackendError::InvalidLaunchConfig("local work size is zero".into()));
        }
        Ok(Self {
            global: Self::round_up(global, local),
            local,
        })
    }

    /// Round `n` up to the next multiple of `local`
    pub fn round_up(n: usize, local: usize) -> usize {
        n.div_ceil(local) * local
    }

    /// Number of work groups
    pub fn groups(&self) -> usize {
        self.global / self.local
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.global, self.local)
    }
}

/// Value bound to a kernel argument slot
///
/// Scalar arguments travel as raw bytes so callers can compare the bound
/// bytes against a shadow copy and skip redundant `set_arg` calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Device buffer handle
    Buffer(BufferHandle),
    /// Scalar value, stored as its byte representation
    Bytes(Vec<u8>),
    /// Group-local scratch memory of the given byte size
    Local(usize),
}

impl ArgValue {
    /// Wrap a plain-old-data scalar as an argument value
    pub fn scalar<T: bytemuck::Pod>(value: T) -> Self {
        ArgValue::Bytes(bytemuck::bytes_of(&value).to_vec())
    }

    /// Interpret the argument as a buffer handle
    pub fn buffer(&self, entry: &str, index: usize) -> Result<BufferHandle> {
        match self {
            ArgValue::Buffer(handle) => Ok(*handle),
            other => Err(BackendError::bad_arg(
                entry,
                index,
                format!("expected a buffer, got {other:?}"),
            )),
        }
    }

    /// Interpret the argument as scalar bytes
    pub fn bytes(&self, entry: &str, index: usize) -> Result<&[u8]> {
        match self {
            ArgValue::Bytes(bytes) => Ok(bytes),
            other => Err(BackendError::bad_arg(
                entry,
                index,
                format!("expected scalar bytes, got {other:?}"),
            )),
        }
    }

    /// Interpret the argument as a plain-old-data scalar
    pub fn pod<T: bytemuck::Pod>(&self, entry: &str, index: usize) -> Result<T> {
        let bytes = self.bytes(entry, index)?;
        bytemuck::try_from_bytes(bytes).copied().map_err(|_| {
            BackendError::bad_arg(
                entry,
                index,
                format!("expected {} bytes, got {}", std::mem::size_of::<T>(), bytes.len()),
            )
        })
    }
}
