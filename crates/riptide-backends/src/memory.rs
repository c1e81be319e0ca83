//! Memory manager for the CPU reference device
//!
//! Buffers are heap-backed byte vectors addressed by monotonic handles.
//! Kernels run inside the device with the manager locked, so routines get
//! direct slice access through [`MemoryManager::bytes`] /
//! [`MemoryManager::bytes_mut`].

use crate::error::{BackendError, Result};
use crate::types::BufferHandle;
use std::collections::HashMap;

/// Buffer storage for the CPU device
pub struct MemoryManager {
    buffers: HashMap<u64, Vec<u8>>,
    next_id: u64,
    allocated: usize,
}

impl MemoryManager {
    /// Create an empty memory manager
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
            allocated: 0,
        }
    }

    /// Allocate a zero-initialized buffer
    pub fn allocate(&mut self, size: usize) -> Result<BufferHandle> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| BackendError::OutOfMemory { requested: size })?;
        storage.resize(size, 0);

        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, storage);
        self.allocated += size;
        Ok(BufferHandle::new(id))
    }

    /// Free a buffer
    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        match self.buffers.remove(&handle.id()) {
            Some(storage) => {
                self.allocated -= storage.len();
                Ok(())
            }
            None => Err(BackendError::InvalidBufferHandle(handle.id())),
        }
    }

    /// Buffer size in bytes
    pub fn size(&self, handle: BufferHandle) -> Result<usize> {
        self.buffers
            .get(&handle.id())
            .map(Vec::len)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Total bytes currently allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Immutable view of a buffer
    pub fn bytes(&self, handle: BufferHandle) -> Result<&[u8]> {
        self.buffers
            .get(&handle.id())
            .map(Vec::as_slice)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Mutable view of a buffer
    pub fn bytes_mut(&mut self, handle: BufferHandle) -> Result<&mut [u8]> {
        self.buffers
            .get_mut(&handle.id())
            .map(Vec::as_mut_slice)
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    /// Copy `src` into the buffer at `offset`
    pub fn write(&mut self, handle: BufferHandle, offset: usize, src: &[u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let end = offset
            .checked_add(src.len())
            .filter(|end| *end <= buffer.len())
            .ok_or(BackendError::BufferOutOfBounds {
                offset,
                size: src.len(),
                buffer_size: buffer.len(),
            })?;
        buffer[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Copy the buffer at `offset` into `dst`
    pub fn read(&self, handle: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let buffer = self
            .buffers
            .get(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        let end = offset
            .checked_add(dst.len())
            .filter(|end| *end <= buffer.len())
            .ok_or(BackendError::BufferOutOfBounds {
                offset,
                size: dst.len(),
                buffer_size: buffer.len(),
            })?;
        dst.copy_from_slice(&buffer[offset..end]);
        Ok(())
    }

    /// Snapshot a whole buffer
    pub fn to_vec(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        self.bytes(handle).map(|bytes| bytes.to_vec())
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut mem = MemoryManager::new();
        let buffer = mem.allocate(1024).unwrap();
        assert_eq!(mem.size(buffer).unwrap(), 1024);
        assert_eq!(mem.allocated_bytes(), 1024);

        mem.free(buffer).unwrap();
        assert_eq!(mem.allocated_bytes(), 0);
        assert!(mem.size(buffer).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut mem = MemoryManager::new();
        let buffer = mem.allocate(16).unwrap();

        mem.write(buffer, 4, b"abcd").unwrap();
        let mut out = [0u8; 4];
        mem.read(buffer, 4, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut mem = MemoryManager::new();
        let buffer = mem.allocate(8).unwrap();

        assert!(matches!(
            mem.write(buffer, 6, b"abcd"),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
        let mut out = [0u8; 16];
        assert!(mem.read(buffer, 0, &mut out).is_err());
    }
}
