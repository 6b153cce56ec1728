//! ModuleInstance trait - abstract module operations
//!
//! Defines the interface a running sandboxed module exposes to the bridge.
//! The bridge programs against these traits and never against a particular
//! engine. Every method takes `&self`: a module call may re-enter the bridge,
//! which may call back into the module, so implementations keep their own
//! state behind interior mutability.

use crate::error::{BridgeError, BridgeResult};
use crate::value::WasmValue;

/// Export the bridge uses to allocate module memory: `(size) -> ptr`
pub const MALLOC_EXPORT: &str = "__hostlink_malloc";

/// Export the bridge uses to grow an allocation: `(ptr, old, new) -> ptr`
pub const REALLOC_EXPORT: &str = "__hostlink_realloc";

/// Export the bridge uses to hand memory back: `(ptr, size)`
pub const FREE_EXPORT: &str = "__hostlink_free";

/// Default start entry point
pub const START_EXPORT: &str = "__hostlink_start";

/// Byte-addressed linear memory.
///
/// Memory may grow during any call into the module (in particular during
/// allocation), so callers re-read through these methods after every such
/// call instead of caching slices.
pub trait LinearMemory {
    /// Current size in bytes
    fn size(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    fn read(&self, offset: u32, dst: &mut [u8]) -> BridgeResult<()>;

    /// Copy `src` into memory starting at `offset`
    fn write(&self, offset: u32, src: &[u8]) -> BridgeResult<()>;

    /// Read `len` bytes into a fresh vector
    fn read_vec(&self, offset: u32, len: u32) -> BridgeResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian 32-bit word
    fn read_u32(&self, offset: u32) -> BridgeResult<u32> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian 32-bit word
    fn write_u32(&self, offset: u32, value: u32) -> BridgeResult<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

/// Bounds check shared by memory implementations.
pub fn check_bounds(offset: u32, len: usize, size: usize) -> BridgeResult<std::ops::Range<usize>> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(BridgeError::MemoryOutOfBounds {
            offset,
            len: len as u32,
            size,
        }),
    }
}

/// A running module instance.
pub trait ModuleInstance {
    /// The module's exported linear memory
    fn memory(&self) -> &dyn LinearMemory;

    /// Call an exported function by name
    fn call_export(&self, name: &str, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>>;

    /// Call an entry of the exported function table
    fn call_indirect(&self, index: u32, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>>;

    /// Number of entries in the exported function table
    fn table_len(&self) -> u32;

    /// Whether an export with this name exists
    fn has_export(&self, name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_bounds() {
        assert_eq!(check_bounds(4, 4, 8).unwrap(), 4..8);
        assert!(check_bounds(5, 4, 8).is_err());
        assert_eq!(check_bounds(8, 0, 8).unwrap(), 8..8);
    }
}
