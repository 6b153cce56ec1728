//! Module-side allocation through the module's own allocator exports
//!
//! Any of these calls may grow linear memory. Nothing read from memory
//! before the call is reused after it.

use hostlink_sdk::{
    BridgeError, BridgeResult, ModuleInstance, WasmValue, FREE_EXPORT, MALLOC_EXPORT,
    REALLOC_EXPORT,
};

/// Thin view of a module's allocator exports.
#[derive(Clone, Copy)]
pub struct ModuleAlloc<'a> {
    module: &'a dyn ModuleInstance,
}

impl<'a> ModuleAlloc<'a> {
    /// Wrap a module instance
    pub fn new(module: &'a dyn ModuleInstance) -> Self {
        Self { module }
    }

    /// Allocate `size` bytes; zero-size requests still return a real pointer
    pub fn malloc(&self, size: u32) -> BridgeResult<u32> {
        let ret = self
            .module
            .call_export(MALLOC_EXPORT, &[WasmValue::ptr(size)])?;
        pointer_result(MALLOC_EXPORT, ret)
    }

    /// Grow or shrink an allocation, possibly moving it
    pub fn realloc(&self, ptr: u32, old_size: u32, new_size: u32) -> BridgeResult<u32> {
        let ret = self.module.call_export(
            REALLOC_EXPORT,
            &[
                WasmValue::ptr(ptr),
                WasmValue::ptr(old_size),
                WasmValue::ptr(new_size),
            ],
        )?;
        pointer_result(REALLOC_EXPORT, ret)
    }

    /// Return an allocation to the module
    pub fn free(&self, ptr: u32, size: u32) -> BridgeResult<()> {
        self.module
            .call_export(FREE_EXPORT, &[WasmValue::ptr(ptr), WasmValue::ptr(size)])?;
        Ok(())
    }
}

fn pointer_result(export: &str, ret: Option<WasmValue>) -> BridgeResult<u32> {
    match ret.and_then(|v| v.as_u32()) {
        Some(0) => Err(BridgeError::Allocation(format!("{export} returned null"))),
        Some(ptr) => Ok(ptr),
        None => Err(BridgeError::TypeMismatch {
            expected: "i32 pointer".to_string(),
            got: ret.map_or("nothing", |v| v.type_name()).to_string(),
        }),
    }
}

/// Write consecutive little-endian words starting at `addr`.
pub fn write_words(module: &dyn ModuleInstance, addr: u32, words: &[u32]) -> BridgeResult<()> {
    let memory = module.memory();
    for (i, word) in words.iter().enumerate() {
        memory.write_u32(addr + (i as u32) * 4, *word)?;
    }
    Ok(())
}
