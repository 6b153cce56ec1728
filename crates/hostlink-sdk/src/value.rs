//! WasmValue - the only things that cross the boundary
//!
//! Integers, floats, and handle-typed integers. Multi-value results travel
//! through out-parameter addresses in linear memory instead.

use crate::error::{BridgeError, BridgeResult};
use crate::handle::Handle;

/// A single boundary word.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WasmValue {
    /// 32-bit integer (also pointers and handles)
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl WasmValue {
    /// Wrap a pointer or length
    #[inline]
    pub const fn ptr(p: u32) -> Self {
        WasmValue::I32(p as i32)
    }

    /// Wrap a handle
    #[inline]
    pub const fn handle(h: Handle) -> Self {
        WasmValue::I32(h.as_i32())
    }

    /// Type name for diagnostics
    pub const fn type_name(&self) -> &'static str {
        match self {
            WasmValue::I32(_) => "i32",
            WasmValue::I64(_) => "i64",
            WasmValue::F32(_) => "f32",
            WasmValue::F64(_) => "f64",
        }
    }

    /// Extract i32 value
    #[inline]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            WasmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract an unsigned 32-bit word (pointers, lengths, handles)
    #[inline]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            WasmValue::I32(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// Extract i64 value
    #[inline]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            WasmValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract a float, widening f32
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WasmValue::F64(v) => Some(*v),
            WasmValue::F32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Interpret as a handle
    #[inline]
    pub const fn as_handle(&self) -> Option<Handle> {
        match self.as_u32() {
            Some(raw) => Some(Handle::from_raw(raw)),
            None => None,
        }
    }
}

// ============================================================================
// Conversion traits
// ============================================================================

/// Convert from WasmValue to Rust type.
pub trait FromWasm: Sized {
    /// Convert, returning an error if the word has the wrong type.
    fn from_wasm(value: WasmValue) -> BridgeResult<Self>;
}

/// Convert from Rust type to WasmValue.
pub trait ToWasm {
    /// Convert to a boundary word.
    fn to_wasm(self) -> WasmValue;
}

fn mismatch(expected: &str, value: &WasmValue) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: expected.to_string(),
        got: value.type_name().to_string(),
    }
}

impl FromWasm for i32 {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value.as_i32().ok_or_else(|| mismatch("i32", &value))
    }
}

impl ToWasm for i32 {
    fn to_wasm(self) -> WasmValue {
        WasmValue::I32(self)
    }
}

impl FromWasm for u32 {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value.as_u32().ok_or_else(|| mismatch("i32", &value))
    }
}

impl ToWasm for u32 {
    fn to_wasm(self) -> WasmValue {
        WasmValue::I32(self as i32)
    }
}

impl FromWasm for i64 {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value.as_i64().ok_or_else(|| mismatch("i64", &value))
    }
}

impl ToWasm for i64 {
    fn to_wasm(self) -> WasmValue {
        WasmValue::I64(self)
    }
}

impl FromWasm for f64 {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", &value))
    }
}

impl ToWasm for f64 {
    fn to_wasm(self) -> WasmValue {
        WasmValue::F64(self)
    }
}

impl ToWasm for f32 {
    fn to_wasm(self) -> WasmValue {
        WasmValue::F32(self)
    }
}

impl FromWasm for bool {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value
            .as_i32()
            .map(|v| v != 0)
            .ok_or_else(|| mismatch("i32", &value))
    }
}

impl ToWasm for bool {
    fn to_wasm(self) -> WasmValue {
        WasmValue::I32(self as i32)
    }
}

impl FromWasm for Handle {
    fn from_wasm(value: WasmValue) -> BridgeResult<Self> {
        value.as_handle().ok_or_else(|| mismatch("handle", &value))
    }
}

impl ToWasm for Handle {
    fn to_wasm(self) -> WasmValue {
        WasmValue::handle(self)
    }
}

/// Read argument `index` of an import call as `T`.
///
/// `context` names the import in the error message.
pub fn arg<T: FromWasm>(args: &[WasmValue], index: usize, context: &str) -> BridgeResult<T> {
    let value = args.get(index).ok_or_else(|| {
        BridgeError::ArgumentError(format!(
            "{context} expected at least {} arguments, got {}",
            index + 1,
            args.len()
        ))
    })?;
    T::from_wasm(*value)
}
