//! Error types for the hostlink boundary

use crate::host::HostValue;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
///
/// Host exceptions that an import is prepared to catch never show up here;
/// they are written to the caller's error slot instead. Everything below
/// unwinds the current module call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A handle that was never allocated, or was already released
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// Access outside the module's linear memory
    #[error("memory access out of bounds: offset {offset} len {len} (memory size {size})")]
    MemoryOutOfBounds {
        /// Start offset of the access
        offset: u32,
        /// Length of the access in bytes
        len: u32,
        /// Current memory size in bytes
        size: usize,
    },

    /// A host value was thrown and nothing on the bridge caught it
    #[error("uncaught host exception: {0}")]
    Thrown(HostValue),

    /// Type mismatch while reading an import argument
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// Wrong arity or otherwise malformed import arguments
    #[error("Argument error: {0}")]
    ArgumentError(String),

    /// Import could not be resolved at link time
    #[error("unresolved import {module}.{name}")]
    UnresolvedImport {
        /// Import namespace
        module: String,
        /// Import name
        name: String,
    },

    /// Module does not export the requested function
    #[error("missing export: {0}")]
    MissingExport(String),

    /// Function table index out of range
    #[error("function table index {0} out of range")]
    InvalidTableIndex(u32),

    /// Closure called re-entrantly where that is forbidden, or after its
    /// module resources were released
    #[error("closure {0} invoked recursively or after being dropped")]
    ClosureDisabled(u64),

    /// Bridge used before a module instance was attached
    #[error("no module instance attached to the bridge")]
    NotInstantiated,

    /// The module's allocator could not satisfy a request
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Module-side trap
    #[error("trap: {0}")]
    Trap(String),
}

impl BridgeError {
    /// The host value carried by a [`BridgeError::Thrown`], if any
    pub fn thrown(&self) -> Option<&HostValue> {
        match self {
            BridgeError::Thrown(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::Trap(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::Trap(s.to_string())
    }
}
