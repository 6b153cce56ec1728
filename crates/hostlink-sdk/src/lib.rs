//! Hostlink SDK - boundary vocabulary for module/host bridges
//!
//! This crate provides the types shared by the bridge engine, module
//! engines, and host API collaborators without depending on the engine:
//!
//! - [`Handle`] and the reserved constants
//! - [`WasmValue`], the words that cross the boundary
//! - [`HostValue`], the host object model handles refer to
//! - [`ModuleInstance`] / [`LinearMemory`], what a running module offers
//! - [`ImportRegistry`], name-based dispatch for host imports
//! - [`BridgeError`]

#![warn(missing_docs)]

pub mod error;
pub mod handle;
pub mod host;
pub mod module;
pub mod registry;
pub mod value;

pub use error::{BridgeError, BridgeResult};
pub use handle::Handle;
pub use host::{
    number_to_string, HostCallable, HostError, HostFunction, HostObject, HostResult, HostSymbol,
    HostValue,
};
pub use module::{
    check_bounds, LinearMemory, ModuleInstance, FREE_EXPORT, MALLOC_EXPORT, REALLOC_EXPORT,
    START_EXPORT,
};
pub use registry::{HostImportFn, ImportRegistry};
pub use value::{arg, FromWasm, ToWasm, WasmValue};
