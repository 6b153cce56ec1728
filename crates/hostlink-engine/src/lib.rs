//! Hostlink Engine
//!
//! The bridge between a sandboxed linear-memory module and a host object
//! environment:
//! - **Handle table**: host values the module refers to by integer (`heap`)
//! - **Transcoder**: UTF-8 strings in and out of module memory (`transcode`)
//! - **Closures**: host-callable trampolines over module closures with
//!   counted ownership (`closure`)
//! - **Exceptions**: error slots and debug rendering (`exception`)
//! - **Bootstrap**: instantiation with streaming fallback (`bootstrap`)
//! - **Native modules**: an in-process module backend (`native`)
//! - **WebAssembly**: a wasmtime module backend (`wasm`)
//!
//! # Example
//!
//! ```rust,ignore
//! use hostlink_engine::{Bootstrap, Bridge, BridgeOptions, NativeEngine, NativeModule};
//!
//! let engine = NativeEngine::new();
//! let image = engine.register(NativeModule::new("app"));
//!
//! let bridge = Bridge::new(BridgeOptions::default());
//! bridge.define_import("now", |_bridge, _args| Ok(Some(WasmValue::F64(0.0))));
//! Bootstrap::new(&engine).init(&bridge, image)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod bootstrap;
pub mod bridge;
pub mod closure;
pub mod exception;
pub mod heap;
pub mod imports;
pub mod native;
pub mod options;
pub mod transcode;
pub mod wasm;

pub use bootstrap::{
    Bootstrap, BootstrapError, CompiledModule, FileFetcher, Fetcher, HttpFetcher,
    InstantiationPath, LocatorFetcher, ModuleEngine, ModuleSource, Response,
};
pub use bridge::{Bridge, BridgeImportFn, BridgeStats};
pub use closure::{
    closure_record, ClosureKind, ClosureRecord, ClosureSignature, ClosureSpec, ParamAbi, ReturnAbi,
};
pub use exception::{debug_string, ErrorSlot, ERROR_FLAG};
pub use heap::HandleTable;
pub use imports::CORE_IMPORTS;
pub use native::{NativeEngine, NativeFn, NativeInstance, NativeModule, VecMemory, PAGE_SIZE};
pub use options::{BridgeOptions, EncodeStrategy, OptionsError};
pub use transcode::Transcoder;
pub use wasm::{WasmEngine, WasmInstance, WasmModule};

pub use hostlink_sdk::{
    BridgeError, BridgeResult, Handle, HostError, HostResult, HostValue, ImportRegistry,
    LinearMemory, ModuleInstance, WasmValue, START_EXPORT,
};
