//! Wasmtime module backend
//!
//! Compiles real WebAssembly modules and runs them behind the
//! [`ModuleInstance`] / [`LinearMemory`] traits:
//!
//! - the exported `memory` is the linear memory
//! - the exported `__indirect_function_table` backs `call_indirect`
//! - every function import is resolved against the [`ImportRegistry`] and
//!   defined on a [`Linker`] as a trampoline into the host
//!
//! Host imports routinely call back into the module (allocation, closure
//! invocation) while the module is suspended inside the import. Those nested
//! calls must go through the import's [`Caller`] rather than the [`Store`],
//! which is exclusively borrowed by the outer call. Each trampoline pushes
//! its caller on a stack for the duration of the import; every instance
//! operation runs against the innermost caller, or against the store when no
//! import is active.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use wasmtime::{
    AsContextMut, Caller, Config, Engine, ExternType, Func, FuncType, Instance, Linker, Memory,
    Module, Ref, Store, StoreContextMut, Table, Val,
};

use hostlink_sdk::{
    check_bounds, BridgeError, BridgeResult, HostImportFn, ImportRegistry, LinearMemory,
    ModuleInstance, WasmValue,
};

use crate::bootstrap::{BootstrapError, CompiledModule, ModuleEngine};

/// Export holding the module's linear memory
pub const MEMORY_EXPORT: &str = "memory";

/// Export holding the module's function table
pub const TABLE_EXPORT: &str = "__indirect_function_table";

const MAX_WASM_STACK: usize = 8 * 1024 * 1024;

/// Compiles WebAssembly with wasmtime
#[derive(Clone)]
pub struct WasmEngine {
    engine: Engine,
}

impl WasmEngine {
    /// Engine with the default configuration
    pub fn new() -> Result<Self, BootstrapError> {
        let mut config = Config::new();
        config.max_wasm_stack(MAX_WASM_STACK);
        Self::with_config(&config)
    }

    /// Engine with a caller-supplied configuration
    pub fn with_config(config: &Config) -> Result<Self, BootstrapError> {
        let engine = Engine::new(config).map_err(|e| BootstrapError::Compile(format!("{e:#}")))?;
        Ok(Self { engine })
    }

    /// The underlying wasmtime engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl ModuleEngine for WasmEngine {
    fn compile(&self, bytes: &[u8]) -> Result<Rc<dyn CompiledModule>, BootstrapError> {
        let module =
            Module::new(&self.engine, bytes).map_err(|e| BootstrapError::Compile(format!("{e:#}")))?;
        tracing::debug!(
            imports = module.imports().len(),
            exports = module.exports().len(),
            "wasm module compiled"
        );
        Ok(Rc::new(WasmModule {
            engine: self.engine.clone(),
            module,
        }))
    }
}

/// A compiled WebAssembly module
pub struct WasmModule {
    engine: Engine,
    module: Module,
}

impl WasmModule {
    /// The underlying wasmtime module
    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl CompiledModule for WasmModule {
    fn instantiate(self: Rc<Self>, imports: &ImportRegistry) -> BridgeResult<Rc<dyn ModuleInstance>> {
        let instance: Rc<dyn ModuleInstance> = WasmInstance::new(&self, imports)?;
        Ok(instance)
    }
}

/// Trampoline bookkeeping shared between an instance and its store
#[derive(Default)]
struct Shared {
    /// Callers of the imports currently executing, innermost last
    callers: RefCell<Vec<NonNull<Caller<'static, StoreData>>>>,
    /// Error raised by the innermost failed import, waiting to be reported
    /// by the export call it unwound through
    pending: RefCell<Option<BridgeError>>,
}

impl Shared {
    fn take_pending(&self) -> Option<BridgeError> {
        self.pending.borrow_mut().take()
    }
}

struct StoreData {
    imports: Vec<HostImportFn>,
    shared: Rc<Shared>,
}

/// Keeps a caller on the stack for the duration of one import call.
struct CallerScope<'a> {
    shared: &'a Shared,
}

impl<'a> CallerScope<'a> {
    fn enter(shared: &'a Shared, caller: &mut Caller<'_, StoreData>) -> Self {
        let ptr = NonNull::from(caller).cast::<Caller<'static, StoreData>>();
        shared.callers.borrow_mut().push(ptr);
        Self { shared }
    }
}

impl Drop for CallerScope<'_> {
    fn drop(&mut self) {
        self.shared.callers.borrow_mut().pop();
    }
}

/// A running WebAssembly instance
pub struct WasmInstance {
    store: RefCell<Store<StoreData>>,
    shared: Rc<Shared>,
    instance: Instance,
    memory: Memory,
    table: Option<Table>,
}

impl WasmInstance {
    /// Link `module` against `imports` and instantiate it
    pub fn new(module: &WasmModule, imports: &ImportRegistry) -> BridgeResult<Rc<Self>> {
        let mut linker = Linker::new(&module.engine);
        let mut resolved = Vec::new();
        for import in module.module.imports() {
            let ExternType::Func(ty) = import.ty() else {
                return Err(BridgeError::UnresolvedImport {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                });
            };
            resolved.push(imports.resolve(import.module(), import.name())?);
            linker
                .func_new(import.module(), import.name(), ty, trampoline(resolved.len() - 1))
                .map_err(|e| BridgeError::Trap(format!("{e:#}")))?;
        }

        let shared = Rc::new(Shared::default());
        let mut store = Store::new(
            &module.engine,
            StoreData {
                imports: resolved,
                shared: shared.clone(),
            },
        );
        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| shared.take_pending().unwrap_or_else(|| trap(e)))?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| BridgeError::MissingExport(MEMORY_EXPORT.to_string()))?;
        let table = instance.get_table(&mut store, TABLE_EXPORT);
        tracing::debug!(
            memory_size = memory.data_size(&store),
            table = table.is_some(),
            "wasm module instantiated"
        );

        Ok(Rc::new(Self {
            store: RefCell::new(store),
            shared,
            instance,
            memory,
            table,
        }))
    }

    /// Run `f` against the innermost active caller, or the store itself
    fn with_context<R>(&self, f: impl FnOnce(StoreContextMut<'_, StoreData>) -> R) -> BridgeResult<R> {
        let top = self.shared.callers.borrow().last().copied();
        match top {
            Some(mut caller) => {
                // SAFETY: the pointer was pushed by a trampoline that owns the
                // `Caller` on its stack and does not touch it until its
                // `CallerScope` pops the pointer. Import calls nest strictly,
                // so the innermost entry is the only live path into the store.
                let caller = unsafe { caller.as_mut() };
                Ok(f(caller.as_context_mut()))
            }
            None => {
                let mut store = self
                    .store
                    .try_borrow_mut()
                    .map_err(|_| BridgeError::Trap("module store is busy".to_string()))?;
                Ok(f(store.as_context_mut()))
            }
        }
    }

    fn call_func(&self, func: Func, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let params: Vec<Val> = args.iter().map(to_val).collect();
        let outcome = self.with_context(|mut cx| {
            let mut results = alloc_results(&func.ty(&cx))?;
            func.call(&mut cx, &params, &mut results)
                .map(|()| results)
                .map_err(|e| self.shared.take_pending().unwrap_or_else(|| trap(e)))
        })??;
        outcome.first().map(from_val).transpose()
    }
}

impl LinearMemory for WasmInstance {
    fn size(&self) -> usize {
        self.with_context(|cx| self.memory.data_size(&cx)).unwrap_or(0)
    }

    fn read(&self, offset: u32, dst: &mut [u8]) -> BridgeResult<()> {
        self.with_context(|cx| {
            let range = check_bounds(offset, dst.len(), self.memory.data_size(&cx))?;
            dst.copy_from_slice(&self.memory.data(&cx)[range]);
            Ok(())
        })?
    }

    fn write(&self, offset: u32, src: &[u8]) -> BridgeResult<()> {
        self.with_context(|mut cx| {
            let range = check_bounds(offset, src.len(), self.memory.data_size(&cx))?;
            self.memory.data_mut(&mut cx)[range].copy_from_slice(src);
            Ok(())
        })?
    }
}

impl ModuleInstance for WasmInstance {
    fn memory(&self) -> &dyn LinearMemory {
        self
    }

    fn call_export(&self, name: &str, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let func = self
            .with_context(|mut cx| self.instance.get_func(&mut cx, name))?
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        self.call_func(func, args)
    }

    fn call_indirect(&self, index: u32, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let table = self.table.ok_or(BridgeError::InvalidTableIndex(index))?;
        let func = self.with_context(|mut cx| match table.get(&mut cx, u64::from(index)) {
            Some(Ref::Func(Some(func))) => Some(func),
            _ => None,
        })?;
        let func = func.ok_or(BridgeError::InvalidTableIndex(index))?;
        self.call_func(func, args)
    }

    fn table_len(&self) -> u32 {
        match self.table {
            Some(table) => self
                .with_context(|cx| u32::try_from(table.size(&cx)).unwrap_or(u32::MAX))
                .unwrap_or(0),
            None => 0,
        }
    }

    fn has_export(&self, name: &str) -> bool {
        self.with_context(|mut cx| self.instance.get_export(&mut cx, name).is_some())
            .unwrap_or(false)
    }
}

/// Host function body for import number `index` of the store
fn trampoline(
    index: usize,
) -> impl Fn(Caller<'_, StoreData>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static
{
    move |mut caller, params, results| {
        let import = caller.data().imports[index].clone();
        let shared = caller.data().shared.clone();
        let args = params
            .iter()
            .map(from_val)
            .collect::<BridgeResult<Vec<_>>>()
            .map_err(|e| wasmtime::Error::msg(e.to_string()))?;

        let outcome = {
            let _scope = CallerScope::enter(&shared, &mut caller);
            import(&args)
        };
        match outcome {
            Ok(ret) => {
                if let (Some(slot), Some(value)) = (results.first_mut(), ret) {
                    *slot = to_val(&value);
                }
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                *shared.pending.borrow_mut() = Some(error);
                Err(wasmtime::Error::msg(message))
            }
        }
    }
}

fn alloc_results(ty: &FuncType) -> BridgeResult<Vec<Val>> {
    ty.results()
        .map(|val_ty| {
            Val::default_for_ty(&val_ty).ok_or_else(|| BridgeError::TypeMismatch {
                expected: "numeric result".to_string(),
                got: format!("{val_ty:?}"),
            })
        })
        .collect()
}

fn to_val(value: &WasmValue) -> Val {
    match *value {
        WasmValue::I32(v) => Val::I32(v),
        WasmValue::I64(v) => Val::I64(v),
        WasmValue::F32(v) => Val::F32(v.to_bits()),
        WasmValue::F64(v) => Val::F64(v.to_bits()),
    }
}

fn from_val(value: &Val) -> BridgeResult<WasmValue> {
    match *value {
        Val::I32(v) => Ok(WasmValue::I32(v)),
        Val::I64(v) => Ok(WasmValue::I64(v)),
        Val::F32(bits) => Ok(WasmValue::F32(f32::from_bits(bits))),
        Val::F64(bits) => Ok(WasmValue::F64(f64::from_bits(bits))),
        _ => Err(BridgeError::TypeMismatch {
            expected: "numeric value".to_string(),
            got: "reference".to_string(),
        }),
    }
}

fn trap(error: wasmtime::Error) -> BridgeError {
    BridgeError::Trap(format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        for value in [
            WasmValue::I32(-7),
            WasmValue::I64(1 << 40),
            WasmValue::F32(1.5),
            WasmValue::F64(-0.25),
        ] {
            assert_eq!(from_val(&to_val(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_compile_rejects_garbage() {
        let engine = WasmEngine::new().unwrap();
        assert!(matches!(
            engine.compile(b"\0hlkdemo"),
            Err(BootstrapError::Compile(_))
        ));
    }

    #[test]
    fn test_missing_memory_export() {
        let engine = WasmEngine::new().unwrap();
        let compiled = engine.compile(br#"(module (func (export "f")))"#).unwrap();
        let err = compiled.instantiate(&ImportRegistry::new()).err().unwrap();
        assert!(matches!(err, BridgeError::MissingExport(name) if name == MEMORY_EXPORT));
    }
}
