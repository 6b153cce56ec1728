//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use hostlink_engine::{
    Bridge, BridgeOptions, BridgeResult, ClosureKind, ClosureSignature, ClosureSpec,
    EncodeStrategy, NativeInstance, NativeModule, WasmValue,
};

/// Namespace every fixture module imports from
pub const NS: &str = "hostlink";

/// Environment pointer the fixtures hand to closures
pub const DATA: u32 = 64;

/// Vtable pointer the fixtures hand to closures
pub const VTABLE: u32 = 8;

/// Install a test subscriber once; output shows up with `--nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bridge() -> Bridge {
    Bridge::new(BridgeOptions::default())
}

pub fn bridge_with(strategy: EncodeStrategy) -> Bridge {
    Bridge::new(BridgeOptions {
        encode_strategy: strategy,
        ..BridgeOptions::default()
    })
}

/// Instantiate `module` against the bridge's imports and attach it
pub fn attach(bridge: &Bridge, module: NativeModule) -> Rc<NativeInstance> {
    init_tracing();
    let instance = Rc::new(module)
        .instantiate_native(&bridge.imports())
        .expect("fixture module instantiates");
    bridge.attach(instance.clone());
    instance
}

/// Ordered record of what module code ran
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Table indices of the closure fixture
pub const INVOKE: u32 = 0;
pub const DESTROY: u32 = 1;

/// Module with a closure invoke entry at [`INVOKE`] and a destructor at
/// [`DESTROY`]. The invoke entry logs, then releases every handle argument
/// it was given.
pub fn closure_module(log: &Log) -> NativeModule {
    let mut module = NativeModule::new("closures");
    module.import(NS, "object_drop_ref");

    let invoke_log = log.clone();
    module.table_entry(move |inst, args| {
        invoke_log.push(format!("invoke:{}", args[0].as_u32().unwrap_or(0)));
        for handle in &args[2..] {
            inst.call_import(NS, "object_drop_ref", &[*handle])?;
        }
        Ok(None)
    });

    let destroy_log = log.clone();
    module.table_entry(move |_, args| {
        destroy_log.push(format!("destroy:{}", args[0].as_u32().unwrap_or(0)));
        Ok(None)
    });
    module
}

pub fn spec(kind: ClosureKind, signature: ClosureSignature) -> ClosureSpec {
    ClosureSpec {
        data: DATA,
        vtable: VTABLE,
        invoke: INVOKE,
        destroy: DESTROY,
        kind,
        signature,
    }
}

/// Read a `[ptr, len]` return slot written by the bridge
pub fn read_slot_string(instance: &NativeInstance, ret: u32) -> String {
    instance.read_string_pair(ret).expect("return slot readable")
}

/// Allocate a string in module memory and call `import` with `(ptr, len)`
pub fn call_with_string(
    instance: &NativeInstance,
    import: &str,
    s: &str,
) -> BridgeResult<Option<WasmValue>> {
    call_with_string_in(instance, NS, import, s)
}

/// [`call_with_string`] for an import in another namespace
pub fn call_with_string_in(
    instance: &NativeInstance,
    namespace: &str,
    import: &str,
    s: &str,
) -> BridgeResult<Option<WasmValue>> {
    let (ptr, len) = instance.alloc_bytes(s.as_bytes())?;
    instance.call_import(namespace, import, &[WasmValue::ptr(ptr), WasmValue::ptr(len)])
}
