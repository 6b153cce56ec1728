//! Bridge instance
//!
//! Owns every piece of mutable bridge state for one module instance: the
//! handle table, the transcoder's length slot, closure bookkeeping, and the
//! attached module. Nothing here is global; clone a [`Bridge`] to share it.
//!
//! No `RefCell` borrow of bridge state is ever held across a call into the
//! module, because the module may call straight back into the bridge.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use hostlink_sdk::{
    BridgeError, BridgeResult, Handle, HostResult, HostValue, ImportRegistry, ModuleInstance,
    WasmValue,
};

use crate::alloc::ModuleAlloc;
use crate::heap::HandleTable;
use crate::imports;
use crate::options::BridgeOptions;
use crate::transcode::Transcoder;

/// Host import that receives the bridge it was defined on.
pub type BridgeImportFn = Rc<dyn Fn(&Bridge, &[WasmValue]) -> BridgeResult<Option<WasmValue>>>;

pub(crate) struct BridgeInner {
    pub(crate) options: BridgeOptions,
    pub(crate) heap: RefCell<HandleTable>,
    pub(crate) transcoder: Transcoder,
    pub(crate) module: RefCell<Option<Rc<dyn ModuleInstance>>>,
    pub(crate) host_imports: RefCell<Vec<(String, BridgeImportFn)>>,
    pub(crate) started: Cell<bool>,
    pub(crate) next_closure_id: Cell<u64>,
    pub(crate) closures_created: Cell<u64>,
    pub(crate) closures_destroyed: Cell<u64>,
}

/// Snapshot of bridge bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Slots in the handle table, reserved ones included
    pub table_slots: usize,
    /// Leased handles currently live
    pub live_handles: usize,
    /// Trampolines created so far
    pub closures_created: u64,
    /// Trampolines whose module resources have been released
    pub closures_destroyed: u64,
}

/// Handle to a bridge instance. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

impl Bridge {
    /// Create a bridge with no module attached yet
    pub fn new(options: BridgeOptions) -> Self {
        let heap = HandleTable::with_capacity(options.initial_table_capacity);
        let transcoder = Transcoder::new(options.encode_strategy);
        Self {
            inner: Rc::new(BridgeInner {
                options,
                heap: RefCell::new(heap),
                transcoder,
                module: RefCell::new(None),
                host_imports: RefCell::new(Vec::new()),
                started: Cell::new(false),
                next_closure_id: Cell::new(1),
                closures_created: Cell::new(0),
                closures_destroyed: Cell::new(0),
            }),
        }
    }

    /// Options this bridge was built with
    pub fn options(&self) -> &BridgeOptions {
        &self.inner.options
    }

    pub(crate) fn inner(&self) -> &BridgeInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<BridgeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<BridgeInner>) -> Option<Bridge> {
        weak.upgrade().map(|inner| Bridge { inner })
    }

    // ========================================================================
    // Module attachment
    // ========================================================================

    /// Record the instantiated module; every later memory or table access
    /// goes through it
    pub fn attach(&self, instance: Rc<dyn ModuleInstance>) {
        tracing::debug!(
            table_len = instance.table_len(),
            memory_size = instance.memory().size(),
            "module attached to bridge"
        );
        *self.inner.module.borrow_mut() = Some(instance);
    }

    /// Whether a module instance is attached
    pub fn is_attached(&self) -> bool {
        self.inner.module.borrow().is_some()
    }

    /// The attached module
    pub fn module(&self) -> BridgeResult<Rc<dyn ModuleInstance>> {
        self.inner
            .module
            .borrow()
            .clone()
            .ok_or(BridgeError::NotInstantiated)
    }

    /// Invoke the start export. Runs at most once per bridge; returns
    /// whether this call ran it.
    pub fn start(&self) -> BridgeResult<bool> {
        if self.inner.started.get() {
            return Ok(false);
        }
        let module = self.module()?;
        self.inner.started.set(true);
        let export = &self.inner.options.start_export;
        if !module.has_export(export) {
            tracing::debug!(export = %export, "module has no start export");
            return Ok(false);
        }
        module.call_export(export, &[])?;
        Ok(true)
    }

    // ========================================================================
    // Handle table
    // ========================================================================

    /// Install a host value and return its handle
    pub fn add_object(&self, value: HostValue) -> Handle {
        self.inner.heap.borrow_mut().allocate(value)
    }

    /// Install an optional result: `undefined`/`null` become handle 0
    pub fn add_optional(&self, value: HostValue) -> Handle {
        if value.is_like_none() {
            Handle::UNDEFINED
        } else {
            self.add_object(value)
        }
    }

    /// Resolve a handle to (a shared reference of) its value
    pub fn get_object(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.inner
            .heap
            .borrow()
            .get(handle)
            .cloned()
            .ok_or(BridgeError::InvalidHandle(handle.as_raw()))
    }

    /// Resolve and release a handle whose ownership the module hands back
    pub fn take_object(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.inner
            .heap
            .borrow_mut()
            .take(handle)
            .ok_or(BridgeError::InvalidHandle(handle.as_raw()))
    }

    /// Release a handle
    pub fn drop_object(&self, handle: Handle) {
        self.inner.heap.borrow_mut().release(handle);
    }

    /// Allocation stamp of a live handle
    pub(crate) fn object_stamp(&self, handle: Handle) -> Option<u64> {
        self.inner.heap.borrow().stamp(handle)
    }

    /// Release `handle` if it still holds the allocation stamped `stamp`
    pub(crate) fn drop_object_if_stamp(&self, handle: Handle, stamp: u64) -> bool {
        self.inner.heap.borrow_mut().release_if_stamp(handle, stamp)
    }

    /// Install a second owning handle for the same value
    pub fn clone_ref(&self, handle: Handle) -> BridgeResult<Handle> {
        self.inner
            .heap
            .borrow_mut()
            .clone_ref(handle)
            .ok_or(BridgeError::InvalidHandle(handle.as_raw()))
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> BridgeStats {
        let heap = self.inner.heap.borrow();
        BridgeStats {
            table_slots: heap.len(),
            live_handles: heap.live(),
            closures_created: self.inner.closures_created.get(),
            closures_destroyed: self.inner.closures_destroyed.get(),
        }
    }

    // ========================================================================
    // Strings and bytes
    // ========================================================================

    /// Decode a UTF-8 range of module memory
    pub fn string_from_module(&self, ptr: u32, len: u32) -> BridgeResult<String> {
        let module = self.module()?;
        self.inner.transcoder.decode(module.as_ref(), ptr, len)
    }

    /// Decode an optional string argument; a null pointer means absent
    pub fn optional_string_from_module(&self, ptr: u32, len: u32) -> BridgeResult<Option<String>> {
        if ptr == 0 {
            return Ok(None);
        }
        self.string_from_module(ptr, len).map(Some)
    }

    /// Decode a string the module handed over, then free its buffer
    pub fn owned_string_from_module(&self, ptr: u32, len: u32) -> BridgeResult<String> {
        let module = self.module()?;
        let s = self.inner.transcoder.decode(module.as_ref(), ptr, len)?;
        ModuleAlloc::new(module.as_ref()).free(ptr, len)?;
        Ok(s)
    }

    /// Encode a string into module memory; the length is in
    /// [`Bridge::vector_len`]
    pub fn pass_string(&self, s: &str) -> BridgeResult<u32> {
        let module = self.module()?;
        self.inner.transcoder.encode(module.as_ref(), s)
    }

    /// Length written by the most recent encode
    pub fn vector_len(&self) -> u32 {
        self.inner.transcoder.last_len()
    }

    /// Encode a string and write `[ptr, len]` to the return slot at `ret`
    pub fn return_string(&self, ret: u32, s: &str) -> BridgeResult<()> {
        let module = self.module()?;
        self.inner
            .transcoder
            .encode_to_slot(module.as_ref(), s, ret)
    }

    /// Copy a byte range out of module memory
    pub fn bytes_from_module(&self, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        let module = self.module()?;
        self.inner.transcoder.read_bytes(module.as_ref(), ptr, len)
    }

    /// Write host-produced bytes back into a module buffer in place
    pub fn fill_module_bytes(&self, ptr: u32, data: &[u8]) -> BridgeResult<()> {
        let module = self.module()?;
        module.memory().write(ptr, data)
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// Define a host import in the bridge's namespace.
    ///
    /// Imports must be defined before [`Bridge::imports`] is handed to the
    /// module engine.
    pub fn define_import(
        &self,
        name: &str,
        import: impl Fn(&Bridge, &[WasmValue]) -> BridgeResult<Option<WasmValue>> + 'static,
    ) {
        self.inner
            .host_imports
            .borrow_mut()
            .push((name.to_string(), Rc::new(import)));
    }

    /// Build the import object: core bridge imports plus every defined host
    /// import, all under the configured namespace
    pub fn imports(&self) -> ImportRegistry {
        let mut registry = ImportRegistry::new();
        imports::register_core(self, &mut registry);
        let namespace = self.inner.options.import_module.clone();
        for (name, import) in self.inner.host_imports.borrow().iter() {
            let weak = self.downgrade();
            let import = import.clone();
            registry.register(&namespace, name, move |args| {
                let bridge = Bridge::upgrade(&weak).ok_or_else(detached)?;
                import(&bridge, args)
            });
        }
        registry
    }

    // ========================================================================
    // Host-side calls
    // ========================================================================

    /// Invoke a host function value with host arguments
    pub fn call_function(&self, function: &HostValue, args: &[HostValue]) -> HostResult {
        match function.as_function() {
            Some(f) => f.call(args),
            None => Err(HostValue::error(
                "TypeError",
                format!("{} is not a function", function.type_name()),
            )),
        }
    }
}

pub(crate) fn detached() -> BridgeError {
    BridgeError::Trap("bridge instance was dropped".to_string())
}

/// Surface a bridge failure to host code as a thrown value
pub(crate) fn host_error(error: BridgeError) -> HostValue {
    match error {
        BridgeError::Thrown(value) => value,
        other => HostValue::error("RuntimeError", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_take() {
        let bridge = Bridge::new(BridgeOptions::default());
        let h = bridge.add_object(HostValue::string("hello"));
        assert_eq!(bridge.get_object(h).unwrap().as_str(), Some("hello"));
        assert_eq!(bridge.stats().live_handles, 1);
        assert_eq!(bridge.take_object(h).unwrap().as_str(), Some("hello"));
        assert!(matches!(
            bridge.get_object(h),
            Err(BridgeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_add_optional_maps_none_to_zero() {
        let bridge = Bridge::new(BridgeOptions::default());
        assert_eq!(bridge.add_optional(HostValue::Null), Handle::UNDEFINED);
        assert_eq!(bridge.add_optional(HostValue::Undefined), Handle::UNDEFINED);
        assert!(!bridge.add_optional(HostValue::number(0.0)).is_reserved());
    }

    #[test]
    fn test_module_required() {
        let bridge = Bridge::new(BridgeOptions::default());
        assert!(!bridge.is_attached());
        assert!(matches!(
            bridge.string_from_module(0, 0),
            Err(BridgeError::NotInstantiated)
        ));
        assert!(matches!(bridge.start(), Err(BridgeError::NotInstantiated)));
    }

    #[test]
    fn test_call_function_rejects_non_callable() {
        let bridge = Bridge::new(BridgeOptions::default());
        let err = bridge
            .call_function(&HostValue::number(1.0), &[])
            .unwrap_err();
        assert_eq!(err.as_error().unwrap().name(), "TypeError");
    }

    #[test]
    fn test_host_error_unwraps_thrown() {
        let thrown = HostValue::error("Error", "boom");
        let surfaced = host_error(BridgeError::Thrown(thrown.clone()));
        assert!(surfaced.strict_eq(&thrown));
        let trap = host_error(BridgeError::InvalidHandle(9));
        assert_eq!(trap.as_error().unwrap().name(), "RuntimeError");
    }
}
