//! In-process module backend
//!
//! A [`NativeModule`] is a module whose exports and function table are Rust
//! closures running against a byte-vector linear memory. It speaks the same
//! boundary as a compiled module: words in, words out, imports resolved by
//! `(namespace, name)` at instantiation, allocation through the
//! `__hostlink_malloc` / `__hostlink_realloc` / `__hostlink_free` exports.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut module = NativeModule::new("demo");
//! module.import("hostlink", "string_new");
//! module.export("greet", |inst, _args| {
//!     let (ptr, len) = inst.alloc_bytes(b"hi")?;
//!     inst.call_import("hostlink", "string_new", &[WasmValue::ptr(ptr), WasmValue::ptr(len)])
//! });
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use hostlink_sdk::{
    arg, check_bounds, BridgeError, BridgeResult, ImportRegistry, LinearMemory, ModuleInstance,
    WasmValue, FREE_EXPORT, MALLOC_EXPORT, REALLOC_EXPORT,
};

use crate::bootstrap::{BootstrapError, CompiledModule, ModuleEngine, Response};

/// Linear memory page size
pub const PAGE_SIZE: usize = 64 * 1024;

/// Prefix of a native module image
pub const NATIVE_MAGIC: &[u8; 4] = b"\0hlk";

const ALIGN: u32 = 8;

/// Export or table entry of a native module
pub type NativeFn = Rc<dyn Fn(&NativeInstance, &[WasmValue]) -> BridgeResult<Option<WasmValue>>>;

/// Module definition: exports, function table, declared imports, and
/// initial memory layout.
pub struct NativeModule {
    name: String,
    initial_pages: u32,
    heap_base: u32,
    exports: FxHashMap<String, NativeFn>,
    table: Vec<NativeFn>,
    imports: Vec<(String, String)>,
    data: Vec<(u32, Vec<u8>)>,
}

impl NativeModule {
    /// Create an empty module with one page of memory
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_pages: 1,
            heap_base: 1024,
            exports: FxHashMap::default(),
            table: Vec::new(),
            imports: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the initial memory size in pages
    pub fn pages(&mut self, pages: u32) -> &mut Self {
        self.initial_pages = pages.max(1);
        self
    }

    /// Set the first address the allocator hands out
    pub fn heap_base(&mut self, base: u32) -> &mut Self {
        self.heap_base = base.max(ALIGN);
        self
    }

    /// Register an export
    pub fn export(
        &mut self,
        name: impl Into<String>,
        func: impl Fn(&NativeInstance, &[WasmValue]) -> BridgeResult<Option<WasmValue>> + 'static,
    ) -> &mut Self {
        self.exports.insert(name.into(), Rc::new(func));
        self
    }

    /// Append a function-table entry and return its index
    pub fn table_entry(
        &mut self,
        func: impl Fn(&NativeInstance, &[WasmValue]) -> BridgeResult<Option<WasmValue>> + 'static,
    ) -> u32 {
        self.table.push(Rc::new(func));
        (self.table.len() - 1) as u32
    }

    /// Declare an import that must resolve at instantiation
    pub fn import(&mut self, module: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.imports.push((module.into(), name.into()));
        self
    }

    /// Initialize memory at `offset` with `bytes`
    pub fn data(&mut self, offset: u32, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.data.push((offset, bytes.into()));
        self
    }

    /// Resolve imports and build a running instance
    pub fn instantiate_native(self: &Rc<Self>, imports: &ImportRegistry) -> BridgeResult<Rc<NativeInstance>> {
        for (module, name) in &self.imports {
            imports.resolve(module, name)?;
        }
        let memory = VecMemory::new(self.initial_pages);
        for (offset, bytes) in &self.data {
            memory.write(*offset, bytes)?;
        }
        tracing::debug!(
            module = %self.name,
            pages = self.initial_pages,
            exports = self.exports.len(),
            table = self.table.len(),
            "native module instantiated"
        );
        Ok(Rc::new(NativeInstance {
            module: self.clone(),
            memory,
            allocator: RefCell::new(Allocator::new(self.heap_base)),
            imports: imports.clone(),
        }))
    }
}

impl CompiledModule for NativeModule {
    fn instantiate(self: Rc<Self>, imports: &ImportRegistry) -> BridgeResult<Rc<dyn ModuleInstance>> {
        let instance: Rc<dyn ModuleInstance> = self.instantiate_native(imports)?;
        Ok(instance)
    }
}

/// Byte-vector linear memory that grows in whole pages
pub struct VecMemory {
    bytes: RefCell<Vec<u8>>,
}

impl VecMemory {
    /// Zeroed memory of `pages` pages
    pub fn new(pages: u32) -> Self {
        Self {
            bytes: RefCell::new(vec![0; pages as usize * PAGE_SIZE]),
        }
    }

    /// Grow so that at least `end` bytes are addressable
    pub fn ensure(&self, end: usize) {
        let mut bytes = self.bytes.borrow_mut();
        if end > bytes.len() {
            let pages = end.div_ceil(PAGE_SIZE);
            bytes.resize(pages * PAGE_SIZE, 0);
        }
    }
}

impl LinearMemory for VecMemory {
    fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    fn read(&self, offset: u32, dst: &mut [u8]) -> BridgeResult<()> {
        let bytes = self.bytes.borrow();
        let range = check_bounds(offset, dst.len(), bytes.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, offset: u32, src: &[u8]) -> BridgeResult<()> {
        let mut bytes = self.bytes.borrow_mut();
        let range = check_bounds(offset, src.len(), bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }
}

/// Bump allocator with exact-size free lists
struct Allocator {
    top: u32,
    free: FxHashMap<u32, Vec<u32>>,
}

impl Allocator {
    fn new(base: u32) -> Self {
        Self {
            top: round_up(base),
            free: FxHashMap::default(),
        }
    }

    fn malloc(&mut self, size: u32) -> u32 {
        let size = block_size(size);
        if let Some(ptr) = self.free.get_mut(&size).and_then(Vec::pop) {
            return ptr;
        }
        let ptr = self.top;
        self.top += size;
        ptr
    }

    fn free(&mut self, ptr: u32, size: u32) {
        if ptr == 0 {
            return;
        }
        let size = block_size(size);
        if ptr + size == self.top {
            self.top = ptr;
        } else {
            self.free.entry(size).or_default().push(ptr);
        }
    }
}

fn round_up(n: u32) -> u32 {
    n.div_ceil(ALIGN) * ALIGN
}

fn block_size(size: u32) -> u32 {
    round_up(size.max(1))
}

/// Running native module
pub struct NativeInstance {
    module: Rc<NativeModule>,
    memory: VecMemory,
    allocator: RefCell<Allocator>,
    imports: ImportRegistry,
}

impl NativeInstance {
    /// Module this instance was created from
    pub fn module(&self) -> &NativeModule {
        &self.module
    }

    /// Call a resolved import
    pub fn call_import(&self, module: &str, name: &str, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let import = self.imports.resolve(module, name)?;
        import(args)
    }

    /// Allocate from the module heap, growing memory as needed
    pub fn malloc(&self, size: u32) -> u32 {
        let ptr = self.allocator.borrow_mut().malloc(size);
        self.memory.ensure((ptr + block_size(size)) as usize);
        ptr
    }

    /// Resize an allocation, moving it if it cannot grow in place
    pub fn realloc(&self, ptr: u32, old_size: u32, new_size: u32) -> BridgeResult<u32> {
        let (old_block, new_block) = (block_size(old_size), block_size(new_size));
        if new_block <= old_block {
            return Ok(ptr);
        }
        {
            let mut alloc = self.allocator.borrow_mut();
            if ptr + old_block == alloc.top {
                alloc.top = ptr + new_block;
                drop(alloc);
                self.memory.ensure((ptr + new_block) as usize);
                return Ok(ptr);
            }
        }
        let moved = self.malloc(new_size);
        let old = self.memory.read_vec(ptr, old_size.min(new_size))?;
        self.memory.write(moved, &old)?;
        self.free(ptr, old_size);
        Ok(moved)
    }

    /// Return an allocation to the heap
    pub fn free(&self, ptr: u32, size: u32) {
        self.allocator.borrow_mut().free(ptr, size);
    }

    /// Copy bytes into a fresh allocation; returns `(ptr, len)`
    pub fn alloc_bytes(&self, bytes: &[u8]) -> BridgeResult<(u32, u32)> {
        let len = bytes.len() as u32;
        let ptr = self.malloc(len);
        self.memory.write(ptr, bytes)?;
        Ok((ptr, len))
    }

    /// Read a `[ptr, len]` pair at `addr` and decode the string it points to
    pub fn read_string_pair(&self, addr: u32) -> BridgeResult<String> {
        let ptr = self.memory.read_u32(addr)?;
        let len = self.memory.read_u32(addr + 4)?;
        let bytes = self.memory.read_vec(ptr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Bytes handed out by the allocator so far, free blocks included
    pub fn heap_top(&self) -> u32 {
        self.allocator.borrow().top
    }

    fn builtin(&self, name: &str, args: &[WasmValue]) -> Option<BridgeResult<Option<WasmValue>>> {
        match name {
            MALLOC_EXPORT => Some(self.malloc_export(args)),
            REALLOC_EXPORT => Some(self.realloc_export(args)),
            FREE_EXPORT => Some(self.free_export(args)),
            _ => None,
        }
    }

    fn malloc_export(&self, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let size: u32 = arg(args, 0, MALLOC_EXPORT)?;
        Ok(Some(WasmValue::ptr(self.malloc(size))))
    }

    fn realloc_export(&self, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let ptr: u32 = arg(args, 0, REALLOC_EXPORT)?;
        let old: u32 = arg(args, 1, REALLOC_EXPORT)?;
        let new: u32 = arg(args, 2, REALLOC_EXPORT)?;
        Ok(Some(WasmValue::ptr(self.realloc(ptr, old, new)?)))
    }

    fn free_export(&self, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let ptr: u32 = arg(args, 0, FREE_EXPORT)?;
        let size: u32 = arg(args, 1, FREE_EXPORT)?;
        self.free(ptr, size);
        Ok(None)
    }
}

impl ModuleInstance for NativeInstance {
    fn memory(&self) -> &dyn LinearMemory {
        &self.memory
    }

    fn call_export(&self, name: &str, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        if let Some(result) = self.builtin(name, args) {
            return result;
        }
        let func = self
            .module
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        func(self, args)
    }

    fn call_indirect(&self, index: u32, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
        let func = self
            .module
            .table
            .get(index as usize)
            .cloned()
            .ok_or(BridgeError::InvalidTableIndex(index))?;
        func(self, args)
    }

    fn table_len(&self) -> u32 {
        self.module.table.len() as u32
    }

    fn has_export(&self, name: &str) -> bool {
        matches!(name, MALLOC_EXPORT | REALLOC_EXPORT | FREE_EXPORT)
            || self.module.exports.contains_key(name)
    }
}

/// Engine that "compiles" native module images.
///
/// An image is [`NATIVE_MAGIC`] followed by the UTF-8 name of a module
/// registered with [`NativeEngine::register`].
#[derive(Default)]
pub struct NativeEngine {
    modules: RefCell<FxHashMap<String, Rc<NativeModule>>>,
    streaming: bool,
}

impl NativeEngine {
    /// Engine without streaming support
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that accepts streaming instantiation
    pub fn with_streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    /// Register a module and return its image bytes
    pub fn register(&self, module: NativeModule) -> Vec<u8> {
        let image = Self::image(module.name());
        self.modules
            .borrow_mut()
            .insert(module.name.clone(), Rc::new(module));
        image
    }

    /// Image bytes for a module name
    pub fn image(name: &str) -> Vec<u8> {
        let mut bytes = NATIVE_MAGIC.to_vec();
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    fn lookup(&self, bytes: &[u8]) -> Result<Rc<NativeModule>, BootstrapError> {
        let name = bytes
            .strip_prefix(NATIVE_MAGIC.as_slice())
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .ok_or_else(|| BootstrapError::Compile("not a native module image".to_string()))?;
        self.modules
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| BootstrapError::Compile(format!("unknown native module {name:?}")))
    }
}

impl ModuleEngine for NativeEngine {
    fn compile(&self, bytes: &[u8]) -> Result<Rc<dyn CompiledModule>, BootstrapError> {
        let module: Rc<dyn CompiledModule> = self.lookup(bytes)?;
        Ok(module)
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn instantiate_streaming(
        &self,
        response: &Response,
        imports: &ImportRegistry,
    ) -> Result<Rc<dyn ModuleInstance>, BootstrapError> {
        if !self.streaming {
            return Err(BootstrapError::StreamingUnsupported);
        }
        let module = self.lookup(&response.body)?;
        Ok(module.instantiate(imports)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(module: NativeModule) -> Rc<NativeInstance> {
        Rc::new(module).instantiate_native(&ImportRegistry::new()).unwrap()
    }

    #[test]
    fn test_malloc_is_aligned_and_non_null() {
        let inst = instance(NativeModule::new("m"));
        let a = inst.malloc(0);
        let b = inst.malloc(3);
        assert_ne!(a, 0);
        assert_eq!(a % ALIGN, 0);
        assert_eq!(b, a + ALIGN);
    }

    #[test]
    fn test_free_reuses_exact_size_block() {
        let inst = instance(NativeModule::new("m"));
        let a = inst.malloc(16);
        let _b = inst.malloc(16);
        inst.free(a, 16);
        assert_eq!(inst.malloc(16), a);
    }

    #[test]
    fn test_realloc_in_place_at_top() {
        let inst = instance(NativeModule::new("m"));
        let a = inst.malloc(4);
        assert_eq!(inst.realloc(a, 4, 64).unwrap(), a);
        assert_eq!(inst.heap_top(), a + 64);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let inst = instance(NativeModule::new("m"));
        let (a, _) = inst.alloc_bytes(b"abcd").unwrap();
        let _fence = inst.malloc(8);
        let moved = inst.realloc(a, 4, 32).unwrap();
        assert_ne!(moved, a);
        assert_eq!(inst.memory().read_vec(moved, 4).unwrap(), b"abcd");
    }

    #[test]
    fn test_memory_grows_past_initial_pages() {
        let inst = instance(NativeModule::new("m"));
        let size = inst.memory().size();
        let ptr = inst.malloc(PAGE_SIZE as u32 * 2);
        assert!(inst.memory().size() > size);
        inst.memory().write(ptr + PAGE_SIZE as u32, &[1]).unwrap();
    }

    #[test]
    fn test_out_of_bounds_access() {
        let memory = VecMemory::new(1);
        let err = memory.write(PAGE_SIZE as u32 - 1, &[0, 0]).unwrap_err();
        assert!(matches!(err, BridgeError::MemoryOutOfBounds { .. }));
    }

    #[test]
    fn test_unresolved_import_fails_instantiation() {
        let mut module = NativeModule::new("m");
        module.import("hostlink", "string_new");
        let err = Rc::new(module)
            .instantiate_native(&ImportRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::UnresolvedImport { .. }));
    }

    #[test]
    fn test_exports_and_table() {
        let mut module = NativeModule::new("m");
        module.export("answer", |_, _| Ok(Some(WasmValue::I32(42))));
        let idx = module.table_entry(|_, args| Ok(args.first().copied()));
        let inst = instance(module);
        assert!(inst.has_export("answer"));
        assert!(inst.has_export(MALLOC_EXPORT));
        assert_eq!(inst.call_export("answer", &[]).unwrap(), Some(WasmValue::I32(42)));
        assert_eq!(
            inst.call_indirect(idx, &[WasmValue::I32(7)]).unwrap(),
            Some(WasmValue::I32(7))
        );
        assert!(matches!(
            inst.call_indirect(5, &[]),
            Err(BridgeError::InvalidTableIndex(5))
        ));
        assert!(matches!(
            inst.call_export("nope", &[]),
            Err(BridgeError::MissingExport(_))
        ));
    }

    #[test]
    fn test_engine_images() {
        let engine = NativeEngine::new();
        let image = engine.register(NativeModule::new("demo"));
        assert!(image.starts_with(NATIVE_MAGIC));
        assert!(engine.compile(&image).is_ok());
        assert!(engine.compile(b"\0asm").is_err());
        assert!(engine.compile(&NativeEngine::image("other")).is_err());
    }
}
