//! Import registry (name-based dispatch)
//!
//! Holds the host functions a module may import, keyed by
//! `(namespace, name)`. The bridge fills it with its core imports;
//! collaborators add the host API surface. An engine resolves a module's
//! declared imports against it at link time.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{BridgeError, BridgeResult};
use crate::value::WasmValue;

/// A host import callable from module code.
pub type HostImportFn = Rc<dyn Fn(&[WasmValue]) -> BridgeResult<Option<WasmValue>>>;

/// Registry of host imports indexed by namespace and name.
#[derive(Clone, Default)]
pub struct ImportRegistry {
    imports: FxHashMap<(String, String), HostImportFn>,
}

impl ImportRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            imports: FxHashMap::default(),
        }
    }

    /// Register an import; a later registration under the same name wins
    pub fn register(
        &mut self,
        module: &str,
        name: &str,
        import: impl Fn(&[WasmValue]) -> BridgeResult<Option<WasmValue>> + 'static,
    ) {
        self.imports
            .insert((module.to_string(), name.to_string()), Rc::new(import));
    }

    /// Register an already shared import
    pub fn register_shared(&mut self, module: &str, name: &str, import: HostImportFn) {
        self.imports
            .insert((module.to_string(), name.to_string()), import);
    }

    /// Get an import by namespace and name
    pub fn get(&self, module: &str, name: &str) -> Option<HostImportFn> {
        self.imports
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    /// Resolve an import or fail with [`BridgeError::UnresolvedImport`]
    pub fn resolve(&self, module: &str, name: &str) -> BridgeResult<HostImportFn> {
        self.get(module, name)
            .ok_or_else(|| BridgeError::UnresolvedImport {
                module: module.to_string(),
                name: name.to_string(),
            })
    }

    /// Check if an import is registered
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.imports
            .contains_key(&(module.to_string(), name.to_string()))
    }

    /// All imports in one namespace
    pub fn namespace(&self, module: &str) -> FxHashMap<String, HostImportFn> {
        self.imports
            .iter()
            .filter(|((m, _), _)| m == module)
            .map(|((_, name), f)| (name.clone(), f.clone()))
            .collect()
    }

    /// Get the number of registered imports
    pub fn len(&self) -> usize {
        self.imports.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }
}

impl std::fmt::Debug for ImportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportRegistry")
            .field("count", &self.imports.len())
            .finish()
    }
}
