//! Core bridge imports
//!
//! Registers the imports every module built against the bridge expects,
//! under the configured namespace. Multi-word results go through a return
//! slot passed as the first argument.

use hostlink_sdk::{
    arg, BridgeError, BridgeResult, Handle, HostValue, ImportRegistry, WasmValue,
};

use crate::bridge::{detached, Bridge};
use crate::closure::{ClosureKind, ClosureSignature, ClosureSpec};
use crate::exception::debug_string;

type CoreImport = fn(&Bridge, &[WasmValue]) -> BridgeResult<Option<WasmValue>>;

/// Names of every core import, in registration order
pub const CORE_IMPORTS: &[&str] = &[
    "string_new",
    "string_get",
    "number_new",
    "number_get",
    "boolean_get",
    "is_undefined",
    "is_null",
    "jsval_eq",
    "instance_of",
    "object_clone_ref",
    "object_drop_ref",
    "cb_drop",
    "cb_forget",
    "closure_wrapper",
    "debug_string",
    "throw",
    "error_new",
    "error_stack",
    "console_error",
];

pub(crate) fn register_core(bridge: &Bridge, registry: &mut ImportRegistry) {
    let namespace = bridge.options().import_module.clone();
    let mut add = |name: &str, import: CoreImport| {
        let weak = bridge.downgrade();
        registry.register(&namespace, name, move |args| {
            let bridge = Bridge::upgrade(&weak).ok_or_else(detached)?;
            import(&bridge, args)
        });
    };
    register_values(&mut add);
    register_refs(&mut add);
    register_errors(&mut add);
}

fn register_values(add: &mut impl FnMut(&str, CoreImport)) {
    add("string_new", string_new);
    add("string_get", string_get);
    add("number_new", number_new);
    add("number_get", number_get);
    add("boolean_get", boolean_get);
    add("is_undefined", is_undefined);
    add("is_null", is_null);
    add("jsval_eq", jsval_eq);
    add("instance_of", instance_of);
}

fn register_refs(add: &mut impl FnMut(&str, CoreImport)) {
    add("object_clone_ref", object_clone_ref);
    add("object_drop_ref", object_drop_ref);
    add("cb_drop", cb_drop);
    add("cb_forget", cb_forget);
    add("closure_wrapper", closure_wrapper);
}

fn register_errors(add: &mut impl FnMut(&str, CoreImport)) {
    add("debug_string", debug_string_import);
    add("throw", throw);
    add("error_new", error_new);
    add("error_stack", error_stack);
    add("console_error", console_error);
}

fn flag(b: bool) -> Option<WasmValue> {
    Some(WasmValue::I32(i32::from(b)))
}

fn handle_result(h: Handle) -> Option<WasmValue> {
    Some(WasmValue::handle(h))
}

// ============================================================================
// Values
// ============================================================================

fn string_new(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ptr: u32 = arg(args, 0, "string_new")?;
    let len: u32 = arg(args, 1, "string_new")?;
    let s = bridge.string_from_module(ptr, len)?;
    Ok(handle_result(bridge.add_object(HostValue::string(s))))
}

/// `[ptr, len]` of the string, or `[0, 0]` if the value is not a string
fn string_get(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ret: u32 = arg(args, 0, "string_get")?;
    let handle: Handle = arg(args, 1, "string_get")?;
    match bridge.get_object(handle)? {
        HostValue::String(s) => bridge.return_string(ret, &s)?,
        _ => {
            let module = bridge.module()?;
            crate::alloc::write_words(module.as_ref(), ret, &[0, 0])?;
        }
    }
    Ok(None)
}

fn number_new(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let n: f64 = arg(args, 0, "number_new")?;
    Ok(handle_result(bridge.add_object(HostValue::number(n))))
}

/// Presence flag at `ret`, the number as an `f64` at `ret + 8`
fn number_get(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ret: u32 = arg(args, 0, "number_get")?;
    let handle: Handle = arg(args, 1, "number_get")?;
    let value = bridge.get_object(handle)?.as_number();
    let module = bridge.module()?;
    let memory = module.memory();
    memory.write(ret + 8, &value.unwrap_or(0.0).to_le_bytes())?;
    memory.write_u32(ret, u32::from(value.is_some()))?;
    Ok(None)
}

/// 1 or 0 for booleans, 2 for anything else
fn boolean_get(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "boolean_get")?;
    let code = match bridge.get_object(handle)?.as_bool() {
        Some(b) => i32::from(b),
        None => 2,
    };
    Ok(Some(WasmValue::I32(code)))
}

fn is_undefined(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "is_undefined")?;
    Ok(flag(bridge.get_object(handle)?.is_undefined()))
}

fn is_null(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "is_null")?;
    Ok(flag(bridge.get_object(handle)?.is_null()))
}

fn jsval_eq(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let a: Handle = arg(args, 0, "jsval_eq")?;
    let b: Handle = arg(args, 1, "jsval_eq")?;
    Ok(flag(bridge.get_object(a)?.strict_eq(&bridge.get_object(b)?)))
}

fn instance_of(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "instance_of")?;
    let ptr: u32 = arg(args, 1, "instance_of")?;
    let len: u32 = arg(args, 2, "instance_of")?;
    let class = bridge.string_from_module(ptr, len)?;
    Ok(flag(bridge.get_object(handle)?.instance_of(&class)))
}

// ============================================================================
// References and closures
// ============================================================================

fn object_clone_ref(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "object_clone_ref")?;
    Ok(handle_result(bridge.clone_ref(handle)?))
}

fn object_drop_ref(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "object_drop_ref")?;
    bridge.drop_object(handle);
    Ok(None)
}

fn cb_drop(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "cb_drop")?;
    Ok(flag(bridge.cb_drop(handle)?))
}

fn cb_forget(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let handle: Handle = arg(args, 0, "cb_forget")?;
    bridge.cb_forget(handle);
    Ok(None)
}

fn closure_wrapper(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let invoke: u32 = arg(args, 0, "closure_wrapper")?;
    let destroy: u32 = arg(args, 1, "closure_wrapper")?;
    let data: u32 = arg(args, 2, "closure_wrapper")?;
    let vtable: u32 = arg(args, 3, "closure_wrapper")?;
    let kind: u32 = arg(args, 4, "closure_wrapper")?;
    let sig: u32 = arg(args, 5, "closure_wrapper")?;

    let table_len = bridge.module()?.table_len();
    for index in [invoke, destroy] {
        if index >= table_len {
            return Err(BridgeError::InvalidTableIndex(index));
        }
    }
    let spec = ClosureSpec {
        data,
        vtable,
        invoke,
        destroy,
        kind: ClosureKind::from_code(kind)?,
        signature: ClosureSignature::from_word(sig)?,
    };
    Ok(handle_result(bridge.make_closure(spec)))
}

// ============================================================================
// Errors and diagnostics
// ============================================================================

fn debug_string_import(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ret: u32 = arg(args, 0, "debug_string")?;
    let handle: Handle = arg(args, 1, "debug_string")?;
    let text = debug_string(&bridge.get_object(handle)?);
    bridge.return_string(ret, &text)?;
    Ok(None)
}

fn throw(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ptr: u32 = arg(args, 0, "throw")?;
    let len: u32 = arg(args, 1, "throw")?;
    let message = bridge.string_from_module(ptr, len)?;
    Err(BridgeError::Thrown(HostValue::error("Error", message)))
}

fn error_new(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ptr: u32 = arg(args, 0, "error_new")?;
    let len: u32 = arg(args, 1, "error_new")?;
    let message = bridge.string_from_module(ptr, len)?;
    Ok(handle_result(bridge.add_object(HostValue::error("Error", message))))
}

/// Stack text of an error value; empty for anything else
fn error_stack(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ret: u32 = arg(args, 0, "error_stack")?;
    let handle: Handle = arg(args, 1, "error_stack")?;
    let value = bridge.get_object(handle)?;
    let stack = value.as_error().map(|e| e.stack().to_string()).unwrap_or_default();
    bridge.return_string(ret, &stack)?;
    Ok(None)
}

fn console_error(bridge: &Bridge, args: &[WasmValue]) -> BridgeResult<Option<WasmValue>> {
    let ptr: u32 = arg(args, 0, "console_error")?;
    let len: u32 = arg(args, 1, "console_error")?;
    let message = bridge.owned_string_from_module(ptr, len)?;
    tracing::error!(target: "hostlink::console", "{message}");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BridgeOptions;

    #[test]
    fn test_core_imports_registered_under_namespace() {
        let options = BridgeOptions {
            import_module: "env".to_string(),
            ..BridgeOptions::default()
        };
        let bridge = Bridge::new(options);
        let registry = bridge.imports();
        for name in CORE_IMPORTS {
            assert!(registry.contains("env", name), "missing {name}");
            assert!(!registry.contains("hostlink", name));
        }
        assert_eq!(registry.len(), CORE_IMPORTS.len());
    }

    #[test]
    fn test_value_imports_without_memory() {
        let bridge = Bridge::new(BridgeOptions::default());
        let registry = bridge.imports();
        let number_new = registry.get("hostlink", "number_new").unwrap();
        let h = number_new(&[WasmValue::F64(2.5)]).unwrap().unwrap();

        let is_null = registry.get("hostlink", "is_null").unwrap();
        assert_eq!(is_null(&[h]).unwrap(), Some(WasmValue::I32(0)));
        assert_eq!(
            is_null(&[WasmValue::handle(Handle::NULL)]).unwrap(),
            Some(WasmValue::I32(1))
        );

        let boolean_get = registry.get("hostlink", "boolean_get").unwrap();
        assert_eq!(
            boolean_get(&[WasmValue::handle(Handle::TRUE)]).unwrap(),
            Some(WasmValue::I32(1))
        );
        assert_eq!(boolean_get(&[h]).unwrap(), Some(WasmValue::I32(2)));

        let clone_ref = registry.get("hostlink", "object_clone_ref").unwrap();
        let h2 = clone_ref(&[h]).unwrap().unwrap();
        let jsval_eq = registry.get("hostlink", "jsval_eq").unwrap();
        assert_eq!(jsval_eq(&[h, h2]).unwrap(), Some(WasmValue::I32(1)));
    }

    #[test]
    fn test_invalid_handle_traps() {
        let bridge = Bridge::new(BridgeOptions::default());
        let registry = bridge.imports();
        let is_undefined = registry.get("hostlink", "is_undefined").unwrap();
        let err = is_undefined(&[WasmValue::I32(99)]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(99)));
    }

    #[test]
    fn test_imports_outliving_bridge_trap() {
        let registry = Bridge::new(BridgeOptions::default()).imports();
        let number_new = registry.get("hostlink", "number_new").unwrap();
        assert!(matches!(
            number_new(&[WasmValue::F64(1.0)]),
            Err(BridgeError::Trap(_))
        ));
    }
}
