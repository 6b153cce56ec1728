//! Error slots, thrown values, and diagnostics

mod common;

use common::NS;
use hostlink_engine::{
    Bridge, BridgeError, ErrorSlot, HostError, HostValue, LinearMemory, ModuleInstance,
    NativeModule, WasmValue, ERROR_FLAG,
};

const SENTINEL: u32 = 0xdead_beef;

fn slot_with_sentinel(instance: &hostlink_engine::NativeInstance) -> u32 {
    let exnptr = instance.malloc(8);
    instance.memory().write_u32(exnptr, SENTINEL).unwrap();
    instance.memory().write_u32(exnptr + 4, SENTINEL).unwrap();
    exnptr
}

/// Bridge with a catching `parse_int` host import
fn parse_bridge() -> Bridge {
    let bridge = common::bridge();
    bridge.define_import("parse_int", |bridge, args| {
        let exnptr = args[0].as_u32().unwrap_or(0);
        let ptr = args[1].as_u32().unwrap_or(0);
        let len = args[2].as_u32().unwrap_or(0);
        let text = bridge.string_from_module(ptr, len)?;
        bridge.catching(exnptr, WasmValue::I32(0), |_| {
            text.trim()
                .parse::<i32>()
                .map(|n| Some(WasmValue::I32(n)))
                .map_err(|e| HostValue::error("SyntaxError", e.to_string()))
        })
    });
    bridge
}

fn call_parse(instance: &hostlink_engine::NativeInstance, exnptr: u32, text: &str) -> i32 {
    let (ptr, len) = instance.alloc_bytes(text.as_bytes()).unwrap();
    instance
        .call_import(
            NS,
            "parse_int",
            &[WasmValue::ptr(exnptr), WasmValue::ptr(ptr), WasmValue::ptr(len)],
        )
        .unwrap()
        .and_then(|v| v.as_i32())
        .unwrap()
}

#[test]
fn test_success_leaves_slot_untouched() {
    let bridge = parse_bridge();
    let instance = common::attach(&bridge, NativeModule::new("parse"));
    let exnptr = slot_with_sentinel(&instance);

    assert_eq!(call_parse(&instance, exnptr, " 42 "), 42);
    assert_eq!(instance.memory().read_u32(exnptr).unwrap(), SENTINEL);
    assert_eq!(instance.memory().read_u32(exnptr + 4).unwrap(), SENTINEL);
    assert_eq!(bridge.stats().live_handles, 0);
}

#[test]
fn test_failure_writes_flag_and_handle() {
    let bridge = parse_bridge();
    let instance = common::attach(&bridge, NativeModule::new("parse"));
    let exnptr = slot_with_sentinel(&instance);

    assert_eq!(call_parse(&instance, exnptr, "forty-two"), 0);
    assert_eq!(instance.memory().read_u32(exnptr).unwrap(), ERROR_FLAG);
    let handle = ErrorSlot::at(exnptr).read(&bridge).unwrap().unwrap();
    let error = bridge.get_object(handle).unwrap();
    assert_eq!(error.as_error().unwrap().name(), "SyntaxError");
}

#[test]
fn test_check_error_slot_rethrows_and_releases() {
    let bridge = parse_bridge();
    let instance = common::attach(&bridge, NativeModule::new("parse"));
    let exnptr = instance.malloc(8);
    let slot = ErrorSlot::at(exnptr);
    slot.clear(&bridge).unwrap();

    assert!(bridge.check_error_slot(slot).is_ok());
    call_parse(&instance, exnptr, "x");
    let err = bridge.check_error_slot(slot).unwrap_err();
    let thrown = err.thrown().unwrap();
    assert_eq!(thrown.as_error().unwrap().name(), "SyntaxError");
    assert_eq!(bridge.stats().live_handles, 0);
}

#[test]
fn test_thrown_identity_survives_the_slot() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("identity"));
    let exnptr = slot_with_sentinel(&instance);
    let thrown = HostValue::plain_object([("code", HostValue::number(7.0))]);

    let expected = thrown.clone();
    let ret = bridge
        .catching(exnptr, WasmValue::I32(-1), move |_| Err(thrown))
        .unwrap();
    assert_eq!(ret, Some(WasmValue::I32(-1)));
    let handle = ErrorSlot::at(exnptr).read(&bridge).unwrap().unwrap();
    assert!(bridge.get_object(handle).unwrap().strict_eq(&expected));
}

#[test]
fn test_invalid_handle_is_a_trap_not_a_slot_write() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("trap"));
    let exnptr = slot_with_sentinel(&instance);

    let err = instance
        .call_import(NS, "is_null", &[WasmValue::I32(500)])
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidHandle(500)));
    assert_eq!(instance.memory().read_u32(exnptr).unwrap(), SENTINEL);
}

#[test]
fn test_throw_import() {
    let bridge = common::bridge();
    let mut module = NativeModule::new("throws");
    module.export("fail", |inst, _| common::call_with_string(inst, "throw", "boom"));
    let instance = common::attach(&bridge, module);

    let err = instance.call_export("fail", &[]).unwrap_err();
    match err {
        BridgeError::Thrown(value) => {
            let e = value.as_error().unwrap();
            assert_eq!(e.name(), "Error");
            assert_eq!(e.message(), "boom");
        }
        other => panic!("expected thrown error, got {other:?}"),
    }
}

#[test]
fn test_error_new_and_stack_imports() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("errors"));

    let h = common::call_with_string(&instance, "error_new", "made by module")
        .unwrap()
        .unwrap();
    let value = bridge.get_object(h.as_handle().unwrap()).unwrap();
    assert_eq!(value.as_error().unwrap().message(), "made by module");

    let with_stack = bridge.add_object(HostValue::from_error(
        HostError::new("Error", "x").with_stack("at frame (app.js:1:1)"),
    ));
    let ret = instance.malloc(8);
    instance
        .call_import(NS, "error_stack", &[WasmValue::ptr(ret), WasmValue::handle(with_stack)])
        .unwrap();
    assert_eq!(
        common::read_slot_string(&instance, ret),
        "at frame (app.js:1:1)"
    );
}

#[test]
fn test_console_error_consumes_string() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("console"));
    let top = instance.heap_top();
    common::call_with_string(&instance, "console_error", "panicked at src/lib.rs:10").unwrap();
    assert_eq!(instance.heap_top(), top);
}

#[test]
fn test_debug_string_import_renders_values() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("debug"));
    let ret = instance.malloc(8);

    let cases = [
        (HostValue::Undefined, "undefined"),
        (HostValue::number(3.0), "3"),
        (HostValue::string("s"), "\"s\""),
        (HostValue::object("Window"), "Window"),
        (
            HostValue::plain_object([("a", HostValue::Bool(true))]),
            "Object({\"a\":true})",
        ),
    ];
    for (value, expected) in cases {
        let h = bridge.add_object(value);
        instance
            .call_import(NS, "debug_string", &[WasmValue::ptr(ret), WasmValue::handle(h)])
            .unwrap();
        assert_eq!(common::read_slot_string(&instance, ret), expected);
    }
}

#[test]
fn test_instance_of_import() {
    let bridge = common::bridge();
    let instance = common::attach(&bridge, NativeModule::new("classes"));
    let window = bridge.add_object(HostValue::object("Window"));
    let check = |class: &str| {
        let (ptr, len) = instance.alloc_bytes(class.as_bytes()).unwrap();
        instance
            .call_import(
                NS,
                "instance_of",
                &[WasmValue::handle(window), WasmValue::ptr(ptr), WasmValue::ptr(len)],
            )
            .unwrap()
    };
    assert_eq!(check("Window"), Some(WasmValue::I32(1)));
    assert_eq!(check("Document"), Some(WasmValue::I32(0)));
}
