//! Exception and debug bridge
//!
//! Host failures inside catching imports are reported through a two-word
//! error slot in module memory: `[1, handle]` on failure, left untouched on
//! success. The module reads the flag after the import returns.
//!
//! [`debug_string`] renders any host value for diagnostics. It never fails
//! and terminates on cyclic structures.

use std::rc::Rc;

use rustc_hash::FxHashSet;
use serde_json::{Map, Number, Value};

use hostlink_sdk::{number_to_string, BridgeError, BridgeResult, Handle, HostValue, WasmValue};

use crate::alloc::write_words;
use crate::bridge::Bridge;

/// Flag word written when an error was raised
pub const ERROR_FLAG: u32 = 1;

/// Two-word error slot owned by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorSlot {
    addr: u32,
}

impl ErrorSlot {
    /// Slot at `addr`
    pub fn at(addr: u32) -> Self {
        Self { addr }
    }

    /// Address of the flag word
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Read the slot: `Some(handle)` if the flag is set
    pub fn read(&self, bridge: &Bridge) -> BridgeResult<Option<Handle>> {
        let module = bridge.module()?;
        let memory = module.memory();
        if memory.read_u32(self.addr)? != ERROR_FLAG {
            return Ok(None);
        }
        Ok(Some(Handle::from_raw(memory.read_u32(self.addr + 4)?)))
    }

    /// Clear the flag word
    pub fn clear(&self, bridge: &Bridge) -> BridgeResult<()> {
        let module = bridge.module()?;
        module.memory().write_u32(self.addr, 0)
    }
}

impl Bridge {
    /// Install a host error and record it in the slot at `exnptr`
    pub fn handle_error(&self, exnptr: u32, error: HostValue) -> BridgeResult<()> {
        let module = self.module()?;
        tracing::debug!(
            exnptr,
            error = %debug_string(&error),
            "host error captured for module"
        );
        let handle = self.add_object(error);
        write_words(module.as_ref(), exnptr, &[ERROR_FLAG, handle.as_raw()])
    }

    /// Run a fallible host operation on behalf of the module.
    ///
    /// A host failure is written to the error slot and the import returns
    /// `fallback`; the slot is not touched on success. Bridge faults such as
    /// invalid handles still trap.
    pub fn catching<F>(&self, exnptr: u32, fallback: WasmValue, f: F) -> BridgeResult<Option<WasmValue>>
    where
        F: FnOnce(&Bridge) -> Result<Option<WasmValue>, HostValue>,
    {
        match f(self) {
            Ok(ret) => Ok(ret),
            Err(error) => {
                self.handle_error(exnptr, error)?;
                Ok(Some(fallback))
            }
        }
    }

    /// Inspect a slot after calling a module export that reports through
    /// one. A raised error is taken back and returned as a thrown value.
    pub fn check_error_slot(&self, slot: ErrorSlot) -> BridgeResult<()> {
        match slot.read(self)? {
            Some(handle) => {
                let error = self.take_object(handle)?;
                Err(BridgeError::Thrown(error))
            }
            None => Ok(()),
        }
    }
}

/// Human-readable rendering of any host value
pub fn debug_string(value: &HostValue) -> String {
    let mut seen = FxHashSet::default();
    render(value, &mut seen)
}

fn render(value: &HostValue, seen: &mut FxHashSet<usize>) -> String {
    match value {
        HostValue::Undefined => "undefined".to_string(),
        HostValue::Null => "null".to_string(),
        HostValue::Bool(b) => b.to_string(),
        HostValue::Number(n) => number_to_string(*n),
        HostValue::String(s) => format!("\"{s}\""),
        HostValue::Symbol(sym) => match sym.description() {
            Some(desc) => format!("Symbol({desc})"),
            None => "Symbol".to_string(),
        },
        HostValue::Function(f) => {
            if f.name().is_empty() {
                "Function".to_string()
            } else {
                format!("Function({})", f.name())
            }
        }
        HostValue::Array(items) => {
            let key = Rc::as_ptr(items) as *const () as usize;
            if !seen.insert(key) {
                return "[Circular]".to_string();
            }
            let parts: Vec<String> = items.borrow().iter().map(|v| render(v, seen)).collect();
            seen.remove(&key);
            format!("[{}]", parts.join(", "))
        }
        HostValue::Error(e) => format!("{}: {}\n{}", e.name(), e.message(), e.stack()),
        HostValue::Object(o) if o.class() == "Object" => {
            let mut stack = Vec::new();
            match to_json(value, &mut stack) {
                Some(json) => format!("Object({json})"),
                None => "Object".to_string(),
            }
        }
        HostValue::Object(o) => o.class().to_string(),
    }
}

/// Outcome of serializing one value
enum Json {
    Value(Value),
    /// Dropped from objects, `null` inside arrays
    Omitted,
}

/// JSON rendering with `JSON.stringify` semantics. `None` means a cycle.
fn to_json(value: &HostValue, stack: &mut Vec<usize>) -> Option<Value> {
    match json_value(value, stack)? {
        Json::Value(v) => Some(v),
        Json::Omitted => Some(Value::Null),
    }
}

fn json_value(value: &HostValue, stack: &mut Vec<usize>) -> Option<Json> {
    let json = match value {
        HostValue::Undefined | HostValue::Function(_) | HostValue::Symbol(_) => Json::Omitted,
        HostValue::Null => Json::Value(Value::Null),
        HostValue::Bool(b) => Json::Value(Value::Bool(*b)),
        HostValue::Number(n) => Json::Value(json_number(*n)),
        HostValue::String(s) => Json::Value(Value::String(s.to_string())),
        // own fields of an error are not enumerable
        HostValue::Error(_) => Json::Value(Value::Object(Map::new())),
        HostValue::Array(items) => {
            let key = Rc::as_ptr(items) as *const () as usize;
            if stack.contains(&key) {
                return None;
            }
            stack.push(key);
            let mut out = Vec::new();
            for item in items.borrow().iter() {
                out.push(match json_value(item, stack)? {
                    Json::Value(v) => v,
                    Json::Omitted => Value::Null,
                });
            }
            stack.pop();
            Json::Value(Value::Array(out))
        }
        HostValue::Object(o) => {
            let key = Rc::as_ptr(o) as *const () as usize;
            if stack.contains(&key) {
                return None;
            }
            stack.push(key);
            let mut out = Map::new();
            for (name, field) in o.entries() {
                if let Json::Value(v) = json_value(&field, stack)? {
                    out.insert(name, v);
                }
            }
            stack.pop();
            Json::Value(Value::Object(out))
        }
    };
    Some(json)
}

fn json_number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_sdk::HostError;

    #[test]
    fn test_primitives() {
        assert_eq!(debug_string(&HostValue::Undefined), "undefined");
        assert_eq!(debug_string(&HostValue::Null), "null");
        assert_eq!(debug_string(&HostValue::Bool(true)), "true");
        assert_eq!(debug_string(&HostValue::number(1.5)), "1.5");
        assert_eq!(debug_string(&HostValue::number(f64::NAN)), "NaN");
        assert_eq!(debug_string(&HostValue::string("hi")), "\"hi\"");
    }

    #[test]
    fn test_symbols_and_functions() {
        assert_eq!(debug_string(&HostValue::symbol(Some("tag"))), "Symbol(tag)");
        assert_eq!(debug_string(&HostValue::symbol(None)), "Symbol");
        let named = HostValue::function("render", |_| Ok(HostValue::Undefined));
        assert_eq!(debug_string(&named), "Function(render)");
        let anon = HostValue::function("", |_| Ok(HostValue::Undefined));
        assert_eq!(debug_string(&anon), "Function");
    }

    #[test]
    fn test_arrays_nest() {
        let inner = HostValue::array(vec![HostValue::number(2.0), HostValue::string("x")]);
        let outer = HostValue::array(vec![HostValue::number(1.0), inner, HostValue::Null]);
        assert_eq!(debug_string(&outer), "[1, [2, \"x\"], null]");
    }

    #[test]
    fn test_cyclic_array_terminates() {
        let arr = HostValue::array(vec![HostValue::number(1.0)]);
        if let HostValue::Array(items) = &arr {
            items.borrow_mut().push(arr.clone());
        }
        assert_eq!(debug_string(&arr), "[1, [Circular]]");
        // break the cycle so the test does not leak
        if let HostValue::Array(items) = &arr {
            items.borrow_mut().clear();
        }
    }

    #[test]
    fn test_shared_array_is_not_circular() {
        let shared = HostValue::array(vec![HostValue::number(7.0)]);
        let outer = HostValue::array(vec![shared.clone(), shared]);
        assert_eq!(debug_string(&outer), "[[7], [7]]");
    }

    #[test]
    fn test_plain_object_as_json() {
        let obj = HostValue::plain_object([
            ("b", HostValue::number(1.0)),
            ("a", HostValue::string("s")),
            ("skip", HostValue::Undefined),
            ("nan", HostValue::number(f64::NAN)),
        ]);
        assert_eq!(debug_string(&obj), r#"Object({"b":1,"a":"s","nan":null})"#);
    }

    #[test]
    fn test_cyclic_object_falls_back() {
        let obj = HostValue::plain_object([("n", HostValue::number(1.0))]);
        let o = obj.as_object().unwrap().clone();
        o.set("self", obj.clone());
        assert_eq!(debug_string(&obj), "Object");
        o.set("self", HostValue::Null);
    }

    #[test]
    fn test_classed_object_and_error() {
        assert_eq!(debug_string(&HostValue::object("Window")), "Window");
        let err = HostValue::from_error(
            HostError::new("TypeError", "bad input").with_stack("at main"),
        );
        assert_eq!(debug_string(&err), "TypeError: bad input\nat main");
    }

    #[test]
    fn test_json_number_integral() {
        assert_eq!(json_number(3.0), Value::from(3));
        assert_eq!(json_number(f64::INFINITY), Value::Null);
        assert_eq!(json_number(0.25).to_string(), "0.25");
    }
}
