//! Closure lifetime management
//!
//! A module-side closure is a `(data, vtable)` pair plus two function-table
//! indices: one that invokes it and one that destroys it. The bridge wraps
//! the pair in a host function (a trampoline) and hands the module a handle
//! to it.
//!
//! Ownership is counted. The module's own reference counts as one; every
//! invocation in flight counts as another. Module resources are released
//! exactly once, when the count reaches zero, whichever side gets there
//! last. While `data` reads zero the trampoline refuses to call in.

use std::cell::Cell;
use std::rc::Rc;

use hostlink_sdk::{BridgeError, BridgeResult, Handle, HostResult, HostValue, WasmValue};

use crate::bridge::{host_error, Bridge};

/// Invocation discipline of a trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureKind {
    /// Callable any number of times, re-entrantly
    Multi,
    /// Callable once; the call itself gives up the module's reference
    Once,
    /// Callable repeatedly, never re-entrantly
    Exclusive,
}

/// How a host argument is lowered for the invoke entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamAbi {
    /// Installed in the handle table; the module owns the handle
    Handle,
    /// Passed as an `f64`
    F64,
    /// Passed as an `i32` (booleans become 0/1)
    I32,
}

/// How the invoke entry's result is lifted back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnAbi {
    /// Nothing; the host sees `undefined`
    Void,
    /// An owned handle the bridge takes back
    Handle,
    /// An `f64`
    F64,
    /// An `i32`
    I32,
}

/// Parameter and result lowering of a trampoline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureSignature {
    /// Per-argument lowering, in order
    pub params: Vec<ParamAbi>,
    /// Result lifting
    pub ret: ReturnAbi,
}

impl ClosureSignature {
    /// Signature taking `arity` handles and returning nothing
    pub fn handles(arity: usize) -> Self {
        Self {
            params: vec![ParamAbi::Handle; arity],
            ret: ReturnAbi::Void,
        }
    }

    /// Replace the result lifting
    pub fn returning(mut self, ret: ReturnAbi) -> Self {
        self.ret = ret;
        self
    }

    /// Pack into the single word the `closure_wrapper` import takes.
    ///
    /// Layout: bits 0-1 result, bits 2-5 arity, then two bits per parameter
    /// starting at bit 8.
    pub fn to_word(&self) -> BridgeResult<u32> {
        if self.params.len() > Self::MAX_ARITY {
            return Err(BridgeError::ArgumentError(format!(
                "closure arity {} exceeds {}",
                self.params.len(),
                Self::MAX_ARITY
            )));
        }
        let ret = match self.ret {
            ReturnAbi::Void => 0,
            ReturnAbi::Handle => 1,
            ReturnAbi::F64 => 2,
            ReturnAbi::I32 => 3,
        };
        let mut word = ret | ((self.params.len() as u32) << 2);
        for (i, p) in self.params.iter().enumerate() {
            let code = match p {
                ParamAbi::Handle => 0,
                ParamAbi::F64 => 1,
                ParamAbi::I32 => 2,
            };
            word |= code << (8 + 2 * i);
        }
        Ok(word)
    }

    /// Unpack a signature word
    pub fn from_word(word: u32) -> BridgeResult<Self> {
        let ret = match word & 0b11 {
            0 => ReturnAbi::Void,
            1 => ReturnAbi::Handle,
            2 => ReturnAbi::F64,
            _ => ReturnAbi::I32,
        };
        let arity = ((word >> 2) & 0b1111) as usize;
        if arity > Self::MAX_ARITY {
            return Err(BridgeError::ArgumentError(format!(
                "closure arity {arity} exceeds {}",
                Self::MAX_ARITY
            )));
        }
        let params = (0..arity)
            .map(|i| match (word >> (8 + 2 * i)) & 0b11 {
                0 => Ok(ParamAbi::Handle),
                1 => Ok(ParamAbi::F64),
                2 => Ok(ParamAbi::I32),
                code => Err(BridgeError::ArgumentError(format!(
                    "unknown parameter code {code} at position {i}"
                ))),
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { params, ret })
    }

    /// Most parameters a signature word can describe
    pub const MAX_ARITY: usize = 12;
}

impl ClosureKind {
    /// Decode the kind argument of `closure_wrapper`
    pub fn from_code(code: u32) -> BridgeResult<Self> {
        match code {
            0 => Ok(ClosureKind::Multi),
            1 => Ok(ClosureKind::Once),
            2 => Ok(ClosureKind::Exclusive),
            other => Err(BridgeError::ArgumentError(format!(
                "unknown closure kind {other}"
            ))),
        }
    }

    /// Code accepted by [`ClosureKind::from_code`]
    pub fn code(self) -> u32 {
        match self {
            ClosureKind::Multi => 0,
            ClosureKind::Once => 1,
            ClosureKind::Exclusive => 2,
        }
    }
}

/// Everything needed to build a trampoline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureSpec {
    /// Closure environment pointer
    pub data: u32,
    /// Closure vtable pointer
    pub vtable: u32,
    /// Function-table index of the invoke entry
    pub invoke: u32,
    /// Function-table index of the destructor
    pub destroy: u32,
    /// Invocation discipline
    pub kind: ClosureKind,
    /// Argument and result lowering
    pub signature: ClosureSignature,
}

/// Bookkeeping for one trampoline.
///
/// The state transitions are pure; the bridge performs the module calls
/// they ask for.
#[derive(Debug)]
pub struct ClosureRecord {
    id: u64,
    kind: ClosureKind,
    vtable: u32,
    invoke: u32,
    destroy: u32,
    signature: ClosureSignature,
    data: Cell<u32>,
    refs: Cell<u32>,
    owner_released: Cell<bool>,
    destroyed: Cell<bool>,
}

impl ClosureRecord {
    /// Start tracking a closure; the module holds the only reference
    pub fn new(id: u64, spec: ClosureSpec) -> Self {
        Self {
            id,
            kind: spec.kind,
            vtable: spec.vtable,
            invoke: spec.invoke,
            destroy: spec.destroy,
            signature: spec.signature,
            data: Cell::new(spec.data),
            refs: Cell::new(1),
            owner_released: Cell::new(false),
            destroyed: Cell::new(false),
        }
    }

    /// Identifier used in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invocation discipline
    pub fn kind(&self) -> ClosureKind {
        self.kind
    }

    /// Outstanding references: the module's plus calls in flight
    pub fn refs(&self) -> u32 {
        self.refs.get()
    }

    /// Whether the trampoline currently refuses to call in
    pub fn is_disabled(&self) -> bool {
        self.data.get() == 0
    }

    /// Whether the destructor has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Begin an invocation. Returns the environment pointer to call with,
    /// or `None` if the call must be refused.
    pub fn enter(&self) -> Option<u32> {
        let data = match self.kind {
            ClosureKind::Multi => self.data.get(),
            ClosureKind::Once | ClosureKind::Exclusive => self.data.replace(0),
        };
        if data == 0 {
            return None;
        }
        self.refs.set(self.refs.get() + 1);
        Some(data)
    }

    /// Finish an invocation begun with `data`. Returns the environment
    /// pointer to destroy if this exit dropped the last reference.
    pub fn exit(&self, data: u32) -> Option<u32> {
        self.refs.set(self.refs.get() - 1);
        match self.kind {
            ClosureKind::Multi => {}
            ClosureKind::Exclusive => {
                if self.refs.get() > 0 {
                    self.data.set(data);
                }
            }
            ClosureKind::Once => {
                if !self.owner_released.replace(true) {
                    self.refs.set(self.refs.get() - 1);
                }
            }
        }
        if self.refs.get() == 0 {
            self.data.set(0);
            return self.mark_destroyed(data);
        }
        None
    }

    /// The module gives up its reference. Returns the environment pointer
    /// to destroy if nothing else holds the closure.
    pub fn release_owner(&self) -> Option<u32> {
        if self.owner_released.replace(true) {
            return None;
        }
        self.refs.set(self.refs.get() - 1);
        if self.refs.get() == 0 {
            let data = self.data.replace(0);
            return self.mark_destroyed(data);
        }
        None
    }

    fn mark_destroyed(&self, data: u32) -> Option<u32> {
        if self.destroyed.replace(true) {
            None
        } else {
            Some(data)
        }
    }
}

/// Recover the record behind a trampoline value
pub fn closure_record(value: &HostValue) -> Option<Rc<ClosureRecord>> {
    let state = value.as_function()?.state()?.clone();
    state.downcast::<ClosureRecord>().ok()
}

impl Bridge {
    /// Wrap a module closure in a host function and return a handle to it
    pub fn make_closure(&self, spec: ClosureSpec) -> Handle {
        let inner = self.inner();
        let id = inner.next_closure_id.get();
        inner.next_closure_id.set(id + 1);
        inner.closures_created.set(inner.closures_created.get() + 1);

        let record = Rc::new(ClosureRecord::new(id, spec));
        tracing::debug!(
            closure = id,
            kind = ?record.kind,
            invoke = record.invoke,
            destroy = record.destroy,
            "closure created"
        );

        let weak = self.downgrade();
        let target = record.clone();
        let function = HostValue::function_with_state(format!("closure{id}"), record, move |args| {
            let bridge = Bridge::upgrade(&weak)
                .ok_or_else(|| HostValue::error("Error", "closure outlived its bridge"))?;
            bridge.invoke_closure(&target, args)
        });
        self.add_object(function)
    }

    /// Release the module's reference to a trampoline and its handle.
    ///
    /// Returns `true` if this released the closure's module resources.
    pub fn cb_drop(&self, handle: Handle) -> BridgeResult<bool> {
        let value = self.take_object(handle)?;
        let record = closure_record(&value).ok_or_else(|| BridgeError::TypeMismatch {
            expected: "closure".to_string(),
            got: value.type_name().to_string(),
        })?;
        match record.release_owner() {
            Some(data) => {
                self.destroy_closure(&record, data)?;
                Ok(true)
            }
            None => {
                tracing::debug!(closure = record.id, refs = record.refs(), "closure drop deferred");
                Ok(false)
            }
        }
    }

    /// Release the handle only; the closure stays callable for as long as
    /// the host keeps the function
    pub fn cb_forget(&self, handle: Handle) {
        self.drop_object(handle);
    }

    pub(crate) fn invoke_closure(&self, record: &Rc<ClosureRecord>, args: &[HostValue]) -> HostResult {
        let Some(data) = record.enter() else {
            tracing::warn!(closure = record.id, kind = ?record.kind, "refused closure invocation");
            return Err(host_error(BridgeError::ClosureDisabled(record.id)));
        };

        let outcome = self.call_closure_body(record, data, args);
        let teardown = match record.exit(data) {
            Some(data) => self.destroy_closure(record, data),
            None => Ok(()),
        };
        match (outcome, teardown) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(host_error(e)),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn call_closure_body(&self, record: &ClosureRecord, data: u32, args: &[HostValue]) -> HostResult {
        let module = self.module().map_err(host_error)?;

        let mut lowered = Vec::with_capacity(record.signature.params.len() + 2);
        let mut leased = Vec::new();
        lowered.push(WasmValue::ptr(data));
        lowered.push(WasmValue::ptr(record.vtable));
        for (i, abi) in record.signature.params.iter().enumerate() {
            let arg = args.get(i).cloned().unwrap_or_default();
            lowered.push(match abi {
                ParamAbi::Handle => {
                    let handle = self.add_object(arg);
                    leased.extend(self.object_stamp(handle).map(|stamp| (handle, stamp)));
                    WasmValue::handle(handle)
                }
                ParamAbi::F64 => WasmValue::F64(arg.as_number().unwrap_or(f64::NAN)),
                ParamAbi::I32 => WasmValue::I32(match arg {
                    HostValue::Bool(b) => i32::from(b),
                    other => other.as_number().map_or(0, |n| n as i32),
                }),
            });
        }

        // a trapped body never took ownership of its handle arguments; slots
        // it already released and recycled are left alone
        let ret = match module.call_indirect(record.invoke, &lowered) {
            Ok(ret) => ret,
            Err(e) => {
                for (handle, stamp) in leased {
                    self.drop_object_if_stamp(handle, stamp);
                }
                return Err(host_error(e));
            }
        };

        match (record.signature.ret, ret) {
            (ReturnAbi::Void, _) => Ok(HostValue::Undefined),
            (ReturnAbi::Handle, Some(v)) => {
                let handle = v.as_handle().ok_or_else(|| mismatch("handle", v))?;
                self.take_object(handle).map_err(host_error)
            }
            (ReturnAbi::F64, Some(v)) => {
                let n = v.as_f64().ok_or_else(|| mismatch("f64", v))?;
                Ok(HostValue::number(n))
            }
            (ReturnAbi::I32, Some(v)) => {
                let n = v.as_i32().ok_or_else(|| mismatch("i32", v))?;
                Ok(HostValue::number(f64::from(n)))
            }
            (_, None) => Err(host_error(BridgeError::TypeMismatch {
                expected: "closure result".to_string(),
                got: "nothing".to_string(),
            })),
        }
    }

    fn destroy_closure(&self, record: &ClosureRecord, data: u32) -> BridgeResult<()> {
        let module = self.module()?;
        tracing::debug!(closure = record.id, "closure destroyed");
        let inner = self.inner();
        inner.closures_destroyed.set(inner.closures_destroyed.get() + 1);
        module.call_indirect(
            record.destroy,
            &[WasmValue::ptr(data), WasmValue::ptr(record.vtable)],
        )?;
        Ok(())
    }
}

fn mismatch(expected: &str, got: WasmValue) -> HostValue {
    host_error(BridgeError::TypeMismatch {
        expected: expected.to_string(),
        got: got.type_name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: ClosureKind) -> ClosureRecord {
        ClosureRecord::new(
            1,
            ClosureSpec {
                data: 64,
                vtable: 128,
                invoke: 1,
                destroy: 2,
                kind,
                signature: ClosureSignature::handles(1),
            },
        )
    }

    #[test]
    fn test_signature_word() {
        let sig = ClosureSignature {
            params: vec![ParamAbi::Handle, ParamAbi::F64, ParamAbi::I32],
            ret: ReturnAbi::F64,
        };
        let word = sig.to_word().unwrap();
        assert_eq!(word & 0b11, 2);
        assert_eq!(ClosureSignature::from_word(word).unwrap(), sig);
        assert_eq!(
            ClosureSignature::from_word(0).unwrap(),
            ClosureSignature::handles(0)
        );
        // parameter code 3 is unassigned
        assert!(ClosureSignature::from_word((1 << 2) | (3 << 8)).is_err());
        assert!(ClosureSignature::handles(13).to_word().is_err());
    }

    #[test]
    fn test_kind_codes() {
        for kind in [ClosureKind::Multi, ClosureKind::Once, ClosureKind::Exclusive] {
            assert_eq!(ClosureKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!(ClosureKind::from_code(7).is_err());
    }

    #[test]
    fn test_drop_without_calls_destroys_immediately() {
        let rec = record(ClosureKind::Multi);
        assert_eq!(rec.release_owner(), Some(64));
        assert!(rec.is_destroyed());
        assert!(rec.is_disabled());
        assert_eq!(rec.release_owner(), None);
    }

    #[test]
    fn test_multi_reentrant_drop_defers_to_outermost_exit() {
        let rec = record(ClosureKind::Multi);
        let outer = rec.enter().unwrap();
        let inner = rec.enter().unwrap();
        assert_eq!(rec.refs(), 3);
        assert_eq!(rec.release_owner(), None);
        assert_eq!(rec.exit(inner), None);
        assert!(!rec.is_destroyed());
        assert_eq!(rec.exit(outer), Some(64));
        assert!(rec.is_destroyed());
        assert_eq!(rec.enter(), None);
    }

    #[test]
    fn test_exclusive_refuses_reentry() {
        let rec = record(ClosureKind::Exclusive);
        let data = rec.enter().unwrap();
        assert_eq!(rec.enter(), None);
        assert_eq!(rec.exit(data), None);
        // re-armed after the call returns
        assert_eq!(rec.enter(), Some(64));
    }

    #[test]
    fn test_exclusive_dropped_mid_call() {
        let rec = record(ClosureKind::Exclusive);
        let data = rec.enter().unwrap();
        assert_eq!(rec.release_owner(), None);
        assert_eq!(rec.exit(data), Some(64));
        assert!(rec.is_disabled());
    }

    #[test]
    fn test_once_consumes_owner_reference() {
        let rec = record(ClosureKind::Once);
        let data = rec.enter().unwrap();
        assert_eq!(rec.exit(data), Some(64));
        assert!(rec.is_destroyed());
        assert_eq!(rec.enter(), None);
        // later drop from the module is a no-op
        assert_eq!(rec.release_owner(), None);
    }

    #[test]
    fn test_once_dropped_mid_call_destroys_once() {
        let rec = record(ClosureKind::Once);
        let data = rec.enter().unwrap();
        assert_eq!(rec.release_owner(), None);
        assert_eq!(rec.exit(data), Some(64));
    }
}
