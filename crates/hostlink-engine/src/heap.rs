//! Handle table
//!
//! Growable slot array mapping handles to host values. Free slots form an
//! intrusive list: each stores the index of the next free slot, and the list
//! ends at `slots.len()`, where the table grows by appending. The table never
//! shrinks.
//!
//! Every allocation is stamped with a serial number, so a holder can tell
//! whether a handle still names the value it installed or a later tenant of
//! a recycled slot.

use hostlink_sdk::{Handle, HostValue};

enum Slot {
    Occupied(HostValue, u64),
    Free(u32),
}

/// Handle table owned by one bridge instance.
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: u32,
    live: usize,
    serial: u64,
}

impl HandleTable {
    /// Create a table holding only the reserved constants
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a table with room for `capacity` leased handles before growing
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(Handle::RESERVED_COUNT as usize + capacity);
        slots.push(Slot::Occupied(HostValue::Undefined, 0));
        slots.push(Slot::Occupied(HostValue::Null, 0));
        slots.push(Slot::Occupied(HostValue::Bool(true), 0));
        slots.push(Slot::Occupied(HostValue::Bool(false), 0));
        Self {
            next_free: slots.len() as u32,
            slots,
            live: 0,
            serial: 0,
        }
    }

    /// Install a value and return its handle. O(1).
    pub fn allocate(&mut self, value: HostValue) -> Handle {
        if self.next_free as usize == self.slots.len() {
            self.slots.push(Slot::Free(self.next_free + 1));
        }
        let idx = self.next_free;
        let slot = &mut self.slots[idx as usize];
        self.next_free = match *slot {
            Slot::Free(next) => next,
            // free list only ever links free slots
            Slot::Occupied(..) => unreachable!("free list points at occupied slot {idx}"),
        };
        self.serial += 1;
        *slot = Slot::Occupied(value, self.serial);
        self.live += 1;
        Handle::from_raw(idx)
    }

    /// Look up a live handle
    pub fn get(&self, handle: Handle) -> Option<&HostValue> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied(value, _)) => Some(value),
            _ => None,
        }
    }

    /// Allocation stamp of a live leased handle
    pub fn stamp(&self, handle: Handle) -> Option<u64> {
        if handle.is_reserved() {
            return None;
        }
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied(_, stamp)) => Some(*stamp),
            _ => None,
        }
    }

    /// Release `handle` only if it still holds the allocation stamped
    /// `stamp`. Returns whether the slot was released.
    pub fn release_if_stamp(&mut self, handle: Handle, stamp: u64) -> bool {
        if self.stamp(handle) != Some(stamp) {
            return false;
        }
        self.release(handle);
        true
    }

    /// Release a handle; reserved handles are ignored.
    ///
    /// Releasing the same handle twice is a caller defect. Debug builds
    /// assert on it; release builds leave the free list untouched.
    pub fn release(&mut self, handle: Handle) {
        if handle.is_reserved() {
            return;
        }
        let idx = handle.as_raw();
        match self.slots.get_mut(idx as usize) {
            Some(slot @ Slot::Occupied(..)) => {
                *slot = Slot::Free(self.next_free);
                self.next_free = idx;
                self.live -= 1;
            }
            _ => {
                debug_assert!(false, "release of dead handle {idx}");
                tracing::warn!(handle = idx, "release of dead handle ignored");
            }
        }
    }

    /// Resolve and release in one step
    pub fn take(&mut self, handle: Handle) -> Option<HostValue> {
        let value = self.get(handle)?.clone();
        self.release(handle);
        Some(value)
    }

    /// Install a second owning slot for the same value
    pub fn clone_ref(&mut self, handle: Handle) -> Option<Handle> {
        let value = self.get(handle)?.clone();
        Some(self.allocate(value))
    }

    /// Total slot count, reserved slots included
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false: the reserved slots are permanent
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of leased handles currently live
    pub fn live(&self) -> usize {
        self.live
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
