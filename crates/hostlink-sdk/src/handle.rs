//! Handle - the integer name of a host object on the module side
//!
//! The four lowest indices are reserved for foundational constants and are
//! valid for the whole lifetime of a bridge:
//!
//! ```text
//! 0  undefined   (also the wire encoding of "no object")
//! 1  null
//! 2  true
//! 3  false
//! 4… leased
//! ```

use std::fmt;

/// Index of a slot in the bridge's handle table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Reserved handle for `undefined`
    pub const UNDEFINED: Handle = Handle(0);
    /// Reserved handle for `null`
    pub const NULL: Handle = Handle(1);
    /// Reserved handle for `true`
    pub const TRUE: Handle = Handle(2);
    /// Reserved handle for `false`
    pub const FALSE: Handle = Handle(3);

    /// Number of reserved slots at the bottom of every table
    pub const RESERVED_COUNT: u32 = 4;

    /// Wrap a raw index received from the module
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw index as passed across the boundary
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Raw index reinterpreted as a wasm `i32`
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    /// Slot index into the table
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this handle names one of the reserved constants
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::RESERVED_COUNT
    }

    /// Reserved handle for a boolean
    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Handle::UNDEFINED => write!(f, "Handle(undefined)"),
            Handle::NULL => write!(f, "Handle(null)"),
            Handle::TRUE => write!(f, "Handle(true)"),
            Handle::FALSE => write!(f, "Handle(false)"),
            Handle(raw) => write!(f, "Handle({raw})"),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_handles() {
        assert!(Handle::UNDEFINED.is_reserved());
        assert!(Handle::NULL.is_reserved());
        assert!(Handle::TRUE.is_reserved());
        assert!(Handle::FALSE.is_reserved());
        assert!(!Handle::from_raw(Handle::RESERVED_COUNT).is_reserved());
    }

    #[test]
    fn test_from_bool() {
        assert_eq!(Handle::from_bool(true), Handle::TRUE);
        assert_eq!(Handle::from_bool(false), Handle::FALSE);
    }

    #[test]
    fn test_debug_names_constants() {
        assert_eq!(format!("{:?}", Handle::NULL), "Handle(null)");
        assert_eq!(format!("{:?}", Handle::from_raw(9)), "Handle(9)");
    }
}
