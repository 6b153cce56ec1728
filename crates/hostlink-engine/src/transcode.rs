//! String transcoding between module memory and host text
//!
//! Decoding reads `(ptr, len)` byte ranges as UTF-8. Encoding has to
//! allocate before it knows the final byte length, so the default strategy
//! guesses one byte per character, encodes whole characters into the room
//! it has, and doubles the allocation until the input is consumed.
//!
//! The written length of the last encode is left in a single slot
//! ([`Transcoder::last_len`]). Callers read it straight after the encode;
//! a nested encode in between overwrites it.

use std::cell::Cell;

use hostlink_sdk::{BridgeResult, ModuleInstance};

use crate::alloc::{write_words, ModuleAlloc};
use crate::options::EncodeStrategy;

/// String transcoder for one bridge instance.
pub struct Transcoder {
    strategy: EncodeStrategy,
    last_len: Cell<u32>,
}

impl Transcoder {
    /// Create a transcoder with the given encode strategy
    pub fn new(strategy: EncodeStrategy) -> Self {
        Self {
            strategy,
            last_len: Cell::new(0),
        }
    }

    /// Active encode strategy
    pub fn strategy(&self) -> EncodeStrategy {
        self.strategy
    }

    /// Byte length written by the most recent encode
    pub fn last_len(&self) -> u32 {
        self.last_len.get()
    }

    /// Decode `len` bytes at `ptr`. Invalid sequences become U+FFFD.
    pub fn decode(&self, module: &dyn ModuleInstance, ptr: u32, len: u32) -> BridgeResult<String> {
        let bytes = module.memory().read_vec(ptr, len)?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Copy a byte range out of module memory
    pub fn read_bytes(&self, module: &dyn ModuleInstance, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        module.memory().read_vec(ptr, len)
    }

    /// Encode `s` into a fresh module allocation and return its pointer.
    ///
    /// The byte length is left in [`Transcoder::last_len`].
    pub fn encode(&self, module: &dyn ModuleInstance, s: &str) -> BridgeResult<u32> {
        match self.strategy {
            EncodeStrategy::EncodeInto => self.encode_into(module, s),
            EncodeStrategy::CopyThrough => self.copy_through(module, s),
        }
    }

    /// Encode `s` and write `[ptr, len]` to the return slot at `ret`
    pub fn encode_to_slot(&self, module: &dyn ModuleInstance, s: &str, ret: u32) -> BridgeResult<()> {
        let ptr = self.encode(module, s)?;
        let len = self.last_len();
        write_words(module, ret, &[ptr, len])
    }

    /// Copy `data` into a fresh module allocation
    pub fn pass_bytes(&self, module: &dyn ModuleInstance, data: &[u8]) -> BridgeResult<u32> {
        let alloc = ModuleAlloc::new(module);
        let size = data.len() as u32;
        let ptr = alloc.malloc(size)?;
        if let Err(e) = module.memory().write(ptr, data) {
            release_partial(alloc, ptr, size);
            return Err(e);
        }
        self.last_len.set(size);
        Ok(ptr)
    }

    fn encode_into(&self, module: &dyn ModuleInstance, s: &str) -> BridgeResult<u32> {
        let alloc = ModuleAlloc::new(module);
        let mut size = s.chars().count() as u32;
        let mut ptr = alloc.malloc(size)?;
        match fill_growing(module, alloc, s, &mut ptr, &mut size) {
            Ok(written) => {
                self.last_len.set(written);
                Ok(ptr)
            }
            Err(e) => {
                release_partial(alloc, ptr, size);
                Err(e)
            }
        }
    }

    fn copy_through(&self, module: &dyn ModuleInstance, s: &str) -> BridgeResult<u32> {
        let buf = s.as_bytes().to_vec();
        self.pass_bytes(module, &buf)
    }
}

/// Write `s` into the allocation at `*ptr`, doubling it until everything
/// fits. `*ptr` and `*size` always describe the allocation the module owns,
/// including after a failed realloc.
fn fill_growing(
    module: &dyn ModuleInstance,
    alloc: ModuleAlloc<'_>,
    s: &str,
    ptr: &mut u32,
    size: &mut u32,
) -> BridgeResult<u32> {
    let mut written = 0u32;
    let mut rest = s;
    loop {
        let room = (*size - written) as usize;
        let take = whole_chars_within(rest, room);
        // memory may have moved during realloc; write through the current view
        module.memory().write(*ptr + written, &rest.as_bytes()[..take])?;
        written += take as u32;
        rest = &rest[take..];
        if rest.is_empty() {
            return Ok(written);
        }
        *ptr = alloc.realloc(*ptr, *size, *size * 2)?;
        *size *= 2;
    }
}

/// Hand an abandoned allocation back to the module. A failing free is only
/// logged; the caller reports the error that caused the abandonment.
fn release_partial(alloc: ModuleAlloc<'_>, ptr: u32, size: u32) {
    if let Err(e) = alloc.free(ptr, size) {
        tracing::warn!(ptr, size, error = %e, "failed to free abandoned string allocation");
    }
}

/// Largest prefix of `s`, in bytes, that fits in `room` without splitting a
/// character.
fn whole_chars_within(s: &str, room: usize) -> usize {
    let mut end = room.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
