//! String and buffer marshalling across the boundary
//!
//! Reads decode guest bytes as UTF-8 and trap on malformed input: bad
//! UTF-8 crossing the boundary is a contract violation, not a runtime
//! condition. Writes allocate guest memory through the guest's exported
//! allocator.
//!
//! `write_string` is two-phase. The common case is ASCII-heavy text, so it
//! first allocates one byte per UTF-16 code unit and copies the ASCII
//! prefix straight in. On the first non-ASCII character it reallocates to
//! `prefix + 3 * remaining_units` (an upper bound on the UTF-8 length of
//! the remainder, counted in UTF-16 units so four-byte characters fit) and
//! writes the rest. Views are re-requested after every allocator call,
//! since allocation may grow guest memory and move the buffer.

use crate::error::Trap;
use crate::guest::GuestAlloc;
use crate::memory::MemoryViews;

/// Decode `len` guest bytes at `ptr` as UTF-8.
pub fn read_string(views: &MemoryViews, ptr: u32, len: u32) -> Result<String, Trap> {
    let bytes = views.bytes().read(ptr, len)?;
    String::from_utf8(bytes).map_err(|e| Trap::InvalidUtf8(e.utf8_error().valid_up_to()))
}

/// Copy `len` guest bytes at `ptr` into a host buffer.
pub fn read_bytes(views: &MemoryViews, ptr: u32, len: u32) -> Result<Vec<u8>, Trap> {
    views.bytes().read(ptr, len)
}

/// Encode `s` into freshly allocated guest memory; returns `(ptr, len)`
/// in bytes.
pub fn write_string(
    s: &str,
    alloc: &dyn GuestAlloc,
    views: &MemoryViews,
) -> Result<(u32, u32), Trap> {
    let units = s.encode_utf16().count() as u32;
    let mut ptr = alloc.malloc(units)?;
    if ptr == 0 && units > 0 {
        return Err(Trap::AllocFailed);
    }

    let ascii_len = s.bytes().take_while(|b| b.is_ascii()).count();
    views.bytes().write(ptr, &s.as_bytes()[..ascii_len])?;
    if ascii_len == s.len() {
        return Ok((ptr, ascii_len as u32));
    }

    let rest = &s[ascii_len..];
    let capacity = ascii_len as u32 + rest.encode_utf16().count() as u32 * 3;
    ptr = alloc.realloc(ptr, units, capacity)?;
    if ptr == 0 {
        return Err(Trap::AllocFailed);
    }
    views
        .bytes()
        .write(ptr + ascii_len as u32, rest.as_bytes())?;
    Ok((ptr, (ascii_len + rest.len()) as u32))
}

/// Copy a host byte buffer into freshly allocated guest memory.
pub fn write_bytes(
    data: &[u8],
    alloc: &dyn GuestAlloc,
    views: &MemoryViews,
) -> Result<(u32, u32), Trap> {
    let ptr = alloc.malloc(data.len() as u32)?;
    if ptr == 0 && !data.is_empty() {
        return Err(Trap::AllocFailed);
    }
    views.bytes().write(ptr, data)?;
    Ok((ptr, data.len() as u32))
}
