//! Value heap: integer handles for host-owned values
//!
//! The guest only ever sees `u32` handles; the host keeps the actual values
//! in a slot arena. Free slots form a singly linked free list encoded
//! in-place, so handle allocation is O(1) and freed handles are reused
//! before the arena grows.
//!
//! Handles 0..3 are reserved constants (undefined, null, true, false).
//! They are never returned by `insert` and `release` ignores them.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::closure::GuestClosure;
use crate::error::Trap;

/// Reserved handle: the undefined value.
pub const UNDEFINED: u32 = 0;
/// Reserved handle: the null value.
pub const NULL: u32 = 1;
/// Reserved handle: true.
pub const TRUE: u32 = 2;
/// Reserved handle: false.
pub const FALSE: u32 = 3;

const RESERVED: u32 = 4;
const FREE_END: u32 = u32::MAX;

/// A host-side value referenced by a handle.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Closure(GuestClosure),
    /// Opaque host object (GPU buffer, DOM node, ...), owned by the host.
    Object(Rc<dyn Any>),
}

impl HostValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    pub fn as_str(&self) -> Result<&str, Trap> {
        match self {
            HostValue::Str(s) => Ok(s),
            _ => Err(Trap::TypeMismatch { expected: "string" }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], Trap> {
        match self {
            HostValue::Bytes(b) => Ok(b),
            _ => Err(Trap::TypeMismatch { expected: "byte buffer" }),
        }
    }

    pub fn as_closure(&self) -> Result<&GuestClosure, Trap> {
        match self {
            HostValue::Closure(c) => Ok(c),
            _ => Err(Trap::TypeMismatch { expected: "closure" }),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "undefined"),
            HostValue::Null => write!(f, "null"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Num(n) => write!(f, "{}", n),
            HostValue::Str(s) => write!(f, "{:?}", s),
            HostValue::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            HostValue::Closure(c) => write!(f, "closure(refs={})", c.ref_count()),
            HostValue::Object(_) => write!(f, "object"),
        }
    }
}

enum Slot {
    Live(HostValue),
    /// Next free slot index, or `FREE_END`.
    Free(u32),
}

/// Slot arena mapping handles to host values.
pub struct Heap {
    slots: Vec<Slot>,
    free_head: u32,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: vec![
                Slot::Live(HostValue::Undefined),
                Slot::Live(HostValue::Null),
                Slot::Live(HostValue::Bool(true)),
                Slot::Live(HostValue::Bool(false)),
            ],
            free_head: FREE_END,
            live: 0,
        }
    }

    /// Insert a value, reusing a freed slot when one is available.
    pub fn insert(&mut self, value: HostValue) -> u32 {
        self.live += 1;
        if self.free_head != FREE_END {
            let handle = self.free_head;
            match self.slots[handle as usize] {
                Slot::Free(next) => self.free_head = next,
                Slot::Live(_) => unreachable!("free list points at a live slot"),
            }
            self.slots[handle as usize] = Slot::Live(value);
            handle
        } else {
            self.slots.push(Slot::Live(value));
            (self.slots.len() - 1) as u32
        }
    }

    /// Peek at a handle's value without releasing it.
    pub fn get(&self, handle: u32) -> Result<&HostValue, Trap> {
        match self.slots.get(handle as usize) {
            Some(Slot::Live(v)) => Ok(v),
            _ => Err(Trap::InvalidHandle(handle)),
        }
    }

    /// Peek + release: ownership of the value transfers to the caller.
    pub fn take(&mut self, handle: u32) -> Result<HostValue, Trap> {
        if handle < RESERVED {
            // Reserved constants are never removed.
            return Ok(self.get(handle)?.clone());
        }
        match self.slots.get_mut(handle as usize) {
            Some(slot @ Slot::Live(_)) => {
                let old = std::mem::replace(slot, Slot::Free(self.free_head));
                self.free_head = handle;
                self.live -= 1;
                match old {
                    Slot::Live(v) => Ok(v),
                    Slot::Free(_) => unreachable!(),
                }
            }
            _ => Err(Trap::InvalidHandle(handle)),
        }
    }

    /// Release a handle the guest discarded without taking its value.
    /// No-op for reserved handles.
    pub fn release(&mut self, handle: u32) {
        if handle < RESERVED {
            return;
        }
        match self.slots.get_mut(handle as usize) {
            Some(slot @ Slot::Live(_)) => {
                *slot = Slot::Free(self.free_head);
                self.free_head = handle;
                self.live -= 1;
            }
            _ => debug_assert!(false, "release of dead handle {}", handle),
        }
    }

    /// Number of live non-reserved handles.
    pub fn live(&self) -> usize {
        self.live
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_handles_hold_constants() {
        let heap = Heap::new();
        assert!(heap.get(UNDEFINED).unwrap().is_undefined());
        assert!(matches!(heap.get(NULL).unwrap(), HostValue::Null));
        assert!(matches!(heap.get(TRUE).unwrap(), HostValue::Bool(true)));
        assert!(matches!(heap.get(FALSE).unwrap(), HostValue::Bool(false)));
    }

    #[test]
    fn insert_never_returns_reserved_handles() {
        let mut heap = Heap::new();
        for _ in 0..64 {
            let h = heap.insert(HostValue::Num(1.0));
            assert!(h >= RESERVED);
        }
    }

    #[test]
    fn live_handles_are_unique() {
        let mut heap = Heap::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            handles.push(heap.insert(HostValue::Num(i as f64)));
        }
        // interleave releases and inserts
        heap.release(handles[3]);
        heap.release(handles[7]);
        handles.remove(7);
        handles.remove(3);
        handles.push(heap.insert(HostValue::Num(100.0)));
        handles.push(heap.insert(HostValue::Num(101.0)));
        handles.push(heap.insert(HostValue::Num(102.0)));

        let mut sorted = handles.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), handles.len());
    }

    #[test]
    fn freed_slots_are_reused_before_growing() {
        let mut heap = Heap::new();
        let a = heap.insert(HostValue::Num(1.0));
        let b = heap.insert(HostValue::Num(2.0));
        heap.release(a);
        heap.release(b);
        // LIFO free list: b comes back first
        assert_eq!(heap.insert(HostValue::Num(3.0)), b);
        assert_eq!(heap.insert(HostValue::Num(4.0)), a);
    }

    #[test]
    fn take_removes_and_returns_value() {
        let mut heap = Heap::new();
        let h = heap.insert(HostValue::Str("abc".into()));
        let v = heap.take(h).unwrap();
        assert_eq!(v.as_str().unwrap(), "abc");
        assert!(heap.get(h).is_err());
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn take_of_reserved_handle_keeps_the_constant() {
        let mut heap = Heap::new();
        let v = heap.take(TRUE).unwrap();
        assert!(matches!(v, HostValue::Bool(true)));
        assert!(matches!(heap.get(TRUE).unwrap(), HostValue::Bool(true)));
    }

    #[test]
    fn release_of_reserved_handle_is_a_no_op() {
        let mut heap = Heap::new();
        heap.release(UNDEFINED);
        heap.release(FALSE);
        assert!(heap.get(UNDEFINED).is_ok());
        let h = heap.insert(HostValue::Num(9.0));
        assert!(h >= RESERVED);
    }

    #[test]
    fn get_of_dead_handle_fails() {
        let mut heap = Heap::new();
        let h = heap.insert(HostValue::Num(5.0));
        heap.release(h);
        assert!(matches!(heap.get(h), Err(Trap::InvalidHandle(x)) if x == h));
        assert!(matches!(heap.get(9999), Err(Trap::InvalidHandle(9999))));
    }
}
