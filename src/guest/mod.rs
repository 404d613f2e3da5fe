//! Guest module contract
//!
//! The bridge never talks to a concrete WebAssembly runtime directly; it
//! talks to the exports every conforming guest must provide: an entry
//! point, an allocator pair, a function table for callback dispatch, and a
//! linear memory. On wasm32 these adapt a real `WebAssembly.Instance`;
//! natively a scripted in-process guest implements the same seam.

pub mod scripted;

use std::rc::Rc;

use crate::bridge::Bridge;
use crate::error::Trap;
use crate::memory::GuestMemory;

/// Required export names.
pub const EXPORT_START: &str = "start";
pub const EXPORT_MAIN: &str = "main";
pub const EXPORT_MALLOC: &str = "malloc";
pub const EXPORT_REALLOC: &str = "realloc";
pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_TABLE: &str = "__indirect_function_table";

/// A value crossing the boundary: the 32-bit calling convention plus the
/// double-width float lane. Strings travel as (ptr, len) pairs of `I32`,
/// host objects as `I32` handles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    F64(f64),
}

impl Value {
    pub fn as_i32(self, index: usize) -> Result<i32, Trap> {
        match self {
            Value::I32(v) => Ok(v),
            Value::F64(_) => Err(Trap::BadArgument { index, expected: "i32" }),
        }
    }

    pub fn as_u32(self, index: usize) -> Result<u32, Trap> {
        Ok(self.as_i32(index)? as u32)
    }

    pub fn as_f64(self, index: usize) -> Result<f64, Trap> {
        match self {
            Value::F64(v) => Ok(v),
            Value::I32(_) => Err(Trap::BadArgument { index, expected: "f64" }),
        }
    }

    /// Decode an untyped numeric return from a guest call: an exact
    /// 32-bit integer takes the `I32` lane, everything else `F64`. Keeps
    /// backends that only see JS numbers on the same convention as
    /// backends with typed returns.
    pub fn from_number(raw: f64) -> Value {
        if raw.fract() == 0.0 && raw >= i32::MIN as f64 && raw <= i32::MAX as f64 {
            Value::I32(raw as i32)
        } else {
            Value::F64(raw)
        }
    }
}

/// Guest-exported allocator pair. Sizes count bytes of guest memory.
pub trait GuestAlloc {
    fn malloc(&self, size: u32) -> Result<u32, Trap>;
    fn realloc(&self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32, Trap>;
}

/// Guest function table used for closure invoke/destructor dispatch.
///
/// Entries receive the full argument list (environment words first for
/// closure shims). The bridge handle is passed unborrowed so entries can
/// make capability calls mid-invocation; implementations must not hold
/// interior borrows across the call.
///
/// Return lane convention: exact 32-bit integer results use `Value::I32`,
/// other numeric results `Value::F64` (see [`Value::from_number`]), so
/// callers see the same lanes from every backend.
pub trait GuestTable {
    fn invoke(&self, index: u32, bridge: &Bridge, args: &[Value])
        -> Result<Option<Value>, Trap>;
}

/// The guest entry point, invoked once on the transition to Running.
pub type GuestEntry = Rc<dyn Fn(&Bridge) -> Result<(), Trap>>;

/// The export set captured at instantiation.
pub struct GuestExports {
    pub memory: GuestMemory,
    pub start: GuestEntry,
    pub alloc: Rc<dyn GuestAlloc>,
    pub table: Rc<dyn GuestTable>,
}
