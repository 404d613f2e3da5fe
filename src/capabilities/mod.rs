//! Capability import table
//!
//! The fixed, versioned set of host operations the guest can name. Each
//! entry documents its argument encoding (primitives by value, strings by
//! (ptr, len) pair, objects by handle) and is a thin call-through: decode
//! arguments, perform exactly one host operation, encode the result.
//! Membership is fixed at instantiation; there is no dynamic registration.
//!
//! Fallible entries capture the host failure into the bridge's pending
//! fault slot and re-raise it as `Trap::HostFault`; the guest polls the
//! slot with `fault_take`.

use serde::Serialize;

use crate::bridge::Bridge;
use crate::error::Trap;
use crate::guest::Value;
use crate::heap::HostValue;

/// Version of the capability surface. Bumped on any signature change.
pub const SURFACE_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityId {
    Log,
    Error,
    Now,
    GlInit,
    GlColor,
    StringNew,
    ObjectDrop,
    ObjectClone,
    ClosureNew,
    CbDrop,
    FaultTake,
    BytesLen,
    BytesCopy,
    NextFrame,
    CancelFrame,
    SetTimeout,
    ClearTimeout,
    Fetch,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    I32,
    F64,
    /// Heap handle.
    Handle,
    /// Guest memory byte offset.
    Ptr,
    /// Byte count paired with the preceding `Ptr`.
    Len,
    /// Guest function-table index.
    Index,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetKind {
    Void,
    I32,
    F64,
    Handle,
    Bool,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CapabilityDescriptor {
    pub id: CapabilityId,
    pub name: &'static str,
    pub params: &'static [ArgKind],
    pub result: RetKind,
    pub fallible: bool,
}

use ArgKind as A;

/// The whole surface. `closure_new`'s trailing `i32` selects the variant:
/// 0 non-reentrant ("FnMut"-like), 1 reentrant ("Fn"-like).
pub const SURFACE: &[CapabilityDescriptor] = &[
    CapabilityDescriptor { id: CapabilityId::Log, name: "log", params: &[A::Ptr, A::Len], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::Error, name: "error", params: &[A::Ptr, A::Len], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::Now, name: "now", params: &[], result: RetKind::F64, fallible: false },
    CapabilityDescriptor { id: CapabilityId::GlInit, name: "gl_init", params: &[], result: RetKind::Void, fallible: true },
    CapabilityDescriptor { id: CapabilityId::GlColor, name: "gl_color", params: &[A::F64, A::F64, A::F64], result: RetKind::Void, fallible: true },
    CapabilityDescriptor { id: CapabilityId::StringNew, name: "string_new", params: &[A::Ptr, A::Len], result: RetKind::Handle, fallible: false },
    CapabilityDescriptor { id: CapabilityId::ObjectDrop, name: "object_drop", params: &[A::Handle], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::ObjectClone, name: "object_clone", params: &[A::Handle], result: RetKind::Handle, fallible: false },
    CapabilityDescriptor { id: CapabilityId::ClosureNew, name: "closure_new", params: &[A::I32, A::I32, A::Index, A::Index, A::I32], result: RetKind::Handle, fallible: false },
    CapabilityDescriptor { id: CapabilityId::CbDrop, name: "cb_drop", params: &[A::Handle], result: RetKind::Bool, fallible: false },
    CapabilityDescriptor { id: CapabilityId::FaultTake, name: "fault_take", params: &[], result: RetKind::Handle, fallible: false },
    CapabilityDescriptor { id: CapabilityId::BytesLen, name: "bytes_len", params: &[A::Handle], result: RetKind::I32, fallible: false },
    CapabilityDescriptor { id: CapabilityId::BytesCopy, name: "bytes_copy", params: &[A::Handle, A::Ptr], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::NextFrame, name: "next_frame", params: &[A::Handle], result: RetKind::I32, fallible: false },
    CapabilityDescriptor { id: CapabilityId::CancelFrame, name: "cancel_frame", params: &[A::I32], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::SetTimeout, name: "set_timeout", params: &[A::Handle, A::F64], result: RetKind::I32, fallible: false },
    CapabilityDescriptor { id: CapabilityId::ClearTimeout, name: "clear_timeout", params: &[A::I32], result: RetKind::Void, fallible: false },
    CapabilityDescriptor { id: CapabilityId::Fetch, name: "fetch", params: &[A::Ptr, A::Len, A::Handle], result: RetKind::I32, fallible: true },
];

pub fn lookup(name: &str) -> Option<&'static CapabilityDescriptor> {
    SURFACE.iter().find(|d| d.name == name)
}

pub fn descriptor(id: CapabilityId) -> &'static CapabilityDescriptor {
    SURFACE
        .iter()
        .find(|d| d.id == id)
        .unwrap_or_else(|| unreachable!("surface covers every id"))
}

#[derive(Serialize)]
struct Surface {
    version: u32,
    capabilities: &'static [CapabilityDescriptor],
}

/// JSON dump of the surface for diagnostics.
pub fn surface_json() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Surface {
        version: SURFACE_VERSION,
        capabilities: SURFACE,
    })
}

fn arg(args: &[Value], index: usize) -> Result<Value, Trap> {
    args.get(index).copied().ok_or(Trap::BadArgument {
        index,
        expected: "missing argument",
    })
}

fn u32_arg(args: &[Value], index: usize) -> Result<u32, Trap> {
    arg(args, index)?.as_u32(index)
}

fn i32_arg(args: &[Value], index: usize) -> Result<i32, Trap> {
    arg(args, index)?.as_i32(index)
}

fn f64_arg(args: &[Value], index: usize) -> Result<f64, Trap> {
    arg(args, index)?.as_f64(index)
}

/// Decode arguments and route to the bridge's implementation of `id`.
///
/// The bridge state is borrowed only for the span of one entry. Entries
/// that can run guest code (dropping a closure runs its destructor) take
/// the closure out under the borrow and release it after the borrow ends,
/// so the destructor's own capability calls find the state free.
pub fn dispatch(
    bridge: &Bridge,
    id: CapabilityId,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let desc = descriptor(id);
    if args.len() != desc.params.len() {
        return Err(Trap::BadArgument {
            index: args.len().min(desc.params.len()),
            expected: "argument count matching the capability signature",
        });
    }

    match id {
        CapabilityId::Log => {
            bridge.lock().cap_log(u32_arg(args, 0)?, u32_arg(args, 1)?)?;
            Ok(None)
        }
        CapabilityId::Error => {
            bridge.lock().cap_error(u32_arg(args, 0)?, u32_arg(args, 1)?)?;
            Ok(None)
        }
        CapabilityId::Now => Ok(Some(Value::F64(bridge.lock().cap_now()))),
        CapabilityId::GlInit => {
            bridge.lock().cap_gl_init()?;
            Ok(None)
        }
        CapabilityId::GlColor => {
            bridge
                .lock()
                .cap_gl_color(f64_arg(args, 0)?, f64_arg(args, 1)?, f64_arg(args, 2)?)?;
            Ok(None)
        }
        CapabilityId::StringNew => {
            let handle = bridge
                .lock()
                .cap_string_new(u32_arg(args, 0)?, u32_arg(args, 1)?)?;
            Ok(Some(Value::I32(handle as i32)))
        }
        CapabilityId::ObjectDrop => {
            let taken = bridge.lock().cap_object_take(u32_arg(args, 0)?)?;
            if let HostValue::Closure(closure) = taken {
                closure.release(bridge)?;
            }
            Ok(None)
        }
        CapabilityId::ObjectClone => {
            let handle = bridge.lock().cap_object_clone(u32_arg(args, 0)?)?;
            Ok(Some(Value::I32(handle as i32)))
        }
        CapabilityId::ClosureNew => {
            let handle = bridge.lock().cap_closure_new(
                u32_arg(args, 0)?,
                u32_arg(args, 1)?,
                u32_arg(args, 2)?,
                u32_arg(args, 3)?,
                i32_arg(args, 4)?,
            )?;
            Ok(Some(Value::I32(handle as i32)))
        }
        CapabilityId::CbDrop => {
            let closure = bridge.lock().cap_closure_take(u32_arg(args, 0)?)?;
            let dropped = closure.release(bridge)?;
            Ok(Some(Value::I32(dropped as i32)))
        }
        CapabilityId::FaultTake => {
            let handle = bridge.lock().cap_fault_take();
            Ok(Some(Value::I32(handle as i32)))
        }
        CapabilityId::BytesLen => {
            let len = bridge.lock().cap_bytes_len(u32_arg(args, 0)?)?;
            Ok(Some(Value::I32(len as i32)))
        }
        CapabilityId::BytesCopy => {
            bridge
                .lock()
                .cap_bytes_copy(u32_arg(args, 0)?, u32_arg(args, 1)?)?;
            Ok(None)
        }
        CapabilityId::NextFrame => {
            let id = bridge.lock().cap_next_frame(u32_arg(args, 0)?)?;
            Ok(Some(Value::I32(id)))
        }
        CapabilityId::CancelFrame => {
            let cancelled = bridge.lock().cap_cancel_frame(i32_arg(args, 0)?);
            if let Some(closure) = cancelled {
                closure.release(bridge)?;
            }
            Ok(None)
        }
        CapabilityId::SetTimeout => {
            let id = bridge
                .lock()
                .cap_set_timeout(u32_arg(args, 0)?, f64_arg(args, 1)?)?;
            Ok(Some(Value::I32(id)))
        }
        CapabilityId::ClearTimeout => {
            let cleared = bridge.lock().cap_clear_timeout(i32_arg(args, 0)?);
            if let Some(closure) = cleared {
                closure.release(bridge)?;
            }
            Ok(None)
        }
        CapabilityId::Fetch => {
            let id = bridge
                .lock()
                .cap_fetch(u32_arg(args, 0)?, u32_arg(args, 1)?, u32_arg(args, 2)?)?;
            Ok(Some(Value::I32(id as i32)))
        }
    }
}
