//! Closure bridge: guest function pointers as host-callable values
//!
//! A guest closure is an `(env_a, env_b)` environment pair plus two indices
//! into the guest's function table: the invoke shim and the destructor.
//! The host wraps the quadruple in a reference-counted handle so one guest
//! closure can be invoked many times and destroyed exactly once. The count
//! is incremented around every call, so a closure that releases itself
//! mid-call is destroyed only after the call unwinds.
//!
//! Two variants:
//! - `Reentrant` ("Fn"-like): the environment stays in place during a call;
//!   the closure may call itself.
//! - `NonReentrant` ("FnMut"-like): `env_a` is taken out for the duration
//!   of the call. A nested invocation finds it zeroed and faults with
//!   `Trap::ReentrantClosure` instead of running on stale state.

use std::cell::Cell;
use std::rc::Rc;

use crate::bridge::Bridge;
use crate::error::Trap;
use crate::guest::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosureKind {
    Reentrant,
    NonReentrant,
}

struct ClosureState {
    env_a: Cell<u32>,
    env_b: u32,
    invoke: u32,
    destructor: u32,
    refs: Cell<u32>,
    kind: ClosureKind,
}

/// Host handle to a guest closure. Cloning the handle does not add a
/// strong reference; use [`GuestClosure::clone_ref`] for that, and pair
/// every strong reference with a [`GuestClosure::release`].
#[derive(Clone)]
pub struct GuestClosure(Rc<ClosureState>);

impl GuestClosure {
    /// Wrap a guest closure. The initial reference count is 1, owned by
    /// the caller.
    pub fn new(env_a: u32, env_b: u32, invoke: u32, destructor: u32, kind: ClosureKind) -> Self {
        GuestClosure(Rc::new(ClosureState {
            env_a: Cell::new(env_a),
            env_b,
            invoke,
            destructor,
            refs: Cell::new(1),
            kind,
        }))
    }

    pub fn kind(&self) -> ClosureKind {
        self.0.kind
    }

    pub fn ref_count(&self) -> u32 {
        self.0.refs.get()
    }

    /// Take a new strong reference.
    pub fn clone_ref(&self) -> GuestClosure {
        self.0.refs.set(self.0.refs.get() + 1);
        self.clone()
    }

    /// Invoke the closure through the guest's function table, passing the
    /// environment pair followed by `args`.
    pub fn invoke(&self, bridge: &Bridge, args: &[Value]) -> Result<Option<Value>, Trap> {
        let state = &self.0;
        if state.refs.get() == 0 {
            return Err(Trap::ClosureReleased);
        }
        // Hold a reference across the call so the environment cannot be
        // destroyed out from under us.
        state.refs.set(state.refs.get() + 1);

        let (env_a, reentered) = match state.kind {
            ClosureKind::NonReentrant => {
                let a = state.env_a.replace(0);
                (a, a == 0)
            }
            ClosureKind::Reentrant => (state.env_a.get(), false),
        };

        if reentered {
            state.refs.set(state.refs.get() - 1);
            return Err(Trap::ReentrantClosure);
        }

        let mut call_args = Vec::with_capacity(args.len() + 2);
        call_args.push(Value::I32(env_a as i32));
        call_args.push(Value::I32(state.env_b as i32));
        call_args.extend_from_slice(args);

        let table = bridge.guest_table();
        let result = table.invoke(state.invoke, bridge, &call_args);

        let refs = state.refs.get() - 1;
        state.refs.set(refs);
        if refs == 0 {
            // Last reference went away during the call; destroy now, with
            // the environment words captured before the call.
            self.destroy(bridge, env_a)?;
        } else if state.kind == ClosureKind::NonReentrant {
            state.env_a.set(env_a);
        }

        result
    }

    /// Drop one strong reference. When the count reaches zero the guest
    /// destructor runs exactly once, synchronously, and the environment is
    /// permanently zeroed. Returns whether the destructor ran.
    pub fn release(&self, bridge: &Bridge) -> Result<bool, Trap> {
        let refs = self.0.refs.get();
        debug_assert!(refs > 0, "closure released more times than referenced");
        if refs == 0 {
            return Ok(false);
        }
        self.0.refs.set(refs - 1);
        if refs - 1 == 0 {
            let env_a = self.0.env_a.get();
            self.destroy(bridge, env_a)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn destroy(&self, bridge: &Bridge, env_a: u32) -> Result<(), Trap> {
        self.0.env_a.set(0);
        let table = bridge.guest_table();
        table.invoke(
            self.0.destructor,
            bridge,
            &[Value::I32(env_a as i32), Value::I32(self.0.env_b as i32)],
        )?;
        Ok(())
    }
}
