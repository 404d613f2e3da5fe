//! Bridge orchestrator
//!
//! `BridgeState` owns everything the capability calls touch: the value
//! heap, the memory view cache, the guest exports, the platform, the
//! pending-fault slot and the frame/timer/fetch registries. `Bridge` is a
//! cheap cloneable handle around it.
//!
//! Borrow discipline: state is only borrowed for the span of one
//! capability's decode/execute/encode, never across a call into the
//! guest. Guest re-entry (closure invokes, destructors, the entry point)
//! happens at the handle level between borrows, so an import call made by
//! the guest mid-turn finds the state unborrowed. `BridgeState` methods
//! therefore never call into the guest.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use crate::capabilities::{self, CapabilityId};
use crate::closure::{ClosureKind, GuestClosure};
use crate::error::{HostError, Trap};
use crate::guest::{GuestAlloc, GuestExports, GuestTable, Value};
use crate::heap::{self, Heap, HostValue};
use crate::loader::LoadState;
use crate::marshal;
use crate::memory::MemoryViews;
use crate::platform::HostPlatform;

struct Timer {
    id: i32,
    due: f64,
    closure: GuestClosure,
}

pub(crate) struct BridgeState {
    heap: Heap,
    views: MemoryViews,
    exports: GuestExports,
    platform: Box<dyn HostPlatform>,
    pending_fault: Option<HostValue>,
    state: LoadState,
    next_frame_id: i32,
    frames: Vec<(i32, GuestClosure)>,
    next_timer_id: i32,
    timers: Vec<Timer>,
    next_fetch_id: u64,
    fetches: HashMap<u64, GuestClosure>,
}

/// Handle to one guest instance's bridge. Clones share the instance.
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<RefCell<BridgeState>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").finish_non_exhaustive()
    }
}

impl Bridge {
    /// Wrap a freshly instantiated guest. The capability surface is fixed
    /// from this point on.
    pub fn new(exports: GuestExports, platform: Box<dyn HostPlatform>) -> Self {
        let views = MemoryViews::new(exports.memory.clone());
        Bridge {
            inner: Rc::new(RefCell::new(BridgeState {
                heap: Heap::new(),
                views,
                exports,
                platform,
                pending_fault: None,
                state: LoadState::Instantiated,
                next_frame_id: 1,
                frames: Vec::new(),
                next_timer_id: 1,
                timers: Vec::new(),
                next_fetch_id: 1,
                fetches: HashMap::new(),
            })),
        }
    }

    pub(crate) fn lock(&self) -> RefMut<'_, BridgeState> {
        self.inner.borrow_mut()
    }

    pub fn load_state(&self) -> LoadState {
        self.lock().state
    }

    pub fn guest_table(&self) -> Rc<dyn GuestTable> {
        self.lock().exports.table.clone()
    }

    pub fn guest_alloc(&self) -> Rc<dyn GuestAlloc> {
        self.lock().exports.alloc.clone()
    }

    pub fn read_guest_string(&self, ptr: u32, len: u32) -> Result<String, Trap> {
        let state = self.lock();
        marshal::read_string(&state.views, ptr, len)
    }

    pub fn write_guest_string(&self, s: &str) -> Result<(u32, u32), Trap> {
        let state = self.lock();
        marshal::write_string(s, &*state.exports.alloc, &state.views)
    }

    pub fn write_guest_bytes(&self, data: &[u8]) -> Result<(u32, u32), Trap> {
        let state = self.lock();
        marshal::write_bytes(data, &*state.exports.alloc, &state.views)
    }

    /// Insert a value into the heap, returning its handle.
    pub fn heap_insert(&self, value: HostValue) -> u32 {
        self.lock().heap.insert(value)
    }

    /// Peek at a heap slot.
    pub fn heap_get(&self, handle: u32) -> Result<HostValue, Trap> {
        Ok(self.lock().heap.get(handle)?.clone())
    }

    /// Number of live non-reserved handles.
    pub fn live_handles(&self) -> usize {
        self.lock().heap.live()
    }

    pub fn has_pending_fault(&self) -> bool {
        self.lock().pending_fault.is_some()
    }

    /// Invoke a capability by name, as a guest import call would.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Option<Value>, Trap> {
        let desc = capabilities::lookup(name)
            .ok_or_else(|| Trap::UnknownCapability(name.to_string()))?;
        capabilities::dispatch(self, desc.id, args)
    }

    /// Invoke a capability by id.
    pub fn call_id(&self, id: CapabilityId, args: &[Value]) -> Result<Option<Value>, Trap> {
        capabilities::dispatch(self, id, args)
    }

    // ---- turn drivers -------------------------------------------------

    /// Run the guest entry point. Transitions Instantiated -> Running.
    pub fn start(&self) -> Result<(), Trap> {
        let entry = {
            let mut state = self.lock();
            if state.state != LoadState::Instantiated {
                return Err(Trap::InvalidState {
                    expected: "instantiated",
                });
            }
            // Running first: the entry point may already request frames.
            state.state = LoadState::Running;
            state.exports.start.clone()
        };
        entry(self)
    }

    /// True while at least one frame callback is registered.
    pub fn has_pending_frame(&self) -> bool {
        !self.lock().frames.is_empty()
    }

    /// Fire every frame callback registered before this tick, serialized
    /// in registration order. Callbacks are one-shot; continuing the loop
    /// is the guest's decision (it re-registers from inside the callback).
    /// Returns how many callbacks ran.
    ///
    /// When a callback traps, the not-yet-invoked remainder of the batch
    /// is released without being invoked, so every destructor still runs
    /// exactly once, and the first trap propagates.
    pub fn run_frame(&self, timestamp: f64) -> Result<usize, Trap> {
        let batch = mem::take(&mut self.lock().frames);
        let count = batch.len();
        let mut queue = batch.into_iter();
        for (_, closure) in queue.by_ref() {
            let result = closure.invoke(self, &[Value::F64(timestamp)]);
            let released = closure.release(self);
            if let Err(trap) = result.and(released) {
                self.release_rest(queue.map(|(_, c)| c));
                return Err(trap);
            }
        }
        Ok(count)
    }

    /// Fire every timer due at `now`, in registration order. Error
    /// handling matches [`Bridge::run_frame`].
    pub fn run_timers(&self, now: f64) -> Result<usize, Trap> {
        let due = self.lock().take_due_timers(now);
        let count = due.len();
        let mut queue = due.into_iter();
        for timer in queue.by_ref() {
            let result = timer.closure.invoke(self, &[]);
            let released = timer.closure.release(self);
            if let Err(trap) = result.and(released) {
                self.release_rest(queue.map(|t| t.closure));
                return Err(trap);
            }
        }
        Ok(count)
    }

    /// Deliver completed fetches to their continuations. Success passes a
    /// handle to the response bytes; failure stores the fault and passes
    /// the undefined handle.
    ///
    /// When a continuation traps, the remaining continuations are released
    /// uninvoked and their undelivered byte handles freed, then the trap
    /// propagates.
    pub fn pump_fetches(&self) -> Result<usize, Trap> {
        let ready = {
            let mut state = self.lock();
            let completions = state.platform.poll_fetches();
            let mut ready = Vec::with_capacity(completions.len());
            for completion in completions {
                let closure = match state.fetches.remove(&completion.request) {
                    Some(c) => c,
                    // cancelled or unknown; drop the completion
                    None => continue,
                };
                let arg = match completion.result {
                    Ok(bytes) => {
                        let handle = state.heap.insert(HostValue::Bytes(bytes.into()));
                        Value::I32(handle as i32)
                    }
                    Err(e) => {
                        state.store_fault(e);
                        Value::I32(heap::UNDEFINED as i32)
                    }
                };
                ready.push((closure, arg));
            }
            ready
        };

        let delivered = ready.len();
        let mut queue = ready.into_iter();
        for (closure, arg) in queue.by_ref() {
            let result = closure.invoke(self, &[arg]);
            let released = closure.release(self);
            if let Err(trap) = result.and(released) {
                for (closure, arg) in queue {
                    if let Value::I32(handle) = arg {
                        self.lock().heap.release(handle as u32);
                    }
                    let _ = closure.release(self);
                }
                return Err(trap);
            }
        }
        Ok(delivered)
    }

    /// Release the unprocessed remainder of a callback batch. The trap
    /// already being propagated wins over any destructor failure here.
    fn release_rest(&self, rest: impl Iterator<Item = GuestClosure>) {
        for closure in rest {
            let _ = closure.release(self);
        }
    }
}

impl BridgeState {
    fn store_fault(&mut self, error: HostError) {
        // single slot: a newer fault replaces an unpolled older one
        self.pending_fault = Some(HostValue::Str(error.to_string().into()));
    }

    fn host_result<T>(&mut self, result: Result<T, HostError>) -> Result<T, Trap> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                self.store_fault(e.clone());
                Err(Trap::HostFault(e))
            }
        }
    }

    fn take_due_timers(&mut self, now: f64) -> Vec<Timer> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].due <= now {
                due.push(self.timers.remove(i));
            } else {
                i += 1;
            }
        }
        due
    }

    // ---- capability implementations ----------------------------------
    //
    // None of these call into the guest; entries that can (closure drops,
    // cancellations) hand the closure back to the dispatcher instead.

    pub(crate) fn cap_log(&mut self, ptr: u32, len: u32) -> Result<(), Trap> {
        let message = marshal::read_string(&self.views, ptr, len)?;
        self.platform.console_log(&message);
        Ok(())
    }

    pub(crate) fn cap_error(&mut self, ptr: u32, len: u32) -> Result<(), Trap> {
        let message = marshal::read_string(&self.views, ptr, len)?;
        self.platform.console_error(&message);
        Ok(())
    }

    pub(crate) fn cap_now(&mut self) -> f64 {
        self.platform.now()
    }

    pub(crate) fn cap_gl_init(&mut self) -> Result<(), Trap> {
        let result = self.platform.gl_init();
        self.host_result(result)
    }

    pub(crate) fn cap_gl_color(&mut self, r: f64, g: f64, b: f64) -> Result<(), Trap> {
        let result = self.platform.gl_color(r, g, b);
        self.host_result(result)
    }

    pub(crate) fn cap_string_new(&mut self, ptr: u32, len: u32) -> Result<u32, Trap> {
        let s = marshal::read_string(&self.views, ptr, len)?;
        Ok(self.heap.insert(HostValue::Str(s.into())))
    }

    /// Take any value out of the heap (the `object_drop` path).
    pub(crate) fn cap_object_take(&mut self, handle: u32) -> Result<HostValue, Trap> {
        self.heap.take(handle)
    }

    /// Take a closure out of the heap (the `cb_drop` path).
    pub(crate) fn cap_closure_take(&mut self, handle: u32) -> Result<GuestClosure, Trap> {
        match self.heap.take(handle)? {
            HostValue::Closure(c) => Ok(c),
            _ => Err(Trap::TypeMismatch { expected: "closure" }),
        }
    }

    pub(crate) fn cap_object_clone(&mut self, handle: u32) -> Result<u32, Trap> {
        let value = self.heap.get(handle)?.clone();
        let value = match value {
            HostValue::Closure(c) => HostValue::Closure(c.clone_ref()),
            other => other,
        };
        Ok(self.heap.insert(value))
    }

    pub(crate) fn cap_closure_new(
        &mut self,
        env_a: u32,
        env_b: u32,
        invoke: u32,
        destructor: u32,
        kind: i32,
    ) -> Result<u32, Trap> {
        let kind = if kind == 0 {
            ClosureKind::NonReentrant
        } else {
            ClosureKind::Reentrant
        };
        let closure = GuestClosure::new(env_a, env_b, invoke, destructor, kind);
        Ok(self.heap.insert(HostValue::Closure(closure)))
    }

    pub(crate) fn cap_fault_take(&mut self) -> u32 {
        match self.pending_fault.take() {
            Some(value) => self.heap.insert(value),
            None => heap::UNDEFINED,
        }
    }

    pub(crate) fn cap_bytes_len(&mut self, handle: u32) -> Result<u32, Trap> {
        Ok(self.heap.get(handle)?.as_bytes()?.len() as u32)
    }

    pub(crate) fn cap_bytes_copy(&mut self, handle: u32, ptr: u32) -> Result<(), Trap> {
        let bytes = match self.heap.get(handle)? {
            HostValue::Bytes(b) => b.clone(),
            _ => return Err(Trap::TypeMismatch { expected: "byte buffer" }),
        };
        self.views.bytes().write(ptr, &bytes)
    }

    pub(crate) fn cap_next_frame(&mut self, handle: u32) -> Result<i32, Trap> {
        let closure = self.heap.get(handle)?.as_closure()?.clone_ref();
        let id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        self.frames.push((id, closure));
        Ok(id)
    }

    /// Unregister a pending frame request; `None` when the id is unknown
    /// or already fired (error-free no-op).
    pub(crate) fn cap_cancel_frame(&mut self, id: i32) -> Option<GuestClosure> {
        let pos = self.frames.iter().position(|(fid, _)| *fid == id)?;
        Some(self.frames.remove(pos).1)
    }

    pub(crate) fn cap_set_timeout(&mut self, handle: u32, delay_ms: f64) -> Result<i32, Trap> {
        let closure = self.heap.get(handle)?.as_closure()?.clone_ref();
        let id = self.next_timer_id;
        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        let due = self.platform.now() + delay_ms;
        self.timers.push(Timer { id, due, closure });
        Ok(id)
    }

    pub(crate) fn cap_clear_timeout(&mut self, id: i32) -> Option<GuestClosure> {
        let pos = self.timers.iter().position(|t| t.id == id)?;
        Some(self.timers.remove(pos).closure)
    }

    pub(crate) fn cap_fetch(&mut self, ptr: u32, len: u32, handle: u32) -> Result<u64, Trap> {
        let url = marshal::read_string(&self.views, ptr, len)?;
        let closure = self.heap.get(handle)?.as_closure()?.clone_ref();
        let id = self.next_fetch_id;
        self.next_fetch_id += 1;
        self.fetches.insert(id, closure);
        self.platform.start_fetch(id, &url);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::scripted::ScriptedGuestBuilder;
    use crate::platform::RecordingPlatform;
    use std::cell::Cell;
    use std::rc::Rc;

    fn bridge_with(builder: ScriptedGuestBuilder) -> (Bridge, RecordingPlatform) {
        let platform = RecordingPlatform::new();
        let bridge = Bridge::new(builder.build(), Box::new(platform.clone()));
        (bridge, platform)
    }

    fn v(n: i32) -> Value {
        Value::I32(n)
    }

    fn unwrap_handle(result: Option<Value>) -> u32 {
        match result {
            Some(Value::I32(h)) => h as u32,
            other => panic!("expected a handle, got {:?}", other),
        }
    }

    #[test]
    fn log_capability_receives_decoded_string() {
        let (bridge, platform) = bridge_with(ScriptedGuestBuilder::new());
        let (ptr, len) = bridge.write_guest_string("ready").unwrap();
        bridge.call("log", &[v(ptr as i32), v(len as i32)]).unwrap();
        assert_eq!(platform.logs(), vec!["ready".to_string()]);
    }

    #[test]
    fn string_new_round_trips_through_the_heap() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        let (ptr, len) = bridge.write_guest_string("héllo→世界").unwrap();
        let handle =
            unwrap_handle(bridge.call("string_new", &[v(ptr as i32), v(len as i32)]).unwrap());
        assert_eq!(
            bridge.heap_get(handle).unwrap().as_str().unwrap(),
            "héllo→世界"
        );
        bridge.call("object_drop", &[v(handle as i32)]).unwrap();
        assert!(bridge.heap_get(handle).is_err());
    }

    #[test]
    fn object_clone_yields_an_independent_handle() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        let handle = bridge.heap_insert(HostValue::Str("x".into()));
        let clone = unwrap_handle(bridge.call("object_clone", &[v(handle as i32)]).unwrap());
        assert_ne!(handle, clone);
        bridge.call("object_drop", &[v(handle as i32)]).unwrap();
        assert_eq!(bridge.heap_get(clone).unwrap().as_str().unwrap(), "x");
    }

    #[test]
    fn failed_gl_call_fills_the_fault_slot_and_traps() {
        let (bridge, platform) = bridge_with(ScriptedGuestBuilder::new());
        platform.fail_gl(true);
        let err = bridge.call("gl_init", &[]).unwrap_err();
        assert!(matches!(err, Trap::HostFault(_)));
        assert!(bridge.has_pending_fault());

        let handle = unwrap_handle(bridge.call("fault_take", &[]).unwrap());
        assert_ne!(handle, heap::UNDEFINED);
        let message = bridge.heap_get(handle).unwrap().as_str().unwrap().to_string();
        assert!(message.contains("gl_init"));

        // slot is cleared after one take
        assert!(!bridge.has_pending_fault());
        assert_eq!(
            unwrap_handle(bridge.call("fault_take", &[]).unwrap()),
            heap::UNDEFINED
        );
    }

    #[test]
    fn gl_color_reaches_the_platform() {
        let (bridge, platform) = bridge_with(ScriptedGuestBuilder::new());
        bridge.call("gl_init", &[]).unwrap();
        bridge
            .call(
                "gl_color",
                &[Value::F64(0.25), Value::F64(0.5), Value::F64(1.0)],
            )
            .unwrap();
        assert_eq!(
            platform.gl_calls(),
            vec!["init".to_string(), "color 0.25 0.5 1".to_string()]
        );
    }

    #[test]
    fn closure_destructor_fires_exactly_once_across_clones() {
        let dtor_runs = Rc::new(Cell::new(0u32));
        let runs = dtor_runs.clone();
        let builder = ScriptedGuestBuilder::new()
            .table_entry(1, |_, _| Ok(None)) // invoke shim
            .table_entry(2, move |_, _| {
                runs.set(runs.get() + 1);
                Ok(None)
            });
        let (bridge, _platform) = bridge_with(builder);

        let handle =
            unwrap_handle(bridge.call("closure_new", &[v(7), v(8), v(1), v(2), v(0)]).unwrap());
        let clone = unwrap_handle(bridge.call("object_clone", &[v(handle as i32)]).unwrap());

        let dropped = bridge.call("cb_drop", &[v(handle as i32)]).unwrap().unwrap();
        assert_eq!(dropped, Value::I32(0));
        assert_eq!(dtor_runs.get(), 0);

        let dropped = bridge.call("cb_drop", &[v(clone as i32)]).unwrap().unwrap();
        assert_eq!(dropped, Value::I32(1));
        assert_eq!(dtor_runs.get(), 1);
    }

    #[test]
    fn cancel_frame_is_error_free_for_unknown_ids() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        bridge.call("cancel_frame", &[v(42)]).unwrap();
        assert!(!bridge.has_pending_frame());
    }

    #[test]
    fn cancelled_frame_callback_never_fires() {
        let fired = Rc::new(Cell::new(0u32));
        let fired_in = fired.clone();
        let builder = ScriptedGuestBuilder::new()
            .table_entry(1, move |_, _| {
                fired_in.set(fired_in.get() + 1);
                Ok(None)
            })
            .table_entry(2, |_, _| Ok(None));
        let (bridge, _platform) = bridge_with(builder);

        let handle =
            unwrap_handle(bridge.call("closure_new", &[v(1), v(0), v(1), v(2), v(0)]).unwrap());
        let id = match bridge.call("next_frame", &[v(handle as i32)]).unwrap() {
            Some(Value::I32(id)) => id,
            other => panic!("expected a frame id, got {:?}", other),
        };
        bridge.call("cancel_frame", &[v(id)]).unwrap();

        assert_eq!(bridge.run_frame(16.0).unwrap(), 0);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn timers_fire_when_due() {
        let fired = Rc::new(Cell::new(0u32));
        let fired_in = fired.clone();
        let builder = ScriptedGuestBuilder::new()
            .table_entry(1, move |_, _| {
                fired_in.set(fired_in.get() + 1);
                Ok(None)
            })
            .table_entry(2, |_, _| Ok(None));
        let (bridge, platform) = bridge_with(builder);

        let handle =
            unwrap_handle(bridge.call("closure_new", &[v(1), v(0), v(1), v(2), v(0)]).unwrap());
        bridge
            .call("set_timeout", &[v(handle as i32), Value::F64(100.0)])
            .unwrap();

        assert_eq!(bridge.run_timers(50.0).unwrap(), 0);
        assert_eq!(fired.get(), 0);

        platform.advance_clock(150.0);
        assert_eq!(bridge.run_timers(150.0).unwrap(), 1);
        assert_eq!(fired.get(), 1);

        // one-shot
        assert_eq!(bridge.run_timers(300.0).unwrap(), 0);
    }

    #[test]
    fn cleared_timeout_never_fires() {
        let builder = ScriptedGuestBuilder::new()
            .table_entry(1, |_, _| panic!("timer fired after clear"))
            .table_entry(2, |_, _| Ok(None));
        let (bridge, _platform) = bridge_with(builder);

        let handle =
            unwrap_handle(bridge.call("closure_new", &[v(1), v(0), v(1), v(2), v(0)]).unwrap());
        let id = match bridge
            .call("set_timeout", &[v(handle as i32), Value::F64(10.0)])
            .unwrap()
        {
            Some(Value::I32(id)) => id,
            other => panic!("expected a timer id, got {:?}", other),
        };
        bridge.call("clear_timeout", &[v(id)]).unwrap();
        assert_eq!(bridge.run_timers(1000.0).unwrap(), 0);
    }

    #[test]
    fn bytes_surface_to_the_guest_by_copy() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        let handle = bridge.heap_insert(HostValue::Bytes(vec![1u8, 2, 3, 4].into()));
        let len = match bridge.call("bytes_len", &[v(handle as i32)]).unwrap() {
            Some(Value::I32(n)) => n as u32,
            other => panic!("expected a length, got {:?}", other),
        };
        assert_eq!(len, 4);
        let ptr = bridge.guest_alloc().malloc(len).unwrap();
        bridge
            .call("bytes_copy", &[v(handle as i32), v(ptr as i32)])
            .unwrap();
        let state = bridge.lock();
        assert_eq!(state.views.bytes().read(ptr, len).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        assert!(matches!(
            bridge.call("warp_drive", &[]),
            Err(Trap::UnknownCapability(_))
        ));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let (bridge, _platform) = bridge_with(ScriptedGuestBuilder::new());
        assert!(matches!(
            bridge.call("log", &[v(0)]),
            Err(Trap::BadArgument { .. })
        ));
    }

    // table layout for the trap-mid-batch tests: entry 1 traps, entry 2
    // counts invocations, entry 3 counts destructor runs
    fn trapping_builder(
        good_ran: &Rc<Cell<u32>>,
        dtors: &Rc<Cell<u32>>,
    ) -> ScriptedGuestBuilder {
        let good = good_ran.clone();
        let d = dtors.clone();
        ScriptedGuestBuilder::new()
            .table_entry(1, |bridge, _| bridge.call("boom", &[]))
            .table_entry(2, move |_, _| {
                good.set(good.get() + 1);
                Ok(None)
            })
            .table_entry(3, move |_, _| {
                d.set(d.get() + 1);
                Ok(None)
            })
    }

    fn register_frame_closure(bridge: &Bridge, shim: i32) {
        let handle =
            unwrap_handle(bridge.call("closure_new", &[v(1), v(0), v(shim), v(3), v(0)]).unwrap());
        bridge.call("next_frame", &[v(handle as i32)]).unwrap();
        bridge.call("cb_drop", &[v(handle as i32)]).unwrap();
    }

    #[test]
    fn trap_in_one_frame_callback_releases_the_rest_of_the_batch() {
        let good_ran = Rc::new(Cell::new(0u32));
        let dtors = Rc::new(Cell::new(0u32));
        let (bridge, _platform) = bridge_with(trapping_builder(&good_ran, &dtors));

        register_frame_closure(&bridge, 1);
        register_frame_closure(&bridge, 2);

        let err = bridge.run_frame(16.0).unwrap_err();
        assert!(matches!(err, Trap::UnknownCapability(_)));

        // the later callback was skipped, but both destructors still ran
        assert_eq!(good_ran.get(), 0);
        assert_eq!(dtors.get(), 2);
        assert!(!bridge.has_pending_frame());
        assert_eq!(bridge.run_frame(32.0).unwrap(), 0);
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn trap_in_one_timer_callback_releases_the_rest() {
        let good_ran = Rc::new(Cell::new(0u32));
        let dtors = Rc::new(Cell::new(0u32));
        let (bridge, _platform) = bridge_with(trapping_builder(&good_ran, &dtors));

        for shim in [1, 2] {
            let handle = unwrap_handle(
                bridge
                    .call("closure_new", &[v(1), v(0), v(shim), v(3), v(0)])
                    .unwrap(),
            );
            bridge
                .call("set_timeout", &[v(handle as i32), Value::F64(0.0)])
                .unwrap();
            bridge.call("cb_drop", &[v(handle as i32)]).unwrap();
        }

        let err = bridge.run_timers(10.0).unwrap_err();
        assert!(matches!(err, Trap::UnknownCapability(_)));
        assert_eq!(good_ran.get(), 0);
        assert_eq!(dtors.get(), 2);
        assert_eq!(bridge.run_timers(20.0).unwrap(), 0);
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn trap_in_one_fetch_continuation_releases_the_rest() {
        let good_ran = Rc::new(Cell::new(0u32));
        let dtors = Rc::new(Cell::new(0u32));
        let good = good_ran.clone();
        let d = dtors.clone();
        // the trapping continuation drops its byte handle first, the way a
        // well-behaved guest would before hitting the bad call
        let builder = ScriptedGuestBuilder::new()
            .table_entry(1, |bridge, args| {
                bridge.call("object_drop", &[v(args[2].as_i32(2)?)])?;
                bridge.call("boom", &[])
            })
            .table_entry(2, move |_, _| {
                good.set(good.get() + 1);
                Ok(None)
            })
            .table_entry(3, move |_, _| {
                d.set(d.get() + 1);
                Ok(None)
            });
        let (bridge, platform) = bridge_with(builder);
        platform.respond_to("a.bin", Ok(vec![1]));
        platform.respond_to("b.bin", Ok(vec![2]));

        for (shim, url) in [(1, "a.bin"), (2, "b.bin")] {
            let (ptr, len) = bridge.write_guest_string(url).unwrap();
            let handle = unwrap_handle(
                bridge
                    .call("closure_new", &[v(1), v(0), v(shim), v(3), v(0)])
                    .unwrap(),
            );
            bridge
                .call("fetch", &[v(ptr as i32), v(len as i32), v(handle as i32)])
                .unwrap();
            bridge.call("cb_drop", &[v(handle as i32)]).unwrap();
        }

        let err = bridge.pump_fetches().unwrap_err();
        assert!(matches!(err, Trap::UnknownCapability(_)));
        assert_eq!(good_ran.get(), 0);
        assert_eq!(dtors.get(), 2);
        // the undelivered response bytes were freed along with the closure
        assert_eq!(bridge.live_handles(), 0);
    }
}
