//! End-to-end bridge tests: a scripted guest driven through bootstrap,
//! the frame loop and the fetch pipeline, exactly the way the CLI and the
//! browser page drive a real module.

use std::cell::Cell;
use std::rc::Rc;

use wasmlink::error::HostError;
use wasmlink::guest::scripted::{ScriptedBackend, ScriptedGuestBuilder};
use wasmlink::guest::{GuestExports, Value};
use wasmlink::platform::RecordingPlatform;
use wasmlink::{bootstrap, Bridge, LoadState, ModuleSource};

const FRAME_SHIM: u32 = 1;
const FRAME_DTOR: u32 = 2;
const FETCH_SHIM: u32 = 3;

fn i(v: i32) -> Value {
    Value::I32(v)
}

fn log(bridge: &Bridge, message: &str) -> Result<(), wasmlink::Trap> {
    let (ptr, len) = bridge.write_guest_string(message)?;
    bridge.call("log", &[i(ptr as i32), i(len as i32)])?;
    Ok(())
}

fn new_frame_closure(bridge: &Bridge) -> Result<Value, wasmlink::Trap> {
    let handle = bridge
        .call(
            "closure_new",
            &[
                i(1),
                i(0),
                i(FRAME_SHIM as i32),
                i(FRAME_DTOR as i32),
                i(0),
            ],
        )?
        .ok_or(wasmlink::Trap::TypeMismatch { expected: "closure" })?;
    Ok(handle)
}

/// A guest that logs a banner, requests a frame, and keeps re-registering
/// its frame callback `frames` times, recoloring the canvas each tick.
fn rendering_guest(frames: u32) -> GuestExports {
    let remaining = Rc::new(Cell::new(frames));

    let counter = remaining.clone();
    ScriptedGuestBuilder::new()
        .table_entry(FRAME_SHIM, move |bridge, args| {
            let timestamp = args[2].as_f64(2)?;
            let left = counter.get();
            bridge.call(
                "gl_color",
                &[
                    Value::F64(left as f64 / frames as f64),
                    Value::F64(0.0),
                    Value::F64(0.0),
                ],
            )?;
            log(bridge, &format!("tick {:.0}", timestamp))?;
            if left > 1 {
                counter.set(left - 1);
                let handle = new_frame_closure(bridge)?;
                bridge.call("next_frame", &[handle])?;
                bridge.call("cb_drop", &[handle])?;
            }
            Ok(None)
        })
        .table_entry(FRAME_DTOR, |_, _| Ok(None))
        .on_start(|bridge| {
            log(bridge, "ready")?;
            bridge.call("gl_init", &[])?;
            let handle = new_frame_closure(bridge)?;
            bridge.call("next_frame", &[handle])?;
            bridge.call("cb_drop", &[handle])?;
            Ok(())
        })
        .build()
}

fn boot(exports: GuestExports) -> (Bridge, RecordingPlatform) {
    let platform = RecordingPlatform::new();
    let mut backend = ScriptedBackend::new(exports);
    let bridge = bootstrap(
        &mut backend,
        ModuleSource::Bytes(b"\0asm".to_vec()),
        Box::new(platform.clone()),
    )
    .unwrap();
    (bridge, platform)
}

#[test]
fn boot_logs_and_enters_the_frame_loop() {
    let (bridge, platform) = boot(rendering_guest(3));

    bridge.start().unwrap();
    assert_eq!(bridge.load_state(), LoadState::Running);
    assert_eq!(platform.logs(), vec!["ready".to_string()]);
    assert!(bridge.has_pending_frame());

    let mut timestamp = 0.0;
    let mut ticks = 0;
    while bridge.has_pending_frame() {
        timestamp += 16.0;
        ticks += bridge.run_frame(timestamp).unwrap();
    }
    assert_eq!(ticks, 3);
    assert_eq!(
        platform.logs(),
        vec!["ready", "tick 16", "tick 32", "tick 48"]
    );
    // gl_init plus one recolor per tick
    assert_eq!(platform.gl_calls().len(), 4);
    // every closure handle was dropped and every callback released
    assert_eq!(bridge.live_handles(), 0);
}

#[test]
fn frame_callbacks_are_one_shot_without_re_registration() {
    let (bridge, _platform) = boot(rendering_guest(1));
    bridge.start().unwrap();

    assert_eq!(bridge.run_frame(16.0).unwrap(), 1);
    assert!(!bridge.has_pending_frame());
    assert_eq!(bridge.run_frame(32.0).unwrap(), 0);
}

/// Guest that fetches a texture at startup; the continuation copies the
/// bytes into guest memory and logs the byte count, or polls the fault
/// slot when the handle comes back undefined.
fn fetching_guest(url: &'static str) -> GuestExports {
    ScriptedGuestBuilder::new()
        .table_entry(FETCH_SHIM, |bridge, args| {
            // args: env_a, env_b, response handle
            let handle = args[2].as_i32(2)?;
            if handle == 0 {
                let fault = bridge.call("fault_take", &[])?;
                let fault = fault.ok_or(wasmlink::Trap::TypeMismatch { expected: "handle" })?;
                let message = bridge
                    .heap_get(fault.as_u32(0)?)?
                    .as_str()?
                    .to_string();
                log(bridge, &format!("fetch failed: {}", message))?;
                bridge.call("object_drop", &[fault])?;
                return Ok(None);
            }
            let len = bridge
                .call("bytes_len", &[i(handle)])?
                .ok_or(wasmlink::Trap::TypeMismatch { expected: "length" })?;
            let ptr = bridge.guest_alloc().malloc(len.as_u32(0)?)?;
            bridge.call("bytes_copy", &[i(handle), i(ptr as i32)])?;
            log(bridge, &format!("texture: {} bytes", len.as_u32(0)?))?;
            bridge.call("object_drop", &[i(handle)])?;
            Ok(None)
        })
        .table_entry(FRAME_DTOR, |_, _| Ok(None))
        .on_start(move |bridge| {
            let (ptr, len) = bridge.write_guest_string(url)?;
            let handle = bridge
                .call(
                    "closure_new",
                    &[i(5), i(0), i(FETCH_SHIM as i32), i(FRAME_DTOR as i32), i(0)],
                )?
                .ok_or(wasmlink::Trap::TypeMismatch { expected: "closure" })?;
            bridge.call("fetch", &[i(ptr as i32), i(len as i32), handle])?;
            bridge.call("cb_drop", &[handle])?;
            Ok(())
        })
        .build()
}

#[test]
fn completed_fetch_delivers_bytes_to_the_continuation() {
    let (bridge, platform) = boot(fetching_guest("assets/cube.bin"));
    platform.respond_to("assets/cube.bin", Ok(vec![7u8; 96]));

    bridge.start().unwrap();
    assert_eq!(bridge.pump_fetches().unwrap(), 1);
    assert_eq!(platform.logs(), vec!["texture: 96 bytes".to_string()]);
    assert_eq!(bridge.live_handles(), 0);
}

#[test]
fn failed_fetch_still_invokes_the_continuation() {
    let (bridge, platform) = boot(fetching_guest("assets/missing.bin"));
    platform.respond_to(
        "assets/missing.bin",
        Err(HostError::Network("HTTP 404".to_string())),
    );

    bridge.start().unwrap();
    assert_eq!(bridge.pump_fetches().unwrap(), 1);
    assert_eq!(platform.logs(), vec!["fetch failed: network: HTTP 404".to_string()]);
    assert!(!bridge.has_pending_fault());
    assert_eq!(bridge.live_handles(), 0);
}

#[test]
fn timers_and_frames_share_the_loop() {
    let fired = Rc::new(Cell::new(false));
    let fired_in = fired.clone();
    let exports = ScriptedGuestBuilder::new()
        .table_entry(FRAME_SHIM, move |_, _| {
            fired_in.set(true);
            Ok(None)
        })
        .table_entry(FRAME_DTOR, |_, _| Ok(None))
        .on_start(|bridge| {
            let handle = new_frame_closure(bridge)?;
            bridge.call("set_timeout", &[handle, Value::F64(30.0)])?;
            bridge.call("cb_drop", &[handle])?;
            Ok(())
        })
        .build();
    let (bridge, platform) = boot(exports);
    bridge.start().unwrap();

    platform.advance_clock(10.0);
    assert_eq!(bridge.run_timers(10.0).unwrap(), 0);
    assert!(!fired.get());

    platform.advance_clock(40.0);
    assert_eq!(bridge.run_timers(50.0).unwrap(), 1);
    assert!(fired.get());
    assert_eq!(bridge.live_handles(), 0);
}

#[test]
fn capability_surface_is_versioned_json() {
    let json = wasmlink::capabilities::surface_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["version"], 1);
    let names: Vec<&str> = parsed["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    for required in ["log", "now", "gl_init", "closure_new", "next_frame", "fetch"] {
        assert!(names.contains(&required), "missing {}", required);
    }
}
