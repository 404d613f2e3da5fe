use std::cell::Cell;
use std::env;
use std::process;
use std::rc::Rc;

use wasmlink::guest::scripted::{ScriptedBackend, ScriptedGuestBuilder};
use wasmlink::guest::Value;
use wasmlink::platform::NativePlatform;
use wasmlink::{bootstrap, ModuleSource};

// Table indices of the demo guest
const FRAME_SHIM: u32 = 1;
const FRAME_DTOR: u32 = 2;

/// Build a scripted guest that behaves like the real rendering module:
/// logs a banner, initializes the rendering context, then animates the
/// clear color for `frames` frames by re-registering its frame callback.
fn demo_guest(frames: u32) -> wasmlink::guest::GuestExports {
    let remaining = Rc::new(Cell::new(frames));
    let counter = remaining.clone();

    ScriptedGuestBuilder::new()
        .table_entry(FRAME_SHIM, move |bridge, args| {
            // args: env_a, env_b, timestamp
            let env_a = args[0].as_i32(0)?;
            let timestamp = args[2].as_f64(2)?;
            let left = counter.get();

            let shade = 1.0 - (left as f64 / frames.max(1) as f64);
            bridge.call(
                "gl_color",
                &[Value::F64(shade), Value::F64(0.2), Value::F64(0.4)],
            )?;

            let (ptr, len) =
                bridge.write_guest_string(&format!("frame at {:.1}ms", timestamp))?;
            bridge.call("log", &[Value::I32(ptr as i32), Value::I32(len as i32)])?;

            if left > 1 {
                counter.set(left - 1);
                // keep the loop alive: register ourselves again
                let handle = bridge
                    .call(
                        "closure_new",
                        &[
                            Value::I32(env_a),
                            Value::I32(0),
                            Value::I32(FRAME_SHIM as i32),
                            Value::I32(FRAME_DTOR as i32),
                            Value::I32(0),
                        ],
                    )?
                    .ok_or(wasmlink::Trap::BadArgument {
                        index: 0,
                        expected: "closure handle",
                    })?;
                bridge.call("next_frame", &[handle])?;
                bridge.call("cb_drop", &[handle])?;
            }
            Ok(None)
        })
        .table_entry(FRAME_DTOR, |_, _| Ok(None))
        .on_start(move |bridge| {
            let (ptr, len) = bridge.write_guest_string("demo guest ready")?;
            bridge.call("log", &[Value::I32(ptr as i32), Value::I32(len as i32)])?;
            bridge.call("gl_init", &[])?;

            let handle = bridge
                .call(
                    "closure_new",
                    &[
                        Value::I32(1),
                        Value::I32(0),
                        Value::I32(FRAME_SHIM as i32),
                        Value::I32(FRAME_DTOR as i32),
                        Value::I32(0),
                    ],
                )?
                .ok_or(wasmlink::Trap::BadArgument {
                    index: 0,
                    expected: "closure handle",
                })?;
            bridge.call("next_frame", &[handle])?;
            bridge.call("cb_drop", &[handle])?;
            Ok(())
        })
        .build()
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut frames = 3u32;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" => {
                i += 1;
                frames = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => n,
                    None => {
                        eprintln!("Invalid frame count");
                        process::exit(1);
                    }
                };
            }
            "--surface" => {
                match wasmlink::capabilities::surface_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("surface dump failed: {}", e),
                }
                return;
            }
            _ => {
                eprintln!("Usage: {} [--frames <n>] [--surface]", args[0]);
                process::exit(1);
            }
        }
        i += 1;
    }

    println!("wasmlink CLI");
    println!("Driving demo guest for {} frames", frames);

    let mut backend = ScriptedBackend::new(demo_guest(frames));
    let bridge = match bootstrap(
        &mut backend,
        ModuleSource::Bytes(b"\0asm".to_vec()),
        Box::new(NativePlatform::new()),
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("bootstrap failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = bridge.start() {
        eprintln!("guest start trapped: {}", e);
        process::exit(1);
    }

    let mut timestamp = 0.0;
    while bridge.has_pending_frame() {
        timestamp += 16.7;
        if let Err(e) = bridge.run_frame(timestamp) {
            eprintln!("frame callback trapped: {}", e);
            process::exit(1);
        }
    }

    println!("Done.");
}
