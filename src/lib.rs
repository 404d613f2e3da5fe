//! Host/guest bridge for a WebAssembly rendering module
//!
//! Connects a sandboxed compute module to a capability-providing host:
//! integer handles for host objects, typed views over guest linear memory,
//! string/buffer marshalling through the guest's own allocator, reference
//! counted guest closures, a fixed capability import table, and the
//! bootstrap/frame loop that keeps a render callback alive.
//!
//! One bridge per guest instance, single logical thread. The host only
//! re-enters the guest between suspension points (frame ticks, timers,
//! fetch continuations), so the bridge carries no locks.

use wasm_bindgen::prelude::*;

pub mod capabilities;
pub mod closure;
pub mod error;
pub mod guest;
pub mod heap;
pub mod marshal;
pub mod memory;
pub mod platform;
mod bridge;
mod loader;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use bridge::Bridge;
pub use error::{HostError, LoadError, Trap};
pub use loader::{bootstrap, LoadState, ModuleBackend, ModuleSource};

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Log to browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);

    #[wasm_bindgen(js_namespace = console)]
    fn error(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn log(s: &str) {
    println!("LOG: {}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn error(s: &str) {
    eprintln!("ERROR: {}", s);
}

/// Helper macro for console logging
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => ($crate::log(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => ($crate::error(&format!($($t)*)))
}
