//! Browser facade
//!
//! Adapts a JS-instantiated `WebAssembly.Instance` to the guest seam and
//! implements the host platform over web-sys. The page instantiates the
//! module (binding its import object to [`WebBridge::call`]), hands the
//! instance over, then drives [`WebBridge::frame`] from its
//! requestAnimationFrame loop.
//!
//! Every method takes `&self`; a guest import call re-enters the bridge
//! while a host-to-guest call is still on the stack, and only shared
//! borrows survive that.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use js_sys::{Array, Function, Object, Reflect, Uint8Array, WebAssembly};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{HtmlCanvasElement, Performance, Response, WebGlRenderingContext};

use crate::bridge::Bridge;
use crate::capabilities::{self, ArgKind, RetKind};
use crate::error::{HostError, LoadError, Trap};
use crate::guest::{self, GuestAlloc, GuestExports, GuestTable, Value};
use crate::memory::{GuestMemory, LinearMemory};
use crate::platform::{FetchCompletion, HostPlatform};

fn js_error(message: String) -> JsValue {
    js_sys::Error::new(&message).into()
}

fn js_detail(value: &JsValue) -> String {
    value
        .as_string()
        .unwrap_or_else(|| format!("{:?}", value))
}

fn trap_error(trap: Trap) -> JsValue {
    js_error(trap.to_string())
}

/// A guest export call failed on the JS side.
fn export_trap(api: &'static str, err: JsValue) -> Trap {
    Trap::HostFault(HostError::Api {
        api,
        message: js_detail(&err),
    })
}

// ---- export adapters ----------------------------------------------------

/// The instance's linear memory. Growth replaces the backing ArrayBuffer,
/// so the buffer identity doubles as the generation signal.
struct JsLinearMemory {
    memory: WebAssembly::Memory,
    buffer: RefCell<JsValue>,
    generation: Cell<u64>,
}

impl JsLinearMemory {
    fn new(memory: WebAssembly::Memory) -> Rc<Self> {
        let buffer = memory.buffer();
        Rc::new(JsLinearMemory {
            memory,
            buffer: RefCell::new(buffer),
            generation: Cell::new(0),
        })
    }

    fn refresh(&self) {
        let current = self.memory.buffer();
        let stale = !Object::is(&current, &self.buffer.borrow());
        if stale {
            *self.buffer.borrow_mut() = current;
            self.generation.set(self.generation.get() + 1);
        }
    }

    fn bytes(&self) -> Uint8Array {
        Uint8Array::new(&self.buffer.borrow())
    }
}

impl LinearMemory for JsLinearMemory {
    fn len(&self) -> usize {
        self.refresh();
        self.bytes().length() as usize
    }

    fn generation(&self) -> u64 {
        self.refresh();
        self.generation.get()
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), Trap> {
        self.refresh();
        let bytes = self.bytes();
        let len = bytes.length() as usize;
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= len)
            .ok_or(Trap::OutOfBounds {
                offset,
                count: out.len(),
                len,
            })?;
        bytes.subarray(offset as u32, end as u32).copy_to(out);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), Trap> {
        self.refresh();
        let bytes = self.bytes();
        let len = bytes.length() as usize;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= len)
            .ok_or(Trap::OutOfBounds {
                offset,
                count: data.len(),
                len,
            })?;
        bytes.subarray(offset as u32, end as u32).copy_from(data);
        Ok(())
    }
}

/// The guest's exported allocator pair.
struct JsAlloc {
    malloc: Function,
    realloc: Function,
}

impl GuestAlloc for JsAlloc {
    fn malloc(&self, size: u32) -> Result<u32, Trap> {
        let ret = self
            .malloc
            .call1(&JsValue::UNDEFINED, &JsValue::from(size))
            .map_err(|e| export_trap("malloc", e))?;
        ret.as_f64().map(|p| p as u32).ok_or(Trap::AllocFailed)
    }

    fn realloc(&self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32, Trap> {
        let ret = self
            .realloc
            .call3(
                &JsValue::UNDEFINED,
                &JsValue::from(ptr),
                &JsValue::from(old_size),
                &JsValue::from(new_size),
            )
            .map_err(|e| export_trap("realloc", e))?;
        ret.as_f64().map(|p| p as u32).ok_or(Trap::AllocFailed)
    }
}

/// The instance's indirect function table. The bridge handle goes unused
/// here; table functions reach the bridge through the page's import shims.
struct JsTable {
    table: WebAssembly::Table,
}

impl GuestTable for JsTable {
    fn invoke(
        &self,
        index: u32,
        _bridge: &Bridge,
        args: &[Value],
    ) -> Result<Option<Value>, Trap> {
        let func = self
            .table
            .get(index)
            .map_err(|_| Trap::NoSuchTableEntry(index))?;
        let list = Array::new();
        for arg in args {
            match arg {
                Value::I32(v) => list.push(&JsValue::from(*v)),
                Value::F64(v) => list.push(&JsValue::from(*v)),
            };
        }
        let ret = func
            .apply(&JsValue::UNDEFINED, &list)
            .map_err(|e| export_trap("table call", e))?;
        Ok(ret.as_f64().map(Value::from_number))
    }
}

fn export<T: JsCast>(exports: &Object, name: &'static str) -> Result<T, JsValue> {
    let value = Reflect::get(exports.as_ref(), &JsValue::from_str(name))?;
    if value.is_undefined() {
        return Err(js_error(LoadError::MissingExport(name).to_string()));
    }
    value
        .dyn_into::<T>()
        .map_err(|_| js_error(format!("export `{}` has the wrong type", name)))
}

fn adapt_instance(instance: &WebAssembly::Instance) -> Result<GuestExports, JsValue> {
    let exports = instance.exports();
    let memory: WebAssembly::Memory = export(&exports, guest::EXPORT_MEMORY)?;
    let malloc: Function = export(&exports, guest::EXPORT_MALLOC)?;
    let realloc: Function = export(&exports, guest::EXPORT_REALLOC)?;
    let table: WebAssembly::Table = export(&exports, guest::EXPORT_TABLE)?;
    let start: Function = export(&exports, guest::EXPORT_START)
        .or_else(|_| export(&exports, guest::EXPORT_MAIN))?;

    Ok(GuestExports {
        memory: GuestMemory::new(JsLinearMemory::new(memory)),
        start: Rc::new(move |_bridge: &Bridge| {
            start
                .call0(&JsValue::UNDEFINED)
                .map_err(|e| export_trap("start", e))?;
            Ok(())
        }),
        alloc: Rc::new(JsAlloc { malloc, realloc }),
        table: Rc::new(JsTable { table }),
    })
}

// ---- platform -----------------------------------------------------------

struct WebPlatform {
    performance: Performance,
    canvas: HtmlCanvasElement,
    gl: RefCell<Option<WebGlRenderingContext>>,
    completions: Rc<RefCell<Vec<FetchCompletion>>>,
}

impl WebPlatform {
    fn new(canvas_id: &str) -> Result<Self, JsValue> {
        let window = web_sys::window().ok_or_else(|| js_error("no window".to_string()))?;
        let performance = window
            .performance()
            .ok_or_else(|| js_error("performance unavailable".to_string()))?;
        let canvas = window
            .document()
            .and_then(|doc| doc.get_element_by_id(canvas_id))
            .ok_or_else(|| js_error(format!("no canvas `{}`", canvas_id)))?
            .dyn_into::<HtmlCanvasElement>()
            .map_err(|_| js_error(format!("`{}` is not a canvas", canvas_id)))?;
        Ok(WebPlatform {
            performance,
            canvas,
            gl: RefCell::new(None),
            completions: Rc::new(RefCell::new(Vec::new())),
        })
    }

    fn complete(&self, request: u64, result: Result<Vec<u8>, HostError>) {
        self.completions
            .borrow_mut()
            .push(FetchCompletion { request, result });
    }
}

fn api_error(api: &'static str, message: String) -> HostError {
    HostError::Api { api, message }
}

impl HostPlatform for WebPlatform {
    fn console_log(&mut self, message: &str) {
        web_sys::console::log_1(&JsValue::from_str(message));
    }

    fn console_error(&mut self, message: &str) {
        web_sys::console::error_1(&JsValue::from_str(message));
    }

    fn now(&mut self) -> f64 {
        self.performance.now()
    }

    fn gl_init(&mut self) -> Result<(), HostError> {
        let ctx = self
            .canvas
            .get_context("webgl")
            .map_err(|e| api_error("gl_init", js_detail(&e)))?
            .ok_or_else(|| api_error("gl_init", "webgl unavailable".to_string()))?
            .dyn_into::<WebGlRenderingContext>()
            .map_err(|_| api_error("gl_init", "unexpected context type".to_string()))?;
        ctx.clear_color(0.0, 0.0, 0.0, 1.0);
        ctx.clear(WebGlRenderingContext::COLOR_BUFFER_BIT);
        *self.gl.borrow_mut() = Some(ctx);
        Ok(())
    }

    fn gl_color(&mut self, r: f64, g: f64, b: f64) -> Result<(), HostError> {
        let gl = self.gl.borrow();
        let ctx = gl
            .as_ref()
            .ok_or_else(|| api_error("gl_color", "context not initialized".to_string()))?;
        ctx.clear_color(r as f32, g as f32, b as f32, 1.0);
        ctx.clear(WebGlRenderingContext::COLOR_BUFFER_BIT);
        Ok(())
    }

    fn start_fetch(&mut self, request: u64, url: &str) {
        let window = match web_sys::window() {
            Some(w) => w,
            None => {
                self.complete(request, Err(HostError::Unsupported("fetch without a window")));
                return;
            }
        };

        let on_ok = self.completions.clone();
        let on_body_fail = self.completions.clone();
        let on_fail = self.completions.clone();

        let on_buffer = Closure::wrap(Box::new(move |buf: JsValue| {
            on_ok.borrow_mut().push(FetchCompletion {
                request,
                result: Ok(Uint8Array::new(&buf).to_vec()),
            });
        }) as Box<dyn FnMut(JsValue)>);

        let on_response = Closure::wrap(Box::new(move |value: JsValue| {
            let response: Response = match value.dyn_into() {
                Ok(r) => r,
                Err(_) => {
                    on_body_fail.borrow_mut().push(FetchCompletion {
                        request,
                        result: Err(HostError::Network("not a response".to_string())),
                    });
                    return;
                }
            };
            if !response.ok() {
                on_body_fail.borrow_mut().push(FetchCompletion {
                    request,
                    result: Err(HostError::Network(format!("HTTP {}", response.status()))),
                });
                return;
            }
            match response.array_buffer() {
                Ok(promise) => {
                    let _ = promise.then(&on_buffer);
                }
                Err(e) => {
                    on_body_fail.borrow_mut().push(FetchCompletion {
                        request,
                        result: Err(HostError::Network(js_detail(&e))),
                    });
                }
            }
        }) as Box<dyn FnMut(JsValue)>);

        let on_error = Closure::wrap(Box::new(move |err: JsValue| {
            on_fail.borrow_mut().push(FetchCompletion {
                request,
                result: Err(HostError::Network(js_detail(&err))),
            });
        }) as Box<dyn FnMut(JsValue)>);

        let _ = window.fetch_with_str(url).then(&on_response).catch(&on_error);
        // the browser owns the callbacks from here on
        on_response.forget();
        on_error.forget();
    }

    fn poll_fetches(&mut self) -> Vec<FetchCompletion> {
        std::mem::take(&mut self.completions.borrow_mut())
    }
}

// ---- driver -------------------------------------------------------------

/// Derive the module URL from a bootstrap script URL (`app.js` loads
/// `app_bg.wasm`).
#[wasm_bindgen]
pub fn module_url(script_url: &str) -> String {
    match crate::ModuleSource::from_script_url(script_url) {
        crate::ModuleSource::Url(url) => url,
        crate::ModuleSource::Bytes(_) => script_url.to_string(),
    }
}

/// JSON description of the capability surface, for the page's import
/// object generator and for diagnostics.
#[wasm_bindgen]
pub fn surface() -> Result<String, JsValue> {
    capabilities::surface_json().map_err(|e| js_error(e.to_string()))
}

/// One guest instance's bridge, driven by the page.
#[wasm_bindgen]
pub struct WebBridge {
    bridge: Bridge,
}

#[wasm_bindgen]
impl WebBridge {
    /// Wrap an already-instantiated module. The page binds every import to
    /// [`WebBridge::call`] before instantiation and hands the instance
    /// over here.
    #[wasm_bindgen(constructor)]
    pub fn new(instance: &WebAssembly::Instance, canvas_id: &str) -> Result<WebBridge, JsValue> {
        let exports = adapt_instance(instance)?;
        let platform = WebPlatform::new(canvas_id)?;
        Ok(WebBridge {
            bridge: Bridge::new(exports, Box::new(platform)),
        })
    }

    /// Capability entry point for the page's import shims. Arguments
    /// arrive as JS numbers and are decoded against the capability's
    /// signature.
    pub fn call(&self, name: &str, args: Vec<f64>) -> Result<JsValue, JsValue> {
        let desc = capabilities::lookup(name)
            .ok_or_else(|| trap_error(Trap::UnknownCapability(name.to_string())))?;
        if args.len() != desc.params.len() {
            return Err(trap_error(Trap::BadArgument {
                index: args.len().min(desc.params.len()),
                expected: "argument count matching the capability signature",
            }));
        }
        let decoded: Vec<Value> = desc
            .params
            .iter()
            .zip(&args)
            .map(|(kind, &raw)| match kind {
                ArgKind::F64 => Value::F64(raw),
                _ => Value::I32(raw as i32),
            })
            .collect();

        let result = self
            .bridge
            .call_id(desc.id, &decoded)
            .map_err(trap_error)?;
        Ok(match result {
            None => JsValue::UNDEFINED,
            Some(Value::F64(v)) => JsValue::from(v),
            Some(Value::I32(v)) => match desc.result {
                RetKind::Bool => JsValue::from(v != 0),
                _ => JsValue::from(v),
            },
        })
    }

    /// Run the guest entry point.
    pub fn start(&self) -> Result<(), JsValue> {
        self.bridge.start().map_err(trap_error)
    }

    /// One tick: due frame callbacks, due timers, completed fetches.
    /// `timestamp` is the requestAnimationFrame timestamp. Returns how
    /// many guest callbacks ran.
    pub fn frame(&self, timestamp: f64) -> Result<u32, JsValue> {
        let mut ran = self.bridge.run_frame(timestamp).map_err(trap_error)?;
        ran += self.bridge.run_timers(timestamp).map_err(trap_error)?;
        ran += self.bridge.pump_fetches().map_err(trap_error)?;
        Ok(ran as u32)
    }

    /// Whether the page should schedule another animation frame.
    pub fn has_pending_frame(&self) -> bool {
        self.bridge.has_pending_frame()
    }

    pub fn has_pending_fault(&self) -> bool {
        self.bridge.has_pending_fault()
    }

    /// Live handle count, for leak checks during development.
    pub fn live_handles(&self) -> u32 {
        self.bridge.live_handles() as u32
    }
}
