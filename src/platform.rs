//! Host platform seam
//!
//! Everything with a real effect in the outside world goes through
//! `HostPlatform`: console output, the monotonic clock, the rendering
//! context, network fetches. The browser build implements it over web-sys;
//! natively there is a stdout-backed platform for the CLI and a recording
//! platform for tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::error::HostError;

/// Outcome of an asynchronous fetch started with `start_fetch`.
pub struct FetchCompletion {
    pub request: u64,
    pub result: Result<Vec<u8>, HostError>,
}

/// The capability-providing host. One instance per bridge; all calls happen
/// on the bridge's single logical thread.
pub trait HostPlatform {
    fn console_log(&mut self, message: &str);
    fn console_error(&mut self, message: &str);

    /// Monotonic milliseconds.
    fn now(&mut self) -> f64;

    fn gl_init(&mut self) -> Result<(), HostError>;
    fn gl_color(&mut self, r: f64, g: f64, b: f64) -> Result<(), HostError>;

    /// Begin an asynchronous fetch. Completion is delivered later through
    /// `poll_fetches`; the platform never calls back into the bridge.
    fn start_fetch(&mut self, request: u64, url: &str);

    /// Drain completed fetches.
    fn poll_fetches(&mut self) -> Vec<FetchCompletion>;
}

/// Stdout-backed platform for native smoke runs.
pub struct NativePlatform {
    epoch: Instant,
}

impl NativePlatform {
    pub fn new() -> Self {
        NativePlatform {
            epoch: Instant::now(),
        }
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        NativePlatform::new()
    }
}

impl HostPlatform for NativePlatform {
    fn console_log(&mut self, message: &str) {
        println!("{}", message);
    }

    fn console_error(&mut self, message: &str) {
        eprintln!("{}", message);
    }

    fn now(&mut self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn gl_init(&mut self) -> Result<(), HostError> {
        println!("[gl] init");
        Ok(())
    }

    fn gl_color(&mut self, r: f64, g: f64, b: f64) -> Result<(), HostError> {
        println!("[gl] color {:.2} {:.2} {:.2}", r, g, b);
        Ok(())
    }

    fn start_fetch(&mut self, _request: u64, url: &str) {
        eprintln!("fetch `{}` ignored: not supported natively", url);
    }

    fn poll_fetches(&mut self) -> Vec<FetchCompletion> {
        Vec::new()
    }
}

#[derive(Default)]
struct Recorded {
    logs: Vec<String>,
    errors: Vec<String>,
    gl_calls: Vec<String>,
    clock: f64,
    fail_gl: bool,
    responses: HashMap<String, Result<Vec<u8>, HostError>>,
    completions: Vec<FetchCompletion>,
}

/// Test double that records every host effect. Clones share state, so a
/// test can keep one clone and hand the other to the bridge.
#[derive(Clone, Default)]
pub struct RecordingPlatform {
    inner: Rc<RefCell<Recorded>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        RecordingPlatform::default()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.borrow().logs.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.borrow().errors.clone()
    }

    pub fn gl_calls(&self) -> Vec<String> {
        self.inner.borrow().gl_calls.clone()
    }

    pub fn advance_clock(&self, ms: f64) {
        self.inner.borrow_mut().clock += ms;
    }

    /// Make subsequent rendering calls fail, to exercise the fault slot.
    pub fn fail_gl(&self, fail: bool) {
        self.inner.borrow_mut().fail_gl = fail;
    }

    /// Script the response for a URL. Unscripted URLs complete with a
    /// network error.
    pub fn respond_to(&self, url: &str, result: Result<Vec<u8>, HostError>) {
        self.inner.borrow_mut().responses.insert(url.to_string(), result);
    }
}

impl HostPlatform for RecordingPlatform {
    fn console_log(&mut self, message: &str) {
        self.inner.borrow_mut().logs.push(message.to_string());
    }

    fn console_error(&mut self, message: &str) {
        self.inner.borrow_mut().errors.push(message.to_string());
    }

    fn now(&mut self) -> f64 {
        self.inner.borrow().clock
    }

    fn gl_init(&mut self) -> Result<(), HostError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_gl {
            return Err(HostError::Api {
                api: "gl_init",
                message: "no rendering context".to_string(),
            });
        }
        inner.gl_calls.push("init".to_string());
        Ok(())
    }

    fn gl_color(&mut self, r: f64, g: f64, b: f64) -> Result<(), HostError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_gl {
            return Err(HostError::Api {
                api: "gl_color",
                message: "context lost".to_string(),
            });
        }
        inner.gl_calls.push(format!("color {} {} {}", r, g, b));
        Ok(())
    }

    fn start_fetch(&mut self, request: u64, url: &str) {
        let mut inner = self.inner.borrow_mut();
        let result = inner.responses.remove(url).unwrap_or_else(|| {
            Err(HostError::Network(format!("no route to `{}`", url)))
        });
        inner.completions.push(FetchCompletion { request, result });
    }

    fn poll_fetches(&mut self) -> Vec<FetchCompletion> {
        std::mem::take(&mut self.inner.borrow_mut().completions)
    }
}
