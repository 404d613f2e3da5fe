//! Bootstrap: module loading and instantiation
//!
//! `Unloaded -> Loading (fetch + compile) -> Instantiated -> Running`.
//! Any failure while Loading is fatal to the whole bridge; there is no
//! retry policy. `Unloaded` is never re-entered.

use crate::bridge::Bridge;
use crate::error::LoadError;
use crate::guest::GuestExports;
use crate::platform::HostPlatform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Instantiated,
    Running,
}

/// Where the module bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleSource {
    Bytes(Vec<u8>),
    Url(String),
}

impl ModuleSource {
    /// Derive the module URL from the bootstrap script's own URL by suffix
    /// substitution: `app.js` loads `app_bg.wasm`. A URL without the `.js`
    /// suffix is used as-is.
    pub fn from_script_url(script_url: &str) -> ModuleSource {
        match script_url.strip_suffix(".js") {
            Some(base) => ModuleSource::Url(format!("{}_bg.wasm", base)),
            None => ModuleSource::Url(script_url.to_string()),
        }
    }
}

/// Compilation/instantiation seam. The browser build delegates to the JS
/// host; natively a scripted backend serves in-process guests.
pub trait ModuleBackend {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, LoadError>;

    /// Compile and instantiate; the capability import table is bound here,
    /// fixed for the instance's lifetime.
    fn instantiate(&mut self, bytes: &[u8]) -> Result<GuestExports, LoadError>;
}

/// Fetch, compile and instantiate a module, producing a bridge in the
/// `Instantiated` state. Call [`Bridge::start`] to enter `Running`.
pub fn bootstrap(
    backend: &mut dyn ModuleBackend,
    source: ModuleSource,
    platform: Box<dyn HostPlatform>,
) -> Result<Bridge, LoadError> {
    // Loading
    let bytes = match source {
        ModuleSource::Bytes(bytes) => bytes,
        ModuleSource::Url(url) => {
            crate::console_log!("fetching module from {}", url);
            backend.fetch(&url)?
        }
    };
    let exports = backend.instantiate(&bytes)?;
    // Instantiated
    Ok(Bridge::new(exports, platform))
}
