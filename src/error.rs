//! Error taxonomy for the bridge
//!
//! Three families, matching how failures cross the boundary:
//! - `Trap`: contract violations between guest and host. Not recoverable;
//!   a trap ends the current turn.
//! - `HostError`: host operations that can legitimately fail (network,
//!   rendering API rejecting input). Carried into the pending-fault slot
//!   and re-raised as `Trap::HostFault`; the guest polls the slot.
//! - `LoadError`: bootstrap failures. Fatal, no retry.

use thiserror::Error;

/// A guest-visible trap. Ends the current turn.
#[derive(Debug, Error)]
pub enum Trap {
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    #[error("guest memory access out of bounds: offset {offset} count {count}, memory is {len} bytes")]
    OutOfBounds {
        offset: usize,
        count: usize,
        len: usize,
    },

    #[error("invalid utf-8 crossed the boundary at byte {0}")]
    InvalidUtf8(usize),

    #[error("stale memory view: view generation {view}, memory generation {current}")]
    StaleView { view: u64, current: u64 },

    #[error("non-reentrant closure re-entered during its own call")]
    ReentrantClosure,

    #[error("closure invoked after its last reference was released")]
    ClosureReleased,

    #[error("guest allocator returned a null pointer")]
    AllocFailed,

    #[error("host operation failed: {0}")]
    HostFault(HostError),

    #[error("unknown capability `{0}`")]
    UnknownCapability(String),

    #[error("capability argument {index}: expected {expected}")]
    BadArgument {
        index: usize,
        expected: &'static str,
    },

    #[error("heap slot does not hold the expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("guest table has no function at index {0}")]
    NoSuchTableEntry(u32),

    #[error("bridge must be {expected} for this operation")]
    InvalidState { expected: &'static str },
}

/// A host-operation failure the guest may observe and recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("network: {0}")]
    Network(String),

    #[error("{api}: {message}")]
    Api {
        api: &'static str,
        message: String,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Bootstrap failure. Fatal to the whole bridge; surfaced to the loader's
/// caller, never retried.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module fetch failed for `{url}`: {reason}")]
    Fetch { url: String, reason: String },

    #[error("module compile failed: {0}")]
    Compile(String),

    #[error("module instantiation failed: {0}")]
    Instantiate(String),

    #[error("guest is missing required export `{0}`")]
    MissingExport(&'static str),
}
