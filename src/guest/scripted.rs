//! Scripted in-process guest
//!
//! Stands in for a real compiled module on native builds: its linear
//! memory is a heap vector, its allocator is a growing bump allocator and
//! its function table is a map of Rust closures. The CLI smoke runner and
//! the test suite drive the whole bridge against it.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bridge::Bridge;
use crate::error::{LoadError, Trap};
use crate::guest::{GuestAlloc, GuestEntry, GuestExports, GuestTable, Value};
use crate::loader::ModuleBackend;
use crate::memory::{GuestMemory, HeapMemory, LinearMemory};

pub type TableFn = Rc<dyn Fn(&Bridge, &[Value]) -> Result<Option<Value>, Trap>>;

pub struct ScriptedGuest {
    memory: Rc<HeapMemory>,
    top: Cell<u32>,
    table: RefCell<HashMap<u32, TableFn>>,
}

impl GuestAlloc for ScriptedGuest {
    fn malloc(&self, size: u32) -> Result<u32, Trap> {
        // word-aligned bump allocation, growing the memory as needed
        let ptr = (self.top.get() + 7) & !7;
        let end = ptr
            .checked_add(size)
            .ok_or(Trap::AllocFailed)?;
        while end as usize > self.memory.len() {
            self.memory.grow(64 * 1024);
        }
        self.top.set(end);
        Ok(ptr)
    }

    fn realloc(&self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32, Trap> {
        let new_ptr = self.malloc(new_size)?;
        let count = old_size.min(new_size) as usize;
        let mut carried = vec![0u8; count];
        self.memory.read(ptr as usize, &mut carried)?;
        self.memory.write(new_ptr as usize, &carried)?;
        Ok(new_ptr)
    }
}

impl GuestTable for ScriptedGuest {
    fn invoke(
        &self,
        index: u32,
        bridge: &Bridge,
        args: &[Value],
    ) -> Result<Option<Value>, Trap> {
        // clone the entry out so the map is not borrowed during the call;
        // entries re-enter the bridge and may invoke other table entries
        let entry = self
            .table
            .borrow()
            .get(&index)
            .cloned()
            .ok_or(Trap::NoSuchTableEntry(index))?;
        entry(bridge, args)
    }
}

pub struct ScriptedGuestBuilder {
    memory_size: usize,
    start: Option<GuestEntry>,
    table: HashMap<u32, TableFn>,
}

impl ScriptedGuestBuilder {
    pub fn new() -> Self {
        ScriptedGuestBuilder {
            memory_size: 64 * 1024,
            start: None,
            table: HashMap::new(),
        }
    }

    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.memory_size = bytes;
        self
    }

    /// The guest entry point, run once on the transition to Running.
    pub fn on_start(
        mut self,
        f: impl Fn(&Bridge) -> Result<(), Trap> + 'static,
    ) -> Self {
        self.start = Some(Rc::new(f));
        self
    }

    /// Install a function-table entry (closure invoke shims, destructors,
    /// any callback export).
    pub fn table_entry(
        mut self,
        index: u32,
        f: impl Fn(&Bridge, &[Value]) -> Result<Option<Value>, Trap> + 'static,
    ) -> Self {
        self.table.insert(index, Rc::new(f));
        self
    }

    pub fn build(self) -> GuestExports {
        let guest = Rc::new(ScriptedGuest {
            memory: HeapMemory::new(self.memory_size),
            top: Cell::new(16),
            table: RefCell::new(self.table),
        });
        GuestExports {
            memory: GuestMemory::new(guest.memory.clone()),
            start: self.start.unwrap_or_else(|| Rc::new(|_| Ok(()))),
            alloc: guest.clone(),
            table: guest,
        }
    }
}

impl Default for ScriptedGuestBuilder {
    fn default() -> Self {
        ScriptedGuestBuilder::new()
    }
}

/// Module backend serving a pre-built scripted guest, with an in-memory
/// URL table for the fetch path.
pub struct ScriptedBackend {
    exports: Option<GuestExports>,
    files: HashMap<String, Vec<u8>>,
}

impl ScriptedBackend {
    pub fn new(exports: GuestExports) -> Self {
        ScriptedBackend {
            exports: Some(exports),
            files: HashMap::new(),
        }
    }

    /// A backend with nothing to instantiate; loading through it fails.
    pub fn empty() -> Self {
        ScriptedBackend {
            exports: None,
            files: HashMap::new(),
        }
    }

    pub fn with_file(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), bytes);
        self
    }
}

impl ModuleBackend for ScriptedBackend {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, LoadError> {
        self.files.get(url).cloned().ok_or_else(|| LoadError::Fetch {
            url: url.to_string(),
            reason: "not found".to_string(),
        })
    }

    fn instantiate(&mut self, bytes: &[u8]) -> Result<GuestExports, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::Compile("empty module".to_string()));
        }
        self.exports
            .take()
            .ok_or_else(|| LoadError::Instantiate("backend has no module".to_string()))
    }
}
