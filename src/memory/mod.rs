//! Guest linear memory and typed views
//!
//! The guest's linear memory can grow at any suspension point, which moves
//! the backing buffer. Every memory object therefore carries a generation
//! counter that advances on growth; typed views are stamped with the
//! generation they were built against and refuse to touch a newer buffer.
//! `MemoryViews` caches one view per element kind and transparently rebuilds
//! a view whose stamp has fallen behind.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::Trap;

/// Backing store seam for the guest's linear memory.
///
/// Natively this is a heap vector; on wasm32 it adapts a
/// `WebAssembly.Memory`. All offsets are byte offsets.
pub trait LinearMemory {
    /// Current size in bytes.
    fn len(&self) -> usize;

    /// Advances whenever the backing buffer identity changes (growth).
    fn generation(&self) -> u64;

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), Trap>;

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), Trap>;
}

/// Shared handle to a guest memory. Cheap to clone.
#[derive(Clone)]
pub struct GuestMemory(Rc<dyn LinearMemory>);

impl GuestMemory {
    pub fn new(backing: Rc<dyn LinearMemory>) -> Self {
        GuestMemory(backing)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.0.generation()
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), Trap> {
        self.0.read(offset, out)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), Trap> {
        self.0.write(offset, data)
    }
}

/// Native linear memory: a growable byte vector.
pub struct HeapMemory {
    buf: RefCell<Vec<u8>>,
    generation: Cell<u64>,
}

impl HeapMemory {
    pub fn new(size: usize) -> Rc<Self> {
        Rc::new(HeapMemory {
            buf: RefCell::new(vec![0u8; size]),
            generation: Cell::new(0),
        })
    }

    /// Grow by `additional` bytes. The buffer may move, so this bumps the
    /// generation and invalidates every outstanding view.
    pub fn grow(&self, additional: usize) {
        let mut buf = self.buf.borrow_mut();
        let new_len = buf.len() + additional;
        buf.resize(new_len, 0);
        self.generation.set(self.generation.get() + 1);
    }
}

fn check_bounds(offset: usize, count: usize, len: usize) -> Result<(), Trap> {
    let end = offset.checked_add(count).ok_or(Trap::OutOfBounds { offset, count, len })?;
    if end > len {
        return Err(Trap::OutOfBounds { offset, count, len });
    }
    Ok(())
}

impl LinearMemory for HeapMemory {
    fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    fn generation(&self) -> u64 {
        self.generation.get()
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), Trap> {
        let buf = self.buf.borrow();
        check_bounds(offset, out.len(), buf.len())?;
        out.copy_from_slice(&buf[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), Trap> {
        let mut buf = self.buf.borrow_mut();
        check_bounds(offset, data.len(), buf.len())?;
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Fixed-width element of a typed view.
pub trait Scalar: Copy {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! scalar {
    ($t:ty, $n:expr) => {
        impl Scalar for $t {
            const SIZE: usize = $n;
            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

scalar!(u8, 1);
scalar!(i32, 4);
scalar!(f32, 4);
scalar!(f64, 8);

/// A typed window over guest memory, stamped with the generation it was
/// built against. `ptr`/`len` arguments are element offsets/counts; the
/// byte offset is `ptr * SIZE`.
#[derive(Clone)]
pub struct MemoryView<T: Scalar> {
    memory: GuestMemory,
    generation: u64,
    _elem: PhantomData<T>,
}

impl<T: Scalar> MemoryView<T> {
    fn new(memory: GuestMemory) -> Self {
        let generation = memory.generation();
        MemoryView {
            memory,
            generation,
            _elem: PhantomData,
        }
    }

    /// True once the backing memory has grown past this view.
    pub fn is_stale(&self) -> bool {
        self.generation != self.memory.generation()
    }

    fn check_fresh(&self) -> Result<(), Trap> {
        let current = self.memory.generation();
        if self.generation != current {
            return Err(Trap::StaleView {
                view: self.generation,
                current,
            });
        }
        Ok(())
    }

    pub fn read(&self, ptr: u32, len: u32) -> Result<Vec<T>, Trap> {
        self.check_fresh()?;
        let offset = ptr as usize * T::SIZE;
        let count = len as usize * T::SIZE;
        let mut raw = vec![0u8; count];
        self.memory.read(offset, &mut raw)?;
        Ok(raw.chunks_exact(T::SIZE).map(T::from_le).collect())
    }

    pub fn write(&self, ptr: u32, data: &[T]) -> Result<(), Trap> {
        self.check_fresh()?;
        let mut raw = vec![0u8; data.len() * T::SIZE];
        for (chunk, &value) in raw.chunks_exact_mut(T::SIZE).zip(data) {
            value.write_le(chunk);
        }
        self.memory.write(ptr as usize * T::SIZE, &raw)
    }
}

/// Per-kind view cache. Views are rebuilt lazily after memory growth.
pub struct MemoryViews {
    memory: GuestMemory,
    bytes: RefCell<Option<MemoryView<u8>>>,
    i32s: RefCell<Option<MemoryView<i32>>>,
    f32s: RefCell<Option<MemoryView<f32>>>,
    f64s: RefCell<Option<MemoryView<f64>>>,
    rebuilds: Cell<u64>,
}

impl MemoryViews {
    pub fn new(memory: GuestMemory) -> Self {
        MemoryViews {
            memory,
            bytes: RefCell::new(None),
            i32s: RefCell::new(None),
            f32s: RefCell::new(None),
            f64s: RefCell::new(None),
            rebuilds: Cell::new(0),
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    fn cached<T: Scalar>(&self, slot: &RefCell<Option<MemoryView<T>>>) -> MemoryView<T> {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(view) if !view.is_stale() => view.clone(),
            _ => {
                self.rebuilds.set(self.rebuilds.get() + 1);
                let view = MemoryView::new(self.memory.clone());
                *slot = Some(view.clone());
                view
            }
        }
    }

    pub fn bytes(&self) -> MemoryView<u8> {
        self.cached(&self.bytes)
    }

    pub fn i32s(&self) -> MemoryView<i32> {
        self.cached(&self.i32s)
    }

    pub fn f32s(&self) -> MemoryView<f32> {
        self.cached(&self.f32s)
    }

    pub fn f64s(&self) -> MemoryView<f64> {
        self.cached(&self.f64s)
    }

    /// How many views have been (re)built. Growth shows up here.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.get()
    }
}
