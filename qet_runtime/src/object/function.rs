//! Functions, closures, and upvalues.

use super::tags;
use qet_core::{Chunk, Value};
use qet_gc::{self as gc, Gc, SNode, ScanContext, StrongRef, Trace, ValueCell};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A compiled function: immutable once built.
///
/// The compiler constructs the chunk in private memory and only then
/// allocates the function object, so the collector never sees a
/// half-built constant pool.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<Gc<SNode>>,
}

impl ObjFunction {
    /// Allocate a finished function. Shades the name and every constant
    /// so the new (black-allocated) object cannot hide white children.
    pub fn new(
        arity: u8,
        upvalue_count: u8,
        chunk: Chunk,
        name: Option<Gc<SNode>>,
    ) -> Gc<ObjFunction> {
        if let Some(n) = name {
            gc::shade(n.erase());
        }
        for &constant in chunk.constants.iter() {
            gc::shade_value(constant);
        }
        gc::alloc(ObjFunction {
            arity,
            upvalue_count,
            chunk,
            name,
        })
    }
}

unsafe impl Trace for ObjFunction {
    fn trace(&self, cx: &mut ScanContext) {
        if let Some(name) = self.name {
            cx.push(name.erase());
        }
        for &constant in self.chunk.constants.iter() {
            cx.push_value(constant);
        }
    }

    fn size_of(&self) -> usize {
        std::mem::size_of_val(self)
            + self.chunk.code.capacity()
            + self.chunk.lines.capacity() * std::mem::size_of::<u32>()
            + self.chunk.constants.capacity() * std::mem::size_of::<Value>()
    }

    const TAG: u8 = tags::FUNCTION;
}

/// A function plus its captured upvalues.
pub struct ObjClosure {
    pub function: Gc<ObjFunction>,
    /// Filled in by the closure-building opcode right after allocation.
    pub upvalues: Box<[StrongRef<ObjUpvalue>]>,
}

impl ObjClosure {
    /// Allocate a closure with empty upvalue slots.
    pub fn new(function: Gc<ObjFunction>) -> Gc<ObjClosure> {
        gc::shade(function.erase());
        let upvalues = (0..function.upvalue_count)
            .map(|_| StrongRef::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        gc::alloc(ObjClosure { function, upvalues })
    }
}

unsafe impl Trace for ObjClosure {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.function.erase());
        for upvalue in self.upvalues.iter() {
            upvalue.scan(cx);
        }
    }

    fn size_of(&self) -> usize {
        std::mem::size_of_val(self)
            + self.upvalues.len() * std::mem::size_of::<StrongRef<ObjUpvalue>>()
    }

    const TAG: u8 = tags::CLOSURE;
}

/// Sentinel for a closed upvalue's location.
const CLOSED: usize = usize::MAX;

/// A captured variable.
///
/// While open it designates an absolute slot of the owning thread's VM
/// stack (scanned through the stack roots); once closed the value lives
/// in the upvalue itself.
pub struct ObjUpvalue {
    location: AtomicUsize,
    closed: ValueCell,
}

impl ObjUpvalue {
    /// Allocate an open upvalue capturing `slot`.
    pub fn new_open(slot: usize) -> Gc<ObjUpvalue> {
        debug_assert_ne!(slot, CLOSED);
        gc::alloc(ObjUpvalue {
            location: AtomicUsize::new(slot),
            closed: ValueCell::nil(),
        })
    }

    /// The captured stack slot, if still open.
    #[inline]
    pub fn open_slot(&self) -> Option<usize> {
        let loc = self.location.load(Ordering::Acquire);
        (loc != CLOSED).then_some(loc)
    }

    /// Hoist the value off the stack and close the upvalue.
    pub fn close(&self, value: Value) {
        self.closed.store(value);
        self.location.store(CLOSED, Ordering::Release);
    }

    /// Read a closed upvalue.
    #[inline]
    pub fn closed_value(&self) -> Value {
        self.closed.load()
    }

    /// Write a closed upvalue.
    #[inline]
    pub fn set_closed(&self, value: Value) {
        self.closed.store(value);
    }
}

unsafe impl Trace for ObjUpvalue {
    fn trace(&self, cx: &mut ScanContext) {
        self.closed.scan(cx);
    }

    const TAG: u8 = tags::UPVALUE;
}
