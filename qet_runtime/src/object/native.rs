//! Native (host) functions.

use super::tags;
use qet_core::Value;
use qet_gc::{self as gc, Gc, ScanContext, Trace};

/// A host function callable from qet code.
pub type NativeFn = fn(&[Value]) -> Value;

/// A wrapped native function.
pub struct ObjNative {
    pub function: NativeFn,
}

impl ObjNative {
    pub fn new(function: NativeFn) -> Gc<ObjNative> {
        gc::alloc(ObjNative { function })
    }
}

unsafe impl Trace for ObjNative {
    fn trace(&self, _cx: &mut ScanContext) {}

    const LEAF: bool = true;
    const TAG: u8 = tags::NATIVE;
}
