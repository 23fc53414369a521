//! Heap object variants and dispatch.
//!
//! Objects are discriminated by the dispatch tag in their collector
//! header; [`classify`] is the single place that turns an erased
//! reference back into a typed one.

mod class;
mod function;
mod native;

pub use class::{ObjBoundMethod, ObjClass, ObjInstance};
pub use function::{ObjClosure, ObjFunction, ObjUpvalue};
pub use native::{NativeFn, ObjNative};

use qet_core::Value;
use qet_gc::{Gc, ObjRef, SNode, TAG_STRING};

/// Dispatch tags for runtime object types. The collector reserves tags
/// below 16; strings carry [`TAG_STRING`].
pub(crate) mod tags {
    pub const FUNCTION: u8 = 16;
    pub const CLOSURE: u8 = 17;
    pub const UPVALUE: u8 = 18;
    pub const CLASS: u8 = 19;
    pub const INSTANCE: u8 = 20;
    pub const BOUND_METHOD: u8 = 21;
    pub const NATIVE: u8 = 22;
}

/// A typed view of a heap object.
pub enum ObjectKind {
    String(Gc<SNode>),
    Function(Gc<ObjFunction>),
    Closure(Gc<ObjClosure>),
    Upvalue(Gc<ObjUpvalue>),
    Class(Gc<ObjClass>),
    Instance(Gc<ObjInstance>),
    BoundMethod(Gc<ObjBoundMethod>),
    Native(Gc<ObjNative>),
}

/// Recover the typed handle behind an erased object reference.
///
/// # Panics
///
/// Panics on a tag this runtime did not allocate, which would mean a
/// corrupted value.
pub fn classify(obj: ObjRef) -> ObjectKind {
    // Safety: the tag in the header names the type that allocated the
    // object; each arm downcasts to exactly that type.
    unsafe {
        match obj.tag() {
            TAG_STRING => ObjectKind::String(obj.downcast_unchecked()),
            tags::FUNCTION => ObjectKind::Function(obj.downcast_unchecked()),
            tags::CLOSURE => ObjectKind::Closure(obj.downcast_unchecked()),
            tags::UPVALUE => ObjectKind::Upvalue(obj.downcast_unchecked()),
            tags::CLASS => ObjectKind::Class(obj.downcast_unchecked()),
            tags::INSTANCE => ObjectKind::Instance(obj.downcast_unchecked()),
            tags::BOUND_METHOD => ObjectKind::BoundMethod(obj.downcast_unchecked()),
            tags::NATIVE => ObjectKind::Native(obj.downcast_unchecked()),
            tag => panic!("runtime: unknown object tag {}", tag),
        }
    }
}

/// The string behind a value, if it is one.
pub fn as_string(v: Value) -> Option<Gc<SNode>> {
    let obj = ObjRef::from_value(v)?;
    if obj.tag() == TAG_STRING {
        Some(unsafe { obj.downcast_unchecked() })
    } else {
        None
    }
}

/// Upvalue slot count of the function behind a value; zero when the
/// value is not a function. Used by the disassembler to walk closure
/// operand pairs.
pub fn as_function_upvalue_count(v: Value) -> usize {
    match ObjRef::from_value(v) {
        Some(obj) if obj.tag() == tags::FUNCTION => {
            let function: Gc<ObjFunction> = unsafe { obj.downcast_unchecked() };
            function.upvalue_count as usize
        }
        _ => 0,
    }
}

/// Render a value the way `print` does.
pub fn format_value(v: Value) -> String {
    match ObjRef::from_value(v) {
        None => format!("{:?}", v),
        Some(obj) => match classify(obj) {
            ObjectKind::String(s) => s.to_string(),
            ObjectKind::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", name),
                None => "<script>".to_string(),
            },
            ObjectKind::Closure(c) => match c.function.name {
                Some(name) => format!("<fn {}>", name),
                None => "<script>".to_string(),
            },
            ObjectKind::Upvalue(_) => "upvalue".to_string(),
            ObjectKind::Class(c) => c.name.to_string(),
            ObjectKind::Instance(i) => format!("{} instance", i.class.name),
            ObjectKind::BoundMethod(b) => match b.method.function.name {
                Some(name) => format!("<fn {}>", name),
                None => "<script>".to_string(),
            },
            ObjectKind::Native(_) => "<native fn>".to_string(),
        },
    }
}
