//! qet runtime object model.
//!
//! This crate defines the heap objects the interpreter manipulates —
//! functions, closures, upvalues, classes, instances, bound methods,
//! natives — and the concurrent field [`Table`] used for globals,
//! instance fields, and class method sets.
//!
//! Every pointer-bearing field goes through the collector's barriered
//! cells; every object type implements the collector's capability trait
//! so the concurrent mark phase can discover children while the
//! interpreter runs.

pub mod object;
pub mod table;

pub use object::{
    as_function_upvalue_count, as_string, classify, format_value, NativeFn, ObjBoundMethod,
    ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjUpvalue, ObjectKind,
};
pub use table::Table;
