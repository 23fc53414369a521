//! Classes, instances, and bound methods.

use super::function::ObjClosure;
use super::tags;
use crate::table::Table;
use qet_core::Value;
use qet_gc::{self as gc, Gc, SNode, ScanContext, Trace, ValueCell};

/// A class: a name and a method table.
pub struct ObjClass {
    pub name: Gc<SNode>,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: Gc<SNode>) -> Gc<ObjClass> {
        gc::shade(name.erase());
        gc::alloc(ObjClass {
            name,
            methods: Table::new(),
        })
    }
}

unsafe impl Trace for ObjClass {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.name.erase());
        self.methods.scan(cx);
    }

    const TAG: u8 = tags::CLASS;
}

/// An instance: a class and a field table.
pub struct ObjInstance {
    pub class: Gc<ObjClass>,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: Gc<ObjClass>) -> Gc<ObjInstance> {
        gc::shade(class.erase());
        gc::alloc(ObjInstance {
            class,
            fields: Table::new(),
        })
    }
}

unsafe impl Trace for ObjInstance {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.class.erase());
        self.fields.scan(cx);
    }

    const TAG: u8 = tags::INSTANCE;
}

/// A method closed over its receiver.
pub struct ObjBoundMethod {
    pub receiver: ValueCell,
    pub method: Gc<ObjClosure>,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: Gc<ObjClosure>) -> Gc<ObjBoundMethod> {
        gc::shade(method.erase());
        gc::alloc(ObjBoundMethod {
            receiver: ValueCell::new(receiver),
            method,
        })
    }
}

unsafe impl Trace for ObjBoundMethod {
    fn trace(&self, cx: &mut ScanContext) {
        self.receiver.scan(cx);
        cx.push(self.method.erase());
    }

    const TAG: u8 = tags::BOUND_METHOD;
}
