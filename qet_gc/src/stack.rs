//! Treiber lock-free stack over managed nodes.
//!
//! ABA safety comes from the collector's deferred-free guarantee, as in
//! [`crate::queue`].

use crate::mutator::alloc;
use crate::object::{Gc, ScanContext, Trace};
use crate::ptr::{StrongRef, ValueCell};
use qet_core::Value;

/// A stack link.
pub struct StackNode {
    next: StrongRef<StackNode>,
    value: ValueCell,
}

unsafe impl Trace for StackNode {
    fn trace(&self, cx: &mut ScanContext) {
        self.next.scan(cx);
        self.value.scan(cx);
    }
}

/// A lock-free LIFO stack of values.
pub struct TreiberStack {
    head: StrongRef<StackNode>,
}

unsafe impl Trace for TreiberStack {
    fn trace(&self, cx: &mut ScanContext) {
        self.head.scan(cx);
    }
}

impl TreiberStack {
    /// Allocate an empty stack. Must be called from an entered mutator.
    pub fn create() -> Gc<TreiberStack> {
        alloc(TreiberStack {
            head: StrongRef::null(),
        })
    }

    /// Push a value.
    pub fn push(&self, value: Value) {
        let node = alloc(StackNode {
            next: StrongRef::null(),
            value: ValueCell::new(value),
        });
        let mut expected = self.head.load();
        loop {
            node.next.store(expected);
            match self.head.compare_exchange_weak(expected, Some(node)) {
                Ok(()) => return,
                Err(seen) => expected = seen,
            }
        }
    }

    /// Pop the most recently pushed value.
    pub fn pop(&self) -> Option<Value> {
        let mut expected = self.head.load();
        loop {
            let node = expected?;
            let next = node.next.load();
            match self.head.compare_exchange(Some(node), next) {
                Ok(()) => return Some(node.value.load()),
                Err(seen) => expected = seen,
            }
        }
    }
}
