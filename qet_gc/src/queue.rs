//! Michael–Scott lock-free queue over managed nodes.
//!
//! The classical two-pointer queue with a permanent sentinel. Nodes are
//! collector-managed, which bounds ABA the easy way: a node cannot be
//! reused while any thread still holds a reference to it, because the
//! collector will not reclaim it until after every mutator has
//! handshaken past the epoch in which it became unreachable.

use crate::mutator::alloc;
use crate::object::{Gc, ScanContext, Trace};
use crate::ptr::{StrongRef, ValueCell};
use qet_core::Value;

/// A queue link.
pub struct MsNode {
    next: StrongRef<MsNode>,
    value: ValueCell,
}

unsafe impl Trace for MsNode {
    fn trace(&self, cx: &mut ScanContext) {
        self.next.scan(cx);
        self.value.scan(cx);
    }
}

/// A lock-free multi-producer multi-consumer FIFO queue of values.
pub struct MsQueue {
    head: StrongRef<MsNode>,
    tail: StrongRef<MsNode>,
}

unsafe impl Trace for MsQueue {
    fn trace(&self, cx: &mut ScanContext) {
        // The tail is always reachable through the head's next chain.
        self.head.scan(cx);
    }
}

impl MsQueue {
    /// Allocate an empty queue. Must be called from an entered mutator.
    pub fn create() -> Gc<MsQueue> {
        let sentinel = alloc(MsNode {
            next: StrongRef::null(),
            value: ValueCell::nil(),
        });
        alloc(MsQueue {
            head: StrongRef::new(sentinel),
            tail: StrongRef::new(sentinel),
        })
    }

    /// Enqueue a value.
    pub fn push(&self, value: Value) {
        let node = alloc(MsNode {
            next: StrongRef::null(),
            value: ValueCell::new(value),
        });
        let mut tail = self.tail.load().expect("queue keeps a sentinel");
        loop {
            // If tail->next is null, install the new node and be done.
            match tail.next.compare_exchange(None, Some(node)) {
                Ok(()) => return,
                Err(next) => {
                    let next = next.expect("failed CAS observed a link");
                    // The tail is lagging; help advance it. Either way
                    // we end with a recent observation of the tail.
                    match self.tail.compare_exchange(Some(tail), Some(next)) {
                        Ok(()) => tail = next,
                        Err(seen) => tail = seen.expect("tail is never null"),
                    }
                }
            }
        }
    }

    /// Dequeue a value, or `None` when only the sentinel remains.
    pub fn pop(&self) -> Option<Value> {
        let mut head = self.head.load().expect("queue keeps a sentinel");
        loop {
            let next = head.next.load()?;
            match self.head.compare_exchange(Some(head), Some(next)) {
                Ok(()) => return Some(next.value.load()),
                Err(seen) => head = seen.expect("head is never null"),
            }
        }
    }
}
