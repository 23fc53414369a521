//! Mutator-side collector interface.
//!
//! A thread becomes a mutator by calling [`enter`], after which it may
//! allocate, must call [`handshake`] periodically, and must shade any
//! roots it holds between handshakes. [`leave`] ends participation;
//! enter/leave pairs nest.
//!
//! The thread-local state mirrors the channel: the epoch colors last
//! observed, the dirty flag the write barrier raises, the infant list of
//! allocations since the last handover, and the root list shaded at
//! every handshake.

use crate::channel::{global, Channel};
use crate::deque::Deque;
use crate::object::{vtable_of, GcBox, Header, ObjRef, Trace};
use crate::{Color, Gc};
use qet_core::Value;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;

struct Local {
    white: Cell<Color>,
    alloc: Cell<Color>,
    dirty: Cell<bool>,
    depth: Cell<u32>,
    allocations: RefCell<Deque<ObjRef>>,
    roots: RefCell<Vec<ObjRef>>,
    channel: RefCell<Option<Arc<Channel>>>,
}

thread_local! {
    static LOCAL: Local = Local {
        white: Cell::new(Color::EPOCH0),
        alloc: Cell::new(Color::EPOCH0),
        dirty: Cell::new(false),
        depth: Cell::new(0),
        allocations: RefCell::new(Deque::new()),
        roots: RefCell::new(Vec::new()),
        channel: RefCell::new(None),
    };
}

/// Enter the collector domain: this thread may now allocate and must
/// handshake periodically. Reentrant; each `enter` needs a matching
/// [`leave`].
pub fn enter() {
    LOCAL.with(|l| {
        let depth = l.depth.get();
        l.depth.set(depth + 1);
        if depth > 0 {
            return;
        }

        debug_assert!(l.channel.borrow().is_none());
        let g = global();
        {
            let mut gs = g.state.lock();
            let channel = Channel::new(gs.white, gs.alloc);
            l.white.set(gs.white);
            l.alloc.set(gs.alloc);
            l.channel.replace(Some(channel.clone()));
            gs.entrants.push(channel);
        }
        g.condvar.notify_all();
    });
}

/// Leave the collector domain. The final leave orphans this mutator's
/// channel; the collector drains its infants and disposes of it.
pub fn leave() {
    LOCAL.with(|l| {
        let depth = l.depth.get();
        assert!(depth > 0, "gc: leave() without matching enter()");
        l.depth.set(depth - 1);
        if depth > 1 {
            return;
        }

        let channel = l
            .channel
            .replace(None)
            .expect("gc: entered mutator has no channel");
        let pending;
        {
            let mut st = channel.state.lock();
            pending = std::mem::replace(&mut st.pending, false);
            st.abandoned = true;
            // A dirty flag the collector has not yet absorbed must not be
            // lost when the channel is orphaned.
            st.dirty |= l.dirty.replace(false);
            // Hand over the infants; if the collector had requested them
            // but not yet taken them, append rather than replace.
            let mut allocations = l.allocations.borrow_mut();
            if st.infants.is_empty() {
                std::mem::swap(&mut st.infants, &mut *allocations);
            } else {
                st.infants.append(&mut *allocations);
            }
            st.request_infants = false;
        }
        if pending {
            channel.condvar.notify_all();
        }
    });
}

/// Cooperative safepoint.
///
/// If the collector has requested an exchange, publish the dirty flag,
/// adopt the latest epoch colors, hand over infants on request, and
/// shade every registered root. Returns true when an exchange happened,
/// so the embedding VM knows to re-enumerate its own roots.
pub fn handshake() -> bool {
    LOCAL.with(|l| {
        let channel = l.channel.borrow().clone();
        let channel = channel.expect("gc: handshake() outside of an entered mutator");
        let pending;
        {
            let mut st = channel.state.lock();
            pending = st.pending;
            if pending {
                st.dirty |= l.dirty.replace(false);
                l.white.set(st.white);
                l.alloc.set(st.alloc);
                if st.request_infants {
                    debug_assert!(st.infants.is_empty());
                    let mut allocations = l.allocations.borrow_mut();
                    std::mem::swap(&mut st.infants, &mut *allocations);
                }
                st.request_infants = false;
                st.pending = false;
            }
        }
        if pending {
            channel.condvar.notify_all();
            let roots = l.roots.borrow();
            for &root in roots.iter() {
                shade_in(root, l);
            }
            tracing::trace!(roots = roots.len(), "handshake exchanged");
        }
        pending
    })
}

/// Allocate a managed object, registering it on this mutator's infant
/// list. The new object takes the current allocation color.
///
/// # Panics
///
/// Panics when called outside an `enter`/`leave` bracket; allocating
/// without a channel is a contract violation.
pub fn alloc<T: Trace>(value: T) -> Gc<T> {
    LOCAL.with(|l| {
        assert!(
            l.depth.get() > 0,
            "gc: allocation outside of an entered mutator"
        );
        let color = l.alloc.get();
        let size = std::mem::size_of::<GcBox<T>>();
        let boxed = Box::into_raw(Box::new(GcBox {
            header: Header::new(color, vtable_of::<T>()),
            value,
        }));
        let ptr = unsafe { NonNull::new_unchecked(boxed) };
        let gc = Gc::from_box(ptr);
        l.allocations.borrow_mut().push_back(gc.erase());
        global().stats.record_allocation(size);
        gc
    })
}

#[inline]
fn shade_in(obj: ObjRef, l: &Local) {
    let header = obj.header();
    let white = l.white.get();
    if header.vtable().leaf {
        // Leaves have no children to scan: straight to black, and the
        // collector need not hear about it.
        let _ = header.transition(white, white.flip());
    } else if header.transition(white, Color::GRAY).is_ok() {
        l.dirty.set(true);
    }
}

/// Mark an external reference live: white objects become gray (leaves
/// become black) and the mutator's dirty flag is raised.
#[inline]
pub fn shade(obj: ObjRef) {
    LOCAL.with(|l| {
        debug_assert!(l.depth.get() > 0, "gc: shade outside of an entered mutator");
        shade_in(obj, l);
    });
}

/// Shade the object inside a value, if any.
#[inline]
pub fn shade_value(v: Value) {
    if let Some(obj) = ObjRef::from_value(v) {
        shade(obj);
    }
}

/// Shade through a weak edge: weak leaves are left alone.
#[inline]
pub(crate) fn shade_weak(obj: ObjRef) {
    if !obj.header().vtable().weak {
        shade(obj);
    }
}

/// Register a root this mutator promises to shade at every handshake.
pub fn push_root(obj: ObjRef) {
    LOCAL.with(|l| l.roots.borrow_mut().push(obj));
}

/// Remove the most recently pushed root.
pub fn pop_root() -> Option<ObjRef> {
    LOCAL.with(|l| l.roots.borrow_mut().pop())
}

/// Number of registered roots (for save/restore around fallible work).
pub fn roots_len() -> usize {
    LOCAL.with(|l| l.roots.borrow().len())
}

/// Drop roots beyond `len`, restoring a previously observed depth.
pub fn truncate_roots(len: usize) {
    LOCAL.with(|l| l.roots.borrow_mut().truncate(len));
}

// Collector-side access to its own thread's local state.

pub(crate) fn local_white() -> Color {
    LOCAL.with(|l| l.white.get())
}

pub(crate) fn set_local_white(white: Color) {
    LOCAL.with(|l| l.white.set(white));
}

pub(crate) fn set_local_alloc(alloc: Color) {
    LOCAL.with(|l| l.alloc.set(alloc));
}

pub(crate) fn local_dirty() -> bool {
    LOCAL.with(|l| l.dirty.get())
}

pub(crate) fn set_local_dirty(dirty: bool) {
    LOCAL.with(|l| l.dirty.set(dirty));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "leave() without matching enter()")]
    fn test_unbalanced_leave_panics() {
        leave();
    }

    #[test]
    fn test_reentrant_enter_leave() {
        enter();
        enter();
        leave();
        // Still entered: allocation remains legal.
        LOCAL.with(|l| assert_eq!(l.depth.get(), 1));
        leave();
        LOCAL.with(|l| assert_eq!(l.depth.get(), 0));
    }
}
