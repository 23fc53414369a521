//! Managed object layer: headers, capability tables, typed handles.
//!
//! Every collector-managed allocation is a [`GcBox`]: a [`Header`]
//! followed by the payload. The header carries the atomic color byte and
//! a pointer to a per-type capability table built from the type's
//! [`Trace`] implementation. The collector traffics in erased [`ObjRef`]
//! handles; clients hold typed [`Gc<T>`] handles.
//!
//! Leaf types (no strong children) and weak leaves (types the collector
//! may recolor red) are flagged in the capability table so the shade and
//! scan fast paths stay branch-cheap.

use crate::Color;
use qet_core::Value;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Capabilities every managed type exposes to the collector.
///
/// # Safety
///
/// Implementations must uphold:
/// - `trace` pushes *every* strong child reference the value holds;
///   a missed child can be reclaimed while still reachable.
/// - `LEAF` is true only if the type holds no strong children.
/// - `WEAK` is true only for types whose container tolerates eviction
///   (presently interned strings), and such types must unlink themselves
///   in [`Trace::evict`].
pub unsafe trait Trace: Sized + 'static {
    /// Push all strong children onto the scan context.
    fn trace(&self, cx: &mut ScanContext);

    /// Retained size in bytes, for statistics only.
    ///
    /// Defaults to the boxed size; types with owned heap payloads should
    /// add them.
    fn size_of(&self) -> usize {
        std::mem::size_of::<GcBox<Self>>()
    }

    /// Called once when the collector condemns a weak leaf (the
    /// white-to-red transition). Must remove the object from its weak
    /// container; the memory itself is reclaimed a cycle later.
    fn evict(_this: Gc<Self>) {}

    /// True when the type holds no strong children. Leaves shade
    /// straight to black and are never pushed on the gray worklist.
    const LEAF: bool = false;

    /// True when the collector may recolor the object red during sweep.
    const WEAK: bool = false;

    /// Client dispatch tag (see [`ObjRef::tag`]); 0 means untagged.
    const TAG: u8 = 0;
}

/// Per-type capability table, one static instance per `Trace` impl.
pub(crate) struct VTable {
    pub trace: unsafe fn(ObjRef, &mut ScanContext),
    pub size_of: unsafe fn(ObjRef) -> usize,
    pub evict: unsafe fn(ObjRef),
    pub drop: unsafe fn(ObjRef),
    pub leaf: bool,
    pub weak: bool,
    pub tag: u8,
}

unsafe fn trace_erased<T: Trace>(obj: ObjRef, cx: &mut ScanContext) {
    unsafe { obj.downcast_unchecked::<T>().trace(cx) }
}

unsafe fn size_of_erased<T: Trace>(obj: ObjRef) -> usize {
    unsafe { obj.downcast_unchecked::<T>().size_of() }
}

unsafe fn evict_erased<T: Trace>(obj: ObjRef) {
    T::evict(unsafe { obj.downcast_unchecked::<T>() })
}

unsafe fn drop_erased<T: Trace>(obj: ObjRef) {
    drop(unsafe { Box::from_raw(obj.0.as_ptr() as *mut GcBox<T>) })
}

struct VTableOf<T>(PhantomData<T>);

impl<T: Trace> VTableOf<T> {
    const TABLE: VTable = VTable {
        trace: trace_erased::<T>,
        size_of: size_of_erased::<T>,
        evict: evict_erased::<T>,
        drop: drop_erased::<T>,
        leaf: T::LEAF,
        weak: T::WEAK,
        tag: T::TAG,
    };
}

#[inline]
pub(crate) fn vtable_of<T: Trace>() -> &'static VTable {
    &VTableOf::<T>::TABLE
}

/// The word every managed allocation begins with.
pub struct Header {
    color: AtomicU8,
    vtable: &'static VTable,
}

impl Header {
    pub(crate) fn new(color: Color, vtable: &'static VTable) -> Header {
        Header {
            color: AtomicU8::new(color.0),
            vtable,
        }
    }

    /// Current color. Relaxed; correctness rests on the handshake
    /// barriers, not per-object ordering.
    #[inline]
    pub(crate) fn color(&self) -> Color {
        Color(self.color.load(Ordering::Relaxed))
    }

    /// Attempt one color transition. On failure returns the color
    /// actually observed.
    #[inline]
    pub(crate) fn transition(&self, expected: Color, desired: Color) -> Result<(), Color> {
        self.color
            .compare_exchange(expected.0, desired.0, Ordering::Relaxed, Ordering::Relaxed)
            .map(|_| ())
            .map_err(Color)
    }

    #[inline]
    pub(crate) fn vtable(&self) -> &'static VTable {
        self.vtable
    }
}

/// A managed allocation: header followed by payload.
#[repr(C)]
pub(crate) struct GcBox<T> {
    pub(crate) header: Header,
    pub(crate) value: T,
}

/// A typed handle to a managed object.
///
/// `Gc<T>` is a bare pointer: copying it is free and it does not by
/// itself keep the object alive. Liveness comes from reachability —
/// roots, scanned fields, or the mutator's infant list.
#[repr(transparent)]
pub struct Gc<T: Trace> {
    ptr: NonNull<GcBox<T>>,
}

impl<T: Trace> Gc<T> {
    #[inline]
    pub(crate) fn from_box(ptr: NonNull<GcBox<T>>) -> Gc<T> {
        Gc { ptr }
    }

    #[inline]
    pub(crate) fn as_box_ptr(self) -> *mut GcBox<T> {
        self.ptr.as_ptr()
    }

    /// Erase the type, yielding the handle the collector traffics in.
    #[inline]
    pub fn erase(self) -> ObjRef {
        // Header is the first field of a repr(C) GcBox.
        ObjRef(self.ptr.cast::<Header>())
    }

    /// The object as a runtime value.
    #[inline]
    pub fn as_value(self) -> Value {
        Value::object(self.ptr.as_ptr() as *const ())
    }

    /// Pointer identity.
    #[inline]
    pub fn ptr_eq(a: Gc<T>, b: Gc<T>) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: Trace> Clone for Gc<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Trace> Copy for Gc<T> {}

impl<T: Trace> std::ops::Deref for Gc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: Trace> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Trace> Eq for Gc<T> {}

impl<T: Trace> std::hash::Hash for Gc<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T: Trace + std::fmt::Debug> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc({:?})", &**self)
    }
}

impl<T: Trace + std::fmt::Display> std::fmt::Display for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

// Safety: a Gc is a pointer to a shared heap object; cross-thread access
// goes through the object's own atomics. The collector guarantees the
// referent outlives any reachable handle.
unsafe impl<T: Trace + Sync> Send for Gc<T> {}
unsafe impl<T: Trace + Sync> Sync for Gc<T> {}

/// A type-erased handle to a managed object.
///
/// This is the currency of the collector's lists and channels. It is
/// `Send` so infant lists can be handed across the handshake channel;
/// the collector protocol guarantees the referent is live wherever an
/// `ObjRef` is held.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(pub(crate) NonNull<Header>);

impl ObjRef {
    #[inline]
    pub(crate) fn header(self) -> &'static Header {
        // Lifetime laundering: the collector protocol keeps the header
        // alive while any list or field holds this handle.
        unsafe { &*self.0.as_ptr() }
    }

    /// Current color (relaxed read). Mainly for diagnostics and tests.
    #[inline]
    pub fn color(self) -> Color {
        self.header().color()
    }

    /// The client dispatch tag declared by the object's type.
    #[inline]
    pub fn tag(self) -> u8 {
        self.header().vtable().tag
    }

    /// Raw address, for identity and value packing.
    #[inline]
    pub fn as_ptr(self) -> *const () {
        self.0.as_ptr() as *const ()
    }

    /// Recover the object reference from a value, if it holds one.
    #[inline]
    pub fn from_value(v: Value) -> Option<ObjRef> {
        v.as_object_ptr()
            .map(|p| ObjRef(unsafe { NonNull::new_unchecked(p as *mut Header) }))
    }

    /// The object as a runtime value.
    #[inline]
    pub fn as_value(self) -> Value {
        Value::object(self.as_ptr())
    }

    /// Recover the typed handle.
    ///
    /// # Safety
    ///
    /// The referent must actually be a `GcBox<T>`; check [`ObjRef::tag`]
    /// first unless the provenance is already known.
    #[inline]
    pub unsafe fn downcast_unchecked<T: Trace>(self) -> Gc<T> {
        Gc::from_box(self.0.cast::<GcBox<T>>())
    }
}

// Safety: see the type-level comment; an ObjRef crossing threads always
// rides the handshake protocol or a barriered field.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:p})", self.0.as_ptr())
    }
}

/// Scan-phase context: the epoch white and the gray worklist.
///
/// [`ScanContext::push`] is the scan-into operation: a white object is
/// atomically blackened and, unless it is a leaf, scheduled so its own
/// children get scanned. Objects observed gray or black are not
/// re-pushed; the gray ones are already on the collector's object list.
pub struct ScanContext {
    white: Color,
    stack: Vec<ObjRef>,
}

impl ScanContext {
    pub(crate) fn new(white: Color) -> ScanContext {
        ScanContext {
            white,
            stack: Vec::with_capacity(256),
        }
    }

    #[inline]
    pub(crate) fn set_white(&mut self, white: Color) {
        self.white = white;
    }

    /// The current epoch's white.
    #[inline]
    pub fn white(&self) -> Color {
        self.white
    }

    /// The current epoch's black.
    #[inline]
    pub fn black(&self) -> Color {
        self.white.flip()
    }

    /// Scan into a strong child: blacken it if white and schedule its
    /// children.
    #[inline]
    pub fn push(&mut self, obj: ObjRef) {
        let header = obj.header();
        if header.transition(self.white, self.white.flip()).is_ok() && !header.vtable().leaf {
            self.stack.push(obj);
        }
    }

    /// Scan a weak child: weak leaves are left alone, everything else is
    /// scanned normally.
    #[inline]
    pub fn push_weak(&mut self, obj: ObjRef) {
        if !obj.header().vtable().weak {
            self.push(obj);
        }
    }

    /// Scan the object inside a value, if any.
    #[inline]
    pub fn push_value(&mut self, v: Value) {
        if let Some(obj) = ObjRef::from_value(v) {
            self.push(obj);
        }
    }

    /// Drain the worklist, scanning every scheduled object's children.
    pub(crate) fn process(&mut self) {
        while let Some(obj) = self.stack.pop() {
            debug_assert_eq!(obj.color(), self.black());
            unsafe { (obj.header().vtable().trace)(obj, self) };
        }
    }
}
