//! Barriered atomic fields.
//!
//! Pointer-bearing fields of managed objects live in these cell types.
//! Every writing operation applies the write barrier: the stored value
//! is shaded (Dijkstra insertion barrier) and the displaced value is
//! shaded (snapshot-at-the-beginning), so neither a freshly published
//! nor a just-severed reference can be missed by a concurrent mark
//! phase. Loads never shade.
//!
//! Construction shades the stored value only; there is nothing
//! displaced yet.

use crate::mutator::{shade, shade_value};
use crate::object::{Gc, GcBox, ScanContext, Trace};
use qet_core::Value;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// An atomic, barriered strong reference to a managed object.
///
/// Stores use release ordering and loads acquire, so publishing an
/// object through a `StrongRef` publishes its contents.
pub struct StrongRef<T: Trace> {
    inner: AtomicPtr<GcBox<T>>,
}

impl<T: Trace> StrongRef<T> {
    /// A null reference.
    pub const fn null() -> StrongRef<T> {
        StrongRef {
            inner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// A reference initialized to `target`. Shades the target.
    pub fn new(target: Gc<T>) -> StrongRef<T> {
        shade(target.erase());
        StrongRef {
            inner: AtomicPtr::new(target.as_box_ptr()),
        }
    }

    #[inline]
    fn decode(raw: *mut GcBox<T>) -> Option<Gc<T>> {
        ptr::NonNull::new(raw).map(Gc::from_box)
    }

    #[inline]
    fn encode(target: Option<Gc<T>>) -> *mut GcBox<T> {
        target.map_or(ptr::null_mut(), Gc::as_box_ptr)
    }

    /// Load the current target. Does not shade.
    #[inline]
    pub fn load(&self) -> Option<Gc<T>> {
        Self::decode(self.inner.load(Ordering::Acquire))
    }

    /// Store a new target, shading both it and the displaced target.
    pub fn store(&self, target: Option<Gc<T>>) {
        let _ = self.exchange(target);
    }

    /// Store a new target and return the displaced one; shades both.
    pub fn exchange(&self, target: Option<Gc<T>>) -> Option<Gc<T>> {
        if let Some(t) = target {
            shade(t.erase());
        }
        let old = Self::decode(self.inner.swap(Self::encode(target), Ordering::AcqRel));
        if let Some(o) = old {
            shade(o.erase());
        }
        old
    }

    /// Compare-exchange; shades both the displaced and stored values on
    /// success. On failure returns the observed target.
    pub fn compare_exchange(
        &self,
        current: Option<Gc<T>>,
        new: Option<Gc<T>>,
    ) -> Result<(), Option<Gc<T>>> {
        match self.inner.compare_exchange(
            Self::encode(current),
            Self::encode(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Some(c) = current {
                    shade(c.erase());
                }
                if let Some(n) = new {
                    shade(n.erase());
                }
                Ok(())
            }
            Err(seen) => Err(Self::decode(seen)),
        }
    }

    /// Weak compare-exchange variant; may fail spuriously.
    pub fn compare_exchange_weak(
        &self,
        current: Option<Gc<T>>,
        new: Option<Gc<T>>,
    ) -> Result<(), Option<Gc<T>>> {
        match self.inner.compare_exchange_weak(
            Self::encode(current),
            Self::encode(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Some(c) = current {
                    shade(c.erase());
                }
                if let Some(n) = new {
                    shade(n.erase());
                }
                Ok(())
            }
            Err(seen) => Err(Self::decode(seen)),
        }
    }

    /// Scan hook: push the current target strongly.
    #[inline]
    pub fn scan(&self, cx: &mut ScanContext) {
        if let Some(target) = self.load() {
            cx.push(target.erase());
        }
    }
}

impl<T: Trace> Default for StrongRef<T> {
    fn default() -> Self {
        StrongRef::null()
    }
}

impl<T: Trace + std::fmt::Debug> std::fmt::Debug for StrongRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.load() {
            Some(target) => write!(f, "StrongRef({:?})", &*target),
            None => write!(f, "StrongRef(null)"),
        }
    }
}

/// An atomic, barriered value cell.
///
/// The cell holds one tagged [`Value`] word. Writing operations shade
/// the object inside both the stored and the displaced value, if any.
pub struct ValueCell(AtomicU64);

impl ValueCell {
    /// A nil cell.
    pub const fn nil() -> ValueCell {
        ValueCell(AtomicU64::new(0))
    }

    /// A cell initialized to `v`. Shades the stored object, if any.
    pub fn new(v: Value) -> ValueCell {
        shade_value(v);
        ValueCell(AtomicU64::new(v.to_bits()))
    }

    /// Load the current value. Does not shade.
    #[inline]
    pub fn load(&self) -> Value {
        Value::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Store a value, shading both it and the displaced value.
    pub fn store(&self, v: Value) {
        shade_value(v);
        let old = Value::from_bits(self.0.swap(v.to_bits(), Ordering::AcqRel));
        shade_value(old);
    }

    /// Scan hook: push the contained object strongly, if any.
    #[inline]
    pub fn scan(&self, cx: &mut ScanContext) {
        cx.push_value(self.load());
    }
}

impl Default for ValueCell {
    fn default() -> Self {
        ValueCell::nil()
    }
}

impl std::fmt::Debug for ValueCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueCell({:?})", self.load())
    }
}
