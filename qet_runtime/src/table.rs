//! Concurrent open-addressed field table.
//!
//! Keys are interned strings compared by pointer identity; values are
//! tagged words. Slots are atomic cells, so a single writer and any
//! number of readers (the interpreter thread and the collector's scan)
//! coexist without a lock. Deletion leaves a tombstone — a null key
//! with a `true` value — to keep probe chains intact; an empty slot is
//! a null key with a nil value.
//!
//! The slot array is itself a collector-managed object. Growth builds a
//! fresh array, rehashes into it while it is still private, and
//! publishes it with a single release store; readers mid-probe keep
//! using the old array, which the collector reclaims once unreachable.
//!
//! Load factor is capped at 3/4 and capacity is always a power of two.

use qet_core::Value;
use qet_gc::{self as gc, Gc, SNode, ScanContext, StrongRef, Trace, ValueCell};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One slot: a key reference and a value cell.
pub struct Entry {
    key: StrongRef<SNode>,
    value: ValueCell,
}

impl Entry {
    const fn empty() -> Entry {
        Entry {
            key: StrongRef::null(),
            value: ValueCell::nil(),
        }
    }
}

/// The collector-managed slot array.
pub struct Entries {
    slots: Box<[Entry]>,
}

unsafe impl Trace for Entries {
    fn trace(&self, cx: &mut ScanContext) {
        for entry in self.slots.iter() {
            // Keys are held strongly: a live table must keep its key
            // strings canonical. Weak string reclamation is the intern
            // set's business alone.
            entry.key.scan(cx);
            entry.value.scan(cx);
        }
    }

    fn size_of(&self) -> usize {
        std::mem::size_of_val(self) + self.slots.len() * std::mem::size_of::<Entry>()
    }
}

/// A string-keyed hash table with tombstone deletion.
pub struct Table {
    count: AtomicUsize,
    entries: StrongRef<Entries>,
}

impl Table {
    /// An empty table. Allocates no slots until the first insert.
    pub fn new() -> Table {
        Table {
            count: AtomicUsize::new(0),
            entries: StrongRef::null(),
        }
    }

    /// Number of live entries plus tombstones (the load-factor count).
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe for the slot belonging to `key`: its current slot, or the
    /// first reusable slot (tombstone before empty) on its chain.
    fn find(entries: &Entries, key: Gc<SNode>) -> &Entry {
        let capacity = entries.slots.len();
        debug_assert!(capacity.is_power_of_two());
        let mut index = key.hash() as usize & (capacity - 1);
        let mut tombstone: Option<&Entry> = None;
        loop {
            let entry = &entries.slots[index];
            match entry.key.load() {
                None => {
                    if entry.value.load().is_nil() {
                        // Truly empty: end of the probe chain.
                        return tombstone.unwrap_or(entry);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(entry);
                    }
                }
                Some(k) if Gc::ptr_eq(k, key) => return entry,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Look up `key`.
    pub fn get(&self, key: Gc<SNode>) -> Option<Value> {
        let entries = self.entries.load()?;
        let entry = Self::find(&entries, key);
        entry.key.load().map(|_| entry.value.load())
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&self, key: Gc<SNode>, value: Value) -> bool {
        self.grow_if_needed();
        let entries = self.entries.load().expect("table grown before insert");
        let entry = Self::find(&entries, key);
        let is_new = entry.key.load().is_none();
        if is_new && entry.value.load().is_nil() {
            // A fresh slot, not a recycled tombstone.
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        // Value before key: a concurrent reader either misses the entry
        // entirely (the slot still reads as tombstone/empty) or sees it
        // fully formed. Key-first would expose a nil value under a live
        // key.
        entry.value.store(value);
        entry.key.store(Some(key));
        is_new
    }

    /// Remove `key`, leaving a tombstone. Returns true if it was
    /// present.
    pub fn delete(&self, key: Gc<SNode>) -> bool {
        let Some(entries) = self.entries.load() else {
            return false;
        };
        let entry = Self::find(&entries, key);
        if entry.key.load().is_none() {
            return false;
        }
        // Tombstone value first so no reader ever observes a null key
        // with a nil value mid-chain, which would truncate its probe.
        entry.value.store(Value::TRUE);
        entry.key.store(None);
        true
    }

    /// Copy every entry of `from` into this table. Existing keys are
    /// overwritten, so copying a superclass's methods before defining
    /// the subclass's own gives shadowing for free.
    pub fn add_all(&self, from: &Table) {
        let Some(entries) = from.entries.load() else {
            return;
        };
        for entry in entries.slots.iter() {
            if let Some(key) = entry.key.load() {
                self.set(key, entry.value.load());
            }
        }
    }

    /// Visit every live entry.
    pub fn for_each(&self, mut f: impl FnMut(Gc<SNode>, Value)) {
        let Some(entries) = self.entries.load() else {
            return;
        };
        for entry in entries.slots.iter() {
            if let Some(key) = entry.key.load() {
                f(key, entry.value.load());
            }
        }
    }

    /// Scan hook for owning objects: push the slot array.
    pub fn scan(&self, cx: &mut ScanContext) {
        self.entries.scan(cx);
    }

    /// Root hook: shade the slot array so the collector scans the
    /// table's contents this cycle.
    pub fn shade(&self) {
        if let Some(entries) = self.entries.load() {
            gc::shade(entries.erase());
        }
    }

    fn grow_if_needed(&self) {
        let capacity = self.entries.load().map_or(0, |e| e.slots.len());
        if self.count.load(Ordering::Relaxed) + 1 > capacity - capacity / 4 {
            let new_capacity = if capacity < 8 { 8 } else { capacity * 2 };
            self.grow(new_capacity);
        }
    }

    /// Build, rehash into, and publish a larger slot array. Tombstones
    /// are dropped on the way.
    fn grow(&self, new_capacity: usize) {
        let slots = (0..new_capacity)
            .map(|_| Entry::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let fresh = gc::alloc(Entries { slots });

        let mut live = 0usize;
        if let Some(old) = self.entries.load() {
            for entry in old.slots.iter() {
                if let Some(key) = entry.key.load() {
                    let dest = Self::find(&fresh, key);
                    dest.key.store(Some(key));
                    dest.value.store(entry.value.load());
                    live += 1;
                }
            }
        }
        self.count.store(live, Ordering::Relaxed);
        // Release publication: readers either see the old array or the
        // fully rehashed new one.
        self.entries.store(Some(fresh));
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
