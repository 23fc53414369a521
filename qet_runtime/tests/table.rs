//! Field-table semantics.
//!
//! Keys are interned strings; no collector thread runs here, so every
//! key stays live for the duration.

use qet_core::Value;
use qet_gc::{self as gc, Gc, SNode};
use qet_runtime::Table;

fn key(text: &str) -> Gc<SNode> {
    gc::intern(text.as_bytes())
}

#[test]
fn test_set_get_delete() {
    gc::enter();
    let table = Table::new();
    let k = key("field");

    assert!(table.get(k).is_none());
    assert!(table.set(k, Value::int(7).expect("small int")));
    assert_eq!(table.get(k).and_then(Value::as_int), Some(7));

    // Overwrite is not a new key.
    assert!(!table.set(k, Value::int(8).expect("small int")));
    assert_eq!(table.get(k).and_then(Value::as_int), Some(8));

    assert!(table.delete(k));
    assert!(table.get(k).is_none());
    assert!(!table.delete(k));
    gc::leave();
}

#[test]
fn test_tombstones_preserve_probe_chains() {
    gc::enter();
    let table = Table::new();
    // Fill enough to force long probe chains and several growths.
    let keys: Vec<Gc<SNode>> = (0..256).map(|i| key(&format!("probe-{}", i))).collect();
    for (i, &k) in keys.iter().enumerate() {
        table.set(k, Value::int(i as i64).expect("small int"));
    }
    // Delete every other key, then verify the rest still resolve.
    for &k in keys.iter().step_by(2) {
        assert!(table.delete(k));
    }
    for (i, &k) in keys.iter().enumerate() {
        if i % 2 == 0 {
            assert!(table.get(k).is_none());
        } else {
            assert_eq!(table.get(k).and_then(Value::as_int), Some(i as i64));
        }
    }
    // Reinsert into tombstoned slots.
    for (i, &k) in keys.iter().enumerate().step_by(2) {
        table.set(k, Value::int(i as i64 + 1_000).expect("small int"));
    }
    for (i, &k) in keys.iter().enumerate() {
        let expected = if i % 2 == 0 { i as i64 + 1_000 } else { i as i64 };
        assert_eq!(table.get(k).and_then(Value::as_int), Some(expected));
    }
    gc::leave();
}

#[test]
fn test_nil_and_bool_values_round_trip() {
    gc::enter();
    let table = Table::new();
    let k = key("nil-valued");
    table.set(k, Value::NIL);
    // A nil value is still a present entry, distinct from absence.
    assert_eq!(table.get(k), Some(Value::NIL));
    table.set(k, Value::FALSE);
    assert_eq!(table.get(k), Some(Value::FALSE));
    gc::leave();
}

#[test]
fn test_add_all_and_shadowing() {
    gc::enter();
    let superclass = Table::new();
    let subclass = Table::new();
    let shared = key("shared-method");
    let only_super = key("super-only");

    superclass.set(shared, Value::int(1).expect("small int"));
    superclass.set(only_super, Value::int(2).expect("small int"));

    // Copy-down inheritance, then shadow in the subclass.
    subclass.add_all(&superclass);
    subclass.set(shared, Value::int(10).expect("small int"));

    assert_eq!(subclass.get(shared).and_then(Value::as_int), Some(10));
    assert_eq!(subclass.get(only_super).and_then(Value::as_int), Some(2));
    // The superclass is untouched by the shadow.
    assert_eq!(superclass.get(shared).and_then(Value::as_int), Some(1));
    gc::leave();
}

#[test]
fn test_readers_race_one_writer() {
    gc::enter();
    // The table is lock-free for readers: spin readers over a table a
    // single writer keeps growing, and require every observed value to
    // be one the writer actually wrote.
    static TABLE: std::sync::OnceLock<Table> = std::sync::OnceLock::new();
    let table = TABLE.get_or_init(Table::new);

    let keys: Vec<Gc<SNode>> = (0..128).map(|i| key(&format!("racy-{}", i))).collect();
    let stop = std::sync::atomic::AtomicBool::new(false);

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let keys = &keys;
                let stop = &stop;
                scope.spawn(move || {
                    gc::enter();
                    while !stop.load(std::sync::atomic::Ordering::Acquire) {
                        for &k in keys.iter() {
                            if let Some(v) = table.get(k) {
                                let got = v.as_int().expect("writer stores ints");
                                assert!(got >= 0, "torn or invented value {}", got);
                            }
                        }
                    }
                    gc::leave();
                })
            })
            .collect();

        for round in 0..50 {
            for (i, &k) in keys.iter().enumerate() {
                table.set(k, Value::int((round * 128 + i) as i64).expect("small int"));
            }
        }
        stop.store(true, std::sync::atomic::Ordering::Release);
        for reader in readers {
            reader.join().expect("reader panicked");
        }
    });
    gc::leave();
}
