//! Intern set behavior without collector interference.
//!
//! No collector thread runs in this binary, so trie structure is fully
//! deterministic: nothing is evicted and every CAS succeeds first try.

use qet_gc::intern::{Census, Ctrie, Query};
use qet_gc::{self as gc, Gc};

#[test]
fn test_intern_is_canonical() {
    gc::enter();
    let a = gc::intern(b"alpha");
    let b = gc::intern(b"alpha");
    assert!(Gc::ptr_eq(a, b));
    assert_eq!(a.as_bytes(), b"alpha");
    assert_eq!(a.hash(), b.hash());
    gc::leave();
}

#[test]
fn test_distinct_contents_distinct_nodes() {
    gc::enter();
    let a = gc::intern(b"beta");
    let b = gc::intern(b"gamma");
    assert!(!Gc::ptr_eq(a, b));
    assert_ne!(a.as_bytes(), b.as_bytes());
    gc::leave();
}

#[test]
fn test_empty_and_long_strings() {
    gc::enter();
    let empty = gc::intern(b"");
    assert!(empty.is_empty());
    assert!(Gc::ptr_eq(empty, gc::intern(b"")));

    let long = vec![b'x'; 4096];
    let node = gc::intern(&long);
    assert_eq!(node.len(), 4096);
    assert!(Gc::ptr_eq(node, gc::intern(&long)));
    gc::leave();
}

#[test]
fn test_many_distinct_strings() {
    gc::enter();
    let mut nodes = Vec::new();
    for i in 0..1_000 {
        let text = format!("many-{}", i);
        nodes.push(gc::intern(text.as_bytes()));
    }
    // All distinct, and a second pass returns the same nodes.
    for i in 0..1_000 {
        let text = format!("many-{}", i);
        let again = gc::intern(text.as_bytes());
        assert!(Gc::ptr_eq(nodes[i], again), "node {} lost canonicity", i);
        for j in i + 1..1_000.min(i + 8) {
            assert!(!Gc::ptr_eq(nodes[i], nodes[j]));
        }
    }
    gc::leave();
}

#[test]
fn test_private_trie_grows_and_contracts_to_baseline() {
    gc::enter();
    let trie = Ctrie::create();
    gc::push_root(trie.erase());

    let baseline = trie.census();
    assert_eq!(
        baseline,
        Census {
            inodes: 1,
            cnodes: 1,
            snodes: 0,
            tnodes: 0,
            lnodes: 0,
        }
    );

    let mut nodes = Vec::new();
    for i in 0..512 {
        let text = format!("contract-{}", i);
        nodes.push(trie.emplace(&Query::new(text.as_bytes())));
    }
    let grown = trie.census();
    assert_eq!(grown.snodes, 512);
    assert!(grown.inodes >= 1);

    // Re-emplacing returns the same nodes without growing.
    for (i, &node) in nodes.iter().enumerate() {
        let text = format!("contract-{}", i);
        assert!(Gc::ptr_eq(node, trie.emplace(&Query::new(text.as_bytes()))));
    }
    assert_eq!(trie.census().snodes, 512);

    // Remove everything: the trie contracts back to its empty shape.
    for &node in nodes.iter() {
        let removed = trie.remove(node).expect("node was present");
        assert!(Gc::ptr_eq(removed, node));
    }
    let contracted = trie.census();
    assert_eq!(contracted.snodes, 0);
    assert_eq!(contracted.tnodes, 0);
    assert_eq!(contracted.lnodes, 0);
    assert_eq!(contracted.inodes, 1);
    assert_eq!(contracted.cnodes, 1);

    // Removing an absent node reports so.
    assert!(trie.remove(nodes[0]).is_none());

    gc::pop_root();
    gc::leave();
}

#[test]
fn test_concurrent_interning_agrees() {
    gc::enter();
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(std::thread::spawn(|| {
            gc::enter();
            let mut mine = Vec::new();
            for i in 0..200 {
                let text = format!("shared-{}", i);
                mine.push(gc::intern(text.as_bytes()).erase().as_ptr() as usize);
            }
            gc::leave();
            mine
        }));
    }
    let results: Vec<Vec<usize>> = handles
        .into_iter()
        .map(|h| h.join().expect("intern thread panicked"))
        .collect();
    // Every thread resolved every string to the same canonical node.
    for other in &results[1..] {
        assert_eq!(&results[0], other);
    }
    gc::leave();
}
