//! Michael–Scott queue and Treiber stack, single- and multi-threaded.
//!
//! No collector thread runs here; the structures are exercised as pure
//! lock-free containers over managed nodes.

use qet_core::Value;
use qet_gc::{self as gc, MsQueue, TreiberStack};

#[test]
fn test_queue_fifo_order() {
    gc::enter();
    let queue = MsQueue::create();
    gc::push_root(queue.erase());

    assert!(queue.pop().is_none());
    for i in 0..100 {
        queue.push(Value::int(i).expect("small int"));
    }
    for i in 0..100 {
        assert_eq!(queue.pop().and_then(Value::as_int), Some(i));
    }
    assert!(queue.pop().is_none());

    gc::pop_root();
    gc::leave();
}

#[test]
fn test_queue_concurrent_producers_consumers() {
    gc::enter();
    let queue = MsQueue::create();
    gc::push_root(queue.erase());

    let producers: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                gc::enter();
                for i in 0..500 {
                    queue.push(Value::int(t * 1_000 + i).expect("small int"));
                }
                gc::leave();
            })
        })
        .collect();
    for handle in producers {
        handle.join().expect("producer panicked");
    }

    let mut seen = Vec::new();
    while let Some(value) = queue.pop() {
        seen.push(value.as_int().expect("queue holds ints"));
    }
    assert_eq!(seen.len(), 2_000);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 2_000, "a pushed value was lost or duplicated");

    gc::pop_root();
    gc::leave();
}

#[test]
fn test_stack_lifo_order() {
    gc::enter();
    let stack = TreiberStack::create();
    gc::push_root(stack.erase());

    assert!(stack.pop().is_none());
    for i in 0..100 {
        stack.push(Value::int(i).expect("small int"));
    }
    for i in (0..100).rev() {
        assert_eq!(stack.pop().and_then(Value::as_int), Some(i));
    }
    assert!(stack.pop().is_none());

    gc::pop_root();
    gc::leave();
}

#[test]
fn test_stack_concurrent_push() {
    gc::enter();
    let stack = TreiberStack::create();
    gc::push_root(stack.erase());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                gc::enter();
                for i in 0..500 {
                    stack.push(Value::int(t * 1_000 + i).expect("small int"));
                }
                gc::leave();
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("pusher panicked");
    }

    let mut count = 0;
    while stack.pop().is_some() {
        count += 1;
    }
    assert_eq!(count, 2_000);

    gc::pop_root();
    gc::leave();
}
