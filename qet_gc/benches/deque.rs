//! Page-deque throughput benches.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qet_gc::Deque;

fn bench_push_pop_back(c: &mut Criterion) {
    c.bench_function("deque_push_pop_back_10k", |b| {
        b.iter(|| {
            let mut d: Deque<usize> = Deque::new();
            for i in 0..10_000usize {
                d.push_back(black_box(i));
            }
            while let Some(v) = d.pop_back() {
                black_box(v);
            }
        })
    });
}

fn bench_fifo_crawl(c: &mut Criterion) {
    c.bench_function("deque_fifo_crawl_10k", |b| {
        // Steady-state crawl around the ring: push one, pop one.
        let mut d: Deque<usize> = Deque::new();
        for i in 0..512usize {
            d.push_back(i);
        }
        b.iter(|| {
            for i in 0..10_000usize {
                d.push_back(black_box(i));
                black_box(d.pop_front());
            }
        })
    });
}

criterion_group!(benches, bench_push_pop_back, bench_fifo_crawl);
criterion_main!(benches);
