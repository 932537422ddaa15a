use criterion::{criterion_group, criterion_main, Criterion};
use reactive_core::{
    effect::{make_effect, EffectOptions},
    target::ReactiveCell,
};

/// A chain of 1000 effects, each reading the previous link's cell and
/// writing the next, exercising deep synchronous re-run propagation rather
/// than fan_out's breadth.
fn deep_chain(c: &mut Criterion) {
    c.bench_function("deep_chain_1000", |b| {
        b.iter(|| {
            let head = ReactiveCell::new(0);
            let mut prev = head.clone();
            for _ in 0..1000 {
                let next = ReactiveCell::new(0);
                let read = prev.clone();
                let write = next.clone();
                make_effect(
                    move || write.set(read.get() + 1),
                    None,
                    EffectOptions::default(),
                );
                prev = next;
            }
            assert_eq!(prev.peek(), 1000);
            head.set(1);
            assert_eq!(prev.peek(), 1001);
        });
    });
}

criterion_group!(benches, deep_chain);
criterion_main!(benches);
