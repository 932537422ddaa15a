use criterion::{criterion_group, criterion_main, Criterion};
use reactive_core::{
    effect::{make_effect, EffectOptions},
    target::ReactiveCell,
};

fn fan_out(c: &mut Criterion) {
    c.bench_function("fan_out_1000", |b| {
        b.iter(|| {
            let source = ReactiveCell::new(0);
            let mut sums = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let source = source.clone();
                let sum = ReactiveCell::new(0);
                let sum_write = sum.clone();
                make_effect(
                    move || sum_write.set(source.get()),
                    None,
                    EffectOptions::default(),
                );
                sums.push(sum);
            }
            assert_eq!(sums.iter().map(|s| s.peek()).sum::<i32>(), 0);
            source.set(1);
            assert_eq!(sums.iter().map(|s| s.peek()).sum::<i32>(), 1000);
        });
    });
}

criterion_group!(benches, fan_out);
criterion_main!(benches);
