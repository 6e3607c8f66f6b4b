use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tidemark::{ListUpdate, StoreKey};

/// A synthetic update over a list of `len` items: every third index
/// removed, a fresh key inserted every fifth position.
fn build_update(len: usize, seed: u64) -> ListUpdate {
    let removed = (0..len)
        .step_by(3)
        .map(|i| (i, StoreKey(i as u64 + 1)))
        .collect();
    let added = (0..len / 5)
        .map(|i| (i * 4, StoreKey(seed + i as u64)))
        .collect();
    ListUpdate::from_pairs(removed, added)
}

fn bench_compose(c: &mut Criterion) {
    let first = build_update(300, 10_000);
    let second = build_update(200, 20_000);
    c.bench_function("compose_300x200", |b| {
        b.iter(|| black_box(&first).compose(black_box(&second)))
    });
}

fn bench_invert(c: &mut Criterion) {
    let update = build_update(300, 10_000);
    c.bench_function("invert_300", |b| b.iter(|| black_box(&update).invert()));
}

fn bench_compose_chain(c: &mut Criterion) {
    let updates: Vec<ListUpdate> = (0..8).map(|i| build_update(60, 1_000 * (i + 1))).collect();
    c.bench_function("compose_chain_8", |b| {
        b.iter(|| {
            updates
                .iter()
                .skip(1)
                .fold(updates[0].clone(), |acc, update| acc.compose(update))
        })
    });
}

criterion_group!(benches, bench_compose, bench_invert, bench_compose_chain);
criterion_main!(benches);
