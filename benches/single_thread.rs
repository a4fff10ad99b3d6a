use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slabhash::{Device, Dtype, HashBackend, Tensor};

const SIZE: usize = 10_000;

#[derive(Clone, Copy)]
struct RandomKeys {
    state: u32,
}

impl RandomKeys {
    fn new() -> Self {
        RandomKeys { state: 0 }
    }
}

impl Iterator for RandomKeys {
    type Item = i32;
    fn next(&mut self) -> Option<i32> {
        // Add 1 then multiply by some 32 bit prime.
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state as i32)
    }
}

fn map(backend: HashBackend) -> (slabhash::HashMap, Tensor) {
    let keys = RandomKeys::new().take(SIZE).collect::<Vec<_>>();
    let keys = Tensor::from_slice(&keys, &[SIZE, 1], Device::CPU).unwrap();

    let mut map = slabhash::HashMap::builder()
        .capacity(SIZE as i64)
        .key(Dtype::Int32, &[1])
        .backend(backend)
        .build()
        .unwrap();

    let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
    map.insert(&keys, &[], &mut indices, &mut masks).unwrap();

    (map, keys)
}

fn compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for (name, backend) in [("chained", HashBackend::Chained), ("slab", HashBackend::Slab)] {
        group.bench_function(name, |b| {
            let (map, keys) = map(backend);
            let (mut indices, mut masks) = (Tensor::default(), Tensor::default());

            b.iter(|| {
                map.find(&keys, &mut indices, &mut masks).unwrap();
                black_box(&masks);
            });
        });
    }

    group.bench_function("std", |b| {
        let mut m = HashMap::<i32, i32>::default();
        for (slot, i) in RandomKeys::new().take(SIZE).enumerate() {
            m.insert(i, slot as i32);
        }

        b.iter(|| {
            for i in RandomKeys::new().take(SIZE) {
                black_box(assert!(m.get(&i).is_some()));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, compare);
criterion_main!(benches);
