use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::prelude::*;
use slabhash::grid::VoxelBlockGrid;
use slabhash::{Device, Dtype, HashBackend, HashMap, Tensor};

const BACKENDS: [(&str, HashBackend); 2] =
    [("chained", HashBackend::Chained), ("slab", HashBackend::Slab)];

// Voxel coordinates in a cube, with roughly one duplicate per key.
fn voxels(count: usize) -> Tensor {
    let mut rng = StdRng::seed_from_u64(0);
    let extent = ((count as f64).cbrt() as i32).max(1);

    let data = (0..count * 3)
        .map(|_| rng.gen_range(-extent..extent))
        .collect::<Vec<_>>();
    Tensor::from_slice(&data, &[count, 3], Device::CPU).unwrap()
}

fn map(capacity: usize, backend: HashBackend) -> HashMap {
    HashMap::builder()
        .capacity(capacity as i64)
        .key(Dtype::Int32, &[3])
        .value(Dtype::Float32, &[8])
        .backend(backend)
        .build()
        .unwrap()
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1 << 10, 1 << 14, 1 << 18] {
        let keys = voxels(size);
        let values = Tensor::zeros(&[size, 8], Dtype::Float32, Device::CPU);

        for (name, backend) in BACKENDS {
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &size| {
                b.iter_batched(
                    || map(size, backend),
                    |mut map| {
                        let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
                        map.insert(&keys, &[values.clone()], &mut indices, &mut masks)
                            .unwrap();
                        black_box(map)
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

fn erase(c: &mut Criterion) {
    let mut group = c.benchmark_group("erase");
    let size = 1 << 16;
    let keys = voxels(size);

    for (name, backend) in BACKENDS {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let mut map = map(size, backend);
                    let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
                    map.activate(&keys, &mut indices, &mut masks).unwrap();
                    map
                },
                |mut map| {
                    let mut masks = Tensor::default();
                    map.erase(&keys, &mut masks).unwrap();
                    black_box(map)
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn touch(c: &mut Criterion) {
    let mut group = c.benchmark_group("touch");
    let mut rng = StdRng::seed_from_u64(1);
    let points = (0..1 << 14)
        .map(|_| [rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0), rng.gen_range(0.0..4.0)])
        .collect::<Vec<[f32; 3]>>();

    for (name, backend) in BACKENDS {
        group.bench_function(name, |b| {
            let grid = VoxelBlockGrid::new(
                &["tsdf", "weight"],
                &[Dtype::Float32, Dtype::Float32],
                &[vec![1], vec![1]],
                0.01,
                8,
                1 << 14,
                Device::CPU,
                backend,
            )
            .unwrap();

            b.iter(|| black_box(grid.touch(&points).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, insert, erase, touch);
criterion_main!(benches);
