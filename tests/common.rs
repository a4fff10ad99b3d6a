#![allow(dead_code)]

use slabhash::{Device, Dtype, GrowthMode, HashBackend, HashMap, HashSet, Tensor};

// Prints a log message if `RUST_LOG=debug` is set.
#[macro_export]
macro_rules! debug {
    ($($x:tt)*) => {
        if std::env::var("RUST_LOG").as_deref() == Ok("debug") {
            println!($($x)*);
        }
    };
}

const BACKENDS: [HashBackend; 2] = [HashBackend::Chained, HashBackend::Slab];

// Run the test on every backend, with a map of integer keys and one float value.
pub fn with_map(mut test: impl FnMut(&dyn Fn(i64) -> HashMap)) {
    for backend in BACKENDS {
        debug!("running with {:?} backend", backend);

        test(
            &(|capacity| {
                HashMap::builder()
                    .capacity(capacity)
                    .key(Dtype::Int32, &[1])
                    .value(Dtype::Float32, &[1])
                    .backend(backend)
                    .build()
                    .unwrap()
            }),
        );
    }
}

// Run the test on every backend, with maps that grow on demand.
pub fn with_growing_map(mut test: impl FnMut(&dyn Fn(i64) -> HashMap)) {
    for backend in BACKENDS {
        test(
            &(|capacity| {
                HashMap::builder()
                    .capacity(capacity)
                    .key(Dtype::Int32, &[1])
                    .value(Dtype::Float32, &[1])
                    .backend(backend)
                    .growth(GrowthMode::Doubling)
                    .build()
                    .unwrap()
            }),
        );
    }
}

// Run the test on every backend, with a set of integer keys.
pub fn with_set(mut test: impl FnMut(&dyn Fn(i64) -> HashSet)) {
    for backend in BACKENDS {
        test(
            &(|capacity| {
                HashSet::builder()
                    .capacity(capacity)
                    .key(Dtype::Int32, &[1])
                    .backend(backend)
                    .build()
                    .unwrap()
            }),
        );
    }
}

// Returns a batch of single-integer keys.
pub fn keys(keys: &[i32]) -> Tensor {
    Tensor::from_slice(keys, &[keys.len(), 1], Device::CPU).unwrap()
}

// Returns one float value per key.
pub fn values(values: &[f32]) -> Tensor {
    Tensor::from_slice(values, &[values.len(), 1], Device::CPU).unwrap()
}

// Returns an empty pair of output tensors.
pub fn outputs() -> (Tensor, Tensor) {
    (Tensor::default(), Tensor::default())
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two()
    }
}

// Returns the number of iterations for stress tests.
pub fn iterations(base: usize) -> usize {
    if cfg!(miri) {
        1
    } else if cfg!(slabhash_stress) {
        base * 16
    } else {
        base
    }
}
