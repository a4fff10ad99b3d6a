#![no_main]

use libfuzzer_sys::fuzz_target;

use arbitrary::Arbitrary;
use slabhash::{Device, Dtype, GrowthMode, HashBackend, HashMap as SlabHashMap, Tensor};
use std::collections::HashMap as StdHashMap;

#[derive(Debug, Arbitrary)]
enum Operation {
    Insert(Vec<(u32, u32)>),
    Activate(Vec<u32>),
    Erase(Vec<u32>),
    Find(Vec<u32>),
    Clear,
    Rehash(u8),
    Len,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    slab: bool,
    operations: Vec<Operation>,
}

fn keys(keys: &[u32]) -> Tensor {
    Tensor::from_slice(keys, &[keys.len()], Device::CPU).unwrap()
}

fn fuzz_hashmap(input: FuzzInput) {
    let backend = if input.slab {
        HashBackend::Slab
    } else {
        HashBackend::Chained
    };

    let mut std_map = StdHashMap::new();
    let mut slab_map = SlabHashMap::builder()
        .capacity(8)
        .key(Dtype::UInt32, &[])
        .value(Dtype::UInt32, &[])
        .backend(backend)
        .growth(GrowthMode::Doubling)
        .build()
        .unwrap();

    let (mut indices, mut masks) = (Tensor::default(), Tensor::default());

    for op in input.operations {
        match op {
            Operation::Insert(entries) if !entries.is_empty() => {
                let (k, v): (Vec<u32>, Vec<u32>) = entries.iter().copied().unzip();
                slab_map
                    .insert(&keys(&k), &[keys(&v)], &mut indices, &mut masks)
                    .unwrap();

                let inserted = masks.to_vec::<bool>().unwrap();
                for (i, (k, v)) in entries.iter().enumerate() {
                    if inserted[i] {
                        assert!(std_map.insert(*k, *v).is_none());
                    }
                }
                assert!(k.iter().all(|k| std_map.contains_key(k)));
            }
            Operation::Activate(k) if !k.is_empty() => {
                slab_map.activate(&keys(&k), &mut indices, &mut masks).unwrap();

                let inserted = masks.to_vec::<bool>().unwrap();
                for (i, k) in k.iter().enumerate() {
                    if inserted[i] {
                        assert!(std_map.insert(*k, 0).is_none());
                    }
                }
            }
            Operation::Erase(k) if !k.is_empty() => {
                slab_map.erase(&keys(&k), &mut masks).unwrap();

                let erased = masks.to_vec::<bool>().unwrap();
                for (i, k) in k.iter().enumerate() {
                    if erased[i] {
                        assert!(std_map.remove(k).is_some());
                    }
                }
                assert!(k.iter().all(|k| !std_map.contains_key(k)));
            }
            Operation::Find(k) if !k.is_empty() => {
                slab_map.find(&keys(&k), &mut indices, &mut masks).unwrap();

                let found = masks.to_vec::<bool>().unwrap();
                let slots = indices.to_vec::<i32>().unwrap();
                let values = slab_map.value_buffer(0).unwrap();
                let values = values.as_slice::<u32>().unwrap();

                for (i, k) in k.iter().enumerate() {
                    let std_result = std_map.get(k);
                    assert_eq!(std_result.is_some(), found[i]);
                    if let Some(v) = std_result {
                        assert_eq!(values[slots[i] as usize], *v);
                    }
                }
            }
            Operation::Clear => {
                std_map.clear();
                slab_map.clear();
            }
            Operation::Rehash(buckets) => {
                slab_map.rehash(buckets.max(1) as usize).unwrap();
            }
            Operation::Len => {
                assert_eq!(std_map.len(), slab_map.len());
            }
            _ => {}
        }
    }

    // Final consistency checks
    let (k, v) = slab_map.active_entries();
    let entries = k
        .to_vec::<u32>()
        .unwrap()
        .into_iter()
        .zip(v[0].to_vec::<u32>().unwrap())
        .collect::<StdHashMap<_, _>>();
    assert_eq!(entries, std_map);
    assert_eq!(std_map.len(), slab_map.len());
}

fuzz_target!(|data: FuzzInput| {
    fuzz_hashmap(data);
});
