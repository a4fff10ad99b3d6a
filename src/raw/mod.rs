mod alloc;
mod buffer;
mod chained;
mod launch;
mod probe;
mod slab;

pub(crate) mod utils;

pub use buffer::SlotBuffer;
pub use chained::ChainedBackend;
pub use slab::SlabBackend;

use serde::{Deserialize, Serialize};

use crate::{Device, DeviceType, Error, Result};

/// The slot index reported for keys that have no slot.
pub const NULL_INDEX: i32 = -1;

/// The concurrency implementation backing a hash map.
///
/// Every backend returns identical results for the same sequence of calls, only
/// throughput differs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashBackend {
    /// Choose a backend based on the device of the map.
    ///
    /// CPU maps use [`HashBackend::Chained`], CUDA maps use [`HashBackend::Slab`].
    #[default]
    Default,
    /// Chained buckets guarded by per-bucket locks.
    ///
    /// Lookups are lock-free. Inserts and erases lock the bucket they touch, which
    /// keeps hot buckets cheap on a small number of threads.
    Chained,
    /// Linked lists of 31-lane slabs, probed a whole slab at a time.
    ///
    /// Keys are processed in warps of 32. Inserts claim lanes with compare-and-swap,
    /// no operation takes a lock.
    Slab,
}

impl HashBackend {
    /// Resolves [`HashBackend::Default`] to a concrete backend for `device`.
    pub fn resolve(self, device: Device) -> HashBackend {
        match self {
            HashBackend::Default => match device.kind() {
                DeviceType::Cpu => HashBackend::Chained,
                DeviceType::Cuda => HashBackend::Slab,
            },
            backend => backend,
        }
    }
}

// A concurrent map from key records to slot indices, over a `SlotBuffer`.
//
// Batch operations process keys in parallel. `keys` holds `n` dense key records,
// each value array holds `n` dense records of its channel. Mutating operations
// take `&mut self`, so a batch never overlaps another call on the same backend.
pub trait DeviceHashBackend: Send + Sync {
    // Insert keys that are not already present, writing their values.
    //
    // Reports the new slot and `true` for inserted keys, the existing slot and
    // `false` for keys already present, and `NULL_INDEX` and `false` for keys that
    // could not be stored.
    fn insert(&mut self, keys: &[u8], values: &[&[u8]], indices: &mut [i32], masks: &mut [bool]);

    // Like `insert`, zeroing the value records of new slots.
    fn activate(&mut self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]);

    // Look up keys, reporting `NULL_INDEX` and `false` for missing keys.
    fn find(&self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]);

    // Remove keys, reporting `false` for missing keys.
    fn erase(&mut self, keys: &[u8], masks: &mut [bool]);

    // Returns every occupied slot, in bucket order and then chain order.
    fn active_indices(&self) -> Vec<u32>;

    // Rebuild the backend with `buckets` buckets, preserving every entry.
    fn rehash(&mut self, buckets: usize) -> Result<()>;

    // Remove every entry.
    fn clear(&mut self);

    // Returns the number of occupied slots in each bucket.
    fn bucket_sizes(&self) -> Vec<usize>;

    fn bucket_count(&self) -> usize;

    fn buffer(&self) -> &SlotBuffer;

    fn buffer_mut(&mut self) -> &mut SlotBuffer;

    fn len(&self) -> usize {
        self.buffer().len()
    }

    fn capacity(&self) -> usize {
        self.buffer().capacity()
    }

    fn device(&self) -> Device {
        self.buffer().device()
    }

    fn load_factor(&self) -> f32 {
        self.len() as f32 / self.bucket_count() as f32
    }
}

// Create a backend with room for `capacity` records.
pub fn create(
    backend: HashBackend,
    capacity: usize,
    key_size: usize,
    value_sizes: &[usize],
    device: Device,
) -> Result<Box<dyn DeviceHashBackend>> {
    let capacity = check_capacity(capacity)?;

    Ok(match backend.resolve(device) {
        HashBackend::Slab => Box::new(SlabBackend::new(capacity, key_size, value_sizes, device)?),
        _ => Box::new(ChainedBackend::new(capacity, key_size, value_sizes, device)?),
    })
}

// The largest capacity whose slot indices fit in an `i32`.
pub const MAX_CAPACITY: usize = i32::MAX as usize;

fn check_capacity(capacity: usize) -> Result<usize> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(Error::Config(format!(
            "capacity must be in 1..={}, but got {}",
            MAX_CAPACITY, capacity
        )));
    }

    Ok(capacity)
}

// Returns the capacity of a backend rehashed from `buckets` to `new_buckets` buckets.
//
// Capacity scales with the bucket count, and never drops below the number of
// entries that have to be carried over.
pub fn rehash_capacity(capacity: usize, buckets: usize, new_buckets: usize, len: usize) -> usize {
    let scaled = (new_buckets as u128 * capacity as u128).div_ceil(buckets as u128);
    (scaled.min(MAX_CAPACITY as u128) as usize).max(len).max(1)
}

// Copy every entry of `from` into `to`.
//
// `to` must have room for all entries. Fails with a device error otherwise.
fn reinsert(from: &dyn DeviceHashBackend, to: &mut dyn DeviceHashBackend) -> Result<()> {
    let active = from.active_indices();
    if active.is_empty() {
        return Ok(());
    }

    let buffer = from.buffer();
    let keys = buffer.gather_keys(&active);
    let values = (0..buffer.value_sizes().len())
        .map(|channel| buffer.gather_values(channel, &active))
        .collect::<Vec<_>>();
    let values = values.iter().map(Vec::as_slice).collect::<Vec<_>>();

    let mut indices = vec![NULL_INDEX; active.len()];
    let mut masks = vec![false; active.len()];
    to.insert(&keys, &values, &mut indices, &mut masks);

    let dropped = masks.iter().filter(|&&inserted| !inserted).count();
    if dropped > 0 {
        return Err(Error::Device(format!(
            "rehash dropped {} of {} entries",
            dropped,
            active.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rule() {
        assert_eq!(rehash_capacity(4, 2, 8, 4), 16);
        assert_eq!(rehash_capacity(4, 1, 8, 4), 32);
        assert_eq!(rehash_capacity(10, 5, 1, 10), 10);
        assert_eq!(rehash_capacity(10, 4, 6, 0), 15);
        assert_eq!(rehash_capacity(MAX_CAPACITY, 1, 4, 0), MAX_CAPACITY);
    }

    #[test]
    fn resolve_default() {
        assert_eq!(HashBackend::Default.resolve(Device::CPU), HashBackend::Chained);
        assert_eq!(HashBackend::Default.resolve(Device::cuda(0)), HashBackend::Slab);
        assert_eq!(HashBackend::Slab.resolve(Device::CPU), HashBackend::Slab);
    }

    #[test]
    fn zero_capacity() {
        assert!(matches!(
            create(HashBackend::Default, 0, 4, &[], Device::CPU),
            Err(Error::Config(_))
        ));
    }
}
