use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::alloc::Blob;
use super::utils::CachePadded;
use crate::{Device, Error, Result};

// A fixed pool of slots, each holding one key record and one record per value
// channel.
//
// Records are stored structure-of-arrays: one blob for the keys and one blob per
// value channel, all indexed by slot. Free slots are tracked in an index heap, the
// slots in `heap[top..]` are free and the ones in `heap[..top]` are allocated.
//
// Allocations may race with other allocations and frees with other frees, but an
// allocation never runs concurrently with a free.
pub struct SlotBuffer {
    capacity: usize,
    key_size: usize,
    value_sizes: Box<[usize]>,
    keys: Blob,
    values: Box<[Blob]>,
    heap: Box<[AtomicU32]>,
    top: CachePadded<AtomicUsize>,
}

impl SlotBuffer {
    // Allocate a buffer of `capacity` slots on `device`.
    pub fn new(
        capacity: usize,
        key_size: usize,
        value_sizes: &[usize],
        device: Device,
    ) -> Result<SlotBuffer> {
        debug_assert!(capacity <= u32::MAX as usize);

        let blob = |size: usize| {
            let len = capacity.checked_mul(size).ok_or_else(|| {
                Error::Device(format!(
                    "{} slots of {} bytes exceed the address space of {}",
                    capacity, size, device
                ))
            })?;

            Blob::zeroed(len, device)
        };

        let keys = blob(key_size)?;
        let values = value_sizes
            .iter()
            .map(|&size| blob(size))
            .collect::<Result<Box<[_]>>>()?;

        let heap = (0..capacity as u32).map(AtomicU32::new).collect();

        Ok(SlotBuffer {
            capacity,
            key_size,
            value_sizes: value_sizes.into(),
            keys,
            values,
            heap,
            top: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    #[inline]
    pub fn value_sizes(&self) -> &[usize] {
        &self.value_sizes
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.keys.device()
    }

    // Returns the number of allocated slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    // Claim a free slot, or return `None` if every slot is allocated.
    #[inline]
    pub fn allocate(&self) -> Option<u32> {
        let top = self
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top < self.capacity).then_some(top + 1)
            })
            .ok()?;

        Some(self.heap[top].load(Ordering::Relaxed))
    }

    // Return a slot to the free heap.
    //
    // The slot must have been allocated, and must no longer be reachable from any
    // bucket.
    #[inline]
    pub fn free(&self, index: u32) {
        debug_assert!((index as usize) < self.capacity);

        let top = self.top.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(top > 0, "freed more slots than were allocated");

        self.heap[top - 1].store(index, Ordering::Relaxed);
    }

    // Return every slot to the free heap.
    pub fn reset(&mut self) {
        for (i, slot) in self.heap.iter_mut().enumerate() {
            *slot.get_mut() = i as u32;
        }

        *self.top.get_mut() = 0;
    }

    // Returns the key record of a slot.
    #[inline]
    pub fn key(&self, index: u32) -> &[u8] {
        assert!((index as usize) < self.capacity);

        // Safety: records are only written before they are published, and only
        // published records are read.
        unsafe { self.keys.range(index as usize * self.key_size, self.key_size) }
    }

    // Returns the record of a slot in the given value channel.
    #[inline]
    pub fn value(&self, channel: usize, index: u32) -> &[u8] {
        assert!((index as usize) < self.capacity);

        let size = self.value_sizes[channel];
        // Safety: see `key`.
        unsafe { self.values[channel].range(index as usize * size, size) }
    }

    // Write the key record of a slot.
    //
    // # Safety
    //
    // The slot must be allocated by the caller and not yet published to any bucket.
    #[inline]
    pub unsafe fn write_key(&self, index: u32, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_size);
        unsafe { self.keys.write(index as usize * self.key_size, key) }
    }

    // Write the record of a slot in the given value channel.
    //
    // # Safety
    //
    // The slot must be allocated by the caller and not yet published to any bucket.
    #[inline]
    pub unsafe fn write_value(&self, channel: usize, index: u32, value: &[u8]) {
        let size = self.value_sizes[channel];
        debug_assert_eq!(value.len(), size);
        unsafe { self.values[channel].write(index as usize * size, value) }
    }

    // Zero every value record of a slot.
    //
    // # Safety
    //
    // The slot must be allocated by the caller and not yet published to any bucket.
    #[inline]
    pub unsafe fn zero_values(&self, index: u32) {
        for (blob, &size) in self.values.iter().zip(self.value_sizes.iter()) {
            unsafe { blob.zero(index as usize * size, size) }
        }
    }

    // Returns the raw bytes of the key buffer.
    #[inline]
    pub fn key_bytes(&self) -> &[u8] {
        self.keys.as_bytes()
    }

    // Returns the raw bytes of a value buffer.
    #[inline]
    pub fn value_bytes(&self, channel: usize) -> &[u8] {
        self.values[channel].as_bytes()
    }

    // Returns the raw bytes of a value buffer, mutably.
    #[inline]
    pub fn value_bytes_mut(&mut self, channel: usize) -> &mut [u8] {
        self.values[channel].as_bytes_mut()
    }

    // Copy the key records of the given slots into a dense array.
    pub fn gather_keys(&self, indices: &[u32]) -> Vec<u8> {
        indices.iter().flat_map(|&i| self.key(i)).copied().collect()
    }

    // Copy the records of the given slots in a value channel into a dense array.
    pub fn gather_values(&self, channel: usize, indices: &[u32]) -> Vec<u8> {
        indices
            .iter()
            .flat_map(|&i| self.value(channel, i))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn allocate_and_free() {
        let buffer = SlotBuffer::new(4, 4, &[8], Device::CPU).unwrap();
        let slots = (0..4).map(|_| buffer.allocate().unwrap()).collect::<Vec<_>>();
        assert_eq!(slots, [0, 1, 2, 3]);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.allocate(), None);

        buffer.free(2);
        buffer.free(0);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.allocate(), Some(0));
        assert_eq!(buffer.allocate(), Some(2));
        assert_eq!(buffer.allocate(), None);
    }

    #[test]
    fn concurrent_allocate() {
        let buffer = SlotBuffer::new(1000, 4, &[], Device::CPU).unwrap();

        let slots = std::thread::scope(|s| {
            let handles = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        std::iter::from_fn(|| buffer.allocate()).collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(slots.len(), 1000);
        assert_eq!(slots.iter().collect::<HashSet<_>>().len(), 1000);
    }

    #[test]
    fn oversized_records() {
        let err = SlotBuffer::new(1 << 20, 1 << 60, &[], Device::CPU).err();
        assert!(matches!(err, Some(Error::Device(_))));

        let err = SlotBuffer::new(4, 4, &[usize::MAX / 2], Device::cuda(0)).err();
        assert!(matches!(err, Some(Error::Device(_))));
    }

    #[test]
    fn records() {
        let mut buffer = SlotBuffer::new(3, 2, &[1, 3], Device::CPU).unwrap();
        let slot = buffer.allocate().unwrap();

        unsafe {
            buffer.write_key(slot, &[7, 8]);
            buffer.write_value(0, slot, &[1]);
            buffer.write_value(1, slot, &[2, 3, 4]);
        }

        assert_eq!(buffer.key(slot), &[7, 8]);
        assert_eq!(buffer.value(1, slot), &[2, 3, 4]);
        assert_eq!(buffer.gather_values(1, &[slot, slot]), vec![2, 3, 4, 2, 3, 4]);

        unsafe { buffer.zero_values(slot) };
        assert_eq!(buffer.value(0, slot), &[0]);
        assert_eq!(buffer.value(1, slot), &[0, 0, 0]);

        buffer.reset();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.value_bytes_mut(1).len(), 9);
    }
}
