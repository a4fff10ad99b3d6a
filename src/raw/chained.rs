use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use super::launch::{launch, launch_masks};
use super::probe::{bucket_index, buckets_for};
use super::utils::{debug, trace, BucketLock};
use super::{rehash_capacity, reinsert, DeviceHashBackend, SlotBuffer, NULL_INDEX};
use crate::{Device, Result};

// Marks the end of a chain.
const EMPTY: u32 = u32::MAX;

// Expected chain length at full capacity.
const CHAIN_LENGTH: usize = 2;

// A hash table of chained buckets.
//
// Each bucket is a singly linked list of slots, threaded through `links`. Inserts
// and erases lock the bucket they modify, so a chain has at most one writer. Readers
// never lock, writers only run in batches that exclude readers.
pub struct ChainedBackend {
    // The first slot of each bucket.
    heads: Box<[AtomicU32]>,
    // The slot following each slot in its chain.
    links: Box<[AtomicU32]>,
    locks: Box<[BucketLock]>,
    buffer: SlotBuffer,
}

impl ChainedBackend {
    pub fn new(
        capacity: usize,
        key_size: usize,
        value_sizes: &[usize],
        device: Device,
    ) -> Result<ChainedBackend> {
        let buckets = buckets_for(capacity, CHAIN_LENGTH);
        ChainedBackend::with_buckets(capacity, buckets, key_size, value_sizes, device)
    }

    fn with_buckets(
        capacity: usize,
        buckets: usize,
        key_size: usize,
        value_sizes: &[usize],
        device: Device,
    ) -> Result<ChainedBackend> {
        let buffer = SlotBuffer::new(capacity, key_size, value_sizes, device)?;

        debug!(
            "allocated chained backend: capacity {}, {} buckets, {}",
            capacity, buckets, device
        );

        Ok(ChainedBackend {
            heads: (0..buckets).map(|_| AtomicU32::new(EMPTY)).collect(),
            links: (0..capacity).map(|_| AtomicU32::new(EMPTY)).collect(),
            locks: (0..buckets).map(|_| BucketLock::new()).collect(),
            buffer,
        })
    }

    // Returns an iterator over the slots of a bucket.
    fn chain(&self, bucket: usize) -> Chain<'_> {
        Chain {
            next: self.heads[bucket].load(Ordering::Acquire),
            links: &self.links,
        }
    }

    // Returns the slot holding `key` in the given bucket.
    #[inline]
    fn probe(&self, bucket: usize, key: &[u8]) -> Option<u32> {
        self.chain(bucket).find(|&slot| self.buffer.key(slot) == key)
    }

    // Insert a key if it is absent, calling `write` with its new slot before the slot
    // is published.
    #[inline]
    fn insert_with(&self, key: &[u8], write: impl FnOnce(u32)) -> (i32, bool) {
        let bucket = bucket_index(key, self.heads.len());
        let _guard = self.locks[bucket].lock();

        if let Some(slot) = self.probe(bucket, key) {
            return (slot as i32, false);
        }

        let Some(slot) = self.buffer.allocate() else {
            return (NULL_INDEX, false);
        };

        // Safety: the slot was just allocated and is not yet linked.
        unsafe { self.buffer.write_key(slot, key) };
        write(slot);

        // Link the slot at the head of the chain. Concurrent readers either see the old
        // head or the fully written slot.
        let head = self.heads[bucket].load(Ordering::Relaxed);
        self.links[slot as usize].store(head, Ordering::Relaxed);
        self.heads[bucket].store(slot, Ordering::Release);

        (slot as i32, true)
    }

    #[inline]
    fn erase_one(&self, key: &[u8]) -> bool {
        let bucket = bucket_index(key, self.heads.len());
        let _guard = self.locks[bucket].lock();

        let mut prev = EMPTY;
        let mut slot = self.heads[bucket].load(Ordering::Acquire);

        while slot != EMPTY {
            let next = self.links[slot as usize].load(Ordering::Acquire);

            if self.buffer.key(slot) == key {
                match prev {
                    EMPTY => self.heads[bucket].store(next, Ordering::Release),
                    prev => self.links[prev as usize].store(next, Ordering::Release),
                }

                self.buffer.free(slot);
                return true;
            }

            prev = slot;
            slot = next;
        }

        false
    }
}

impl DeviceHashBackend for ChainedBackend {
    fn insert(&mut self, keys: &[u8], values: &[&[u8]], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let value_sizes = self.buffer.value_sizes();
        let this = &*self;

        launch(indices, masks, |i, index, mask| {
            let key = &keys[i * key_size..(i + 1) * key_size];

            (*index, *mask) = this.insert_with(key, |slot| {
                for (channel, (values, &size)) in values.iter().zip(value_sizes).enumerate() {
                    // Safety: `insert_with` calls us before publishing the slot.
                    unsafe {
                        this.buffer
                            .write_value(channel, slot, &values[i * size..(i + 1) * size])
                    };
                }
            });
        });

        trace!(
            "inserted {} of {} keys",
            masks.iter().filter(|&&m| m).count(),
            masks.len()
        );
    }

    fn activate(&mut self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let this = &*self;

        launch(indices, masks, |i, index, mask| {
            let key = &keys[i * key_size..(i + 1) * key_size];

            // Safety: `insert_with` calls us before publishing the slot.
            (*index, *mask) = this.insert_with(key, |slot| unsafe { this.buffer.zero_values(slot) });
        });
    }

    fn find(&self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();

        launch(indices, masks, |i, index, mask| {
            let key = &keys[i * key_size..(i + 1) * key_size];
            let bucket = bucket_index(key, self.heads.len());

            (*index, *mask) = match self.probe(bucket, key) {
                Some(slot) => (slot as i32, true),
                None => (NULL_INDEX, false),
            };
        });
    }

    fn erase(&mut self, keys: &[u8], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let this = &*self;

        launch_masks(masks, |i, mask| {
            *mask = this.erase_one(&keys[i * key_size..(i + 1) * key_size]);
        });
    }

    fn active_indices(&self) -> Vec<u32> {
        (0..self.heads.len())
            .into_par_iter()
            .flat_map_iter(|bucket| self.chain(bucket))
            .collect()
    }

    fn rehash(&mut self, buckets: usize) -> Result<()> {
        let capacity = rehash_capacity(
            self.buffer.capacity(),
            self.heads.len(),
            buckets,
            self.buffer.len(),
        );

        let mut next = ChainedBackend::with_buckets(
            capacity,
            buckets,
            self.buffer.key_size(),
            self.buffer.value_sizes(),
            self.buffer.device(),
        )?;

        reinsert(self, &mut next)?;
        *self = next;
        Ok(())
    }

    fn clear(&mut self) {
        for head in self.heads.iter_mut() {
            *head.get_mut() = EMPTY;
        }

        self.buffer.reset();
    }

    fn bucket_sizes(&self) -> Vec<usize> {
        (0..self.heads.len())
            .into_par_iter()
            .map(|bucket| self.chain(bucket).count())
            .collect()
    }

    fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    fn buffer(&self) -> &SlotBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut SlotBuffer {
        &mut self.buffer
    }
}

// An iterator over the slots of a chain.
struct Chain<'a> {
    next: u32,
    links: &'a [AtomicU32],
}

impl Iterator for Chain<'_> {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.next == EMPTY {
            return None;
        }

        let slot = self.next;
        self.next = self.links[slot as usize].load(Ordering::Acquire);
        Some(slot)
    }
}
