use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rayon::prelude::*;

use super::launch::{ballot, launch_warps, launch_warps_masks, WARP_SIZE};
use super::probe::{bucket_index, buckets_for};
use super::utils::{debug, trace, CachePadded, Parker};
use super::{rehash_capacity, reinsert, DeviceHashBackend, SlotBuffer, NULL_INDEX};
use crate::{Device, Result};

// The number of slot lanes in a slab, one warp minus the link lane.
const LANES: usize = WARP_SIZE - 1;

// An empty lane, or the end of a slab list.
const EMPTY: u32 = u32::MAX;

// A lane or link claimed by an insert that has not yet published its slot.
const RESERVED: u32 = u32::MAX - 1;

// Expected number of records per bucket at full capacity.
const BUCKET_LOAD: usize = 4;

// A slab of lanes, laid out as one warp-sized line.
//
// Each lane holds a slot index, `EMPTY`, or `RESERVED`. `next` links to the
// following slab of the bucket.
#[repr(C, align(128))]
struct Slab {
    lanes: [AtomicU32; LANES],
    next: AtomicU32,
}

impl Slab {
    fn new() -> Slab {
        Slab {
            lanes: std::array::from_fn(|_| AtomicU32::new(EMPTY)),
            next: AtomicU32::new(EMPTY),
        }
    }

    fn reset(&mut self) {
        for lane in self.lanes.iter_mut() {
            *lane.get_mut() = EMPTY;
        }

        *self.next.get_mut() = EMPTY;
    }
}

// A hash table of slab lists.
//
// The first `bucket_count` slabs are the bucket heads, the remaining slabs are
// handed out as buckets overflow, from the stack of returned slabs first and then
// by a bump allocator. Lanes go from `EMPTY` to `RESERVED` to a slot index during an
// insert batch, and from a slot index back to `EMPTY` during an erase batch. After
// an erase batch the touched buckets are packed, and the overflow slabs left empty
// are returned.
//
// An insert scans the whole list of its bucket before claiming the first empty
// lane, and waits out any reservation it encounters. Two inserts of the same key
// therefore either race for the same lane, or the later one observes the
// reservation of the earlier one.
pub struct SlabBackend {
    slabs: Box<[Slab]>,
    bucket_count: usize,
    // The next unused slab in the pool.
    next_slab: CachePadded<AtomicUsize>,
    // Returned overflow slabs, `free_slabs[..free_top]` are free.
    free_slabs: Box<[AtomicU32]>,
    free_top: CachePadded<AtomicUsize>,
    parker: Parker,
    buffer: SlotBuffer,
}

// The outcome of a scan of a bucket.
enum Scan {
    // The key is stored in this slot.
    Found(u32),
    // The key is absent, this is the first empty lane.
    Empty(usize, usize),
    // The key is absent and the bucket is full, this is the last slab.
    Full(usize),
}

impl SlabBackend {
    pub fn new(
        capacity: usize,
        key_size: usize,
        value_sizes: &[usize],
        device: Device,
    ) -> Result<SlabBackend> {
        let buckets = buckets_for(capacity, BUCKET_LOAD);
        SlabBackend::with_buckets(capacity, buckets, key_size, value_sizes, device)
    }

    fn with_buckets(
        capacity: usize,
        buckets: usize,
        key_size: usize,
        value_sizes: &[usize],
        device: Device,
    ) -> Result<SlabBackend> {
        let buffer = SlotBuffer::new(capacity, key_size, value_sizes, device)?;

        // Partially filled slabs at the tail of each bucket waste lanes, so the pool
        // holds two overflow slabs for every slab worth of records.
        let slabs = buckets + 2 * capacity.div_ceil(LANES);

        debug!(
            "allocated slab backend: capacity {}, {} buckets, {} slabs, {}",
            capacity, buckets, slabs, device
        );

        Ok(SlabBackend {
            slabs: (0..slabs).map(|_| Slab::new()).collect(),
            bucket_count: buckets,
            next_slab: CachePadded::new(AtomicUsize::new(buckets)),
            free_slabs: (buckets..slabs).map(|_| AtomicU32::new(EMPTY)).collect(),
            free_top: CachePadded::new(AtomicUsize::new(0)),
            parker: Parker::default(),
            buffer,
        })
    }

    // Load the lanes of a slab, waiting out any reservations.
    #[inline]
    fn read_slab(&self, slab: usize) -> [u32; LANES] {
        let slab = &self.slabs[slab];
        let mut lanes: [u32; LANES] = std::array::from_fn(|i| slab.lanes[i].load(Ordering::Acquire));

        let mut reserved = ballot(&lanes, |lane| lane == RESERVED);
        while reserved != 0 {
            let i = reserved.trailing_zeros() as usize;
            lanes[i] = self.parker.park(&slab.lanes[i], RESERVED);
            reserved &= reserved - 1;
        }

        lanes
    }

    // Load the link of a slab, waiting out any reservation.
    #[inline]
    fn read_next(&self, slab: usize) -> u32 {
        let next = &self.slabs[slab].next;

        match next.load(Ordering::Acquire) {
            RESERVED => self.parker.park(next, RESERVED),
            next => next,
        }
    }

    // Scan the bucket of `key`.
    #[inline]
    fn scan(&self, key: &[u8]) -> Scan {
        let mut slab = bucket_index(key, self.bucket_count);
        let mut empty = None;

        loop {
            let lanes = self.read_slab(slab);

            let found = ballot(&lanes, |lane| lane < RESERVED && self.buffer.key(lane) == key);
            if found != 0 {
                return Scan::Found(lanes[found.trailing_zeros() as usize]);
            }

            if empty.is_none() {
                let free = ballot(&lanes, |lane| lane == EMPTY);
                if free != 0 {
                    empty = Some((slab, free.trailing_zeros() as usize));
                }
            }

            match self.read_next(slab) {
                EMPTY => break,
                next => slab = next as usize,
            }
        }

        match empty {
            Some((slab, lane)) => Scan::Empty(slab, lane),
            None => Scan::Full(slab),
        }
    }

    // Claim an unused slab from the pool.
    #[inline]
    fn allocate_slab(&self) -> Option<u32> {
        // Slabs are only returned between batches, so the popped entry is stable.
        if let Ok(top) = self
            .free_top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| top.checked_sub(1))
        {
            return Some(self.free_slabs[top - 1].load(Ordering::Relaxed));
        }

        self.next_slab
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.slabs.len()).then_some(next + 1)
            })
            .ok()
            .map(|slab| slab as u32)
    }

    // Insert a key if it is absent, calling `write` with its new slot before the slot
    // is published.
    #[inline]
    fn insert_with(&self, key: &[u8], write: impl FnOnce(u32)) -> (i32, bool) {
        loop {
            match self.scan(key) {
                Scan::Found(slot) => return (slot as i32, false),

                Scan::Empty(slab, lane) => {
                    let lane = &self.slabs[slab].lanes[lane];

                    // Lost the lane to a concurrent insert, which may be of the same key.
                    if lane
                        .compare_exchange(EMPTY, RESERVED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }

                    let Some(slot) = self.buffer.allocate() else {
                        lane.store(EMPTY, Ordering::SeqCst);
                        self.parker.unpark(lane);
                        return (NULL_INDEX, false);
                    };

                    // Safety: the slot was just allocated and is not yet published.
                    unsafe { self.buffer.write_key(slot, key) };
                    write(slot);

                    lane.store(slot, Ordering::SeqCst);
                    self.parker.unpark(lane);
                    return (slot as i32, true);
                }

                Scan::Full(tail) => {
                    let link = &self.slabs[tail].next;

                    // Someone else is extending the bucket, rescan.
                    if link
                        .compare_exchange(EMPTY, RESERVED, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }

                    let Some(next) = self.allocate_slab() else {
                        link.store(EMPTY, Ordering::SeqCst);
                        self.parker.unpark(link);
                        return (NULL_INDEX, false);
                    };

                    link.store(next, Ordering::SeqCst);
                    self.parker.unpark(link);
                }
            }
        }
    }

    #[inline]
    fn find_one(&self, key: &[u8]) -> Option<u32> {
        match self.scan(key) {
            Scan::Found(slot) => Some(slot),
            _ => None,
        }
    }

    #[inline]
    fn erase_one(&self, key: &[u8]) -> bool {
        let mut slab = bucket_index(key, self.bucket_count);

        loop {
            let lanes = &self.slabs[slab].lanes;

            for lane in lanes {
                let slot = lane.load(Ordering::Acquire);
                if slot >= RESERVED || self.buffer.key(slot) != key {
                    continue;
                }

                // A concurrent erase of the same key may win the lane.
                if lane
                    .compare_exchange(slot, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.buffer.free(slot);
                    return true;
                }

                return false;
            }

            match self.slabs[slab].next.load(Ordering::Acquire) {
                EMPTY => return false,
                next => slab = next as usize,
            }
        }
    }

    // Pack the slots of a bucket into the front of its list, returning the overflow
    // slabs that are left empty to the pool.
    fn compact(&mut self, bucket: usize) {
        let mut chain = vec![bucket];
        let mut next = self.slabs[bucket].next.load(Ordering::Relaxed);
        while next != EMPTY {
            chain.push(next as usize);
            next = self.slabs[next as usize].next.load(Ordering::Relaxed);
        }

        let slots = self.bucket_slots(bucket).collect::<Vec<_>>();
        let keep = slots.len().div_ceil(LANES).max(1);
        if keep == chain.len() {
            return;
        }

        for (i, &index) in chain.iter().enumerate() {
            let slab = &mut self.slabs[index];

            if i >= keep {
                slab.reset();

                let top = self.free_top.get_mut();
                *self.free_slabs[*top].get_mut() = index as u32;
                *top += 1;
                continue;
            }

            let packed = slots[i * LANES..].iter().copied().chain(std::iter::repeat(EMPTY));
            for (lane, slot) in slab.lanes.iter_mut().zip(packed) {
                *lane.get_mut() = slot;
            }

            *slab.next.get_mut() = match chain.get(i + 1) {
                Some(&next) if i + 1 < keep => next as u32,
                _ => EMPTY,
            };
        }
    }

    // Returns the number of overflow slabs in use.
    fn overflow_slabs(&self) -> usize {
        let claimed = self.next_slab.load(Ordering::Relaxed) - self.bucket_count;
        claimed - self.free_top.load(Ordering::Relaxed)
    }

    // Returns an iterator over the slabs of a bucket.
    fn bucket(&self, bucket: usize) -> impl Iterator<Item = &Slab> + '_ {
        let mut next = bucket as u32;

        std::iter::from_fn(move || {
            if next == EMPTY {
                return None;
            }

            let slab = &self.slabs[next as usize];
            next = slab.next.load(Ordering::Acquire);
            Some(slab)
        })
    }

    // Returns the occupied slots of a bucket, in list order.
    fn bucket_slots(&self, bucket: usize) -> impl Iterator<Item = u32> + '_ {
        self.bucket(bucket).flat_map(|slab| {
            slab.lanes
                .iter()
                .map(|lane| lane.load(Ordering::Acquire))
                .filter(|&slot| slot < RESERVED)
        })
    }
}

impl DeviceHashBackend for SlabBackend {
    fn insert(&mut self, keys: &[u8], values: &[&[u8]], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let value_sizes = self.buffer.value_sizes();
        let this = &*self;

        launch_warps(indices, masks, |first, indices, masks| {
            for (j, (index, mask)) in indices.iter_mut().zip(masks).enumerate() {
                let i = first + j;
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
            }
        });

        trace!(
            "inserted {} of {} keys, {} overflow slabs in use",
            masks.iter().filter(|&&m| m).count(),
            masks.len(),
            self.overflow_slabs()
        );
    }

    fn activate(&mut self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let this = &*self;

        launch_warps(indices, masks, |first, indices, masks| {
            for (j, (index, mask)) in indices.iter_mut().zip(masks).enumerate() {
                let i = first + j;
                let key = &keys[i * key_size..(i + 1) * key_size];

                // Safety: `insert_with` calls us before publishing the slot.
                (*index, *mask) =
                    this.insert_with(key, |slot| unsafe { this.buffer.zero_values(slot) });
            }
        });
    }

    fn find(&self, keys: &[u8], indices: &mut [i32], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();

        launch_warps(indices, masks, |first, indices, masks| {
            for (j, (index, mask)) in indices.iter_mut().zip(masks).enumerate() {
                let i = first + j;

                (*index, *mask) = match self.find_one(&keys[i * key_size..(i + 1) * key_size]) {
                    Some(slot) => (slot as i32, true),
                    None => (NULL_INDEX, false),
                };
            }
        });
    }

    fn erase(&mut self, keys: &[u8], masks: &mut [bool]) {
        let key_size = self.buffer.key_size();
        let this = &*self;

        launch_warps_masks(masks, |first, masks| {
            for (j, mask) in masks.iter_mut().enumerate() {
                let i = first + j;
                *mask = this.erase_one(&keys[i * key_size..(i + 1) * key_size]);
            }
        });

        let mut touched = masks
            .iter()
            .enumerate()
            .filter(|&(_, &erased)| erased)
            .map(|(i, _)| bucket_index(&keys[i * key_size..(i + 1) * key_size], self.bucket_count))
            .collect::<Vec<_>>();
        touched.sort_unstable();
        touched.dedup();

        for bucket in touched {
            self.compact(bucket);
        }

        trace!("{} overflow slabs in use after erase", self.overflow_slabs());
    }

    fn active_indices(&self) -> Vec<u32> {
        (0..self.bucket_count)
            .into_par_iter()
            .flat_map_iter(|bucket| self.bucket_slots(bucket))
            .collect()
    }

    fn rehash(&mut self, buckets: usize) -> Result<()> {
        let capacity = rehash_capacity(
            self.buffer.capacity(),
            self.bucket_count,
            buckets,
            self.buffer.len(),
        );

        let mut next = SlabBackend::with_buckets(
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
        self.slabs.par_iter_mut().for_each(Slab::reset);
        *self.next_slab.get_mut() = self.bucket_count;
        *self.free_top.get_mut() = 0;
        self.buffer.reset();
    }

    fn bucket_sizes(&self) -> Vec<usize> {
        (0..self.bucket_count)
            .into_par_iter()
            .map(|bucket| self.bucket_slots(bucket).count())
            .collect()
    }

    fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    fn buffer(&self) -> &SlotBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut SlotBuffer {
        &mut self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::raw::chained::ChainedBackend;

    fn keys(keys: &[u32]) -> Vec<u8> {
        keys.iter().flat_map(|k| k.to_le_bytes()).collect()
    }

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<Slab>(), 128);
        assert_eq!(std::mem::align_of::<Slab>(), 128);
    }

    #[test]
    fn overflow_slabs() {
        // One bucket, so every key lands in the same slab list.
        let mut backend = SlabBackend::with_buckets(100, 1, 4, &[4], Device::CPU).unwrap();
        assert_eq!(backend.bucket_count(), 1);
        assert_eq!(backend.capacity(), 100);

        let data = (0..100u32).collect::<Vec<_>>();
        let values = keys(&data);
        let mut indices = vec![0; 100];
        let mut masks = vec![false; 100];
        backend.insert(&keys(&data), &[&values], &mut indices, &mut masks);
        assert!(masks.iter().all(|&m| m));
        assert_eq!(backend.bucket_sizes(), [100]);
        assert_eq!(backend.bucket(0).count(), 4);

        let mut found = vec![0; 100];
        backend.find(&keys(&data), &mut found, &mut masks);
        assert!(masks.iter().all(|&m| m));
        assert_eq!(found, indices);

        for (&key, &slot) in data.iter().zip(&found) {
            assert_eq!(backend.buffer().value(0, slot as u32), key.to_le_bytes());
        }

        // Erased lanes and returned slabs are reused before the pool is touched.
        let mut masks = vec![false; 10];
        backend.erase(&keys(&data[..10]), &mut masks);
        assert!(masks.iter().all(|&m| m));

        let fresh = (1000..1010u32).collect::<Vec<_>>();
        let mut indices = vec![0; 10];
        backend.activate(&keys(&fresh), &mut indices, &mut masks);
        assert!(masks.iter().all(|&m| m));
        assert_eq!(backend.bucket(0).count(), 4);

        for &slot in &indices {
            assert_eq!(backend.buffer().value(0, slot as u32), [0; 4]);
        }
    }

    #[test]
    fn compaction() {
        let mut backend = SlabBackend::with_buckets(100, 1, 4, &[], Device::CPU).unwrap();

        let data = (0..100u32).collect::<Vec<_>>();
        let mut indices = vec![0; 100];
        let mut masks = vec![false; 100];
        backend.insert(&keys(&data), &[], &mut indices, &mut masks);
        assert_eq!(backend.bucket(0).count(), 4);
        let pool = backend.next_slab.load(Ordering::Relaxed);

        // Erase every other key, leaving 50 slots that fit in two slabs.
        let erased = data.iter().copied().step_by(2).collect::<Vec<_>>();
        let mut masks = vec![false; 50];
        backend.erase(&keys(&erased), &mut masks);
        assert!(masks.iter().all(|&m| m));
        assert_eq!(backend.bucket(0).count(), 2);
        assert_eq!(backend.overflow_slabs(), 1);
        assert_eq!(backend.bucket_sizes(), [50]);

        // Packing moves lanes but not slots.
        let kept = data.iter().copied().skip(1).step_by(2).collect::<Vec<_>>();
        let mut found = vec![0; 50];
        backend.find(&keys(&kept), &mut found, &mut masks);
        assert!(masks.iter().all(|&m| m));
        let expected = indices.iter().copied().skip(1).step_by(2).collect::<Vec<_>>();
        assert_eq!(found, expected);

        let fresh = (1000..1050u32).collect::<Vec<_>>();
        let mut indices = vec![0; 50];
        backend.insert(&keys(&fresh), &[], &mut indices, &mut masks);
        assert!(masks.iter().all(|&m| m));
        assert_eq!(backend.bucket(0).count(), 4);
        assert_eq!(backend.next_slab.load(Ordering::Relaxed), pool);
    }

    #[test]
    fn skewed_churn() {
        let mut slab = SlabBackend::new(124, 4, &[], Device::CPU).unwrap();
        let mut chained = ChainedBackend::new(124, 4, &[], Device::CPU).unwrap();
        let buckets = slab.bucket_count();

        // Every round fills a different slab bucket far past its head slab, then
        // empties the map again.
        for round in 0..3 * buckets {
            let bucket = round % buckets;
            let data = (0u32..)
                .filter(|key| bucket_index(&key.to_le_bytes(), buckets) == bucket)
                .take(100)
                .collect::<Vec<_>>();

            let backends: [&mut dyn DeviceHashBackend; 2] = [&mut slab, &mut chained];
            for backend in backends {
                let mut indices = vec![0; 100];
                let mut masks = vec![false; 100];
                backend.insert(&keys(&data), &[], &mut indices, &mut masks);
                assert!(masks.iter().all(|&m| m), "round {}", round);

                backend.erase(&keys(&data), &mut masks);
                assert!(masks.iter().all(|&m| m), "round {}", round);
                assert_eq!(backend.len(), 0);
            }

            assert_eq!(slab.overflow_slabs(), 0);
        }

        assert!((0..buckets).all(|bucket| slab.bucket(bucket).count() == 1));
    }

    #[test]
    fn pool_exhaustion() {
        let mut backend = SlabBackend::new(4, 4, &[], Device::CPU).unwrap();

        let mut indices = vec![0; 5];
        let mut masks = vec![false; 5];
        backend.insert(&keys(&[1, 2, 3, 4, 5]), &[], &mut indices, &mut masks);
        assert_eq!(masks.iter().filter(|&&m| m).count(), 4);
        assert_eq!(indices.iter().filter(|&&i| i == NULL_INDEX).count(), 1);
        assert_eq!(backend.len(), 4);

        backend.clear();
        assert_eq!(backend.len(), 0);
        assert_eq!(backend.bucket_sizes(), [0]);
    }
}
