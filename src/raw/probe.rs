// 64-bit FNV-1a parameters.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

// Hash a key record.
//
// Every backend hashes with this function, so bucket assignment only depends
// on the key bytes and the bucket count.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    key.iter().fold(FNV_OFFSET, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

// Returns the bucket a key belongs to.
#[inline]
pub fn bucket_index(key: &[u8], bucket_count: usize) -> usize {
    debug_assert!(bucket_count > 0);
    (hash_key(key) % bucket_count as u64) as usize
}

// Returns the initial number of buckets for a backend holding `capacity`
// records at `records_per_bucket` records per bucket.
#[inline]
pub fn buckets_for(capacity: usize, records_per_bucket: usize) -> usize {
    (capacity / records_per_bucket).max(1)
}
