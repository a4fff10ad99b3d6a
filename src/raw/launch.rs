// A host-side kernel launcher.
//
// Batches are fanned out over the rayon pool. Per-key kernels receive the
// key index and its output cells, warp kernels receive up to `WARP_SIZE`
// consecutive keys and process them cooperatively.

use rayon::prelude::*;

// The number of keys processed by one warp.
pub const WARP_SIZE: usize = 32;

// Run `kernel(i, &mut indices[i], &mut masks[i])` for every key.
#[inline]
pub fn launch<F>(indices: &mut [i32], masks: &mut [bool], kernel: F)
where
    F: Fn(usize, &mut i32, &mut bool) + Send + Sync,
{
    debug_assert_eq!(indices.len(), masks.len());

    indices
        .par_iter_mut()
        .zip(masks.par_iter_mut())
        .enumerate()
        .for_each(|(i, (index, mask))| kernel(i, index, mask));
}

// Run `kernel(i, &mut masks[i])` for every key.
#[inline]
pub fn launch_masks<F>(masks: &mut [bool], kernel: F)
where
    F: Fn(usize, &mut bool) + Send + Sync,
{
    masks
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, mask)| kernel(i, mask));
}

// Run `kernel(first, indices, masks)` for every warp, where `first` is the index of
// the first key in the warp.
#[inline]
pub fn launch_warps<F>(indices: &mut [i32], masks: &mut [bool], kernel: F)
where
    F: Fn(usize, &mut [i32], &mut [bool]) + Send + Sync,
{
    debug_assert_eq!(indices.len(), masks.len());

    indices
        .par_chunks_mut(WARP_SIZE)
        .zip(masks.par_chunks_mut(WARP_SIZE))
        .enumerate()
        .for_each(|(warp, (indices, masks))| kernel(warp * WARP_SIZE, indices, masks));
}

// Run `kernel(first, masks)` for every warp.
#[inline]
pub fn launch_warps_masks<F>(masks: &mut [bool], kernel: F)
where
    F: Fn(usize, &mut [bool]) + Send + Sync,
{
    masks
        .par_chunks_mut(WARP_SIZE)
        .enumerate()
        .for_each(|(warp, masks)| kernel(warp * WARP_SIZE, masks));
}

// Returns a bitmask of the lanes whose value satisfies `pred`, lane `i` being bit `i`.
#[inline]
pub fn ballot(lanes: &[u32], pred: impl Fn(u32) -> bool) -> u32 {
    debug_assert!(lanes.len() <= WARP_SIZE);

    lanes
        .iter()
        .enumerate()
        .fold(0, |mask, (i, &value)| if pred(value) { mask | (1 << i) } else { mask })
}
