//! Point-cloud utilities built on voxel hashing.

use crate::tensor::{Dtype, Tensor};
use crate::{Device, Error, HashMap, HashSet, Result};

fn check_voxel_size(voxel_size: f32) -> Result<()> {
    if !(voxel_size > 0.0) {
        return Err(Error::InvalidArgument(format!(
            "voxel size must be positive, got {}",
            voxel_size
        )));
    }

    Ok(())
}

/// Returns the voxel coordinate of every point as an `Int32[n, 3]` tensor.
pub fn voxel_keys(points: &[[f32; 3]], voxel_size: f32) -> Result<Tensor> {
    check_voxel_size(voxel_size)?;

    let keys = points
        .iter()
        .flat_map(|point| point.map(|x| (x / voxel_size).floor() as i32))
        .collect::<Vec<_>>();

    Tensor::from_slice(&keys, &[points.len(), 3], Device::CPU)
}

/// Returns the index of one representative point per occupied voxel, in ascending
/// order.
///
/// # Examples
///
/// ```
/// use slabhash::points;
///
/// let points = [[0.1, 0.1, 0.1], [0.2, 0.2, 0.2], [1.5, 0.0, 0.0]];
/// let kept = points::voxel_down_sample(&points, 1.0).unwrap();
/// assert_eq!(kept.len(), 2);
/// assert_eq!(kept[1], 2);
/// ```
pub fn voxel_down_sample(points: &[[f32; 3]], voxel_size: f32) -> Result<Vec<usize>> {
    let keys = voxel_keys(points, voxel_size)?;
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let mut voxels = HashSet::builder()
        .capacity(points.len() as i64)
        .key(Dtype::Int32, &[3])
        .build()?;

    let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
    voxels.insert(&keys, &mut indices, &mut masks)?;

    Ok(masks
        .as_slice::<bool>()?
        .iter()
        .enumerate()
        .filter_map(|(i, &inserted)| inserted.then_some(i))
        .collect())
}

/// Returns `(i, j)` for every source point `i` that falls into the voxel of target
/// point `j`.
///
/// When several target points share a voxel, one of them represents the voxel.
pub fn voxel_correspondences(
    source: &[[f32; 3]],
    target: &[[f32; 3]],
    voxel_size: f32,
) -> Result<Vec<(usize, usize)>> {
    check_voxel_size(voxel_size)?;
    if source.is_empty() || target.is_empty() {
        return Ok(Vec::new());
    }

    let mut voxels = HashMap::builder()
        .capacity(target.len() as i64)
        .key(Dtype::Int32, &[3])
        .value(Dtype::Int64, &[])
        .build()?;

    let target_indices = (0..target.len() as i64).collect::<Vec<_>>();
    let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
    voxels.insert(
        &voxel_keys(target, voxel_size)?,
        &[Tensor::from_slice(&target_indices, &[target.len()], Device::CPU)?],
        &mut indices,
        &mut masks,
    )?;

    voxels.find(&voxel_keys(source, voxel_size)?, &mut indices, &mut masks)?;

    let representatives = voxels.value_buffer(0)?;
    let representatives = representatives.as_slice::<i64>()?;

    Ok(indices
        .as_slice::<i32>()?
        .iter()
        .zip(masks.as_slice::<bool>()?)
        .enumerate()
        .filter(|(_, (_, found))| **found)
        .map(|(i, (&slot, _))| (i, representatives[slot as usize] as usize))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        let keys = voxel_keys(&[[0.5, -0.5, 2.0], [-2.1, 0.0, 0.99]], 1.0).unwrap();
        assert_eq!(keys.shape(), &[2, 3]);
        assert_eq!(keys.to_vec::<i32>().unwrap(), vec![0, -1, 2, -3, 0, 0]);
        assert!(voxel_keys(&[], 0.0).is_err());
    }

    #[test]
    fn correspondences() {
        let target = [[0.5, 0.5, 0.5], [3.5, 0.5, 0.5]];
        let source = [[3.1, 0.9, 0.2], [9.0, 9.0, 9.0], [0.0, 0.0, 0.0]];

        let pairs = voxel_correspondences(&source, &target, 1.0).unwrap();
        assert_eq!(pairs, vec![(0, 1), (2, 0)]);
    }
}
