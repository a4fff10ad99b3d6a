//! Sparse voxel block grids.
//!
//! A [`VoxelBlockGrid`] splits space into cubic blocks of `r × r × r` voxels and
//! stores only the blocks that have been activated. Blocks are keyed by their integer
//! block coordinate in a [`HashMap`], and every voxel attribute is one value channel of
//! shape `[r, r, r, *channels]`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::io::{self, Container};
use crate::raw::utils::debug;
use crate::raw::HashBackend;
use crate::tensor::{BufferView, BufferViewMut, Dtype, Tensor};
use crate::{Device, Error, GrowthMode, HashMap, HashSet, Result};

// The truncation distance of a surface, in voxels.
const TRUNCATION_VOXELS: f32 = 6.0;

/// A sparse grid of voxel blocks, indexed by a hash map.
///
/// # Examples
///
/// ```
/// use slabhash::grid::VoxelBlockGrid;
/// use slabhash::{Device, Dtype, HashBackend, Tensor};
///
/// let mut grid = VoxelBlockGrid::new(
///     &["tsdf", "weight"],
///     &[Dtype::Float32, Dtype::UInt16],
///     &[vec![1], vec![1]],
///     0.01,
///     8,
///     100,
///     Device::CPU,
///     HashBackend::Default,
/// )
/// .unwrap();
///
/// let blocks = grid.touch(&[[0.0, 0.0, 0.0]]).unwrap();
/// let indices = grid.activate(&blocks).unwrap();
/// assert_eq!(indices.len(), blocks.len());
/// assert_eq!(grid.attribute("tsdf").unwrap().shape(), &[100, 8, 8, 8, 1]);
/// ```
pub struct VoxelBlockGrid {
    map: HashMap,
    attr_names: Vec<String>,
    voxel_size: f32,
    block_resolution: usize,
}

// Returns the block coordinate stored in a slot.
fn block_key(keys: &[i32], slot: usize) -> Option<&[i32]> {
    keys.get(slot.checked_mul(3)?..)?.get(..3)
}

fn slot_out_of_range(slot: impl std::fmt::Display) -> Error {
    Error::InvalidArgument(format!("slot {} is out of range", slot))
}

// The serialized form of a grid.
#[derive(Serialize, Deserialize)]
struct GridContainer {
    attr_names: Vec<String>,
    voxel_size: f32,
    block_resolution: usize,
    map: Container,
}

impl VoxelBlockGrid {
    /// Creates an empty grid with room for `block_count` blocks.
    ///
    /// Attribute `i` is named `attr_names[i]` and stores `attr_channels[i]` elements of
    /// `attr_dtypes[i]` per voxel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attr_names: &[&str],
        attr_dtypes: &[Dtype],
        attr_channels: &[Vec<usize>],
        voxel_size: f32,
        block_resolution: usize,
        block_count: i64,
        device: Device,
        backend: HashBackend,
    ) -> Result<VoxelBlockGrid> {
        if attr_dtypes.len() != attr_names.len() {
            return Err(Error::Config(format!(
                "got {} attribute dtypes for {} attribute names",
                attr_dtypes.len(),
                attr_names.len()
            )));
        }

        if attr_channels.len() != attr_names.len() {
            return Err(Error::Config(format!(
                "got {} attribute channels for {} attribute names",
                attr_channels.len(),
                attr_names.len()
            )));
        }

        if !(voxel_size > 0.0) || block_resolution == 0 {
            return Err(Error::Config(format!(
                "voxel size ({}) and block resolution ({}) must be positive",
                voxel_size, block_resolution
            )));
        }

        let r = block_resolution;
        let shapes = attr_channels
            .iter()
            .map(|channels| [&[r, r, r][..], channels.as_slice()].concat())
            .collect::<Vec<_>>();

        let map = HashMap::new(block_count, Dtype::Int32, &[3], attr_dtypes, &shapes, device, backend)?;

        Ok(VoxelBlockGrid {
            map,
            attr_names: attr_names.iter().map(|name| name.to_string()).collect(),
            voxel_size,
            block_resolution,
        })
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn block_resolution(&self) -> usize {
        self.block_resolution
    }

    pub fn attr_names(&self) -> &[String] {
        &self.attr_names
    }

    /// Returns the hash map from block coordinates to blocks.
    pub fn hashmap(&self) -> &HashMap {
        &self.map
    }

    /// Returns the hash map from block coordinates to blocks, mutably.
    pub fn hashmap_mut(&mut self) -> &mut HashMap {
        &mut self.map
    }

    fn channel(&self, name: &str) -> Result<usize> {
        self.attr_names
            .iter()
            .position(|attr| attr == name)
            .ok_or_else(|| Error::InvalidArgument(format!("no attribute named {:?}", name)))
    }

    /// Returns the buffer of an attribute, shaped `[block_count, r, r, r, *channels]`.
    pub fn attribute(&self, name: &str) -> Result<BufferView<'_>> {
        self.map.value_buffer(self.channel(name)?)
    }

    /// Returns the buffer of an attribute, mutably.
    pub fn attribute_mut(&mut self, name: &str) -> Result<BufferViewMut<'_>> {
        let channel = self.channel(name)?;
        self.map.value_buffer_mut(channel)
    }

    /// Activates blocks, returning the slot of every block in `block_coords`.
    ///
    /// Newly activated blocks are zeroed. Blocks that could not be activated report
    /// [`NULL_INDEX`](crate::NULL_INDEX).
    pub fn activate(&mut self, block_coords: &Tensor) -> Result<Tensor> {
        let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
        self.map.activate(block_coords, &mut indices, &mut masks)?;
        self.map.find(block_coords, &mut indices, &mut masks)?;
        Ok(indices)
    }

    /// Returns the coordinates of every block within the truncation distance of a
    /// point, without duplicates, as an `Int32[m, 3]` tensor.
    pub fn touch(&self, points: &[[f32; 3]]) -> Result<Tensor> {
        let device = self.map.device();
        let block_size = self.voxel_size * self.block_resolution as f32;
        let trunc = TRUNCATION_VOXELS * self.voxel_size;

        let mut coords = Vec::new();
        for point in points {
            let lo = point.map(|x| ((x - trunc) / block_size).floor() as i32);
            let hi = point.map(|x| ((x + trunc) / block_size).floor() as i32);

            for z in lo[2]..=hi[2] {
                for y in lo[1]..=hi[1] {
                    for x in lo[0]..=hi[0] {
                        coords.extend_from_slice(&[x, y, z]);
                    }
                }
            }
        }

        let n = coords.len() / 3;
        if n == 0 {
            return Ok(Tensor::zeros(&[0, 3], Dtype::Int32, device));
        }

        let mut touched = HashSet::builder()
            .capacity(n as i64)
            .key(Dtype::Int32, &[3])
            .device(device)
            .backend(self.map.backend())
            .growth(GrowthMode::Fixed)
            .build()?;

        let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
        touched.insert(
            &Tensor::from_slice(&coords, &[n, 3], device)?,
            &mut indices,
            &mut masks,
        )?;

        Ok(touched.active_keys())
    }

    /// Returns `[slot, x, y, z]` for every voxel of every active block.
    ///
    /// Voxels are listed block by block, with `x` varying fastest.
    pub fn voxel_indices(&self) -> Vec<[i64; 4]> {
        let r = self.block_resolution as i64;

        self.map
            .active_indices_vec()
            .into_iter()
            .flat_map(|slot| {
                (0..r * r * r).map(move |linear| {
                    let z = linear / (r * r);
                    let y = (linear % (r * r)) / r;
                    let x = linear % r;
                    [slot as i64, x, y, z]
                })
            })
            .collect()
    }

    /// Returns the global voxel coordinate of every voxel index, as returned by
    /// [`VoxelBlockGrid::voxel_indices`].
    pub fn voxel_coordinates(&self, voxel_indices: &[[i64; 4]]) -> Result<Vec<[i64; 3]>> {
        let keys = self.map.key_buffer();
        let keys = keys.as_slice::<i32>()?;
        let r = self.block_resolution as i64;

        voxel_indices
            .iter()
            .map(|&[slot, x, y, z]| {
                let key = usize::try_from(slot)
                    .ok()
                    .and_then(|slot| block_key(keys, slot))
                    .ok_or_else(|| slot_out_of_range(slot))?;

                Ok([
                    key[0] as i64 * r + x,
                    key[1] as i64 * r + y,
                    key[2] as i64 * r + z,
                ])
            })
            .collect()
    }

    /// Looks up the 27 blocks around every active block, including the block itself.
    ///
    /// Returns slots and masks laid out as `[27, n]`, where neighbour `nb` is offset by
    /// `(nb % 3 - 1, (nb % 9) / 3 - 1, nb / 9 - 1)` blocks.
    pub fn buffer_radius_neighbors(&self, active: &[u32]) -> Result<(Vec<i32>, Vec<bool>)> {
        let n = active.len();
        if n == 0 {
            return Ok((Vec::new(), Vec::new()));
        }

        let keys = self.map.key_buffer();
        let keys = keys.as_slice::<i32>()?;

        let active = active
            .iter()
            .map(|&slot| block_key(keys, slot as usize).ok_or_else(|| slot_out_of_range(slot)))
            .collect::<Result<Vec<_>>>()?;

        let mut neighbors = Vec::with_capacity(27 * n * 3);
        for nb in 0..27 {
            let offset = [nb % 3 - 1, (nb % 9) / 3 - 1, nb / 9 - 1];

            for key in &active {
                neighbors.extend((0..3).map(|i| key[i] + offset[i]));
            }
        }

        let device = self.map.device();
        let neighbors = Tensor::from_slice(&neighbors, &[27 * n, 3], device)?;

        let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
        self.map.find(&neighbors, &mut indices, &mut masks)?;

        Ok((indices.to_vec()?, masks.to_vec()?))
    }

    /// Writes the grid to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        io::write_json(
            path,
            &GridContainer {
                attr_names: self.attr_names.clone(),
                voxel_size: self.voxel_size,
                block_resolution: self.block_resolution,
                map: Container::from_map(&self.map),
            },
        )?;

        debug!("saved {} voxel blocks to {}", self.map.len(), path.display());
        Ok(())
    }

    /// Reads a grid written by [`VoxelBlockGrid::save`], placing it on `device`.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<VoxelBlockGrid> {
        let container = io::read_json::<GridContainer>(path.as_ref())?;
        let map = container.map.into_map(device)?;

        if map.value_dtypes().len() != container.attr_names.len() {
            return Err(Error::Format(format!(
                "grid declares {} attributes but holds {}",
                container.attr_names.len(),
                map.value_dtypes().len()
            )));
        }

        Ok(VoxelBlockGrid {
            map,
            attr_names: container.attr_names,
            voxel_size: container.voxel_size,
            block_resolution: container.block_resolution,
        })
    }
}
