use std::fmt;
use std::path::Path;

use crate::map::{GrowthMode, DEFAULT_CAPACITY};
use crate::raw::HashBackend;
use crate::tensor::{BufferView, Dtype, Tensor};
use crate::{Device, Error, HashMap, Result};

/// A parallel hash set of fixed-size key records.
///
/// A hash set is a [`HashMap`] without value channels, used for membership tests and
/// deduplication. Slot indices address rows of [`HashSet::key_buffer`].
///
/// # Examples
///
/// ```
/// use slabhash::{Device, Dtype, HashBackend, HashSet, Tensor};
///
/// let mut set = HashSet::new(8, Dtype::Int32, &[2], Device::CPU, HashBackend::Default).unwrap();
///
/// let keys = Tensor::from_slice(&[1, 1, 2, 2, 1, 1], &[3, 2], Device::CPU).unwrap();
/// let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
/// set.insert(&keys, &mut indices, &mut masks).unwrap();
///
/// assert_eq!(set.len(), 2);
/// assert_eq!(masks.as_slice::<bool>().unwrap().iter().filter(|&&m| m).count(), 2);
/// ```
pub struct HashSet {
    map: HashMap,
}

/// A builder for a [`HashSet`].
///
/// # Examples
///
/// ```rust
/// use slabhash::{Device, Dtype, GrowthMode, HashBackend, HashSet};
///
/// let set = HashSet::builder()
///     // Set the initial capacity.
///     .capacity(2048)
///     // Set the key layout.
///     .key(Dtype::Int64, &[2])
///     // Set the backend.
///     .backend(HashBackend::Slab)
///     // Set the growth mode.
///     .growth(GrowthMode::Doubling)
///     // Construct the hash set.
///     .build()
///     .unwrap();
///
/// assert!(set.is_empty());
/// ```
#[derive(Clone, Debug)]
pub struct HashSetBuilder {
    capacity: i64,
    key_dtype: Dtype,
    key_element_shape: Vec<usize>,
    device: Device,
    backend: HashBackend,
    growth: GrowthMode,
}

impl Default for HashSetBuilder {
    fn default() -> HashSetBuilder {
        HashSetBuilder {
            capacity: DEFAULT_CAPACITY,
            key_dtype: Dtype::Undefined,
            key_element_shape: Vec::new(),
            device: Device::CPU,
            backend: HashBackend::Default,
            growth: GrowthMode::Fixed,
        }
    }
}

impl HashSetBuilder {
    /// Set the initial capacity of the set.
    pub fn capacity(self, capacity: i64) -> HashSetBuilder {
        HashSetBuilder { capacity, ..self }
    }

    /// Set the key dtype and element shape.
    pub fn key(self, dtype: Dtype, element_shape: &[usize]) -> HashSetBuilder {
        HashSetBuilder {
            key_dtype: dtype,
            key_element_shape: element_shape.to_vec(),
            ..self
        }
    }

    /// Set the device of the set.
    pub fn device(self, device: Device) -> HashSetBuilder {
        HashSetBuilder { device, ..self }
    }

    /// Set the backend of the set. See [`HashBackend`] for details.
    pub fn backend(self, backend: HashBackend) -> HashSetBuilder {
        HashSetBuilder { backend, ..self }
    }

    /// Set the growth mode of the set. See [`GrowthMode`] for details.
    pub fn growth(self, growth: GrowthMode) -> HashSetBuilder {
        HashSetBuilder { growth, ..self }
    }

    /// Construct a [`HashSet`] from the builder, using the configured options.
    pub fn build(self) -> Result<HashSet> {
        let map = HashMap::builder()
            .capacity(self.capacity)
            .key(self.key_dtype, &self.key_element_shape)
            .device(self.device)
            .backend(self.backend)
            .growth(self.growth)
            .build()?;

        Ok(HashSet { map })
    }
}

impl HashSet {
    /// Creates a hash set with the given key layout.
    pub fn new(
        capacity: i64,
        key_dtype: Dtype,
        key_element_shape: &[usize],
        device: Device,
        backend: HashBackend,
    ) -> Result<HashSet> {
        HashSet::builder()
            .capacity(capacity)
            .key(key_dtype, key_element_shape)
            .device(device)
            .backend(backend)
            .build()
    }

    /// Creates a hash set from a hash map layout.
    ///
    /// A set holds no values, so this fails with [`Error::Config`] if any value dtype or
    /// shape is given.
    ///
    /// ```
    /// use slabhash::{Device, Dtype, Error, HashBackend, HashSet};
    ///
    /// let set = HashSet::with_values(
    ///     8,
    ///     Dtype::Int32,
    ///     &[3],
    ///     &[Dtype::Float32],
    ///     &[vec![1]],
    ///     Device::CPU,
    ///     HashBackend::Default,
    /// );
    ///
    /// assert!(matches!(set, Err(Error::Config(_))));
    /// ```
    pub fn with_values(
        capacity: i64,
        key_dtype: Dtype,
        key_element_shape: &[usize],
        value_dtypes: &[Dtype],
        value_element_shapes: &[Vec<usize>],
        device: Device,
        backend: HashBackend,
    ) -> Result<HashSet> {
        if !value_dtypes.is_empty() || !value_element_shapes.is_empty() {
            return Err(Error::Config(format!(
                "a hash set does not accept values, got {} value dtypes",
                value_dtypes.len()
            )));
        }

        HashSet::new(capacity, key_dtype, key_element_shape, device, backend)
    }

    /// Returns a builder for a `HashSet`.
    pub fn builder() -> HashSetBuilder {
        HashSetBuilder::default()
    }

    /// Inserts keys that are not already present.
    ///
    /// See [`HashMap::insert`] for the meaning of the outputs.
    pub fn insert(
        &mut self,
        keys: &Tensor,
        out_indices: &mut Tensor,
        out_masks: &mut Tensor,
    ) -> Result<()> {
        self.map.insert(keys, &[], out_indices, out_masks)
    }

    /// Inserts keys that are not already present. Equivalent to [`HashSet::insert`].
    pub fn activate(
        &mut self,
        keys: &Tensor,
        out_indices: &mut Tensor,
        out_masks: &mut Tensor,
    ) -> Result<()> {
        self.map.activate(keys, out_indices, out_masks)
    }

    /// Looks up keys. See [`HashMap::find`].
    pub fn find(&self, keys: &Tensor, out_indices: &mut Tensor, out_masks: &mut Tensor) -> Result<()> {
        self.map.find(keys, out_indices, out_masks)
    }

    /// Removes keys. See [`HashMap::erase`].
    pub fn erase(&mut self, keys: &Tensor, out_masks: &mut Tensor) -> Result<()> {
        self.map.erase(keys, out_masks)
    }

    /// Writes the slots of every key into `out_indices`, returning the number of keys.
    pub fn active_indices(&self, out_indices: &mut Tensor) -> Result<usize> {
        self.map.active_indices(out_indices)
    }

    /// Returns the slots of every key.
    pub fn active_indices_vec(&self) -> Vec<u32> {
        self.map.active_indices_vec()
    }

    /// Returns a dense copy of every key.
    pub fn active_keys(&self) -> Tensor {
        self.map.active_entries().0
    }

    /// Removes every key.
    pub fn clear(&mut self) {
        self.map.clear()
    }

    /// Rebuilds the set with `buckets` buckets. See [`HashMap::rehash`].
    pub fn rehash(&mut self, buckets: usize) -> Result<()> {
        self.map.rehash(buckets)
    }

    /// Grows the set so that it can hold at least `capacity` keys.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        self.map.reserve(capacity)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    pub fn bucket_count(&self) -> usize {
        self.map.bucket_count()
    }

    pub fn load_factor(&self) -> f32 {
        self.map.load_factor()
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.map.bucket_sizes()
    }

    pub fn device(&self) -> Device {
        self.map.device()
    }

    pub fn backend(&self) -> HashBackend {
        self.map.backend()
    }

    pub fn key_dtype(&self) -> Dtype {
        self.map.key_dtype()
    }

    pub fn key_element_shape(&self) -> &[usize] {
        self.map.key_element_shape()
    }

    pub fn growth_mode(&self) -> GrowthMode {
        self.map.growth_mode()
    }

    /// Returns a view of the key buffer, shaped `[capacity, *key_element_shape]`.
    pub fn key_buffer(&self) -> BufferView<'_> {
        self.map.key_buffer()
    }

    /// Returns an equivalent set on `device`. See [`HashMap::to`].
    pub fn to(&self, device: Device) -> Result<HashSet> {
        Ok(HashSet {
            map: self.map.to(device)?,
        })
    }

    /// Returns a copy of the set on the same device.
    pub fn try_clone(&self) -> Result<HashSet> {
        self.to(self.device())
    }

    /// Writes every key and the layout of the set to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.map.save(path)
    }

    /// Reads a set written by [`HashSet::save`], placing it on `device`.
    ///
    /// Fails with [`Error::Format`] if the file holds a map with values.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<HashSet> {
        let map = HashMap::load(path, device)?;

        if !map.value_dtypes().is_empty() {
            return Err(Error::Format(format!(
                "expected a hash set, found a map with {} value channels",
                map.value_dtypes().len()
            )));
        }

        Ok(HashSet { map })
    }

    /// Returns the underlying map.
    pub fn as_map(&self) -> &HashMap {
        &self.map
    }
}

impl fmt::Debug for HashSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSet")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("backend", &self.backend())
            .field("device", &self.device())
            .field("key_dtype", &self.key_dtype())
            .field("key_element_shape", &self.key_element_shape())
            .finish()
    }
}
