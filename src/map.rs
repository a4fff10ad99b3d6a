use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::raw::utils::debug;
use crate::raw::{self, DeviceHashBackend, HashBackend, NULL_INDEX};
use crate::tensor::{checked_byte_size, num_elements, BufferView, BufferViewMut, Dtype, Tensor};
use crate::{io, Device, Error, Result};

/// The default capacity of a map created by a builder.
pub const DEFAULT_CAPACITY: i64 = 1024;

/// Whether a map grows when a batch does not fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrowthMode {
    /// The capacity only changes through explicit calls to [`HashMap::rehash`] or
    /// [`HashMap::reserve`].
    ///
    /// Keys that do not fit are reported through the output mask, and the caller
    /// decides whether to rehash and retry. This is the default.
    #[default]
    Fixed,
    /// The bucket count, and with it the capacity, is doubled until a batch fits.
    ///
    /// Slot indices returned before a batch that grew the map are invalidated by
    /// the batch.
    Doubling,
}

/// A parallel hash map from fixed-size key records to zero or more value records.
///
/// Keys and values are passed in batches as [`Tensor`]s of shape
/// `[n, *element_shape]`. Every batch operation reports a slot index and a success
/// mask per key; slot indices address rows of the key and value buffers, see
/// [`HashMap::key_buffer`] and [`HashMap::value_buffer`].
///
/// Inserting a key that is already present does not overwrite its values.
///
/// # Examples
///
/// ```
/// use slabhash::{Device, Dtype, HashMap, Tensor};
///
/// let mut map = HashMap::builder()
///     .capacity(16)
///     .key(Dtype::Int32, &[3])
///     .value(Dtype::Float32, &[1])
///     .build()
///     .unwrap();
///
/// let keys = Tensor::from_slice(&[0, 0, 0, 1, 2, 3], &[2, 3], Device::CPU).unwrap();
/// let values = Tensor::from_slice(&[0.5f32, 1.5], &[2, 1], Device::CPU).unwrap();
///
/// let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
/// map.insert(&keys, &[values], &mut indices, &mut masks).unwrap();
/// assert_eq!(masks.as_slice::<bool>().unwrap(), &[true, true]);
///
/// map.find(&keys, &mut indices, &mut masks).unwrap();
/// let slot = indices.as_slice::<i32>().unwrap()[1];
/// let values = map.value_buffer(0).unwrap();
/// assert_eq!(values.as_slice::<f32>().unwrap()[slot as usize], 1.5);
/// ```
pub struct HashMap {
    backend: Box<dyn DeviceHashBackend>,
    kind: HashBackend,
    key_dtype: Dtype,
    key_element_shape: Vec<usize>,
    value_dtypes: Vec<Dtype>,
    value_element_shapes: Vec<Vec<usize>>,
    growth: GrowthMode,
}

/// A builder for a [`HashMap`].
///
/// # Examples
///
/// ```rust
/// use slabhash::{Device, Dtype, GrowthMode, HashBackend, HashMap};
///
/// let map = HashMap::builder()
///     // Set the initial capacity.
///     .capacity(2048)
///     // Set the key layout, three integers.
///     .key(Dtype::Int32, &[3])
///     // Add a value channel.
///     .value(Dtype::Float32, &[8, 8, 8])
///     // Set the device.
///     .device(Device::CPU)
///     // Set the backend.
///     .backend(HashBackend::Slab)
///     // Set the growth mode.
///     .growth(GrowthMode::Doubling)
///     // Construct the hash map.
///     .build()
///     .unwrap();
///
/// assert_eq!(map.capacity(), 2048);
/// ```
#[derive(Clone, Debug)]
pub struct HashMapBuilder {
    capacity: i64,
    key_dtype: Dtype,
    key_element_shape: Vec<usize>,
    value_dtypes: Vec<Dtype>,
    value_element_shapes: Vec<Vec<usize>>,
    device: Device,
    backend: HashBackend,
    growth: GrowthMode,
}

impl Default for HashMapBuilder {
    fn default() -> HashMapBuilder {
        HashMapBuilder {
            capacity: DEFAULT_CAPACITY,
            key_dtype: Dtype::Undefined,
            key_element_shape: Vec::new(),
            value_dtypes: Vec::new(),
            value_element_shapes: Vec::new(),
            device: Device::CPU,
            backend: HashBackend::Default,
            growth: GrowthMode::Fixed,
        }
    }
}

impl HashMapBuilder {
    /// Set the initial capacity of the map, the number of slots available before a
    /// rehash.
    pub fn capacity(self, capacity: i64) -> HashMapBuilder {
        HashMapBuilder { capacity, ..self }
    }

    /// Set the key dtype and element shape.
    ///
    /// The key dtype must be set before building the map.
    pub fn key(self, dtype: Dtype, element_shape: &[usize]) -> HashMapBuilder {
        HashMapBuilder {
            key_dtype: dtype,
            key_element_shape: element_shape.to_vec(),
            ..self
        }
    }

    /// Add a value channel.
    pub fn value(mut self, dtype: Dtype, element_shape: &[usize]) -> HashMapBuilder {
        self.value_dtypes.push(dtype);
        self.value_element_shapes.push(element_shape.to_vec());
        self
    }

    /// Replace the value channels with parallel lists of dtypes and element shapes.
    pub fn values(self, dtypes: &[Dtype], element_shapes: &[Vec<usize>]) -> HashMapBuilder {
        HashMapBuilder {
            value_dtypes: dtypes.to_vec(),
            value_element_shapes: element_shapes.to_vec(),
            ..self
        }
    }

    /// Set the device of the map. Defaults to [`Device::CPU`].
    pub fn device(self, device: Device) -> HashMapBuilder {
        HashMapBuilder { device, ..self }
    }

    /// Set the backend of the map. See [`HashBackend`] for details.
    pub fn backend(self, backend: HashBackend) -> HashMapBuilder {
        HashMapBuilder { backend, ..self }
    }

    /// Set the growth mode of the map. See [`GrowthMode`] for details.
    pub fn growth(self, growth: GrowthMode) -> HashMapBuilder {
        HashMapBuilder { growth, ..self }
    }

    /// Construct a [`HashMap`] from the builder, using the configured options.
    ///
    /// Fails with [`Error::Config`] if the layout is invalid.
    pub fn build(self) -> Result<HashMap> {
        let capacity = check_capacity(self.capacity)?;
        check_layout(&self.key_dtype, &self.key_element_shape, "key")?;

        if self.value_dtypes.len() != self.value_element_shapes.len() {
            return Err(Error::Config(format!(
                "got {} value dtypes but {} value element shapes",
                self.value_dtypes.len(),
                self.value_element_shapes.len()
            )));
        }

        for (i, (dtype, shape)) in self
            .value_dtypes
            .iter()
            .zip(&self.value_element_shapes)
            .enumerate()
        {
            check_layout(dtype, shape, &format!("value channel {}", i))?;
        }

        let key_size = element_byte_size(self.key_dtype, &self.key_element_shape);
        let value_sizes = self
            .value_dtypes
            .iter()
            .zip(&self.value_element_shapes)
            .map(|(&dtype, shape)| element_byte_size(dtype, shape))
            .collect::<Vec<_>>();

        let backend = raw::create(self.backend, capacity, key_size, &value_sizes, self.device)?;

        debug!(
            "created hash map on {}: {:?} backend, capacity {}, {} value channels",
            self.device,
            self.backend.resolve(self.device),
            capacity,
            value_sizes.len()
        );

        Ok(HashMap {
            backend,
            kind: self.backend,
            key_dtype: self.key_dtype,
            key_element_shape: self.key_element_shape,
            value_dtypes: self.value_dtypes,
            value_element_shapes: self.value_element_shapes,
            growth: self.growth,
        })
    }
}

fn check_capacity(capacity: i64) -> Result<usize> {
    match usize::try_from(capacity) {
        Ok(capacity) if capacity > 0 && capacity <= raw::MAX_CAPACITY => Ok(capacity),
        _ => Err(Error::Config(format!(
            "capacity must be in 1..={}, but got {}",
            raw::MAX_CAPACITY,
            capacity
        ))),
    }
}

fn check_layout(dtype: &Dtype, shape: &[usize], what: &str) -> Result<()> {
    if !dtype.is_defined() {
        return Err(Error::Config(format!("{} dtype is undefined", what)));
    }

    if num_elements(shape) == 0 {
        return Err(Error::Config(format!(
            "{} element shape {:?} has no elements",
            what, shape
        )));
    }

    if checked_byte_size(*dtype, shape).is_none() {
        return Err(Error::Config(format!(
            "{} element shape {:?} of {} is too large",
            what, shape, dtype
        )));
    }

    Ok(())
}

// The size of one record, for a layout accepted by `check_layout`.
fn element_byte_size(dtype: Dtype, shape: &[usize]) -> usize {
    checked_byte_size(dtype, shape).unwrap_or(usize::MAX)
}

// Replace an output tensor unless it already is a `[n]` tensor of `dtype` on `device`.
fn prepare_output(out: &mut Tensor, n: usize, dtype: Dtype, device: Device) {
    if out.shape() != [n] || out.dtype() != dtype || out.device() != device {
        *out = Tensor::zeros(&[n], dtype, device);
    }
}

impl HashMap {
    /// Creates a hash map with the given layout.
    ///
    /// `value_dtypes` and `value_element_shapes` are parallel lists, one entry per
    /// value channel. Fails with [`Error::Config`] if the layout is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use slabhash::{Device, Dtype, HashBackend, HashMap};
    ///
    /// let map = HashMap::new(
    ///     100,
    ///     Dtype::Int64,
    ///     &[1],
    ///     &[Dtype::UInt8, Dtype::Float64],
    ///     &[vec![3], vec![2, 2]],
    ///     Device::CPU,
    ///     HashBackend::Default,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(map.capacity(), 100);
    /// assert_eq!(map.backend(), HashBackend::Chained);
    /// ```
    pub fn new(
        capacity: i64,
        key_dtype: Dtype,
        key_element_shape: &[usize],
        value_dtypes: &[Dtype],
        value_element_shapes: &[Vec<usize>],
        device: Device,
        backend: HashBackend,
    ) -> Result<HashMap> {
        HashMap::builder()
            .capacity(capacity)
            .key(key_dtype, key_element_shape)
            .values(value_dtypes, value_element_shapes)
            .device(device)
            .backend(backend)
            .build()
    }

    /// Returns a builder for a `HashMap`.
    ///
    /// The builder can be used for more complex configuration, such as the backend or
    /// [`GrowthMode`].
    pub fn builder() -> HashMapBuilder {
        HashMapBuilder::default()
    }

    /// Inserts keys that are not already present, along with their values.
    ///
    /// `values` holds one tensor per value channel, each with one row per key. For every
    /// key, `out_indices` receives its slot and `out_masks` whether it was inserted by
    /// this call. Keys that were already present keep their existing values and report
    /// their existing slot. Keys that could not be given a slot report
    /// [`NULL_INDEX`](crate::NULL_INDEX).
    ///
    /// If a key appears more than once in a batch, exactly one occurrence is inserted.
    /// Which one is unspecified.
    ///
    /// The output tensors are reused if they already are `Int32[n]` and `Bool[n]` on the
    /// map's device, and replaced otherwise. The map is not modified if the inputs are
    /// invalid.
    pub fn insert(
        &mut self,
        keys: &Tensor,
        values: &[Tensor],
        out_indices: &mut Tensor,
        out_masks: &mut Tensor,
    ) -> Result<()> {
        let n = self.check_keys(keys)?;
        self.check_values(values, n)?;

        let values = values.iter().map(Tensor::as_bytes).collect::<Vec<_>>();
        self.insert_batch(keys.as_bytes(), &values, false, out_indices, out_masks)
    }

    /// Inserts keys that are not already present, zeroing their values.
    ///
    /// This is [`HashMap::insert`] for maps whose values are written in place after
    /// activation, through [`HashMap::value_buffer_mut`].
    pub fn activate(
        &mut self,
        keys: &Tensor,
        out_indices: &mut Tensor,
        out_masks: &mut Tensor,
    ) -> Result<()> {
        self.check_keys(keys)?;
        self.insert_batch(keys.as_bytes(), &[], true, out_indices, out_masks)
    }

    /// Looks up keys.
    ///
    /// For every key, `out_indices` receives its slot and `out_masks` whether it is
    /// present. Missing keys report [`NULL_INDEX`](crate::NULL_INDEX).
    pub fn find(&self, keys: &Tensor, out_indices: &mut Tensor, out_masks: &mut Tensor) -> Result<()> {
        let n = self.check_keys(keys)?;

        prepare_output(out_indices, n, Dtype::Int32, self.device());
        prepare_output(out_masks, n, Dtype::Bool, self.device());

        self.backend.find(
            keys.as_bytes(),
            out_indices.as_mut_slice()?,
            out_masks.as_mut_slice()?,
        );

        Ok(())
    }

    /// Removes keys.
    ///
    /// For every key, `out_masks` receives whether it was removed by this call. If a key
    /// appears more than once in a batch, exactly one occurrence reports `true`.
    pub fn erase(&mut self, keys: &Tensor, out_masks: &mut Tensor) -> Result<()> {
        let n = self.check_keys(keys)?;

        prepare_output(out_masks, n, Dtype::Bool, self.device());
        self.backend.erase(keys.as_bytes(), out_masks.as_mut_slice()?);

        Ok(())
    }

    /// Writes the slots of every entry into `out_indices` as an `Int32` tensor, returning
    /// the number of entries.
    ///
    /// The order is unspecified, but stable until the map is next modified.
    pub fn active_indices(&self, out_indices: &mut Tensor) -> Result<usize> {
        let active = self.active_indices_vec();
        let active = active.iter().map(|&i| i as i32).collect::<Vec<_>>();

        *out_indices = Tensor::from_slice(&active, &[active.len()], self.device())?;
        Ok(active.len())
    }

    /// Returns the slots of every entry.
    pub fn active_indices_vec(&self) -> Vec<u32> {
        self.backend.active_indices()
    }

    /// Returns dense copies of every key and value, in the order of
    /// [`HashMap::active_indices`].
    pub fn active_entries(&self) -> (Tensor, Vec<Tensor>) {
        let active = self.active_indices_vec();

        let keys = self.key_buffer().gather(&active, self.device());
        let values = self
            .value_buffers()
            .iter()
            .map(|buffer| buffer.gather(&active, self.device()))
            .collect();

        (keys, values)
    }

    /// Removes every entry, keeping the capacity and bucket count.
    pub fn clear(&mut self) {
        debug!("clearing hash map of {} entries", self.len());
        self.backend.clear();
    }

    /// Rebuilds the map with `buckets` buckets, preserving every entry.
    ///
    /// The capacity is scaled by the same factor as the bucket count, and never drops
    /// below the number of entries. Slot indices returned before a rehash are invalid
    /// after it.
    ///
    /// # Examples
    ///
    /// ```
    /// use slabhash::{Device, Dtype, HashBackend, HashMap, Tensor};
    ///
    /// let mut map = HashMap::new(4, Dtype::Int32, &[1], &[], &[], Device::CPU, HashBackend::Chained)
    ///     .unwrap();
    ///
    /// let keys = Tensor::from_slice(&[1, 2, 3, 4, 5], &[5, 1], Device::CPU).unwrap();
    /// let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
    /// map.insert(&keys, &[], &mut indices, &mut masks).unwrap();
    /// assert_eq!(map.len(), 4);
    ///
    /// map.rehash(8).unwrap();
    /// assert!(map.capacity() >= 5);
    ///
    /// map.insert(&keys, &[], &mut indices, &mut masks).unwrap();
    /// assert_eq!(map.len(), 5);
    /// ```
    pub fn rehash(&mut self, buckets: usize) -> Result<()> {
        if buckets == 0 {
            return Err(Error::InvalidArgument(
                "a hash map needs at least one bucket".to_string(),
            ));
        }

        let (capacity, bucket_count) = (self.capacity(), self.bucket_count());
        self.backend.rehash(buckets)?;

        debug!(
            "rehashed {} entries: {} -> {} buckets, capacity {} -> {}",
            self.len(),
            bucket_count,
            buckets,
            capacity,
            self.capacity()
        );

        Ok(())
    }

    /// Grows the map so that it can hold at least `capacity` entries.
    ///
    /// Does nothing if the capacity is already large enough.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.capacity() {
            return Ok(());
        }

        if capacity > raw::MAX_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "cannot reserve {} slots, the maximum capacity is {}",
                capacity,
                raw::MAX_CAPACITY
            )));
        }

        let buckets = (self.bucket_count() as u128 * capacity as u128)
            .div_ceil(self.capacity() as u128) as usize;
        self.rehash(buckets)
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots in the map.
    pub fn capacity(&self) -> usize {
        self.backend.capacity()
    }

    /// Returns the number of buckets in the map.
    pub fn bucket_count(&self) -> usize {
        self.backend.bucket_count()
    }

    /// Returns the number of entries per bucket.
    pub fn load_factor(&self) -> f32 {
        self.backend.load_factor()
    }

    /// Returns the number of entries in each bucket.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.backend.bucket_sizes()
    }

    /// Returns the device of the map.
    pub fn device(&self) -> Device {
        self.backend.device()
    }

    /// Returns the backend of the map, with [`HashBackend::Default`] resolved.
    pub fn backend(&self) -> HashBackend {
        self.kind.resolve(self.device())
    }

    pub(crate) fn requested_backend(&self) -> HashBackend {
        self.kind
    }

    pub fn key_dtype(&self) -> Dtype {
        self.key_dtype
    }

    pub fn key_element_shape(&self) -> &[usize] {
        &self.key_element_shape
    }

    pub fn value_dtypes(&self) -> &[Dtype] {
        &self.value_dtypes
    }

    pub fn value_element_shapes(&self) -> &[Vec<usize>] {
        &self.value_element_shapes
    }

    pub fn growth_mode(&self) -> GrowthMode {
        self.growth
    }

    /// Returns a view of the key buffer, shaped `[capacity, *key_element_shape]`.
    pub fn key_buffer(&self) -> BufferView<'_> {
        BufferView::new(
            self.backend.buffer().key_bytes(),
            self.key_dtype,
            self.buffer_shape(&self.key_element_shape),
        )
    }

    /// Returns a view of a value buffer, shaped `[capacity, *value_element_shape]`.
    ///
    /// Fails with [`Error::InvalidArgument`] if the channel does not exist.
    pub fn value_buffer(&self, channel: usize) -> Result<BufferView<'_>> {
        self.check_channel(channel)?;

        Ok(BufferView::new(
            self.backend.buffer().value_bytes(channel),
            self.value_dtypes[channel],
            self.buffer_shape(&self.value_element_shapes[channel]),
        ))
    }

    /// Returns views of every value buffer.
    pub fn value_buffers(&self) -> Vec<BufferView<'_>> {
        (0..self.value_dtypes.len())
            .map(|channel| {
                BufferView::new(
                    self.backend.buffer().value_bytes(channel),
                    self.value_dtypes[channel],
                    self.buffer_shape(&self.value_element_shapes[channel]),
                )
            })
            .collect()
    }

    /// Returns a mutable view of a value buffer, shaped `[capacity, *value_element_shape]`.
    pub fn value_buffer_mut(&mut self, channel: usize) -> Result<BufferViewMut<'_>> {
        self.check_channel(channel)?;

        let dtype = self.value_dtypes[channel];
        let shape = self.buffer_shape(&self.value_element_shapes[channel]);

        Ok(BufferViewMut::new(
            self.backend.buffer_mut().value_bytes_mut(channel),
            dtype,
            shape,
        ))
    }

    /// Returns an equivalent map on `device`, with the same capacity and backend.
    ///
    /// Entries are copied by re-inserting them, so slot indices differ between the two
    /// maps. The maps never share storage.
    pub fn to(&self, device: Device) -> Result<HashMap> {
        let mut map = HashMap::builder()
            .capacity(self.capacity() as i64)
            .key(self.key_dtype, &self.key_element_shape)
            .values(&self.value_dtypes, &self.value_element_shapes)
            .device(device)
            .backend(self.kind)
            .growth(self.growth)
            .build()?;

        if !self.is_empty() {
            let (keys, values) = self.active_entries();
            map.insert_entries(&keys.to(device), &values, device)?;
        }

        debug!("copied hash map of {} entries from {} to {}", self.len(), self.device(), device);
        Ok(map)
    }

    /// Returns a copy of the map on the same device.
    pub fn try_clone(&self) -> Result<HashMap> {
        self.to(self.device())
    }

    /// Writes every entry and the layout of the map to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        io::save(self, path.as_ref())
    }

    /// Reads a map written by [`HashMap::save`], placing it on `device`.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<HashMap> {
        io::load(path.as_ref(), device)
    }

    // Insert entries that are known to be unique, failing if any is not inserted.
    pub(crate) fn insert_entries(
        &mut self,
        keys: &Tensor,
        values: &[Tensor],
        device: Device,
    ) -> Result<()> {
        let values = values.iter().map(|value| value.to(device)).collect::<Vec<_>>();

        let (mut indices, mut masks) = (Tensor::default(), Tensor::default());
        self.insert(keys, &values, &mut indices, &mut masks)?;

        let dropped = masks.as_slice::<bool>()?.iter().filter(|&&m| !m).count();
        if dropped > 0 {
            return Err(Error::Format(format!(
                "{} of {} entries could not be inserted",
                dropped,
                keys.len()
            )));
        }

        Ok(())
    }

    fn insert_batch(
        &mut self,
        keys: &[u8],
        values: &[&[u8]],
        activate: bool,
        out_indices: &mut Tensor,
        out_masks: &mut Tensor,
    ) -> Result<()> {
        let n = keys.len() / self.backend.buffer().key_size();

        prepare_output(out_indices, n, Dtype::Int32, self.device());
        prepare_output(out_masks, n, Dtype::Bool, self.device());

        // Viewing a reused output can fail, which must happen before the map grows.
        let indices = out_indices.as_mut_slice::<i32>()?;
        let masks = out_masks.as_mut_slice::<bool>()?;

        if self.growth == GrowthMode::Doubling {
            while self.len() + n > self.capacity() {
                if !self.grow()? {
                    break;
                }
            }
        }

        self.dispatch(keys, values, activate, indices, masks);

        // Keys can still miss out when the backend runs out of internal storage before
        // slots. Grow and insert the whole batch again, present keys report their new
        // slots and keep the mask of the first attempt.
        if self.growth == GrowthMode::Doubling {
            let (mut retry_indices, mut retry_masks) = (vec![0; n], vec![false; n]);

            while indices.contains(&NULL_INDEX) && self.grow()? {
                self.dispatch(keys, values, activate, &mut retry_indices, &mut retry_masks);

                indices.copy_from_slice(&retry_indices);
                for (mask, retry) in masks.iter_mut().zip(&retry_masks) {
                    *mask |= retry;
                }
            }
        }

        Ok(())
    }

    fn dispatch(
        &mut self,
        keys: &[u8],
        values: &[&[u8]],
        activate: bool,
        indices: &mut [i32],
        masks: &mut [bool],
    ) {
        if activate {
            self.backend.activate(keys, indices, masks);
        } else {
            self.backend.insert(keys, values, indices, masks);
        }
    }

    // Double the bucket count, returning `false` if the capacity can not grow further.
    fn grow(&mut self) -> Result<bool> {
        let capacity = self.capacity();
        if capacity >= raw::MAX_CAPACITY {
            return Ok(false);
        }

        debug!("growing hash map of {} entries, capacity {}", self.len(), capacity);
        self.rehash(self.bucket_count() * 2)?;
        Ok(self.capacity() > capacity)
    }

    // Validate a key tensor, returning the number of keys.
    fn check_keys(&self, keys: &Tensor) -> Result<usize> {
        if keys.shape().is_empty() || keys.len() == 0 {
            return Err(Error::Shape(format!(
                "expected at least one key, got a tensor of shape {:?}",
                keys.shape()
            )));
        }

        let expected = self.backend.buffer().key_size();
        if keys.element_byte_size() != expected {
            return Err(Error::Shape(format!(
                "expected keys of {} bytes ({} {:?}), got {} bytes ({} {:?})",
                expected,
                self.key_dtype,
                self.key_element_shape,
                keys.element_byte_size(),
                keys.dtype(),
                keys.element_shape()
            )));
        }

        self.check_device(keys, "keys")?;
        Ok(keys.len())
    }

    fn check_values(&self, values: &[Tensor], n: usize) -> Result<()> {
        if values.len() != self.value_dtypes.len() {
            return Err(Error::Shape(format!(
                "expected {} value tensors, got {}",
                self.value_dtypes.len(),
                values.len()
            )));
        }

        let sizes = self.backend.buffer().value_sizes();
        for (channel, (value, &expected)) in values.iter().zip(sizes).enumerate() {
            if value.shape().is_empty() || value.len() != n {
                return Err(Error::Shape(format!(
                    "expected {} rows in value channel {}, got a tensor of shape {:?}",
                    n,
                    channel,
                    value.shape()
                )));
            }

            if value.element_byte_size() != expected {
                return Err(Error::Shape(format!(
                    "expected values of {} bytes in channel {}, got {} bytes ({} {:?})",
                    expected,
                    channel,
                    value.element_byte_size(),
                    value.dtype(),
                    value.element_shape()
                )));
            }

            self.check_device(value, "values")?;
        }

        Ok(())
    }

    fn check_device(&self, tensor: &Tensor, what: &str) -> Result<()> {
        if tensor.device() != self.device() {
            return Err(Error::Device(format!(
                "{} are on {}, but the hash map is on {}",
                what,
                tensor.device(),
                self.device()
            )));
        }

        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.value_dtypes.len() {
            return Err(Error::InvalidArgument(format!(
                "value channel {} out of range for a map with {} channels",
                channel,
                self.value_dtypes.len()
            )));
        }

        Ok(())
    }

    fn buffer_shape(&self, element_shape: &[usize]) -> Vec<usize> {
        let mut shape = Vec::with_capacity(element_shape.len() + 1);
        shape.push(self.capacity());
        shape.extend_from_slice(element_shape);
        shape
    }
}

impl fmt::Debug for HashMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("bucket_count", &self.bucket_count())
            .field("backend", &self.backend())
            .field("device", &self.device())
            .field("key_dtype", &self.key_dtype)
            .field("key_element_shape", &self.key_element_shape)
            .field("value_dtypes", &self.value_dtypes)
            .field("value_element_shapes", &self.value_element_shapes)
            .finish()
    }
}
