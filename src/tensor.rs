//! Typed, shaped byte arrays exchanged with a hash map.
//!
//! A [`Tensor`] owns its storage; [`BufferView`] and [`BufferViewMut`] borrow the key and
//! value buffers of a map, shaped `[capacity, *element_shape]`.

use std::fmt;

use bytemuck::checked::{self, CheckedCastError};
use bytemuck::{CheckedBitPattern, NoUninit};
use serde::{Deserialize, Serialize};

use crate::{Device, Error, Result};

/// The element type of a tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    /// No element type. Never valid for a key or value channel.
    #[default]
    Undefined,
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl Dtype {
    /// Returns the size of one element in bytes, or 0 for [`Dtype::Undefined`].
    pub const fn byte_size(self) -> usize {
        match self {
            Dtype::Undefined => 0,
            Dtype::Bool | Dtype::UInt8 | Dtype::Int8 => 1,
            Dtype::UInt16 | Dtype::Int16 => 2,
            Dtype::UInt32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::UInt64 | Dtype::Int64 | Dtype::Float64 => 8,
        }
    }

    /// Returns `true` unless this is [`Dtype::Undefined`].
    pub const fn is_defined(self) -> bool {
        !matches!(self, Dtype::Undefined)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A Rust type that can be viewed as the elements of a tensor.
pub trait Element: CheckedBitPattern + NoUninit + Send + Sync {
    /// The dtype tag for this element type.
    const DTYPE: Dtype;
}

macro_rules! element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: Dtype = Dtype::$dtype;
        })*
    };
}

element! {
    bool => Bool,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
}

/// Returns the number of elements described by a shape, saturating at `usize::MAX`.
///
/// The empty shape describes a single scalar.
pub fn num_elements(shape: &[usize]) -> usize {
    checked_num_elements(shape).unwrap_or(usize::MAX)
}

fn checked_num_elements(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |n, &dim| n.checked_mul(dim))
}

// Returns the size in bytes of the elements described by a shape, or `None` if it
// does not fit in a `usize`.
pub(crate) fn checked_byte_size(dtype: Dtype, shape: &[usize]) -> Option<usize> {
    checked_num_elements(shape)?.checked_mul(dtype.byte_size())
}

fn check_dtype<T: Element>(dtype: Dtype) -> Result<()> {
    if dtype != T::DTYPE {
        return Err(Error::Dtype(format!(
            "cannot view {} elements as {}",
            dtype,
            T::DTYPE
        )));
    }

    Ok(())
}

fn cast_error(err: CheckedCastError) -> Error {
    Error::Dtype(format!("invalid element bytes: {:?}", err))
}

fn view<T: Element>(bytes: &[u8], dtype: Dtype) -> Result<&[T]> {
    check_dtype::<T>(dtype)?;
    checked::try_cast_slice(bytes).map_err(cast_error)
}

fn view_mut<T: Element>(bytes: &mut [u8], dtype: Dtype) -> Result<&mut [T]> {
    check_dtype::<T>(dtype)?;
    checked::try_cast_slice_mut(bytes).map_err(cast_error)
}

/// An owned, contiguous, row-major array.
///
/// The first dimension is the *length* of the tensor, the remaining dimensions form the
/// *element shape*. Storage is 8-byte aligned so that any [`Element`] can be viewed in
/// place.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    words: Vec<u64>,
    byte_len: usize,
    dtype: Dtype,
    shape: Vec<usize>,
    device: Device,
}

impl Default for Tensor {
    /// An empty tensor of shape `[0]` with an undefined dtype.
    fn default() -> Tensor {
        Tensor {
            words: Vec::new(),
            byte_len: 0,
            dtype: Dtype::Undefined,
            shape: vec![0],
            device: Device::CPU,
        }
    }
}

impl Tensor {
    /// Creates a zero-filled tensor.
    ///
    /// # Panics
    ///
    /// Panics if the tensor does not fit in memory.
    pub fn zeros(shape: &[usize], dtype: Dtype, device: Device) -> Tensor {
        let byte_len = num_elements(shape).saturating_mul(dtype.byte_size());

        Tensor {
            words: vec![0; byte_len.div_ceil(8)],
            byte_len,
            dtype,
            shape: shape.to_vec(),
            device,
        }
    }

    /// Creates a tensor by copying `data`, which must hold exactly as many elements as
    /// `shape` describes.
    ///
    /// # Examples
    ///
    /// ```
    /// use slabhash::{Device, Tensor};
    ///
    /// let keys = Tensor::from_slice(&[1i32, 2, 3, 4, 5, 6], &[2, 3], Device::CPU).unwrap();
    /// assert_eq!(keys.len(), 2);
    /// assert_eq!(keys.element_shape(), &[3]);
    /// assert_eq!(keys.as_slice::<i32>().unwrap(), &[1, 2, 3, 4, 5, 6]);
    /// ```
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize], device: Device) -> Result<Tensor> {
        if num_elements(shape) != data.len() {
            return Err(Error::Shape(format!(
                "{} elements cannot be shaped as {:?}",
                data.len(),
                shape
            )));
        }

        Tensor::from_bytes(bytemuck::cast_slice(data), T::DTYPE, shape, device)
    }

    /// Creates a tensor by copying raw element bytes.
    pub fn from_bytes(bytes: &[u8], dtype: Dtype, shape: &[usize], device: Device) -> Result<Tensor> {
        let expected = num_elements(shape).saturating_mul(dtype.byte_size());
        if bytes.len() != expected {
            return Err(Error::Shape(format!(
                "{} bytes cannot hold a {} tensor of shape {:?} ({} bytes)",
                bytes.len(),
                dtype,
                shape,
                expected
            )));
        }

        let mut tensor = Tensor::zeros(shape, dtype, device);
        tensor.as_bytes_mut().copy_from_slice(bytes);
        Ok(tensor)
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the element type of the tensor.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Returns the device the tensor is tagged with.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the size of the first dimension, or 0 for a scalar.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Returns `true` if the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    /// Returns the total number of elements.
    pub fn num_elements(&self) -> usize {
        num_elements(&self.shape)
    }

    /// Returns the shape of one row, i.e. every dimension but the first.
    pub fn element_shape(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }

    /// Returns the size of one row in bytes.
    pub fn element_byte_size(&self) -> usize {
        num_elements(self.element_shape()).saturating_mul(self.dtype.byte_size())
    }

    /// Returns the raw bytes of the tensor.
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.byte_len]
    }

    /// Returns the raw bytes of the tensor, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.byte_len]
    }

    /// Views the elements as `T`, which must match the tensor's dtype.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        view(self.as_bytes(), self.dtype)
    }

    /// Views the elements as `T` mutably, which must match the tensor's dtype.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        let dtype = self.dtype;
        view_mut(self.as_bytes_mut(), dtype)
    }

    /// Copies the elements into a vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.as_slice().map(<[T]>::to_vec)
    }

    /// Returns the bytes of row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn row(&self, i: usize) -> &[u8] {
        let size = self.element_byte_size();
        &self.as_bytes()[i * size..(i + 1) * size]
    }

    /// Returns the same elements under a new shape with an equal element count.
    pub fn reshape(mut self, shape: &[usize]) -> Result<Tensor> {
        if num_elements(shape) != self.num_elements() {
            return Err(Error::Shape(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, shape
            )));
        }

        self.shape = shape.to_vec();
        Ok(self)
    }

    /// Returns a copy of this tensor on `device`.
    pub fn to(&self, device: Device) -> Tensor {
        Tensor {
            device,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

/// A borrowed view of a key or value buffer, shaped `[capacity, *element_shape]`.
///
/// Row `i` holds the record of slot `i`. Rows of free slots hold stale data.
#[derive(Clone)]
pub struct BufferView<'a> {
    bytes: &'a [u8],
    dtype: Dtype,
    shape: Vec<usize>,
}

impl<'a> BufferView<'a> {
    pub(crate) fn new(bytes: &'a [u8], dtype: Dtype, shape: Vec<usize>) -> BufferView<'a> {
        debug_assert_eq!(bytes.len(), num_elements(&shape) * dtype.byte_size());
        BufferView {
            bytes,
            dtype,
            shape,
        }
    }

    /// Returns the shape of the buffer.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the element type of the buffer.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Returns the number of rows, i.e. the capacity of the map.
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    /// Returns `true` if the buffer has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the size of one row in bytes.
    pub fn element_byte_size(&self) -> usize {
        num_elements(&self.shape[1..]) * self.dtype.byte_size()
    }

    /// Returns the raw bytes of the buffer.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Views the buffer as elements of type `T`.
    pub fn as_slice<T: Element>(&self) -> Result<&'a [T]> {
        view(self.bytes, self.dtype)
    }

    /// Returns the bytes of row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn row(&self, i: usize) -> &'a [u8] {
        let size = self.element_byte_size();
        &self.bytes[i * size..(i + 1) * size]
    }

    /// Copies the given rows into a new tensor of shape `[indices.len(), *element_shape]`.
    pub fn gather(&self, indices: &[u32], device: Device) -> Tensor {
        let mut shape = self.shape.clone();
        shape[0] = indices.len();

        let size = self.element_byte_size();
        let mut tensor = Tensor::zeros(&shape, self.dtype, device);
        for (dst, &i) in tensor.as_bytes_mut().chunks_exact_mut(size.max(1)).zip(indices) {
            dst.copy_from_slice(self.row(i as usize));
        }

        tensor
    }
}

/// A mutable view of a value buffer, shaped `[capacity, *element_shape]`.
pub struct BufferViewMut<'a> {
    bytes: &'a mut [u8],
    dtype: Dtype,
    shape: Vec<usize>,
}

impl<'a> BufferViewMut<'a> {
    pub(crate) fn new(bytes: &'a mut [u8], dtype: Dtype, shape: Vec<usize>) -> BufferViewMut<'a> {
        debug_assert_eq!(bytes.len(), num_elements(&shape) * dtype.byte_size());
        BufferViewMut {
            bytes,
            dtype,
            shape,
        }
    }

    /// Returns the shape of the buffer.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the element type of the buffer.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Views the buffer as elements of type `T`.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        view(self.bytes, self.dtype)
    }

    /// Views the buffer as mutable elements of type `T`.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        view_mut(self.bytes, self.dtype)
    }

    /// Returns the bytes of row `i`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn row_mut(&mut self, i: usize) -> &mut [u8] {
        let size = num_elements(&self.shape[1..]) * self.dtype.byte_size();
        &mut self.bytes[i * size..(i + 1) * size]
    }
}
