#![doc = include_str!("../README.md")]
#![deny(unsafe_op_in_unsafe_fn)]

mod device;
mod error;
mod io;
mod map;
mod raw;
mod set;
mod tensor;

pub mod grid;
pub mod points;

pub use device::{Device, DeviceType};
pub use error::{Error, Result};
pub use map::{GrowthMode, HashMap, HashMapBuilder, DEFAULT_CAPACITY};
pub use raw::{HashBackend, NULL_INDEX};
pub use set::{HashSet, HashSetBuilder};
pub use tensor::{num_elements, BufferView, BufferViewMut, Dtype, Element, Tensor};
