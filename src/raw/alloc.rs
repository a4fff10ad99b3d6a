use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::{ptr, slice};

use crate::{Device, Error, Result};

// Alignment of every device allocation, one cache line.
const ALIGN: usize = 64;

// A zeroed block of device memory.
//
// All devices are backed by host memory, the device tag only records which
// backend owns the block. Writes through `&Blob` are only sound for ranges that
// no other thread reads or writes concurrently, see `SlotBuffer`.
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
    device: Device,
}

// Safety: `Blob` owns its allocation, and shared-reference writes are `unsafe`
// and require exclusive access to the written range.
unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    // Allocate `len` zeroed bytes on `device`.
    pub fn zeroed(len: usize, device: Device) -> Result<Blob> {
        let layout = Self::layout(len, device)?;

        // Safety: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::Device(format!("failed to allocate {} bytes on {}", len, device))
        })?;

        Ok(Blob { ptr, len, device })
    }

    // The layout used for allocation. Empty blobs still own one aligned block.
    fn layout(len: usize, device: Device) -> Result<Layout> {
        Layout::from_size_align(len.max(ALIGN), ALIGN).map_err(|_| {
            Error::Device(format!(
                "allocation of {} bytes on {} exceeds the address space",
                len, device
            ))
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: `ptr` is valid for `len` initialized bytes.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: `ptr` is valid for `len` initialized bytes and we have `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    // Returns the bytes in `offset..offset + len`.
    //
    // # Safety
    //
    // The range must not be written concurrently.
    #[inline]
    pub unsafe fn range(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len());
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    // Copies `src` into the bytes starting at `offset`.
    //
    // # Safety
    //
    // The destination range must not be read or written concurrently.
    #[inline]
    pub unsafe fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len()) }
    }

    // Zeroes `len` bytes starting at `offset`.
    //
    // # Safety
    //
    // The range must not be read or written concurrently.
    #[inline]
    pub unsafe fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len());
        unsafe { self.ptr.as_ptr().add(offset).write_bytes(0, len) }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        // Safety: the layout was valid when the blob was allocated.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len.max(ALIGN), ALIGN);
            alloc::dealloc(self.ptr.as_ptr(), layout)
        }
    }
}

#[test]
fn layout() {
    let mut blob = Blob::zeroed(10, Device::CPU).unwrap();
    assert_eq!(blob.len(), 10);
    assert!(blob.as_bytes().iter().all(|&b| b == 0));
    assert_eq!(blob.as_bytes().as_ptr() as usize % ALIGN, 0);

    unsafe { blob.write(4, &[1, 2, 3]) };
    assert_eq!(blob.as_bytes(), &[0, 0, 0, 0, 1, 2, 3, 0, 0, 0]);
    unsafe { blob.zero(5, 1) };
    assert_eq!(unsafe { blob.range(4, 3) }, &[1, 0, 3]);

    blob.as_bytes_mut().fill(9);
    assert!(blob.as_bytes().iter().all(|&b| b == 9));

    let empty = Blob::zeroed(0, Device::cuda(0)).unwrap();
    assert!(empty.as_bytes().is_empty());
    assert_eq!(empty.device(), Device::cuda(0));
}
