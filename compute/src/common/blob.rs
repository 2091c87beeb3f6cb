use crate::{resource_exhausted, DeviceMemory, Error};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 主机内存，对齐到最大的元素类型。
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

impl Blob {
    pub fn new(size: usize) -> Result<Self, Error> {
        // 零长度分配不合法
        let layout = layout(size.max(1))?;
        match NonNull::new(unsafe { alloc_zeroed(layout) }) {
            Some(ptr) => Ok(Self { ptr, len: size }),
            None => Err(resource_exhausted(format!("failed to allocate {size} bytes"))),
        }
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        let &mut Blob { ptr, len } = self;
        if let Ok(layout) = layout(len.max(1)) {
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }
}

#[inline]
fn layout(size: usize) -> Result<Layout, Error> {
    Layout::from_size_align(size, ALIGN)
        .map_err(|_| resource_exhausted(format!("{size} bytes exceeds the address space")))
}

const ALIGN: usize = 16;

impl DeviceMemory for Blob {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for Blob {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Blob {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[test]
fn test_zeroed() {
    let mut blob = Blob::new(40).unwrap();
    assert_eq!(blob.len(), 40);
    assert!(blob.iter().all(|&b| b == 0));
    assert_eq!(blob.as_mut_ptr() as usize % ALIGN, 0);
    blob[3] = 7;
    assert_eq!(unsafe { *blob.as_mut_ptr().add(3) }, 7);
}
