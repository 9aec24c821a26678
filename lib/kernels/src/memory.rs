// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global memory allocations.
//!
//! A [`GlobalBuffer`] is a fixed, zero-initialized allocation that every execution
//! group of a launch may read and write concurrently. Kernels only touch it through a
//! [`BufferResource`](crate::buffer::BufferResource), and the host only reads it back
//! through `&mut` access, which guarantees no launch is in flight.

use bytemuck::Pod;
use std::ptr::NonNull;

/// Device-style memory allocation of `len` elements of `T`.
#[derive(Debug)]
pub struct GlobalBuffer<T: Pod> {
    ptr: NonNull<T>,
    len: usize,
}

// Concurrent access only happens through buffer resources, which write disjoint
// tiles or use atomics.
unsafe impl<T: Pod + Send> Send for GlobalBuffer<T> {}
unsafe impl<T: Pod + Sync> Sync for GlobalBuffer<T> {}

impl<T: Pod> GlobalBuffer<T> {
    /// Allocate `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![T::zeroed(); len])
    }

    /// Allocate `len` elements set to `value`.
    pub fn filled(len: usize, value: T) -> Self {
        Self::from_vec(vec![value; len])
    }

    pub fn from_slice(data: &[T]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        let len = data.len();
        let raw = Box::into_raw(data.into_boxed_slice()) as *mut T;
        // SAFETY: Box::into_raw never returns null; empty boxes yield a dangling,
        // well-aligned pointer.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the allocation in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Base address of the allocation.
    ///
    /// Reading the address is safe; dereferencing it is the job of a buffer resource.
    pub(crate) fn base_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Host view of the contents.
    pub fn as_slice(&mut self) -> &[T] {
        // SAFETY: ptr/len describe a live boxed slice and `&mut self` excludes
        // concurrent kernel access.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable host view of the contents.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn to_vec(&mut self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    pub fn fill(&mut self, value: T) {
        self.as_mut_slice().fill(value);
    }
}

impl<T: Pod> Drop for GlobalBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice of this length.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}
