// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Bounded vector access
//!
//! A [`BufferResource`] binds the base address of a [`GlobalBuffer`] and an explicit
//! byte range. It is built once per execution group and copied freely between the
//! group's lanes; it is the only thing that dereferences the buffer's address.
//!
//! Every access carries a `valid` flag computed by the caller (normally the validity
//! of a coordinate). What happens to invalid accesses is decided by the
//! [`OobPolicy`] type parameter. Independently of the flag, the emulated hardware
//! range check returns zero for loads and drops stores for every element whose bytes
//! are not fully inside the declared range.

mod policy;

pub use policy::{AddressShift, DefaultOobPolicy, OOB_SHIFT, OobPolicy, ValueSubstitution};

use bytemuck::Pod;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::descriptor::TensorDescriptor;
use crate::error::ResourceError;
use crate::memory::GlobalBuffer;
use crate::transform::Index;

/// Largest byte range a resource may declare.
pub const MAX_RANGE_BYTES: u64 = 0x7fff_ffff;

/// Supported vector widths.
pub const VECTOR_WIDTHS: [usize; 5] = [1, 2, 4, 8, 16];

struct VectorWidth<const N: usize>;

impl<const N: usize> VectorWidth<N> {
    const CHECK: () = assert!(
        N.is_power_of_two() && N <= 16,
        "vector width must be a power of two no larger than 16"
    );
}

/// Address the emulated hardware sees for a signed byte offset. Negative offsets
/// become unreachable addresses instead of wrapping.
#[inline]
pub fn hardware_address(byte_offset: i64) -> u64 {
    u64::try_from(byte_offset).unwrap_or(u64::MAX)
}

/// Check a declared range of `elements` elements of `element_bytes` bytes each.
pub fn check_range_bytes(elements: usize, element_bytes: usize) -> Result<u64, ResourceError> {
    let bytes = (elements as u64).saturating_mul(element_bytes as u64);
    if bytes > MAX_RANGE_BYTES {
        return Err(ResourceError::RangeTooLarge {
            bytes,
            max: MAX_RANGE_BYTES,
        });
    }
    Ok(bytes)
}

/// The hardware half of a resource: base address plus byte range, with a per-element
/// range check on every access.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a, T> {
    base: NonNull<T>,
    range_bytes: u64,
    _buffer: PhantomData<&'a [T]>,
}

// A resource is read-only; the memory behind it is shared the same way the
// GlobalBuffer is.
unsafe impl<T: Sync> Send for RawBuffer<'_, T> {}
unsafe impl<T: Sync> Sync for RawBuffer<'_, T> {}

impl<T: Pod> RawBuffer<'_, T> {
    const ELEMENT_BYTES: u64 = std::mem::size_of::<T>() as u64;

    pub fn range_bytes(&self) -> u64 {
        self.range_bytes
    }

    /// Element index behind `addr` when the element lies fully inside the range.
    #[inline]
    fn element(&self, addr: u64) -> Option<usize> {
        let size = Self::ELEMENT_BYTES;
        let end = addr.checked_add(size)?;
        (end <= self.range_bytes && addr % size == 0).then(|| (addr / size) as usize)
    }

    #[inline]
    pub fn load_at<const N: usize>(&self, addr: u64) -> [T; N] {
        std::array::from_fn(|j| {
            let a = addr.saturating_add(j as u64 * Self::ELEMENT_BYTES);
            match self.element(a) {
                // SAFETY: the range never exceeds the allocation (checked when the
                // resource was built) and the borrow keeps the allocation alive.
                Some(i) => unsafe { self.base.as_ptr().add(i).read() },
                None => T::zeroed(),
            }
        })
    }

    #[inline]
    pub fn store_at<const N: usize>(&self, addr: u64, value: [T; N]) {
        for (j, v) in value.into_iter().enumerate() {
            let a = addr.saturating_add(j as u64 * Self::ELEMENT_BYTES);
            if let Some(i) = self.element(a) {
                // SAFETY: as in `load_at`; groups write disjoint elements.
                unsafe { self.base.as_ptr().add(i).write(v) };
            }
        }
    }
}

impl RawBuffer<'_, f32> {
    #[inline]
    pub fn atomic_add_at<const N: usize>(&self, addr: u64, value: [f32; N]) {
        for (j, v) in value.into_iter().enumerate() {
            let a = addr.saturating_add(j as u64 * Self::ELEMENT_BYTES);
            let Some(i) = self.element(a) else {
                continue;
            };
            // SAFETY: in range and 4-byte aligned; during a launch this element is
            // only accessed atomically.
            let cell = unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(i).cast::<u32>()) };
            let mut current = cell.load(Ordering::Relaxed);
            loop {
                let next = (f32::from_bits(current) + v).to_bits();
                match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(x) => current = x,
                }
            }
        }
    }
}

/// Per-group access descriptor for one tensor.
#[derive(Debug, Clone, Copy)]
pub struct BufferResource<'a, T, P = DefaultOobPolicy> {
    raw: RawBuffer<'a, T>,
    _policy: PhantomData<P>,
}

impl<'a, T: Pod, P: OobPolicy> BufferResource<'a, T, P> {
    /// Bind `buffer` with a declared range of `range` elements.
    pub fn new(buffer: &'a GlobalBuffer<T>, range: usize) -> Result<Self, ResourceError> {
        if range > buffer.len() {
            return Err(ResourceError::RangeExceedsAllocation {
                range,
                len: buffer.len(),
            });
        }
        let range_bytes = check_range_bytes(range, std::mem::size_of::<T>())?;
        Ok(Self {
            raw: RawBuffer {
                base: buffer.base_ptr(),
                range_bytes,
                _buffer: PhantomData,
            },
            _policy: PhantomData,
        })
    }

    /// Bind the whole allocation.
    pub fn whole(buffer: &'a GlobalBuffer<T>) -> Result<Self, ResourceError> {
        Self::new(buffer, buffer.len())
    }

    /// Bind the element space of `desc`.
    pub fn for_descriptor(
        buffer: &'a GlobalBuffer<T>,
        desc: &TensorDescriptor,
    ) -> Result<Self, ResourceError> {
        let range = usize::try_from(desc.element_space_size()).unwrap_or(usize::MAX);
        Self::new(buffer, range)
    }

    pub fn range_bytes(&self) -> u64 {
        self.raw.range_bytes
    }

    pub fn policy_name(&self) -> &'static str {
        P::NAME
    }

    #[inline]
    fn byte_offset(offset: Index) -> i64 {
        offset.saturating_mul(std::mem::size_of::<T>() as i64)
    }

    /// Load `N` consecutive elements starting at element `offset`.
    #[inline]
    pub fn load<const N: usize>(&self, offset: Index, valid: bool) -> [T; N] {
        let () = VectorWidth::<N>::CHECK;
        P::load::<T, N>(&self.raw, Self::byte_offset(offset), valid)
    }

    /// Store `N` consecutive elements starting at element `offset`.
    #[inline]
    pub fn store<const N: usize>(&self, value: [T; N], offset: Index, valid: bool) {
        let () = VectorWidth::<N>::CHECK;
        P::store::<T, N>(&self.raw, Self::byte_offset(offset), valid, value)
    }

    /// Load `out.len()` elements, using the widest vector access that matches.
    pub fn load_into(&self, offset: Index, valid: bool, out: &mut [T]) {
        match out.len() {
            1 => out.copy_from_slice(&self.load::<1>(offset, valid)),
            2 => out.copy_from_slice(&self.load::<2>(offset, valid)),
            4 => out.copy_from_slice(&self.load::<4>(offset, valid)),
            8 => out.copy_from_slice(&self.load::<8>(offset, valid)),
            16 => out.copy_from_slice(&self.load::<16>(offset, valid)),
            _ => {
                for (j, o) in out.iter_mut().enumerate() {
                    *o = self.load::<1>(offset + j as Index, valid)[0];
                }
            }
        }
    }

    /// Store `values`, using the widest vector access that matches.
    pub fn store_from(&self, values: &[T], offset: Index, valid: bool) {
        fn array<T: Pod, const N: usize>(values: &[T]) -> [T; N] {
            std::array::from_fn(|j| values[j])
        }
        match values.len() {
            1 => self.store::<1>(array(values), offset, valid),
            2 => self.store::<2>(array(values), offset, valid),
            4 => self.store::<4>(array(values), offset, valid),
            8 => self.store::<8>(array(values), offset, valid),
            16 => self.store::<16>(array(values), offset, valid),
            _ => {
                for (j, v) in values.iter().enumerate() {
                    self.store::<1>([*v], offset + j as Index, valid);
                }
            }
        }
    }
}

impl<P: OobPolicy> BufferResource<'_, f32, P> {
    /// Atomically add `N` consecutive elements.
    #[inline]
    pub fn atomic_add<const N: usize>(&self, value: [f32; N], offset: Index, valid: bool) {
        let () = VectorWidth::<N>::CHECK;
        P::atomic_add::<N>(&self.raw, Self::byte_offset(offset), valid, value)
    }
}
