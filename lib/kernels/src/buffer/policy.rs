// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Out-of-bounds policies.
//!
//! Both policies give identical observable results: valid accesses move real data,
//! invalid loads return zero and invalid stores leave memory untouched.
//!
//! - [`ValueSubstitution`] always issues the access and replaces the loaded value
//!   with zero (or skips the store) behind a branch on the `valid` flag.
//! - [`AddressShift`] never branches. It pushes the address of an invalid access past
//!   the declared range and lets the range check drop it.
//!
//! The shifted address is computed in 64 bits and the declared range is capped at
//! [`MAX_RANGE_BYTES`](super::MAX_RANGE_BYTES), so a shifted address can never wrap
//! back into the range.

use bytemuck::Pod;
use std::fmt::Debug;

use super::{RawBuffer, hardware_address};

/// Added to the byte address of an invalid access by [`AddressShift`].
pub const OOB_SHIFT: u64 = 0x7fff_ffff;

pub trait OobPolicy: Copy + Default + Debug + Send + Sync + 'static {
    const NAME: &'static str;

    fn load<T: Pod, const N: usize>(raw: &RawBuffer<'_, T>, byte_offset: i64, valid: bool)
    -> [T; N];

    fn store<T: Pod, const N: usize>(
        raw: &RawBuffer<'_, T>,
        byte_offset: i64,
        valid: bool,
        value: [T; N],
    );

    fn atomic_add<const N: usize>(
        raw: &RawBuffer<'_, f32>,
        byte_offset: i64,
        valid: bool,
        value: [f32; N],
    );
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueSubstitution;

impl OobPolicy for ValueSubstitution {
    const NAME: &'static str = "value-substitution";

    #[inline]
    fn load<T: Pod, const N: usize>(
        raw: &RawBuffer<'_, T>,
        byte_offset: i64,
        valid: bool,
    ) -> [T; N] {
        let loaded = raw.load_at::<N>(hardware_address(byte_offset));
        if valid { loaded } else { [T::zeroed(); N] }
    }

    #[inline]
    fn store<T: Pod, const N: usize>(
        raw: &RawBuffer<'_, T>,
        byte_offset: i64,
        valid: bool,
        value: [T; N],
    ) {
        if valid {
            raw.store_at(hardware_address(byte_offset), value);
        }
    }

    #[inline]
    fn atomic_add<const N: usize>(
        raw: &RawBuffer<'_, f32>,
        byte_offset: i64,
        valid: bool,
        value: [f32; N],
    ) {
        if valid {
            raw.atomic_add_at(hardware_address(byte_offset), value);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressShift;

impl AddressShift {
    #[inline]
    fn shifted(byte_offset: i64, valid: bool) -> u64 {
        let shift = if valid { 0 } else { OOB_SHIFT };
        hardware_address(byte_offset).saturating_add(shift)
    }
}

impl OobPolicy for AddressShift {
    const NAME: &'static str = "address-shift";

    #[inline]
    fn load<T: Pod, const N: usize>(
        raw: &RawBuffer<'_, T>,
        byte_offset: i64,
        valid: bool,
    ) -> [T; N] {
        raw.load_at::<N>(Self::shifted(byte_offset, valid))
    }

    #[inline]
    fn store<T: Pod, const N: usize>(
        raw: &RawBuffer<'_, T>,
        byte_offset: i64,
        valid: bool,
        value: [T; N],
    ) {
        raw.store_at(Self::shifted(byte_offset, valid), value);
    }

    #[inline]
    fn atomic_add<const N: usize>(
        raw: &RawBuffer<'_, f32>,
        byte_offset: i64,
        valid: bool,
        value: [f32; N],
    ) {
        raw.atomic_add_at(Self::shifted(byte_offset, valid), value);
    }
}

/// Policy used when none is named explicitly, selected by the `oob-address-shift`
/// cargo feature.
#[cfg(not(feature = "oob-address-shift"))]
pub type DefaultOobPolicy = ValueSubstitution;

#[cfg(feature = "oob-address-shift")]
pub type DefaultOobPolicy = AddressShift;
