// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Element and accumulator types.
//!
//! Operands are loaded in their storage type and widened to [`DataType::Acc`] before
//! they enter a reduction. Narrowing back to the storage type happens once, when an
//! accumulation tile is written out.

use bytemuck::Pod;
use half::{bf16, f16};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign};
use strum::{Display, EnumString};

/// Storage types understood by the kernels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[repr(i32)]
#[strum(serialize_all = "lowercase")]
pub enum ElementKind {
    F16 = 0,
    BF16 = 1,
    F32 = 2,
    I8 = 3,
}

/// Wide type used inside accumulation tiles.
pub trait AccType: Float + AddAssign + MulAssign + Default + Debug + Send + Sync + 'static {
    fn widen_f32(value: f32) -> Self;
    fn narrow_f32(self) -> f32;
    fn widen_f64(self) -> f64;
}

impl AccType for f32 {
    #[inline]
    fn widen_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn narrow_f32(self) -> f32 {
        self
    }

    #[inline]
    fn widen_f64(self) -> f64 {
        self as f64
    }
}

impl AccType for f64 {
    #[inline]
    fn widen_f32(value: f32) -> Self {
        value as f64
    }

    #[inline]
    fn narrow_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn widen_f64(self) -> f64 {
        self
    }
}

/// A tensor element type with its accumulator.
pub trait DataType: Pod + PartialEq + Debug + Send + Sync {
    type Acc: AccType;

    const KIND: ElementKind;

    fn to_acc(self) -> Self::Acc;

    fn from_acc(acc: Self::Acc) -> Self;
}

impl DataType for f32 {
    type Acc = f64;
    const KIND: ElementKind = ElementKind::F32;

    #[inline]
    fn to_acc(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_acc(acc: f64) -> Self {
        acc as f32
    }
}

impl DataType for f16 {
    type Acc = f32;
    const KIND: ElementKind = ElementKind::F16;

    #[inline]
    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_acc(acc: f32) -> Self {
        f16::from_f32(acc)
    }
}

impl DataType for bf16 {
    type Acc = f32;
    const KIND: ElementKind = ElementKind::BF16;

    #[inline]
    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_acc(acc: f32) -> Self {
        bf16::from_f32(acc)
    }
}

impl DataType for i8 {
    type Acc = f32;
    const KIND: ElementKind = ElementKind::I8;

    #[inline]
    fn to_acc(self) -> f32 {
        self as f32
    }

    /// Rounds to nearest and saturates.
    #[inline]
    fn from_acc(acc: f32) -> Self {
        acc.round() as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_half_types_widen_to_f32() {
        let x = f16::from_f32(1.5);
        assert_eq!(x.to_acc(), 1.5f32);
        assert_eq!(f16::from_acc(x.to_acc()), x);

        let y = bf16::from_f32(-2.0);
        assert_eq!(y.to_acc(), -2.0f32);
    }

    #[test]
    fn test_i8_saturates() {
        assert_eq!(i8::from_acc(126.6), 127);
        assert_eq!(i8::from_acc(1000.0), 127);
        assert_eq!(i8::from_acc(-1000.0), -128);
        assert_eq!(i8::from_acc(f32::NAN), 0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(<f16 as DataType>::KIND.to_string(), "f16");
        assert_eq!(ElementKind::from_str("bf16").unwrap(), ElementKind::BF16);
        assert_eq!(<f32 as DataType>::KIND as i32, 2);
    }
}
