// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Elementwise operators applied after loads, after accumulation and before stores.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::types::AccType;

/// A pure value-in, value-out function.
pub trait ElementwiseOperation<X>: Copy + Debug + Send + Sync {
    fn apply(&self, x: X) -> X;
}

/// Identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassThrough;

impl<X> ElementwiseOperation<X> for PassThrough {
    #[inline(always)]
    fn apply(&self, x: X) -> X {
        x
    }
}

/// The operator set carried by kernel arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum ElementOp {
    #[default]
    PassThrough,
    Scale(f32),
    Relu,
    /// `max(scale * x, 0)`
    ScaleRelu(f32),
}

impl<A: AccType> ElementwiseOperation<A> for ElementOp {
    #[inline]
    fn apply(&self, x: A) -> A {
        match *self {
            ElementOp::PassThrough => x,
            ElementOp::Scale(s) => x * A::widen_f32(s),
            ElementOp::Relu => x.max(A::zero()),
            ElementOp::ScaleRelu(s) => (x * A::widen_f32(s)).max(A::zero()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops() {
        assert_eq!(ElementwiseOperation::<f32>::apply(&PassThrough, 3.0), 3.0);
        assert_eq!(ElementOp::Scale(0.5).apply(3.0f64), 1.5);
        assert_eq!(ElementOp::Relu.apply(-3.0f32), 0.0);
        assert_eq!(ElementOp::ScaleRelu(2.0).apply(1.25f32), 2.5);
        assert_eq!(ElementOp::ScaleRelu(-2.0).apply(1.25f32), 0.0);
    }
}
