// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Causal masking of output tiles and elements.
//!
//! Both causal variants mask the upper triangle, so an element `(m, n)` is masked
//! exactly when `n - m` exceeds a fixed diagonal offset. A tile is therefore fully
//! masked when its bottom-left corner is masked and unmasked when its top-right
//! corner is not.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use strum::{Display, EnumString};

use crate::transform::Index;
use crate::types::AccType;

/// Masking policy selected for a kernel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum MaskingSpec {
    #[default]
    MaskDisabled,
    /// Mask `n > m`.
    MaskUpperTriangleFromTopLeft,
    /// Mask `n - m > N - M`, aligning the diagonal with the bottom-right corner.
    MaskUpperTriangleFromBottomRight,
}

/// Classification of a rectangular tile against the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TileMaskClass {
    FullyMasked,
    PartiallyMasked,
    Unmasked,
}

/// What a masked element contributes to the reduction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum MaskFill {
    /// Additive negative infinity, ahead of a softmax.
    #[default]
    NegInfinity,
    /// No contribution to a plain sum.
    Zero,
}

impl MaskFill {
    #[inline]
    pub fn value<A: AccType>(self) -> A {
        match self {
            MaskFill::NegInfinity => A::neg_infinity(),
            MaskFill::Zero => A::zero(),
        }
    }
}

/// A masking policy bound to the raw (unpadded) problem extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalMask {
    spec: MaskingSpec,
    diagonal: Index,
}

impl CausalMask {
    pub fn new(spec: MaskingSpec, m_raw: Index, n_raw: Index) -> Self {
        let diagonal = match spec {
            MaskingSpec::MaskUpperTriangleFromBottomRight => n_raw - m_raw,
            _ => 0,
        };
        Self { spec, diagonal }
    }

    pub fn disabled() -> Self {
        Self::new(MaskingSpec::MaskDisabled, 0, 0)
    }

    pub fn spec(&self) -> MaskingSpec {
        self.spec
    }

    pub fn is_enabled(&self) -> bool {
        self.spec != MaskingSpec::MaskDisabled
    }

    #[inline]
    pub fn is_masked(&self, m: Index, n: Index) -> bool {
        self.is_enabled() && n - m > self.diagonal
    }

    /// Classify the tile covering rows `m` and columns `n`.
    ///
    /// An empty range classifies as fully masked: there is nothing to compute.
    pub fn classify(&self, m: Range<Index>, n: Range<Index>) -> TileMaskClass {
        if m.is_empty() || n.is_empty() {
            return TileMaskClass::FullyMasked;
        }
        if !self.is_enabled() {
            return TileMaskClass::Unmasked;
        }
        if self.is_masked(m.end - 1, n.start) {
            TileMaskClass::FullyMasked
        } else if !self.is_masked(m.start, n.end - 1) {
            TileMaskClass::Unmasked
        } else {
            TileMaskClass::PartiallyMasked
        }
    }

    /// Whether a tile can be skipped without any memory traffic.
    pub fn is_tile_skippable(&self, m: Range<Index>, n: Range<Index>) -> bool {
        self.classify(m, n) == TileMaskClass::FullyMasked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn brute_force(mask: &CausalMask, m: Range<Index>, n: Range<Index>) -> TileMaskClass {
        let (mut any_masked, mut any_visible) = (false, false);
        for i in m {
            for j in n.clone() {
                if mask.is_masked(i, j) {
                    any_masked = true;
                } else {
                    any_visible = true;
                }
            }
        }
        match (any_masked, any_visible) {
            (_, false) => TileMaskClass::FullyMasked,
            (false, true) => TileMaskClass::Unmasked,
            (true, true) => TileMaskClass::PartiallyMasked,
        }
    }

    #[rstest]
    #[case(0..4, 4..8, TileMaskClass::FullyMasked)]
    #[case(4..8, 0..4, TileMaskClass::Unmasked)]
    #[case(0..4, 0..4, TileMaskClass::PartiallyMasked)]
    #[case(4..8, 4..8, TileMaskClass::PartiallyMasked)]
    fn test_top_left(
        #[case] m: Range<Index>,
        #[case] n: Range<Index>,
        #[case] expected: TileMaskClass,
    ) {
        let mask = CausalMask::new(MaskingSpec::MaskUpperTriangleFromTopLeft, 8, 8);
        assert_eq!(mask.classify(m, n), expected);
    }

    #[test]
    fn test_bottom_right_shifts_diagonal() {
        // 4 queries against 8 keys: the last query row sees every key
        let mask = CausalMask::new(MaskingSpec::MaskUpperTriangleFromBottomRight, 4, 8);
        assert!(!mask.is_masked(3, 7));
        assert!(!mask.is_masked(0, 4));
        assert!(mask.is_masked(0, 5));
        assert_eq!(mask.classify(0..4, 0..4), TileMaskClass::Unmasked);
    }

    #[test]
    fn test_disabled_and_fill() {
        let mask = CausalMask::disabled();
        assert_eq!(mask.classify(0..4, 100..200), TileMaskClass::Unmasked);
        assert!(!mask.is_tile_skippable(0..4, 100..200));
        assert!(mask.is_tile_skippable(0..0, 0..4));

        assert_eq!(MaskFill::Zero.value::<f32>(), 0.0);
        assert_eq!(MaskFill::NegInfinity.value::<f64>(), f64::NEG_INFINITY);
        assert_eq!(
            MaskingSpec::MaskUpperTriangleFromTopLeft.to_string(),
            "MaskUpperTriangleFromTopLeft"
        );
        assert_eq!("zero".parse::<MaskFill>().unwrap(), MaskFill::Zero);
    }

    proptest! {
        #[test]
        fn classify_matches_brute_force(
            spec in prop_oneof![
                Just(MaskingSpec::MaskDisabled),
                Just(MaskingSpec::MaskUpperTriangleFromTopLeft),
                Just(MaskingSpec::MaskUpperTriangleFromBottomRight),
            ],
            m_raw in 1i64..40,
            n_raw in 1i64..40,
            m0 in 0i64..40,
            n0 in 0i64..40,
            mt in 1i64..12,
            nt in 1i64..12,
        ) {
            let mask = CausalMask::new(spec, m_raw, n_raw);
            let (m, n) = (m0..m0 + mt, n0..n0 + nt);
            prop_assert_eq!(mask.classify(m.clone(), n.clone()), brute_force(&mask, m, n));
        }
    }
}
