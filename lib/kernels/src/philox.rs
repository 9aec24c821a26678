// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counter-based random stream for stochastic masking.
//!
//! Every random value is a pure function of `(seed, offset, position)`, so a forward
//! pass and its backward pass regenerate the same mask without sharing state.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::transform::{Index, tiles_covering};

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;

/// Random 16-bit values produced by one Philox block.
const VALUES_PER_BLOCK: u64 = 8;

#[inline(always)]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = (a as u64) * (b as u64);
    ((product >> 32) as u32, product as u32)
}

/// Philox-4x32 with 10 rounds.
#[inline]
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for _ in 0..PHILOX_ROUNDS {
        let (hi0, lo0) = mulhilo(ctr[0], PHILOX_M0);
        let (hi1, lo1) = mulhilo(ctr[2], PHILOX_M1);
        ctr = [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0];
        key[0] = key[0].wrapping_add(PHILOX_W0);
        key[1] = key[1].wrapping_add(PHILOX_W1);
    }
    ctr
}

/// A stream keyed by `seed` and positioned by the call-site `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Philox {
    seed: u64,
    offset: u64,
}

impl Philox {
    pub fn new(seed: u64, offset: u64) -> Self {
        Self { seed, offset }
    }

    /// Four random words for block `index` of the stream.
    #[inline]
    pub fn block(&self, index: u64) -> [u32; 4] {
        let counter = [
            index as u32,
            (index >> 32) as u32,
            self.offset as u32,
            (self.offset >> 32) as u32,
        ];
        let key = [self.seed as u32, (self.seed >> 32) as u32];
        philox4x32_10(counter, key)
    }

    /// The 16-bit random value at a linear element position.
    #[inline]
    pub fn random_u16(&self, position: u64) -> u16 {
        let words = self.block(position / VALUES_PER_BLOCK);
        let lane = (position % VALUES_PER_BLOCK) as usize;
        (words[lane / 2] >> (16 * (lane % 2))) as u16
    }

    /// A uniform value in `[0, 1)` at a linear element position.
    #[inline]
    pub fn uniform(&self, position: u64) -> f32 {
        self.random_u16(position) as f32 / 65536.0
    }
}

/// Granularity the `M` and `N` extents are padded to before linearising positions.
///
/// Independent of the tile configuration, so kernels built with different tile
/// sizes agree on the mask of every element.
pub const DROPOUT_PAD: Index = 16;

#[inline]
pub fn padded_extent(length: Index) -> Index {
    tiles_covering(length, DROPOUT_PAD) * DROPOUT_PAD
}

/// Linear position of element `(batch, m, n)` in a padded `[G, M, N]` problem.
#[inline]
pub fn dropout_position(batch: Index, m: Index, n: Index, m_padded: Index, n_padded: Index) -> u64 {
    (batch * m_padded * n_padded + m * n_padded + n) as u64
}

/// Dropout probability plus the `(seed, offset)` pair of its random stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropoutParams {
    p_drop: f32,
    seed: u64,
    offset: u64,
}

impl Default for DropoutParams {
    fn default() -> Self {
        Self::disabled()
    }
}

impl DropoutParams {
    pub fn new(p_drop: f32, seed: u64, offset: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&p_drop) {
            return Err(KernelError::unsupported(format!(
                "dropout probability must be in [0, 1), got {p_drop}"
            )));
        }
        Ok(Self {
            p_drop,
            seed,
            offset,
        })
    }

    pub fn disabled() -> Self {
        Self {
            p_drop: 0.0,
            seed: 0,
            offset: 0,
        }
    }

    pub fn p_drop(&self) -> f32 {
        self.p_drop
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_enabled(&self) -> bool {
        self.p_drop > 0.0
    }

    /// Random values at or below this threshold are dropped.
    pub fn threshold(&self) -> u16 {
        (self.p_drop as f64 * 65535.0).floor() as u16
    }

    /// Scale applied to kept elements, `1 / (1 - p)`.
    pub fn rescale(&self) -> f32 {
        1.0 / (1.0 - self.p_drop)
    }

    pub fn generator(&self) -> Philox {
        Philox::new(self.seed, self.offset)
    }

    /// Whether a stored random value keeps its element.
    #[inline]
    pub fn keeps(&self, random: u16) -> bool {
        !self.is_enabled() || random > self.threshold()
    }

    #[inline]
    pub fn keep(&self, position: u64) -> bool {
        !self.is_enabled() || self.keeps(self.generator().random_u16(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_answer() {
        assert_eq!(
            philox4x32_10([0; 4], [0; 2]),
            [0x6627_e8d5, 0xe169_c58d, 0xbc57_ac4c, 0x9b00_dbd8]
        );
    }

    #[test]
    fn test_values_come_from_the_block_words() {
        let ph = Philox::new(42, 7);
        let words = ph.block(3);
        assert_eq!(ph.random_u16(24), words[0] as u16);
        assert_eq!(ph.random_u16(25), (words[0] >> 16) as u16);
        assert_eq!(ph.random_u16(31), (words[3] >> 16) as u16);
        assert_ne!(Philox::new(42, 8).block(3), words);
        assert_ne!(Philox::new(43, 7).block(3), words);
    }

    #[test]
    fn test_drop_rate() {
        let params = DropoutParams::new(0.25, 1234, 0).unwrap();
        let dropped = (0..100_000u64).filter(|p| !params.keep(*p)).count();
        assert!((23_500..26_500).contains(&dropped), "dropped {dropped}");
        assert!((params.rescale() - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_params_validation() {
        assert!(DropoutParams::new(1.0, 0, 0).is_err());
        assert!(DropoutParams::new(-0.1, 0, 0).is_err());
        assert!(DropoutParams::new(f32::NAN, 0, 0).is_err());

        let off = DropoutParams::disabled();
        assert!(!off.is_enabled());
        assert!((0..64).all(|p| off.keep(p)));
        assert!(off.keeps(0));
    }

    #[test]
    fn test_position_is_row_major_over_padded_extents() {
        assert_eq!(dropout_position(0, 0, 5, 8, 16), 5);
        assert_eq!(dropout_position(0, 2, 5, 8, 16), 37);
        assert_eq!(dropout_position(1, 0, 0, 8, 16), 128);
        assert_eq!(padded_extent(1), 16);
        assert_eq!(padded_extent(16), 16);
        assert_eq!(padded_extent(17), 32);
    }

    proptest! {
        #[test]
        fn keep_is_reproducible(seed in any::<u64>(), offset in any::<u64>(), pos in any::<u32>()) {
            let a = DropoutParams::new(0.5, seed, offset).unwrap();
            let b = DropoutParams::new(0.5, seed, offset).unwrap();
            let pos = pos as u64;
            prop_assert_eq!(a.keep(pos), b.keep(pos));
            prop_assert_eq!(a.keep(pos), a.keeps(b.generator().random_u16(pos)));
        }
    }
}
