// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use super::{Index, MAX_DIMS};
use crate::error::TransformError;

/// A single coordinate-mapping operator.
///
/// A transform maps its *upper* dimensions (closer to the logical tensor index) onto
/// its *lower* dimensions (closer to memory). Every variant provides the forward map,
/// a decode from lower to upper, and an incremental update that turns a delta on the
/// upper side into a delta on the lower side without recomputing the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// Identity over one dimension.
    PassThrough { length: Index },

    /// Extends one dimension by `left` and `right` elements; indices in the extension
    /// map outside `[0, length)` and are flagged invalid.
    Pad {
        length: Index,
        left: Index,
        right: Index,
    },

    /// Affine map of several upper dimensions onto one lower dimension:
    /// `lower = offset + sum(upper[i] * coefficients[i])`.
    Embed {
        lengths: Vec<Index>,
        coefficients: Vec<Index>,
        offset: Index,
    },

    /// Collapses several lower dimensions into one row-major linear index.
    Merge { lengths: Vec<Index> },

    /// Splits one lower dimension into several row-major upper dimensions.
    Unmerge { lengths: Vec<Index> },

    /// Binds its lower dimension to a fixed index; produces no upper dimension.
    Freeze { index: Index },
}

impl Transform {
    pub fn pass_through(length: Index) -> Self {
        Transform::PassThrough { length }
    }

    pub fn pad(length: Index, left: Index, right: Index) -> Self {
        Transform::Pad {
            length,
            left,
            right,
        }
    }

    /// Right pad `length` up to the next multiple of `tile`.
    pub fn right_pad_to_multiple(length: Index, tile: Index) -> Self {
        let padded = if tile > 0 {
            super::tiles_covering(length, tile) * tile
        } else {
            length
        };
        Transform::Pad {
            length,
            left: 0,
            right: padded - length,
        }
    }

    pub fn embed(lengths: impl Into<Vec<Index>>, coefficients: impl Into<Vec<Index>>) -> Self {
        Transform::Embed {
            lengths: lengths.into(),
            coefficients: coefficients.into(),
            offset: 0,
        }
    }

    pub fn embed_with_offset(
        lengths: impl Into<Vec<Index>>,
        coefficients: impl Into<Vec<Index>>,
        offset: Index,
    ) -> Self {
        Transform::Embed {
            lengths: lengths.into(),
            coefficients: coefficients.into(),
            offset,
        }
    }

    pub fn merge(lengths: impl Into<Vec<Index>>) -> Self {
        Transform::Merge {
            lengths: lengths.into(),
        }
    }

    pub fn unmerge(lengths: impl Into<Vec<Index>>) -> Self {
        Transform::Unmerge {
            lengths: lengths.into(),
        }
    }

    pub fn freeze(index: Index) -> Self {
        Transform::Freeze { index }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transform::PassThrough { .. } => "PassThrough",
            Transform::Pad { .. } => "Pad",
            Transform::Embed { .. } => "Embed",
            Transform::Merge { .. } => "Merge",
            Transform::Unmerge { .. } => "Unmerge",
            Transform::Freeze { .. } => "Freeze",
        }
    }

    pub fn num_lower(&self) -> usize {
        match self {
            Transform::Merge { lengths } => lengths.len(),
            _ => 1,
        }
    }

    pub fn num_upper(&self) -> usize {
        match self {
            Transform::PassThrough { .. } | Transform::Pad { .. } | Transform::Merge { .. } => 1,
            Transform::Embed { lengths, .. } | Transform::Unmerge { lengths } => lengths.len(),
            Transform::Freeze { .. } => 0,
        }
    }

    pub fn upper_lengths(&self) -> Vec<Index> {
        match self {
            Transform::PassThrough { length } => vec![*length],
            Transform::Pad {
                length,
                left,
                right,
            } => vec![left + length + right],
            Transform::Embed { lengths, .. } | Transform::Unmerge { lengths } => lengths.clone(),
            Transform::Merge { lengths } => vec![lengths.iter().product()],
            Transform::Freeze { .. } => Vec::new(),
        }
    }

    /// Only padding can move an index outside its lower dimension.
    pub fn is_always_valid(&self) -> bool {
        !matches!(self, Transform::Pad { .. })
    }

    /// Check the parameters against the lengths of the lower dimensions it consumes.
    pub(crate) fn validate(&self, lower_lengths: &[Index]) -> Result<(), TransformError> {
        let name = self.name();
        if lower_lengths.len() != self.num_lower() {
            return Err(TransformError::LowerArity {
                transform: name,
                expected: self.num_lower(),
                actual: lower_lengths.len(),
            });
        }
        if self.num_lower() > MAX_DIMS || self.num_upper() > MAX_DIMS {
            return Err(TransformError::TooManyDimensions(
                self.num_lower().max(self.num_upper()),
            ));
        }

        let invalid = |reason: String| TransformError::InvalidParameters {
            transform: name,
            reason,
        };
        let positive = |lengths: &[Index]| -> Result<(), TransformError> {
            match lengths.iter().enumerate().find(|(_, l)| **l <= 0) {
                Some((dim, &length)) => Err(TransformError::NonPositiveLength { dim, length }),
                None => Ok(()),
            }
        };

        match self {
            Transform::PassThrough { length } => {
                if *length != lower_lengths[0] {
                    return Err(invalid(format!(
                        "length {} does not match lower length {}",
                        length, lower_lengths[0]
                    )));
                }
            }
            Transform::Pad {
                length,
                left,
                right,
            } => {
                if *length != lower_lengths[0] {
                    return Err(invalid(format!(
                        "length {} does not match lower length {}",
                        length, lower_lengths[0]
                    )));
                }
                if *left < 0 || *right < 0 {
                    return Err(invalid(format!(
                        "negative padding (left {left}, right {right})"
                    )));
                }
            }
            Transform::Embed {
                lengths,
                coefficients,
                offset,
            } => {
                if lengths.is_empty() || lengths.len() != coefficients.len() {
                    return Err(invalid(format!(
                        "{} lengths but {} coefficients",
                        lengths.len(),
                        coefficients.len()
                    )));
                }
                positive(lengths.as_slice())?;
                if *offset < 0 || coefficients.iter().any(|c| *c < 0) {
                    return Err(invalid("negative offset or coefficient".to_string()));
                }
                let reach = lengths
                    .iter()
                    .zip(coefficients)
                    .try_fold(*offset, |acc, (l, c)| {
                        (l - 1).checked_mul(*c).and_then(|x| x.checked_add(acc))
                    })
                    .ok_or_else(|| invalid("reachable offset overflows".to_string()))?;
                if reach >= lower_lengths[0] {
                    return Err(invalid(format!(
                        "reaches index {} of a lower dimension of length {}",
                        reach, lower_lengths[0]
                    )));
                }
            }
            Transform::Merge { lengths } => {
                if lengths.is_empty() {
                    return Err(invalid("nothing to merge".to_string()));
                }
                positive(lengths.as_slice())?;
                if lengths.as_slice() != lower_lengths {
                    return Err(invalid(format!(
                        "lengths {lengths:?} do not match lower lengths {lower_lengths:?}"
                    )));
                }
            }
            Transform::Unmerge { lengths } => {
                if lengths.is_empty() {
                    return Err(invalid("nothing to unmerge".to_string()));
                }
                positive(lengths.as_slice())?;
                let product = lengths
                    .iter()
                    .try_fold(1 as Index, |acc, l| acc.checked_mul(*l));
                if product != Some(lower_lengths[0]) {
                    return Err(TransformError::InexactUnmerge {
                        length: lower_lengths[0],
                        factors: lengths.clone(),
                    });
                }
            }
            Transform::Freeze { index } => {
                if *index < 0 || *index >= lower_lengths[0] {
                    return Err(TransformError::IndexOutOfRange {
                        dim: 0,
                        index: *index,
                        length: lower_lengths[0],
                    });
                }
            }
        }
        Ok(())
    }

    /// Forward map: compute the lower index from the upper index.
    pub fn lower_index(&self, upper: &[Index], lower: &mut [Index]) {
        match self {
            Transform::PassThrough { .. } => lower[0] = upper[0],
            Transform::Pad { left, .. } => lower[0] = upper[0] - left,
            Transform::Embed {
                coefficients,
                offset,
                ..
            } => {
                lower[0] = offset
                    + upper
                        .iter()
                        .zip(coefficients)
                        .map(|(u, c)| u * c)
                        .sum::<Index>();
            }
            Transform::Merge { lengths } => {
                let mut rest = upper[0];
                for i in (1..lengths.len()).rev() {
                    lower[i] = rest % lengths[i];
                    rest /= lengths[i];
                }
                lower[0] = rest;
            }
            Transform::Unmerge { lengths } => {
                let mut linear = 0;
                for (u, l) in upper.iter().zip(lengths) {
                    linear = linear * l + u;
                }
                lower[0] = linear;
            }
            Transform::Freeze { index } => lower[0] = *index,
        }
    }

    /// Decode: compute the upper index that maps onto `lower`.
    pub fn upper_index(&self, lower: &[Index], upper: &mut [Index]) -> Result<(), TransformError> {
        let not_decodable = || TransformError::NotDecodable {
            transform: self.name(),
            index: lower[0],
        };
        match self {
            Transform::PassThrough { .. } => upper[0] = lower[0],
            Transform::Pad { left, .. } => upper[0] = lower[0] + left,
            Transform::Embed {
                lengths,
                coefficients,
                offset,
            } => {
                // greedy decode from the largest coefficient, verified by re-encoding
                let mut order: Vec<usize> = (0..lengths.len()).collect();
                order.sort_by_key(|&i| std::cmp::Reverse(coefficients[i]));
                let mut rest = lower[0] - offset;
                if rest < 0 {
                    return Err(not_decodable());
                }
                for i in order {
                    let c = coefficients[i];
                    upper[i] = if c == 0 {
                        if lengths[i] > 1 {
                            return Err(not_decodable());
                        }
                        0
                    } else {
                        (rest / c).min(lengths[i] - 1)
                    };
                    rest -= upper[i] * c;
                }
                if rest != 0 {
                    return Err(not_decodable());
                }
            }
            Transform::Merge { lengths } => {
                let mut linear = 0;
                for (v, l) in lower.iter().zip(lengths) {
                    linear = linear * l + v;
                }
                upper[0] = linear;
            }
            Transform::Unmerge { lengths } => {
                let mut rest = lower[0];
                for i in (1..lengths.len()).rev() {
                    upper[i] = rest % lengths[i];
                    rest /= lengths[i];
                }
                upper[0] = rest;
            }
            Transform::Freeze { index } => {
                if lower[0] != *index {
                    return Err(not_decodable());
                }
            }
        }
        Ok(())
    }

    /// Incremental update.
    ///
    /// `lower` holds the lower index matching the upper index *before* the move and is
    /// updated in place; `lower_diff` receives the per-dimension change.
    pub fn update_lower_index(
        &self,
        upper_diff: &[Index],
        lower: &mut [Index],
        lower_diff: &mut [Index],
    ) {
        match self {
            Transform::PassThrough { .. } | Transform::Pad { .. } => {
                lower_diff[0] = upper_diff[0];
                lower[0] += upper_diff[0];
            }
            Transform::Embed { coefficients, .. } => {
                let d = upper_diff
                    .iter()
                    .zip(coefficients)
                    .map(|(u, c)| u * c)
                    .sum::<Index>();
                lower_diff[0] = d;
                lower[0] += d;
            }
            Transform::Unmerge { lengths } => {
                let mut d = 0;
                for (u, l) in upper_diff.iter().zip(lengths) {
                    d = d * l + u;
                }
                lower_diff[0] = d;
                lower[0] += d;
            }
            Transform::Merge { lengths } => {
                let n = lengths.len();
                let diff = upper_diff[0];
                if diff == 0 {
                    lower_diff[..n].fill(0);
                    return;
                }

                // split |diff| into row-major digits
                let mut digits = [0 as Index; MAX_DIMS];
                let mut rest = diff.abs();
                for i in (1..n).rev() {
                    digits[i] = rest % lengths[i];
                    rest /= lengths[i];
                }
                digits[0] = rest;

                if diff > 0 {
                    let mut carry = 0;
                    for i in (1..n).rev() {
                        let mut v = lower[i] + digits[i] + carry;
                        carry = 0;
                        if v >= lengths[i] {
                            v -= lengths[i];
                            carry = 1;
                        }
                        lower_diff[i] = v - lower[i];
                        lower[i] = v;
                    }
                    lower_diff[0] = digits[0] + carry;
                    lower[0] += lower_diff[0];
                } else {
                    let mut borrow = 0;
                    for i in (1..n).rev() {
                        let mut v = lower[i] - digits[i] - borrow;
                        borrow = 0;
                        if v < 0 {
                            v += lengths[i];
                            borrow = 1;
                        }
                        lower_diff[i] = v - lower[i];
                        lower[i] = v;
                    }
                    lower_diff[0] = -(digits[0] + borrow);
                    lower[0] += lower_diff[0];
                }
            }
            Transform::Freeze { .. } => lower_diff[0] = 0,
        }
    }

    /// Whether a lower index produced by this transform addresses real data.
    pub fn is_valid_lower(&self, lower: &[Index]) -> bool {
        match self {
            Transform::Pad { length, .. } => lower[0] >= 0 && lower[0] < *length,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(4, 3, 6)]
    #[case(6, 3, 6)]
    #[case(1, 16, 16)]
    #[case(17, 16, 32)]
    fn test_right_pad_lengths(#[case] length: Index, #[case] tile: Index, #[case] padded: Index) {
        let pad = Transform::right_pad_to_multiple(length, tile);
        assert_eq!(pad.upper_lengths(), vec![padded]);
        assert!(pad.validate(&[length]).is_ok());

        let mut lower = [0];
        pad.lower_index(&[padded - 1], &mut lower);
        assert_eq!(pad.is_valid_lower(&lower), padded - 1 < length);
    }

    #[test]
    fn test_merge_carry_and_borrow() {
        let merge = Transform::merge(vec![3, 4, 5]);
        let mut lower = [0; 3];
        merge.lower_index(&[17], &mut lower);
        assert_eq!(lower, [0, 3, 2]);

        let mut diff = [0; 3];
        merge.update_lower_index(&[9], &mut lower, &mut diff);
        let mut expected = [0; 3];
        merge.lower_index(&[26], &mut expected);
        assert_eq!(lower, expected);
        assert_eq!(diff, [1, -2, -1]);

        merge.update_lower_index(&[-23], &mut lower, &mut diff);
        merge.lower_index(&[3], &mut expected);
        assert_eq!(lower, expected);
    }

    #[test]
    fn test_unmerge_requires_exact_factoring() {
        assert!(Transform::unmerge(vec![2, 6]).validate(&[12]).is_ok());
        assert!(matches!(
            Transform::unmerge(vec![5, 3]).validate(&[12]),
            Err(TransformError::InexactUnmerge { length: 12, .. })
        ));
    }

    #[test]
    fn test_embed_decode() {
        let embed = Transform::embed_with_offset(vec![2, 3], vec![10, 2], 1);
        let mut lower = [0];
        embed.lower_index(&[1, 2], &mut lower);
        assert_eq!(lower[0], 15);

        let mut upper = [0; 2];
        embed.upper_index(&lower, &mut upper).unwrap();
        assert_eq!(upper, [1, 2]);

        assert!(embed.upper_index(&[16], &mut upper).is_err());
        assert!(embed.validate(&[16]).is_ok());
        assert!(embed.validate(&[15]).is_err());
    }

    #[test]
    fn test_freeze() {
        let freeze = Transform::freeze(2);
        assert_eq!(freeze.num_upper(), 0);
        assert!(freeze.validate(&[3]).is_ok());
        assert!(freeze.validate(&[2]).is_err());
        let mut lower = [0];
        freeze.lower_index(&[], &mut lower);
        assert_eq!(lower[0], 2);
        assert!(freeze.upper_index(&[1], &mut []).is_err());
    }
}
