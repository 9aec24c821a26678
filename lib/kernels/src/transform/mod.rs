// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Coordinate transforms
//!
//! A [`TransformGraph`] converts a logical N-dimensional index (the *top* space) into
//! a memory index (the *bottom* space) through a chain of [`Transform`]s. Graphs are
//! built stage by stage with [`TransformGraph::transform`]; malformed chains are
//! rejected there, so a constructed graph can be evaluated without further checks.
//!
//! A [`Coordinate`] caches every intermediate value of the chain. Moving it by a
//! precomputed [`CoordinateStep`] updates only the transforms the move reaches, which
//! is how tile windows walk the reduction dimension.
//!
//! ```text
//!   top     [m_pad, k_pad]           (Pad, Pad)
//!   stage   [m, k]                   (Embed: m * stride_m + k * stride_k)
//!   bottom  [element space]
//! ```

mod coordinate;
mod graph;
mod primitive;

pub use coordinate::{Coordinate, CoordinateStep};
pub use graph::{Step, TransformGraph};
pub use primitive::Transform;

/// Signed index type used for every length, stride and offset.
pub type Index = i64;

/// Maximum number of dimensions a single transform may consume or produce.
pub const MAX_DIMS: usize = 8;

/// Number of `tile`-sized tiles covering `length`; both must be positive.
#[inline]
pub fn tiles_covering(length: Index, tile: Index) -> Index {
    (length + tile - 1) / tile
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// `[a, b, c]` packed, merge `b` and `c`, then split the merged index again as
    /// `[c, b]`-major and merge everything.
    fn invertible_chain(a: Index, b: Index, c: Index) -> TransformGraph {
        TransformGraph::new(&[a * b * c])
            .unwrap()
            .transform(vec![Step::new(
                Transform::embed(vec![a, b, c], vec![b * c, c, 1]),
                [0],
                [0, 1, 2],
            )])
            .unwrap()
            .transform(vec![
                Step::new(Transform::pass_through(a), [0], [0]),
                Step::new(Transform::merge(vec![b, c]), [1, 2], [1]),
            ])
            .unwrap()
            .transform(vec![
                Step::new(Transform::pass_through(a), [0], [1]),
                Step::new(Transform::unmerge(vec![c, b]), [1], [0, 2]),
            ])
            .unwrap()
    }

    #[test]
    fn test_tiles_covering() {
        assert_eq!(tiles_covering(1, 16), 1);
        assert_eq!(tiles_covering(16, 16), 1);
        assert_eq!(tiles_covering(17, 16), 2);
        assert_eq!(tiles_covering(45, 32), 2);
        assert_eq!(tiles_covering(64, 1), 64);
    }

    proptest! {
        #[test]
        fn tiles_cover_without_overshoot(length in 1i64..100_000, tile in 1i64..512) {
            let tiles = tiles_covering(length, tile);
            prop_assert!(tiles * tile >= length);
            prop_assert!((tiles - 1) * tile < length);
        }

        #[test]
        fn decode_inverts_encode(
            a in 1i64..6, b in 1i64..6, c in 1i64..6,
            seed in any::<u64>(),
        ) {
            let graph = invertible_chain(a, b, c);
            let lengths = graph.top_lengths();
            let mut s = seed;
            let top: Vec<Index> = lengths
                .iter()
                .map(|&l| {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    ((s >> 33) % l as u64) as Index
                })
                .collect();

            let bottom = graph.bottom_index(&top).unwrap();
            prop_assert_eq!(graph.top_index(&bottom).unwrap(), top);
        }

        #[test]
        fn incremental_moves_match_recompute(
            a in 1i64..5, b in 1i64..5, c in 1i64..5,
            moves in proptest::collection::vec((0usize..3, -3i64..4), 1..24),
        ) {
            let graph = invertible_chain(a, b, c);
            let lengths = graph.top_lengths();
            let mut top = vec![0 as Index; lengths.len()];
            let mut coord = graph.make_coordinate(&top).unwrap();

            for (dim, delta) in moves {
                let target = top[dim] + delta;
                if target < 0 || target >= lengths[dim] {
                    continue;
                }
                let mut diff = vec![0; lengths.len()];
                diff[dim] = delta;
                graph.move_coordinate(&mut coord, &graph.make_step(&diff).unwrap());
                top[dim] = target;

                let fresh = graph.make_coordinate(&top).unwrap();
                prop_assert_eq!(graph.coordinate_top(&coord), top.clone());
                prop_assert_eq!(
                    graph.coordinate_offset(&coord),
                    graph.coordinate_offset(&fresh)
                );
            }
        }
    }
}
