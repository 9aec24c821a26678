// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{Index, MAX_DIMS, TransformGraph};
use crate::error::TransformError;

/// A cursor into a [`TransformGraph`].
///
/// Holds the value of every hidden dimension so a move only touches the transforms
/// that lie below the moved top dimensions. A coordinate belongs to one lane and is
/// never shared.
#[derive(Debug, Clone)]
pub struct Coordinate {
    hidden: Vec<Index>,
    scratch: Vec<Index>,
}

/// A precomputed top-space delta.
///
/// Records which transforms can observe a nonzero delta so that moving a coordinate
/// skips every other transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateStep {
    top_diff: Vec<Index>,
    active: Vec<bool>,
}

impl CoordinateStep {
    pub fn top_diff(&self) -> &[Index] {
        &self.top_diff
    }
}

impl TransformGraph {
    /// Create a cursor at `top`, which must lie inside the top space.
    pub fn make_coordinate(&self, top: &[Index]) -> Result<Coordinate, TransformError> {
        self.check_top(top)?;
        let mut hidden = vec![0; self.lengths.len()];
        for (&id, &v) in self.top_ids().iter().zip(top) {
            hidden[id] = v;
        }
        self.propagate_down(&mut hidden);
        Ok(Coordinate {
            scratch: vec![0; hidden.len()],
            hidden,
        })
    }

    /// Precompute a move by `top_diff`.
    pub fn make_step(&self, top_diff: &[Index]) -> Result<CoordinateStep, TransformError> {
        if top_diff.len() != self.top_rank() {
            return Err(TransformError::RankMismatch {
                expected: self.top_rank(),
                actual: top_diff.len(),
            });
        }

        let mut moving = vec![false; self.lengths.len()];
        for (&id, &d) in self.top_ids().iter().zip(top_diff) {
            moving[id] = d != 0;
        }
        let mut active = vec![false; self.nodes.len()];
        for (n, node) in self.nodes.iter().enumerate().rev() {
            if node.upper.iter().any(|&id| moving[id]) {
                active[n] = true;
                for &id in &node.lower {
                    moving[id] = true;
                }
            }
        }

        Ok(CoordinateStep {
            top_diff: top_diff.to_vec(),
            active,
        })
    }

    /// Move `coord` by a precomputed step.
    ///
    /// Each active transform converts its upper delta into a lower delta; carries of
    /// merged dimensions are resolved locally. The result is identical to creating a
    /// fresh coordinate at the moved top index.
    pub fn move_coordinate(&self, coord: &mut Coordinate, step: &CoordinateStep) {
        debug_assert_eq!(coord.hidden.len(), self.lengths.len());
        debug_assert_eq!(step.active.len(), self.nodes.len());

        coord.scratch.fill(0);
        for (&id, &d) in self.top_ids().iter().zip(&step.top_diff) {
            coord.scratch[id] = d;
            coord.hidden[id] += d;
        }

        let mut upper_diff = [0 as Index; MAX_DIMS];
        let mut lower = [0 as Index; MAX_DIMS];
        let mut lower_diff = [0 as Index; MAX_DIMS];
        for (node, _) in self
            .nodes
            .iter()
            .zip(&step.active)
            .rev()
            .filter(|(_, active)| **active)
        {
            let (nu, nl) = (node.upper.len(), node.lower.len());
            for (k, &id) in node.upper.iter().enumerate() {
                upper_diff[k] = coord.scratch[id];
            }
            for (k, &id) in node.lower.iter().enumerate() {
                lower[k] = coord.hidden[id];
            }
            node.transform.update_lower_index(
                &upper_diff[..nu],
                &mut lower[..nl],
                &mut lower_diff[..nl],
            );
            for (k, &id) in node.lower.iter().enumerate() {
                coord.hidden[id] = lower[k];
                coord.scratch[id] = lower_diff[k];
            }
        }
    }

    pub fn coordinate_top(&self, coord: &Coordinate) -> Vec<Index> {
        self.top_ids().iter().map(|&id| coord.hidden[id]).collect()
    }

    pub fn coordinate_bottom(&self, coord: &Coordinate) -> Vec<Index> {
        self.bottom.iter().map(|&id| coord.hidden[id]).collect()
    }

    /// Value of the first bottom dimension, the linear offset for descriptors.
    #[inline]
    pub fn coordinate_offset(&self, coord: &Coordinate) -> Index {
        self.bottom.first().map_or(0, |&id| coord.hidden[id])
    }

    /// Whether `coord` addresses real data: the top index lies inside the top space
    /// and no padding transform maps it into its padded region.
    pub fn coordinate_is_valid(&self, coord: &Coordinate) -> bool {
        let top_ok = self
            .top_ids()
            .iter()
            .all(|&id| coord.hidden[id] >= 0 && coord.hidden[id] < self.lengths[id]);
        top_ok
            && self
                .nodes
                .iter()
                .filter(|node| !node.transform.is_always_valid())
                .all(|node| {
                    let mut lower = [0 as Index; MAX_DIMS];
                    for (k, &id) in node.lower.iter().enumerate() {
                        lower[k] = coord.hidden[id];
                    }
                    node.transform.is_valid_lower(&lower[..node.lower.len()])
                })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Step, Transform};
    use super::*;

    fn padded_merged() -> TransformGraph {
        // [3, 5] row-major in memory, dim 1 padded to 8, then merged into one index
        TransformGraph::new(&[15])
            .unwrap()
            .transform(vec![Step::new(
                Transform::embed(vec![3, 5], vec![5, 1]),
                [0],
                [0, 1],
            )])
            .unwrap()
            .transform(vec![
                Step::new(Transform::pass_through(3), [0], [0]),
                Step::new(Transform::right_pad_to_multiple(5, 4), [1], [1]),
            ])
            .unwrap()
            .transform(vec![Step::new(Transform::merge(vec![3, 8]), [0, 1], [0])])
            .unwrap()
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let graph = padded_merged();
        let mut coord = graph.make_coordinate(&[0]).unwrap();
        let forward = graph.make_step(&[3]).unwrap();

        for linear in (3..24).step_by(3) {
            graph.move_coordinate(&mut coord, &forward);
            let fresh = graph.make_coordinate(&[linear]).unwrap();
            assert_eq!(graph.coordinate_bottom(&coord), graph.coordinate_bottom(&fresh));
            assert_eq!(
                graph.coordinate_is_valid(&coord),
                graph.coordinate_is_valid(&fresh)
            );
        }

        let back = graph.make_step(&[-7]).unwrap();
        graph.move_coordinate(&mut coord, &back);
        let fresh = graph.make_coordinate(&[14]).unwrap();
        assert_eq!(graph.coordinate_offset(&coord), graph.coordinate_offset(&fresh));
    }

    #[test]
    fn test_padded_region_is_invalid() {
        let graph = padded_merged();
        // row 1, column 6 lies in the padding
        let coord = graph.make_coordinate(&[8 + 6]).unwrap();
        assert!(!graph.coordinate_is_valid(&coord));
        let coord = graph.make_coordinate(&[8 + 4]).unwrap();
        assert!(graph.coordinate_is_valid(&coord));
        assert_eq!(graph.coordinate_offset(&coord), 9);
    }

    #[test]
    fn test_step_skips_untouched_transforms() {
        let graph = TransformGraph::new(&[12])
            .unwrap()
            .transform(vec![Step::new(
                Transform::embed(vec![3, 4], vec![4, 1]),
                [0],
                [0, 1],
            )])
            .unwrap()
            .transform(vec![
                Step::new(Transform::pass_through(3), [0], [0]),
                Step::new(Transform::pass_through(4), [1], [1]),
            ])
            .unwrap();

        let step = graph.make_step(&[0, 1]).unwrap();
        assert_eq!(step.active, vec![true, false, true]);
        assert!(graph.make_step(&[1]).is_err());
    }
}
