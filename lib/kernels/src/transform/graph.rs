// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{Index, MAX_DIMS, Transform};
use crate::error::TransformError;

/// One transform applied while building a new stage.
///
/// `lower` names positions in the current top space, `upper` names positions in the
/// new top space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transform: Transform,
    pub lower: Vec<usize>,
    pub upper: Vec<usize>,
}

impl Step {
    pub fn new(
        transform: Transform,
        lower: impl Into<Vec<usize>>,
        upper: impl Into<Vec<usize>>,
    ) -> Self {
        Self {
            transform,
            lower: lower.into(),
            upper: upper.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct Node {
    pub(super) transform: Transform,
    /// hidden ids
    pub(super) lower: Vec<usize>,
    pub(super) upper: Vec<usize>,
}

/// An immutable chain of transforms from a top space down to a bottom space.
///
/// Dimensions are identified internally by *hidden ids*. The bottom dimensions are
/// allocated first; every transform allocates fresh ids for its upper dimensions, so
/// each hidden id is produced once and consumed at most once.
#[derive(Debug, Clone)]
pub struct TransformGraph {
    pub(super) nodes: Vec<Node>,
    pub(super) lengths: Vec<Index>,
    pub(super) bottom: Vec<usize>,
    /// visible hidden ids after each stage, `stages[0]` is the bottom space
    pub(super) stages: Vec<Vec<usize>>,
}

impl TransformGraph {
    /// A graph with no transforms whose top and bottom are both `bottom_lengths`.
    pub fn new(bottom_lengths: &[Index]) -> Result<Self, TransformError> {
        if let Some((dim, &length)) = bottom_lengths.iter().enumerate().find(|(_, l)| **l <= 0) {
            return Err(TransformError::NonPositiveLength { dim, length });
        }
        let bottom: Vec<usize> = (0..bottom_lengths.len()).collect();
        Ok(Self {
            nodes: Vec::new(),
            lengths: bottom_lengths.to_vec(),
            stages: vec![bottom.clone()],
            bottom,
        })
    }

    /// Append a stage. Every dimension of the current top space must be consumed by
    /// exactly one step and the steps' upper positions must form `0..rank` of the new
    /// top space.
    pub fn transform(&self, steps: Vec<Step>) -> Result<Self, TransformError> {
        let top = self.top_ids();
        let rank = top.len();

        let mut consumed = vec![false; rank];
        let mut new_rank = 0;
        for step in &steps {
            let t = &step.transform;
            if step.lower.len() != t.num_lower() {
                return Err(TransformError::LowerArity {
                    transform: t.name(),
                    expected: t.num_lower(),
                    actual: step.lower.len(),
                });
            }
            if step.upper.len() != t.num_upper() {
                return Err(TransformError::UpperArity {
                    transform: t.name(),
                    expected: t.num_upper(),
                    actual: step.upper.len(),
                });
            }
            for &position in &step.lower {
                if position >= rank {
                    return Err(TransformError::DanglingDimension { position, rank });
                }
                if consumed[position] {
                    return Err(TransformError::DuplicateLower(position));
                }
                consumed[position] = true;
            }
            new_rank += step.upper.len();
        }
        if let Some(position) = consumed.iter().position(|c| !c) {
            return Err(TransformError::UnconsumedDimension(position));
        }

        let mut slots: Vec<Option<usize>> = vec![None; new_rank];
        let mut graph = self.clone();
        for step in steps {
            let lower: Vec<usize> = step.lower.iter().map(|&p| top[p]).collect();
            let lower_lengths: Vec<Index> = lower.iter().map(|&id| self.lengths[id]).collect();
            step.transform.validate(&lower_lengths)?;

            let mut upper = Vec::with_capacity(step.upper.len());
            for (&position, length) in step.upper.iter().zip(step.transform.upper_lengths()) {
                if position >= new_rank {
                    return Err(TransformError::DanglingDimension {
                        position,
                        rank: new_rank,
                    });
                }
                if slots[position].is_some() {
                    return Err(TransformError::DuplicateUpper(position));
                }
                let id = graph.lengths.len();
                graph.lengths.push(length);
                slots[position] = Some(id);
                upper.push(id);
            }

            graph.nodes.push(Node {
                transform: step.transform,
                lower,
                upper,
            });
        }

        let stage = slots
            .iter()
            .enumerate()
            .map(|(position, slot)| slot.ok_or(TransformError::UpperGap(position)))
            .collect::<Result<Vec<_>, _>>()?;
        graph.stages.push(stage);
        Ok(graph)
    }

    pub(super) fn top_ids(&self) -> &[usize] {
        // stages always holds at least the bottom stage
        self.stages.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn top_rank(&self) -> usize {
        self.top_ids().len()
    }

    pub fn bottom_rank(&self) -> usize {
        self.bottom.len()
    }

    pub fn top_lengths(&self) -> Vec<Index> {
        self.top_ids().iter().map(|&id| self.lengths[id]).collect()
    }

    pub fn bottom_lengths(&self) -> Vec<Index> {
        self.bottom.iter().map(|&id| self.lengths[id]).collect()
    }

    /// Number of stages including the bottom stage.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Lengths of the visible space after `stage` stages (0 is the bottom space).
    pub fn stage_lengths(&self, stage: usize) -> Option<Vec<Index>> {
        self.stages
            .get(stage)
            .map(|ids| ids.iter().map(|&id| self.lengths[id]).collect())
    }

    pub fn transforms(&self) -> impl Iterator<Item = &Transform> {
        self.nodes.iter().map(|n| &n.transform)
    }

    pub(super) fn check_top(&self, top: &[Index]) -> Result<(), TransformError> {
        let lengths = self.top_lengths();
        if top.len() != lengths.len() {
            return Err(TransformError::RankMismatch {
                expected: lengths.len(),
                actual: top.len(),
            });
        }
        for (dim, (&index, &length)) in top.iter().zip(&lengths).enumerate() {
            if index < 0 || index >= length {
                return Err(TransformError::IndexOutOfRange { dim, index, length });
            }
        }
        Ok(())
    }

    /// Run the forward map over every node, filling `hidden` from its top values.
    pub(super) fn propagate_down(&self, hidden: &mut [Index]) {
        let mut upper = [0 as Index; MAX_DIMS];
        let mut lower = [0 as Index; MAX_DIMS];
        for node in self.nodes.iter().rev() {
            for (k, &id) in node.upper.iter().enumerate() {
                upper[k] = hidden[id];
            }
            let nl = node.lower.len();
            node.transform
                .lower_index(&upper[..node.upper.len()], &mut lower[..nl]);
            for (k, &id) in node.lower.iter().enumerate() {
                hidden[id] = lower[k];
            }
        }
    }

    /// Full forward map of a top index.
    pub fn bottom_index(&self, top: &[Index]) -> Result<Vec<Index>, TransformError> {
        self.check_top(top)?;
        let mut hidden = vec![0; self.lengths.len()];
        for (&id, &v) in self.top_ids().iter().zip(top) {
            hidden[id] = v;
        }
        self.propagate_down(&mut hidden);
        Ok(self.bottom.iter().map(|&id| hidden[id]).collect())
    }

    /// Decode a bottom index back to the top index that produces it.
    pub fn top_index(&self, bottom: &[Index]) -> Result<Vec<Index>, TransformError> {
        if bottom.len() != self.bottom.len() {
            return Err(TransformError::RankMismatch {
                expected: self.bottom.len(),
                actual: bottom.len(),
            });
        }
        let mut hidden = vec![0; self.lengths.len()];
        for (dim, (&id, &v)) in self.bottom.iter().zip(bottom).enumerate() {
            if v < 0 || v >= self.lengths[id] {
                return Err(TransformError::IndexOutOfRange {
                    dim,
                    index: v,
                    length: self.lengths[id],
                });
            }
            hidden[id] = v;
        }

        let mut upper = [0 as Index; MAX_DIMS];
        let mut lower = [0 as Index; MAX_DIMS];
        for node in &self.nodes {
            for (k, &id) in node.lower.iter().enumerate() {
                lower[k] = hidden[id];
            }
            let nu = node.upper.len();
            node.transform
                .upper_index(&lower[..node.lower.len()], &mut upper[..nu])?;
            for (k, &id) in node.upper.iter().enumerate() {
                hidden[id] = upper[k];
            }
        }

        let top = self.top_ids().iter().map(|&id| hidden[id]).collect::<Vec<_>>();
        self.check_top(&top)?;
        Ok(top)
    }
}
