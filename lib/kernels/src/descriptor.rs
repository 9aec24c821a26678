// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tensor descriptors.
//!
//! A [`TensorDescriptor`] owns one [`TransformGraph`] whose bottom space is the flat
//! element space of a buffer, plus the size of that space. Descriptors are built once
//! per kernel invocation from raw lengths and strides and are read-only afterwards.

use std::ops::Range;

use crate::error::{DescriptorError, TransformError};
use crate::transform::{Coordinate, CoordinateStep, Index, MAX_DIMS, Step, Transform, TransformGraph};

#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    graph: TransformGraph,
    element_space_size: Index,
}

impl TensorDescriptor {
    /// Strided descriptor over `lengths` with the given element `strides`.
    ///
    /// Lengths must be positive. Strides must be non-negative and nonzero for every
    /// dimension longer than one.
    pub fn naive(lengths: &[Index], strides: &[Index]) -> Result<Self, DescriptorError> {
        if lengths.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if lengths.len() != strides.len() {
            return Err(DescriptorError::RankMismatch {
                lengths: lengths.len(),
                strides: strides.len(),
            });
        }
        if lengths.len() > MAX_DIMS {
            return Err(TransformError::TooManyDimensions(lengths.len()).into());
        }

        let mut element_space_size: Index = 1;
        for (dim, (&length, &stride)) in lengths.iter().zip(strides).enumerate() {
            if length <= 0 {
                return Err(DescriptorError::NonPositiveLength { dim, length });
            }
            if stride < 0 || (stride == 0 && length > 1) {
                return Err(DescriptorError::InvalidStride {
                    dim,
                    stride,
                    length,
                });
            }
            element_space_size = (length - 1)
                .checked_mul(stride)
                .and_then(|reach| reach.checked_add(element_space_size))
                .ok_or(DescriptorError::ElementSpaceOverflow)?;
        }

        let graph = TransformGraph::new(&[element_space_size])?.transform(vec![Step::new(
            Transform::embed(lengths, strides),
            [0],
            (0..lengths.len()).collect::<Vec<_>>(),
        )])?;

        Ok(Self {
            graph,
            element_space_size,
        })
    }

    /// Row-major packed descriptor.
    pub fn packed(lengths: &[Index]) -> Result<Self, DescriptorError> {
        let mut strides = vec![1 as Index; lengths.len()];
        for i in (0..lengths.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1]
                .checked_mul(lengths[i + 1].max(1))
                .ok_or(DescriptorError::ElementSpaceOverflow)?;
        }
        Self::naive(lengths, &strides)
    }

    /// Append a stage of transforms; the element space is unchanged.
    pub fn transform(&self, steps: Vec<Step>) -> Result<Self, DescriptorError> {
        Ok(Self {
            graph: self.graph.transform(steps)?,
            element_space_size: self.element_space_size,
        })
    }

    /// Right pad each dimension with a tile size to the next multiple of that tile.
    /// `None` leaves the dimension untouched.
    pub fn pad_to_multiples(&self, tiles: &[Option<Index>]) -> Result<Self, DescriptorError> {
        let lengths = self.lengths();
        if tiles.len() != lengths.len() {
            return Err(TransformError::RankMismatch {
                expected: lengths.len(),
                actual: tiles.len(),
            }
            .into());
        }
        let steps = lengths
            .iter()
            .zip(tiles)
            .enumerate()
            .map(|(dim, (&length, tile))| {
                let transform = match tile {
                    Some(t) if *t > 0 => Transform::right_pad_to_multiple(length, *t),
                    Some(t) => {
                        return Err(TransformError::InvalidParameters {
                            transform: "Pad",
                            reason: format!("tile size {t} of dimension {dim} must be positive"),
                        });
                    }
                    None => Transform::pass_through(length),
                };
                Ok(Step::new(transform, [dim], [dim]))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.transform(steps)
    }

    /// Bind `dim` to `index`, removing it from the top space.
    pub fn freeze(&self, dim: usize, index: Index) -> Result<Self, DescriptorError> {
        let lengths = self.lengths();
        self.check_dim(dim)?;
        let mut steps = Vec::with_capacity(lengths.len());
        let mut next = 0;
        for (d, &length) in lengths.iter().enumerate() {
            if d == dim {
                steps.push(Step::new(Transform::freeze(index), [d], []));
            } else {
                steps.push(Step::new(Transform::pass_through(length), [d], [next]));
                next += 1;
            }
        }
        self.transform(steps)
    }

    /// Merge the adjacent dimensions `dims` into one row-major dimension.
    pub fn merge(&self, dims: Range<usize>) -> Result<Self, DescriptorError> {
        let lengths = self.lengths();
        if dims.is_empty() {
            return Err(TransformError::InvalidParameters {
                transform: "Merge",
                reason: "empty dimension range".to_string(),
            }
            .into());
        }
        self.check_dim(dims.end - 1)?;

        let mut steps = Vec::new();
        for d in 0..dims.start {
            steps.push(Step::new(Transform::pass_through(lengths[d]), [d], [d]));
        }
        steps.push(Step::new(
            Transform::merge(lengths[dims.clone()].to_vec()),
            dims.clone().collect::<Vec<_>>(),
            [dims.start],
        ));
        let removed = dims.len() - 1;
        for d in dims.end..lengths.len() {
            steps.push(Step::new(Transform::pass_through(lengths[d]), [d], [d - removed]));
        }
        self.transform(steps)
    }

    /// Split `dim` into `factors`, which must multiply to its length.
    pub fn unmerge(&self, dim: usize, factors: &[Index]) -> Result<Self, DescriptorError> {
        let lengths = self.lengths();
        self.check_dim(dim)?;
        let added = factors.len().saturating_sub(1);

        let mut steps = Vec::new();
        for (d, &length) in lengths.iter().enumerate() {
            if d == dim {
                steps.push(Step::new(
                    Transform::unmerge(factors.to_vec()),
                    [d],
                    (d..d + factors.len()).collect::<Vec<_>>(),
                ));
            } else {
                let position = if d < dim { d } else { d + added };
                steps.push(Step::new(Transform::pass_through(length), [d], [position]));
            }
        }
        self.transform(steps)
    }

    fn check_dim(&self, dim: usize) -> Result<(), DescriptorError> {
        let rank = self.rank();
        if dim >= rank {
            return Err(DescriptorError::DimensionOutOfRange { dim, rank });
        }
        Ok(())
    }

    pub fn graph(&self) -> &TransformGraph {
        &self.graph
    }

    pub fn rank(&self) -> usize {
        self.graph.top_rank()
    }

    pub fn lengths(&self) -> Vec<Index> {
        self.graph.top_lengths()
    }

    pub fn length(&self, dim: usize) -> Index {
        self.graph.top_lengths().get(dim).copied().unwrap_or(0)
    }

    /// Number of addressable elements, including everything strides skip over.
    pub fn element_space_size(&self) -> Index {
        self.element_space_size
    }

    /// Linear offset of `top`.
    pub fn offset(&self, top: &[Index]) -> Result<Index, TransformError> {
        Ok(self.graph.bottom_index(top)?[0])
    }

    /// Whether `top` lies inside the top space and outside any padding.
    pub fn is_valid_index(&self, top: &[Index]) -> bool {
        self.graph
            .make_coordinate(top)
            .map(|c| self.graph.coordinate_is_valid(&c))
            .unwrap_or(false)
    }

    /// Offset of the first element of batch `index` along `batch_dim`.
    pub fn batch_offset(&self, batch_dim: usize, index: Index) -> Result<Index, DescriptorError> {
        self.check_dim(batch_dim)?;
        let mut top = vec![0; self.rank()];
        top[batch_dim] = index;
        Ok(self.offset(&top)?)
    }

    pub fn make_coordinate(&self, top: &[Index]) -> Result<Coordinate, TransformError> {
        self.graph.make_coordinate(top)
    }

    pub fn make_step(&self, top_diff: &[Index]) -> Result<CoordinateStep, TransformError> {
        self.graph.make_step(top_diff)
    }

    #[inline]
    pub fn move_coordinate(&self, coord: &mut Coordinate, step: &CoordinateStep) {
        self.graph.move_coordinate(coord, step)
    }

    #[inline]
    pub fn coordinate_offset(&self, coord: &Coordinate) -> Index {
        self.graph.coordinate_offset(coord)
    }

    #[inline]
    pub fn coordinate_is_valid(&self, coord: &Coordinate) -> bool {
        self.graph.coordinate_is_valid(coord)
    }
}
