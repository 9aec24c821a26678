// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytemuck::Pod;

use crate::buffer::{BufferResource, DefaultOobPolicy, OobPolicy, VECTOR_WIDTHS};
use crate::descriptor::TensorDescriptor;
use crate::error::{KernelError, Result};
use crate::transform::{Coordinate, CoordinateStep, Index};

#[derive(Debug, Clone)]
struct LaneAccess {
    coord: Coordinate,
    staging_offset: usize,
}

/// A `rows x cols` window over a rank-2 descriptor, split into vector accesses
/// distributed round-robin over the lanes of a group.
///
/// Access `a` belongs to lane `a % block_size`. Every access keeps its own coordinate,
/// so moving the window is one incremental step per access. Vectors run along the
/// contiguous last dimension; callers guarantee (through argument validation) that a
/// vector never straddles the boundary of the unpadded extent, so the validity of its
/// first element stands for the whole vector.
#[derive(Debug, Clone)]
pub struct TileWindow<'a, T: Pod, P: OobPolicy = DefaultOobPolicy> {
    desc: &'a TensorDescriptor,
    resource: BufferResource<'a, T, P>,
    base: Index,
    origin: [Index; 2],
    rows: usize,
    cols: usize,
    vector_width: usize,
    lanes: Vec<Vec<LaneAccess>>,
}

impl<'a, T: Pod, P: OobPolicy> TileWindow<'a, T, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        desc: &'a TensorDescriptor,
        resource: BufferResource<'a, T, P>,
        base: Index,
        origin: [Index; 2],
        rows: usize,
        cols: usize,
        vector_width: usize,
        block_size: usize,
    ) -> Result<Self> {
        if desc.rank() != 2 {
            return Err(KernelError::Configuration(format!(
                "tile windows need a rank-2 descriptor, got rank {}",
                desc.rank()
            )));
        }
        if !VECTOR_WIDTHS.contains(&vector_width) || cols % vector_width != 0 || block_size == 0
        {
            return Err(KernelError::Configuration(format!(
                "{cols} columns cannot be split into vectors of {vector_width} over {block_size} lanes"
            )));
        }

        let vectors_per_row = cols / vector_width;
        let total = rows * vectors_per_row;
        let mut lanes = Vec::with_capacity(block_size);
        for lane in 0..block_size {
            let accesses = (lane..total)
                .step_by(block_size)
                .map(|access| {
                    let row = access / vectors_per_row;
                    let col = (access % vectors_per_row) * vector_width;
                    let coord = desc
                        .make_coordinate(&[origin[0] + row as Index, origin[1] + col as Index])?;
                    Ok(LaneAccess {
                        coord,
                        staging_offset: row * cols + col,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            lanes.push(accesses);
        }

        Ok(Self {
            desc,
            resource,
            base,
            origin,
            rows,
            cols,
            vector_width,
            lanes,
        })
    }

    pub fn origin(&self) -> [Index; 2] {
        self.origin
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector accesses issued by `lane`.
    pub fn accesses_of(&self, lane: usize) -> usize {
        self.lanes.get(lane).map_or(0, Vec::len)
    }

    pub fn make_step(&self, diff: [Index; 2]) -> Result<CoordinateStep> {
        Ok(self.desc.make_step(&diff)?)
    }

    /// Slide the window; every lane moves its coordinates incrementally.
    pub fn move_window(&mut self, step: &CoordinateStep) {
        let diff = step.top_diff();
        self.origin[0] += diff[0];
        self.origin[1] += diff[1];
        for access in self.lanes.iter_mut().flatten() {
            self.desc.move_coordinate(&mut access.coord, step);
        }
    }

    fn accesses(&self) -> impl Iterator<Item = (Index, bool, usize)> + '_ {
        self.lanes.iter().flatten().map(|access| {
            (
                self.base + self.desc.coordinate_offset(&access.coord),
                self.desc.coordinate_is_valid(&access.coord),
                access.staging_offset,
            )
        })
    }

    /// Transfer the window into `dst`, laid out row-major `rows x cols`.
    ///
    /// Elements outside the unpadded tensor read as zero.
    pub fn load(&self, dst: &mut [T]) {
        debug_assert!(dst.len() >= self.len());
        let vw = self.vector_width;
        for (offset, valid, at) in self.accesses() {
            self.resource.load_into(offset, valid, &mut dst[at..at + vw]);
        }
    }

    /// Write `src`, laid out row-major `rows x cols`, through the window.
    ///
    /// Writes to elements outside the unpadded tensor are dropped.
    pub fn store(&self, src: &[T]) {
        debug_assert!(src.len() >= self.len());
        let vw = self.vector_width;
        for (offset, valid, at) in self.accesses() {
            self.resource.store_from(&src[at..at + vw], offset, valid);
        }
    }
}

impl<P: OobPolicy> TileWindow<'_, f32, P> {
    /// Atomically add `src` into the window.
    pub fn atomic_add(&self, src: &[f32]) {
        debug_assert!(src.len() >= self.len());
        let vw = self.vector_width;
        for (offset, valid, at) in self.accesses() {
            for (i, value) in src[at..at + vw].iter().enumerate() {
                self.resource.atomic_add([*value], offset + i as Index, valid);
            }
        }
    }
}
