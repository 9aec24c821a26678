// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytemuck::Pod;

use crate::buffer::{BufferResource, OobPolicy};
use crate::descriptor::TensorDescriptor;
use crate::element::ElementwiseOperation;
use crate::error::Result;
use crate::memory::GlobalBuffer;
use crate::pipeline::{AccumulationTile, PipelineStats, ReductionPipeline, TileWindow, gemm_tile_nk};
use crate::transform::Index;
use crate::types::DataType;

/// A batched `[G, rows, cols]` tensor prepared for tiled access.
///
/// Rows and columns are right padded to their tile sizes. The batch dimension is
/// frozen at zero to obtain the per-batch `[rows, cols]` view; the base offset of
/// batch `g` comes from the batched descriptor, so arbitrary batch strides work.
#[derive(Debug, Clone)]
pub(crate) struct BatchedOperand<'a, T: Pod> {
    buffer: &'a GlobalBuffer<T>,
    batched: TensorDescriptor,
    matrix: TensorDescriptor,
}

impl<'a, T: Pod> BatchedOperand<'a, T> {
    pub(crate) fn new(
        buffer: &'a GlobalBuffer<T>,
        desc: &TensorDescriptor,
        row_tile: Index,
        col_tile: Index,
    ) -> Result<Self> {
        let batched = desc.pad_to_multiples(&[None, Some(row_tile), Some(col_tile)])?;
        let matrix = batched.freeze(0, 0)?;
        Ok(Self {
            buffer,
            batched,
            matrix,
        })
    }

    /// Padded `[rows, cols]` extents.
    pub(crate) fn padded(&self) -> (Index, Index) {
        (self.matrix.length(0), self.matrix.length(1))
    }

    pub(crate) fn batch_offset(&self, batch: Index) -> Result<Index> {
        Ok(self.batched.batch_offset(0, batch)?)
    }

    /// The group's resource over the whole buffer.
    pub(crate) fn resource<P: OobPolicy>(&self) -> Result<BufferResource<'a, T, P>> {
        Ok(BufferResource::whole(self.buffer)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn window<P: OobPolicy>(
        &self,
        resource: BufferResource<'a, T, P>,
        batch: Index,
        origin: [Index; 2],
        rows: usize,
        cols: usize,
        vector_width: usize,
        block_size: usize,
    ) -> Result<TileWindow<'_, T, P>> {
        TileWindow::new(
            &self.matrix,
            resource,
            self.batch_offset(batch)?,
            origin,
            rows,
            cols,
            vector_width,
            block_size,
        )
    }
}

/// `acc += a_op(A) · b_op(B)ᵀ` over the whole contiguous extent of two windows.
///
/// Both windows start at column zero and advance by their own width after every
/// transfer; each pipeline slot stages the `A` tile followed by the `B` tile.
pub(crate) fn reduce_nk<T, P, Opa, Opb>(
    pipeline: &mut ReductionPipeline<T>,
    a: &mut TileWindow<'_, T, P>,
    b: &mut TileWindow<'_, T, P>,
    num_k_tiles: usize,
    acc: &mut AccumulationTile<T::Acc>,
    a_op: &Opa,
    b_op: &Opb,
) -> Result<PipelineStats>
where
    T: DataType,
    P: OobPolicy,
    Opa: ElementwiseOperation<T::Acc>,
    Opb: ElementwiseOperation<T::Acc>,
{
    let k = a.cols();
    let a_step = a.make_step([0, k as Index])?;
    let b_step = b.make_step([0, k as Index])?;
    let a_len = a.len();

    let stats = pipeline.run(
        num_k_tiles,
        |i, slot| {
            if i > 0 {
                a.move_window(&a_step);
                b.move_window(&b_step);
            }
            let (a_slot, b_slot) = slot.split_at_mut(a_len);
            a.load(a_slot);
            b.load(b_slot);
        },
        |_, slot| {
            let (a_tile, b_tile) = slot.split_at(a_len);
            gemm_tile_nk(acc, a_tile, b_tile, k, a_op, b_op);
        },
    );
    Ok(stats)
}
