// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batched GEMM: `C[g] = c_op(acc_op(a_op(A[g]) · b_op(B[g])ᵀ))`.
//!
//! `A` is `[G, M, K]`, `B` is `[G, N, K]` and `C` is `[G, M, N]`, each with arbitrary
//! strides as long as the reduction dimension of `A`/`B` and the `N` dimension of `C`
//! are contiguous whenever they are vectorised.

use std::ops::Range;

use super::operand::{BatchedOperand, reduce_nk};
use super::validation::{check_fits, check_lengths, check_rank, check_vector_access};
use super::{KernelLauncher, LaunchState};
use crate::buffer::OobPolicy;
use crate::descriptor::TensorDescriptor;
use crate::element::ElementOp;
use crate::error::{KernelError, Result};
use crate::mask::{CausalMask, MaskFill, MaskingSpec, TileMaskClass};
use crate::memory::GlobalBuffer;
use crate::pipeline::{AccumulationTile, ReductionPipeline, TileConfig};
use crate::tile_map::{Block2TileMap, ReplayMode, TileIndex};
use crate::transform::Index;
use crate::types::DataType;

pub(crate) const KERNEL_NAME: &str = "batched_gemm";

#[derive(Debug, Clone)]
pub struct GemmArgs<'a, T: DataType> {
    pub a: &'a GlobalBuffer<T>,
    pub a_desc: TensorDescriptor,
    pub b: &'a GlobalBuffer<T>,
    pub b_desc: TensorDescriptor,
    pub c: &'a GlobalBuffer<T>,
    pub c_desc: TensorDescriptor,
    pub batch_count: Index,
    /// Causal masking of the `M x N` output; masked elements are written as zero
    pub masking: MaskingSpec,
    pub a_op: ElementOp,
    pub b_op: ElementOp,
    pub acc_op: ElementOp,
    pub c_op: ElementOp,
}

impl<'a, T: DataType> GemmArgs<'a, T> {
    /// Unmasked GEMM with pass-through operators; the batch count is taken from `c_desc`.
    pub fn new(
        a: &'a GlobalBuffer<T>,
        a_desc: TensorDescriptor,
        b: &'a GlobalBuffer<T>,
        b_desc: TensorDescriptor,
        c: &'a GlobalBuffer<T>,
        c_desc: TensorDescriptor,
    ) -> Self {
        let batch_count = c_desc.lengths().first().copied().unwrap_or(0);
        Self {
            a,
            a_desc,
            b,
            b_desc,
            c,
            c_desc,
            batch_count,
            masking: MaskingSpec::MaskDisabled,
            a_op: ElementOp::PassThrough,
            b_op: ElementOp::PassThrough,
            acc_op: ElementOp::PassThrough,
            c_op: ElementOp::PassThrough,
        }
    }

    pub fn with_masking(mut self, masking: MaskingSpec) -> Self {
        self.masking = masking;
        self
    }

    pub fn with_ops(mut self, a_op: ElementOp, b_op: ElementOp, acc_op: ElementOp, c_op: ElementOp) -> Self {
        self.a_op = a_op;
        self.b_op = b_op;
        self.acc_op = acc_op;
        self.c_op = c_op;
        self
    }

    /// `(M, N, K)` of the problem.
    pub fn problem_size(&self) -> (Index, Index, Index) {
        (self.a_desc.length(1), self.b_desc.length(1), self.a_desc.length(2))
    }

    pub(crate) fn check(&self, config: &TileConfig) -> Result<()> {
        check_rank("A", &self.a_desc, 3)?;
        check_rank("B", &self.b_desc, 3)?;
        check_rank("C", &self.c_desc, 3)?;

        let g = self.batch_count;
        if g <= 0 {
            return Err(KernelError::unsupported(format!("batch count must be positive, got {g}")));
        }
        let (m, n, k) = self.problem_size();
        check_lengths("A", &self.a_desc, &[g, m, k])?;
        check_lengths("B", &self.b_desc, &[g, n, k])?;
        check_lengths("C", &self.c_desc, &[g, m, n])?;

        check_vector_access("A", &self.a_desc, config.a_vector_width)?;
        check_vector_access("B", &self.b_desc, config.b_vector_width)?;
        check_vector_access("C", &self.c_desc, config.c_vector_width)?;

        check_fits("A", &self.a_desc, self.a)?;
        check_fits("B", &self.b_desc, self.b)?;
        check_fits("C", &self.c_desc, self.c)?;
        Ok(())
    }
}

/// Everything a group needs, built once per launch.
struct GemmProblem<'a, T: DataType> {
    args: &'a GemmArgs<'a, T>,
    config: &'a TileConfig,
    a: BatchedOperand<'a, T>,
    b: BatchedOperand<'a, T>,
    c: BatchedOperand<'a, T>,
    map: Block2TileMap,
    mask: CausalMask,
    m_raw: Index,
    n_raw: Index,
    num_k_tiles: usize,
}

impl<T: DataType> GemmProblem<'_, T> {
    fn rows(&self, origin: Index) -> Range<Index> {
        origin..(origin + self.config.m()).min(self.m_raw)
    }

    fn cols(&self, origin: Index) -> Range<Index> {
        origin..(origin + self.config.n()).min(self.n_raw)
    }

    fn run_tile<P: OobPolicy>(
        &self,
        tile: TileIndex,
        pipeline: &mut ReductionPipeline<T>,
        state: &LaunchState,
    ) -> Result<()> {
        let cfg = self.config;
        let (m0, n0) = self.map.tile_origin(&tile);
        let class = self.mask.classify(self.rows(m0), self.cols(n0));
        if class == TileMaskClass::FullyMasked {
            state.skip_tile();
            return Ok(());
        }

        let mut a_win = self.a.window::<P>(
            self.a.resource()?,
            tile.batch,
            [m0, 0],
            cfg.m_per_block,
            cfg.k_per_block,
            cfg.a_vector_width,
            cfg.block_size,
        )?;
        let mut b_win = self.b.window::<P>(
            self.b.resource()?,
            tile.batch,
            [n0, 0],
            cfg.n_per_block,
            cfg.k_per_block,
            cfg.b_vector_width,
            cfg.block_size,
        )?;

        let mut acc = AccumulationTile::<T::Acc>::new(cfg.m_per_block, cfg.n_per_block);
        reduce_nk(
            pipeline,
            &mut a_win,
            &mut b_win,
            self.num_k_tiles,
            &mut acc,
            &self.args.a_op,
            &self.args.b_op,
        )?;
        acc.apply(&self.args.acc_op);

        if class == TileMaskClass::PartiallyMasked {
            let fill = MaskFill::Zero.value::<T::Acc>();
            for i in 0..acc.rows() {
                for j in 0..acc.cols() {
                    if self.mask.is_masked(m0 + i as Index, n0 + j as Index) {
                        *acc.get_mut(i, j) = fill;
                    }
                }
            }
        }

        let mut out = vec![T::zeroed(); acc.rows() * acc.cols()];
        acc.shuffle_into(&self.args.c_op, &mut out);
        let c_win = self.c.window::<P>(
            self.c.resource()?,
            tile.batch,
            [m0, n0],
            cfg.m_per_block,
            cfg.n_per_block,
            cfg.c_vector_width,
            cfg.block_size,
        )?;
        c_win.store(&out);
        Ok(())
    }
}

pub(crate) fn run<T: DataType, P: OobPolicy>(
    launcher: &KernelLauncher<P>,
    args: &GemmArgs<'_, T>,
    state: &LaunchState,
) -> Result<()> {
    let config = launcher.config();
    let (m_raw, n_raw, _) = args.problem_size();

    let a = BatchedOperand::new(args.a, &args.a_desc, config.m(), config.k())?;
    let b = BatchedOperand::new(args.b, &args.b_desc, config.n(), config.k())?;
    let c = BatchedOperand::new(args.c, &args.c_desc, config.m(), config.n())?;
    let (_, k_padded) = a.padded();
    let map = Block2TileMap::new(
        m_raw,
        n_raw,
        config.m(),
        config.n(),
        args.batch_count,
        ReplayMode::Parallel,
    )?;

    let problem = GemmProblem {
        args,
        config,
        a,
        b,
        c,
        map,
        mask: CausalMask::new(args.masking, m_raw, n_raw),
        m_raw,
        n_raw,
        num_k_tiles: (k_padded / config.k()) as usize,
    };
    tracing::debug!(
        batch = args.batch_count,
        m = m_raw,
        n = n_raw,
        k_tiles = problem.num_k_tiles,
        masking = %args.masking,
        "gemm problem"
    );

    let slot_len = (config.m_per_block + config.n_per_block) * config.k_per_block;
    launcher.dispatch(state, problem.map.grid_size(), |group| {
        let mut pipeline = ReductionPipeline::new(config.prefetch_stages, slot_len);
        for tile in problem.map.tiles_for_group(group) {
            problem.run_tile::<P>(tile, &mut pipeline, state)?;
        }
        Ok(())
    });
    Ok(())
}
