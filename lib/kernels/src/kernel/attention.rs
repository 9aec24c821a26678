// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fused multi-head attention forward pass.
//!
//! `Y = dropout(softmax(scale · Q · Kᵀ + mask)) · V` with `Q: [G, M, K]`,
//! `K: [G, N, K]`, `V: [G, N, O]` and `Y: [G, M, O]`. Each group owns one `M x O`
//! output tile and walks the `N` dimension with an online softmax, so the `M x N`
//! score matrix never leaves the group. The log-sum-exp of every row is written to
//! `LSE: [G, M]` for the backward pass.

use num_traits::{Float, Zero};

use super::operand::{BatchedOperand, reduce_nk};
use super::validation::{check_fits, check_lengths, check_rank, check_vector_access};
use super::{KernelLauncher, LaunchState};
use crate::buffer::{BufferResource, OobPolicy};
use crate::descriptor::TensorDescriptor;
use crate::element::PassThrough;
use crate::error::{KernelError, Result};
use crate::mask::{CausalMask, MaskFill, MaskingSpec, TileMaskClass};
use crate::memory::GlobalBuffer;
use crate::philox::{DropoutParams, dropout_position, padded_extent};
use crate::pipeline::{AccumulationTile, ReductionPipeline, TileConfig, gemm_tile_kn};
use crate::tile_map::{Block2TileMap, ReplayMode, TileIndex};
use crate::transform::{Index, tiles_covering};
use crate::types::{AccType, DataType};

pub(crate) const KERNEL_NAME: &str = "mha_forward";

#[derive(Debug, Clone)]
pub struct AttentionFwdArgs<'a, T: DataType> {
    pub q: &'a GlobalBuffer<T>,
    pub q_desc: TensorDescriptor,
    pub k: &'a GlobalBuffer<T>,
    pub k_desc: TensorDescriptor,
    pub v: &'a GlobalBuffer<T>,
    pub v_desc: TensorDescriptor,
    pub y: &'a GlobalBuffer<T>,
    pub y_desc: TensorDescriptor,
    /// Row log-sum-exp, `[G, M]`
    pub lse: &'a GlobalBuffer<f32>,
    pub lse_desc: TensorDescriptor,
    /// Optional `[G, M, N]` output of the random values behind the dropout mask.
    /// Only written when dropout is enabled, and only for tiles that are computed.
    pub z: Option<(&'a GlobalBuffer<u16>, TensorDescriptor)>,
    pub batch_count: Index,
    pub scale: f32,
    pub masking: MaskingSpec,
    pub dropout: DropoutParams,
}

impl<'a, T: DataType> AttentionFwdArgs<'a, T> {
    /// Unmasked attention without dropout, scaled by `1 / sqrt(K)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q: &'a GlobalBuffer<T>,
        q_desc: TensorDescriptor,
        k: &'a GlobalBuffer<T>,
        k_desc: TensorDescriptor,
        v: &'a GlobalBuffer<T>,
        v_desc: TensorDescriptor,
        y: &'a GlobalBuffer<T>,
        y_desc: TensorDescriptor,
        lse: &'a GlobalBuffer<f32>,
        lse_desc: TensorDescriptor,
    ) -> Self {
        let lengths = q_desc.lengths();
        let batch_count = lengths.first().copied().unwrap_or(0);
        let head_dim = lengths.last().copied().unwrap_or(1).max(1);
        Self {
            q,
            q_desc,
            k,
            k_desc,
            v,
            v_desc,
            y,
            y_desc,
            lse,
            lse_desc,
            z: None,
            batch_count,
            scale: 1.0 / (head_dim as f32).sqrt(),
            masking: MaskingSpec::MaskDisabled,
            dropout: DropoutParams::disabled(),
        }
    }

    pub fn with_masking(mut self, masking: MaskingSpec) -> Self {
        self.masking = masking;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_dropout(mut self, dropout: DropoutParams) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_z(mut self, z: &'a GlobalBuffer<u16>, z_desc: TensorDescriptor) -> Self {
        self.z = Some((z, z_desc));
        self
    }

    /// `(M, N, K, O)` of the problem.
    pub fn problem_size(&self) -> (Index, Index, Index, Index) {
        (
            self.q_desc.length(1),
            self.k_desc.length(1),
            self.q_desc.length(2),
            self.v_desc.length(2),
        )
    }

    pub(crate) fn check(&self, config: &TileConfig) -> Result<()> {
        for (name, desc) in [
            ("Q", &self.q_desc),
            ("K", &self.k_desc),
            ("V", &self.v_desc),
            ("Y", &self.y_desc),
        ] {
            check_rank(name, desc, 3)?;
        }
        check_rank("LSE", &self.lse_desc, 2)?;

        let g = self.batch_count;
        if g <= 0 {
            return Err(KernelError::unsupported(format!("batch count must be positive, got {g}")));
        }
        if !self.scale.is_finite() {
            return Err(KernelError::unsupported(format!("softmax scale {} is not finite", self.scale)));
        }
        let (m, n, k, o) = self.problem_size();
        check_lengths("Q", &self.q_desc, &[g, m, k])?;
        check_lengths("K", &self.k_desc, &[g, n, k])?;
        check_lengths("V", &self.v_desc, &[g, n, o])?;
        check_lengths("Y", &self.y_desc, &[g, m, o])?;
        check_lengths("LSE", &self.lse_desc, &[g, m])?;

        check_vector_access("Q", &self.q_desc, config.a_vector_width)?;
        check_vector_access("K", &self.k_desc, config.b_vector_width)?;
        check_vector_access("V", &self.v_desc, config.b_vector_width)?;
        check_vector_access("Y", &self.y_desc, config.c_vector_width)?;

        check_fits("Q", &self.q_desc, self.q)?;
        check_fits("K", &self.k_desc, self.k)?;
        check_fits("V", &self.v_desc, self.v)?;
        check_fits("Y", &self.y_desc, self.y)?;
        check_fits("LSE", &self.lse_desc, self.lse)?;

        if let Some((z, z_desc)) = &self.z {
            check_rank("Z", z_desc, 3)?;
            check_lengths("Z", z_desc, &[g, m, n])?;
            check_fits("Z", z_desc, z)?;
        }
        Ok(())
    }
}

struct ForwardProblem<'a, T: DataType> {
    args: &'a AttentionFwdArgs<'a, T>,
    config: &'a TileConfig,
    q: BatchedOperand<'a, T>,
    k: BatchedOperand<'a, T>,
    v: BatchedOperand<'a, T>,
    y: BatchedOperand<'a, T>,
    z: Option<BatchedOperand<'a, u16>>,
    map: Block2TileMap,
    mask: CausalMask,
    m_raw: Index,
    n_raw: Index,
    n_tiles: Index,
    num_k_tiles: usize,
}

impl<T: DataType> ForwardProblem<'_, T> {
    fn run_tile<P: OobPolicy>(
        &self,
        tile: TileIndex,
        pipeline: &mut ReductionPipeline<T>,
        state: &LaunchState,
    ) -> Result<()> {
        let cfg = self.config;
        let (mpb, npb, opb) = (cfg.m_per_block, cfg.n_per_block, cfg.o_per_block);
        let (m0, o0) = self.map.tile_origin(&tile);
        let rows = m0..(m0 + cfg.m()).min(self.m_raw);

        let zero = T::Acc::zero();
        let neg_inf = MaskFill::NegInfinity.value::<T::Acc>();
        let scale = T::Acc::widen_f32(self.args.scale);
        let dropout = &self.args.dropout;
        let rescale = T::Acc::widen_f32(dropout.rescale());
        let generator = dropout.generator();
        let (m_drop, n_drop) = (padded_extent(self.m_raw), padded_extent(self.n_raw));

        let (q_res, k_res, v_res) = (
            self.q.resource::<P>()?,
            self.k.resource::<P>()?,
            self.v.resource::<P>()?,
        );

        let mut row_max = vec![neg_inf; mpb];
        let mut row_sum = vec![zero; mpb];
        let mut acc = AccumulationTile::<T::Acc>::new(mpb, opb);
        let mut p = AccumulationTile::<T::Acc>::new(mpb, npb);
        let mut v_tile = vec![T::zeroed(); npb * opb];
        let mut z_tile = vec![0u16; mpb * npb];

        for j in 0..self.n_tiles {
            let n0 = j * cfg.n();
            let class = self
                .mask
                .classify(rows.clone(), n0..(n0 + cfg.n()).min(self.n_raw));
            if class == TileMaskClass::FullyMasked {
                state.skip_tile();
                continue;
            }

            let mut q_win = self.q.window(
                q_res,
                tile.batch,
                [m0, 0],
                mpb,
                cfg.k_per_block,
                cfg.a_vector_width,
                cfg.block_size,
            )?;
            let mut k_win = self.k.window(
                k_res,
                tile.batch,
                [n0, 0],
                npb,
                cfg.k_per_block,
                cfg.b_vector_width,
                cfg.block_size,
            )?;
            p.fill(zero);
            reduce_nk(
                pipeline,
                &mut q_win,
                &mut k_win,
                self.num_k_tiles,
                &mut p,
                &PassThrough,
                &PassThrough,
            )?;

            // online softmax: rescale what was accumulated under the previous maximum
            let partial = class == TileMaskClass::PartiallyMasked;
            for i in 0..mpb {
                let m = m0 + i as Index;
                let row = p.row_mut(i);
                let mut tile_max = neg_inf;
                for (c, x) in row.iter_mut().enumerate() {
                    let n = n0 + c as Index;
                    *x = if n >= self.n_raw || (partial && self.mask.is_masked(m, n)) {
                        neg_inf
                    } else {
                        *x * scale
                    };
                    tile_max = tile_max.max(*x);
                }

                let new_max = row_max[i].max(tile_max);
                if new_max == neg_inf {
                    row.fill(zero);
                    continue;
                }
                let correction = (row_max[i] - new_max).exp();
                row_max[i] = new_max;

                let mut sum = zero;
                for x in row.iter_mut() {
                    *x = (*x - new_max).exp();
                    sum += *x;
                }
                row_sum[i] = row_sum[i] * correction + sum;
                for a in acc.row_mut(i) {
                    *a *= correction;
                }
            }

            if dropout.is_enabled() {
                for i in 0..mpb {
                    for c in 0..npb {
                        let position =
                            dropout_position(tile.batch, m0 + i as Index, n0 + c as Index, m_drop, n_drop);
                        let random = generator.random_u16(position);
                        z_tile[i * npb + c] = random;
                        let x = p.get_mut(i, c);
                        *x = if dropout.keeps(random) { *x * rescale } else { zero };
                    }
                }
                if let (Some(z), 0) = (&self.z, tile.n) {
                    z.window::<P>(z.resource()?, tile.batch, [m0, n0], mpb, npb, 1, cfg.block_size)?
                        .store(&z_tile);
                }
            }

            let v_win = self.v.window(
                v_res,
                tile.batch,
                [n0, o0],
                npb,
                opb,
                cfg.b_vector_width,
                cfg.block_size,
            )?;
            v_win.load(&mut v_tile);
            gemm_tile_kn(&mut acc, &p, &v_tile, &PassThrough);
        }

        for (i, l) in row_sum.iter().enumerate() {
            let inv = if *l > zero { l.recip() } else { zero };
            for a in acc.row_mut(i) {
                *a *= inv;
            }
        }
        let mut out = vec![T::zeroed(); mpb * opb];
        acc.shuffle_into(&PassThrough, &mut out);
        self.y
            .window::<P>(
                self.y.resource()?,
                tile.batch,
                [m0, o0],
                mpb,
                opb,
                cfg.c_vector_width,
                cfg.block_size,
            )?
            .store(&out);

        if tile.n == 0 {
            let lse = BufferResource::<f32, P>::whole(self.args.lse)?;
            for (i, m) in rows.enumerate() {
                let l = row_sum[i];
                let value = if l > zero { row_max[i] + l.ln() } else { neg_inf };
                let offset = self.args.lse_desc.offset(&[tile.batch, m])?;
                lse.store([value.narrow_f32()], offset, true);
            }
        }
        Ok(())
    }
}

pub(crate) fn run<T: DataType, P: OobPolicy>(
    launcher: &KernelLauncher<P>,
    args: &AttentionFwdArgs<'_, T>,
    state: &LaunchState,
) -> Result<()> {
    let config = launcher.config();
    let (m_raw, n_raw, _, o_raw) = args.problem_size();

    let q = BatchedOperand::new(args.q, &args.q_desc, config.m(), config.k())?;
    let k = BatchedOperand::new(args.k, &args.k_desc, config.n(), config.k())?;
    let v = BatchedOperand::new(args.v, &args.v_desc, config.n(), config.o())?;
    let y = BatchedOperand::new(args.y, &args.y_desc, config.m(), config.o())?;
    let z = args
        .z
        .as_ref()
        .map(|(z, z_desc)| BatchedOperand::new(*z, z_desc, config.m(), config.n()))
        .transpose()?;
    let (_, k_padded) = q.padded();
    let map = Block2TileMap::new(
        m_raw,
        o_raw,
        config.m(),
        config.o(),
        args.batch_count,
        ReplayMode::Parallel,
    )?;

    let problem = ForwardProblem {
        args,
        config,
        q,
        k,
        v,
        y,
        z,
        map,
        mask: CausalMask::new(args.masking, m_raw, n_raw),
        m_raw,
        n_raw,
        n_tiles: tiles_covering(n_raw, config.n()),
        num_k_tiles: (k_padded / config.k()) as usize,
    };
    tracing::debug!(
        batch = args.batch_count,
        m = m_raw,
        n = n_raw,
        o = o_raw,
        masking = %args.masking,
        p_drop = args.dropout.p_drop(),
        "attention forward problem"
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
