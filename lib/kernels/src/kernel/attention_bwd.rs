// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multi-head attention backward pass, query-loop variant.
//!
//! A pre-pass computes `D[g, m] = Σ_o Y · dY` and clears `dQ`. The main grid then
//! assigns key/value tiles to groups; each group keeps its `K` and `V` tiles resident,
//! loops over the query tiles that are not fully masked, recomputes
//! `P = exp(scale · Q · Kᵀ - LSE)` and accumulates
//!
//! ```text
//! dV += dropout(P)ᵀ · dY
//! dS  = P ∘ (dropout(dY · Vᵀ) - D) · scale
//! dK += dSᵀ · Q
//! dQ += dS · K        (atomic, f32)
//! ```
//!
//! With [`ReplayMode::Deterministic`] one group per batch replays every key/value
//! tile in order, so the atomic updates of `dQ` happen in a fixed order.

use num_traits::{Float, One, Zero};

use super::attention::AttentionFwdArgs;
use super::operand::BatchedOperand;
use super::validation::{check_fits, check_lengths, check_rank, check_vector_access};
use super::{KernelLauncher, LaunchState};
use crate::buffer::{BufferResource, OobPolicy};
use crate::descriptor::TensorDescriptor;
use crate::element::PassThrough;
use crate::error::{KernelError, Result};
use crate::mask::{CausalMask, MaskFill, MaskingSpec, TileMaskClass};
use crate::memory::GlobalBuffer;
use crate::philox::{DropoutParams, dropout_position, padded_extent};
use crate::pipeline::{
    AccumulationTile, ReductionPipeline, TileConfig, gemm_tile_kn, gemm_tile_nk, gemm_tile_tn,
};
use crate::tile_map::{Block2TileMap, ReplayMode, TileIndex};
use crate::transform::{Index, tiles_covering};
use crate::types::{AccType, DataType};

pub(crate) const KERNEL_NAME: &str = "mha_backward_qloop";

#[derive(Debug, Clone)]
pub struct AttentionBwdArgs<'a, T: DataType> {
    pub q: &'a GlobalBuffer<T>,
    pub q_desc: TensorDescriptor,
    pub k: &'a GlobalBuffer<T>,
    pub k_desc: TensorDescriptor,
    pub v: &'a GlobalBuffer<T>,
    pub v_desc: TensorDescriptor,
    pub y: &'a GlobalBuffer<T>,
    pub y_desc: TensorDescriptor,
    pub lse: &'a GlobalBuffer<f32>,
    pub lse_desc: TensorDescriptor,
    pub dy: &'a GlobalBuffer<T>,
    pub dy_desc: TensorDescriptor,
    /// Accumulated with atomic adds; overwritten by the launch
    pub dq: &'a GlobalBuffer<f32>,
    pub dq_desc: TensorDescriptor,
    pub dk: &'a GlobalBuffer<T>,
    pub dk_desc: TensorDescriptor,
    pub dv: &'a GlobalBuffer<T>,
    pub dv_desc: TensorDescriptor,
    pub batch_count: Index,
    pub scale: f32,
    pub masking: MaskingSpec,
    pub dropout: DropoutParams,
}

impl<'a, T: DataType> AttentionBwdArgs<'a, T> {
    /// Gradients of the forward launch described by `forward`, reusing its inputs,
    /// outputs, scale, masking and dropout stream.
    #[allow(clippy::too_many_arguments)]
    pub fn from_forward(
        forward: &AttentionFwdArgs<'a, T>,
        dy: &'a GlobalBuffer<T>,
        dy_desc: TensorDescriptor,
        dq: &'a GlobalBuffer<f32>,
        dq_desc: TensorDescriptor,
        dk: &'a GlobalBuffer<T>,
        dk_desc: TensorDescriptor,
        dv: &'a GlobalBuffer<T>,
        dv_desc: TensorDescriptor,
    ) -> Self {
        Self {
            q: forward.q,
            q_desc: forward.q_desc.clone(),
            k: forward.k,
            k_desc: forward.k_desc.clone(),
            v: forward.v,
            v_desc: forward.v_desc.clone(),
            y: forward.y,
            y_desc: forward.y_desc.clone(),
            lse: forward.lse,
            lse_desc: forward.lse_desc.clone(),
            dy,
            dy_desc,
            dq,
            dq_desc,
            dk,
            dk_desc,
            dv,
            dv_desc,
            batch_count: forward.batch_count,
            scale: forward.scale,
            masking: forward.masking,
            dropout: forward.dropout,
        }
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
            ("dY", &self.dy_desc),
            ("dQ", &self.dq_desc),
            ("dK", &self.dk_desc),
            ("dV", &self.dv_desc),
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
        check_lengths("dY", &self.dy_desc, &[g, m, o])?;
        check_lengths("LSE", &self.lse_desc, &[g, m])?;
        check_lengths("dQ", &self.dq_desc, &[g, m, k])?;
        check_lengths("dK", &self.dk_desc, &[g, n, k])?;
        check_lengths("dV", &self.dv_desc, &[g, n, o])?;

        check_vector_access("Q", &self.q_desc, config.a_vector_width)?;
        check_vector_access("K", &self.k_desc, config.b_vector_width)?;
        check_vector_access("V", &self.v_desc, config.b_vector_width)?;
        check_vector_access("Y", &self.y_desc, config.c_vector_width)?;
        check_vector_access("dY", &self.dy_desc, config.c_vector_width)?;
        check_vector_access("dQ", &self.dq_desc, config.a_vector_width)?;
        check_vector_access("dK", &self.dk_desc, config.a_vector_width)?;
        check_vector_access("dV", &self.dv_desc, config.c_vector_width)?;

        check_fits("Q", &self.q_desc, self.q)?;
        check_fits("K", &self.k_desc, self.k)?;
        check_fits("V", &self.v_desc, self.v)?;
        check_fits("Y", &self.y_desc, self.y)?;
        check_fits("dY", &self.dy_desc, self.dy)?;
        check_fits("LSE", &self.lse_desc, self.lse)?;
        check_fits("dQ", &self.dq_desc, self.dq)?;
        check_fits("dK", &self.dk_desc, self.dk)?;
        check_fits("dV", &self.dv_desc, self.dv)?;
        Ok(())
    }
}

struct BackwardProblem<'a, T: DataType> {
    args: &'a AttentionBwdArgs<'a, T>,
    config: &'a TileConfig,
    q: BatchedOperand<'a, T>,
    k: BatchedOperand<'a, T>,
    v: BatchedOperand<'a, T>,
    y: BatchedOperand<'a, T>,
    dy: BatchedOperand<'a, T>,
    dq: BatchedOperand<'a, f32>,
    dk: BatchedOperand<'a, T>,
    dv: BatchedOperand<'a, T>,
    /// `D`, packed `[G, M]`
    y_dot_dy: &'a GlobalBuffer<f32>,
    mask: CausalMask,
    m_raw: Index,
    n_raw: Index,
    m_tiles: Index,
    k_padded: usize,
    o_padded: usize,
}

impl<T: DataType> BackwardProblem<'_, T> {
    fn row_range(&self, m_tile: Index) -> std::ops::Range<Index> {
        let m0 = m_tile * self.config.m();
        m0..(m0 + self.config.m()).min(self.m_raw)
    }

    /// `D = rowsum(Y ∘ dY)` for one query tile; also clears the tile's `dQ` rows.
    fn y_dot_dy_tile<P: OobPolicy>(&self, tile: TileIndex) -> Result<()> {
        let cfg = self.config;
        let mpb = cfg.m_per_block;
        let m0 = tile.m * cfg.m();

        let mut y = vec![T::zeroed(); mpb * self.o_padded];
        let mut dy = vec![T::zeroed(); mpb * self.o_padded];
        for (op, dst) in [(&self.y, &mut y), (&self.dy, &mut dy)] {
            op.window::<P>(
                op.resource()?,
                tile.batch,
                [m0, 0],
                mpb,
                self.o_padded,
                cfg.c_vector_width,
                cfg.block_size,
            )?
            .load(dst);
        }

        let d = BufferResource::<f32, P>::whole(self.y_dot_dy)?;
        for (i, m) in self.row_range(tile.m).enumerate() {
            let row = i * self.o_padded..(i + 1) * self.o_padded;
            let mut sum = T::Acc::zero();
            for (a, b) in y[row.clone()].iter().zip(&dy[row]) {
                sum += a.to_acc() * b.to_acc();
            }
            d.store([sum.narrow_f32()], tile.batch * self.m_raw + m, true);
        }

        self.dq
            .window::<P>(
                self.dq.resource()?,
                tile.batch,
                [m0, 0],
                mpb,
                self.k_padded,
                cfg.a_vector_width,
                cfg.block_size,
            )?
            .store(&vec![0.0; mpb * self.k_padded]);
        Ok(())
    }

    /// Gradients of one key/value tile; `tile.m` indexes the key tile.
    fn key_tile<P: OobPolicy>(
        &self,
        tile: TileIndex,
        pipeline: &mut ReductionPipeline<T>,
        state: &LaunchState,
    ) -> Result<()> {
        let cfg = self.config;
        let (mpb, npb) = (cfg.m_per_block, cfg.n_per_block);
        let (kp, op) = (self.k_padded, self.o_padded);
        let g = tile.batch;
        let n0 = tile.m * cfg.n();
        let cols = n0..(n0 + cfg.n()).min(self.n_raw);

        let zero = T::Acc::zero();
        let neg_inf = MaskFill::NegInfinity.value::<T::Acc>();
        let scale = T::Acc::widen_f32(self.args.scale);
        let dropout = &self.args.dropout;
        let rescale = T::Acc::widen_f32(dropout.rescale());
        let generator = dropout.generator();
        let (m_drop, n_drop) = (padded_extent(self.m_raw), padded_extent(self.n_raw));

        let mut active = Vec::with_capacity(self.m_tiles as usize);
        for i in 0..self.m_tiles {
            if self.mask.classify(self.row_range(i), cols.clone()) == TileMaskClass::FullyMasked {
                state.skip_tile();
            } else {
                active.push(i);
            }
        }

        let mut k_tile = vec![T::zeroed(); npb * kp];
        let mut v_tile = vec![T::zeroed(); npb * op];
        self.k
            .window::<P>(self.k.resource()?, g, [n0, 0], npb, kp, cfg.b_vector_width, cfg.block_size)?
            .load(&mut k_tile);
        self.v
            .window::<P>(self.v.resource()?, g, [n0, 0], npb, op, cfg.b_vector_width, cfg.block_size)?
            .load(&mut v_tile);

        let lse_res = BufferResource::<f32, P>::whole(self.args.lse)?;
        let d_res = BufferResource::<f32, P>::whole(self.y_dot_dy)?;
        let mut lse = Vec::with_capacity(self.m_raw as usize);
        let mut d = Vec::with_capacity(self.m_raw as usize);
        for m in 0..self.m_raw {
            let [l] = lse_res.load::<1>(self.args.lse_desc.offset(&[g, m])?, true);
            let [dm] = d_res.load::<1>(g * self.m_raw + m, true);
            lse.push(T::Acc::widen_f32(l));
            d.push(T::Acc::widen_f32(dm));
        }

        let mut dk = AccumulationTile::<T::Acc>::new(npb, kp);
        let mut dv = AccumulationTile::<T::Acc>::new(npb, op);

        if let Some(&first) = active.first() {
            let origin = [first * cfg.m(), 0];
            let mut q_win =
                self.q
                    .window::<P>(self.q.resource()?, g, origin, mpb, kp, cfg.a_vector_width, cfg.block_size)?;
            let mut dy_win =
                self.dy
                    .window::<P>(self.dy.resource()?, g, origin, mpb, op, cfg.c_vector_width, cfg.block_size)?;
            let mut dq_win =
                self.dq
                    .window::<P>(self.dq.resource()?, g, origin, mpb, kp, cfg.a_vector_width, cfg.block_size)?;

            // query tiles are sparse under causal masking; precompute every hop
            let hops: Vec<[Index; 2]> = active.windows(2).map(|w| [(w[1] - w[0]) * cfg.m(), 0]).collect();
            let q_steps = hops.iter().map(|h| q_win.make_step(*h)).collect::<Result<Vec<_>>>()?;
            let dy_steps = hops.iter().map(|h| dy_win.make_step(*h)).collect::<Result<Vec<_>>>()?;
            let dq_steps = hops.iter().map(|h| dq_win.make_step(*h)).collect::<Result<Vec<_>>>()?;

            let mut s = AccumulationTile::<T::Acc>::new(mpb, npb);
            let mut dp = AccumulationTile::<T::Acc>::new(mpb, npb);
            let mut pd = AccumulationTile::<T::Acc>::new(mpb, npb);
            let mut ds = AccumulationTile::<T::Acc>::new(mpb, npb);
            let mut dq = AccumulationTile::<T::Acc>::new(mpb, kp);
            let mut dq_out = vec![0.0f32; mpb * kp];
            let q_len = mpb * kp;

            pipeline.run(
                active.len(),
                |idx, slot| {
                    if idx > 0 {
                        q_win.move_window(&q_steps[idx - 1]);
                        dy_win.move_window(&dy_steps[idx - 1]);
                    }
                    let (q_slot, dy_slot) = slot.split_at_mut(q_len);
                    q_win.load(q_slot);
                    dy_win.load(dy_slot);
                },
                |idx, slot| {
                    if idx > 0 {
                        dq_win.move_window(&dq_steps[idx - 1]);
                    }
                    let m0 = active[idx] * cfg.m();
                    let (q, dy) = slot.split_at(q_len);

                    s.fill(zero);
                    gemm_tile_nk(&mut s, q, &k_tile, kp, &PassThrough, &PassThrough);
                    dp.fill(zero);
                    gemm_tile_nk(&mut dp, dy, &v_tile, op, &PassThrough, &PassThrough);

                    for i in 0..mpb {
                        let m = m0 + i as Index;
                        for c in 0..npb {
                            let n = n0 + c as Index;
                            let live = m < self.m_raw
                                && n < self.n_raw
                                && !self.mask.is_masked(m, n)
                                && lse[m as usize] != neg_inf;
                            if !live {
                                *pd.get_mut(i, c) = zero;
                                *ds.get_mut(i, c) = zero;
                                continue;
                            }

                            let p = (s.get(i, c) * scale - lse[m as usize]).exp();
                            let keep = if !dropout.is_enabled() {
                                T::Acc::one()
                            } else if dropout.keeps(generator.random_u16(dropout_position(g, m, n, m_drop, n_drop))) {
                                rescale
                            } else {
                                zero
                            };
                            *pd.get_mut(i, c) = p * keep;
                            *ds.get_mut(i, c) = p * (dp.get(i, c) * keep - d[m as usize]) * scale;
                        }
                    }

                    gemm_tile_tn(&mut dv, &pd, dy, &PassThrough);
                    gemm_tile_tn(&mut dk, &ds, q, &PassThrough);

                    dq.fill(zero);
                    gemm_tile_kn(&mut dq, &ds, &k_tile, &PassThrough);
                    for (out, v) in dq_out.iter_mut().zip(dq.as_slice()) {
                        *out = v.narrow_f32();
                    }
                    dq_win.atomic_add(&dq_out);
                },
            );
        }

        let mut dk_out = vec![T::zeroed(); npb * kp];
        dk.shuffle_into(&PassThrough, &mut dk_out);
        self.dk
            .window::<P>(self.dk.resource()?, g, [n0, 0], npb, kp, cfg.a_vector_width, cfg.block_size)?
            .store(&dk_out);

        let mut dv_out = vec![T::zeroed(); npb * op];
        dv.shuffle_into(&PassThrough, &mut dv_out);
        self.dv
            .window::<P>(self.dv.resource()?, g, [n0, 0], npb, op, cfg.c_vector_width, cfg.block_size)?
            .store(&dv_out);
        Ok(())
    }
}

pub(crate) fn run<T: DataType, P: OobPolicy>(
    launcher: &KernelLauncher<P>,
    args: &AttentionBwdArgs<'_, T>,
    state: &LaunchState,
) -> Result<()> {
    let config = launcher.config();
    let (m_raw, n_raw, _, _) = args.problem_size();
    let g = args.batch_count;

    let q = BatchedOperand::new(args.q, &args.q_desc, config.m(), config.k())?;
    let (_, k_padded) = q.padded();
    let v = BatchedOperand::new(args.v, &args.v_desc, config.n(), config.o())?;
    let (_, o_padded) = v.padded();
    let y_dot_dy = GlobalBuffer::<f32>::zeroed((g * m_raw) as usize);

    let problem = BackwardProblem {
        args,
        config,
        q,
        k: BatchedOperand::new(args.k, &args.k_desc, config.n(), config.k())?,
        v,
        y: BatchedOperand::new(args.y, &args.y_desc, config.m(), config.o())?,
        dy: BatchedOperand::new(args.dy, &args.dy_desc, config.m(), config.o())?,
        dq: BatchedOperand::new(args.dq, &args.dq_desc, config.m(), config.k())?,
        dk: BatchedOperand::new(args.dk, &args.dk_desc, config.n(), config.k())?,
        dv: BatchedOperand::new(args.dv, &args.dv_desc, config.n(), config.o())?,
        y_dot_dy: &y_dot_dy,
        mask: CausalMask::new(args.masking, m_raw, n_raw),
        m_raw,
        n_raw,
        m_tiles: tiles_covering(m_raw, config.m()),
        k_padded: k_padded as usize,
        o_padded: o_padded as usize,
    };
    let replay = launcher.replay_mode();
    tracing::debug!(
        batch = g,
        m = m_raw,
        n = n_raw,
        masking = %args.masking,
        p_drop = args.dropout.p_drop(),
        replay = %replay,
        "attention backward problem"
    );

    let rows = Block2TileMap::new(m_raw, 1, config.m(), 1, g, ReplayMode::Parallel)?;
    launcher.dispatch(state, rows.grid_size(), |group| {
        problem.y_dot_dy_tile::<P>(rows.tile_for(group))
    });
    if state.has_failed() {
        return Ok(());
    }

    // key/value tiles along the first axis of the map
    let keys = Block2TileMap::new(n_raw, 1, config.n(), 1, g, replay)?;
    let slot_len = config.m_per_block * (problem.k_padded + problem.o_padded);
    launcher.dispatch(state, keys.grid_size(), |group| {
        let mut pipeline = ReductionPipeline::new(config.prefetch_stages, slot_len);
        for tile in keys.tiles_for_group(group) {
            problem.key_tile::<P>(tile, &mut pipeline, state)?;
        }
        Ok(())
    });
    Ok(())
}
