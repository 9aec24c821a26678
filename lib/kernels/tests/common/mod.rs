// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use gridtile_kernels::{
    CausalMask, DropoutParams, Index, KernelLauncher, MaskingSpec, Philox, ReplayMode,
    StaticProbe, TileConfig, philox,
};
use gridtile_runtime::{ComputeConfig, ComputePool};

pub fn launcher(config: TileConfig) -> KernelLauncher {
    launcher_on("gfx90a", config)
}

pub fn launcher_on(device: &str, config: TileConfig) -> KernelLauncher {
    let pool = ComputePool::new(ComputeConfig {
        num_threads: Some(4),
        ..Default::default()
    })
    .unwrap();
    KernelLauncher::new(pool, StaticProbe::new(device), config).unwrap()
}

pub fn deterministic_launcher(config: TileConfig) -> KernelLauncher {
    launcher(config).with_replay_mode(ReplayMode::Deterministic)
}

/// Reproducible values in `[-1, 1)`.
pub fn random(len: usize, seed: u64) -> Vec<f32> {
    let ph = Philox::new(seed, 0);
    (0..len as u64).map(|i| ph.uniform(i) * 2.0 - 1.0).collect()
}

/// `C[g] = A[g] · B[g]ᵀ` for packed `A: [G, M, K]`, `B: [G, N, K]`.
pub fn gemm_reference(a: &[f32], b: &[f32], g: usize, m: usize, n: usize, k: usize) -> Vec<f64> {
    let mut c = vec![0.0; g * m * n];
    for batch in 0..g {
        for i in 0..m {
            for j in 0..n {
                c[(batch * m + i) * n + j] = (0..k)
                    .map(|l| a[(batch * m + i) * k + l] as f64 * b[(batch * n + j) * k + l] as f64)
                    .sum();
            }
        }
    }
    c
}

/// Packed attention problem `Q: [G, M, K]`, `K: [G, N, K]`, `V: [G, N, O]`.
#[derive(Debug, Clone)]
pub struct AttentionProblem {
    pub g: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub o: usize,
    pub q: Vec<f32>,
    pub key: Vec<f32>,
    pub v: Vec<f32>,
    pub scale: f64,
    pub masking: MaskingSpec,
    pub dropout: DropoutParams,
}

pub struct Forward {
    pub y: Vec<f64>,
    pub lse: Vec<f64>,
    /// softmax before dropout, `[G, M, N]`
    pub p: Vec<f64>,
}

pub struct Backward {
    pub dq: Vec<f64>,
    pub dk: Vec<f64>,
    pub dv: Vec<f64>,
}

impl AttentionProblem {
    pub fn new(g: usize, m: usize, n: usize, k: usize, o: usize, seed: u64) -> Self {
        Self {
            g,
            m,
            n,
            k,
            o,
            q: random(g * m * k, seed),
            key: random(g * n * k, seed + 1),
            v: random(g * n * o, seed + 2),
            scale: 1.0 / (k as f64).sqrt(),
            masking: MaskingSpec::MaskDisabled,
            dropout: DropoutParams::disabled(),
        }
    }

    pub fn dims(&self, inner: usize) -> [Index; 3] {
        [self.g as Index, self.m as Index, inner as Index]
    }

    /// Dropout factor of element `(g, m, n)`: `0` or `1 / (1 - p)`.
    pub fn keep_factor(&self, g: usize, m: usize, n: usize) -> f64 {
        if !self.dropout.is_enabled() {
            return 1.0;
        }
        let position = philox::dropout_position(
            g as Index,
            m as Index,
            n as Index,
            philox::padded_extent(self.m as Index),
            philox::padded_extent(self.n as Index),
        );
        if self.dropout.keep(position) {
            self.dropout.rescale() as f64
        } else {
            0.0
        }
    }

    pub fn forward(&self) -> Forward {
        let (g, m, n, k, o) = (self.g, self.m, self.n, self.k, self.o);
        let mask = CausalMask::new(self.masking, m as Index, n as Index);
        let mut y = vec![0.0; g * m * o];
        let mut lse = vec![f64::NEG_INFINITY; g * m];
        let mut p = vec![0.0; g * m * n];

        for b in 0..g {
            for i in 0..m {
                let scores: Vec<f64> = (0..n)
                    .map(|j| {
                        if mask.is_masked(i as Index, j as Index) {
                            f64::NEG_INFINITY
                        } else {
                            self.scale
                                * (0..k)
                                    .map(|l| {
                                        self.q[(b * m + i) * k + l] as f64
                                            * self.key[(b * n + j) * k + l] as f64
                                    })
                                    .sum::<f64>()
                        }
                    })
                    .collect();
                let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if max == f64::NEG_INFINITY {
                    continue;
                }
                let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
                lse[b * m + i] = max + sum.ln();
                for j in 0..n {
                    let pij = (scores[j] - max).exp() / sum;
                    p[(b * m + i) * n + j] = pij;
                    let pd = pij * self.keep_factor(b, i, j);
                    for c in 0..o {
                        y[(b * m + i) * o + c] += pd * self.v[(b * n + j) * o + c] as f64;
                    }
                }
            }
        }
        Forward { y, lse, p }
    }

    pub fn backward(&self, fwd: &Forward, dy: &[f32]) -> Backward {
        let (g, m, n, k, o) = (self.g, self.m, self.n, self.k, self.o);
        let mut dq = vec![0.0; g * m * k];
        let mut dk = vec![0.0; g * n * k];
        let mut dv = vec![0.0; g * n * o];

        for b in 0..g {
            for i in 0..m {
                let d: f64 = (0..o)
                    .map(|c| fwd.y[(b * m + i) * o + c] * dy[(b * m + i) * o + c] as f64)
                    .sum();
                for j in 0..n {
                    let p = fwd.p[(b * m + i) * n + j];
                    if p == 0.0 {
                        continue;
                    }
                    let keep = self.keep_factor(b, i, j);
                    let dp_drop: f64 = (0..o)
                        .map(|c| dy[(b * m + i) * o + c] as f64 * self.v[(b * n + j) * o + c] as f64)
                        .sum();
                    for c in 0..o {
                        dv[(b * n + j) * o + c] += p * keep * dy[(b * m + i) * o + c] as f64;
                    }
                    let ds = p * (dp_drop * keep - d) * self.scale;
                    for l in 0..k {
                        dq[(b * m + i) * k + l] += ds * self.key[(b * n + j) * k + l] as f64;
                        dk[(b * n + j) * k + l] += ds * self.q[(b * m + i) * k + l] as f64;
                    }
                }
            }
        }
        Backward { dq, dk, dv }
    }
}

pub fn assert_close(actual: &[f32], expected: &[f64], epsilon: f64) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            approx::relative_eq!(*a as f64, *e, epsilon = epsilon, max_relative = epsilon),
            "element {i}: {a} != {e}"
        );
    }
}
