// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{AttentionProblem, assert_close, deterministic_launcher, launcher, random};
use gridtile_kernels::{
    AttentionBwdArgs, AttentionFwdArgs, DropoutParams, GlobalBuffer, Index, KernelArgs,
    KernelError, KernelLauncher, LaunchReport, MaskingSpec, Philox, TensorDescriptor, TileConfig,
    philox,
};
use rstest::rstest;

fn packed(lengths: &[Index]) -> TensorDescriptor {
    TensorDescriptor::packed(lengths).unwrap()
}

/// Device-side buffers of one attention problem.
struct Buffers {
    q: GlobalBuffer<f32>,
    k: GlobalBuffer<f32>,
    v: GlobalBuffer<f32>,
    y: GlobalBuffer<f32>,
    lse: GlobalBuffer<f32>,
    z: GlobalBuffer<u16>,
}

impl Buffers {
    fn new(p: &AttentionProblem) -> Self {
        Self {
            q: GlobalBuffer::from_slice(&p.q),
            k: GlobalBuffer::from_slice(&p.key),
            v: GlobalBuffer::from_slice(&p.v),
            y: GlobalBuffer::filled(p.g * p.m * p.o, f32::NAN),
            lse: GlobalBuffer::filled(p.g * p.m, f32::NAN),
            z: GlobalBuffer::zeroed(p.g * p.m * p.n),
        }
    }

    fn forward_args<'a>(&'a self, p: &AttentionProblem) -> AttentionFwdArgs<'a, f32> {
        AttentionFwdArgs::new(
            &self.q,
            packed(&p.dims(p.k)),
            &self.k,
            packed(&[p.g as Index, p.n as Index, p.k as Index]),
            &self.v,
            packed(&[p.g as Index, p.n as Index, p.o as Index]),
            &self.y,
            packed(&p.dims(p.o)),
            &self.lse,
            packed(&[p.g as Index, p.m as Index]),
        )
        .with_scale(p.scale as f32)
        .with_masking(p.masking)
        .with_dropout(p.dropout)
        .with_z(&self.z, packed(&p.dims(p.n)))
    }

    fn forward(&self, launcher: &KernelLauncher, p: &AttentionProblem) -> LaunchReport {
        launcher
            .launch(&KernelArgs::AttentionForward(self.forward_args(p)))
            .unwrap()
    }
}

struct Gradients {
    dy: GlobalBuffer<f32>,
    dq: GlobalBuffer<f32>,
    dk: GlobalBuffer<f32>,
    dv: GlobalBuffer<f32>,
}

impl Gradients {
    fn new(p: &AttentionProblem, dy: &[f32]) -> Self {
        Self {
            dy: GlobalBuffer::from_slice(dy),
            dq: GlobalBuffer::filled(p.g * p.m * p.k, f32::NAN),
            dk: GlobalBuffer::filled(p.g * p.n * p.k, f32::NAN),
            dv: GlobalBuffer::filled(p.g * p.n * p.o, f32::NAN),
        }
    }

    fn backward(&self, launcher: &KernelLauncher, p: &AttentionProblem, fwd: &Buffers) -> LaunchReport {
        let args = AttentionBwdArgs::from_forward(
            &fwd.forward_args(p),
            &self.dy,
            packed(&p.dims(p.o)),
            &self.dq,
            packed(&p.dims(p.k)),
            &self.dk,
            packed(&[p.g as Index, p.n as Index, p.k as Index]),
            &self.dv,
            packed(&[p.g as Index, p.n as Index, p.o as Index]),
        );
        launcher.launch(&KernelArgs::AttentionBackward(args)).unwrap()
    }
}

fn check_lse(actual: &[f32], expected: &[f64]) {
    for (a, e) in actual.iter().zip(expected) {
        if e.is_infinite() {
            assert_eq!(*a, f32::NEG_INFINITY);
        } else {
            approx::assert_relative_eq!(*a as f64, *e, epsilon = 1e-5);
        }
    }
}

#[rstest]
#[case::unmasked(MaskingSpec::MaskDisabled)]
#[case::top_left(MaskingSpec::MaskUpperTriangleFromTopLeft)]
#[case::bottom_right(MaskingSpec::MaskUpperTriangleFromBottomRight)]
fn test_forward_matches_reference(#[case] masking: MaskingSpec) {
    let mut problem = AttentionProblem::new(2, 70, 45, 16, 32, 11);
    problem.masking = masking;
    let reference = problem.forward();

    let mut buffers = Buffers::new(&problem);
    buffers.forward(&launcher(TileConfig::default()), &problem);

    assert_close(&buffers.y.to_vec(), &reference.y, 1e-5);
    check_lse(&buffers.lse.to_vec(), &reference.lse);
}

#[test]
fn test_causal_forward_skips_key_tiles() {
    let mut problem = AttentionProblem::new(1, 64, 64, 16, 32, 12);
    problem.masking = MaskingSpec::MaskUpperTriangleFromTopLeft;
    let buffers = Buffers::new(&problem);
    let report = buffers.forward(&launcher(TileConfig::default()), &problem);
    // query tile 0 never reaches key tile 1
    assert_eq!(*report.skipped_tiles(), 1);
    assert_eq!(*report.grid_size(), 2);
}

#[test]
fn test_dropout_forward_and_z() {
    let mut problem = AttentionProblem::new(2, 40, 36, 16, 32, 13);
    problem.dropout = DropoutParams::new(0.2, 0x5eed, 3).unwrap();
    let reference = problem.forward();

    let mut buffers = Buffers::new(&problem);
    buffers.forward(&launcher(TileConfig::default()), &problem);
    assert_close(&buffers.y.to_vec(), &reference.y, 1e-5);

    // Z holds the random value behind every mask decision
    let generator = Philox::new(0x5eed, 3);
    let (m_pad, n_pad) = (philox::padded_extent(40), philox::padded_extent(36));
    let z = buffers.z.to_vec();
    for g in 0..2 {
        for m in 0..40 {
            for n in 0..36 {
                let position = philox::dropout_position(g, m, n, m_pad, n_pad);
                assert_eq!(z[((g * 40 + m) * 36 + n) as usize], generator.random_u16(position));
            }
        }
    }
}

#[test]
fn test_stochastic_mask_independent_of_tiling() {
    let mut problem = AttentionProblem::new(1, 48, 40, 16, 32, 14);
    problem.dropout = DropoutParams::new(0.5, 99, 0).unwrap();

    let mut small = Buffers::new(&problem);
    small.forward(
        &launcher(TileConfig {
            m_per_block: 16,
            n_per_block: 16,
            ..Default::default()
        }),
        &problem,
    );
    let mut large = Buffers::new(&problem);
    large.forward(
        &launcher(TileConfig {
            m_per_block: 64,
            n_per_block: 64,
            ..Default::default()
        }),
        &problem,
    );
    assert_eq!(small.z.to_vec(), large.z.to_vec());
    assert_close(&small.y.to_vec(), &problem.forward().y, 1e-5);
}

#[rstest]
#[case::plain(MaskingSpec::MaskDisabled, 0.0)]
#[case::causal(MaskingSpec::MaskUpperTriangleFromTopLeft, 0.0)]
#[case::causal_dropout(MaskingSpec::MaskUpperTriangleFromBottomRight, 0.25)]
fn test_backward_matches_reference(#[case] masking: MaskingSpec, #[case] p_drop: f32) {
    let mut problem = AttentionProblem::new(2, 50, 70, 16, 32, 15);
    problem.masking = masking;
    problem.dropout = DropoutParams::new(p_drop, 7, 1).unwrap();
    let dy = random(problem.g * problem.m * problem.o, 16);
    let reference_fwd = problem.forward();
    let reference = problem.backward(&reference_fwd, &dy);

    let launcher = launcher(TileConfig::default());
    let fwd = Buffers::new(&problem);
    fwd.forward(&launcher, &problem);

    let mut grads = Gradients::new(&problem, &dy);
    grads.backward(&launcher, &problem, &fwd);

    assert_close(&grads.dq.to_vec(), &reference.dq, 1e-4);
    assert_close(&grads.dk.to_vec(), &reference.dk, 1e-4);
    assert_close(&grads.dv.to_vec(), &reference.dv, 1e-4);
}

#[test]
fn test_deterministic_replay_is_bit_identical() {
    let mut problem = AttentionProblem::new(2, 64, 96, 16, 32, 17);
    problem.masking = MaskingSpec::MaskUpperTriangleFromBottomRight;
    problem.dropout = DropoutParams::new(0.1, 1234, 5678).unwrap();
    let dy = random(problem.g * problem.m * problem.o, 18);

    let launcher = deterministic_launcher(TileConfig::default());
    let run = || {
        let fwd = Buffers::new(&problem);
        fwd.forward(&launcher, &problem);
        let mut grads = Gradients::new(&problem, &dy);
        let report = grads.backward(&launcher, &problem, &fwd);
        // pre-pass over 2x2 query tiles, then one group per batch
        assert_eq!(*report.grid_size(), 4 + 2);
        (grads.dq.to_vec(), grads.dk.to_vec(), grads.dv.to_vec())
    };

    let first = run();
    let second = run();
    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.0), bits(&second.0));
    assert_eq!(bits(&first.1), bits(&second.1));
    assert_eq!(bits(&first.2), bits(&second.2));

    let reference = problem.backward(&problem.forward(), &dy);
    assert_close(&first.0, &reference.dq, 1e-4);
}

#[test]
fn test_rejected_attention_arguments() {
    let problem = AttentionProblem::new(1, 32, 32, 16, 30, 19);
    let buffers = Buffers::new(&problem);
    // O = 30 is not a whole number of output vectors
    let err = launcher(TileConfig::default())
        .launch(&KernelArgs::AttentionForward(buffers.forward_args(&problem)))
        .unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedArgument(_)), "{err}");

    let problem = AttentionProblem::new(1, 32, 32, 16, 32, 19);
    let buffers = Buffers::new(&problem);
    let mut args = buffers.forward_args(&problem);
    args.lse_desc = packed(&[1, 31]);
    let err = launcher(TileConfig::default())
        .launch(&KernelArgs::AttentionForward(args))
        .unwrap_err();
    assert!(matches!(err, KernelError::UnsupportedArgument(_)));
}
