// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # gridtile kernels
//!
//! Tiled execution of batched, padded tensor problems on a pool of execution groups.
//!
//! - [`transform`] and [`descriptor`] map logical tensor indices to memory offsets.
//! - [`buffer`] is the bounded vector access layer; [`memory`] owns the allocations.
//! - [`tile_map`] assigns output tiles to groups and [`mask`] classifies them.
//! - [`pipeline`] walks the reduction dimension through a multi-stage staging ring.
//! - [`kernel`] holds the entry points: batched GEMM and attention forward/backward.

pub mod buffer;
pub mod descriptor;
pub mod element;
pub mod error;
pub mod kernel;
pub mod mask;
pub mod memory;
pub mod philox;
pub mod pipeline;
pub mod tile_map;
pub mod transform;
pub mod types;

pub use buffer::{AddressShift, BufferResource, DefaultOobPolicy, OobPolicy, ValueSubstitution};
pub use descriptor::TensorDescriptor;
pub use element::{ElementOp, ElementwiseOperation, PassThrough};
pub use error::{DescriptorError, KernelError, ResourceError, Result, TransformError};
pub use kernel::{
    AttentionBwdArgs, AttentionFwdArgs, CapabilityProbe, GemmArgs, KernelArgs, KernelLauncher,
    LaunchReport, StaticProbe,
};
pub use mask::{CausalMask, MaskFill, MaskingSpec, TileMaskClass};
pub use memory::GlobalBuffer;
pub use philox::{DropoutParams, Philox};
pub use pipeline::{ReductionPipeline, TileConfig, TileConfigBuilder};
pub use tile_map::{Block2TileMap, ReplayMode, TileIndex};
pub use transform::Index;
pub use types::{AccType, DataType, ElementKind};
