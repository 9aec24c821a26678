// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types.
//!
//! Every error is raised while building descriptors, resources or kernel arguments.
//! Out-of-range accesses during execution are absorbed by the buffer resource and
//! never surface here.

use thiserror::Error;

use crate::transform::{Index, MAX_DIMS};

/// Malformed transform chains and invalid coordinates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{transform} expects {expected} lower dimension(s), got {actual}")]
    LowerArity {
        transform: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{transform} produces {expected} upper dimension(s), got {actual} position(s)")]
    UpperArity {
        transform: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("dimension {position} referenced but the space has rank {rank}")]
    DanglingDimension { position: usize, rank: usize },

    #[error("dimension {0} is consumed by more than one transform")]
    DuplicateLower(usize),

    #[error("dimension {0} is not consumed by any transform")]
    UnconsumedDimension(usize),

    #[error("upper position {0} is produced more than once")]
    DuplicateUpper(usize),

    #[error("upper positions leave position {0} unassigned")]
    UpperGap(usize),

    #[error("{transform}: {reason}")]
    InvalidParameters {
        transform: &'static str,
        reason: String,
    },

    #[error("length {length} does not factor exactly into {factors:?}")]
    InexactUnmerge { length: Index, factors: Vec<Index> },

    #[error("length {length} of dimension {dim} must be positive")]
    NonPositiveLength { dim: usize, length: Index },

    #[error("index rank mismatch: expected {expected}, got {actual}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("index {index} out of range for dimension {dim} of length {length}")]
    IndexOutOfRange {
        dim: usize,
        index: Index,
        length: Index,
    },

    #[error("{transform} cannot decode lower index {index}")]
    NotDecodable { transform: &'static str, index: Index },

    #[error("a transform may touch at most {MAX_DIMS} dimensions, got {0}")]
    TooManyDimensions(usize),
}

/// Shapes rejected at the descriptor construction boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("descriptor must have at least one dimension")]
    Empty,

    #[error("{lengths} lengths but {strides} strides")]
    RankMismatch { lengths: usize, strides: usize },

    #[error("length {length} of dimension {dim} must be positive")]
    NonPositiveLength { dim: usize, length: Index },

    #[error("stride {stride} of dimension {dim} (length {length}) must be positive")]
    InvalidStride {
        dim: usize,
        stride: Index,
        length: Index,
    },

    #[error("dimension {dim} out of range for rank {rank}")]
    DimensionOutOfRange { dim: usize, rank: usize },

    #[error("element space overflows the index type")]
    ElementSpaceOverflow,
}

/// Invalid buffer resource construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("declared range of {range} elements exceeds the allocation of {len} elements")]
    RangeExceedsAllocation { range: usize, len: usize },

    #[error("declared range of {bytes} bytes exceeds the {max} byte hardware limit")]
    RangeTooLarge { bytes: u64, max: u64 },
}

/// Errors reported before a kernel is launched.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The compiled configuration itself is unusable
    #[error("invalid kernel configuration: {0}")]
    Configuration(String),

    /// Runtime arguments are incompatible with the compiled configuration
    #[error("argument not supported: {0}")]
    UnsupportedArgument(String),

    #[error("device '{device}' is not supported by {kernel} (supported: {supported})")]
    UnsupportedDevice {
        kernel: &'static str,
        device: String,
        supported: String,
    },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl KernelError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        KernelError::UnsupportedArgument(reason.into())
    }
}

pub type Result<T, E = KernelError> = std::result::Result<T, E>;
