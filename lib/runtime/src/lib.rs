// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host runtime for the gridtile kernels: configuration, logging and the compute pool
//! that executes kernel grids.

pub mod compute;
pub mod config;
pub mod logging;

pub use anyhow::{Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise};
pub use compute::{ComputeConfig, ComputeMetrics, ComputePool};
pub use config::RuntimeConfig;
