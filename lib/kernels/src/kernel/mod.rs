// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel entry points.
//!
//! Each kernel variant has one argument bundle ([`GemmArgs`], [`AttentionFwdArgs`],
//! [`AttentionBwdArgs`]); [`KernelArgs`] tags them and [`KernelLauncher::launch`]
//! dispatches on the tag. Arguments are validated before any group runs; a launch
//! either is rejected up front or runs every group to completion.

mod attention;
mod attention_bwd;
mod gemm;
mod operand;
pub mod validation;

pub use attention::AttentionFwdArgs;
pub use attention_bwd::AttentionBwdArgs;
pub use gemm::GemmArgs;

use derive_getters::Getters;
use std::marker::PhantomData;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gridtile_runtime::{ComputeConfig, ComputePool, RuntimeConfig};

use crate::buffer::{DefaultOobPolicy, OobPolicy};
use crate::error::{KernelError, Result};
use crate::pipeline::TileConfig;
use crate::tile_map::ReplayMode;
use crate::types::DataType;
use validator::Validate;

/// Reports the hardware generation kernels are launched on.
pub trait CapabilityProbe: Send + Sync {
    fn device_name(&self) -> String;
}

/// A probe answering with a fixed device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticProbe {
    device_name: String,
}

impl StaticProbe {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.device_name.clone())
    }
}

impl CapabilityProbe for StaticProbe {
    fn device_name(&self) -> String {
        self.device_name.clone()
    }
}

/// Arguments of one kernel launch, tagged by kernel variant.
#[derive(Debug)]
pub enum KernelArgs<'a, T: DataType> {
    Gemm(GemmArgs<'a, T>),
    AttentionForward(AttentionFwdArgs<'a, T>),
    AttentionBackward(AttentionBwdArgs<'a, T>),
}

impl<T: DataType> KernelArgs<'_, T> {
    pub fn name(&self) -> &'static str {
        match self {
            KernelArgs::Gemm(_) => gemm::KERNEL_NAME,
            KernelArgs::AttentionForward(_) => attention::KERNEL_NAME,
            KernelArgs::AttentionBackward(_) => attention_bwd::KERNEL_NAME,
        }
    }
}

/// Outcome of a completed launch.
#[derive(Debug, Clone, Getters)]
pub struct LaunchReport {
    kernel: &'static str,
    /// Groups started, summed over every grid of the launch
    grid_size: usize,
    /// Output tiles skipped because they were fully masked
    skipped_tiles: usize,
    elapsed: Duration,
}

/// Per-launch bookkeeping shared by all groups.
#[derive(Debug, Default)]
pub(crate) struct LaunchState {
    first_error: OnceLock<KernelError>,
    skipped_tiles: AtomicUsize,
    grid_size: AtomicUsize,
}

impl LaunchState {
    pub(crate) fn record(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!(error = %e, "execution group failed");
            let _ = self.first_error.set(e);
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.first_error.get().is_some()
    }

    pub(crate) fn skip_tile(&self) {
        self.skipped_tiles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_grid(&self, grid_size: usize) {
        self.grid_size.fetch_add(grid_size, Ordering::Relaxed);
    }

    fn finish(self, kernel: &'static str, started: Instant) -> Result<LaunchReport> {
        if let Some(e) = self.first_error.into_inner() {
            return Err(e);
        }
        Ok(LaunchReport {
            kernel,
            grid_size: self.grid_size.into_inner(),
            skipped_tiles: self.skipped_tiles.into_inner(),
            elapsed: started.elapsed(),
        })
    }
}

/// Launches kernels of one tile configuration on a compute pool.
///
/// The tile configuration, the replay mode and the out-of-bounds policy `P` are fixed
/// for the lifetime of the launcher.
pub struct KernelLauncher<P: OobPolicy = DefaultOobPolicy> {
    pool: ComputePool,
    probe: Box<dyn CapabilityProbe>,
    config: TileConfig,
    replay: ReplayMode,
    _policy: PhantomData<P>,
}

impl<P: OobPolicy> std::fmt::Debug for KernelLauncher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelLauncher")
            .field("device", &self.probe.device_name())
            .field("config", &self.config)
            .field("replay", &self.replay)
            .field("policy", &P::NAME)
            .finish()
    }
}

impl<P: OobPolicy> KernelLauncher<P> {
    pub fn new(
        pool: ComputePool,
        probe: impl CapabilityProbe + 'static,
        config: TileConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            probe: Box::new(probe),
            config,
            replay: ReplayMode::Parallel,
            _policy: PhantomData,
        })
    }

    /// Build the pool and the probe from a runtime configuration.
    pub fn from_runtime_config(runtime: &RuntimeConfig, config: TileConfig) -> anyhow::Result<Self> {
        let pool = ComputePool::new(ComputeConfig::from(runtime))?;
        Ok(Self::new(pool, StaticProbe::from_config(runtime), config)?)
    }

    /// Select how the backward kernel distributes key/value tiles.
    pub fn with_replay_mode(mut self, replay: ReplayMode) -> Self {
        self.replay = replay;
        self
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn replay_mode(&self) -> ReplayMode {
        self.replay
    }

    pub fn pool(&self) -> &ComputePool {
        &self.pool
    }

    pub fn device_name(&self) -> String {
        self.probe.device_name()
    }

    /// Pre-launch argument validation.
    pub fn is_supported<T: DataType>(&self, args: &KernelArgs<'_, T>) -> Result<()> {
        validation::check_device(args.name(), self.probe.as_ref())?;
        match args {
            KernelArgs::Gemm(a) => a.check(&self.config),
            KernelArgs::AttentionForward(a) => a.check(&self.config),
            KernelArgs::AttentionBackward(a) => a.check(&self.config),
        }
    }

    /// Validate `args` and run the kernel to completion.
    #[tracing::instrument(level = "debug", skip_all, fields(kernel = args.name(), oob = P::NAME))]
    pub fn launch<T: DataType>(&self, args: &KernelArgs<'_, T>) -> Result<LaunchReport> {
        if let Err(e) = self.is_supported(args) {
            tracing::warn!(error = %e, "kernel arguments rejected");
            return Err(e);
        }

        let started = Instant::now();
        let state = LaunchState::default();
        match args {
            KernelArgs::Gemm(a) => gemm::run::<T, P>(self, a, &state)?,
            KernelArgs::AttentionForward(a) => attention::run::<T, P>(self, a, &state)?,
            KernelArgs::AttentionBackward(a) => attention_bwd::run::<T, P>(self, a, &state)?,
        }
        let report = state.finish(args.name(), started)?;
        tracing::debug!(
            grid_size = report.grid_size,
            skipped_tiles = report.skipped_tiles,
            elapsed_us = report.elapsed.as_micros() as u64,
            "kernel completed"
        );
        Ok(report)
    }

    /// Run `grid_size` groups of `group` on the pool.
    pub(crate) fn dispatch<F>(&self, state: &LaunchState, grid_size: usize, group: F)
    where
        F: Fn(usize) -> Result<()> + Send + Sync,
    {
        tracing::debug!(grid_size, "launching grid");
        state.add_grid(grid_size);
        self.pool.launch(grid_size, |group_id| state.record(group(group_id)));
    }
}
