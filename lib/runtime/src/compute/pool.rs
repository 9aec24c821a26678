// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compute pool implementation
//!
//! The `ComputePool` owns a Rayon thread pool. A kernel launch hands it a grid size and
//! a per-group entry function; every group identifier in `[0, grid_size)` runs exactly
//! once as an independent task, and the launch returns when the whole grid completed.
//!
//! ```ignore
//! use gridtile_runtime::compute::ComputePool;
//!
//! let pool = ComputePool::with_defaults()?;
//! pool.launch(grid_size, |group_id| {
//!     let tile = tile_map.tile_for(group_id);
//!     // run the group's pipeline on `tile`
//! });
//! ```

use super::{ComputeConfig, ComputeMetrics};
use anyhow::Result;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// A compute pool that hosts kernel execution groups
#[derive(Clone)]
pub struct ComputePool {
    /// The underlying Rayon thread pool
    pool: Arc<rayon::ThreadPool>,

    /// Metrics for monitoring launches
    metrics: Arc<ComputeMetrics>,

    /// Configuration used to create this pool
    config: ComputeConfig,
}

impl std::fmt::Debug for ComputePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePool")
            .field("num_threads", &self.pool.current_num_threads())
            .field("metrics", &self.metrics)
            .field("config", &self.config)
            .finish()
    }
}

impl ComputePool {
    /// Create a new compute pool with the given configuration
    pub fn new(config: ComputeConfig) -> Result<Self> {
        let pool = config.build_pool()?;
        let metrics = Arc::new(ComputeMetrics::new());

        tracing::debug!(
            num_threads = pool.current_num_threads(),
            prefix = %config.thread_prefix,
            "compute pool created"
        );

        Ok(Self {
            pool: Arc::new(pool),
            metrics,
            config,
        })
    }

    /// Create a compute pool with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(ComputeConfig::default())
    }

    /// Execute a synchronous computation on the thread pool
    pub fn execute_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Run `kernel` once for every execution group in `[0, grid_size)`
    ///
    /// Groups are independent tasks with no ordering guarantee between them. The call
    /// returns after every group ran to completion.
    pub fn launch<F>(&self, grid_size: usize, kernel: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.metrics.record_launch_start();
        let start = Instant::now();

        self.pool
            .install(|| (0..grid_size).into_par_iter().for_each(|group_id| kernel(group_id)));

        let elapsed = start.elapsed();
        self.metrics.record_launch_completion(grid_size, elapsed);
        tracing::trace!(grid_size, elapsed_us = elapsed.as_micros() as u64, "grid completed");
    }

    /// Execute two functions in parallel and return both results
    pub fn join<F1, F2, R1, R2>(&self, f1: F1, f2: F2) -> (R1, R2)
    where
        F1: FnOnce() -> R1 + Send,
        F2: FnOnce() -> R2 + Send,
        R1: Send,
        R2: Send,
    {
        self.pool.install(|| rayon::join(f1, f2))
    }

    /// Get metrics for this pool
    pub fn metrics(&self) -> &ComputeMetrics {
        &self.metrics
    }

    /// Get the number of threads in the pool
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}
