// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compute module hosting kernel execution groups on a Rayon thread pool
//!
//! Every execution group of a launch becomes one independent Rayon task. Groups never
//! wait on each other, so work-stealing gives the same "embarrassingly parallel"
//! behaviour as a hardware grid.
//!
//! Key features:
//! - Dedicated Rayon thread pool for kernel launches
//! - Grid launches over `[0, grid_size)` group identifiers
//! - Metrics for launched grids and executed groups

use anyhow::Result;
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RuntimeConfig;

pub mod metrics;
pub mod pool;

pub use metrics::ComputeMetrics;
pub use pool::ComputePool;

/// Configuration for the compute thread pool
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Number of threads in the Rayon pool (defaults to num_cpus / 2)
    pub num_threads: Option<usize>,

    /// Stack size for compute threads (defaults to 2MB)
    pub stack_size: Option<usize>,

    /// Thread name prefix (defaults to "gridtile")
    pub thread_prefix: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            stack_size: Some(2 * 1024 * 1024),
            thread_prefix: "gridtile".to_string(),
        }
    }
}

impl From<&RuntimeConfig> for ComputeConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            num_threads: config.compute_threads,
            stack_size: config.compute_stack_size,
            ..Default::default()
        }
    }
}

impl ComputeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(num_threads) = self.num_threads
            && num_threads == 0
        {
            return Err(anyhow::anyhow!("Number of compute threads cannot be 0"));
        }

        if let Some(stack_size) = self.stack_size
            && stack_size < 128 * 1024
        {
            return Err(anyhow::anyhow!(
                "Stack size too small: {}KB. Minimum recommended: 128KB",
                stack_size / 1024
            ));
        }

        if self.thread_prefix.is_empty() {
            return Err(anyhow::anyhow!("Thread prefix cannot be empty"));
        }

        Ok(())
    }

    /// Create a Rayon thread pool from this configuration
    pub(crate) fn build_pool(&self) -> Result<rayon::ThreadPool> {
        self.validate()?;

        let mut builder = ThreadPoolBuilder::new();

        let num_threads = self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).clamp(2, 16))
                .unwrap_or(2)
        });
        builder = builder.num_threads(num_threads);

        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let prefix = self.thread_prefix.clone();
        let thread_counter = Arc::new(AtomicU64::new(0));
        builder = builder.thread_name(move |_| {
            let id = thread_counter.fetch_add(1, Ordering::SeqCst);
            format!("{}-{}", prefix, id)
        });

        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create Rayon thread pool: {}", e))
    }
}
