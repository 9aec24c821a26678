// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metrics for monitoring grid launches on the compute pool

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Metrics for the compute pool
#[derive(Debug)]
pub struct ComputeMetrics {
    /// Total number of grids launched
    launches_total: AtomicU64,

    /// Number of launches currently running
    launches_active: AtomicUsize,

    /// Total number of execution groups run to completion
    groups_total: AtomicU64,

    /// Total time spent in launches (microseconds)
    total_launch_time_us: AtomicU64,

    /// Maximum launch duration seen (microseconds)
    max_launch_duration_us: AtomicU64,
}

impl ComputeMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            launches_total: AtomicU64::new(0),
            launches_active: AtomicUsize::new(0),
            groups_total: AtomicU64::new(0),
            total_launch_time_us: AtomicU64::new(0),
            max_launch_duration_us: AtomicU64::new(0),
        }
    }

    /// Record that a launch has started
    pub fn record_launch_start(&self) {
        self.launches_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a launch of `groups` execution groups has completed
    pub fn record_launch_completion(&self, groups: usize, duration: Duration) {
        self.launches_active.fetch_sub(1, Ordering::Relaxed);
        self.launches_total.fetch_add(1, Ordering::Relaxed);
        self.groups_total.fetch_add(groups as u64, Ordering::Relaxed);

        let duration_us = duration.as_micros().min(u64::MAX as u128) as u64;
        self.total_launch_time_us
            .fetch_add(duration_us, Ordering::Relaxed);

        let mut current_max = self.max_launch_duration_us.load(Ordering::Relaxed);
        while duration_us > current_max {
            match self.max_launch_duration_us.compare_exchange_weak(
                current_max,
                duration_us,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Get total number of grids launched
    pub fn launches_total(&self) -> u64 {
        self.launches_total.load(Ordering::Relaxed)
    }

    /// Get number of currently running launches
    pub fn launches_active(&self) -> usize {
        self.launches_active.load(Ordering::Relaxed)
    }

    /// Get total number of execution groups run
    pub fn groups_total(&self) -> u64 {
        self.groups_total.load(Ordering::Relaxed)
    }

    /// Get average launch duration in microseconds
    pub fn avg_launch_duration_us(&self) -> f64 {
        let total = self.launches_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        let total_time = self.total_launch_time_us.load(Ordering::Relaxed);
        total_time as f64 / total as f64
    }

    /// Get maximum launch duration in microseconds
    pub fn max_launch_duration_us(&self) -> u64 {
        self.max_launch_duration_us.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.launches_total.store(0, Ordering::Relaxed);
        self.launches_active.store(0, Ordering::Relaxed);
        self.groups_total.store(0, Ordering::Relaxed);
        self.total_launch_time_us.store(0, Ordering::Relaxed);
        self.max_launch_duration_us.store(0, Ordering::Relaxed);
    }
}

impl Default for ComputeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_accounting() {
        let metrics = ComputeMetrics::new();
        metrics.record_launch_start();
        assert_eq!(metrics.launches_active(), 1);
        metrics.record_launch_completion(12, Duration::from_micros(40));
        metrics.record_launch_start();
        metrics.record_launch_completion(4, Duration::from_micros(20));

        assert_eq!(metrics.launches_active(), 0);
        assert_eq!(metrics.launches_total(), 2);
        assert_eq!(metrics.groups_total(), 16);
        assert_eq!(metrics.max_launch_duration_us(), 40);
        assert_eq!(metrics.avg_launch_duration_us(), 30.0);

        metrics.reset();
        assert_eq!(metrics.launches_total(), 0);
        assert_eq!(metrics.avg_launch_duration_us(), 0.0);
    }
}
