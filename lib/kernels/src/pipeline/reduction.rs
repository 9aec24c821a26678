// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytemuck::Zeroable;
use strum::Display;

use super::staging::StagingBuffer;

/// Phase of a reduction walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PipelineState {
    /// Filling the first `prefetch_stages` slots
    Prologue,
    /// Consume one slot, refill it with the next transfer, repeat
    SteadyState,
    /// Drain the slots that are still staged
    Epilogue,
    /// Every tile was consumed; the accumulator may be written out
    Done,
}

/// Counters of one completed walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub k_tiles: usize,
    pub prefetched: usize,
    pub steady_iterations: usize,
    pub drained: usize,
    pub barriers: usize,
}

/// Multi-stage pipeline over the reduction dimension of one execution group.
///
/// The staging ring holds `stages` slots; while compute consumes tile `i`, the
/// transfers of tiles `i + 1 .. i + stages` are already staged. A slot is refilled
/// only after the barrier that ends its consumption, and a filled slot is read only
/// after the barrier that publishes it.
#[derive(Debug)]
pub struct ReductionPipeline<T> {
    staging: StagingBuffer<T>,
    state: PipelineState,
}

impl<T: Zeroable + Copy> ReductionPipeline<T> {
    /// A pipeline with `stages` slots of `slot_len` elements each.
    pub fn new(stages: usize, slot_len: usize) -> Self {
        Self {
            staging: StagingBuffer::new(stages.max(1), slot_len),
            state: PipelineState::Prologue,
        }
    }

    pub fn stages(&self) -> usize {
        self.staging.num_slots()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::trace!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    /// Walk `num_k_tiles` reduction tiles.
    ///
    /// `transfer(i, slot)` fills a staging slot with reduction tile `i`;
    /// `compute(i, slot)` folds the staged tile `i` into the caller's accumulator.
    /// Tiles are computed in increasing order. The pipeline can be run again after it
    /// reached [`PipelineState::Done`].
    pub fn run<F, C>(&mut self, num_k_tiles: usize, mut transfer: F, mut compute: C) -> PipelineStats
    where
        F: FnMut(usize, &mut [T]),
        C: FnMut(usize, &[T]),
    {
        let stages = self.stages();
        let barriers_before = self.staging.barriers();
        let mut stats = PipelineStats {
            k_tiles: num_k_tiles,
            ..Default::default()
        };

        self.state = PipelineState::Prologue;
        let prefetch = stages.min(num_k_tiles);
        for i in 0..prefetch {
            transfer(i, self.staging.begin_write(i % stages));
        }
        self.staging.sync();
        stats.prefetched = prefetch;

        self.transition(PipelineState::SteadyState);
        let mut next = prefetch;
        let mut current = 0;
        while next < num_k_tiles {
            let slot = current % stages;
            compute(current, self.staging.read(slot));
            self.staging.sync();

            transfer(next, self.staging.begin_write(next % stages));
            self.staging.sync();

            current += 1;
            next += 1;
            stats.steady_iterations += 1;
        }

        self.transition(PipelineState::Epilogue);
        while current < num_k_tiles {
            compute(current, self.staging.read(current % stages));
            self.staging.sync();
            current += 1;
            stats.drained += 1;
        }

        self.transition(PipelineState::Done);
        stats.barriers = self.staging.barriers() - barriers_before;
        stats
    }
}
