// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block-to-tile assignment.
//!
//! A flat execution-group id is decomposed into `(batch, m_tile, n_tile)` with the
//! batch outermost and `n_tile` varying fastest. Every group computes its own
//! assignment; there is no coordination between groups.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::descriptor::TensorDescriptor;
use crate::error::{KernelError, Result};
use crate::transform::{Index, tiles_covering};

/// How tiles along the parallel axis are distributed over groups.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReplayMode {
    /// One group per tile.
    #[default]
    Parallel,
    /// One group per batch, replaying every tile of the batch in order.
    Deterministic,
}

/// Tile coordinate of one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex {
    pub batch: Index,
    pub m: Index,
    pub n: Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block2TileMap {
    m_per_block: Index,
    n_per_block: Index,
    m_tiles: Index,
    n_tiles: Index,
    batch_count: Index,
    mode: ReplayMode,
}

impl Block2TileMap {
    pub fn new(
        m_length: Index,
        n_length: Index,
        m_per_block: Index,
        n_per_block: Index,
        batch_count: Index,
        mode: ReplayMode,
    ) -> Result<Self> {
        if m_per_block <= 0 || n_per_block <= 0 {
            return Err(KernelError::Configuration(format!(
                "tile sizes must be positive, got {m_per_block}x{n_per_block}"
            )));
        }
        if m_length <= 0 || n_length <= 0 || batch_count <= 0 {
            return Err(KernelError::unsupported(format!(
                "problem extents must be positive, got batch={batch_count} m={m_length} n={n_length}"
            )));
        }

        Ok(Self {
            m_per_block,
            n_per_block,
            m_tiles: tiles_covering(m_length, m_per_block),
            n_tiles: tiles_covering(n_length, n_per_block),
            batch_count,
            mode,
        })
    }

    /// Map over the output space of a `[M, N]` or `[G, M, N]` descriptor.
    pub fn for_descriptor(
        desc: &TensorDescriptor,
        m_per_block: Index,
        n_per_block: Index,
        mode: ReplayMode,
    ) -> Result<Self> {
        let lengths = desc.lengths();
        match lengths.as_slice() {
            [m, n] => Self::new(*m, *n, m_per_block, n_per_block, 1, mode),
            [g, m, n] => Self::new(*m, *n, m_per_block, n_per_block, *g, mode),
            other => Err(KernelError::unsupported(format!(
                "output descriptor must have rank 2 or 3, got lengths {other:?}"
            ))),
        }
    }

    pub fn m_tiles(&self) -> Index {
        self.m_tiles
    }

    pub fn n_tiles(&self) -> Index {
        self.n_tiles
    }

    pub fn batch_count(&self) -> Index {
        self.batch_count
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn tiles_per_batch(&self) -> Index {
        self.m_tiles * self.n_tiles
    }

    /// Number of groups one batch occupies.
    pub fn groups_per_batch(&self) -> Index {
        match self.mode {
            ReplayMode::Parallel => self.tiles_per_batch(),
            ReplayMode::Deterministic => 1,
        }
    }

    /// Number of execution groups to launch.
    pub fn grid_size(&self) -> usize {
        (self.groups_per_batch() * self.batch_count) as usize
    }

    /// Decompose a flat tile id in `[0, batch_count * tiles_per_batch)`.
    #[inline]
    pub fn tile_for(&self, flat_id: usize) -> TileIndex {
        let flat = flat_id as Index;
        let per_batch = self.tiles_per_batch();
        let batch = flat / per_batch;
        let rem = flat % per_batch;
        TileIndex {
            batch,
            m: rem / self.n_tiles,
            n: rem % self.n_tiles,
        }
    }

    /// Tiles a group computes, in the order it computes them.
    pub fn tiles_for_group(&self, group_id: usize) -> impl Iterator<Item = TileIndex> + '_ {
        let (first, count) = match self.mode {
            ReplayMode::Parallel => (group_id, 1),
            ReplayMode::Deterministic => {
                let per_batch = self.tiles_per_batch() as usize;
                (group_id * per_batch, per_batch)
            }
        };
        (first..first + count).map(move |id| self.tile_for(id))
    }

    pub fn is_valid(&self, tile: &TileIndex) -> bool {
        (0..self.batch_count).contains(&tile.batch)
            && (0..self.m_tiles).contains(&tile.m)
            && (0..self.n_tiles).contains(&tile.n)
    }

    /// Element origin `(m, n)` of a tile.
    pub fn tile_origin(&self, tile: &TileIndex) -> (Index, Index) {
        (tile.m * self.m_per_block, tile.n * self.n_per_block)
    }
}
