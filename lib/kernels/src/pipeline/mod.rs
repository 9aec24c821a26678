// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Blocked reduction pipeline.
//!
//! One execution group walks the reduction dimension tile by tile. Transfers from
//! global memory land in a ring of staging slots ([`StagingBuffer`]) through
//! [`TileWindow`]s, the compute step folds each staged tile into an
//! [`AccumulationTile`], and [`ReductionPipeline`] keeps `prefetch_stages` transfers
//! ahead of compute. Every fill/consume transition of a slot is bracketed by a
//! group barrier.

mod accumulator;
mod reduction;
mod staging;
mod window;

pub use accumulator::{AccumulationTile, gemm_tile_kn, gemm_tile_nk, gemm_tile_tn};
pub use reduction::{PipelineState, PipelineStats, ReductionPipeline};
pub use staging::{SlotState, StagingBuffer};
pub use window::TileWindow;

use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::buffer::VECTOR_WIDTHS;
use crate::error::Result;
use crate::transform::Index;
use gridtile_runtime::config::environment_names::tile as env_tile;

/// Compile-time tile shape of a kernel instance.
///
/// The prefetch depth is fixed for the lifetime of a kernel object; it is never
/// adapted at runtime.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize, PartialEq, Eq)]
#[validate(schema(function = "validate_tile_config"))]
#[builder(build_fn(private, name = "build_internal"), derive(Debug))]
pub struct TileConfig {
    /// Lanes per execution group
    #[validate(range(min = 1, max = 1024))]
    #[builder(default = "64")]
    pub block_size: usize,

    /// Output rows per tile
    #[validate(range(min = 1))]
    #[builder(default = "32")]
    pub m_per_block: usize,

    /// Output columns per tile
    #[validate(range(min = 1))]
    #[builder(default = "32")]
    pub n_per_block: usize,

    /// Reduction length per pipeline step
    #[validate(range(min = 1))]
    #[builder(default = "16")]
    pub k_per_block: usize,

    /// Output columns of the second GEMM of a fused chain
    #[validate(range(min = 1))]
    #[builder(default = "32")]
    pub o_per_block: usize,

    /// Transfers kept in flight ahead of compute
    #[validate(range(min = 1, max = 4))]
    #[builder(default = "2")]
    pub prefetch_stages: usize,

    /// Scalars per vector when loading the A operand
    #[builder(default = "4")]
    pub a_vector_width: usize,

    /// Scalars per vector when loading the B operands
    #[builder(default = "4")]
    pub b_vector_width: usize,

    /// Scalars per vector when storing the output
    #[builder(default = "4")]
    pub c_vector_width: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            m_per_block: 32,
            n_per_block: 32,
            k_per_block: 16,
            o_per_block: 32,
            prefetch_stages: 2,
            a_vector_width: 4,
            b_vector_width: 4,
            c_vector_width: 4,
        }
    }
}

impl TileConfig {
    pub fn builder() -> TileConfigBuilder {
        TileConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(TileConfig::default()))
            .merge(Env::prefixed(env_tile::PREFIX))
    }

    /// Load the tile configuration from defaults overridden by `GRIDTILE_TILE_*`
    pub fn from_settings() -> Result<TileConfig> {
        let config: TileConfig = Self::figment()
            .extract()
            .map_err(|e| crate::error::KernelError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn m(&self) -> Index {
        self.m_per_block as Index
    }

    pub fn n(&self) -> Index {
        self.n_per_block as Index
    }

    pub fn k(&self) -> Index {
        self.k_per_block as Index
    }

    pub fn o(&self) -> Index {
        self.o_per_block as Index
    }
}

impl TileConfigBuilder {
    /// Build and validate the tile configuration
    pub fn build(&self) -> Result<TileConfig> {
        let config = self
            .build_internal()
            .map_err(|e| crate::error::KernelError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_tile_config(config: &TileConfig) -> Result<(), ValidationError> {
    let tiles = [
        config.m_per_block,
        config.n_per_block,
        config.k_per_block,
        config.o_per_block,
        config.block_size,
    ];
    if !tiles.iter().all(|t| t.is_power_of_two()) {
        return Err(ValidationError::new("tile_sizes_must_be_powers_of_2"));
    }

    let widths = [
        config.a_vector_width,
        config.b_vector_width,
        config.c_vector_width,
    ];
    if !widths.iter().all(|w| VECTOR_WIDTHS.contains(w)) {
        return Err(ValidationError::new("unsupported_vector_width"));
    }

    // the contiguous extent of every loaded or stored tile must hold whole vectors
    let divisible = config.k_per_block % config.a_vector_width == 0
        && config.k_per_block % config.b_vector_width == 0
        && config.o_per_block % config.b_vector_width == 0
        && config.n_per_block % config.c_vector_width == 0
        && config.o_per_block % config.c_vector_width == 0;
    if !divisible {
        return Err(ValidationError::new(
            "vector_width_must_divide_contiguous_tile_extent",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TileConfig::default().validate().is_ok());
        assert_eq!(TileConfig::builder().build().unwrap(), TileConfig::default());
    }

    #[rstest]
    #[case::stages_zero(TileConfig { prefetch_stages: 0, ..Default::default() })]
    #[case::stages_five(TileConfig { prefetch_stages: 5, ..Default::default() })]
    #[case::tile_not_pow2(TileConfig { m_per_block: 24, ..Default::default() })]
    #[case::width_three(TileConfig { a_vector_width: 3, ..Default::default() })]
    #[case::width_exceeds_k(TileConfig { k_per_block: 4, a_vector_width: 8, ..Default::default() })]
    #[case::store_width(TileConfig { n_per_block: 8, c_vector_width: 16, ..Default::default() })]
    fn test_rejects_invalid(#[case] config: TileConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(TileConfig::builder().prefetch_stages(8).build().is_err());
        let config = TileConfig::builder()
            .m_per_block(16)
            .prefetch_stages(3)
            .build()
            .unwrap();
        assert_eq!(config.m(), 16);
        assert_eq!(config.prefetch_stages, 3);
    }

    #[test]
    fn test_from_settings_env_override() {
        temp_env::with_vars(
            vec![
                (env_tile::GRIDTILE_TILE_PREFETCH_STAGES, Some("3")),
                (env_tile::GRIDTILE_TILE_K_PER_BLOCK, Some("32")),
            ],
            || {
                let config = TileConfig::from_settings().unwrap();
                assert_eq!(config.prefetch_stages, 3);
                assert_eq!(config.k_per_block, 32);
                assert_eq!(config.m_per_block, TileConfig::default().m_per_block);
            },
        );

        temp_env::with_vars(
            vec![(env_tile::GRIDTILE_TILE_PREFETCH_STAGES, Some("7"))],
            || {
                assert!(TileConfig::from_settings().is_err());
            },
        );
    }
}
