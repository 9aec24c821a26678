// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for centralized management across the workspace
//!
//! ## Organization
//!
//! Environment variables are organized by functional area:
//! - **Logging**: Log level, configuration file and output format
//! - **Runtime**: Compute pool sizing and the reported device generation
//! - **Tile**: Kernel tile configuration overrides

/// Logging and tracing environment variables
pub mod logging {
    /// Log level / filter directives (e.g., "debug", "gridtile_kernels=trace")
    pub const GRIDTILE_LOG: &str = "GRIDTILE_LOG";

    /// Path to logging configuration file
    pub const GRIDTILE_LOGGING_CONFIG_PATH: &str = "GRIDTILE_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const GRIDTILE_LOGGING_JSONL: &str = "GRIDTILE_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const GRIDTILE_DISABLE_ANSI_LOGGING: &str = "GRIDTILE_DISABLE_ANSI_LOGGING";
}

/// Runtime configuration environment variables
///
/// Every field of `RuntimeConfig` can be overridden with `GRIDTILE_<FIELD>`.
pub mod runtime {
    /// Prefix shared by all runtime overrides
    pub const PREFIX: &str = "GRIDTILE_";

    /// Number of compute pool threads (one execution group runs per task)
    pub const GRIDTILE_COMPUTE_THREADS: &str = "GRIDTILE_COMPUTE_THREADS";

    /// Stack size of compute pool threads in bytes
    pub const GRIDTILE_COMPUTE_STACK_SIZE: &str = "GRIDTILE_COMPUTE_STACK_SIZE";

    /// Hardware generation reported by the capability probe (e.g. "gfx90a")
    pub const GRIDTILE_DEVICE_NAME: &str = "GRIDTILE_DEVICE_NAME";
}

/// Tile configuration environment variables
pub mod tile {
    /// Prefix shared by all tile overrides, e.g. `GRIDTILE_TILE_M_PER_BLOCK`
    pub const PREFIX: &str = "GRIDTILE_TILE_";

    /// Number of prefetch stages of the reduction pipeline
    pub const GRIDTILE_TILE_PREFETCH_STAGES: &str = "GRIDTILE_TILE_PREFETCH_STAGES";

    /// Reduction length consumed per pipeline step
    pub const GRIDTILE_TILE_K_PER_BLOCK: &str = "GRIDTILE_TILE_K_PER_BLOCK";

    /// Lanes per execution group
    pub const GRIDTILE_TILE_BLOCK_SIZE: &str = "GRIDTILE_TILE_BLOCK_SIZE";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_env_var_names() {
        let mut seen = HashSet::new();
        let vars = [
            logging::GRIDTILE_LOG,
            logging::GRIDTILE_LOGGING_CONFIG_PATH,
            logging::GRIDTILE_LOGGING_JSONL,
            logging::GRIDTILE_DISABLE_ANSI_LOGGING,
            runtime::GRIDTILE_COMPUTE_THREADS,
            runtime::GRIDTILE_COMPUTE_STACK_SIZE,
            runtime::GRIDTILE_DEVICE_NAME,
            tile::GRIDTILE_TILE_PREFETCH_STAGES,
            tile::GRIDTILE_TILE_K_PER_BLOCK,
            tile::GRIDTILE_TILE_BLOCK_SIZE,
        ];

        for var in &vars {
            if !seen.insert(var) {
                panic!("Duplicate environment variable name: {}", var);
            }
        }
    }

    #[test]
    fn test_naming_conventions() {
        assert!(runtime::GRIDTILE_COMPUTE_THREADS.starts_with(runtime::PREFIX));
        assert!(runtime::GRIDTILE_DEVICE_NAME.starts_with(runtime::PREFIX));
        assert!(tile::GRIDTILE_TILE_PREFETCH_STAGES.starts_with(tile::PREFIX));
        assert!(logging::GRIDTILE_LOG.starts_with("GRIDTILE_"));
    }
}
