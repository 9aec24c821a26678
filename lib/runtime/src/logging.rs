// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging bootstrap for hosts that drive the kernels.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `GRIDTILE_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/etc/gridtile/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `GRIDTILE_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `GRIDTILE_LOG` environment variable or by setting the
//! `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "gridtile_kernels::pipeline" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, fmt};

use crate::config::environment_names::logging as env_logging;
use crate::config::{disable_ansi_logging, jsonl_logging_enabled};

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("rayon".to_string(), "error".to_string())]),
        }
    }
}

/// Initialize the global subscriber; later calls are no-ops
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = setup_logging() {
            eprintln!("Failed to initialize logging: {}", e);
        }
    });
}

fn setup_logging() -> anyhow::Result<()> {
    let filter = filters(load_config()?);

    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(l).try_init()?;
    } else {
        let l = fmt::layer()
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(l).try_init()?;
    }

    Ok(())
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into());

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(env_logging::GRIDTILE_LOG)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

pub(crate) fn load_config() -> anyhow::Result<LoggingConfig> {
    let config_path =
        std::env::var(env_logging::GRIDTILE_LOGGING_CONFIG_PATH).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/etc/gridtile/logging.toml"))
        .merge(Toml::file(config_path));

    Ok(figment.extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_logging_config() -> anyhow::Result<()> {
        temp_env::with_vars(
            vec![(env_logging::GRIDTILE_LOGGING_CONFIG_PATH, None::<&str>)],
            || {
                let config = load_config()?;
                assert_eq!(config.log_level, DEFAULT_FILTER_LEVEL);
                assert_eq!(config.log_filters.get("rayon").map(String::as_str), Some("error"));
                Ok(())
            },
        )
    }

    #[test]
    fn test_logging_config_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "log_level = \"debug\"\n\n[log_filters]\n\"gridtile_kernels::pipeline\" = \"trace\""
        )?;
        let path = file.path().to_string_lossy().to_string();

        temp_env::with_vars(
            vec![(env_logging::GRIDTILE_LOGGING_CONFIG_PATH, Some(path.as_str()))],
            || {
                let config = load_config()?;
                assert_eq!(config.log_level, "debug");
                assert_eq!(
                    config
                        .log_filters
                        .get("gridtile_kernels::pipeline")
                        .map(String::as_str),
                    Some("trace")
                );
                // the default per-module filters are kept
                assert!(config.log_filters.contains_key("rayon"));
                Ok(())
            },
        )
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!(target: "gridtile_runtime", "logging initialized");
    }
}
