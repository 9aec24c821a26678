// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

pub mod environment_names;

/// Hardware generation assumed when nothing else is configured
pub const DEFAULT_DEVICE_NAME: &str = "gfx90a";

/// Default stack size for compute threads (2MB)
pub const DEFAULT_COMPUTE_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Keys of [`RuntimeConfig`] that may be overridden from `GRIDTILE_*` variables.
const RUNTIME_ENV_KEYS: &[&str] = &["compute_threads", "compute_stack_size", "device_name"];

/// Runtime configuration
/// Defines the compute pool that hosts execution groups and the device the kernels target
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
pub struct RuntimeConfig {
    /// Number of threads in the compute pool
    /// If not set, defaults to num_cpus / 2
    /// Set this at runtime with environment variable GRIDTILE_COMPUTE_THREADS
    #[validate(range(min = 1))]
    #[builder(default = "None")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub compute_threads: Option<usize>,

    /// Stack size for compute threads in bytes
    /// Set this at runtime with environment variable GRIDTILE_COMPUTE_STACK_SIZE
    #[validate(range(min = 131072))]
    #[builder(default = "Some(DEFAULT_COMPUTE_STACK_SIZE)")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub compute_stack_size: Option<usize>,

    /// Hardware generation identifier reported by the capability probe
    /// Set this at runtime with environment variable GRIDTILE_DEVICE_NAME
    #[validate(length(min = 1))]
    #[builder(default = "DEFAULT_DEVICE_NAME.to_string()")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub device_name: String,
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compute_threads {
            Some(val) => write!(f, "compute_threads={val}, ")?,
            None => write!(f, "compute_threads=default (num_cores / 2), ")?,
        }
        match self.compute_stack_size {
            Some(val) => write!(f, "compute_stack_size={val}, ")?,
            None => write!(f, "compute_stack_size=default, ")?,
        }
        write!(f, "device_name={}", self.device_name)
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        let prefix = environment_names::runtime::PREFIX;
        Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Toml::file("/etc/gridtile/runtime.toml"))
            .merge(
                Env::prefixed(prefix)
                    .filter_map(move |k| {
                        // filters out empty environment variables
                        match std::env::var(format!("{prefix}{}", k.as_str())) {
                            Ok(v) if !v.is_empty() => Some(k.into()),
                            _ => None,
                        }
                    })
                    .only(RUNTIME_ENV_KEYS),
            )
    }

    /// Load the runtime configuration from the environment and configuration files
    /// Configuration is prioritized in the following order, where the last has the lowest priority:
    /// 1. Environment variables prefixed with `GRIDTILE_`
    /// 2. /etc/gridtile/runtime.toml
    /// 3. Built-in defaults
    pub fn from_settings() -> Result<RuntimeConfig> {
        let config: RuntimeConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// A configuration with a single compute thread, useful for reproducing issues
    pub fn single_threaded() -> Self {
        RuntimeConfig {
            compute_threads: Some(1),
            ..Default::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            compute_threads: None,
            compute_stack_size: Some(DEFAULT_COMPUTE_STACK_SIZE),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

impl RuntimeConfigBuilder {
    /// Build and validate the runtime configuration
    pub fn build(&self) -> Result<RuntimeConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey (opposite of [`is_truthy`])
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

pub fn parse_bool(val: &str) -> anyhow::Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if is_falsey(val) {
        Ok(false)
    } else {
        anyhow::bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check if an environment variable is falsey
pub fn env_is_falsey(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_falsey(val.as_str()),
        Err(_) => false,
    }
}

/// Parse an environment variable as a boolean, `None` when unset
pub fn env_parse_bool(env: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(env) {
        Ok(val) => parse_bool(&val).map(Some),
        Err(_) => Ok(None),
    }
}

/// Check whether JSONL logging enabled
/// Set the `GRIDTILE_LOGGING_JSONL` environment variable a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::GRIDTILE_LOGGING_JSONL)
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
/// Set the `GRIDTILE_DISABLE_ANSI_LOGGING` environment variable a [`is_truthy`] value
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::GRIDTILE_DISABLE_ANSI_LOGGING)
}
