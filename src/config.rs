//! Recorder configuration
//!
//! Defaults suit a single inference session. Values can come from JSON or
//! from `VKCMD_*` environment variables layered over the defaults.

use serde::{Deserialize, Serialize};
use std::env;

use crate::error::CommandErrorKind;

/// Environment variable forcing deferred (log-and-replay) compute recording
pub const ENV_FORCE_DEFERRED: &str = "VKCMD_FORCE_DEFERRED";

/// Environment variable for the device arena size in MiB
pub const ENV_DEVICE_ARENA_MB: &str = "VKCMD_DEVICE_ARENA_MB";

/// Environment variable for the staging arena size in MiB
pub const ENV_STAGING_ARENA_MB: &str = "VKCMD_STAGING_ARENA_MB";

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Record compute work through the replay log even when the device
    /// supports push descriptors
    pub force_deferred: bool,

    /// Bytes reserved for device-local tensors
    pub device_arena_size: u64,

    /// Bytes reserved for per-tensor staging regions
    pub staging_arena_size: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            force_deferred: false,
            device_arena_size: 256 * MB,
            staging_arena_size: 64 * MB,
        }
    }
}

impl RecorderConfig {
    /// Parse a JSON object; missing fields keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, CommandErrorKind> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VKCMD_*` environment variables.
    pub fn from_env() -> Result<Self, CommandErrorKind> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_vars<F>(lookup: F) -> Result<Self, CommandErrorKind>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_FORCE_DEFERRED) {
            config.force_deferred = parse_bool(ENV_FORCE_DEFERRED, &v)?;
        }
        if let Some(v) = lookup(ENV_DEVICE_ARENA_MB) {
            config.device_arena_size = parse_u64(ENV_DEVICE_ARENA_MB, &v)? * MB;
        }
        if let Some(v) = lookup(ENV_STAGING_ARENA_MB) {
            config.staging_arena_size = parse_u64(ENV_STAGING_ARENA_MB, &v)? * MB;
        }

        config.validate()?;
        log::debug!("Loaded recorder config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CommandErrorKind> {
        if self.device_arena_size == 0 {
            return Err(CommandErrorKind::Config(
                "device_arena_size must be greater than zero".into(),
            ));
        }
        if self.staging_arena_size == 0 {
            return Err(CommandErrorKind::Config(
                "staging_arena_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, CommandErrorKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CommandErrorKind::Config(format!(
            "{name}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, CommandErrorKind> {
    value
        .trim()
        .parse()
        .map_err(|e| CommandErrorKind::Config(format!("{name}: {e}")))
}
