use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

/// Tunables of pipeline translation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Longest time a single native compile may take before it is considered failed.
    pub compile_timeout_ms: u64,

    /// Metal shading language version as `[major, minor]`.
    pub msl_version: [u8; 2],

    /// Emulate image view swizzles for every texture instead of only the identity-incompatible ones.
    pub full_image_view_swizzle: bool,

    pub max_buffers_per_stage: u32,
    pub max_textures_per_stage: u32,
    pub max_samplers_per_stage: u32,
    pub max_tessellation_factor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compile_timeout_ms: 10_000,
            msl_version: [2, 1],
            full_image_view_swizzle: false,
            max_buffers_per_stage: 31,
            max_textures_per_stage: 128,
            max_samplers_per_stage: 16,
            max_tessellation_factor: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

pub const ENV_COMPILE_TIMEOUT_MS: &str = "MEV_PIPE_COMPILE_TIMEOUT_MS";
pub const ENV_FULL_IMAGE_VIEW_SWIZZLE: &str = "MEV_PIPE_FULL_IMAGE_VIEW_SWIZZLE";
pub const ENV_MSL_VERSION: &str = "MEV_PIPE_MSL_VERSION";

impl Config {
    #[inline]
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads config from the file at `path`.
    ///
    /// Falls back to defaults when the file is absent or malformed.
    pub fn load(path: &Path) -> Self {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    tracing::debug!("No config found at {}", path.display());
                } else {
                    tracing::warn!("Failed to read config from {}: {}", path.display(), err);
                }
                return Config::default();
            }
        };

        match Config::from_toml_str(&s) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to load config from {}: {}", path.display(), err);
                Config::default()
            }
        }
    }

    /// Overrides fields from `MEV_PIPE_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    fn apply_vars(
        &mut self,
        mut lookup: impl FnMut(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_COMPILE_TIMEOUT_MS) {
            self.compile_timeout_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_COMPILE_TIMEOUT_MS,
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(ENV_FULL_IMAGE_VIEW_SWIZZLE) {
            self.full_image_view_swizzle = match value.trim() {
                "1" | "true" | "TRUE" => true,
                "0" | "false" | "FALSE" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_FULL_IMAGE_VIEW_SWIZZLE,
                        value: value.clone(),
                    })
                }
            };
        }

        if let Some(value) = lookup(ENV_MSL_VERSION) {
            let invalid = || ConfigError::InvalidEnv {
                var: ENV_MSL_VERSION,
                value: value.clone(),
            };
            let (major, minor) = value.trim().split_once('.').ok_or_else(invalid)?;
            self.msl_version = [
                major.parse().map_err(|_| invalid())?,
                minor.parse().map_err(|_| invalid())?,
            ];
        }

        Ok(())
    }
}
