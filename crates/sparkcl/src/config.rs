//! Runtime configuration with TOML, environment variable, and default
//! sources.

use std::path::Path;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use sparkcl_driver::DeviceType;
use tracing::warn;

// ── Errors ──────────────────────────────────────────────────────────

/// Errors produced by configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid environment variable value for {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

pub const ENV_PLATFORM: &str = "SPARKCL_PLATFORM";
pub const ENV_AVOID_PLATFORMS: &str = "SPARKCL_AVOID_PLATFORMS";
pub const ENV_DEVICE_TYPE: &str = "SPARKCL_DEVICE_TYPE";
pub const ENV_DEVICE_INDEX: &str = "SPARKCL_DEVICE_INDEX";
pub const ENV_PROFILE: &str = "SPARKCL_PROFILE";
pub const ENV_BUILD_OPTIONS: &str = "SPARKCL_BUILD_OPTIONS";

// ── TOML wrapper ────────────────────────────────────────────────────

/// Wrapper used for the `[runtime]` table in TOML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TomlWrapper {
    runtime: RuntimeConfig,
}

// ── RuntimeConfig ───────────────────────────────────────────────────

/// Device selection, profiling and build settings for a runtime context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Platform to use; `None` picks the first acceptable one.
    pub platform_index: Option<usize>,
    /// Platform names skipped during automatic selection when an
    /// alternative exists.
    pub avoid_platforms: Vec<String>,
    pub device_type: DeviceType,
    pub device_index: usize,
    /// Record events for [`measure_time`](crate::RuntimeContext::measure_time).
    pub profiling: bool,
    /// Options passed to every program build.
    pub build_options: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            platform_index: None,
            avoid_platforms: vec!["Clover".to_string()],
            device_type: DeviceType::Gpu,
            device_index: 0,
            profiling: false,
            build_options: String::new(),
        }
    }
}

impl RuntimeConfig {
    // ── Constructors ────────────────────────────────────────────

    /// Load configuration from a TOML file at `path`.
    ///
    /// The file is expected to contain a `[runtime]` table. If the file
    /// does not exist, returns `Ok(Self::default())`.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("Config file not found: {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let wrapper: TomlWrapper = toml::from_str(text)?;
        Ok(wrapper.runtime)
    }

    /// Serialize to a TOML string (wrapped in `[runtime]`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let wrapper = TomlWrapper { runtime: self.clone() };
        Ok(toml::to_string_pretty(&wrapper)?)
    }

    /// Defaults overridden by any `SPARKCL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Apply `SPARKCL_*` environment variables on top of `self`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = env::var(ENV_PLATFORM) {
            self.platform_index = Some(Self::parse_env_usize(ENV_PLATFORM, &v)?);
        }
        if let Ok(v) = env::var(ENV_AVOID_PLATFORMS) {
            self.avoid_platforms = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = env::var(ENV_DEVICE_TYPE) {
            self.device_type = v.parse().map_err(|_| ConfigError::InvalidEnvVar {
                key: ENV_DEVICE_TYPE.to_string(),
                value: v.clone(),
            })?;
        }
        if let Ok(v) = env::var(ENV_DEVICE_INDEX) {
            self.device_index = Self::parse_env_usize(ENV_DEVICE_INDEX, &v)?;
        }
        if let Ok(v) = env::var(ENV_PROFILE) {
            self.profiling = Self::parse_env_bool(ENV_PROFILE, &v)?;
        }
        if let Ok(v) = env::var(ENV_BUILD_OPTIONS) {
            self.build_options = v;
        }
        Ok(self)
    }

    // ── Builders ────────────────────────────────────────────────

    #[must_use]
    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, index: usize) -> Self {
        self.platform_index = Some(index);
        self
    }

    #[must_use]
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    #[must_use]
    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = options.into();
        self
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.avoid_platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "avoid_platforms entries must be non-empty".into(),
            ));
        }
        if self.build_options.contains('\0') {
            return Err(ConfigError::Validation("build_options must not contain NUL".into()));
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn parse_env_usize(key: &str, val: &str) -> Result<usize, ConfigError> {
        val.trim().parse::<usize>().map_err(|_| ConfigError::InvalidEnvVar {
            key: key.to_string(),
            value: val.to_string(),
        })
    }

    fn parse_env_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
        match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnvVar { key: key.to_string(), value: val.to_string() }),
        }
    }
}
