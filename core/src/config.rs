use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuilderError, Result};

/// Free space below which workspace creation logs a warning: supported images may be this large.
pub const DEFAULT_MIN_FREE_SPACE_WARNING_BYTES: u64 = 6_000_000_000;

/// Time before the invocation deadline at which the workspace is reclaimed.
pub const DEFAULT_DEADLINE_SAFETY_MARGIN_SECS: u64 = 10;

/// Minimum layer size for which a ztoc is built (10 MiB).
pub const DEFAULT_MIN_LAYER_SIZE: u64 = 10_485_760;

/// Invocation timeout used when the caller does not supply a deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Mount point under which per-invocation workspaces are allocated
    pub workspace_root: PathBuf,

    /// Prefix of every workspace directory name
    pub workspace_prefix: String,

    /// Free space threshold for the low-capacity warning
    pub min_free_space_warning_bytes: u64,

    /// Safety margin subtracted from the invocation deadline
    pub deadline_safety_margin_secs: u64,

    /// Minimum layer size used when a request does not override it
    pub default_min_layer_size: u64,

    /// Invocation timeout for callers without their own deadline
    pub default_timeout_secs: u64,

    /// Target platform (`os/arch[/variant]`), host linux platform when unset
    pub platform: Option<String>,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir(),
            workspace_prefix: "soci-index".to_string(),
            min_free_space_warning_bytes: DEFAULT_MIN_FREE_SPACE_WARNING_BYTES,
            deadline_safety_margin_secs: DEFAULT_DEADLINE_SAFETY_MARGIN_SECS,
            default_min_layer_size: DEFAULT_MIN_LAYER_SIZE,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            platform: None,
            insecure_registries: Vec::new(),
        }
    }
}

impl BuilderConfig {
    /// Load configuration from a YAML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BuilderError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no invocation can run with.
    pub fn validate(&self) -> Result<()> {
        if self.workspace_prefix.trim().is_empty() {
            return Err(BuilderError::ConfigError(
                "workspace_prefix must not be empty".to_string(),
            ));
        }
        if self.workspace_prefix.contains('/') {
            return Err(BuilderError::ConfigError(format!(
                "workspace_prefix must not contain '/': {}",
                self.workspace_prefix
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(BuilderError::ConfigError(
                "default_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout_secs <= self.deadline_safety_margin_secs {
            return Err(BuilderError::ConfigError(format!(
                "default_timeout_secs ({}) must exceed deadline_safety_margin_secs ({}), \
                 otherwise every workspace is reclaimed as soon as it is created",
                self.default_timeout_secs, self.deadline_safety_margin_secs
            )));
        }
        Ok(())
    }

    pub fn deadline_safety_margin(&self) -> Duration {
        Duration::from_secs(self.deadline_safety_margin_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}
