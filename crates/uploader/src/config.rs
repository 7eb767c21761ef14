//! Uploader configuration.
//!
//! Read from `<config dir>/skyhaul/config.json`. Every field is optional;
//! a missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyhaul_credentials::PoolConfig;
use skyhaul_protocol::constants::{
    DEFAULT_ALLOCATION_BATCH, DEFAULT_RETRY_DELAY, FRESH_MARGIN, LOW_WATER_MARK,
    RESTART_THRESHOLD, USABLE_MARGIN,
};
use skyhaul_workspace::{config_dir, default_storage_root};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Parent directory of all account workspaces.
    pub storage_root: PathBuf,

    /// Credential allocation endpoint. Empty disables allocation.
    pub allocation_url: String,

    /// Bearer token for the allocation endpoint.
    pub allocation_token: String,

    /// Credentials requested per refill.
    pub allocation_batch: usize,

    /// Refill when fewer usable credentials remain.
    pub low_water_mark: usize,

    /// Restart count above which a job's credential is rotated.
    pub restart_threshold: u32,

    pub usable_margin_secs: u64,

    pub fresh_margin_secs: u64,

    /// Delay before retrying after a dropped connection.
    pub retry_delay_secs: u64,

    /// Written into the workspace info file.
    pub build_tag: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root()
                .unwrap_or_else(|| PathBuf::from("skyhaul-uploads")),
            allocation_url: String::new(),
            allocation_token: String::new(),
            allocation_batch: DEFAULT_ALLOCATION_BATCH,
            low_water_mark: LOW_WATER_MARK,
            restart_threshold: RESTART_THRESHOLD,
            usable_margin_secs: USABLE_MARGIN.as_secs(),
            fresh_margin_secs: FRESH_MARGIN.as_secs(),
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            build_tag: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl UploaderConfig {
    /// Loads the configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads the configuration from `path`.
    ///
    /// A missing file yields the defaults; an unparsable one is reported
    /// and replaced by the defaults as well.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse uploader config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Rejects settings the service cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allocation_batch == 0 {
            return Err(ConfigError::Invalid(
                "allocation_batch must be at least 1".into(),
            ));
        }
        if self.fresh_margin_secs <= self.usable_margin_secs {
            return Err(ConfigError::Invalid(format!(
                "fresh_margin_secs ({}) must exceed usable_margin_secs ({})",
                self.fresh_margin_secs, self.usable_margin_secs
            )));
        }
        Ok(())
    }

    /// Returns `true` when credentials can be allocated remotely.
    pub fn allocation_enabled(&self) -> bool {
        !self.allocation_url.trim().is_empty()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Credential pool tuning derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            usable_margin: Duration::from_secs(self.usable_margin_secs),
            fresh_margin: Duration::from_secs(self.fresh_margin_secs),
            low_water_mark: self.low_water_mark,
            restart_threshold: self.restart_threshold,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("skyhaul").join("config.json"))
}
