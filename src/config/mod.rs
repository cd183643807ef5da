//! Configuration management for the coordination substrate.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Environment variable overrides
//! - Configuration file support
//! - Component-wise validation
mod election;
mod etcd;
mod informer;
mod sync;
mod tls;
pub use election::*;
pub use etcd::*;
pub use informer::*;
pub use sync::*;
pub use tls::*;


use std::env;
use std::fmt::Debug;
use std::path::PathBuf;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Environment variable prefix, e.g. `COORD__ETCD__NAMESPACE=/region1`
pub const ENV_PREFIX: &str = "COORD";

/// Main configuration container for the coordination components
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone)]
pub struct CoordConfig {
    /// Directory of the daemon log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// etcd connection options
    #[serde(default)]
    pub etcd: EtcdConfig,
    /// Change notification bus parameters
    #[serde(default)]
    pub informer: InformerConfig,
    /// Leader election parameters
    #[serde(default)]
    pub election: ElectionConfig,
    /// Debounced resync parameters
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            etcd: EtcdConfig::default(),
            informer: InformerConfig::default(),
            election: ElectionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Debug for CoordConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CoordConfig")
            .field("log_dir", &self.log_dir)
            .field("etcd", &self.etcd)
            .field("informer", &self.informer)
            .field("election", &self.election)
            .field("sync", &self.sync)
            .finish()
    }
}

impl CoordConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `COORD__` prefix (highest priority)
    ///
    /// # Note
    /// Validation is deferred to allow further overrides via `with_override_config()`.
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/coord.toml");
    /// std::env::set_var("COORD__ETCD__NAMESPACE", "/region1");
    /// let cfg = CoordConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.etcd.validate()?;
        self.informer.validate()?;
        self.election.validate()?;
        self.sync.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("etcd.endpoints")
        .with_list_parse_key("informer.watch_resources")
}
