use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Leader election parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElectionConfig {
    /// Prefix of all election mutexes
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,

    /// Election key of this service; the mutex lives at `{lock_prefix}/{key}`
    #[serde(default)]
    pub key: String,

    /// TTL of the campaign session lease (seconds)
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    /// Back-off between two campaign attempts (milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_prefix: default_lock_prefix(),
            key: String::new(),
            session_ttl_secs: default_session_ttl_secs(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ElectionConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs < 2 {
            return Err(Error::Config(ConfigError::Message(format!(
                "election.session_ttl_secs must be >= 2, got {}",
                self.session_ttl_secs
            ))));
        }

        if self.retry_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "election.retry_interval_ms must be greater than 0".into(),
            )));
        }

        if !self.lock_prefix.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "election.lock_prefix must start with '/', got {}",
                self.lock_prefix
            ))));
        }

        Ok(())
    }
}

fn default_lock_prefix() -> String {
    "/onecloud/lock".into()
}
fn default_session_ttl_secs() -> i64 {
    10
}
fn default_retry_interval_ms() -> u64 {
    3000
}
