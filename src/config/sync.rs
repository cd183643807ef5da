use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Debounced resync parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    /// Lower bound of the interval between two timer driven resyncs (milliseconds).
    /// Also used as the next interval after a failed resync.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl SyncConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sync.min_interval_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_min_interval_ms() -> u64 {
    30_000
}
