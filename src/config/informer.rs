use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Change notification bus parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InformerConfig {
    /// Root of all informer keys, below the etcd namespace
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Number of workers draining publish tasks
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bound of the publish queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Resources this process watches at start-up (consumer side)
    #[serde(default)]
    pub watch_resources: Vec<String>,

    /// Skip producer writes when no client announced interest in the resource
    #[serde(default)]
    pub skip_without_clients: bool,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
            watch_resources: Vec::new(),
            skip_without_clients: false,
        }
    }
}

impl InformerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.prefix.starts_with('/') || self.prefix.ends_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "informer.prefix must start with '/' and not end with '/', got {}",
                self.prefix
            ))));
        }

        if self.worker_count == 0 {
            return Err(Error::Config(ConfigError::Message(
                "informer.worker_count must be greater than 0".into(),
            )));
        }

        if self.queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "informer.queue_size must be greater than 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_prefix() -> String {
    "/onecloud/informer".into()
}
fn default_worker_count() -> usize {
    10
}
fn default_queue_size() -> usize {
    10240
}
