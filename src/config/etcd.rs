//! etcd connection options
//!
//! ```toml
//! [etcd]
//! endpoints = ["http://127.0.0.1:2379"]
//! namespace = "/region1"
//! lease_ttl_secs = 10
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::TlsConfig;
use crate::Error;
use crate::Result;

/// Connection, timeout and credential settings for one etcd cluster
#[derive(Serialize, Deserialize, Clone)]
pub struct EtcdConfig {
    /// Client endpoints, e.g. `http://127.0.0.1:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Key prefix prepended to every key this process touches.
    /// Empty means the root keyspace.
    #[serde(default)]
    pub namespace: String,

    /// Connection establishment timeout (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Per-call deadline for put/get/list/delete (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// TTL of the client's renewable lease (seconds)
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl std::fmt::Debug for EtcdConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdConfig")
            .field("endpoints", &self.endpoints)
            .field("namespace", &self.namespace)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("lease_ttl_secs", &self.lease_ttl_secs)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            namespace: String::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            username: None,
            password: None,
            tls: TlsConfig::default(),
        }
    }
}

impl EtcdConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "etcd.endpoints must contain at least one endpoint".into(),
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "etcd.request_timeout_ms must be at least 1ms".into(),
            )));
        }

        // etcd refuses leases shorter than its minimum TTL
        if self.lease_ttl_secs < 2 {
            return Err(Error::Config(ConfigError::Message(format!(
                "etcd.lease_ttl_secs must be >= 2, got {}",
                self.lease_ttl_secs
            ))));
        }

        if !self.namespace.is_empty() && !self.namespace.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "etcd.namespace must start with '/', got {}",
                self.namespace
            ))));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config(ConfigError::Message(
                "etcd.username and etcd.password must be set together".into(),
            )));
        }

        self.tls.validate()
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_dial_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_lease_ttl_secs() -> i64 {
    10
}
