use std::path::Path;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// TLS material used when dialing etcd
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Enables TLS towards the etcd endpoints
    /// Default: false (plain-text gRPC)
    #[serde(default)]
    pub enable_tls: bool,

    /// Path to the Certificate Authority root certificate in PEM format
    /// Default: "/etc/ssl/certs/ca.pem"
    #[serde(default = "default_ca_path")]
    pub ca_cert_path: String,

    /// Client certificate path in PEM format (mTLS, optional)
    #[serde(default)]
    pub cert_path: Option<String>,

    /// Client private key path in PEM format (mTLS, optional)
    #[serde(default)]
    pub key_path: Option<String>,

    /// Server name to verify against the certificate, if different from the endpoint host
    #[serde(default)]
    pub domain_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enable_tls: false,
            ca_cert_path: default_ca_path(),
            cert_path: None,
            key_path: None,
            domain_name: None,
        }
    }
}

impl TlsConfig {
    /// Client identity is configured when both cert and key are present
    pub fn has_identity(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enable_tls {
            return Ok(());
        }

        if !Path::new(&self.ca_cert_path).exists() {
            return Err(Error::Config(ConfigError::Message(format!(
                "tls.ca_cert_path {} does not exist",
                self.ca_cert_path
            ))));
        }

        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(Error::Config(ConfigError::Message(
                "tls.cert_path and tls.key_path must be set together".into(),
            )));
        }

        for path in [&self.cert_path, &self.key_path].into_iter().flatten() {
            if !Path::new(path).exists() {
                return Err(Error::Config(ConfigError::Message(format!(
                    "tls file {} does not exist",
                    path
                ))));
            }
        }

        Ok(())
    }
}

fn default_ca_path() -> String {
    "/etc/ssl/certs/ca.pem".into()
}
