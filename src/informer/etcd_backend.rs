//! etcd transport of the change notification bus, producer side.
//!
//! Key layout below the informer prefix:
//!
//! ```text
//! {prefix}/{keyword_plural}/{id}                          model notification
//! {prefix}/{keyword_plural}/{master_id}/{slave_id}        joint notification
//! {prefix}/{keyword_plural}/__informer_clients__/{host}   presence marker
//! ```
//!
//! Notifications are written on a short lease, so they vanish on their own;
//! consumers treat that expiry as "already gone" and never re-deliver it.

use serde_json::Value;
use tonic::async_trait;
use tracing::debug;
use tracing::trace;

use super::ChangeEnvelope;
use super::InformerBackend;
use super::InformerObject;
use crate::constants::CLIENTS_KEY;
use crate::constants::ETCD_BACKEND_TYPE;
use crate::InformerConfig;
use crate::LeaseSessionClient;
use crate::Result;

/// `{prefix}/{keyword_plural}/`
pub fn resource_prefix(
    prefix: &str,
    keyword_plural: &str,
) -> String {
    format!("{}/{}/", prefix, keyword_plural)
}

/// `{prefix}/{keyword_plural}/__informer_clients__/`
pub fn clients_prefix(
    prefix: &str,
    keyword_plural: &str,
) -> String {
    format!("{}/{}/{}/", prefix, keyword_plural, CLIENTS_KEY)
}

/// `{prefix}/{keyword_plural}/__informer_clients__/{hostname}`
pub fn presence_key(
    prefix: &str,
    keyword_plural: &str,
    hostname: &str,
) -> String {
    format!("{}{}", clients_prefix(prefix, keyword_plural), hostname)
}

/// Returns `(keyword_plural, hostname)` when `key` is a presence marker.
pub fn parse_presence_key<'a>(
    prefix: &str,
    key: &'a str,
) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.splitn(3, '/');
    let keyword = parts.next()?;
    if parts.next()? != CLIENTS_KEY {
        return None;
    }
    let host = parts.next()?;
    if keyword.is_empty() || host.is_empty() || host.contains('/') {
        return None;
    }
    Some((keyword, host))
}

/// Publishes notifications as lease-bound JSON envelopes
#[derive(Debug, Clone)]
pub struct EtcdInformerBackend {
    client: LeaseSessionClient,
    prefix: String,
    skip_without_clients: bool,
}

impl EtcdInformerBackend {
    pub fn new(
        client: LeaseSessionClient,
        config: &InformerConfig,
    ) -> Self {
        Self {
            client,
            prefix: config.prefix.clone(),
            skip_without_clients: config.skip_without_clients,
        }
    }

    pub fn object_key(
        &self,
        obj: &InformerObject,
    ) -> String {
        format!("{}/{}", self.prefix, obj.key_path())
    }

    /// True when at least one consumer announced interest in `keyword_plural`.
    pub async fn has_clients(
        &self,
        keyword_plural: &str,
    ) -> Result<bool> {
        let clients = self.client.list(&clients_prefix(&self.prefix, keyword_plural)).await?;
        Ok(!clients.is_empty())
    }

    async fn publish(
        &self,
        obj: &InformerObject,
        envelope: ChangeEnvelope,
    ) -> Result<()> {
        if self.skip_without_clients && !self.has_clients(obj.keyword_plural()).await? {
            trace!("no client watches {}, skip publish", obj.keyword_plural());
            return Ok(());
        }

        let key = self.object_key(obj);
        let value = envelope.encode()?;
        self.client
            .put_with_lease(&key, value, self.client.session_ttl())
            .await?;
        debug!("published {:?} to {}", envelope.event_type, key);
        Ok(())
    }
}

#[async_trait]
impl InformerBackend for EtcdInformerBackend {
    fn get_type(&self) -> &'static str {
        ETCD_BACKEND_TYPE
    }

    async fn create(
        &self,
        obj: InformerObject,
    ) -> Result<()> {
        let envelope = ChangeEnvelope::create(obj.object().clone());
        self.publish(&obj, envelope).await
    }

    async fn update(
        &self,
        obj: InformerObject,
        old_obj: Value,
    ) -> Result<()> {
        let envelope = ChangeEnvelope::update(obj.object().clone(), old_obj);
        self.publish(&obj, envelope).await
    }

    async fn delete(
        &self,
        obj: InformerObject,
    ) -> Result<()> {
        let envelope = ChangeEnvelope::delete(obj.object().clone());
        self.publish(&obj, envelope).await
    }
}
