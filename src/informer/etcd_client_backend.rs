//! etcd transport of the change notification bus, consumer side.
//!
//! Every watched resource gets a presence key bound to the client session.
//! Losing the session deletes those keys; the consumer then rebuilds all of
//! its watches from `client_resources` and writes the markers again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::clients_prefix;
use super::parse_presence_key;
use super::presence_key;
use super::resource_prefix;
use super::ChangeEnvelope;
use super::ResourceEventHandler;
use crate::session_restarted_hook;
use crate::EventType;
use crate::InformerConfig;
use crate::LeaseSessionClient;
use crate::Result;
use crate::WatchEventHandler;

struct ClientBackendInner {
    client: LeaseSessionClient,
    prefix: String,
    hostname: String,
    client_resources: Mutex<HashMap<String, Arc<dyn ResourceEventHandler>>>,
}

/// Subscribes resource handlers to notifications written by
/// [`super::EtcdInformerBackend`]s.
#[derive(Clone)]
pub struct EtcdBackendForClient {
    inner: Arc<ClientBackendInner>,
}

impl std::fmt::Debug for EtcdBackendForClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdBackendForClient")
            .field("prefix", &self.inner.prefix)
            .field("hostname", &self.inner.hostname)
            .field("resources", &self.resources())
            .finish()
    }
}

impl EtcdBackendForClient {
    /// Uses the machine hostname in presence keys.
    pub fn new(
        client: LeaseSessionClient,
        config: &InformerConfig,
    ) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self::with_hostname(client, config, hostname)
    }

    /// Registers the self-healing hook on `client`: after every session
    /// restart all watches and presence keys are rebuilt.
    pub fn with_hostname(
        client: LeaseSessionClient,
        config: &InformerConfig,
        hostname: impl Into<String>,
    ) -> Self {
        let inner = Arc::new(ClientBackendInner {
            client: client.clone(),
            prefix: config.prefix.clone(),
            hostname: hostname.into(),
            client_resources: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        client.add_session_restarted_hook(session_restarted_hook(move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let backend = EtcdBackendForClient { inner };
                info!("session restarted, rebuilding informer watches");
                if let Err(e) = backend.start_client_watch().await {
                    warn!("rebuild informer watches after session restart: {}", e);
                }
            }
        }));

        Self { inner }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn client(&self) -> &LeaseSessionClient {
        &self.inner.client
    }

    /// Registered resources, sorted
    pub fn resources(&self) -> Vec<String> {
        let mut all: Vec<String> = self.inner.client_resources.lock().keys().cloned().collect();
        all.sort();
        all
    }

    /// Subscribes `handler` to `keyword_plural`, replacing any previous
    /// subscription for it.
    pub async fn watch(
        &self,
        keyword_plural: &str,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        self.inner
            .client_resources
            .lock()
            .insert(keyword_plural.to_string(), handler.clone());
        self.subscribe(keyword_plural, handler).await
    }

    /// Drops the subscription and presence key of `keyword_plural`.
    pub async fn unwatch(
        &self,
        keyword_plural: &str,
    ) -> Result<()> {
        self.inner.client_resources.lock().remove(keyword_plural);
        self.inner
            .client
            .unwatch(&resource_prefix(&self.inner.prefix, keyword_plural));
        self.inner
            .client
            .delete(&presence_key(&self.inner.prefix, keyword_plural, &self.inner.hostname))
            .await?;
        Ok(())
    }

    /// (Re-)issues the watch and presence key of every registered resource,
    /// then watches the informer root for lost presence keys.
    pub async fn start_client_watch(&self) -> Result<()> {
        let resources: Vec<(String, Arc<dyn ResourceEventHandler>)> = self
            .inner
            .client_resources
            .lock()
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();

        let mut first_err = None;
        for (keyword, handler) in resources {
            if let Err(e) = self.subscribe(&keyword, handler).await {
                warn!("re-watch {}: {}", keyword, e);
                first_err.get_or_insert(e);
            }
        }

        let root = format!("{}/", self.inner.prefix);
        let watcher = Arc::new(PresenceWatcher {
            backend: Arc::downgrade(&self.inner),
        });
        if self.inner.client.watch(&root, watcher).await? {
            debug!("watching {} for lost presence keys", root);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        keyword_plural: &str,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        let prefix = resource_prefix(&self.inner.prefix, keyword_plural);
        let client = &self.inner.client;

        if client.watchers().contains(&prefix) {
            client.unwatch(&prefix);
        }
        self.announce(keyword_plural).await?;

        let watcher = Arc::new(ResourceWatcher {
            keyword_plural: keyword_plural.to_string(),
            clients_prefix: clients_prefix(&self.inner.prefix, keyword_plural),
            handler,
        });
        client.watch(&prefix, watcher).await?;
        info!("informer watching {}", keyword_plural);
        Ok(())
    }

    /// Writes the presence key of `keyword_plural` again unless it has been
    /// unwatched meanwhile. Returns whether the key was written.
    pub(crate) async fn reannounce(
        &self,
        keyword_plural: &str,
    ) -> Result<bool> {
        if !self.inner.client_resources.lock().contains_key(keyword_plural) {
            return Ok(false);
        }
        self.announce(keyword_plural).await?;
        Ok(true)
    }

    async fn announce(
        &self,
        keyword_plural: &str,
    ) -> Result<()> {
        let key = presence_key(&self.inner.prefix, keyword_plural, &self.inner.hostname);
        self.inner
            .client
            .put_session(&key, self.inner.hostname.clone())
            .await
    }
}

/// Turns envelopes under one resource prefix into handler calls
struct ResourceWatcher {
    keyword_plural: String,
    clients_prefix: String,
    handler: Arc<dyn ResourceEventHandler>,
}

impl ResourceWatcher {
    fn handle(
        &self,
        key: &str,
        value: &[u8],
    ) {
        if key.starts_with(&self.clients_prefix) {
            trace!("presence traffic on {}", key);
            return;
        }
        let envelope = match ChangeEnvelope::decode(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("drop malformed {} notification at {}: {}", self.keyword_plural, key, e);
                return;
            }
        };
        match envelope.event_type {
            EventType::Create => self.handler.on_add(&envelope.object),
            EventType::Update => {
                let old = envelope.old_object.unwrap_or(Value::Null);
                self.handler.on_update(&old, &envelope.object)
            }
            EventType::Delete => self.handler.on_delete(&envelope.object),
        }
    }
}

impl WatchEventHandler for ResourceWatcher {
    fn on_create(
        &self,
        key: &str,
        value: &[u8],
    ) {
        self.handle(key, value);
    }

    fn on_modify(
        &self,
        key: &str,
        _old_value: &[u8],
        new_value: &[u8],
    ) {
        self.handle(key, new_value);
    }

    fn on_delete(
        &self,
        key: &str,
        _prev_value: Option<Vec<u8>>,
    ) {
        // notification lease expired or presence key removed
        trace!("ignore raw delete of {}", key);
    }
}

/// Re-announces presence when one of this host's markers disappears
struct PresenceWatcher {
    backend: Weak<ClientBackendInner>,
}

impl WatchEventHandler for PresenceWatcher {
    fn on_delete(
        &self,
        key: &str,
        _prev_value: Option<Vec<u8>>,
    ) {
        let Some(inner) = self.backend.upgrade() else {
            return;
        };
        let Some((keyword, host)) = parse_presence_key(&inner.prefix, key) else {
            return;
        };
        if host != inner.hostname || !inner.client_resources.lock().contains_key(keyword) {
            return;
        }

        let keyword = keyword.to_string();
        let backend = EtcdBackendForClient { inner };
        tokio::spawn(async move {
            match backend.reannounce(&keyword).await {
                Ok(true) => info!("presence key for {} lost, announced again", keyword),
                Ok(false) => debug!("{} unwatched before its presence key was restored", keyword),
                // the session is probably being restarted; the restart hook re-announces
                Err(e) => debug!("re-announce presence for {}: {}", keyword, e),
            }
        });
    }
}
