//! etcd v3 adaptor built on `etcd-client`.

use std::time::Duration;

use etcd_client::Certificate;
use etcd_client::Client;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::Identity;
use etcd_client::LockOptions;
use etcd_client::PutOptions;
use etcd_client::SortOrder;
use etcd_client::SortTarget;
use etcd_client::TlsOptions;
use etcd_client::WatchOptions;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::KeepAliveResponse;
use super::KeyValue;
use super::KvStore;
use super::LeaseGrant;
use super::RawEventKind;
use super::RawWatchEvent;
use crate::EtcdConfig;
use crate::Result;
use crate::StoreError;
use crate::TlsConfig;

const WATCH_CHANNEL_SIZE: usize = 1024;
const KEEPALIVE_CHANNEL_SIZE: usize = 16;
const KEEPALIVE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_WATCH_BACKOFF: Duration = Duration::from_secs(30);

/// [`KvStore`] backed by a real etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Dials the cluster described by `config`.
    ///
    /// Connectivity and TLS errors are returned to the caller; there is no
    /// retry at this level.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(3));

        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        if config.tls.enable_tls {
            options = options.with_tls(tls_options(&config.tls)?);
        }

        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| StoreError::Connect(format!("{:?}: {}", config.endpoints, e)))?;

        info!("connected to etcd cluster {:?}", config.endpoints);
        Ok(Self { client })
    }

    /// Wraps an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn tls_options(tls: &TlsConfig) -> Result<TlsOptions> {
    let ca = std::fs::read(&tls.ca_cert_path)
        .map_err(|e| StoreError::Tls(format!("read {}: {}", tls.ca_cert_path, e)))?;
    let mut options = TlsOptions::new().ca_certificate(Certificate::from_pem(ca));

    if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
        let cert = std::fs::read(cert_path).map_err(|e| StoreError::Tls(format!("read {}: {}", cert_path, e)))?;
        let key = std::fs::read(key_path).map_err(|e| StoreError::Tls(format!("read {}: {}", key_path, e)))?;
        options = options.identity(Identity::from_pem(cert, key));
    }

    if let Some(domain) = &tls.domain_name {
        options = options.domain_name(domain.clone());
    }

    Ok(options)
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        lease: kv.lease(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<RawWatchEvent> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => RawEventKind::Put,
        EventType::Delete => RawEventKind::Delete,
    };
    Some(RawWatchEvent {
        kind,
        kv: convert_kv(kv),
        prev_kv: event.prev_kv().map(convert_kv),
    })
}

/// Revoking a lease the server no longer knows is reported as `NotFound`.
pub(super) fn is_lease_not_found(e: &etcd_client::Error) -> bool {
    match e {
        etcd_client::Error::GRpcStatus(status) => {
            status.code() == tonic::Code::NotFound || status.message().contains("lease not found")
        }
        _ => false,
    }
}

/// Where to resume a watch the server cancelled for compaction. Revisions
/// below `compact_revision` are gone, so the watch restarts there.
pub(super) fn resume_revision(
    next_revision: Option<i64>,
    compact_revision: i64,
) -> Option<i64> {
    match next_revision {
        Some(next) if next >= compact_revision => Some(next),
        _ => Some(compact_revision),
    }
}

fn watch_options(start_revision: Option<i64>) -> WatchOptions {
    let options = WatchOptions::new().with_prefix().with_prev_key();
    match start_revision {
        Some(revision) => options.with_start_revision(revision),
        None => options,
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    fn kind(&self) -> &'static str {
        "etcd"
    }

    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseGrant> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(LeaseGrant {
            id: resp.id(),
            ttl: resp.ttl(),
        })
    }

    async fn revoke(
        &self,
        lease_id: i64,
    ) -> Result<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease_id).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(StoreError::LeaseNotFound(lease_id).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let (tx, rx) = mpsc::channel(KEEPALIVE_CHANNEL_SIZE);

        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease_id, error = %e, "etcd lease keep-alive request failed");
                    break;
                }

                let interval = match timeout(KEEPALIVE_RESPONSE_TIMEOUT, stream.message()).await {
                    Ok(Ok(Some(resp))) => {
                        if resp.ttl() <= 0 {
                            warn!(lease_id, "etcd lease expired");
                            break;
                        }
                        let interval = Duration::from_secs((resp.ttl() as u64 / 3).max(1));
                        let resp = KeepAliveResponse {
                            id: resp.id(),
                            ttl: resp.ttl(),
                        };
                        if tx.send(resp).await.is_err() {
                            debug!(lease_id, "keep-alive receiver dropped");
                            break;
                        }
                        interval
                    }
                    Ok(Ok(None)) => {
                        warn!(lease_id, "etcd keep-alive stream ended");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(lease_id, error = %e, "etcd keep-alive stream error");
                        break;
                    }
                    Err(_) => {
                        warn!(lease_id, "etcd keep-alive response timed out");
                        break;
                    }
                };

                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = tx.closed() => break,
                }
            }
            // dropping tx closes the channel, which is the failure signal
        });

        Ok(rx)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Descend);
        let resp = client.get(prefix, Some(options)).await?;
        Ok(resp.kvs().iter().map(convert_kv).collect())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.delete(key, Some(DeleteOptions::new().with_prev_key())).await?;
        Ok(resp.prev_kvs().iter().map(convert_kv).collect())
    }

    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RawWatchEvent>> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(prefix, Some(watch_options(None))).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut next_revision: Option<i64> = None;
            let mut failures: u32 = 0;

            'outer: loop {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        msg = stream.message() => msg,
                    };
                    match msg {
                        Ok(Some(resp)) => {
                            failures = 0;
                            if resp.canceled() {
                                if resp.compact_revision() > 0 {
                                    warn!(
                                        prefix = %prefix,
                                        requested = ?next_revision,
                                        compact_revision = resp.compact_revision(),
                                        "etcd watch revision compacted, events before it are lost"
                                    );
                                    next_revision = resume_revision(next_revision, resp.compact_revision());
                                } else {
                                    warn!(prefix = %prefix, reason = resp.cancel_reason(), "etcd watch canceled by server");
                                }
                                break;
                            }
                            for event in resp.events() {
                                let Some(event) = convert_event(event) else {
                                    continue;
                                };
                                next_revision = Some(event.kv.mod_revision + 1);
                                if tx.send(event).await.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(prefix = %prefix, "etcd watch stream ended, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "etcd watch stream error, reconnecting");
                            break;
                        }
                    }
                }

                if let Err(e) = watcher.cancel().await {
                    debug!(prefix = %prefix, error = %e, "failed to cancel broken etcd watch");
                }

                // Re-create the watch from the next unseen revision
                loop {
                    failures += 1;
                    let backoff = std::cmp::min(
                        Duration::from_millis(200u64.saturating_mul(1u64 << failures.min(10))),
                        MAX_WATCH_BACKOFF,
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    match client.watch(prefix.as_str(), Some(watch_options(next_revision))).await {
                        Ok((new_watcher, new_stream)) => {
                            info!(prefix = %prefix, attempt = failures, "etcd watch reconnected");
                            watcher = new_watcher;
                            stream = new_stream;
                            break;
                        }
                        Err(e) => {
                            warn!(prefix = %prefix, attempt = failures, error = %e, "etcd watch reconnection failed");
                        }
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                debug!(prefix = %prefix, error = %e, "failed to cancel etcd watch on exit");
            }
        });

        Ok(rx)
    }

    async fn lock(
        &self,
        name: &str,
        lease_id: i64,
    ) -> Result<String> {
        let mut client = self.client.clone();
        let resp = client.lock(name, Some(LockOptions::new().with_lease(lease_id))).await?;
        Ok(String::from_utf8_lossy(resp.key()).into_owned())
    }

    async fn unlock(
        &self,
        key: &str,
    ) -> Result<()> {
        let mut client = self.client.clone();
        client.unlock(key).await?;
        Ok(())
    }
}
