//! Key-value store seam between the coordination components and etcd.
//!
//! Everything above this module (lease sessions, prefix watches, the informer
//! backend and leader election) talks to etcd through [`KvStore`]. Two
//! adaptors are provided:
//!
//! - [`EtcdStore`]: the etcd v3 gRPC API via `etcd-client`
//! - [`MemStore`]: an in-process emulation with revisions, leases, prefix
//!   watches and lease-bound locks, used in standalone mode and in tests
//!
//! Keys handed to a [`KvStore`] are absolute; namespacing is applied by
//! [`crate::LeaseSessionClient`].

mod etcd_store;
mod mem_store;

pub use etcd_store::*;
pub use mem_store::*;


#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use crate::Result;

/// A single key-value pair as stored by etcd
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Lease the key is bound to, 0 when none
    pub lease: i64,
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl KeyValue {
    pub fn value_str(&self) -> &str {
        std::str::from_utf8(&self.value).unwrap_or("<non-utf8>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Put,
    Delete,
}

/// An event as delivered by an etcd watch stream with previous KV enabled
#[derive(Debug, Clone)]
pub struct RawWatchEvent {
    pub kind: RawEventKind,
    /// Current state; for deletes only the key is meaningful and the value is empty
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: i64,
    pub ttl: i64,
}

/// One successful renewal of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: i64,
    pub ttl: i64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Human readable adaptor name for logs
    fn kind(&self) -> &'static str;

    /// Grants a new lease with the given TTL in seconds.
    async fn grant(
        &self,
        ttl: i64,
    ) -> Result<LeaseGrant>;

    /// Revokes a lease and deletes every key bound to it.
    async fn revoke(
        &self,
        lease_id: i64,
    ) -> Result<()>;

    /// Starts renewing a lease.
    ///
    /// The returned channel yields one response per renewal and is closed
    /// as soon as the lease can no longer be kept alive (expired, revoked,
    /// connection lost). A closed channel is the only failure signal.
    async fn keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<mpsc::Receiver<KeepAliveResponse>>;

    /// Writes a value, optionally bound to a lease.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<i64>,
    ) -> Result<()>;

    /// Reads one key. Absent keys are `Ok(None)`.
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>>;

    /// Prefix scan sorted descending by key.
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>>;

    /// Deletes one key and returns the previous key-values that were removed.
    async fn delete(
        &self,
        key: &str,
    ) -> Result<Vec<KeyValue>>;

    /// Watches every key under `prefix` with previous KV attached.
    ///
    /// Events are delivered in revision order until `cancel` fires, at which
    /// point the server-side watch is cancelled and the channel closed.
    async fn watch(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RawWatchEvent>>;

    /// Acquires the mutex `name` on behalf of `lease_id`, waiting for the
    /// current owner to release it. Returns the ownership key.
    async fn lock(
        &self,
        name: &str,
        lease_id: i64,
    ) -> Result<String>;

    /// Releases a mutex by its ownership key.
    async fn unlock(
        &self,
        key: &str,
    ) -> Result<()>;
}
