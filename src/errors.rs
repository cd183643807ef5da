//! Coordination Error Hierarchy
//!
//! Defines error types for the etcd coordination substrate, categorized by
//! the layer that produced them: the key-value store seam, the change
//! notification bus and leader election.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key-value store and lease failures (etcd connectivity, timeouts, missing keys)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Change notification bus failures
    #[error(transparent)]
    Informer(#[from] InformerError),

    /// Leader election failures
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Model snapshot failures
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Background task failed to join
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// Task submitted to a worker pool that was already stopped
    #[error("Worker pool {0} stopped")]
    PoolStopped(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Returns true when the error means "the key is absent" rather than
    /// "the request failed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::NoSuchKey(_)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Distinguished not-found sentinel
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// Raw etcd client failures (gRPC status, transport)
    #[error("etcd request failed: {0}")]
    Etcd(#[from] Box<etcd_client::Error>),

    /// Per-call deadline exceeded
    #[error("{op} timed out after {duration:?}")]
    Timeout { op: &'static str, duration: Duration },

    /// Lease was revoked or expired before the call
    #[error("Lease {0:x} not found")]
    LeaseNotFound(i64),

    /// Keepalive stream ended and the session is gone
    #[error("Session closed")]
    SessionClosed,

    /// Connection to the cluster could not be established
    #[error("Failed to connect to etcd: {0}")]
    Connect(String),

    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    /// No backend registered through `Informer::init`/`Informer::set`
    #[error("Informer backend not initialized")]
    BackendNotInit,

    /// `Informer::init` called a second time
    #[error("Informer backend already initialized with {0}")]
    BackendAlreadyInit(String),

    /// Payload is not a JSON document
    #[error("Not json: {0}")]
    NotJson(String),

    /// Envelope (de)serialization failures
    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    /// Object without keyword or id
    #[error("Invalid informer object: {0}")]
    InvalidObject(String),

    /// Worker pool queue is full
    #[error("Worker pool {0} queue is full")]
    QueueFull(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// Election session (lease + keepalive) could not be created
    #[error("Failed to create election session: {0}")]
    Session(String),

    /// Mutex acquisition failed
    #[error("Failed to acquire election lock {key}: {reason}")]
    Lock { key: String, reason: String },

    /// Election loop already stopped
    #[error("Election stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// No handler registered for the requested detail spec
    #[error("Unknown spec {spec} for {keyword_plural}")]
    UnknownSpec { keyword_plural: String, spec: String },

    /// Model saved through a manager of another keyword
    #[error("Model keyword {got} does not match manager keyword {expected}")]
    KeywordMismatch { expected: String, got: String },
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Store(StoreError::Etcd(Box::new(e)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Informer(InformerError::Serde(e))
    }
}
