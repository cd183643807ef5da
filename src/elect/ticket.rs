use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::ElectionError;
use crate::KvStore;
use crate::Result;

/// Lease plus keepalive backing one campaign attempt
#[derive(Debug)]
pub struct ElectionSession {
    lease_id: i64,
    done: CancellationToken,
    keepalive: JoinHandle<()>,
}

impl ElectionSession {
    /// Grants a lease of `ttl_secs` and keeps it alive until closed. The
    /// session is done as soon as the lease can no longer be renewed.
    pub async fn open(
        store: &Arc<dyn KvStore>,
        ttl_secs: i64,
        timeout: Duration,
    ) -> Result<Self> {
        let grant = tokio::time::timeout(timeout, store.grant(ttl_secs))
            .await
            .map_err(|_| ElectionError::Session("grant timed out".into()))?
            .map_err(|e| ElectionError::Session(e.to_string()))?;

        let mut rx = match store.keep_alive(grant.id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = store.revoke(grant.id).await;
                return Err(ElectionError::Session(e.to_string()).into());
            }
        };

        let done = CancellationToken::new();
        let signal = done.clone();
        let lease_id = grant.id;
        let keepalive = tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                trace!("election lease {:x} renewed ({}s)", resp.id, resp.ttl);
            }
            debug!("election lease {:x} lost", lease_id);
            signal.cancel();
        });

        Ok(Self {
            lease_id,
            done,
            keepalive,
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Stops renewing and revokes the lease.
    pub async fn close(
        self,
        store: &Arc<dyn KvStore>,
    ) {
        self.keepalive.abort();
        self.done.cancel();
        if let Err(e) = store.revoke(self.lease_id).await {
            debug!("revoke election lease {:x}: {}", self.lease_id, e);
        }
    }
}

/// What a campaign attempt obtained so far. Returned even when the attempt
/// failed halfway, so that the caller releases whatever was acquired.
#[derive(Debug, Default)]
pub struct ElectionTicket {
    pub session: Option<ElectionSession>,
    pub lock_key: Option<String>,
}

impl ElectionTicket {
    pub fn is_held(&self) -> bool {
        self.session.is_some() && self.lock_key.is_some()
    }

    /// Unlocks the mutex and closes the session, each if present.
    pub async fn release(
        self,
        store: &Arc<dyn KvStore>,
    ) {
        if let Some(key) = self.lock_key {
            if let Err(e) = store.unlock(&key).await {
                debug!("unlock {}: {}", key, e);
            }
        }
        if let Some(session) = self.session {
            session.close(store).await;
        }
    }
}
