//! Debounced resync scheduling.
//!
//! A [`SyncManager`] collapses bursts of change notifications into at most one
//! running and one queued full resync, and re-arms a timer with whatever
//! interval the last resync asked for.

mod sync_manager;

pub use sync_manager::*;


use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tonic::async_trait;

use crate::Result;

/// The domain side of a [`SyncManager`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncClient: Send + Sync + 'static {
    /// Performs one full resync and returns the delay before the next
    /// timer-driven one.
    async fn do_sync(
        &self,
        first: bool,
        timeout: bool,
    ) -> Result<Duration>;

    /// Whether a notification about `obj` warrants a resync
    fn need_sync(
        &self,
        obj: &Value,
    ) -> bool;

    fn name(&self) -> String;
}
