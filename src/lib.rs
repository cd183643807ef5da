//! Coordination substrate on top of etcd.
//!
//! - [`LeaseSessionClient`]: namespaced KV access bound to a self-renewing
//!   lease session, plus prefix watches classified into create/modify/delete
//! - [`Informer`]: a change notification bus whose etcd backend
//!   ([`EtcdInformerBackend`]) writes lease-scoped change envelopes and whose
//!   consumer ([`EtcdBackendForClient`]) announces its presence and rebuilds
//!   its subscriptions after a session loss
//! - [`SyncManager`]: debounced full resync scheduling
//! - [`Elect`]: leader election over an etcd mutex
//! - [`EtcdModelManager`]: model snapshots stored directly in etcd
//!
//! All etcd traffic goes through the [`KvStore`] seam; [`MemStore`] emulates
//! it in-process.

mod config;
pub mod constants;
mod elect;
mod errors;
mod etcd;
mod informer;
mod models;
mod store;
mod syncman;
pub mod utils;

pub use config::*;
pub use elect::*;
pub use errors::*;
pub use etcd::*;
pub use informer::*;
pub use models::*;
pub use store::*;
pub use syncman::*;
pub use utils::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
