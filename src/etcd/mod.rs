//! Lease-scoped etcd client and its prefix watch subscriptions.
//!
//! [`LeaseSessionClient`] owns exactly one renewable lease. When the keepalive
//! stream dies the lease is replaced wholesale and registered hooks run, which
//! lets higher layers rebuild state that was bound to the dead lease.

mod client;
mod watch;

pub use client::*;
pub use watch::*;
