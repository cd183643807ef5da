//! Leader election over an etcd mutex.
//!
//! Each campaign attempt runs on its own lease. Winning means holding the
//! mutex at `{lock_prefix}/{key}`; losing the lease, being cancelled or
//! stopping all step the instance down, and `Lost` is always published before
//! the mutex is released so two instances never both report `Win`.

mod election;
mod ticket;

pub use election::*;
pub use ticket::*;

#[cfg(test)]
mod election_test;

/// State transitions delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectEvent {
    /// Nothing decided yet
    Init,
    Win,
    Lost,
}
