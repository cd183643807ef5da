//! Model snapshots kept directly in etcd.
//!
//! Services without a relational store persist their objects as JSON under
//! `/models/{keyword_plural}/{id}`. Detail views ("specs") of a model are
//! served from an explicit [`SpecHandlers`] table.

mod manager;
mod spec_handlers;

pub use manager::*;
pub use spec_handlers::*;
