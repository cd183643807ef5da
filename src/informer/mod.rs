//! Change notification bus.
//!
//! Producers call [`Informer::create`]/[`Informer::update`]/[`Informer::delete`]
//! for every model mutation. Only resources in the [`WatchedResources`] set
//! reach the backend; the etcd backend turns them into lease-bound envelopes
//! which consumers receive through [`EtcdBackendForClient`].

mod bus;
mod etcd_backend;
mod etcd_client_backend;
mod model;
mod watched;

pub use bus::*;
pub use etcd_backend::*;
pub use etcd_client_backend::*;
pub use model::*;
pub use watched::*;


#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tonic::async_trait;

use crate::Result;

/// Transport behind the bus
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InformerBackend: Send + Sync + 'static {
    fn get_type(&self) -> &'static str;

    async fn create(
        &self,
        obj: InformerObject,
    ) -> Result<()>;

    async fn update(
        &self,
        obj: InformerObject,
        old_obj: Value,
    ) -> Result<()>;

    async fn delete(
        &self,
        obj: InformerObject,
    ) -> Result<()>;
}

/// Receives decoded notifications for one resource
#[cfg_attr(test, automock)]
pub trait ResourceEventHandler: Send + Sync + 'static {
    fn on_add(
        &self,
        obj: &Value,
    );

    fn on_update(
        &self,
        old_obj: &Value,
        new_obj: &Value,
    );

    fn on_delete(
        &self,
        obj: &Value,
    );
}
