use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::InformerBackend;
use super::InformerObject;
use super::JointModelObject;
use super::ModelObject;
use super::WatchedResources;
use crate::EventType;
use crate::InformerConfig;
use crate::InformerError;
use crate::OverflowPolicy;
use crate::Result;
use crate::WorkerPool;

const POOL_NAME: &str = "informer";

/// Publish side of the change notification bus.
///
/// One instance is built at start-up and handed to everything that mutates
/// models. Events for resources nobody watches return immediately; the rest
/// are handed to the backend on a bounded worker pool, so a slow backend never
/// stalls the caller and a failing one only loses that notification.
pub struct Informer {
    watched: WatchedResources,
    backend: RwLock<Option<Arc<dyn InformerBackend>>>,
    pool: WorkerPool,
}

impl std::fmt::Debug for Informer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("watched", &self.watched.list())
            .field("backend", &self.backend_type())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Informer {
    /// Must be called within a tokio runtime; spawns the worker pool.
    pub fn new(config: &InformerConfig) -> Self {
        let watched = WatchedResources::new();
        watched.add(config.watch_resources.iter().cloned());
        Self {
            watched,
            backend: RwLock::new(None),
            pool: WorkerPool::new(POOL_NAME, config.worker_count, config.queue_size, OverflowPolicy::Reject),
        }
    }

    /// Installs the backend. A second call fails with `BackendAlreadyInit`.
    pub fn init(
        &self,
        backend: Arc<dyn InformerBackend>,
    ) -> Result<()> {
        let mut slot = self.backend.write();
        if let Some(existing) = slot.as_ref() {
            return Err(InformerError::BackendAlreadyInit(existing.get_type().to_string()).into());
        }
        info!("informer backend {} initialized", backend.get_type());
        *slot = Some(backend);
        Ok(())
    }

    /// Replaces the backend unconditionally.
    pub fn set(
        &self,
        backend: Arc<dyn InformerBackend>,
    ) {
        info!("informer backend set to {}", backend.get_type());
        *self.backend.write() = Some(backend);
    }

    pub fn backend_type(&self) -> Option<&'static str> {
        self.backend.read().as_ref().map(|b| b.get_type())
    }

    pub fn watched(&self) -> &WatchedResources {
        &self.watched
    }

    pub fn add_watched_resources<I, S>(
        &self,
        resources: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watched.add(resources);
    }

    pub fn delete_watched_resources<I, S>(
        &self,
        resources: I,
    ) where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.watched.delete(resources);
    }

    pub fn create(
        &self,
        obj: InformerObject,
    ) -> Result<()> {
        self.publish(EventType::Create, obj, None)
    }

    pub fn update(
        &self,
        obj: InformerObject,
        old_obj: Value,
    ) -> Result<()> {
        self.publish(EventType::Update, obj, Some(old_obj))
    }

    pub fn delete(
        &self,
        obj: InformerObject,
    ) -> Result<()> {
        self.publish(EventType::Delete, obj, None)
    }

    /// Like [`Informer::create`], serializing the model only when its
    /// resource is watched.
    pub fn create_model<M: ModelObject>(
        &self,
        model: &M,
    ) -> Result<()> {
        if !self.watched.has(model.keyword_plural()) {
            return Ok(());
        }
        self.create(InformerObject::from_model(model)?)
    }

    pub fn update_model<M: ModelObject>(
        &self,
        model: &M,
        old_model: &M,
    ) -> Result<()> {
        if !self.watched.has(model.keyword_plural()) {
            return Ok(());
        }
        self.update(InformerObject::from_model(model)?, serde_json::to_value(old_model)?)
    }

    pub fn delete_model<M: ModelObject>(
        &self,
        model: &M,
    ) -> Result<()> {
        if !self.watched.has(model.keyword_plural()) {
            return Ok(());
        }
        self.delete(InformerObject::from_model(model)?)
    }

    pub fn create_joint<M: JointModelObject>(
        &self,
        model: &M,
    ) -> Result<()> {
        if !self.watched.has(model.keyword_plural()) {
            return Ok(());
        }
        self.create(InformerObject::from_joint(model)?)
    }

    pub fn delete_joint<M: JointModelObject>(
        &self,
        model: &M,
    ) -> Result<()> {
        if !self.watched.has(model.keyword_plural()) {
            return Ok(());
        }
        self.delete(InformerObject::from_joint(model)?)
    }

    fn publish(
        &self,
        event_type: EventType,
        obj: InformerObject,
        old_obj: Option<Value>,
    ) -> Result<()> {
        if !self.watched.has(obj.keyword_plural()) {
            trace!("{} is not watched, skip {:?}", obj.keyword_plural(), event_type);
            return Ok(());
        }

        let backend = self.backend.read().clone().ok_or(InformerError::BackendNotInit)?;
        debug!("informer {:?} {}", event_type, obj.key_path());

        let task = async move {
            match event_type {
                EventType::Create => backend.create(obj).await,
                EventType::Update => backend.update(obj, old_obj.unwrap_or(Value::Null)).await,
                EventType::Delete => backend.delete(obj).await,
            }
        };
        self.pool.submit(task.boxed())
    }

    /// Number of publish tasks that failed in the backend
    pub fn failed_publishes(&self) -> u64 {
        self.pool.failed()
    }

    /// Number of publish tasks the backend completed
    pub fn completed_publishes(&self) -> u64 {
        self.pool.completed()
    }

    /// Stops accepting events and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        info!("informer stopped");
    }
}
