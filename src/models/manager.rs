use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::SpecHandlers;
use crate::constants::MODELS_PREFIX;
use crate::InformerError;
use crate::LeaseSessionClient;
use crate::ModelError;
use crate::ModelObject;
use crate::Result;

/// Stores models of one keyword under `/models/{keyword_plural}/{id}`
#[derive(Debug, Clone)]
pub struct EtcdModelManager {
    client: LeaseSessionClient,
    keyword_plural: String,
    specs: SpecHandlers,
}

impl EtcdModelManager {
    pub fn new(
        client: LeaseSessionClient,
        keyword_plural: impl Into<String>,
    ) -> Self {
        Self {
            client,
            keyword_plural: keyword_plural.into(),
            specs: SpecHandlers::new(),
        }
    }

    pub fn with_specs(
        mut self,
        specs: SpecHandlers,
    ) -> Self {
        self.specs = specs;
        self
    }

    pub fn keyword_plural(&self) -> &str {
        &self.keyword_plural
    }

    pub fn specs_mut(&mut self) -> &mut SpecHandlers {
        &mut self.specs
    }

    fn prefix(&self) -> String {
        format!("/{}/{}/", MODELS_PREFIX, self.keyword_plural)
    }

    pub fn model_key(
        &self,
        id: &str,
    ) -> String {
        format!("{}{}", self.prefix(), id)
    }

    /// Writes the model snapshot. The key is not bound to any lease.
    pub async fn save<M: ModelObject>(
        &self,
        model: &M,
    ) -> Result<()> {
        if model.keyword_plural() != self.keyword_plural {
            return Err(ModelError::KeywordMismatch {
                expected: self.keyword_plural.clone(),
                got: model.keyword_plural().to_string(),
            }
            .into());
        }
        let id = model.id();
        if id.is_empty() || id.contains('/') {
            return Err(InformerError::InvalidObject(format!("{}: bad model id {:?}", self.keyword_plural, id)).into());
        }
        let value = serde_json::to_vec(model)?;
        self.client.put(&self.model_key(&id), value).await?;
        debug!("saved {}/{}", self.keyword_plural, id);
        Ok(())
    }

    /// Fails with `NoSuchKey` when the model does not exist.
    pub async fn get<T: DeserializeOwned>(
        &self,
        id: &str,
    ) -> Result<T> {
        let raw = self.client.get(&self.model_key(id)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All models of this keyword, ordered by id. Entries that do not decode
    /// as `T` are skipped.
    pub async fn list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut kvs = self.client.list(&self.prefix()).await?;
        kvs.reverse();
        let mut models = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match serde_json::from_slice(&kv.value) {
                Ok(model) => models.push(model),
                Err(e) => warn!("skip undecodable model {}: {}", kv.key, e),
            }
        }
        Ok(models)
    }

    /// Returns whether the model existed.
    pub async fn delete(
        &self,
        id: &str,
    ) -> Result<bool> {
        let prev = self.client.delete(&self.model_key(id)).await?;
        Ok(prev.is_some())
    }

    /// Loads model `id` and renders its `spec` detail view for `query`.
    pub async fn get_details(
        &self,
        id: &str,
        spec: &str,
        query: &Value,
    ) -> Result<Value> {
        if !self.specs.contains(spec) {
            return Err(ModelError::UnknownSpec {
                keyword_plural: self.keyword_plural.clone(),
                spec: spec.to_string(),
            }
            .into());
        }
        let model: Value = self.get(id).await?;
        self.specs.call(&self.keyword_plural, spec, &model, query)
    }
}
