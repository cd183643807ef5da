use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::ModelError;
use crate::Result;

/// Computes one detail view from the stored model and a caller query
pub type SpecHandler = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// Detail views of one model keyword, by spec name
#[derive(Clone, Default)]
pub struct SpecHandlers {
    handlers: HashMap<String, SpecHandler>,
}

impl std::fmt::Debug for SpecHandlers {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SpecHandlers").field("specs", &self.specs()).finish()
    }
}

impl SpecHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `spec`, replacing any previous one.
    pub fn register<F>(
        &mut self,
        spec: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(spec.into(), Arc::new(handler));
        self
    }

    pub fn contains(
        &self,
        spec: &str,
    ) -> bool {
        self.handlers.contains_key(spec)
    }

    /// Registered spec names, sorted
    pub fn specs(&self) -> Vec<String> {
        let mut specs: Vec<String> = self.handlers.keys().cloned().collect();
        specs.sort();
        specs
    }

    pub(crate) fn call(
        &self,
        keyword_plural: &str,
        spec: &str,
        model: &Value,
        query: &Value,
    ) -> Result<Value> {
        let handler = self.handlers.get(spec).ok_or_else(|| ModelError::UnknownSpec {
            keyword_plural: keyword_plural.to_string(),
            spec: spec.to_string(),
        })?;
        handler(model, query)
    }
}
