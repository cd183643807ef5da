use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::InformerError;
use crate::Result;

/// A model that can be published on the change notification bus
pub trait ModelObject: Serialize {
    /// Plural resource keyword, e.g. `hosts`
    fn keyword_plural(&self) -> &str;

    fn id(&self) -> String;
}

/// A relation between two models, published under `{master_id}/{slave_id}`
pub trait JointModelObject: Serialize {
    fn keyword_plural(&self) -> &str;

    fn master_id(&self) -> String;

    fn slave_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InformerKey {
    Model { id: String },
    Joint { master_id: String, slave_id: String },
}

/// A typed, named JSON object travelling through the bus
#[derive(Debug, Clone, PartialEq)]
pub struct InformerObject {
    keyword_plural: String,
    key: InformerKey,
    object: Value,
}

impl InformerObject {
    pub fn new(
        keyword_plural: impl Into<String>,
        id: impl Into<String>,
        object: Value,
    ) -> Result<Self> {
        Self::build(keyword_plural.into(), InformerKey::Model { id: id.into() }, object)
    }

    pub fn joint(
        keyword_plural: impl Into<String>,
        master_id: impl Into<String>,
        slave_id: impl Into<String>,
        object: Value,
    ) -> Result<Self> {
        Self::build(
            keyword_plural.into(),
            InformerKey::Joint {
                master_id: master_id.into(),
                slave_id: slave_id.into(),
            },
            object,
        )
    }

    pub fn from_model<M: ModelObject>(model: &M) -> Result<Self> {
        Self::new(model.keyword_plural(), model.id(), serde_json::to_value(model)?)
    }

    pub fn from_joint<M: JointModelObject>(model: &M) -> Result<Self> {
        Self::joint(
            model.keyword_plural(),
            model.master_id(),
            model.slave_id(),
            serde_json::to_value(model)?,
        )
    }

    fn build(
        keyword_plural: String,
        key: InformerKey,
        object: Value,
    ) -> Result<Self> {
        check_segment("keyword", &keyword_plural)?;
        match &key {
            InformerKey::Model { id } => check_segment("id", id)?,
            InformerKey::Joint { master_id, slave_id } => {
                check_segment("master id", master_id)?;
                check_segment("slave id", slave_id)?;
            }
        }
        if !object.is_object() {
            return Err(InformerError::NotJson(format!("{} object is not a JSON document", keyword_plural)).into());
        }
        Ok(Self {
            keyword_plural,
            key,
            object,
        })
    }

    pub fn keyword_plural(&self) -> &str {
        &self.keyword_plural
    }

    pub fn key(&self) -> &InformerKey {
        &self.key
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn into_object(self) -> Value {
        self.object
    }

    /// `{keyword_plural}/{id}` or `{keyword_plural}/{master_id}/{slave_id}`
    pub fn key_path(&self) -> String {
        match &self.key {
            InformerKey::Model { id } => format!("{}/{}", self.keyword_plural, id),
            InformerKey::Joint { master_id, slave_id } => {
                format!("{}/{}/{}", self.keyword_plural, master_id, slave_id)
            }
        }
    }
}

fn check_segment(
    what: &str,
    value: &str,
) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(InformerError::InvalidObject(format!("{} {:?} is empty or contains '/'", what, value)).into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// What the etcd backend stores per notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub event_type: EventType,
    pub object: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
}

impl ChangeEnvelope {
    pub fn create(object: Value) -> Self {
        Self {
            event_type: EventType::Create,
            object,
            old_object: None,
        }
    }

    pub fn update(
        object: Value,
        old_object: Value,
    ) -> Self {
        Self {
            event_type: EventType::Update,
            object,
            old_object: Some(old_object),
        }
    }

    pub fn delete(object: Value) -> Self {
        Self {
            event_type: EventType::Delete,
            object,
            old_object: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a stored envelope. Anything that is not a JSON envelope is
    /// `NotJson`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| InformerError::NotJson(format!("{}: {}", String::from_utf8_lossy(bytes), e)).into())
    }
}
