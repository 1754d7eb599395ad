//! Contract of the transactional resource store the executor writes through.

use crate::context::RequestContext;
use crate::exception::{VitalError, VitalResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque identifier of a lockable unit. Compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// `Type/id`
    pub fn instance(resource_type: &str, id: &str) -> Self {
        Self(format!("{resource_type}/{id}"))
    }

    /// `Type?criteria`
    pub fn conditional(resource_type: &str, criteria: &SearchCriteria) -> Self {
        Self(format!("{resource_type}?{criteria}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Ordered `name=value` pairs of a match expression. The store decides what they mean.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub params: Vec<(String, String)>,
}

impl SearchCriteria {
    /// Parse `name=value&name=value`. Empty segments are skipped.
    pub fn parse(query: &str) -> VitalResult<Self> {
        let mut params = Vec::new();
        for segment in query.split('&').filter(|s| !s.is_empty()) {
            let (name, value) = segment.split_once('=').ok_or_else(|| {
                VitalError::validation(format!("malformed search parameter '{segment}'"))
            })?;
            if name.is_empty() {
                return Err(VitalError::validation(format!(
                    "empty search parameter name in '{segment}'"
                )));
            }
            params.push((name.to_string(), value.to_string()));
        }
        Ok(Self { params })
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// Result of a conditional create
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalCreate {
    Created(Value),
    Existing(Value),
}

/// Result of a conditional update
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalUpdate {
    Created(Value),
    Updated(Value),
}

/// Transactional resource store.
///
/// Every mutation goes through a `Transaction` handle obtained from `begin`. Mutations are
/// only visible to other transactions after `commit`; `rollback` discards them atomically.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    type Transaction: Send;

    async fn begin(&self, ctx: &RequestContext) -> VitalResult<Self::Transaction>;

    /// Persist a new resource, assigning it an id.
    async fn create(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        resource: Value,
    ) -> VitalResult<Value>;

    /// Fails with `NotFound` when the resource does not exist.
    async fn read(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        id: &str,
    ) -> VitalResult<Value>;

    /// Fails with `NotFound` when the resource does not exist.
    async fn update(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> VitalResult<Value>;

    /// Returns whether a resource was removed. Deleting a missing resource is not an error.
    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        id: &str,
    ) -> VitalResult<bool>;

    async fn search(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        criteria: &SearchCriteria,
    ) -> VitalResult<Vec<Value>>;

    async fn commit(&self, tx: Self::Transaction) -> VitalResult<()>;

    async fn rollback(&self, tx: Self::Transaction) -> VitalResult<()>;

    /// Create unless a resource already matches `criteria`.
    async fn conditional_create(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        criteria: &SearchCriteria,
        resource: Value,
    ) -> VitalResult<ConditionalCreate> {
        let mut matches = self.search(tx, resource_type, criteria).await?;
        match matches.len() {
            0 => Ok(ConditionalCreate::Created(
                self.create(tx, resource_type, resource).await?,
            )),
            1 => Ok(ConditionalCreate::Existing(matches.remove(0))),
            n => Err(multiple_matches(resource_type, criteria, n)),
        }
    }

    /// Update the single match, or create when nothing matches.
    async fn conditional_update(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        criteria: &SearchCriteria,
        resource: Value,
    ) -> VitalResult<ConditionalUpdate> {
        let matches = self.search(tx, resource_type, criteria).await?;
        match matches.as_slice() {
            [] => Ok(ConditionalUpdate::Created(
                self.create(tx, resource_type, resource).await?,
            )),
            [existing] => {
                let id = resource_id(existing)
                    .ok_or_else(|| VitalError::server("stored resource has no id"))?
                    .to_string();
                let resource = with_id(resource, &id);
                Ok(ConditionalUpdate::Updated(
                    self.update(tx, resource_type, &id, resource).await?,
                ))
            }
            _ => Err(multiple_matches(resource_type, criteria, matches.len())),
        }
    }

    /// Delete the single match. No match is a successful no-op.
    async fn conditional_delete(
        &self,
        tx: &mut Self::Transaction,
        resource_type: &str,
        criteria: &SearchCriteria,
    ) -> VitalResult<bool> {
        let matches = self.search(tx, resource_type, criteria).await?;
        match matches.as_slice() {
            [] => Ok(false),
            [existing] => {
                let id = resource_id(existing)
                    .ok_or_else(|| VitalError::server("stored resource has no id"))?
                    .to_string();
                self.delete(tx, resource_type, &id).await
            }
            _ => Err(multiple_matches(resource_type, criteria, matches.len())),
        }
    }
}

/// External schema validation hook consulted before writes
pub trait ResourceValidator: Send + Sync {
    fn validate(&self, resource_type: &str, resource: &Value) -> VitalResult<()>;
}

/// Checks only the envelope: a JSON object whose `resourceType` matches the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

impl ResourceValidator for StructuralValidator {
    fn validate(&self, resource_type: &str, resource: &Value) -> VitalResult<()> {
        let object = resource
            .as_object()
            .ok_or_else(|| VitalError::validation("resource must be a JSON object"))?;
        match object.get("resourceType").and_then(Value::as_str) {
            Some(t) if t == resource_type => {}
            Some(t) => {
                return Err(VitalError::validation(format!(
                    "resourceType '{t}' does not match '{resource_type}'"
                )))
            }
            None => return Err(VitalError::validation("missing resourceType")),
        }
        if let Some(id) = object.get("id") {
            if !id.is_string() {
                return Err(VitalError::validation("id must be a string"));
            }
        }
        Ok(())
    }
}

pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(Value::as_str)
}

/// `Type/id` of a stored resource
pub fn reference_string(resource: &Value) -> Option<String> {
    Some(format!("{}/{}", resource_type(resource)?, resource_id(resource)?))
}

pub fn with_id(mut resource: Value, id: &str) -> Value {
    if let Some(object) = resource.as_object_mut() {
        object.insert("id".to_string(), Value::String(id.to_string()));
    }
    resource
}

fn multiple_matches(resource_type: &str, criteria: &SearchCriteria, n: usize) -> VitalError {
    VitalError::precondition_failed(format!(
        "{n} {resource_type} resources match '{criteria}'"
    ))
}
