//! Memory-based resource store
//!
//! Transactions stage their writes privately (read-your-writes) and apply them to the shared
//! map under a single write lock on commit. Rollback drops the staged writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;
use vital_shared::store::{resource_id, with_id};
use vital_shared::{
    RequestContext, ResourceStore, ResourceValidator, SearchCriteria, StructuralValidator,
    VitalError, VitalResult,
};

/// Memory storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Maximum number of stored resources; commits that would exceed it fail
    pub max_resources: Option<usize>,
}

type ResourceMap = HashMap<String, BTreeMap<String, Value>>;

/// Operations staged by one transaction, keyed by (type, id)
#[derive(Debug)]
enum StagedWrite {
    Put(Value),
    Remove,
}

/// Unit of work against a `MemoryResourceStore`
#[derive(Debug)]
pub struct MemoryTransaction {
    id: String,
    request_id: String,
    staged: BTreeMap<(String, String), StagedWrite>,
}

impl MemoryTransaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }
}

/// In-memory transactional resource store
#[derive(Clone)]
pub struct MemoryResourceStore {
    config: MemoryStoreConfig,
    resources: Arc<RwLock<ResourceMap>>,
    validator: Arc<dyn ResourceValidator>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryResourceStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            resources: Arc::new(RwLock::new(HashMap::new())),
            validator: Arc::new(StructuralValidator),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ResourceValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Committed copy of a resource, outside any transaction
    pub async fn get(&self, resource_type: &str, id: &str) -> Option<Value> {
        let resources = self.resources.read().await;
        resources.get(resource_type)?.get(id).cloned()
    }

    /// Number of committed resources of a type
    pub async fn count(&self, resource_type: &str) -> usize {
        let resources = self.resources.read().await;
        resources.get(resource_type).map_or(0, BTreeMap::len)
    }

    async fn lookup(&self, tx: &MemoryTransaction, resource_type: &str, id: &str) -> Option<Value> {
        match tx.staged.get(&(resource_type.to_string(), id.to_string())) {
            Some(StagedWrite::Put(value)) => Some(value.clone()),
            Some(StagedWrite::Remove) => None,
            None => self.get(resource_type, id).await,
        }
    }

    fn stamp(resource: Value, id: &str) -> Value {
        let mut resource = with_id(resource, id);
        if let Some(object) = resource.as_object_mut() {
            object.insert(
                "meta".to_string(),
                json!({
                    "versionId": Uuid::new_v4().to_string(),
                    "lastUpdated": chrono::Utc::now().to_rfc3339(),
                }),
            );
        }
        resource
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self, ctx: &RequestContext) -> VitalResult<MemoryTransaction> {
        let tx = MemoryTransaction {
            id: Uuid::new_v4().to_string(),
            request_id: ctx.request_id().to_string(),
            staged: BTreeMap::new(),
        };
        debug!(transaction = %tx.id, "Began transaction");
        Ok(tx)
    }

    async fn create(
        &self,
        tx: &mut MemoryTransaction,
        resource_type: &str,
        resource: Value,
    ) -> VitalResult<Value> {
        self.validator.validate(resource_type, &resource)?;
        let id = Uuid::new_v4().to_string();
        let stored = Self::stamp(resource, &id);
        tx.staged.insert(
            (resource_type.to_string(), id),
            StagedWrite::Put(stored.clone()),
        );
        Ok(stored)
    }

    async fn read(
        &self,
        tx: &mut MemoryTransaction,
        resource_type: &str,
        id: &str,
    ) -> VitalResult<Value> {
        self.lookup(tx, resource_type, id)
            .await
            .ok_or_else(|| VitalError::not_found(format!("{resource_type}/{id}")))
    }

    async fn update(
        &self,
        tx: &mut MemoryTransaction,
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> VitalResult<Value> {
        if self.lookup(tx, resource_type, id).await.is_none() {
            return Err(VitalError::not_found(format!("{resource_type}/{id}")));
        }
        self.validator.validate(resource_type, &resource)?;
        let stored = Self::stamp(resource, id);
        tx.staged.insert(
            (resource_type.to_string(), id.to_string()),
            StagedWrite::Put(stored.clone()),
        );
        Ok(stored)
    }

    async fn delete(
        &self,
        tx: &mut MemoryTransaction,
        resource_type: &str,
        id: &str,
    ) -> VitalResult<bool> {
        let existed = self.lookup(tx, resource_type, id).await.is_some();
        if existed {
            tx.staged.insert(
                (resource_type.to_string(), id.to_string()),
                StagedWrite::Remove,
            );
        }
        Ok(existed)
    }

    async fn search(
        &self,
        tx: &mut MemoryTransaction,
        resource_type: &str,
        criteria: &SearchCriteria,
    ) -> VitalResult<Vec<Value>> {
        let mut visible: BTreeMap<String, Value> = {
            let resources = self.resources.read().await;
            resources.get(resource_type).cloned().unwrap_or_default()
        };
        for ((staged_type, id), write) in &tx.staged {
            if staged_type != resource_type {
                continue;
            }
            match write {
                StagedWrite::Put(value) => {
                    visible.insert(id.clone(), value.clone());
                }
                StagedWrite::Remove => {
                    visible.remove(id);
                }
            }
        }

        Ok(visible
            .into_values()
            .filter(|resource| matches_criteria(resource, criteria))
            .collect())
    }

    async fn commit(&self, tx: MemoryTransaction) -> VitalResult<()> {
        let mut resources = self.resources.write().await;

        if let Some(max) = self.config.max_resources {
            let mut total: isize = resources.values().map(|m| m.len() as isize).sum();
            for ((resource_type, id), write) in &tx.staged {
                let exists = resources
                    .get(resource_type)
                    .is_some_and(|m| m.contains_key(id));
                match (write, exists) {
                    (StagedWrite::Put(_), false) => total += 1,
                    (StagedWrite::Remove, true) => total -= 1,
                    _ => {}
                }
            }
            if total > max as isize {
                return Err(VitalError::server(format!(
                    "store capacity of {max} resources exceeded"
                )));
            }
        }

        let count = tx.staged.len();
        for ((resource_type, id), write) in tx.staged {
            match write {
                StagedWrite::Put(value) => {
                    resources.entry(resource_type).or_default().insert(id, value);
                }
                StagedWrite::Remove => {
                    if let Some(by_id) = resources.get_mut(&resource_type) {
                        by_id.remove(&id);
                    }
                }
            }
        }
        debug!(
            transaction = %tx.id,
            request_id = %tx.request_id,
            writes = count,
            "Committed transaction"
        );
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTransaction) -> VitalResult<()> {
        debug!(
            transaction = %tx.id,
            request_id = %tx.request_id,
            discarded = tx.staged.len(),
            "Rolled back transaction"
        );
        Ok(())
    }
}

/// Simple matcher: `_id`, token `identifier=system|value`, reference and string equality.
/// Other `_`-prefixed parameters are ignored.
fn matches_criteria(resource: &Value, criteria: &SearchCriteria) -> bool {
    criteria.params.iter().all(|(name, expected)| match name.as_str() {
        "_id" => resource_id(resource) == Some(expected.as_str()),
        "identifier" => resource
            .get("identifier")
            .and_then(Value::as_array)
            .is_some_and(|ids| ids.iter().any(|id| matches_token(id, expected))),
        n if n.starts_with('_') => true,
        n => resource
            .get(n)
            .is_some_and(|field| matches_field(field, expected)),
    })
}

fn matches_token(identifier: &Value, expected: &str) -> bool {
    let system = identifier.get("system").and_then(Value::as_str);
    let value = identifier.get("value").and_then(Value::as_str);
    match expected.split_once('|') {
        Some(("", v)) => system.is_none() && value == Some(v),
        Some((s, "")) => system == Some(s),
        Some((s, v)) => system == Some(s) && value == Some(v),
        None => value == Some(expected),
    }
}

fn matches_field(field: &Value, expected: &str) -> bool {
    match field {
        Value::String(s) => s == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Object(object) => object
            .get("reference")
            .and_then(Value::as_str)
            .is_some_and(|r| r == expected),
        Value::Array(items) => items.iter().any(|item| matches_field(item, expected)),
        Value::Null => false,
    }
}
