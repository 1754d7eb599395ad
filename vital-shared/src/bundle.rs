//! Bundle model: an ordered list of entries submitted as one unit, and the outcomes
//! produced for them.

use crate::exception::{OperationOutcome, VitalError, VitalResult};
use crate::reference::is_symbolic;
use crate::store::SearchCriteria;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Execution mode of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    /// Entries succeed or fail independently
    Batch,
    /// All entries apply or none do
    Transaction,
}

impl BundleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleMode::Batch => "batch",
            BundleMode::Transaction => "transaction",
        }
    }

    fn response_type(&self) -> &'static str {
        match self {
            BundleMode::Batch => "batch-response",
            BundleMode::Transaction => "transaction-response",
        }
    }
}

impl fmt::Display for BundleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation requested by one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryOperation {
    Create,
    /// Read of one instance (`Type/id`)
    Read,
    /// Read of a type or a match expression; yields a searchset
    Search,
    Update,
    Delete,
    ConditionalCreate,
    ConditionalUpdate,
    ConditionalDelete,
}

impl EntryOperation {
    /// Whether the operation can change stored state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, EntryOperation::Read | EntryOperation::Search)
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            EntryOperation::ConditionalCreate
                | EntryOperation::ConditionalUpdate
                | EntryOperation::ConditionalDelete
        )
    }

    pub fn requires_payload(&self) -> bool {
        matches!(
            self,
            EntryOperation::Create
                | EntryOperation::Update
                | EntryOperation::ConditionalCreate
                | EntryOperation::ConditionalUpdate
        )
    }

    /// Map an HTTP method and url to an operation.
    ///
    /// Only an unknown method is an error here. A url whose shape does not fit the method
    /// maps to the method's plain operation and fails when its entry executes.
    pub fn from_request(method: &str, url: &str, if_none_exist: Option<&str>) -> VitalResult<Self> {
        let conditional = url.contains('?');
        let instance = !conditional && (url.contains('/') || is_symbolic(url));
        let if_none_exist = if_none_exist.is_some_and(|criteria| !criteria.trim().is_empty());
        let op = match method.to_ascii_uppercase().as_str() {
            "POST" if if_none_exist && !conditional && !instance => {
                EntryOperation::ConditionalCreate
            }
            "POST" => EntryOperation::Create,
            "GET" if instance => EntryOperation::Read,
            "GET" => EntryOperation::Search,
            "PUT" if conditional => EntryOperation::ConditionalUpdate,
            "PUT" => EntryOperation::Update,
            "DELETE" if conditional => EntryOperation::ConditionalDelete,
            "DELETE" => EntryOperation::Delete,
            other => {
                return Err(VitalError::validation(format!(
                    "unsupported method '{other}'"
                )))
            }
        };
        Ok(op)
    }
}

/// One operation within a bundle.
///
/// `target` is the raw address (`Type`, `Type/id`, `Type?criteria` or a symbolic id) and may
/// contain symbolic ids that only resolve during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbolic_id: Option<String>,
    pub operation: EntryOperation,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl BundleEntry {
    pub fn new<S: Into<String>>(operation: EntryOperation, target: S) -> Self {
        Self {
            symbolic_id: None,
            operation,
            target: target.into(),
            payload: None,
        }
    }

    pub fn create<S: Into<String>>(resource_type: S, payload: Value) -> Self {
        Self::new(EntryOperation::Create, resource_type).with_payload(payload)
    }

    pub fn read<S: Into<String>>(reference: S) -> Self {
        Self::new(EntryOperation::Read, reference)
    }

    pub fn search<S: Into<String>>(query: S) -> Self {
        Self::new(EntryOperation::Search, query)
    }

    pub fn update<S: Into<String>>(reference: S, payload: Value) -> Self {
        Self::new(EntryOperation::Update, reference).with_payload(payload)
    }

    pub fn delete<S: Into<String>>(reference: S) -> Self {
        Self::new(EntryOperation::Delete, reference)
    }

    /// `Type?criteria` target; creates only when nothing matches
    pub fn conditional_create<S: Into<String>>(query: S, payload: Value) -> Self {
        Self::new(EntryOperation::ConditionalCreate, query).with_payload(payload)
    }

    pub fn conditional_update<S: Into<String>>(query: S, payload: Value) -> Self {
        Self::new(EntryOperation::ConditionalUpdate, query).with_payload(payload)
    }

    pub fn conditional_delete<S: Into<String>>(query: S) -> Self {
        Self::new(EntryOperation::ConditionalDelete, query)
    }

    pub fn with_symbolic_id<S: Into<String>>(mut self, symbolic_id: S) -> Self {
        self.symbolic_id = Some(symbolic_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Parsed address of an entry once symbolic ids have been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    Type(String),
    Instance {
        resource_type: String,
        id: String,
    },
    Conditional {
        resource_type: String,
        criteria: SearchCriteria,
    },
}

impl EntryTarget {
    pub fn parse(target: &str) -> VitalResult<Self> {
        if is_symbolic(target) {
            return Err(VitalError::validation(format!(
                "unresolved symbolic reference '{target}'"
            )));
        }

        let parsed = if let Some((resource_type, query)) = target.split_once('?') {
            EntryTarget::Conditional {
                resource_type: resource_type.to_string(),
                criteria: SearchCriteria::parse(query)?,
            }
        } else if let Some((resource_type, id)) = target.split_once('/') {
            if id.is_empty() || id.contains('/') {
                return Err(VitalError::validation(format!("malformed reference '{target}'")));
            }
            EntryTarget::Instance {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }
        } else {
            EntryTarget::Type(target.to_string())
        };

        let resource_type = parsed.resource_type();
        if resource_type.is_empty() || !resource_type.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(VitalError::validation(format!(
                "invalid resource type in '{target}'"
            )));
        }
        Ok(parsed)
    }

    pub fn resource_type(&self) -> &str {
        match self {
            EntryTarget::Type(t) => t,
            EntryTarget::Instance { resource_type, .. } => resource_type,
            EntryTarget::Conditional { resource_type, .. } => resource_type,
        }
    }
}

/// Ordered collection of entries submitted as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub mode: BundleMode,
    pub entries: Vec<BundleEntry>,
}

impl Bundle {
    pub fn new(mode: BundleMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
        }
    }

    pub fn batch(entries: Vec<BundleEntry>) -> Self {
        Self {
            mode: BundleMode::Batch,
            entries,
        }
    }

    pub fn transaction(entries: Vec<BundleEntry>) -> Self {
        Self {
            mode: BundleMode::Transaction,
            entries,
        }
    }

    pub fn with_entry(mut self, entry: BundleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Parse the `{"type", "entry": [{"fullUrl", "request", "resource"}]}` envelope.
    pub fn from_json(value: Value) -> VitalResult<Self> {
        let wire: WireBundle = serde_json::from_value(value)?;
        if let Some(resource_type) = &wire.resource_type {
            if resource_type != "Bundle" {
                return Err(VitalError::validation(format!(
                    "expected a Bundle, got '{resource_type}'"
                )));
            }
        }
        let mode = match wire.bundle_type.as_str() {
            "batch" => BundleMode::Batch,
            "transaction" => BundleMode::Transaction,
            other => {
                return Err(VitalError::validation(format!(
                    "unsupported bundle type '{other}'"
                )))
            }
        };

        let entries = wire
            .entry
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let request = entry.request.ok_or_else(|| {
                    VitalError::validation(format!("entry {index} is missing request"))
                })?;
                let operation = EntryOperation::from_request(
                    &request.method,
                    &request.url,
                    request.if_none_exist.as_deref(),
                )?;
                let target = match (&operation, &request.if_none_exist) {
                    (EntryOperation::ConditionalCreate, Some(criteria)) => {
                        format!("{}?{}", request.url, criteria)
                    }
                    _ => request.url,
                };
                Ok(BundleEntry {
                    symbolic_id: entry.full_url,
                    operation,
                    target,
                    payload: entry.resource,
                })
            })
            .collect::<VitalResult<Vec<_>>>()?;

        Ok(Self { mode, entries })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBundle {
    resource_type: Option<String>,
    #[serde(rename = "type")]
    bundle_type: String,
    #[serde(default)]
    entry: Vec<WireEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    full_url: Option<String>,
    request: Option<WireRequest>,
    resource: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    method: String,
    url: String,
    if_none_exist: Option<String>,
}

/// Outcome of one entry, in the same position as the entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationOutcome>,
}

impl EntryOutcome {
    pub fn success(status: u16, resource: Option<Value>) -> Self {
        Self {
            status,
            resource,
            error: None,
        }
    }

    pub fn failure(error: &VitalError) -> Self {
        Self {
            status: error.status_code(),
            resource: None,
            error: Some(error.to_outcome()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Successful result of executing a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResponse {
    pub mode: BundleMode,
    pub entries: Vec<EntryOutcome>,
}

impl BundleResponse {
    /// Status of the bundle as a whole
    pub fn status(&self) -> u16 {
        200
    }

    pub fn to_json(&self) -> Value {
        let entry: Vec<Value> = self
            .entries
            .iter()
            .map(|outcome| {
                let mut response = json!({ "status": outcome.status.to_string() });
                if let Some(error) = &outcome.error {
                    response["outcome"] = json!(error);
                }
                let mut entry = json!({ "response": response });
                if let Some(resource) = &outcome.resource {
                    entry["resource"] = resource.clone();
                }
                entry
            })
            .collect();

        json!({
            "resourceType": "Bundle",
            "type": self.mode.response_type(),
            "entry": entry,
        })
    }
}

/// Wrap search results in a `searchset` bundle
pub fn searchset(resources: Vec<Value>) -> Value {
    let total = resources.len();
    let entry: Vec<Value> = resources
        .into_iter()
        .map(|resource| json!({ "resource": resource }))
        .collect();
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": total,
        "entry": entry,
    })
}
