//! Request-scoped context threaded through bundle execution.
//!
//! A `RequestContext` is built once per inbound request and passed by reference to the
//! executor, the locker and the store. It is never stored globally.

use crate::exception::{VitalError, VitalResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Access level a scope grants on a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

/// Identity of an already-authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub subject: String,
    pub project: Option<String>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl AuthenticatedIdentity {
    pub fn new<S: Into<String>>(subject: S, scopes: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            project: None,
            scopes,
            access_token: None,
        }
    }

    pub fn with_project<S: Into<String>>(mut self, project: S) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Check if a specific scope string is granted verbatim
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// SMART-style check: `user/Patient.read`, `user/*.write`, `user/Patient.*`, `user/*.*`
    pub fn can_access(&self, resource_type: &str, mode: AccessMode) -> bool {
        self.scopes.iter().any(|scope| {
            let Some(rest) = scope
                .strip_prefix("user/")
                .or_else(|| scope.strip_prefix("system/"))
            else {
                return false;
            };
            let Some((scope_type, scope_mode)) = rest.split_once('.') else {
                return false;
            };
            (scope_type == "*" || scope_type == resource_type)
                && (scope_mode == "*" || scope_mode == mode.as_str())
        })
    }
}

/// Ambient per-request state: identifiers for logging, optional identity, cancellation
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    trace_id: String,
    identity: Option<AuthenticatedIdentity>,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new<R: Into<String>, T: Into<String>>(request_id: R, trace_id: T) -> Self {
        Self {
            request_id: request_id.into(),
            trace_id: trace_id.into(),
            identity: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Context with no identifiers, used by background work
    pub fn empty() -> Self {
        Self::new("", "")
    }

    /// Unrestricted internal context with fresh identifiers
    pub fn system() -> Self {
        let id = Uuid::new_v4().to_string();
        Self::new(id.clone(), id)
    }

    /// Build from inbound request headers (lower-cased names).
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let request_id = Uuid::new_v4().to_string();
        let trace_id = trace_id_from_headers(headers).unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::new(request_id, trace_id)
    }

    pub fn with_identity(mut self, identity: AuthenticatedIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn identity(&self) -> Option<&AuthenticatedIdentity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn require_authenticated(&self) -> VitalResult<&AuthenticatedIdentity> {
        self.identity
            .as_ref()
            .ok_or_else(|| VitalError::forbidden("request is not authenticated"))
    }

    /// Verify the identity (if any) may access `resource_type` in `mode`.
    pub fn authorize(&self, resource_type: &str, mode: AccessMode) -> VitalResult<()> {
        match &self.identity {
            None => Ok(()),
            Some(identity) if identity.can_access(resource_type, mode) => Ok(()),
            Some(identity) => Err(VitalError::forbidden(format!(
                "{} lacks {} access to {}",
                identity.subject,
                mode.as_str(),
                resource_type
            ))),
        }
    }

    /// Token signaled when the caller abandons the request
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Span that tags every log line emitted on behalf of this request
    pub fn span(&self, name: &'static str) -> Span {
        let subject = self
            .identity
            .as_ref()
            .map(|i| i.subject.as_str())
            .unwrap_or("system");
        info_span!(
            "request",
            op = name,
            request_id = %self.request_id,
            trace_id = %self.trace_id,
            subject = %subject
        )
    }
}

fn trace_id_from_headers(headers: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get("x-trace-id") {
        if Uuid::parse_str(value).is_ok() {
            return Some(value.clone());
        }
    }

    if let Some(value) = headers.get("traceparent") {
        if let Some(id) = traceparent_to_uuid(value) {
            return Some(id);
        }
    }

    // {uuidv4}-{uuidv4.substring(16)}[-(0|1)]
    if let Some(value) = headers.get("sentry-trace") {
        if value.len() == 49 || value.len() == 51 {
            return Some(value.clone());
        }
    }

    None
}

fn traceparent_to_uuid(value: &str) -> Option<String> {
    let rest = value.strip_prefix("00-")?;
    let id = rest.split('-').next()?;
    if id.len() != 32 || !id.is_ascii() {
        return None;
    }
    let candidate = format!(
        "{}-{}-{}-{}-{}",
        &id[0..8],
        &id[8..12],
        &id[12..16],
        &id[16..20],
        &id[20..32]
    );
    Uuid::parse_str(&candidate).ok().map(|_| candidate)
}
