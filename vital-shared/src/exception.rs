use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Vital error taxonomy
#[derive(Debug, Clone, Error)]
pub enum VitalError {
    #[error("Conflict: {details}")]
    Conflict { details: String },

    #[error("Validation failed: {details}")]
    Validation { details: String },

    #[error("Not found: {reference}")]
    NotFound { reference: String },

    #[error("Forbidden: {details}")]
    Forbidden { details: String },

    #[error("Precondition failed: {details}")]
    PreconditionFailed { details: String },

    #[error("Lease expired: {details}")]
    LeaseExpired { details: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl VitalError {
    pub fn conflict<S: Into<String>>(details: S) -> Self {
        VitalError::Conflict {
            details: details.into(),
        }
    }

    pub fn validation<S: Into<String>>(details: S) -> Self {
        VitalError::Validation {
            details: details.into(),
        }
    }

    pub fn not_found<S: Into<String>>(reference: S) -> Self {
        VitalError::NotFound {
            reference: reference.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(details: S) -> Self {
        VitalError::Forbidden {
            details: details.into(),
        }
    }

    pub fn precondition_failed<S: Into<String>>(details: S) -> Self {
        VitalError::PreconditionFailed {
            details: details.into(),
        }
    }

    pub fn lease_expired<S: Into<String>>(details: S) -> Self {
        VitalError::LeaseExpired {
            details: details.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        VitalError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        VitalError::Configuration(msg.into())
    }

    pub fn server<S: Into<String>>(msg: S) -> Self {
        VitalError::Server(msg.into())
    }

    /// HTTP-style status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            VitalError::Conflict { .. } => 409,
            VitalError::Validation { .. } | VitalError::Serialization(_) => 400,
            VitalError::NotFound { .. } => 404,
            VitalError::Forbidden { .. } => 403,
            VitalError::PreconditionFailed { .. } => 412,
            VitalError::LeaseExpired { .. }
            | VitalError::Cancelled { .. }
            | VitalError::Configuration(_)
            | VitalError::Server(_) => 500,
        }
    }

    /// Errors that abort a whole bundle regardless of its mode.
    pub fn is_bundle_fatal(&self) -> bool {
        self.status_code() >= 500
    }

    /// Whether the caller may resubmit the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VitalError::Conflict { .. })
    }

    pub fn to_outcome(&self) -> OperationOutcome {
        OperationOutcome::from_error(self)
    }
}

impl From<serde_json::Error> for VitalError {
    fn from(e: serde_json::Error) -> Self {
        VitalError::Serialization(e.to_string())
    }
}

/// Result type for Vital operations
pub type VitalResult<T> = Result<T, VitalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// Structured error body returned in place of a bundle response or attached to an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub status: u16,
    pub severity: IssueSeverity,
    pub code: String,
    pub diagnostics: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl OperationOutcome {
    pub fn from_error(error: &VitalError) -> Self {
        let code = match error {
            VitalError::Conflict { .. } => "conflict",
            VitalError::Validation { .. } | VitalError::Serialization(_) => "invalid",
            VitalError::NotFound { .. } => "not-found",
            VitalError::Forbidden { .. } => "forbidden",
            VitalError::PreconditionFailed { .. } => "multiple-matches",
            VitalError::LeaseExpired { .. } => "lock-error",
            VitalError::Cancelled { .. } => "timeout",
            VitalError::Configuration(_) | VitalError::Server(_) => "exception",
        };
        let severity = if error.is_bundle_fatal() {
            IssueSeverity::Fatal
        } else {
            IssueSeverity::Error
        };

        Self {
            status: error.status_code(),
            severity,
            code: code.to_string(),
            diagnostics: error.to_string(),
            trace_id: None,
        }
    }

    pub fn with_trace_id<S: Into<String>>(mut self, trace_id: S) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Bundle-fatal error together with the identifiers of the request that produced it
#[derive(Debug, Clone, Error)]
#[error("{error} (request {request_id}, trace {trace_id})")]
pub struct BundleFailure {
    #[source]
    pub error: VitalError,
    pub request_id: String,
    pub trace_id: String,
}

impl BundleFailure {
    pub fn status_code(&self) -> u16 {
        self.error.status_code()
    }

    pub fn outcome(&self) -> OperationOutcome {
        self.error.to_outcome().with_trace_id(self.trace_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(VitalError::conflict("busy").status_code(), 409);
        assert_eq!(VitalError::validation("bad").status_code(), 400);
        assert_eq!(VitalError::not_found("Patient/1").status_code(), 404);
        assert_eq!(VitalError::lease_expired("late").status_code(), 500);
        assert_eq!(VitalError::server("down").status_code(), 500);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!VitalError::not_found("Patient/1").is_bundle_fatal());
        assert!(!VitalError::conflict("busy").is_bundle_fatal());
        assert!(VitalError::lease_expired("late").is_bundle_fatal());
        assert!(VitalError::cancelled("read").is_bundle_fatal());
        assert!(VitalError::conflict("busy").is_retryable());
    }

    #[test]
    fn test_outcome_from_error() {
        let outcome = VitalError::not_found("Practitioner/does-not-exist").to_outcome();
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.code, "not-found");
        assert_eq!(outcome.severity, IssueSeverity::Error);
        assert!(outcome.diagnostics.contains("Practitioner/does-not-exist"));

        let failure = BundleFailure {
            error: VitalError::conflict("unable to acquire lock"),
            request_id: "req".to_string(),
            trace_id: "trace".to_string(),
        };
        assert_eq!(failure.status_code(), 409);
        assert_eq!(failure.outcome().trace_id.as_deref(), Some("trace"));
    }
}
