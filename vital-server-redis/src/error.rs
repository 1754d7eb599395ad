use thiserror::Error;
use vital_shared::VitalError;

/// Errors raised by the distributed locker
#[derive(Debug, Error)]
pub enum RedlockError {
    #[error(
        "The operation was unable to achieve a quorum during its retry window ({granted}/{required} replicas)"
    )]
    QuorumNotReached { granted: usize, required: usize },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type RedlockResult<T> = Result<T, RedlockError>;

impl From<RedlockError> for VitalError {
    fn from(error: RedlockError) -> Self {
        match error {
            RedlockError::QuorumNotReached { .. } => {
                VitalError::conflict("unable to acquire lock")
            }
            RedlockError::Configuration(msg) => VitalError::configuration(msg),
            other => VitalError::server(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_failure_is_conflict() {
        let err: VitalError = RedlockError::QuorumNotReached {
            granted: 1,
            required: 2,
        }
        .into();
        assert_eq!(err.status_code(), 409);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backend_failure_is_server_error() {
        let err: VitalError = RedlockError::Unavailable("connection refused".into()).into();
        assert_eq!(err.status_code(), 500);
        assert!(err.is_bundle_fatal());
    }
}
