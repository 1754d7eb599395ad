//! Common configuration helpers shared by the Vital crates

use crate::exception::{VitalError, VitalResult};
use std::time::Duration;

/// Common configuration trait that provides default validation
pub trait ConfigDefaults {
    /// Validate the configuration settings
    fn validate(&self) -> VitalResult<()> {
        Ok(())
    }

    /// Get configuration source description for debugging
    fn config_source(&self) -> &'static str {
        "default"
    }
}

/// Reject zero-length durations for settings that bound waits or leases
pub fn require_non_zero(name: &str, value: Duration) -> VitalResult<()> {
    if value.is_zero() {
        return Err(VitalError::configuration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    impl ConfigDefaults for Plain {}

    #[test]
    fn test_default_validation_passes() {
        assert!(Plain.validate().is_ok());
        assert_eq!(Plain.config_source(), "default");
    }

    #[test]
    fn test_require_non_zero() {
        assert!(require_non_zero("lease", Duration::from_millis(1)).is_ok());
        let err = require_non_zero("lease", Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: lease must be greater than 0");
    }
}
