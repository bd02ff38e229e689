//! Error types for Switchyard gateway operations.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Switchyard operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed server descriptor, routing rule, or tuning section; fatal at load time
    #[error("invalid config for '{0}': {1}")]
    Configuration(String, String),

    /// Process launch or connection creation failed for a named server
    #[error("spawn failed for server '{0}': {1}")]
    Spawn(String, String),

    /// Acquire deadline elapsed while waiting for a connection
    #[error("acquire timed out for server '{0}' after {1:?}")]
    Timeout(String, Duration),

    /// No healthy candidate, or the pool and its waiting queue are both full
    #[error("'{0}' unavailable: {1}")]
    Unavailable(String, String),

    /// No routing rule matches the method at all
    #[error("no routing rule matches method '{0}'")]
    NotFound(String),

    /// Pool or server is shutting down
    #[error("pool for server '{0}' drained")]
    Drained(String),
}

impl GatewayError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(..) | Self::Unavailable(..))
    }
}

/// Result type alias for Switchyard operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let err = GatewayError::Configuration(
            "git".to_string(),
            "process transport requires 'command' field".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for 'git': process transport requires 'command' field"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = GatewayError::Timeout("git".to_string(), Duration::from_millis(100));
        assert_eq!(
            err.to_string(),
            "acquire timed out for server 'git' after 100ms"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = GatewayError::NotFound("unknown.op".to_string());
        assert_eq!(err.to_string(), "no routing rule matches method 'unknown.op'");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Timeout("a".into(), Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::Unavailable("a".into(), "saturated".into()).is_retryable());
        assert!(!GatewayError::NotFound("x.y".into()).is_retryable());
        assert!(!GatewayError::Drained("a".into()).is_retryable());
    }
}
