//! ALFA Session Guard - Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Guard error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    // ═══════════════════════════════════════════════════════════════
    // REQUEST ERRORS (local, never retried)
    // ═══════════════════════════════════════════════════════════════
    #[error("Request rejected by validation: {0}")]
    ValidationRejected(String),

    #[error("Rate limit exceeded - retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Too many failed attempts - locked for {}s", remaining.as_secs())]
    LockedOut { remaining: Duration },

    // ═══════════════════════════════════════════════════════════════
    // SECURITY ERRORS
    // ═══════════════════════════════════════════════════════════════
    #[error("Envelope rejected: {reason}")]
    EnvelopeRejected { reason: String },

    #[error("Unauthorized - authentication required")]
    Unauthorized,

    #[error("Compromised environment detected")]
    EnvironmentCompromised,

    #[error("Session expired - re-authentication required")]
    SessionExpired,

    // ═══════════════════════════════════════════════════════════════
    // NETWORK ERRORS
    // ═══════════════════════════════════════════════════════════════
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Server responded with status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ═══════════════════════════════════════════════════════════════
    // STORAGE / SERIALIZATION / CONFIG
    // ═══════════════════════════════════════════════════════════════
    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GuardError {
    /// Shorthand for an envelope rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        GuardError::EnvelopeRejected {
            reason: reason.into(),
        }
    }

    /// Errors that indicate tampering or an attack rather than a network fault
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            GuardError::EnvelopeRejected { .. }
                | GuardError::EnvironmentCompromised
                | GuardError::LockedOut { .. }
        )
    }

    /// Errors after which tokens are cleared and the session is ended
    pub fn requires_lockdown(&self) -> bool {
        matches!(
            self,
            GuardError::EnvelopeRejected { .. }
                | GuardError::EnvironmentCompromised
                | GuardError::SessionExpired
                | GuardError::Unauthorized
        )
    }

    /// Errors the user resolves by logging in again
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, GuardError::Unauthorized | GuardError::SessionExpired)
    }

    /// Wait time to surface for rate-limit and lockout failures
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::RateLimited { retry_after } => Some(*retry_after),
            GuardError::LockedOut { remaining } => Some(*remaining),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        GuardError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for GuardError {
    fn from(e: std::io::Error) -> Self {
        GuardError::Storage(e.to_string())
    }
}

impl From<base64::DecodeError> for GuardError {
    fn from(e: base64::DecodeError) -> Self {
        GuardError::Serialization(format!("base64: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockdown_classification() {
        assert!(GuardError::rejected("mac").requires_lockdown());
        assert!(GuardError::EnvironmentCompromised.requires_lockdown());
        assert!(!GuardError::TransportFailure("offline".into()).requires_lockdown());
        assert!(!GuardError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .requires_lockdown());
    }

    #[test]
    fn test_security_errors_distinct_from_network() {
        assert!(GuardError::rejected("replayed nonce").is_security_critical());
        assert!(!GuardError::TransportFailure("timeout".into()).is_security_critical());
    }

    #[test]
    fn test_retry_after() {
        let err = GuardError::LockedOut {
            remaining: Duration::from_secs(90),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(90)));
        assert_eq!(GuardError::Unauthorized.retry_after(), None);
    }
}
