//! Election error types

use crate::store::LeaseId;

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Election-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// The coordination store is unreachable or temporarily refused the request.
    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The requested key does not exist. For a leader key this means the role is vacant.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Lease {lease} renewal failed: {reason}")]
    LeaseRenewal { lease: LeaseId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed member payload: {0}")]
    MalformedMember(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The elector was stopped and cannot be started again
    #[error("Election stopped: {0}")]
    Stopped(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ElectionError {
    pub fn coordination<T: Into<String>>(msg: T) -> Self {
        Self::Coordination(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn key_not_found<T: Into<String>>(key: T) -> Self {
        Self::KeyNotFound(key.into())
    }

    pub fn lease_renewal<T: Into<String>>(lease: LeaseId, reason: T) -> Self {
        Self::LeaseRenewal {
            lease,
            reason: reason.into(),
        }
    }

    pub fn malformed_member<T: Into<String>>(msg: T) -> Self {
        Self::MalformedMember(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// True when the error is the normal "role vacant" signal rather than a failure.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }

    /// True for failures that are retried by the health loop or the campaign retry timer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Coordination(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ElectionError::key_not_found("/consensus").is_key_not_found());
        assert!(!ElectionError::key_not_found("/consensus").is_transient());

        assert!(ElectionError::coordination("connection refused").is_transient());
        assert!(ElectionError::timeout("get /consensus").is_transient());

        assert!(!ElectionError::Stopped("/consensus".to_string()).is_transient());
        assert!(!ElectionError::lease_renewal(7, "lease expired").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ElectionError::lease_renewal(42, "lease not found");
        assert_eq!(err.to_string(), "Lease 42 renewal failed: lease not found");

        let err = ElectionError::key_not_found("/scheduler");
        assert!(err.to_string().contains("/scheduler"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
        let err: ElectionError = parse_err.into();
        assert!(matches!(err, ElectionError::Serialization(_)));
    }
}
