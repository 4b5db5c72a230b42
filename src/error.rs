//! Error types for a3s-inbox

use thiserror::Error;

/// Errors that can occur in the inbox core
#[derive(Debug, Error)]
pub enum InboxError {
    /// Missing or invalid configuration / credentials
    #[error("Configuration error: {0}")]
    Config(String),

    /// Third-party API failure (network, 5xx, API-level error)
    #[error("Provider error from '{provider}': {reason}")]
    Provider {
        provider: String,
        reason: String,
    },

    /// Timeout while waiting on a provider
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Webhook authenticity check failed
    #[error("Authenticity check failed: {0}")]
    Authenticity(String),

    /// Webhook payload could not be parsed
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse classification used at the provider boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/invalid credentials; surfaced as a structured failure
    Configuration,
    /// Network, timeout or 5xx from a third party; caller may retry
    TransientProvider,
    /// Signature verification failure; always rejected
    Authenticity,
    /// Unparseable payload; logged and dropped
    DataIntegrity,
    /// Store unavailable or other unexpected fault
    Internal,
}

impl InboxError {
    /// Build a provider error
    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Map this error onto the boundary taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            InboxError::Config(_) => ErrorKind::Configuration,
            InboxError::Provider { .. } | InboxError::Timeout(_) | InboxError::Http(_) => {
                ErrorKind::TransientProvider
            }
            InboxError::Authenticity(_) => ErrorKind::Authenticity,
            InboxError::MalformedPayload(_) | InboxError::Serialization(_) => {
                ErrorKind::DataIntegrity
            }
            InboxError::Store(_) | InboxError::Crypto(_) | InboxError::NotFound(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this error must escape the provider boundary
    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

/// Result type alias for inbox operations
pub type Result<T> = std::result::Result<T, InboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            InboxError::Config("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            InboxError::provider("slack", "rate_limited").kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            InboxError::Timeout("send".into()).kind(),
            ErrorKind::TransientProvider
        );
        assert_eq!(
            InboxError::Authenticity("bad sig".into()).kind(),
            ErrorKind::Authenticity
        );
        assert_eq!(
            InboxError::MalformedPayload("{".into()).kind(),
            ErrorKind::DataIntegrity
        );
        assert!(InboxError::Store("down".into()).is_internal());
    }

    #[test]
    fn test_provider_error_message() {
        let err = InboxError::provider("twilio", "21211 invalid 'To' number");
        assert_eq!(
            err.to_string(),
            "Provider error from 'twilio': 21211 invalid 'To' number"
        );
    }
}
