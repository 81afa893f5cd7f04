//! Error types for presence and media reconciliation

/// Result type alias using presence Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating peer presence
///
/// None of these are fatal to the session: transient transport failures are
/// retried, races are dropped, and mismatches are only ever flagged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Media transport operation failed; what transports report for a dropped call
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Subscribing to a remote track failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Publishing a local track failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// The media transport is not (or no longer) connected
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The transport has no such peer in the channel (it left mid-operation)
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Requested transition does not apply to the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Replicated model is detached
    #[error("Replicated model offline: {0}")]
    ModelOffline(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Check if this error is a transient transport failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportError(_)
                | Error::SubscribeFailed(_)
                | Error::PublishFailed(_)
                | Error::OperationTimeout(_)
        )
    }

    /// Check if this error is a protocol race that should be dropped silently
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::UnknownPeer(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SubscribeFailed("test".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
        assert!(!Error::UnknownPeer("test".to_string()).is_retryable());
        assert!(!Error::NotConnected("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_benign_race() {
        assert!(Error::UnknownPeer("gone".to_string()).is_benign_race());
        assert!(!Error::TransportError("test".to_string()).is_benign_race());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
