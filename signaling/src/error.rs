//! Error types for signaling transport operations

use crate::path::CallPath;

/// Result type for signaling operations
pub type SignalingResult<T> = Result<T, SignalingError>;

/// Errors raised by the signaling store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    /// Network or store failure; the operation may be retried
    #[error("Transport error on {path}: {message}")]
    Transport {
        /// Sub-path the operation targeted
        path: String,
        /// Failure description
        message: String,
    },

    /// The store refused access to the path
    #[error("Permission denied on {0}")]
    PermissionDenied(String),

    /// The store is unreachable
    #[error("Signaling store is offline")]
    Offline,

    /// A value could not be encoded or decoded for the store
    #[error("Malformed value at {path}: {message}")]
    Malformed {
        /// Sub-path holding the value
        path: CallPath,
        /// What was wrong with it
        message: String,
    },
}

impl SignalingError {
    /// Build a transport error for a rendered path
    pub fn transport(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same idempotent operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SignalingError::transport("/s/a_b/calls/sdp", "reset").is_retryable());
        assert!(SignalingError::Offline.is_retryable());
        assert!(!SignalingError::PermissionDenied("/s".into()).is_retryable());
        assert!(!SignalingError::Malformed {
            path: CallPath::Sdp,
            message: "not an object".into(),
        }
        .is_retryable());
    }
}
