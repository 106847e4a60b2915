//! Error types for call establishment
//!
//! Every failure falls into one of five kinds. The kind decides propagation:
//! local-only problems are logged and absorbed, fatal ones are written to the
//! shared session so the remote peer sees them too.

use crate::state::CallStatus;
use callrtc_signaling::SignalingError;
use serde::{Deserialize, Serialize};

/// Result type for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Broad classification of a [`CallError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Publish/subscribe against the signaling store failed
    Transport,
    /// Malformed or out-of-sequence SDP/ICE payload
    Negotiation,
    /// Camera/microphone unavailable or permission denied
    Media,
    /// ICE reported failure or disconnection, or nobody answered
    Connectivity,
    /// Illegal state-machine transition was requested
    Invariant,
    /// Misuse of the API (bad configuration, disposed orchestrator)
    Usage,
}

/// Errors that can occur while establishing or running a call
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Signaling store failure
    #[error("Signaling failed: {0}")]
    Transport(#[from] SignalingError),

    /// Bad or out-of-sequence negotiation message
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(String),

    /// Peer connectivity was lost or never established
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The callee did not answer in time
    #[error("No answer after {waited_ms} ms")]
    NoAnswer {
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Requested status change is not in the transition table
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the call was in
        from: CallStatus,
        /// Status that was requested
        to: CallStatus,
    },

    /// Configuration field failed validation
    #[error("Validation error [{field}]: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// The orchestrator has been cleaned up
    #[error("Call orchestrator is disposed")]
    Disposed,

    /// Native stack failure that fits no other category
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Shorthand for a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Negotiation(_) => ErrorKind::Negotiation,
            Self::Media(_) => ErrorKind::Media,
            Self::Connectivity(_) | Self::NoAnswer { .. } => ErrorKind::Connectivity,
            Self::InvalidTransition { .. } => ErrorKind::Invariant,
            Self::Validation { .. } | Self::Disposed => ErrorKind::Usage,
            Self::Internal(_) => ErrorKind::Negotiation,
        }
    }

    /// Whether the call cannot continue after this error
    ///
    /// Negotiation and invariant errors are absorbed unless the caller
    /// decides they block progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Media | ErrorKind::Connectivity
        )
    }

    /// Message suitable for the shared `error` sub-path and the UI
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => "Lost connection to the signaling service".to_string(),
            Self::Media(msg) => format!("Camera or microphone unavailable: {}", msg),
            Self::Connectivity(msg) => msg.clone(),
            Self::NoAnswer { .. } => "No answer".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let transport = CallError::from(SignalingError::Offline);
        assert_eq!(transport.kind(), ErrorKind::Transport);
        assert!(transport.is_fatal());

        let stray = CallError::Negotiation("answer without offer".into());
        assert_eq!(stray.kind(), ErrorKind::Negotiation);
        assert!(!stray.is_fatal());

        let invariant = CallError::InvalidTransition {
            from: CallStatus::Connected,
            to: CallStatus::Pending,
        };
        assert_eq!(invariant.kind(), ErrorKind::Invariant);
        assert!(!invariant.is_fatal());
        assert_eq!(invariant.to_string(), "Invalid transition: CONNECTED -> PENDING");

        assert!(CallError::NoAnswer { waited_ms: 30_000 }.is_fatal());
        assert!(CallError::Media("denied".into()).is_fatal());
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(CallError::NoAnswer { waited_ms: 10 }.user_message(), "No answer");
        assert_eq!(
            CallError::Connectivity("ICE connection failed".into()).user_message(),
            "ICE connection failed"
        );
        assert!(CallError::Media("permission denied".into())
            .user_message()
            .contains("permission denied"));
    }
}
