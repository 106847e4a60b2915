//! Call status and the state machine guarding its transitions

use crate::error::{CallError, CallResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a call, shared with the remote peer through the `status` path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Offer published, waiting for the callee
    Pending,
    /// Remote description applied, ICE checking
    Connecting,
    /// ICE connected, media can flow
    Connected,
    /// Graceful termination
    Ended,
    /// Any failure; carries an error message
    Error,
}

impl CallStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Ended => "ENDED",
            Self::Error => "ERROR",
        }
    }

    /// ENDED and ERROR absorb every later request
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Ended | Self::Error => 3,
        }
    }

    /// Whether `self → next` is in the transition table
    ///
    /// Non-terminal states only move forward; any non-terminal state may
    /// end or fail.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONNECTING" => Ok(Self::Connecting),
            "CONNECTED" => Ok(Self::Connected),
            "ENDED" => Ok(Self::Ended),
            "ERROR" => Ok(Self::Error),
            other => Err(CallError::Negotiation(format!("unknown call status '{}'", other))),
        }
    }
}

/// What a transition request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Status changed
    Applied {
        /// Previous status
        from: CallStatus,
        /// New status
        to: CallStatus,
    },
    /// Already in the requested status
    Unchanged,
    /// The machine is terminal; request dropped
    Ignored {
        /// Terminal status the machine stays in
        terminal: CallStatus,
    },
}

impl TransitionOutcome {
    /// Whether the status actually changed
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Status container with a fixed transition table
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    status: CallStatus,
    error: Option<String>,
    history: Vec<CallStatus>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    /// New machine in `Pending`
    pub fn new() -> Self {
        Self {
            status: CallStatus::Pending,
            error: None,
            history: vec![CallStatus::Pending],
        }
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Error message, set only in `Error`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every status the machine has been in, oldest first
    pub fn history(&self) -> &[CallStatus] {
        &self.history
    }

    /// Whether the machine reached ENDED or ERROR
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Request a move to `next`.
    ///
    /// Requests after a terminal state are ignored and requests outside the
    /// table are rejected with [`CallError::InvalidTransition`]; neither
    /// changes the status. Moving to `Error` through here records a generic
    /// message; prefer [`CallStateMachine::fail`].
    pub fn transition(&mut self, next: CallStatus) -> CallResult<TransitionOutcome> {
        if self.status.is_terminal() {
            tracing::debug!(status = %self.status, requested = %next, "Ignoring transition after terminal state");
            return Ok(TransitionOutcome::Ignored {
                terminal: self.status,
            });
        }
        if self.status == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !self.status.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let from = self.status;
        self.status = next;
        self.history.push(next);
        if next == CallStatus::Error && self.error.is_none() {
            self.error = Some("call failed".to_string());
        }
        Ok(TransitionOutcome::Applied { from, to: next })
    }

    /// Move to `Error` with `message`
    pub fn fail(&mut self, message: impl Into<String>) -> TransitionOutcome {
        if self.status.is_terminal() {
            return TransitionOutcome::Ignored {
                terminal: self.status,
            };
        }
        self.error = Some(message.into());
        let from = self.status;
        self.status = CallStatus::Error;
        self.history.push(CallStatus::Error);
        TransitionOutcome::Applied {
            from,
            to: CallStatus::Error,
        }
    }
}
