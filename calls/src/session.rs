//! Call session data model

use crate::types::{IceCandidate, SessionDescription};
use chrono::{DateTime, Utc};

/// Negotiation record for one call, owned by the orchestrator worker
///
/// Status lives in the state machine; the session keeps what was exchanged.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Session key shared by both participants
    pub conversation_id: String,

    /// User id of the caller, once known
    pub caller_id: Option<String>,

    /// Description this side generated
    pub local_description: Option<SessionDescription>,

    /// Description received from the peer and applied
    pub remote_description: Option<SessionDescription>,

    /// Candidates gathered locally, in gathering order
    pub local_candidates: Vec<IceCandidate>,

    /// Candidates received from the peer, in arrival order
    pub remote_candidates: Vec<IceCandidate>,

    /// When this session was created
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
}

impl CallSession {
    /// Create an empty session
    pub fn new(conversation_id: impl Into<String>, caller_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            caller_id,
            local_description: None,
            remote_description: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record the locally generated description
    pub fn set_local_description(&mut self, sdp: SessionDescription) {
        self.local_description = Some(sdp);
        self.touch();
    }

    /// Record the applied remote description
    pub fn set_remote_description(&mut self, sdp: SessionDescription) {
        self.remote_description = Some(sdp);
        self.touch();
    }

    /// Record a locally gathered candidate
    pub fn add_local_candidate(&mut self, candidate: IceCandidate) {
        self.local_candidates.push(candidate);
        self.touch();
    }

    /// Record a candidate received from the peer
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        self.remote_candidates.push(candidate);
        self.touch();
    }

    /// Time since the session was created
    pub fn age(&self) -> std::time::Duration {
        since(self.created_at)
    }

    /// Time since anything was last exchanged
    pub fn idle(&self) -> std::time::Duration {
        since(self.last_activity)
    }
}

fn since(at: DateTime<Utc>) -> std::time::Duration {
    Utc::now()
        .signed_duration_since(at)
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}
