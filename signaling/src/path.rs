//! Path layout of a call session node

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sub-paths under a call session node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallPath {
    /// Current session description (offer or answer)
    #[serde(rename = "sdp")]
    Sdp,

    /// Append-only list of ICE candidates from both sides
    #[serde(rename = "iceCandidates")]
    IceCandidates,

    /// Shared call status
    #[serde(rename = "status")]
    Status,

    /// Human-readable error, present only while status is ERROR
    #[serde(rename = "error")]
    Error,

    /// User id of the caller
    #[serde(rename = "callerId")]
    CallerId,
}

impl CallPath {
    /// Every sub-path of a session node
    pub const ALL: [CallPath; 5] = [
        CallPath::Sdp,
        CallPath::IceCandidates,
        CallPath::Status,
        CallPath::Error,
        CallPath::CallerId,
    ];

    /// Path segment as stored
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sdp => "sdp",
            Self::IceCandidates => "iceCandidates",
            Self::Status => "status",
            Self::Error => "error",
            Self::CallerId => "callerId",
        }
    }
}

impl fmt::Display for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one call session node in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionPath {
    root: String,
    conversation_id: String,
}

impl SessionPath {
    /// Create a session path under `root` for `conversation_id`
    pub fn new(root: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            root: root.into().trim_matches('/').to_string(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Conversation this node belongs to
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Rendered node path, e.g. `/sessions/A_B/calls`
    pub fn node(&self) -> String {
        format!("/{}/{}/calls", self.root, self.conversation_id)
    }

    /// Rendered sub-path, e.g. `/sessions/A_B/calls/sdp`
    pub fn child(&self, path: CallPath) -> String {
        format!("{}/{}", self.node(), path.as_str())
    }
}
