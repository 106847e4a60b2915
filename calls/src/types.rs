//! Type definitions for call negotiation payloads

use crate::error::{CallError, CallResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Deterministic, order-independent session key for two participants
///
/// `conversation_id("bob", "alice") == conversation_id("alice", "bob") == "alice_bob"`
pub fn conversation_id(user_a: &str, user_b: &str) -> String {
    let mut ids = [user_a, user_b];
    ids.sort_unstable();
    ids.join("_")
}

/// Side of the call this orchestrator plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Creates the offer
    Caller,
    /// Answers the offer
    Callee,
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initial proposal from the caller
    Offer,
    /// Response from the callee
    Answer,
}

/// Session description as published on the `sdp` path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,

    /// Raw SDP text
    pub description: String,
}

impl SessionDescription {
    /// Offer with the given SDP text
    pub fn offer(description: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            description: description.into(),
        }
    }

    /// Answer with the given SDP text
    pub fn answer(description: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            description: description.into(),
        }
    }

    /// Decode a value read from the store
    pub fn from_value(value: &Value) -> CallResult<Self> {
        let sdp = Self::deserialize(value)
            .map_err(|e| CallError::Negotiation(format!("malformed session description: {}", e)))?;
        if sdp.description.is_empty() {
            return Err(CallError::Negotiation(
                "session description has an empty body".to_string(),
            ));
        }
        Ok(sdp)
    }

    /// Encode for publication
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "type": self.kind,
            "description": self.description,
        })
    }
}

/// ICE candidate as exchanged through the `iceCandidates` push-list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Media stream identification tag
    pub sdp_mid: String,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", deserialize_with = "narrow_mline_index")]
    pub sdp_mline_index: u16,

    /// Candidate line
    pub sdp: String,

    /// User id of the side that gathered the candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl IceCandidate {
    /// Candidate without sender attribution
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, sdp: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            sdp: sdp.into(),
            sender_id: None,
        }
    }

    /// Same candidate attributed to `sender`
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender_id = Some(sender.into());
        self
    }

    /// Decode one push-list entry
    pub fn from_value(value: &Value) -> CallResult<Self> {
        let candidate = Self::deserialize(value)
            .map_err(|e| CallError::Negotiation(format!("malformed ICE candidate: {}", e)))?;
        if candidate.sdp.is_empty() {
            return Err(CallError::Negotiation("ICE candidate has an empty line".to_string()));
        }
        Ok(candidate)
    }

    /// Encode for publication
    pub fn to_value(&self) -> Value {
        // Field names are fixed strings; serialization cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Stores hand back integers in their widest native type (and some in
/// floating point), so accept any in-range integral number.
fn narrow_mline_index<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let number = serde_json::Number::deserialize(deserializer)?;
    let wide: i64 = if let Some(v) = number.as_i64() {
        v
    } else if let Some(v) = number.as_u64() {
        return u16::try_from(v)
            .map_err(|_| D::Error::custom(format!("sdpMLineIndex {} out of range", v)));
    } else {
        let v = number.as_f64().unwrap_or(f64::NAN);
        if v.fract() != 0.0 || !v.is_finite() {
            return Err(D::Error::custom(format!("sdpMLineIndex {} is not an integer", v)));
        }
        v as i64
    };
    u16::try_from(wide).map_err(|_| D::Error::custom(format!("sdpMLineIndex {} out of range", wide)))
}

/// Native ICE connection state, as reported by the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    /// Gathering not started
    New,
    /// Checking candidate pairs
    Checking,
    /// A working pair was found
    Connected,
    /// Connectivity lost
    Disconnected,
    /// No working pair
    Failed,
    /// Connection shut down locally
    Closed,
}

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone / remote audio
    Audio,
    /// Camera / remote video
    Video,
}

/// Snapshot reference to a media track, safe to hand to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackHandle {
    /// Track id
    pub id: String,
    /// Media stream the track belongs to
    pub stream_id: String,
    /// Audio or video
    pub kind: TrackKind,
}
