//! CallRTC Calls Crate
//!
//! Call-establishment engine for one-to-one audio/video calls. Two
//! participants negotiate a WebRTC session (offer/answer SDP plus trickled
//! ICE candidates) through a shared signaling store, see
//! [`callrtc_signaling`].
//!
//! # Architecture
//!
//! - [`CallOrchestrator`]: per-call handle; all work runs on one worker task
//!   fed by a FIFO command queue
//! - [`CallStateMachine`]: `PENDING → CONNECTING → CONNECTED`, with
//!   absorbing `ENDED` / `ERROR`
//! - [`PeerConnectionManager`]: wraps the native peer connection and buffers
//!   remote ICE candidates until the remote description is applied
//! - [`RtcPeerBackend`]: the webrtc-rs implementation of [`PeerBackend`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use callrtc_calls::{
//!     conversation_id, CallConfig, CallContext, CallOrchestrator, CallStatus,
//!     RtcBackendFactory, SampleTrackSource,
//! };
//! use callrtc_signaling::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new("sessions"));
//!     let peers = Arc::new(RtcBackendFactory::new(Arc::new(SampleTrackSource::new(true))));
//!     let context = CallContext::new("alice", CallConfig::default(), store, peers);
//!
//!     let call = CallOrchestrator::new(context).unwrap();
//!     let conversation = conversation_id("alice", "bob");
//!     call.start_call(&conversation, "bob").unwrap();
//!
//!     let connected = call
//!         .wait_for(|s| s.status == CallStatus::Connected, Duration::from_secs(30))
//!         .await;
//!     println!("connected: {}", connected.is_some());
//!     call.cleanup().await;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod config;
mod context;
mod error;
mod orchestrator;
mod outbox;
mod peer_connection;
mod rtc;
mod session;
mod state;
mod types;

// Re-exports
pub use config::{CallConfig, IceTransportPolicy, TurnServer};
pub use context::CallContext;
pub use error::{CallError, CallResult, ErrorKind};
pub use orchestrator::{CallOrchestrator, CallSnapshot};
pub use outbox::{OnWritten, Outbox, WriteCompletion, WriteKind, WriteOp};
pub use peer_connection::{
    CandidateDisposition, PeerBackend, PeerBackendFactory, PeerConnectionManager, PeerEvent,
    PeerEventSink,
};
pub use rtc::{LocalMedia, MediaSource, RtcBackendFactory, RtcPeerBackend, SampleTrackSource};
pub use session::CallSession;
pub use state::{CallStateMachine, CallStatus, TransitionOutcome};
pub use types::{
    conversation_id, CallRole, IceCandidate, IceConnectionState, SdpType, SessionDescription,
    TrackHandle, TrackKind,
};
